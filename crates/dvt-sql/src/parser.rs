use std::collections::VecDeque;

use dvt_error::{DvError, DvResult, ErrorCode, SourceLocation, err};
use itertools::Itertools as _;

use crate::ast::*;
use crate::lexer::{Comment, Keyword, Token, TokenKind, tokenize};

/// How many consumed tokens the parser remembers for error context.
const RECENT_TOKEN_RING: usize = 8;

/// A parsed script: statements plus the comments the lexer set aside.
#[derive(Debug, Clone)]
pub struct ParsedScript {
    pub statements: Vec<Statement>,
    pub comments: Vec<Comment>,
}

/// A parsed single-SELECT query, the transpiler's input.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub select: SelectStatement,
    pub comments: Vec<Comment>,
}

pub fn parse(source: &str) -> DvResult<ParsedScript> {
    let lexed = tokenize(source)?;
    let mut parser = Parser::new(source, lexed.tokens);
    let statements = parser.parse_script()?;
    Ok(ParsedScript { statements, comments: lexed.comments })
}

/// Parses a source expected to contain exactly one SELECT (or UNION of
/// SELECTs is rejected here: the query path serves the transpiler).
pub fn parse_query(source: &str) -> DvResult<ParsedQuery> {
    let script = parse(source)?;
    match script.statements.as_slice() {
        [Statement::Select(select)] => Ok(ParsedQuery {
            select: select.clone(),
            comments: script.comments,
        }),
        [] => err!(ErrorCode::SqlSyntaxError, "empty query"),
        _ => err!(
            ErrorCode::SqlUnsupported,
            "expected a single SELECT statement"
        ),
    }
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    pos: usize,
    recent: VecDeque<Token>,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str, tokens: Vec<Token>) -> Self {
        Parser { source, tokens, pos: 0, recent: VecDeque::new() }
    }

    // ------------------------------------------------------------------
    // token plumbing

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        if self.recent.len() == RECENT_TOKEN_RING {
            self.recent.pop_front();
        }
        self.recent.push_back(token.clone());
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.peek().is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> DvResult<Token> {
        if self.peek().is_keyword(keyword) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}", format!("{keyword:?}").to_uppercase())))
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> DvResult<Token> {
        if &self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> DvResult<Token> {
        self.expect(&TokenKind::Ident, what)
    }

    /// Error at the current token, with a recent-token ring for context.
    fn error(&self, message: impl Into<String>) -> Box<DvError> {
        let token = self.peek();
        let location = SourceLocation::of_offset(self.source, token.offset);
        let found = match token.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("'{}'", token.text),
        };
        let context = self.recent.iter().map(|t| t.text.as_str()).join(" ");
        let message = if context.is_empty() {
            format!("{}, found {found}", message.into())
        } else {
            format!("{}, found {found} (after \"{context}\")", message.into())
        };
        dvt_error::dv_err!(code => ErrorCode::SqlUnexpectedToken, loc => location, "{message}")
    }

    // ------------------------------------------------------------------
    // statements

    fn parse_script(&mut self) -> DvResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.at_eof() {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> DvResult<Statement> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Keyword(Keyword::Select) => self.parse_select_chain(),
            TokenKind::Keyword(Keyword::Declare) => self.parse_declare(),
            TokenKind::Keyword(Keyword::Set) => self.parse_set(),
            TokenKind::Keyword(Keyword::Begin) => self.parse_begin(),
            _ => Err(self.error("expected a statement (SELECT, DECLARE, SET or BEGIN)")),
        }
    }

    fn parse_declare(&mut self) -> DvResult<Statement> {
        let offset = self.expect_keyword(Keyword::Declare)?.offset;
        let name = self.expect(&TokenKind::Variable, "variable name after DECLARE")?.text;
        let data_type = self.parse_data_type()?;
        let value = if self.eat(&TokenKind::Eq) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Statement::Declare(DeclareVar { name, data_type, value, offset }))
    }

    fn parse_set(&mut self) -> DvResult<Statement> {
        let offset = self.expect_keyword(Keyword::Set)?.offset;
        let name = self.expect(&TokenKind::Variable, "variable name after SET")?.text;
        self.expect(&TokenKind::Eq, "'=' after variable name")?;
        let value = self.parse_expr()?;
        Ok(Statement::Set(SetVar { name, value, offset }))
    }

    fn parse_begin(&mut self) -> DvResult<Statement> {
        let offset = self.expect_keyword(Keyword::Begin)?.offset;
        if self.eat_keyword(Keyword::Try) {
            let try_block = self.parse_statements_until(Keyword::End)?;
            self.expect_keyword(Keyword::End)?;
            self.expect_keyword(Keyword::Try)?;
            self.expect_keyword(Keyword::Begin)?;
            self.expect_keyword(Keyword::Catch)?;
            let catch_block = self.parse_statements_until(Keyword::End)?;
            self.expect_keyword(Keyword::End)?;
            self.expect_keyword(Keyword::Catch)?;
            Ok(Statement::TryCatch { try_block, catch_block, offset })
        } else {
            let body = self.parse_statements_until(Keyword::End)?;
            self.expect_keyword(Keyword::End)?;
            Ok(Statement::Block(body))
        }
    }

    fn parse_statements_until(&mut self, end: Keyword) -> DvResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.at_eof() && !self.peek().is_keyword(end) {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_select_chain(&mut self) -> DvResult<Statement> {
        let first = self.parse_select()?;
        if !self.peek().is_keyword(Keyword::Union) {
            return Ok(Statement::Select(first));
        }
        let offset = first.offset;
        let mut selects = vec![first];
        let mut all = false;
        while self.eat_keyword(Keyword::Union) {
            all |= self.eat_keyword(Keyword::All);
            selects.push(self.parse_select()?);
        }
        Ok(Statement::Union(UnionStatement { selects, all, offset }))
    }

    fn parse_select(&mut self) -> DvResult<SelectStatement> {
        let offset = self.expect_keyword(Keyword::Select)?.offset;
        let distinct = self.eat_keyword(Keyword::Distinct);
        let top = if self.eat_keyword(Keyword::Top) {
            let token = self.expect(&TokenKind::Number, "row count after TOP")?;
            let count = token.text.parse::<u64>().map_err(|_| {
                dvt_error::dv_err!(
                    code => ErrorCode::SqlInvalidLiteral,
                    loc => SourceLocation::of_offset(self.source, token.offset),
                    "TOP expects an integer, got '{}'",
                    token.text
                )
            })?;
            Some(count)
        } else {
            None
        };

        let mut columns = vec![self.parse_select_column()?];
        while self.eat(&TokenKind::Comma) {
            columns.push(self.parse_select_column()?);
        }

        self.expect_keyword(Keyword::From)?;
        let from = self.parse_table_ref()?;

        let mut joins = Vec::new();
        while let Some(kind) = self.peek_join_kind() {
            joins.push(self.parse_join(kind)?);
        }

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By)?;
            group_by.push(self.parse_expr()?);
            while self.eat(&TokenKind::Comma) {
                group_by.push(self.parse_expr()?);
            }
        }

        let having = if self.eat_keyword(Keyword::Having) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.eat_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let expr = self.parse_expr()?;
                let descending = if self.eat_keyword(Keyword::Desc) {
                    true
                } else {
                    self.eat_keyword(Keyword::Asc);
                    false
                };
                order_by.push(OrderBy { expr, descending });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        Ok(SelectStatement {
            distinct,
            top,
            columns,
            from,
            joins,
            where_clause,
            group_by,
            having,
            order_by,
            offset,
        })
    }

    fn parse_select_column(&mut self) -> DvResult<SelectColumn> {
        let token = self.peek().clone();
        if token.kind == TokenKind::Star {
            self.advance();
            return Ok(SelectColumn::Star { table: None, offset: token.offset });
        }
        // `alias.*`
        if token.kind == TokenKind::Ident
            && self.peek_at(1).kind == TokenKind::Dot
            && self.peek_at(2).kind == TokenKind::Star
        {
            self.advance();
            self.advance();
            self.advance();
            return Ok(SelectColumn::Star { table: Some(token.text), offset: token.offset });
        }

        let expr = self.parse_expr()?;
        let alias = self.parse_alias()?;
        Ok(SelectColumn::Expr { expr, alias })
    }

    /// `[AS] identifier`, where a bare identifier also counts.
    fn parse_alias(&mut self) -> DvResult<Option<String>> {
        if self.eat_keyword(Keyword::As) {
            return Ok(Some(self.expect_ident("alias after AS")?.text));
        }
        if self.peek().kind == TokenKind::Ident {
            return Ok(Some(self.advance().text));
        }
        Ok(None)
    }

    fn parse_table_ref(&mut self) -> DvResult<TableRef> {
        let token = self.expect_ident("table name")?;
        let alias = self.parse_alias()?;
        Ok(TableRef { name: token.text, alias, offset: token.offset })
    }

    fn peek_join_kind(&self) -> Option<JoinKind> {
        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Join) | TokenKind::Keyword(Keyword::Inner) => {
                Some(JoinKind::Inner)
            }
            TokenKind::Keyword(Keyword::Left) => Some(JoinKind::LeftOuter),
            TokenKind::Keyword(Keyword::Right) => Some(JoinKind::RightOuter),
            _ => None,
        }
    }

    fn parse_join(&mut self, kind: JoinKind) -> DvResult<Join> {
        let offset = self.peek().offset;
        match kind {
            JoinKind::Inner => {
                self.eat_keyword(Keyword::Inner);
            }
            JoinKind::LeftOuter => {
                self.eat_keyword(Keyword::Left);
                self.eat_keyword(Keyword::Outer);
            }
            JoinKind::RightOuter => {
                self.eat_keyword(Keyword::Right);
                self.eat_keyword(Keyword::Outer);
            }
        }
        self.expect_keyword(Keyword::Join)?;
        let table = self.parse_table_ref()?;
        self.expect_keyword(Keyword::On)?;
        let on = self.parse_expr()?;
        Ok(Join { kind, table, on, offset })
    }

    fn parse_data_type(&mut self) -> DvResult<String> {
        let name = self.expect_ident("data type")?.text;
        let mut data_type = name.to_ascii_lowercase();
        if self.eat(&TokenKind::LParen) {
            let mut args = Vec::new();
            loop {
                let token = self.advance();
                match token.kind {
                    TokenKind::Number => args.push(token.text),
                    TokenKind::Ident => args.push(token.text.to_ascii_lowercase()),
                    _ => return Err(self.error("expected a type argument")),
                }
                if self.eat(&TokenKind::RParen) {
                    break;
                }
                self.expect(&TokenKind::Comma, "',' or ')' in type arguments")?;
            }
            data_type.push_str(&format!("({})", args.join(",")));
        }
        Ok(data_type)
    }

    // ------------------------------------------------------------------
    // expressions
    //
    // Precedence, lowest to highest:
    // OR, AND, NOT, comparison, additive, multiplicative, unary

    fn parse_expr(&mut self) -> DvResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> DvResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek().is_keyword(Keyword::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            let offset = lhs.offset;
            lhs = Expr::new(
                ExprKind::Binary { left: Box::new(lhs), op: BinaryOp::Or, right: Box::new(rhs) },
                offset,
            );
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> DvResult<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek().is_keyword(Keyword::And) {
            self.advance();
            let rhs = self.parse_not()?;
            let offset = lhs.offset;
            lhs = Expr::new(
                ExprKind::Binary { left: Box::new(lhs), op: BinaryOp::And, right: Box::new(rhs) },
                offset,
            );
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> DvResult<Expr> {
        if self.peek().is_keyword(Keyword::Not) {
            let offset = self.advance().offset;
            let expr = self.parse_not()?;
            return Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Not, expr: Box::new(expr) }, offset));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> DvResult<Expr> {
        let lhs = self.parse_additive()?;
        let offset = lhs.offset;

        let op = match &self.peek().kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Neq => Some(BinaryOp::Neq),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Lte => Some(BinaryOp::Lte),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Gte => Some(BinaryOp::Gte),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_additive()?;
            return Ok(Expr::new(
                ExprKind::Binary { left: Box::new(lhs), op, right: Box::new(rhs) },
                offset,
            ));
        }

        // [NOT] LIKE / IN / BETWEEN, IS [NOT] NULL
        let negated = if self.peek().is_keyword(Keyword::Not)
            && matches!(
                self.peek_at(1).kind,
                TokenKind::Keyword(Keyword::Like)
                    | TokenKind::Keyword(Keyword::In)
                    | TokenKind::Keyword(Keyword::Between)
            ) {
            self.advance();
            true
        } else {
            false
        };

        if self.eat_keyword(Keyword::Like) {
            let pattern = self.parse_additive()?;
            return Ok(Expr::new(
                ExprKind::Like { expr: Box::new(lhs), pattern: Box::new(pattern), negated },
                offset,
            ));
        }
        if self.eat_keyword(Keyword::In) {
            self.expect(&TokenKind::LParen, "'(' after IN")?;
            let mut list = vec![self.parse_expr()?];
            while self.eat(&TokenKind::Comma) {
                list.push(self.parse_expr()?);
            }
            self.expect(&TokenKind::RParen, "')' closing the IN list")?;
            return Ok(Expr::new(ExprKind::In { expr: Box::new(lhs), list, negated }, offset));
        }
        if self.eat_keyword(Keyword::Between) {
            let low = self.parse_additive()?;
            self.expect_keyword(Keyword::And)?;
            let high = self.parse_additive()?;
            return Ok(Expr::new(
                ExprKind::Between {
                    expr: Box::new(lhs),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                },
                offset,
            ));
        }
        if negated {
            return Err(self.error("expected LIKE, IN or BETWEEN after NOT"));
        }
        if self.eat_keyword(Keyword::Is) {
            let negated = self.eat_keyword(Keyword::Not);
            self.expect_keyword(Keyword::Null)?;
            return Ok(Expr::new(ExprKind::IsNull { expr: Box::new(lhs), negated }, offset));
        }

        Ok(lhs)
    }

    fn parse_additive(&mut self) -> DvResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            let offset = lhs.offset;
            lhs = Expr::new(
                ExprKind::Binary { left: Box::new(lhs), op, right: Box::new(rhs) },
                offset,
            );
        }
    }

    fn parse_multiplicative(&mut self) -> DvResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            let offset = lhs.offset;
            lhs = Expr::new(
                ExprKind::Binary { left: Box::new(lhs), op, right: Box::new(rhs) },
                offset,
            );
        }
    }

    fn parse_unary(&mut self) -> DvResult<Expr> {
        if self.peek().kind == TokenKind::Minus {
            let offset = self.advance().offset;
            let expr = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Neg, expr: Box::new(expr) }, offset));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> DvResult<Expr> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Number => {
                self.advance();
                let literal = if token.text.contains('.') {
                    token.text.parse::<f64>().map(Literal::Float).map_err(|_| ())
                } else {
                    token.text.parse::<i64>().map(Literal::Int).map_err(|_| ())
                }
                .map_err(|_| {
                    dvt_error::dv_err!(
                        code => ErrorCode::SqlInvalidLiteral,
                        loc => SourceLocation::of_offset(self.source, token.offset),
                        "invalid numeric literal '{}'",
                        token.text
                    )
                })?;
                Ok(Expr::new(ExprKind::Literal(literal), token.offset))
            }
            TokenKind::String => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Literal::String(token.text)), token.offset))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Literal::Null), token.offset))
            }
            TokenKind::Variable => {
                self.advance();
                Ok(Expr::new(ExprKind::Variable(token.text), token.offset))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Keyword(Keyword::Case) => self.parse_case(),
            TokenKind::Keyword(Keyword::Cast) => self.parse_cast(),
            TokenKind::Ident => {
                self.advance();
                if self.peek().kind == TokenKind::LParen {
                    return self.parse_function_call(token);
                }
                if self.eat(&TokenKind::Dot) {
                    let column = self.expect_ident("column name after '.'")?;
                    return Ok(Expr::new(
                        ExprKind::Column(ColumnRef {
                            table: Some(token.text),
                            name: column.text,
                        }),
                        token.offset,
                    ));
                }
                Ok(Expr::new(
                    ExprKind::Column(ColumnRef { table: None, name: token.text }),
                    token.offset,
                ))
            }
            _ => Err(self.error("expected an expression")),
        }
    }

    fn parse_function_call(&mut self, name: Token) -> DvResult<Expr> {
        self.expect(&TokenKind::LParen, "'('")?;
        let lowered = name.text.to_ascii_lowercase();
        let mut distinct = false;
        let mut args = Vec::new();

        if self.eat(&TokenKind::RParen) {
            return Ok(Expr::new(
                ExprKind::Function { name: lowered, args, distinct },
                name.offset,
            ));
        }
        if self.peek().kind == TokenKind::Star {
            let star = self.advance();
            self.expect(&TokenKind::RParen, "')' after '*'")?;
            args.push(Expr::new(ExprKind::Star, star.offset));
            return Ok(Expr::new(
                ExprKind::Function { name: lowered, args, distinct },
                name.offset,
            ));
        }
        if is_aggregate_name(&lowered) && self.eat_keyword(Keyword::Distinct) {
            distinct = true;
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&TokenKind::RParen) {
                break;
            }
            self.expect(&TokenKind::Comma, "',' or ')' in argument list")?;
        }
        Ok(Expr::new(ExprKind::Function { name: lowered, args, distinct }, name.offset))
    }

    fn parse_case(&mut self) -> DvResult<Expr> {
        let offset = self.expect_keyword(Keyword::Case)?.offset;
        let operand = if self.peek().is_keyword(Keyword::When) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let mut branches = Vec::new();
        while self.eat_keyword(Keyword::When) {
            let when = self.parse_expr()?;
            self.expect_keyword(Keyword::Then)?;
            let then = self.parse_expr()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.error("CASE requires at least one WHEN branch"));
        }
        let else_branch = if self.eat_keyword(Keyword::Else) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_keyword(Keyword::End)?;
        Ok(Expr::new(ExprKind::Case { operand, branches, else_branch }, offset))
    }

    fn parse_cast(&mut self) -> DvResult<Expr> {
        let offset = self.expect_keyword(Keyword::Cast)?.offset;
        self.expect(&TokenKind::LParen, "'(' after CAST")?;
        let expr = self.parse_expr()?;
        self.expect_keyword(Keyword::As)?;
        let data_type = self.parse_data_type()?;
        self.expect(&TokenKind::RParen, "')' closing CAST")?;
        Ok(Expr::new(ExprKind::Cast { expr: Box::new(expr), data_type }, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_one(source: &str) -> Statement {
        let mut script = parse(source).unwrap();
        assert_eq!(script.statements.len(), 1);
        script.statements.remove(0)
    }

    fn select(source: &str) -> SelectStatement {
        match parse_one(source) {
            Statement::Select(select) => select,
            other => panic!("expected SELECT, got {other:?}"),
        }
    }

    fn column(table: Option<&str>, name: &str, offset: usize) -> Expr {
        Expr::new(
            ExprKind::Column(ColumnRef {
                table: table.map(|t| t.to_string()),
                name: name.to_string(),
            }),
            offset,
        )
    }

    #[test]
    fn test_simple_select() {
        let stmt = select("SELECT name, accountnumber FROM account");
        assert_eq!(stmt.columns.len(), 2);
        assert_eq!(stmt.from.name, "account");
        assert_eq!(stmt.from.alias, None);
        assert!(!stmt.distinct);
        assert_eq!(stmt.top, None);
    }

    #[test]
    fn test_distinct_top_and_aliases() {
        let stmt = select("SELECT DISTINCT TOP 10 name AS n, revenue r FROM account a");
        assert!(stmt.distinct);
        assert_eq!(stmt.top, Some(10));
        let SelectColumn::Expr { alias, .. } = &stmt.columns[0] else { panic!() };
        assert_eq!(alias.as_deref(), Some("n"));
        let SelectColumn::Expr { alias, .. } = &stmt.columns[1] else { panic!() };
        assert_eq!(alias.as_deref(), Some("r"));
        assert_eq!(stmt.from.binding(), "a");
    }

    #[test]
    fn test_star_columns() {
        let stmt = select("SELECT *, a.* FROM account a");
        assert!(matches!(stmt.columns[0], SelectColumn::Star { table: None, .. }));
        assert!(
            matches!(&stmt.columns[1], SelectColumn::Star { table: Some(t), .. } if t == "a")
        );
    }

    #[test]
    fn test_join_kinds() {
        let stmt = select(
            "SELECT a.name FROM account a \
             INNER JOIN contact b ON b.parentcustomerid = a.accountid \
             LEFT OUTER JOIN lead l ON l.accountid = a.accountid \
             RIGHT JOIN campaign c ON c.campaignid = l.campaignid \
             JOIN incident i ON i.customerid = a.accountid",
        );
        let kinds: Vec<JoinKind> = stmt.joins.iter().map(|j| j.kind).collect();
        assert_eq!(
            kinds,
            vec![JoinKind::Inner, JoinKind::LeftOuter, JoinKind::RightOuter, JoinKind::Inner]
        );
        assert_eq!(stmt.joins[0].table.binding(), "b");
    }

    #[test]
    fn test_logical_precedence() {
        // OR binds loosest: a = 1 OR (b = 2 AND c = 3)
        let stmt = select("SELECT x FROM t WHERE a = 1 OR b = 2 AND c = 3");
        let ExprKind::Binary { op: BinaryOp::Or, right, .. } =
            stmt.where_clause.unwrap().kind
        else {
            panic!("expected OR at the top");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_not_precedence() {
        // NOT a = 1 AND b = 2 parses as (NOT (a = 1)) AND (b = 2)
        let stmt = select("SELECT x FROM t WHERE NOT a = 1 AND b = 2");
        let ExprKind::Binary { op: BinaryOp::And, left, .. } = stmt.where_clause.unwrap().kind
        else {
            panic!("expected AND at the top");
        };
        assert!(matches!(left.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_arithmetic_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let stmt = select("SELECT 1 + 2 * 3 FROM t");
        let SelectColumn::Expr { expr, .. } = &stmt.columns[0] else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Add, right, .. } = &expr.kind else {
            panic!("expected + at the top");
        };
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_unary_minus() {
        let stmt = select("SELECT x FROM t WHERE balance < -5");
        let ExprKind::Binary { right, .. } = stmt.where_clause.unwrap().kind else { panic!() };
        assert!(matches!(right.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn test_like_in_null_between() {
        let stmt = select(
            "SELECT x FROM t WHERE a LIKE '%x%' AND b NOT IN (1, 2) \
             AND c IS NOT NULL AND d BETWEEN 1 AND 10",
        );
        let mut conditions = Vec::new();
        fn flatten_and(expr: Expr, out: &mut Vec<Expr>) {
            match expr.kind {
                ExprKind::Binary { op: BinaryOp::And, left, right } => {
                    flatten_and(*left, out);
                    flatten_and(*right, out);
                }
                _ => out.push(expr),
            }
        }
        flatten_and(stmt.where_clause.unwrap(), &mut conditions);
        assert_eq!(conditions.len(), 4);
        assert!(matches!(&conditions[0].kind, ExprKind::Like { negated: false, .. }));
        assert!(
            matches!(&conditions[1].kind, ExprKind::In { negated: true, list, .. } if list.len() == 2)
        );
        assert!(matches!(&conditions[2].kind, ExprKind::IsNull { negated: true, .. }));
        assert!(matches!(&conditions[3].kind, ExprKind::Between { negated: false, .. }));
    }

    #[test]
    fn test_aggregates() {
        let stmt = select("SELECT COUNT(*), COUNT(DISTINCT name), SUM(revenue) FROM account");
        let SelectColumn::Expr { expr, .. } = &stmt.columns[0] else { panic!() };
        let ExprKind::Function { name, args, distinct } = &expr.kind else { panic!() };
        assert_eq!(name, "count");
        assert!(matches!(args[0].kind, ExprKind::Star));
        assert!(!distinct);

        let SelectColumn::Expr { expr, .. } = &stmt.columns[1] else { panic!() };
        let ExprKind::Function { name, distinct, .. } = &expr.kind else { panic!() };
        assert_eq!(name, "count");
        assert!(*distinct);

        let SelectColumn::Expr { expr, .. } = &stmt.columns[2] else { panic!() };
        assert!(expr.is_aggregate());
    }

    #[test]
    fn test_case_and_iif_and_cast() {
        let stmt = select(
            "SELECT CASE WHEN statecode = 0 THEN 'active' ELSE 'inactive' END, \
             IIF(revenue > 1000, 'big', 'small'), CAST(revenue AS nvarchar(20)) FROM account",
        );
        let SelectColumn::Expr { expr, .. } = &stmt.columns[0] else { panic!() };
        let ExprKind::Case { operand, branches, else_branch } = &expr.kind else { panic!() };
        assert!(operand.is_none());
        assert_eq!(branches.len(), 1);
        assert!(else_branch.is_some());

        let SelectColumn::Expr { expr, .. } = &stmt.columns[1] else { panic!() };
        let ExprKind::Function { name, args, .. } = &expr.kind else { panic!() };
        assert_eq!(name, "iif");
        assert_eq!(args.len(), 3);

        let SelectColumn::Expr { expr, .. } = &stmt.columns[2] else { panic!() };
        let ExprKind::Cast { data_type, .. } = &expr.kind else { panic!() };
        assert_eq!(data_type, "nvarchar(20)");
    }

    #[test]
    fn test_group_having_order() {
        let stmt = select(
            "SELECT name, COUNT(*) c FROM account GROUP BY name \
             HAVING COUNT(*) > 1 ORDER BY c DESC, name",
        );
        assert_eq!(stmt.group_by.len(), 1);
        assert!(stmt.having.is_some());
        assert_eq!(stmt.order_by.len(), 2);
        assert!(stmt.order_by[0].descending);
        assert!(!stmt.order_by[1].descending);
    }

    #[test]
    fn test_union_all() {
        let stmt = parse_one("SELECT name FROM account UNION ALL SELECT fullname FROM contact");
        let Statement::Union(union) = stmt else { panic!("expected UNION") };
        assert_eq!(union.selects.len(), 2);
        assert!(union.all);
    }

    #[test]
    fn test_declare_and_set() {
        let script = parse(
            "DECLARE @state INT = 0; DECLARE @name NVARCHAR(50); SET @state = @state + 1",
        )
        .unwrap();
        assert_eq!(script.statements.len(), 3);
        let Statement::Declare(declare) = &script.statements[0] else { panic!() };
        assert_eq!(declare.name, "state");
        assert_eq!(declare.data_type, "int");
        assert!(declare.value.is_some());
        let Statement::Declare(declare) = &script.statements[1] else { panic!() };
        assert_eq!(declare.data_type, "nvarchar(50)");
        let Statement::Set(set) = &script.statements[2] else { panic!() };
        assert_eq!(set.name, "state");
    }

    #[test]
    fn test_begin_blocks_and_try_catch() {
        let stmt = parse_one(
            "BEGIN TRY SELECT name FROM account END TRY BEGIN CATCH SELECT 1 FROM dual END CATCH",
        );
        let Statement::TryCatch { try_block, catch_block, .. } = stmt else { panic!() };
        assert_eq!(try_block.len(), 1);
        assert_eq!(catch_block.len(), 1);

        let stmt = parse_one("BEGIN SELECT 1 FROM t; SELECT 2 FROM t END");
        let Statement::Block(body) = stmt else { panic!() };
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_error_carries_position_and_context() {
        let err = parse("SELECT name\nFROM").unwrap_err();
        assert_eq!(err.code, ErrorCode::SqlUnexpectedToken);
        let location = err.location.unwrap();
        assert_eq!(location.line, 2);
        assert_eq!(location.col, 5);
        let message = err.to_string();
        assert!(message.contains("expected table name"), "{message}");
        assert!(message.contains("found end of input"), "{message}");
        assert!(message.contains("after \"SELECT name FROM\""), "{message}");
    }

    #[test]
    fn test_top_requires_integer() {
        let err = parse("SELECT TOP 2.5 name FROM account").unwrap_err();
        assert_eq!(err.code, ErrorCode::SqlInvalidLiteral);
    }

    #[test]
    fn test_parse_query_accepts_only_single_select() {
        assert!(parse_query("SELECT name FROM account").is_ok());
        let err = parse_query("DECLARE @x INT").unwrap_err();
        assert_eq!(err.code, ErrorCode::SqlUnsupported);
        assert!(parse_query("").unwrap_err().to_string().contains("empty query"));
    }

    #[test]
    fn test_comments_survive_parsing() {
        let script = parse("-- top note\nSELECT name FROM account /* trailing */").unwrap();
        assert_eq!(script.comments.len(), 2);
        assert_eq!(script.comments[0].text, "top note");
    }

    #[test]
    fn test_qualified_columns() {
        let stmt = select("SELECT a.name FROM account a WHERE a.statecode = 0");
        let SelectColumn::Expr { expr, .. } = &stmt.columns[0] else { panic!() };
        assert_eq!(expr, &column(Some("a"), "name", 7));
    }
}
