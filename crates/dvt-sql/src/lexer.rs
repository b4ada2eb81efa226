use std::iter::Peekable;
use std::str::CharIndices;

use dvt_error::{DvResult, ErrorCode, SourceLocation, err};

/// SQL keywords the parser cares about. Matching is case-insensitive;
/// anything else lexes as an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select, Distinct, Top, From, As, Inner, Left, Right, Outer, Join, On,
    Where, Group, By, Having, Order, Asc, Desc, Union, All,
    And, Or, Not, Like, In, Is, Null, Between,
    Case, When, Then, Else, End, Cast, Declare, Set, Begin, Try, Catch,
}

impl Keyword {
    fn parse(word: &str) -> Option<Keyword> {
        let upper = word.to_ascii_uppercase();
        let keyword = match upper.as_str() {
            "SELECT" => Keyword::Select,
            "DISTINCT" => Keyword::Distinct,
            "TOP" => Keyword::Top,
            "FROM" => Keyword::From,
            "AS" => Keyword::As,
            "INNER" => Keyword::Inner,
            "LEFT" => Keyword::Left,
            "RIGHT" => Keyword::Right,
            "OUTER" => Keyword::Outer,
            "JOIN" => Keyword::Join,
            "ON" => Keyword::On,
            "WHERE" => Keyword::Where,
            "GROUP" => Keyword::Group,
            "BY" => Keyword::By,
            "HAVING" => Keyword::Having,
            "ORDER" => Keyword::Order,
            "ASC" => Keyword::Asc,
            "DESC" => Keyword::Desc,
            "UNION" => Keyword::Union,
            "ALL" => Keyword::All,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "NOT" => Keyword::Not,
            "LIKE" => Keyword::Like,
            "IN" => Keyword::In,
            "IS" => Keyword::Is,
            "NULL" => Keyword::Null,
            "BETWEEN" => Keyword::Between,
            "CASE" => Keyword::Case,
            "WHEN" => Keyword::When,
            "THEN" => Keyword::Then,
            "ELSE" => Keyword::Else,
            "END" => Keyword::End,
            "CAST" => Keyword::Cast,
            "DECLARE" => Keyword::Declare,
            "SET" => Keyword::Set,
            "BEGIN" => Keyword::Begin,
            "TRY" => Keyword::Try,
            "CATCH" => Keyword::Catch,
            _ => return None,
        };
        Some(keyword)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Keyword(Keyword),
    /// Identifier; `text` holds the unquoted form for `[x]` and `"x"`.
    Ident,
    /// Integer or decimal literal.
    Number,
    /// String literal; `text` holds the value with `''` unescaped.
    String,
    /// `@name` variable; `text` holds the name without the sigil.
    Variable,
    Comma,
    Dot,
    LParen,
    RParen,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    /// `<>` or `!=`
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offset of the token start in the source.
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Token { kind, text: text.into(), offset }
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }
}

/// A `--` or `/* */` comment, kept out of the token stream but preserved
/// for the transpiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub text: String,
    pub offset: usize,
    pub block: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub comments: Vec<Comment>,
}

/// Tokenizes `source`, separating comments from tokens. The token stream
/// always ends with an `Eof` token carrying the source length as offset.
pub fn tokenize(source: &str) -> DvResult<LexOutput> {
    Lexer {
        source,
        input: source.char_indices().peekable(),
    }
    .run()
}

struct Lexer<'src> {
    source: &'src str,
    input: Peekable<CharIndices<'src>>,
}

impl Lexer<'_> {
    fn run(mut self) -> DvResult<LexOutput> {
        let mut out = LexOutput::default();
        loop {
            while self.move_if(|c| c.is_whitespace()) {}
            let Some((offset, next)) = self.input.next() else {
                out.tokens.push(Token::new(TokenKind::Eof, "", self.source.len()));
                return Ok(out);
            };
            let token = match next {
                '(' => Token::new(TokenKind::LParen, "(", offset),
                ')' => Token::new(TokenKind::RParen, ")", offset),
                ',' => Token::new(TokenKind::Comma, ",", offset),
                '.' => Token::new(TokenKind::Dot, ".", offset),
                '*' => Token::new(TokenKind::Star, "*", offset),
                '+' => Token::new(TokenKind::Plus, "+", offset),
                '%' => Token::new(TokenKind::Percent, "%", offset),
                ';' => Token::new(TokenKind::Semicolon, ";", offset),
                '=' => Token::new(TokenKind::Eq, "=", offset),
                '-' => {
                    if self.move_if(|c| c == '-') {
                        out.comments.push(self.line_comment(offset));
                        continue;
                    }
                    Token::new(TokenKind::Minus, "-", offset)
                }
                '/' => {
                    if self.move_if(|c| c == '*') {
                        out.comments.push(self.block_comment(offset)?);
                        continue;
                    }
                    Token::new(TokenKind::Slash, "/", offset)
                }
                '<' => {
                    if self.move_if(|c| c == '=') {
                        Token::new(TokenKind::Lte, "<=", offset)
                    } else if self.move_if(|c| c == '>') {
                        Token::new(TokenKind::Neq, "<>", offset)
                    } else {
                        Token::new(TokenKind::Lt, "<", offset)
                    }
                }
                '>' => {
                    if self.move_if(|c| c == '=') {
                        Token::new(TokenKind::Gte, ">=", offset)
                    } else {
                        Token::new(TokenKind::Gt, ">", offset)
                    }
                }
                '!' => {
                    if self.move_if(|c| c == '=') {
                        Token::new(TokenKind::Neq, "!=", offset)
                    } else {
                        return self.unexpected(offset, '!');
                    }
                }
                '\'' => self.string_literal(offset)?,
                '[' => self.bracket_ident(offset)?,
                '"' => self.quoted_ident(offset)?,
                '@' => {
                    let name = self.take_while(is_ident_continue);
                    if name.is_empty() {
                        return self.unexpected(offset, '@');
                    }
                    Token::new(TokenKind::Variable, name, offset)
                }
                '0'..='9' => {
                    let mut text = String::from(next);
                    text.push_str(&self.take_while(|c| c.is_ascii_digit()));
                    if self.next_is(|c| c == '.') {
                        self.input.next();
                        text.push('.');
                        text.push_str(&self.take_while(|c| c.is_ascii_digit()));
                    }
                    Token::new(TokenKind::Number, text, offset)
                }
                c if is_ident_start(c) => {
                    let mut word = String::from(c);
                    word.push_str(&self.take_while(is_ident_continue));
                    match Keyword::parse(&word) {
                        Some(keyword) => Token::new(TokenKind::Keyword(keyword), word, offset),
                        None => Token::new(TokenKind::Ident, word, offset),
                    }
                }
                c => return self.unexpected(offset, c),
            };
            out.tokens.push(token);
        }
    }

    fn line_comment(&mut self, offset: usize) -> Comment {
        let mut text = String::new();
        while let Some((_, c)) = self.input.peek().copied() {
            if c == '\n' {
                break;
            }
            self.input.next();
            text.push(c);
        }
        Comment { text: text.trim().to_string(), offset, block: false }
    }

    fn block_comment(&mut self, offset: usize) -> DvResult<Comment> {
        let mut text = String::new();
        loop {
            match self.input.next() {
                Some((_, '*')) if self.next_is(|c| c == '/') => {
                    self.input.next();
                    return Ok(Comment { text: text.trim().to_string(), offset, block: true });
                }
                Some((_, c)) => text.push(c),
                None => {
                    return err!(
                        code => ErrorCode::SqlSyntaxError,
                        loc => SourceLocation::of_offset(self.source, offset),
                        "unterminated block comment"
                    );
                }
            }
        }
    }

    /// `'it''s'` lexes to `it's`.
    fn string_literal(&mut self, offset: usize) -> DvResult<Token> {
        let mut value = String::new();
        loop {
            match self.input.next() {
                Some((_, '\'')) => {
                    if self.next_is(|c| c == '\'') {
                        self.input.next();
                        value.push('\'');
                    } else {
                        return Ok(Token::new(TokenKind::String, value, offset));
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return err!(
                        code => ErrorCode::SqlSyntaxError,
                        loc => SourceLocation::of_offset(self.source, offset),
                        "unterminated string literal"
                    );
                }
            }
        }
    }

    fn bracket_ident(&mut self, offset: usize) -> DvResult<Token> {
        let mut value = String::new();
        loop {
            match self.input.next() {
                Some((_, ']')) => return Ok(Token::new(TokenKind::Ident, value, offset)),
                Some((_, c)) => value.push(c),
                None => {
                    return err!(
                        code => ErrorCode::SqlSyntaxError,
                        loc => SourceLocation::of_offset(self.source, offset),
                        "unterminated bracketed identifier"
                    );
                }
            }
        }
    }

    fn quoted_ident(&mut self, offset: usize) -> DvResult<Token> {
        let mut value = String::new();
        loop {
            match self.input.next() {
                Some((_, '"')) => return Ok(Token::new(TokenKind::Ident, value, offset)),
                Some((_, c)) => value.push(c),
                None => {
                    return err!(
                        code => ErrorCode::SqlSyntaxError,
                        loc => SourceLocation::of_offset(self.source, offset),
                        "unterminated quoted identifier"
                    );
                }
            }
        }
    }

    fn take_while(&mut self, test: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some((_, c)) = self.input.peek().copied() {
            if !test(c) {
                break;
            }
            self.input.next();
            out.push(c);
        }
        out
    }

    fn move_if(&mut self, test: impl FnOnce(char) -> bool) -> bool {
        if self.next_is(test) {
            self.input.next();
            true
        } else {
            false
        }
    }

    fn next_is(&mut self, test: impl FnOnce(char) -> bool) -> bool {
        self.input.peek().is_some_and(|(_, c)| test(*c))
    }

    fn unexpected<V>(&self, offset: usize, c: char) -> DvResult<V> {
        err!(
            code => ErrorCode::SqlSyntaxError,
            loc => SourceLocation::of_offset(self.source, offset),
            "unexpected character '{c}'"
        )
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '#'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
