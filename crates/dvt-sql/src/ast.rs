/// Typed AST for the supported T-SQL subset. Trees are immutable once the
/// parser returns them; every node carries the byte offset of its first
/// token.

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Union(UnionStatement),
    Declare(DeclareVar),
    Set(SetVar),
    Block(Vec<Statement>),
    TryCatch {
        try_block: Vec<Statement>,
        catch_block: Vec<Statement>,
        offset: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionStatement {
    pub selects: Vec<SelectStatement>,
    /// `UNION ALL` (bag) vs plain `UNION` (set).
    pub all: bool,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclareVar {
    pub name: String,
    pub data_type: String,
    pub value: Option<Expr>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetVar {
    pub name: String,
    pub value: Expr,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub top: Option<u64>,
    pub columns: Vec<SelectColumn>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    /// `*` or `t.*`
    Star { table: Option<String>, offset: usize },
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
    pub offset: usize,
}

impl TableRef {
    /// The name a column qualifier matches: the alias when present,
    /// otherwise the table name itself.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Expr,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // comparison
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    // logical
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub offset: usize,
}

impl Expr {
    pub fn new(kind: ExprKind, offset: usize) -> Self {
        Expr { kind, offset }
    }

    /// True for `COUNT`/`SUM`/`AVG`/`MIN`/`MAX` calls.
    pub fn is_aggregate(&self) -> bool {
        matches!(&self.kind, ExprKind::Function { name, .. } if is_aggregate_name(name))
    }

    /// Column references appearing anywhere inside this expression.
    pub fn referenced_columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match &self.kind {
            ExprKind::Column(column) => out.push(column),
            ExprKind::Literal(_) | ExprKind::Variable(_) | ExprKind::Star => {}
            ExprKind::Unary { expr, .. } => expr.collect_columns(out),
            ExprKind::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            ExprKind::Like { expr, pattern, .. } => {
                expr.collect_columns(out);
                pattern.collect_columns(out);
            }
            ExprKind::In { expr, list, .. } => {
                expr.collect_columns(out);
                for item in list {
                    item.collect_columns(out);
                }
            }
            ExprKind::IsNull { expr, .. } => expr.collect_columns(out),
            ExprKind::Between { expr, low, high, .. } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
            ExprKind::Case { operand, branches, else_branch } => {
                if let Some(operand) = operand {
                    operand.collect_columns(out);
                }
                for (when, then) in branches {
                    when.collect_columns(out);
                    then.collect_columns(out);
                }
                if let Some(else_branch) = else_branch {
                    else_branch.collect_columns(out);
                }
            }
            ExprKind::Cast { expr, .. } => expr.collect_columns(out),
            ExprKind::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Column(ColumnRef),
    Literal(Literal),
    Variable(String),
    /// `*` as an argument (`COUNT(*)`).
    Star,
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_branch: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        data_type: String,
    },
    /// Function call; aggregates and `IIF` land here too.
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },
}

pub fn is_aggregate_name(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "count" | "sum" | "avg" | "min" | "max"
    )
}
