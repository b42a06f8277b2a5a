//! The SQLFlow statement AST.
//!
//! One node per `.sf` statement; conditional blocks nest statement lists and
//! are flattened away by the planner.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::span::Span;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(flatten)]
    pub kind: StmtKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Stmt {
        Stmt { kind, span: None }
    }
}

#[derive(Debug, EnumAsInner, PartialEq, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    SourceDef(SourceDef),
    Load(LoadStmt),
    Export(ExportStmt),
    Set(SetStmt),
    Sql(SqlStmt),
    If(IfBlock),
}

/// `SOURCE name TYPE csv PARAMS {..}` or `SOURCE name FROM "profile_conn" OPTIONS {..}`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SourceDef {
    pub name: String,
    /// Connector type tag for the inline form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    /// Connector parameters for the inline form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Name of a profile-defined connector for the `FROM` form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_ref: Option<String>,
    /// Parameter overrides layered on top of the referenced connector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct LoadStmt {
    pub target_table: String,
    pub source_ref: String,
    pub mode: LoadMode,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub merge_keys: Vec<String>,
}

#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LoadMode {
    #[default]
    Replace,
    Append,
    Upsert,
    Merge,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ExportStmt {
    /// Raw `SELECT …` text, opaque until hand-off to the engine.
    pub select_sql: String,
    pub destination_uri: String,
    pub type_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// `SET name = expression` — the right-hand side is kept as a raw template
/// and substituted when the planner reaches the statement.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SetStmt {
    pub name: String,
    pub expression: String,
}

/// Any raw SQL statement, e.g. `CREATE TABLE … AS …`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SqlStmt {
    pub raw: String,
}

/// `IF … THEN … [ELSE IF … THEN …]* [ELSE …] END IF`, nestable.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct IfBlock {
    /// Condition/body pairs in source order; the first true condition wins.
    pub branches: Vec<(Expr, Vec<Stmt>)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub else_body: Option<Vec<Stmt>>,
}

/// A condition expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(flatten)]
    pub kind: ExprKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Expr {
        Expr { kind, span: None }
    }
}

#[derive(Debug, EnumAsInner, PartialEq, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    Variable(VariableExpr),
    /// A bare word, compared by its text.
    Ident(String),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct UnaryExpr {
    pub op: UnOp,
    pub expr: Box<Expr>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BinaryExpr {
    pub left: Box<Expr>,
    pub op: BinOp,
    pub right: Box<Expr>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, strum::Display)]
pub enum UnOp {
    #[strum(to_string = "NOT")]
    Not,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, strum::Display)]
pub enum BinOp {
    #[strum(to_string = "==")]
    Eq,
    #[strum(to_string = "!=")]
    Ne,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Lte,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = ">=")]
    Gte,
    #[strum(to_string = "AND")]
    And,
    #[strum(to_string = "OR")]
    Or,
}

#[derive(Debug, EnumAsInner, PartialEq, Clone, Serialize, Deserialize, strum::AsRefStr)]
pub enum Literal {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Integer(i) => write!(f, "{i}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Boolean(b) => f.write_str(if *b { "true" } else { "false" }),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
        }
    }
}

/// A `${name}` or `${name|default}` reference.
///
/// `raw` is the text between the braces, kept verbatim so the reference can
/// be printed back exactly as written.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct VariableExpr {
    pub raw: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}
