//! Syntax tree of rule scripts.

use serde_json::Value;

use super::Capability;

/// Dotted fact path such as `order.customer.id`
pub(crate) type Path = Vec<String>;

/// One `rule Name [: Capability, ...] { ... }` declaration
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RuleDecl {
    pub name: String,
    pub line: usize,
    pub declared: Vec<Capability>,
    pub fields: Vec<(String, Expr)>,
    pub condition: Option<Expr>,
    pub body: Option<Vec<Stmt>>,
}

impl RuleDecl {
    /// Capabilities this declaration can serve
    ///
    /// Explicit declarations win; otherwise the members decide.
    pub fn capabilities(&self) -> Vec<Capability> {
        if !self.declared.is_empty() {
            return self.declared.clone();
        }
        let mut capabilities = Vec::new();
        if self.condition.is_some() {
            capabilities.push(Capability::Condition);
        }
        if self.body.is_some() {
            capabilities.push(Capability::Action);
        }
        capabilities
    }

    /// Marker declarations named after a capability are never instantiated
    pub fn is_marker(&self) -> bool {
        self.name == Capability::Action.marker() || self.name == Capability::Condition.marker()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Set(Path, Expr),
    Unset(Path),
    If {
        condition: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Function {
    Len,
    Lower,
    Upper,
    Contains,
    Exists,
    StartsWith,
    Abs,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "len" => Function::Len,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "contains" => Function::Contains,
            "exists" => Function::Exists,
            "starts_with" => Function::StartsWith,
            "abs" => Function::Abs,
            _ => return None,
        };
        Some(function)
    }

    pub fn arity(self) -> usize {
        match self {
            Function::Contains | Function::StartsWith => 2,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Len => "len",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Contains => "contains",
            Function::Exists => "exists",
            Function::StartsWith => "starts_with",
            Function::Abs => "abs",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Path(Path),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}
