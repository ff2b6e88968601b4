use std::sync::Arc;

use super::literal::Literal;
use super::symbol::Symbol;

/// Source position of a syntax node. `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pos {
    pub filename: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub fn new(filename: &str, line: u32, column: u32) -> Self {
        Pos {
            filename: Arc::from(filename),
            line,
            column,
        }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// A parsed syntax node as handed over by the reader/parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub pos: Pos,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Vector(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Set(Vec<Expr>),

    /// A name reference, resolved lexically first and globally second.
    Symbol(Symbol),

    /// `(var x)`: the global Var itself rather than its value.
    VarRef(Symbol),

    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },

    Do(Vec<Expr>),

    Def {
        name: Symbol,
        value: Option<Box<Expr>>,
        meta: Option<Box<Expr>>,
    },

    /// Sequential bindings: each init sees the names bound before it.
    Let {
        bindings: Vec<(Symbol, Expr)>,
        body: Vec<Expr>,
    },

    /// Like `Let`, and also a target for `Recur`.
    Loop {
        bindings: Vec<(Symbol, Expr)>,
        body: Vec<Expr>,
    },

    Recur(Vec<Expr>),

    Fn {
        name: Option<Symbol>,
        arities: Vec<FnArity>,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    Meta {
        meta: Box<Expr>,
        expr: Box<Expr>,
    },

    Throw(Box<Expr>),

    Try {
        body: Vec<Expr>,
        catches: Vec<Catch>,
        finally: Option<Vec<Expr>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnArity {
    pub params: Vec<Symbol>,
    /// The last param collects remaining arguments.
    pub variadic: bool,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub ty: Symbol,
    pub binding: Symbol,
    pub body: Vec<Expr>,
}

impl Expr {
    pub fn new(pos: Pos, kind: ExprKind) -> Self {
        Expr { pos, kind }
    }

    /// Short name of the node kind for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::Literal(_) => "literal",
            ExprKind::Vector(_) => "vector",
            ExprKind::Map(_) => "map",
            ExprKind::Set(_) => "set",
            ExprKind::Symbol(_) => "symbol",
            ExprKind::VarRef(_) => "var",
            ExprKind::If { .. } => "if",
            ExprKind::Do(_) => "do",
            ExprKind::Def { .. } => "def",
            ExprKind::Let { .. } => "let",
            ExprKind::Loop { .. } => "loop",
            ExprKind::Recur(_) => "recur",
            ExprKind::Fn { .. } => "fn",
            ExprKind::Call { .. } => "call",
            ExprKind::Meta { .. } => "meta",
            ExprKind::Throw(_) => "throw",
            ExprKind::Try { .. } => "try",
        }
    }
}

/// Terse constructors for building trees by hand (tests, macro output).
pub mod build {
    use super::*;

    pub fn lit(pos: &Pos, value: Literal) -> Expr {
        Expr::new(pos.clone(), ExprKind::Literal(value))
    }

    pub fn int(pos: &Pos, n: i64) -> Expr {
        lit(pos, Literal::Int(n))
    }

    pub fn sym(pos: &Pos, name: &str) -> Expr {
        Expr::new(pos.clone(), ExprKind::Symbol(Symbol::parse(name)))
    }

    pub fn call(pos: &Pos, callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::new(
            pos.clone(),
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
        )
    }

    pub fn fn1(pos: &Pos, params: &[&str], body: Vec<Expr>) -> Expr {
        Expr::new(
            pos.clone(),
            ExprKind::Fn {
                name: None,
                arities: vec![FnArity {
                    params: params.iter().map(|p| Symbol::new(p)).collect(),
                    variadic: false,
                    body,
                }],
            },
        )
    }

    pub fn let_(pos: &Pos, bindings: Vec<(&str, Expr)>, body: Vec<Expr>) -> Expr {
        Expr::new(
            pos.clone(),
            ExprKind::Let {
                bindings: bindings
                    .into_iter()
                    .map(|(name, init)| (Symbol::new(name), init))
                    .collect(),
                body,
            },
        )
    }

    pub fn loop_(pos: &Pos, bindings: Vec<(&str, Expr)>, body: Vec<Expr>) -> Expr {
        Expr::new(
            pos.clone(),
            ExprKind::Loop {
                bindings: bindings
                    .into_iter()
                    .map(|(name, init)| (Symbol::new(name), init))
                    .collect(),
                body,
            },
        )
    }

    pub fn def(pos: &Pos, name: &str, value: Expr) -> Expr {
        Expr::new(
            pos.clone(),
            ExprKind::Def {
                name: Symbol::new(name),
                value: Some(Box::new(value)),
                meta: None,
            },
        )
    }
}
