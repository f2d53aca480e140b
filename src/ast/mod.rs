//! The input contract: an already-parsed comprehension of the shape
//! `expr for x in S [if p]* [for y in T if …]*`, plus the literal values
//! that may appear inside it.
//!
//! The AST producer (a parser or a bytecode decompiler) marks nodes that
//! refer to values outside the comprehension as `external` and keys them by
//! `src` into the type environment; the translator never sees host values,
//! only their normalized types.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A whole comprehension: the selector expression and its qualifier chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenExpr {
    pub expr: Expr,
    pub quals: Vec<Qualifier>,
}

/// One `for <assign> in <iter> [if test]*` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    pub assign: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    /// Identity of the node in the type environment, when external.
    pub src: Option<String>,
    /// True when the node refers to a value supplied from outside the query.
    pub external: bool,
    /// True when an external node still denotes a compile-time constant.
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ExprKind {
    Name(String),
    Getattr {
        expr: Box<Expr>,
        attr: String,
    },
    Literal(Literal),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
        star_args: Option<Box<Expr>>,
        dstar_args: Option<Box<Expr>>,
    },
    Subscript {
        expr: Box<Expr>,
        index: Subscript,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
        varargs: bool,
        kwargs: bool,
    },
    /// A nested comprehension lifted to its own scope.
    Comprehension(Box<GenExpr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Subscript {
    Item(Box<Expr>),
    Tuple(Vec<Expr>),
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }

    /// The operator that negates this one, used by smart negation.
    pub fn negated(&self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Is => CmpOp::IsNot,
            CmpOp::IsNot => CmpOp::Is,
            CmpOp::In => CmpOp::NotIn,
            CmpOp::NotIn => CmpOp::In,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Literal {
    Null,
    Int(i64),
    Float(f64),
    Decimal(BigDecimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Decimal(d) => write!(f, "{d}"),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Bytes(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
            Literal::Date(d) => write!(f, "'{d}'"),
            Literal::Datetime(dt) => write!(f, "'{dt}'"),
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr {
            kind,
            src: None,
            external: false,
            constant: false,
        }
    }

    pub fn name<S: Into<String>>(name: S) -> Self {
        Expr::new(ExprKind::Name(name.into()))
    }

    pub fn literal(value: Literal) -> Self {
        Expr::new(ExprKind::Literal(value))
    }

    pub fn getattr<S: Into<String>>(self, attr: S) -> Self {
        Expr::new(ExprKind::Getattr {
            expr: Box::new(self),
            attr: attr.into(),
        })
    }

    /// Marks the node as referring to a value outside the query, keyed by
    /// `src` into the type environment.
    pub fn external<S: Into<String>>(mut self, src: S) -> Self {
        self.src = Some(src.into());
        self.external = true;
        self
    }
}
