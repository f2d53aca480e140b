pub use anyhow::Result;

use serde::Serialize;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};

/// Error raised during translation of a single comprehension.
///
/// Message templates may contain an `{EXPR}` placeholder; the walker fills
/// `expr` with the rendered source of the innermost offending node, and
/// [Display] substitutes it into the message.
#[derive(Debug, Clone, Serialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub expr: Option<String>,
    pub help: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ErrorKind {
    /// Structural problem in the comprehension itself.
    Translation(String),
    /// Two types that fail the comparability relation.
    Incomparable { left: String, right: String },
    /// Argument or operand of the wrong type for an operation.
    InvalidType(String),
    /// Attribute not present on an entity or value kind.
    UnknownAttribute { on: String, name: String },
    /// Well-defined input the translator does not support.
    Unsupported(String),
    /// The requested optimize path cannot be applied; retry without it.
    OptimizationFailed,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            expr: None,
            help: None,
        }
    }

    pub fn translation<S: Into<String>>(msg: S) -> Self {
        Error::new(ErrorKind::Translation(msg.into()))
    }

    pub fn invalid_type<S: Into<String>>(msg: S) -> Self {
        Error::new(ErrorKind::InvalidType(msg.into()))
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::new(ErrorKind::Unsupported(msg.into()))
    }

    pub fn incomparable<S: Into<String>>(left: S, right: S) -> Self {
        Error::new(ErrorKind::Incomparable {
            left: left.into(),
            right: right.into(),
        })
    }

    pub fn unknown_attribute<S: Into<String>>(on: S, name: S) -> Self {
        Error::new(ErrorKind::UnknownAttribute {
            on: on.into(),
            name: name.into(),
        })
    }

    pub fn with_expr<S: Into<String>>(mut self, expr: S) -> Self {
        if self.expr.is_none() {
            self.expr = Some(expr.into());
        }
        self
    }

    pub fn with_help<S: Into<String>>(mut self, help: S) -> Self {
        self.help = Some(help.into());
        self
    }

    fn message(&self) -> String {
        match &self.kind {
            ErrorKind::Translation(msg) => msg.clone(),
            ErrorKind::Incomparable { left, right } => {
                format!("Incomparable types '{left}' and '{right}' in expression: {{EXPR}}")
            }
            ErrorKind::InvalidType(msg) => msg.clone(),
            ErrorKind::UnknownAttribute { on, name } => {
                format!("'{on}' object has no attribute '{name}': {{EXPR}}")
            }
            ErrorKind::Unsupported(msg) => msg.clone(),
            ErrorKind::OptimizationFailed => "optimization failed".to_string(),
        }
    }
}

// Needed for anyhow
impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = self.message();
        let msg = match &self.expr {
            Some(expr) => msg.replace("{EXPR}", expr),
            None => msg,
        };
        f.write_str(&msg)?;
        if let Some(help) = &self.help {
            write!(f, " (help: {help})")?;
        }
        Ok(())
    }
}

/// Raised when a bound method is used as a value instead of being called.
pub fn forgot_parentheses(src: Option<&str>) -> Error {
    let what = src.unwrap_or("{EXPR}");
    Error::translation(format!("You seem to have forgotten parentheses after {what}"))
}

pub trait WithErrorInfo {
    fn with_expr<S: Into<String>>(self, expr: S) -> Self;

    fn with_help<S: Into<String>>(self, help: S) -> Self;
}

impl<T> WithErrorInfo for Result<T, Error> {
    fn with_expr<S: Into<String>>(self, expr: S) -> Self {
        self.map_err(|e| e.with_expr(expr))
    }

    fn with_help<S: Into<String>>(self, help: S) -> Self {
        self.map_err(|e| e.with_help(help))
    }
}

/// Attaches the rendered source of the offending node to a translation error
/// bubbling through `anyhow`, once, at the innermost dispatch boundary.
pub fn attach_expr_context(error: anyhow::Error, expr: &str) -> anyhow::Error {
    match error.downcast::<Error>() {
        Ok(e) => e.with_expr(expr).into(),
        Err(other) => other,
    }
}

/// Extracts the translation error kind from an `anyhow` error, if any.
pub fn kind_of(error: &anyhow::Error) -> Option<&ErrorKind> {
    error.downcast_ref::<Error>().map(|e| &e.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_substitution() {
        let e = Error::incomparable("int", "unicode").with_expr("a == b");
        assert_eq!(
            e.to_string(),
            "Incomparable types 'int' and 'unicode' in expression: a == b"
        );
    }

    #[test]
    fn test_expr_set_once() {
        let e = Error::translation("bad: {EXPR}")
            .with_expr("inner")
            .with_expr("outer");
        assert_eq!(e.to_string(), "bad: inner");
    }
}
