//! genql embeds a declarative query language into a host environment:
//! generator-style comprehensions over entity collections are compiled
//! into SQL against a relational database.
//!
//! This crate is the query translator only. A producer (parser or
//! decompiler) supplies the comprehension AST plus a type environment; a
//! dialect-specific pretty printer consumes the SQL AST:
//!
//! ```ascii
//!    comprehension AST + vartypes
//!
//!               │
//!    (dispatch) │  type-directed walk,
//!               │  monads for every subexpression
//!               ▼
//!
//!          monad algebra ──── Subquery / TableRef scopes
//!                                (joins, aliases, conditions)
//!               │
//!    (assemble) │  construct_sql_ast
//!               ▼
//!
//!            SQL AST  ───────►  external pretty printer
//! ```
//!
//! You probably want to start with [sql::translate] or, for the full
//! constructed surface (row layout, grouping, LIMIT and aggregate
//! wrappers), [sql::Translator].

pub mod ast;
mod codegen;
mod error;
pub mod schema;
pub mod sql;
#[cfg(test)]
mod test;
pub mod types;
mod utils;

pub use codegen::ast2src;
pub use error::{kind_of, Error, ErrorKind, Result, WithErrorInfo};
pub use sql::translate;
pub use utils::IntoOnly;

/// JSON serialization of an input comprehension.
pub fn json_of_ast(tree: &ast::GenExpr) -> Result<String> {
    Ok(serde_json::to_string(tree)?)
}

/// JSON deserialization of an input comprehension.
pub fn ast_of_json(json: &str) -> Result<ast::GenExpr> {
    Ok(serde_json::from_str(json)?)
}

/// JSON serialization of a produced SQL AST.
pub fn json_of_sql(sql_ast: &sql::ast::SqlAst) -> Result<String> {
    Ok(serde_json::to_string(sql_ast)?)
}

/// JSON deserialization of a SQL AST.
pub fn sql_of_json(json: &str) -> Result<sql::ast::SqlAst> {
    Ok(serde_json::from_str(json)?)
}
