//! Backend for translating comprehensions into the SQL AST.

pub mod ast;
pub mod dialect;
pub mod functions;
mod monad;
pub mod scope;
mod sets;
mod translator;

pub use dialect::{Dialect, DialectHandler};
pub use translator::{Extractors, Options, RowSlot, Translation, Translator};

use std::collections::HashMap;

use crate::ast::GenExpr;
use crate::error::Result;
use crate::schema::Schema;
use crate::types::Ty;

use self::ast::SqlAst;

/// Translate a comprehension into a SQL AST in one call.
pub fn translate(
    schema: &Schema,
    tree: &GenExpr,
    vartypes: &HashMap<String, Ty>,
    options: Options,
) -> Result<SqlAst> {
    let translator = Translator::new(schema, tree, Extractors::new(), vartypes, options)?;
    let (sql_ast, _) = translator.construct_sql_ast(None, None, None)?;
    Ok(sql_ast)
}
