//! The target IR: a SQL AST in tag-list form, ready for a dialect-specific
//! pretty printer.
//!
//! Conventions the printer can rely on:
//! - `SELECT` children are: select clause, `FROM`, then optional `WHERE`,
//!   `GROUP_BY`, `HAVING`, `ORDER_BY`, `LIMIT`, in that order.
//! - A select clause is an `ALL`, `DISTINCT` or `AGGREGATES` node whose
//!   children are the output columns.
//! - Aggregate arguments are either plain expressions or wrapped in a
//!   single `ALL`/`DISTINCT` marker node; `(COUNT (ALL))` is `COUNT(*)`.
//! - `IN` is `(IN lhs v1 v2 …)` for a literal list and `(IN lhs (SELECT …))`
//!   for a subquery.
//! - `CASE` children alternate condition/value pairs with a trailing
//!   default: `(CASE cond1 val1 … default)`.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::Literal;
use crate::types::Ty;

/// Head tags of SQL AST nodes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    Select,
    Distinct,
    All,
    Aggregates,
    From,
    InnerJoin,
    LeftJoin,
    Table,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    As,
    Asc,
    Desc,
    Row,
    IsNull,
    IsNotNull,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
    NotIn,
    Exists,
    NotExists,
    Like,
    NotLike,
    Between,
    NotBetween,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    Abs,
    Concat,
    Substr,
    Length,
    Upper,
    Lower,
    Trim,
    Ltrim,
    Rtrim,
    Coalesce,
    Case,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Today,
    Now,
}

/// The table used by smart negation of boolean nodes.
pub fn sql_negation(tag: Tag) -> Option<Tag> {
    Some(match tag {
        Tag::In => Tag::NotIn,
        Tag::NotIn => Tag::In,
        Tag::Exists => Tag::NotExists,
        Tag::NotExists => Tag::Exists,
        Tag::Like => Tag::NotLike,
        Tag::NotLike => Tag::Like,
        Tag::Between => Tag::NotBetween,
        Tag::NotBetween => Tag::Between,
        Tag::IsNull => Tag::IsNotNull,
        Tag::IsNotNull => Tag::IsNull,
        _ => return None,
    })
}

/// Key binding an external parameter back to the type environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub src: String,
    /// Component index for tuple parameters and composite entity keys.
    pub index: Option<usize>,
}

impl ParamKey {
    pub fn new<S: Into<String>>(src: S) -> Self {
        ParamKey {
            src: src.into(),
            index: None,
        }
    }

    pub fn indexed<S: Into<String>>(src: S, index: usize) -> Self {
        ParamKey {
            src: src.into(),
            index: Some(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum SqlAst {
    /// A tagged node with its operands.
    Node(Tag, Vec<SqlAst>),
    /// `alias.name` column reference.
    Column(String, String),
    /// A literal value.
    Value(Literal),
    /// A placeholder bound from the runtime parameter dictionary; the type
    /// selects the converter on the printer side.
    Param(ParamKey, Ty),
    /// A bare identifier payload (alias or column name).
    Name(String),
    /// A FROM/JOIN list; also the body of EXISTS.
    From(FromClause),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromClause {
    pub head: FromHead,
    pub items: Vec<FromItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromHead {
    From,
    InnerJoin,
    LeftJoin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromItem {
    pub alias: String,
    pub source: FromSource,
    /// Join condition; `None` for the leading cross-joined item.
    pub condition: Option<SqlAst>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum FromSource {
    Table(String),
    Subselect(Box<SqlAst>),
}

impl FromClause {
    pub fn new(head: FromHead) -> Self {
        FromClause {
            head,
            items: Vec::new(),
        }
    }

    pub fn push_table(&mut self, alias: String, table: String, condition: Option<SqlAst>) {
        self.items.push(FromItem {
            alias,
            source: FromSource::Table(table),
            condition,
        });
    }

    pub fn push_subselect(&mut self, alias: String, select: SqlAst, condition: Option<SqlAst>) {
        self.items.push(FromItem {
            alias,
            source: FromSource::Subselect(Box::new(select)),
            condition,
        });
    }
}

impl SqlAst {
    pub fn node(tag: Tag, items: Vec<SqlAst>) -> SqlAst {
        SqlAst::Node(tag, items)
    }

    pub fn column<S: Into<String>>(alias: S, name: S) -> SqlAst {
        SqlAst::Column(alias.into(), name.into())
    }

    pub fn value(value: Literal) -> SqlAst {
        SqlAst::Value(value)
    }

    pub fn eq(left: SqlAst, right: SqlAst) -> SqlAst {
        SqlAst::Node(Tag::Eq, vec![left, right])
    }

    /// `(AS expr name)`
    pub fn aliased(expr: SqlAst, name: &str) -> SqlAst {
        SqlAst::Node(Tag::As, vec![expr, SqlAst::Name(name.to_string())])
    }

    /// The head tag, for nodes that have one.
    pub fn tag(&self) -> Option<Tag> {
        match self {
            SqlAst::Node(tag, _) => Some(*tag),
            _ => None,
        }
    }
}

/// Conjunction with flattening of nested ANDs. A single condition is
/// returned unchanged.
pub fn sqland(items: Vec<SqlAst>) -> SqlAst {
    combine(Tag::And, items)
}

/// Disjunction with flattening of nested ORs.
pub fn sqlor(items: Vec<SqlAst>) -> SqlAst {
    combine(Tag::Or, items)
}

fn combine(tag: Tag, mut items: Vec<SqlAst>) -> SqlAst {
    if items.len() == 1 {
        return items.swap_remove(0);
    }
    let mut result = Vec::with_capacity(items.len());
    for item in items {
        match item {
            SqlAst::Node(t, children) if t == tag => result.extend(children),
            other => result.push(other),
        }
    }
    SqlAst::Node(tag, result)
}

/// The equality predicate joining two table occurrences column by column.
pub fn join_tables(alias1: &str, alias2: &str, columns1: &[String], columns2: &[String]) -> SqlAst {
    debug_assert_eq!(columns1.len(), columns2.len());
    sqland(
        columns1
            .iter()
            .zip(columns2)
            .map(|(c1, c2)| {
                SqlAst::eq(
                    SqlAst::Column(alias1.to_string(), c1.clone()),
                    SqlAst::Column(alias2.to_string(), c2.clone()),
                )
            })
            .collect(),
    )
}

/// Splits a join condition back into its equality conjuncts.
pub fn flatten_and(condition: SqlAst) -> Vec<SqlAst> {
    match condition {
        SqlAst::Node(Tag::And, items) => items,
        other => vec![other],
    }
}

impl fmt::Display for SqlAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlAst::Node(tag, items) => {
                write!(f, "({tag}")?;
                for item in items {
                    write!(f, " {item}")?;
                }
                write!(f, ")")
            }
            SqlAst::Column(alias, name) => write!(f, "(COLUMN {alias} {name})"),
            SqlAst::Value(value) => write!(f, "(VALUE {value})"),
            SqlAst::Param(key, _) => match key.index {
                Some(i) => write!(f, "(PARAM {}.{i})", key.src),
                None => write!(f, "(PARAM {})", key.src),
            },
            SqlAst::Name(name) => write!(f, "{name}"),
            SqlAst::From(clause) => write!(f, "{clause}"),
        }
    }
}

impl fmt::Display for FromClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = match self.head {
            FromHead::From => "FROM",
            FromHead::InnerJoin => "INNER_JOIN",
            FromHead::LeftJoin => "LEFT_JOIN",
        };
        write!(f, "({head}")?;
        for item in &self.items {
            write!(f, " {item}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for FromItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        match &self.source {
            FromSource::Table(table) => write!(f, "TABLE {table} {}", self.alias)?,
            FromSource::Subselect(select) => write!(f, "{select} {}", self.alias)?,
        }
        if let Some(condition) = &self.condition {
            write!(f, " {condition}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqland_flattens() {
        let a = SqlAst::eq(SqlAst::column("t", "a"), SqlAst::value(Literal::Int(1)));
        let b = SqlAst::eq(SqlAst::column("t", "b"), SqlAst::value(Literal::Int(2)));
        let c = SqlAst::eq(SqlAst::column("t", "c"), SqlAst::value(Literal::Int(3)));
        let nested = sqland(vec![a.clone(), sqland(vec![b.clone(), c.clone()])]);
        assert_eq!(nested, SqlAst::Node(Tag::And, vec![a, b, c]));
    }

    #[test]
    fn test_sqland_single_item() {
        let a = SqlAst::eq(SqlAst::column("t", "a"), SqlAst::value(Literal::Int(1)));
        assert_eq!(sqland(vec![a.clone()]), a);
    }

    #[test]
    fn test_join_tables_display() {
        let cond = join_tables(
            "s",
            "g",
            &["group".to_string()],
            &["id".to_string()],
        );
        assert_eq!(cond.to_string(), "(EQ (COLUMN s group) (COLUMN g id))");
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::GroupBy.to_string(), "GROUP_BY");
        assert_eq!(Tag::IsNotNull.to_string(), "IS_NOT_NULL");
        assert_eq!(Tag::NotIn.to_string(), "NOT_IN");
    }

    #[test]
    fn test_negation_table_is_symmetric() {
        for tag in [Tag::In, Tag::Exists, Tag::Like, Tag::Between, Tag::IsNull] {
            let negated = sql_negation(tag).unwrap();
            assert_eq!(sql_negation(negated), Some(tag));
        }
        assert_eq!(sql_negation(Tag::Eq), None);
    }
}
