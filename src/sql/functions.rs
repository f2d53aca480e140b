//! Built-in functions and bound-method dispatch.
//!
//! The `Builtin` enum is the registry of host functions allowed inside
//! queries; the type environment refers to them via `Ty::Function`.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ast::Literal;
use crate::error::{forgot_parentheses, Error, Result};
use crate::sql::ast::{SqlAst, Tag};
use crate::sql::monad::{check_comparable, Monad, MonadKind};
use crate::sql::translator::SqlTranslator;
use crate::types::{coerce_types, Comparison, Ty};
use crate::utils::IntoOnly;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Len,
    Abs,
    Min,
    Max,
    Sum,
    Count,
    Avg,
    Select,
    Exists,
    Desc,
    /// Requests joined-subselect emission for the wrapped expression.
    Join,
    Date,
    Datetime,
    Decimal,
    Buffer,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Count => "count",
            Builtin::Avg => "avg",
            Builtin::Select => "select",
            Builtin::Exists => "exists",
            Builtin::Desc => "desc",
            Builtin::Join => "JOIN",
            Builtin::Date => "date",
            Builtin::Datetime => "datetime",
            Builtin::Decimal => "Decimal",
            Builtin::Buffer => "buffer",
        }
    }
}

pub fn is_string_method(name: &str) -> bool {
    matches!(
        name,
        "upper" | "lower" | "startswith" | "endswith" | "strip" | "lstrip" | "rstrip"
    )
}

fn arity_error(func: &str, expected: &str, given: usize) -> anyhow::Error {
    Error::invalid_type(format!(
        "{func}() takes {expected} ({given} given)"
    ))
    .into()
}

fn no_keywords(func: &str, kwargs: &[(String, Monad)]) -> Result<()> {
    match kwargs.first() {
        None => Ok(()),
        Some((name, _)) => Err(Error::invalid_type(format!(
            "{func}() got an unexpected keyword argument '{name}'"
        ))
        .into()),
    }
}

impl Monad {
    /// Calls the monad, dispatching to the built-in or bound method it
    /// stands for.
    pub fn call(
        self,
        args: Vec<Monad>,
        kwargs: Vec<(String, Monad)>,
        tx: &mut SqlTranslator,
    ) -> Result<Monad> {
        match self.kind {
            MonadKind::Func(builtin) => call_builtin(builtin, args, kwargs, tx),
            MonadKind::Method { parent, name } => call_method(*parent, &name, args, kwargs, tx),
            kind => {
                let monad = Monad {
                    kind,
                    aggregated: self.aggregated,
                    nogroup: self.nogroup,
                    src: self.src,
                };
                Err(Error::invalid_type(format!(
                    "'{}' object is not callable in {{EXPR}}",
                    monad.describe(tx)
                ))
                .into())
            }
        }
    }
}

fn call_builtin(
    builtin: Builtin,
    mut args: Vec<Monad>,
    kwargs: Vec<(String, Monad)>,
    tx: &mut SqlTranslator,
) -> Result<Monad> {
    no_keywords(builtin.name(), &kwargs)?;
    match builtin {
        Builtin::Len => {
            let arg = one_arg("len", args)?;
            arg.length(tx)
        }
        Builtin::Abs => {
            let arg = one_arg("abs", args)?;
            arg.abs(tx)
        }
        Builtin::Count => {
            if args.len() > 1 {
                return Err(arity_error("count", "at most 1 argument", args.len()));
            }
            let arg = match args.pop() {
                Some(arg) => match &arg.kind {
                    MonadKind::Const(Literal::String(s)) if s == "*" => None,
                    _ => Some(arg),
                },
                None => None,
            };
            match arg {
                Some(arg) => arg.count(tx),
                None => {
                    let mut result = Monad::expr(
                        Ty::Int,
                        SqlAst::Node(Tag::Count, vec![SqlAst::Node(Tag::All, vec![])]),
                    );
                    result.aggregated = true;
                    Ok(result)
                }
            }
        }
        Builtin::Sum => one_arg("sum", args)?.aggregate(Tag::Sum, tx),
        Builtin::Avg => one_arg("avg", args)?.aggregate(Tag::Avg, tx),
        Builtin::Min => {
            if args.is_empty() {
                return Err(arity_error("min", "at least 1 argument", 0));
            }
            if args.len() == 1 {
                return args.swap_remove(0).aggregate(Tag::Min, tx);
            }
            minmax(Tag::Min, args, tx)
        }
        Builtin::Max => {
            if args.is_empty() {
                return Err(arity_error("max", "at least 1 argument", 0));
            }
            if args.len() == 1 {
                return args.swap_remove(0).aggregate(Tag::Max, tx);
            }
            minmax(Tag::Max, args, tx)
        }
        Builtin::Select => {
            let arg = one_arg("select", args)?;
            match arg.kind {
                MonadKind::QuerySet(_) => Ok(arg),
                _ => Err(Error::invalid_type(
                    "'select' function expects a generator expression, got: {EXPR}".to_string(),
                )
                .into()),
            }
        }
        Builtin::Exists => {
            let arg = one_arg("exists", args)?;
            match &arg.kind {
                MonadKind::AttrSet { .. } | MonadKind::QuerySet(_) => arg.nonzero(tx),
                _ => Err(Error::invalid_type(
                    "'exists' function expects a generator expression or collection, got: {EXPR}"
                        .to_string(),
                )
                .into()),
            }
        }
        Builtin::Desc => {
            let arg = one_arg("desc", args)?;
            Ok(Monad::inheriting(
                MonadKind::Desc(Box::new(arg.clone())),
                &[&arg],
            ))
        }
        // The walker scopes the hint around argument translation; by the
        // time the call is dispatched the wrapper is an identity.
        Builtin::Join => one_arg("JOIN", args),
        Builtin::Date => {
            if args.len() != 3 {
                return Err(arity_error("date", "exactly 3 arguments", args.len()));
            }
            let values = const_int_args("date", &args, &["year", "month", "day"], tx)?;
            let date = NaiveDate::from_ymd_opt(
                values[0] as i32,
                values[1] as u32,
                values[2] as u32,
            )
            .ok_or_else(|| Error::invalid_type("invalid date in {EXPR}".to_string()))?;
            Ok(Monad::constant(Literal::Date(date)))
        }
        Builtin::Datetime => {
            if args.len() < 3 || args.len() > 7 {
                return Err(arity_error("datetime", "from 3 to 7 arguments", args.len()));
            }
            let names = ["year", "month", "day", "hour", "minute", "second", "microsecond"];
            let values = const_int_args("datetime", &args, &names[..args.len()], tx)?;
            let mut padded = values.clone();
            padded.resize(7, 0);
            let datetime = NaiveDate::from_ymd_opt(
                padded[0] as i32,
                padded[1] as u32,
                padded[2] as u32,
            )
            .and_then(|d| {
                d.and_hms_micro_opt(
                    padded[3] as u32,
                    padded[4] as u32,
                    padded[5] as u32,
                    padded[6] as u32,
                )
            })
            .ok_or_else(|| Error::invalid_type("invalid datetime in {EXPR}".to_string()))?;
            Ok(Monad::constant(Literal::Datetime(datetime)))
        }
        Builtin::Decimal => {
            let arg = one_arg("Decimal", args)?;
            match &arg.kind {
                MonadKind::Const(Literal::String(value)) => {
                    let decimal = BigDecimal::from_str(value).map_err(|_| {
                        Error::invalid_type(format!("invalid decimal literal '{value}'"))
                    })?;
                    Ok(Monad::constant(Literal::Decimal(decimal)))
                }
                _ => Err(Error::invalid_type(
                    "Decimal() inside a query expects a constant string".to_string(),
                )
                .into()),
            }
        }
        Builtin::Buffer => {
            let arg = one_arg("buffer", args)?;
            match &arg.kind {
                MonadKind::Const(Literal::String(value)) => {
                    Ok(Monad::constant(Literal::Bytes(value.clone().into_bytes())))
                }
                _ => Err(Error::invalid_type(
                    "buffer() inside a query expects a constant string".to_string(),
                )
                .into()),
            }
        }
    }
}

fn one_arg(func: &str, mut args: Vec<Monad>) -> Result<Monad> {
    if args.len() != 1 {
        return Err(arity_error(func, "exactly 1 argument", args.len()));
    }
    Ok(args.swap_remove(0))
}

fn const_int_args(
    func: &str,
    args: &[Monad],
    names: &[&str],
    tx: &SqlTranslator,
) -> Result<Vec<i64>> {
    let mut values = Vec::with_capacity(args.len());
    for (arg, name) in args.iter().zip(names) {
        match &arg.kind {
            MonadKind::Const(Literal::Int(value)) => values.push(*value),
            MonadKind::Const(_) | MonadKind::Method { .. } => {
                return Err(Error::invalid_type(format!(
                    "'{name}' argument of {func}() function must be of 'int' type. \
                     Got: '{}'",
                    arg.describe(tx)
                ))
                .into())
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "{func}() inside a query expects constant arguments in {{EXPR}}"
                ))
                .into())
            }
        }
    }
    Ok(values)
}

/// Variadic scalar MIN/MAX with coercion across the arguments.
fn minmax(func: Tag, args: Vec<Monad>, tx: &mut SqlTranslator) -> Result<Monad> {
    debug_assert!(args.len() > 1);
    let first = &args[0];
    if matches!(first.kind, MonadKind::Method { .. }) {
        return Err(forgot_parentheses(first.src.as_deref()).into());
    }
    let mut ty = first.value_type(tx)?;
    if !ty.is_comparable() {
        return Err(Error::invalid_type(format!(
            "Value of type '{}' is not valid as argument of '{}' function in expression {{EXPR}}",
            first.describe(tx),
            func.to_string().to_lowercase()
        ))
        .into());
    }
    for arg in &args[1..] {
        if matches!(arg.kind, MonadKind::Method { .. }) {
            return Err(forgot_parentheses(arg.src.as_deref()).into());
        }
        let arg_ty = arg.value_type(tx)?;
        ty = match coerce_types(&ty, &arg_ty) {
            Some(ty) => ty,
            None => {
                return Err(Error::incomparable(
                    ty.describe(tx.schema()),
                    arg_ty.describe(tx.schema()),
                )
                .into())
            }
        };
    }
    let sq = tx.subquery;
    let mut operands = Vec::with_capacity(args.len());
    for arg in &args {
        operands.push(arg.getsql(tx, sq)?.into_only()?);
    }
    let children: Vec<&Monad> = args.iter().collect();
    Ok(Monad::inheriting(
        MonadKind::Expr {
            ty,
            sql: SqlAst::Node(func, operands),
        },
        &children,
    ))
}

fn call_method(
    parent: Monad,
    name: &str,
    mut args: Vec<Monad>,
    kwargs: Vec<(String, Monad)>,
    tx: &mut SqlTranslator,
) -> Result<Monad> {
    no_keywords(name, &kwargs)?;
    match (&parent.kind, name) {
        (MonadKind::Func(Builtin::Date), "today") => {
            if !args.is_empty() {
                return Err(arity_error("today", "no arguments", args.len()));
            }
            Ok(Monad::expr(Ty::Date, SqlAst::Node(Tag::Today, vec![])))
        }
        (MonadKind::Func(Builtin::Datetime), "now") => {
            if !args.is_empty() {
                return Err(arity_error("now", "no arguments", args.len()));
            }
            Ok(Monad::expr(Ty::Datetime, SqlAst::Node(Tag::Now, vec![])))
        }
        (MonadKind::AttrSet { .. }, "distinct") => {
            if !args.is_empty() {
                return Err(arity_error("distinct", "no arguments", args.len()));
            }
            Ok(parent.attrset_distinct())
        }
        (MonadKind::QuerySet(_), "count") => {
            if !args.is_empty() {
                return Err(arity_error("count", "no arguments", args.len()));
            }
            parent.count(tx)
        }
        (MonadKind::QuerySet(_), "sum") => parent.aggregate(Tag::Sum, tx),
        (MonadKind::QuerySet(_), "avg") => parent.aggregate(Tag::Avg, tx),
        (MonadKind::QuerySet(_), "min") => parent.aggregate(Tag::Min, tx),
        (MonadKind::QuerySet(_), "max") => parent.aggregate(Tag::Max, tx),
        (MonadKind::Entity(_), "select") => Err(Error::invalid_type(
            "select() on an entity expects a single lambda argument in {EXPR}".to_string(),
        )
        .into()),
        (_, "upper") | (_, "lower") => {
            if !args.is_empty() {
                return Err(arity_error(name, "no arguments", args.len()));
            }
            let tag = if name == "upper" { Tag::Upper } else { Tag::Lower };
            let sq = tx.subquery;
            let sql = parent.getsql(tx, sq)?.into_only()?;
            Ok(Monad::inheriting(
                MonadKind::Expr {
                    ty: Ty::Str,
                    sql: SqlAst::Node(tag, vec![sql]),
                },
                &[&parent],
            ))
        }
        (_, "startswith") | (_, "endswith") => {
            if args.len() != 1 {
                return Err(arity_error(name, "exactly 1 argument", args.len()));
            }
            let arg = args.swap_remove(0);
            string_affix_match(parent, arg, name == "startswith", tx)
        }
        (_, "strip") | (_, "lstrip") | (_, "rstrip") => {
            if args.len() > 1 {
                return Err(arity_error(name, "at most 1 argument", args.len()));
            }
            let tag = match name {
                "strip" => Tag::Trim,
                "lstrip" => Tag::Ltrim,
                _ => Tag::Rtrim,
            };
            let chars = args.pop();
            string_strip(parent, chars, tag, tx)
        }
        _ => Err(Error::unknown_attribute(parent.describe(tx), name.to_string()).into()),
    }
}

fn string_affix_match(
    parent: Monad,
    arg: Monad,
    prefix: bool,
    tx: &mut SqlTranslator,
) -> Result<Monad> {
    check_comparable(tx, &parent, &arg, Comparison::Pattern)?;
    let sq = tx.subquery;
    let arg_sql = match &arg.kind {
        MonadKind::Const(Literal::String(value)) => {
            let pattern = if prefix {
                format!("{value}%")
            } else {
                format!("%{value}")
            };
            SqlAst::Value(Literal::String(pattern))
        }
        _ => {
            let inner = arg.getsql(tx, sq)?.into_only()?;
            let percent = SqlAst::Value(Literal::String("%".to_string()));
            let operands = if prefix {
                vec![inner, percent]
            } else {
                vec![percent, inner]
            };
            SqlAst::Node(Tag::Concat, operands)
        }
    };
    let parent_sql = parent.getsql(tx, sq)?.into_only()?;
    Ok(Monad::inheriting(
        MonadKind::BoolExpr(SqlAst::Node(Tag::Like, vec![parent_sql, arg_sql])),
        &[&parent, &arg],
    ))
}

fn string_strip(
    parent: Monad,
    chars: Option<Monad>,
    tag: Tag,
    tx: &mut SqlTranslator,
) -> Result<Monad> {
    if let Some(chars) = &chars {
        check_comparable(tx, &parent, chars, Comparison::Pattern)?;
    }
    let sq = tx.subquery;
    let mut operands = vec![parent.getsql(tx, sq)?.into_only()?];
    let mut children = vec![&parent];
    if let Some(chars) = &chars {
        operands.push(chars.getsql(tx, sq)?.into_only()?);
        children.push(chars);
    }
    Ok(Monad::inheriting(
        MonadKind::Expr {
            ty: Ty::Str,
            sql: SqlAst::Node(tag, operands),
        },
        &children,
    ))
}
