//! The monad algebra: typed IR nodes for partially-translated expressions.
//!
//! Every monad is a value kind from the input language lifted into SQL
//! space. Operations return new monads; joins and conditions they need are
//! materialised lazily through the translator frame they receive. Scalar
//! flavours (numeric, string, date, …) share variants and dispatch on the
//! carried [Ty].

use enum_as_inner::EnumAsInner;

use crate::ast::{BinOp, CmpOp, Literal};
use crate::error::{forgot_parentheses, Error, Result};
use crate::schema::{AttrRef, EntityId};
use crate::sql::ast::{sqland, sqlor, sql_negation, ParamKey, SqlAst, Tag};
use crate::sql::scope::SubqueryId;
use crate::sql::translator::{SqlTranslator, Translation};
use crate::types::{
    are_comparable_types, coerce_types, type_of_literal, Comparison, Ty,
};
use crate::utils::IntoOnly;

#[derive(Debug, Clone)]
pub struct Monad {
    pub kind: MonadKind,
    /// Carries a pre-aggregated scalar; routes conditions to HAVING.
    pub aggregated: bool,
    /// Carries an already-grouped subquery; excluded from GROUP BY.
    pub nogroup: bool,
    /// Rendered source of the node this monad was lifted from.
    pub src: Option<String>,
}

#[derive(Debug, Clone, EnumAsInner)]
pub enum MonadKind {
    /// A bound iteration variable; values are the PK tuple of its tableref.
    ObjectIter { path: String, entity: EntityId },
    /// A scalar attribute access `x.a`.
    Attr {
        parent: Box<Monad>,
        attr: AttrRef,
        ty: Ty,
    },
    /// An entity-valued attribute access; owns a lazily-joined tableref.
    ObjectAttr {
        parent: Box<Monad>,
        attr: AttrRef,
        entity: EntityId,
        path: String,
    },
    /// A value supplied from outside the query.
    Param { key: ParamKey, ty: Ty },
    /// A literal.
    Const(Literal),
    /// A computed SQL scalar.
    Expr { ty: Ty, sql: SqlAst },
    /// A tuple of monads.
    List(Vec<Monad>),
    /// An entity class reference.
    Entity(EntityId),
    /// A bound method awaiting its call.
    Method { parent: Box<Monad>, name: String },
    /// A built-in function usable inside queries.
    Func(crate::sql::functions::Builtin),
    /// An already-lowered boolean expression.
    BoolExpr(SqlAst),
    Cmp {
        op: CmpOp,
        left: Box<Monad>,
        right: Box<Monad>,
    },
    And(Vec<Monad>),
    Or(Vec<Monad>),
    Not(Box<Monad>),
    /// A traversed collection `x.items`, possibly chained.
    AttrSet {
        parent: Box<Monad>,
        attr: AttrRef,
        forced_distinct: bool,
    },
    /// Binary arithmetic involving a collection, awaiting aggregation.
    NumericSetExpr {
        op: BinOp,
        sqlop: Tag,
        left: Box<Monad>,
        right: Box<Monad>,
        ty: Ty,
    },
    /// A nested comprehension wrapped as a set.
    QuerySet(Box<Translation>),
    /// An ordering key marked descending.
    Desc(Box<Monad>),
}

/// OR-combines the aggregation flags of operand monads; parents inherit
/// them unless they are aggregates themselves.
pub fn inherit_flags(children: &[&Monad]) -> (bool, bool) {
    (
        children.iter().any(|m| m.aggregated),
        children.iter().any(|m| m.nogroup),
    )
}

impl Monad {
    pub fn new(kind: MonadKind) -> Monad {
        Monad {
            kind,
            aggregated: false,
            nogroup: false,
            src: None,
        }
    }

    pub fn inheriting(kind: MonadKind, children: &[&Monad]) -> Monad {
        let (aggregated, nogroup) = inherit_flags(children);
        Monad {
            kind,
            aggregated,
            nogroup,
            src: None,
        }
    }

    pub fn expr(ty: Ty, sql: SqlAst) -> Monad {
        Monad::new(MonadKind::Expr { ty, sql })
    }

    pub fn constant(value: Literal) -> Monad {
        Monad::new(MonadKind::Const(value))
    }

    /// The normalized type of the value this monad stands for. Bound
    /// methods and function references have none; using them as values is
    /// the "forgot parentheses" diagnostic.
    pub fn value_type(&self, tx: &SqlTranslator) -> Result<Ty> {
        let schema = tx.schema();
        Ok(match &self.kind {
            MonadKind::ObjectIter { entity, .. } => Ty::Entity(*entity),
            MonadKind::ObjectAttr { entity, .. } => Ty::Entity(*entity),
            MonadKind::Attr { ty, .. } => ty.clone(),
            MonadKind::Param { ty, .. } => ty.clone(),
            MonadKind::Const(value) => type_of_literal(value),
            MonadKind::Expr { ty, .. } => ty.clone(),
            MonadKind::List(items) => Ty::Row(
                items
                    .iter()
                    .map(|m| m.value_type(tx))
                    .collect::<Result<Vec<_>>>()?,
            ),
            MonadKind::Entity(entity) => Ty::set_of(Ty::Entity(*entity)),
            MonadKind::Method { .. } => {
                return Err(forgot_parentheses(self.src.as_deref()).into())
            }
            MonadKind::Func(builtin) => {
                return Err(Error::invalid_type(format!(
                    "Function '{}' cannot be used as a value in {{EXPR}}",
                    builtin.name()
                ))
                .into())
            }
            MonadKind::BoolExpr(_)
            | MonadKind::Cmp { .. }
            | MonadKind::And(_)
            | MonadKind::Or(_)
            | MonadKind::Not(_) => Ty::Bool,
            MonadKind::AttrSet { attr, .. } => Ty::set_of(schema.attr(*attr).ty.clone()),
            MonadKind::NumericSetExpr { ty, .. } => ty.clone(),
            MonadKind::QuerySet(sub) => Ty::set_of(sub.expr_type.clone()),
            MonadKind::Desc(inner) => inner.value_type(tx)?,
        })
    }

    /// Diagnostic name of the monad's type.
    pub fn describe(&self, tx: &SqlTranslator) -> String {
        match &self.kind {
            MonadKind::Method { .. } => "method".to_string(),
            MonadKind::Func(builtin) => format!("function {}", builtin.name()),
            _ => match self.value_type(tx) {
                Ok(ty) => ty.describe(tx.schema()),
                Err(_) => "unknown".to_string(),
            },
        }
    }

    fn is_boolean(&self) -> bool {
        matches!(
            self.kind,
            MonadKind::BoolExpr(_)
                | MonadKind::Cmp { .. }
                | MonadKind::And(_)
                | MonadKind::Or(_)
                | MonadKind::Not(_)
        )
    }

    /// Name path of the tableref this monad is bound to, for object kinds.
    pub(super) fn object_path(&self) -> Option<&str> {
        match &self.kind {
            MonadKind::ObjectIter { path, .. } => Some(path),
            MonadKind::ObjectAttr { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The column expressions of this monad inside subquery `sq`.
    pub fn getsql(&self, tx: &mut SqlTranslator, sq: SubqueryId) -> Result<Vec<SqlAst>> {
        match &self.kind {
            MonadKind::ObjectIter { path, .. } => {
                let (alias, pk_columns) = tx.make_join_in(sq, path, true)?;
                Ok(columns_of(&alias, &pk_columns))
            }
            MonadKind::Attr { parent, attr, .. }
            | MonadKind::ObjectAttr { parent, attr, .. } => {
                let schema = tx.schema();
                let attribute = schema.attr(*attr);
                let owner = schema.entity(attr.entity);
                let pk_only = attribute.pk_offset.is_some();
                let attr_columns = attribute.columns.clone();
                let columns_offset = attribute.pk_columns_offset;
                let owner_composite = owner.pk_is_composite();
                let parent_path = parent
                    .object_path()
                    .ok_or_else(|| {
                        Error::unsupported(
                            "attribute access on an external entity parameter \
                             is not supported in {EXPR}"
                                .to_string(),
                        )
                    })?
                    .to_string();
                let (alias, parent_columns) = tx.make_join_in(sq, &parent_path, pk_only)?;
                let columns = if !pk_only {
                    attr_columns
                } else if !owner_composite {
                    parent_columns
                } else {
                    parent_columns[columns_offset..columns_offset + attr_columns.len()].to_vec()
                };
                Ok(columns_of(&alias, &columns))
            }
            MonadKind::Param { key, ty } => match ty {
                Ty::Entity(entity) => {
                    let types = tx.schema().entity(*entity).pk_column_types(tx.schema());
                    Ok(types
                        .into_iter()
                        .enumerate()
                        .map(|(i, ty)| {
                            SqlAst::Param(ParamKey::indexed(key.src.clone(), i), ty)
                        })
                        .collect())
                }
                _ => Ok(vec![SqlAst::Param(key.clone(), ty.clone())]),
            },
            MonadKind::Const(value) => Ok(vec![SqlAst::Value(value.clone())]),
            MonadKind::Expr { sql, .. } => Ok(vec![sql.clone()]),
            MonadKind::List(items) => {
                let mut columns = Vec::new();
                for item in items {
                    columns.extend(item.getsql(tx, sq)?);
                }
                Ok(columns)
            }
            MonadKind::Entity(_) => Err(Error::invalid_type(
                "entity class cannot be used as a value in {EXPR}".to_string(),
            )
            .into()),
            MonadKind::Method { .. } => Err(forgot_parentheses(self.src.as_deref()).into()),
            MonadKind::Func(_) => {
                self.value_type(tx)?;
                unreachable!("value_type rejects function references")
            }
            MonadKind::BoolExpr(sql) => Ok(vec![sql.clone()]),
            MonadKind::Cmp { op, left, right } => {
                Ok(vec![cmp_getsql(tx, sq, *op, left, right)?])
            }
            MonadKind::And(operands) => {
                let mut items = Vec::with_capacity(operands.len());
                for operand in operands {
                    items.push(operand.getsql(tx, sq)?.into_only()?);
                }
                Ok(vec![SqlAst::Node(Tag::And, items)])
            }
            MonadKind::Or(operands) => {
                let mut items = Vec::with_capacity(operands.len());
                for operand in operands {
                    items.push(operand.getsql(tx, sq)?.into_only()?);
                }
                Ok(vec![SqlAst::Node(Tag::Or, items)])
            }
            MonadKind::Not(operand) => {
                let inner = operand.getsql(tx, sq)?.into_only()?;
                Ok(vec![SqlAst::Node(Tag::Not, vec![inner])])
            }
            MonadKind::Desc(inner) => Ok(inner
                .getsql(tx, sq)?
                .into_iter()
                .map(|item| SqlAst::Node(Tag::Desc, vec![item]))
                .collect()),
            MonadKind::AttrSet { .. }
            | MonadKind::NumericSetExpr { .. }
            | MonadKind::QuerySet(_) => self.set_getsql(tx, sq),
        }
    }

    pub fn getsql_here(&self, tx: &mut SqlTranslator) -> Result<Vec<SqlAst>> {
        let sq = tx.subquery;
        self.getsql(tx, sq)
    }

    /// Comparison; containment goes through [Monad::contains] instead.
    pub fn cmp(self, op: CmpOp, other: Monad, tx: &mut SqlTranslator) -> Result<Monad> {
        debug_assert!(!matches!(op, CmpOp::In | CmpOp::NotIn));
        if let MonadKind::AttrSet { .. } = &self.kind {
            // Set-to-set comparison may be well-typed but has no SQL
            // rendering.
            let left_ty = self.value_type(tx)?;
            let right_ty = other.value_type(tx)?;
            let compatible = match (&left_ty, &right_ty) {
                (Ty::Set(a), Ty::Set(b)) => {
                    are_comparable_types(tx.schema(), a, b, Comparison::Equality)
                }
                _ => left_ty == right_ty,
            };
            if !compatible {
                check_comparable(tx, &self, &other, Comparison::Equality)?;
            }
            return Err(
                Error::unsupported("comparison of collections is not supported in {EXPR}").into(),
            );
        }
        let category = match op {
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => Comparison::Ordering,
            _ => Comparison::Equality,
        };
        check_comparable(tx, &self, &other, category)?;
        let (mut left, mut right) = (self, other);
        let mut op = op;
        let left_ty = left.value_type(tx)?;
        let right_ty = right.value_type(tx)?;
        if left_ty == Ty::None && right_ty == Ty::None {
            return Err(Error::invalid_type(
                "cannot compare None with None in {EXPR}".to_string(),
            )
            .into());
        }
        if left_ty == Ty::None {
            std::mem::swap(&mut left, &mut right);
        }
        let right_is_none = right.value_type(tx)? == Ty::None;
        op = if right_is_none {
            match op {
                CmpOp::Eq => CmpOp::Is,
                CmpOp::Ne => CmpOp::IsNot,
                other => other,
            }
        } else {
            match op {
                CmpOp::Is => CmpOp::Eq,
                CmpOp::IsNot => CmpOp::Ne,
                other => other,
            }
        };
        Ok(Monad::inheriting(
            MonadKind::Cmp {
                op,
                left: Box::new(left.clone()),
                right: Box::new(right.clone()),
            },
            &[&left, &right],
        ))
    }

    /// `item in self` / `item not in self`, dispatching on the container.
    pub fn contains(self, item: Monad, not_in: bool, tx: &mut SqlTranslator) -> Result<Monad> {
        match &self.kind {
            MonadKind::Method { .. } => {
                return Err(forgot_parentheses(self.src.as_deref()).into())
            }
            MonadKind::List(_) => return self.list_contains(item, not_in, tx),
            MonadKind::AttrSet { .. } => return self.attrset_contains(item, not_in, tx),
            MonadKind::QuerySet(_) => return self.queryset_contains(item, not_in, tx),
            _ => {}
        }
        if self.value_type(tx)? == Ty::Str {
            return self.string_contains(item, not_in, tx);
        }
        Err(Error::invalid_type(format!(
            "'in' is not supported for values of type '{}' in {{EXPR}}",
            self.describe(tx)
        ))
        .into())
    }

    fn list_contains(self, item: Monad, not_in: bool, tx: &mut SqlTranslator) -> Result<Monad> {
        let items = match &self.kind {
            MonadKind::List(items) => items,
            _ => unreachable!(),
        };
        for element in items {
            check_comparable(tx, element, &item, Comparison::Equality)?;
        }
        let sq = tx.subquery;
        let left_sql = item.getsql(tx, sq)?;
        let sql = if left_sql.len() == 1 {
            let tag = if not_in { Tag::NotIn } else { Tag::In };
            let mut operands = vec![left_sql.into_only()?];
            for element in items {
                operands.push(element.getsql(tx, sq)?.into_only()?);
            }
            SqlAst::Node(tag, operands)
        } else if not_in {
            let mut conjuncts = Vec::new();
            for element in items {
                let element_sql = element.getsql(tx, sq)?;
                conjuncts.push(sqlor(
                    left_sql
                        .iter()
                        .zip(element_sql)
                        .map(|(a, b)| SqlAst::Node(Tag::Ne, vec![a.clone(), b]))
                        .collect(),
                ));
            }
            sqland(conjuncts)
        } else {
            let mut disjuncts = Vec::new();
            for element in items {
                let element_sql = element.getsql(tx, sq)?;
                disjuncts.push(sqland(
                    left_sql
                        .iter()
                        .zip(element_sql)
                        .map(|(a, b)| SqlAst::eq(a.clone(), b))
                        .collect(),
                ));
            }
            sqlor(disjuncts)
        };
        Ok(Monad::inheriting(
            MonadKind::BoolExpr(sql),
            &[&item, &self],
        ))
    }

    fn string_contains(self, item: Monad, not_in: bool, tx: &mut SqlTranslator) -> Result<Monad> {
        check_comparable(tx, &item, &self, Comparison::Pattern)?;
        let sq = tx.subquery;
        let item_sql = match &item.kind {
            MonadKind::Const(Literal::String(value)) => {
                SqlAst::Value(Literal::String(format!("%{value}%")))
            }
            _ => SqlAst::Node(
                Tag::Concat,
                vec![
                    SqlAst::Value(Literal::String("%".to_string())),
                    item.getsql(tx, sq)?.into_only()?,
                    SqlAst::Value(Literal::String("%".to_string())),
                ],
            ),
        };
        let tag = if not_in { Tag::NotLike } else { Tag::Like };
        let sql = SqlAst::Node(tag, vec![self.getsql(tx, sq)?.into_only()?, item_sql]);
        Ok(Monad::inheriting(
            MonadKind::BoolExpr(sql),
            &[&item, &self],
        ))
    }

    /// Truthiness of the monad as a boolean condition.
    pub fn nonzero(self, tx: &mut SqlTranslator) -> Result<Monad> {
        if self.is_boolean() {
            return Ok(self);
        }
        match &self.kind {
            MonadKind::Method { .. } => Err(forgot_parentheses(self.src.as_deref()).into()),
            MonadKind::AttrSet { .. } => self.attrset_exists(tx, false),
            MonadKind::QuerySet(_) => self.queryset_exists(tx, false),
            _ => {
                let ty = self.value_type(tx)?;
                if ty.is_numeric() {
                    self.cmp(CmpOp::Ne, Monad::constant(Literal::Int(0)), tx)
                } else if ty == Ty::Str {
                    let sq = tx.subquery;
                    let sql = self.getsql(tx, sq)?.into_only()?;
                    Ok(Monad::inheriting(
                        MonadKind::BoolExpr(SqlAst::Node(
                            Tag::Gt,
                            vec![
                                SqlAst::Node(Tag::Length, vec![sql]),
                                SqlAst::Value(Literal::Int(0)),
                            ],
                        )),
                        &[&self],
                    ))
                } else {
                    Err(Error::invalid_type(format!(
                        "expression of type '{}' has no truth value in {{EXPR}}",
                        self.describe(tx)
                    ))
                    .into())
                }
            }
        }
    }

    /// Smart boolean negation.
    pub fn negate(self, tx: &mut SqlTranslator) -> Result<Monad> {
        match &self.kind {
            MonadKind::AttrSet { .. } => return self.attrset_exists(tx, true),
            MonadKind::QuerySet(_) => return self.queryset_exists(tx, true),
            _ => {}
        }
        match self.kind {
            MonadKind::Method { .. } => Err(forgot_parentheses(self.src.as_deref()).into()),
            MonadKind::BoolExpr(sql) => {
                let negated = match &sql {
                    SqlAst::Node(tag, items) => match sql_negation(*tag) {
                        Some(negated_tag) => Some(SqlAst::Node(negated_tag, items.clone())),
                        None if *tag == Tag::Not && items.len() == 1 => {
                            Some(items[0].clone())
                        }
                        None => None,
                    },
                    _ => None,
                };
                Ok(Monad {
                    kind: match negated {
                        Some(negated) => MonadKind::BoolExpr(negated),
                        None => MonadKind::Not(Box::new(Monad {
                            kind: MonadKind::BoolExpr(sql),
                            aggregated: self.aggregated,
                            nogroup: self.nogroup,
                            src: self.src.clone(),
                        })),
                    },
                    aggregated: self.aggregated,
                    nogroup: self.nogroup,
                    src: self.src,
                })
            }
            MonadKind::Cmp { op, left, right } => (*left).cmp(op.negated(), *right, tx),
            MonadKind::Not(operand) => Ok(*operand),
            kind => {
                let monad = Monad {
                    kind,
                    aggregated: self.aggregated,
                    nogroup: self.nogroup,
                    src: self.src,
                };
                if monad.value_type(tx)?.is_numeric() {
                    return monad.cmp(CmpOp::Eq, Monad::constant(Literal::Int(0)), tx);
                }
                let operand = if monad.is_boolean() || monad.value_type(tx)? == Ty::Bool {
                    monad
                } else {
                    monad.nonzero(tx)?
                };
                Ok(Monad::inheriting(
                    MonadKind::Not(Box::new(operand.clone())),
                    &[&operand],
                ))
            }
        }
    }

    /// Attribute access: entity attributes, date parts, or a bound method.
    pub fn getattr(self, name: &str, tx: &mut SqlTranslator) -> Result<Monad> {
        use crate::sql::functions::Builtin;
        match &self.kind {
            MonadKind::Method { .. } => {
                return Err(forgot_parentheses(self.src.as_deref()).into())
            }
            MonadKind::Func(Builtin::Date) if name == "today" => {
                return Ok(self.bind_method(name))
            }
            MonadKind::Func(Builtin::Datetime) if name == "now" => {
                return Ok(self.bind_method(name))
            }
            MonadKind::AttrSet { .. } => return self.attrset_getattr(name, tx),
            MonadKind::QuerySet(_)
                if matches!(name, "count" | "sum" | "min" | "max" | "avg") =>
            {
                return Ok(self.bind_method(name))
            }
            _ => {}
        }
        let ty = self.value_type(tx)?;
        match ty {
            Ty::Entity(entity) => {
                let schema = tx.schema();
                let attr = schema.attr_ref(entity, name).ok_or_else(|| {
                    Error::unknown_attribute(
                        schema.entity(entity).name.clone(),
                        name.to_string(),
                    )
                })?;
                if schema.attr(attr).is_collection {
                    Ok(Monad::inheriting(
                        MonadKind::AttrSet {
                            parent: Box::new(self.clone()),
                            attr,
                            forced_distinct: false,
                        },
                        &[&self],
                    ))
                } else {
                    attr_monad(tx, self, attr)
                }
            }
            Ty::Date | Ty::Datetime => {
                let tag = match (name, &ty) {
                    ("year", _) => Tag::Year,
                    ("month", _) => Tag::Month,
                    ("day", _) => Tag::Day,
                    ("hour", Ty::Datetime) => Tag::Hour,
                    ("minute", Ty::Datetime) => Tag::Minute,
                    ("second", Ty::Datetime) => Tag::Second,
                    _ => {
                        return Err(Error::unknown_attribute(
                            self.describe(tx),
                            name.to_string(),
                        )
                        .into())
                    }
                };
                let sq = tx.subquery;
                let sql = self.getsql(tx, sq)?.into_only()?;
                Ok(Monad::inheriting(
                    MonadKind::Expr {
                        ty: Ty::Int,
                        sql: SqlAst::Node(tag, vec![sql]),
                    },
                    &[&self],
                ))
            }
            Ty::Str if crate::sql::functions::is_string_method(name) => {
                Ok(self.bind_method(name))
            }
            _ => Err(Error::unknown_attribute(self.describe(tx), name.to_string()).into()),
        }
    }

    pub(super) fn bind_method(self, name: &str) -> Monad {
        let src = self.src.clone();
        Monad {
            kind: MonadKind::Method {
                parent: Box::new(self),
                name: name.to_string(),
            },
            aggregated: false,
            nogroup: false,
            src,
        }
    }

    /// Binary arithmetic; `+` doubles as string concatenation.
    pub fn binop(self, op: BinOp, other: Monad, tx: &mut SqlTranslator) -> Result<Monad> {
        if matches!(other.kind, MonadKind::Method { .. }) {
            return Err(forgot_parentheses(other.src.as_deref()).into());
        }
        if matches!(self.kind, MonadKind::Method { .. }) {
            return Err(forgot_parentheses(self.src.as_deref()).into());
        }
        let involves_set = |m: &Monad| {
            matches!(
                m.kind,
                MonadKind::AttrSet { .. } | MonadKind::NumericSetExpr { .. }
            )
        };
        if involves_set(&self) || involves_set(&other) {
            return numeric_set_expr(op, self, other, tx);
        }
        let left_ty = self.value_type(tx)?;
        let right_ty = other.value_type(tx)?;
        if left_ty == Ty::Str || right_ty == Ty::Str {
            if op != BinOp::Add
                || !are_comparable_types(tx.schema(), &left_ty, &right_ty, Comparison::Pattern)
            {
                return Err(binop_type_error(tx, &self, &other, op));
            }
            let sq = tx.subquery;
            let left_sql = self.getsql(tx, sq)?.into_only()?;
            let right_sql = other.getsql(tx, sq)?.into_only()?;
            return Ok(Monad::inheriting(
                MonadKind::Expr {
                    ty: Ty::Str,
                    sql: SqlAst::Node(Tag::Concat, vec![left_sql, right_sql]),
                },
                &[&self, &other],
            ));
        }
        let result_type = match coerce_types(&left_ty, &right_ty) {
            Some(ty) if ty.is_numeric() => ty,
            _ => return Err(binop_type_error(tx, &self, &other, op)),
        };
        let (tag, result_type) = match op {
            BinOp::Add => (Tag::Add, result_type),
            BinOp::Sub => (Tag::Sub, result_type),
            BinOp::Mul => (Tag::Mul, result_type),
            BinOp::Div => (Tag::Div, result_type),
            BinOp::Pow => (Tag::Pow, Ty::Float),
        };
        let sq = tx.subquery;
        let left_sql = self.getsql(tx, sq)?.into_only()?;
        let right_sql = other.getsql(tx, sq)?.into_only()?;
        Ok(Monad::inheriting(
            MonadKind::Expr {
                ty: result_type,
                sql: SqlAst::Node(tag, vec![left_sql, right_sql]),
            },
            &[&self, &other],
        ))
    }

    /// Unary minus; numeric only.
    pub fn neg(self, tx: &mut SqlTranslator) -> Result<Monad> {
        let ty = self.value_type(tx)?;
        if !ty.is_numeric() {
            return Err(Error::invalid_type(format!(
                "unary minus is not defined for type '{}' in {{EXPR}}",
                self.describe(tx)
            ))
            .into());
        }
        let sq = tx.subquery;
        let sql = self.getsql(tx, sq)?.into_only()?;
        Ok(Monad::inheriting(
            MonadKind::Expr {
                ty,
                sql: SqlAst::Node(Tag::Neg, vec![sql]),
            },
            &[&self],
        ))
    }

    pub fn abs(self, tx: &mut SqlTranslator) -> Result<Monad> {
        let ty = self.value_type(tx)?;
        if !ty.is_numeric() {
            return Err(Error::invalid_type(format!(
                "abs() is not defined for type '{}' in {{EXPR}}",
                self.describe(tx)
            ))
            .into());
        }
        let sq = tx.subquery;
        let sql = self.getsql(tx, sq)?.into_only()?;
        Ok(Monad::inheriting(
            MonadKind::Expr {
                ty,
                sql: SqlAst::Node(Tag::Abs, vec![sql]),
            },
            &[&self],
        ))
    }

    /// `len(x)`: string length, or counting for collections.
    pub fn length(self, tx: &mut SqlTranslator) -> Result<Monad> {
        match &self.kind {
            MonadKind::AttrSet { .. } | MonadKind::QuerySet(_) => return self.count(tx),
            MonadKind::Const(Literal::String(value)) => {
                return Ok(Monad::constant(Literal::Int(value.chars().count() as i64)))
            }
            _ => {}
        }
        if self.value_type(tx)? != Ty::Str {
            return Err(Error::invalid_type(format!(
                "len() is not defined for type '{}' in {{EXPR}}",
                self.describe(tx)
            ))
            .into());
        }
        let sq = tx.subquery;
        let sql = self.getsql(tx, sq)?.into_only()?;
        Ok(Monad::inheriting(
            MonadKind::Expr {
                ty: Ty::Int,
                sql: SqlAst::Node(Tag::Length, vec![sql]),
            },
            &[&self],
        ))
    }

    /// `count(x)`.
    pub fn count(self, tx: &mut SqlTranslator) -> Result<Monad> {
        match &self.kind {
            MonadKind::AttrSet { .. } => self.attrset_count(tx),
            MonadKind::QuerySet(_) => self.queryset_count(tx),
            MonadKind::Method { .. } => Err(forgot_parentheses(self.src.as_deref()).into()),
            _ => self.scalar_count(tx),
        }
    }

    fn scalar_count(self, tx: &mut SqlTranslator) -> Result<Monad> {
        if self.aggregated {
            return Err(Error::translation(
                "Aggregated functions cannot be nested. Got: {EXPR}".to_string(),
            )
            .into());
        }
        let ty = self.value_type(tx)?;
        let sq = tx.subquery;
        let mut expr = self.getsql(tx, sq)?;
        let (kind, argument) = if ty == Ty::Bool {
            let condition = expr.into_only()?;
            (
                Tag::All,
                SqlAst::Node(
                    Tag::Case,
                    vec![
                        condition,
                        SqlAst::Value(Literal::Int(1)),
                        SqlAst::Value(Literal::Null),
                    ],
                ),
            )
        } else if expr.len() == 1 {
            (Tag::Distinct, expr.swap_remove(0))
        } else if tx.ctx.dialect.count_distinct_row() {
            (Tag::Distinct, SqlAst::Node(Tag::Row, expr))
        } else if let (Some(rowid), Some(path)) =
            (tx.ctx.dialect.rowid(), self.object_path().map(String::from))
        {
            let (alias, _) = tx.make_join_in(sq, &path, false)?;
            (Tag::Distinct, SqlAst::Column(alias, rowid.to_string()))
        } else {
            return Err(composite_aggregate_error(tx));
        };
        let mut result = Monad::expr(
            Ty::Int,
            SqlAst::Node(Tag::Count, vec![SqlAst::Node(kind, vec![argument])]),
        );
        result.aggregated = true;
        Ok(result)
    }

    /// SUM/AVG/MIN/MAX.
    pub fn aggregate(self, func: Tag, tx: &mut SqlTranslator) -> Result<Monad> {
        match &self.kind {
            MonadKind::AttrSet { .. } => self.attrset_aggregate(func, tx),
            MonadKind::QuerySet(_) => self.queryset_aggregate(func, tx),
            MonadKind::NumericSetExpr { .. } => self.numeric_set_aggregate(func, tx),
            MonadKind::Method { .. } => Err(forgot_parentheses(self.src.as_deref()).into()),
            _ => self.scalar_aggregate(func, tx),
        }
    }

    fn scalar_aggregate(self, func: Tag, tx: &mut SqlTranslator) -> Result<Monad> {
        if self.aggregated {
            return Err(Error::translation(
                "Aggregated functions cannot be nested. Got: {EXPR}".to_string(),
            )
            .into());
        }
        let ty = self.value_type(tx)?;
        check_aggregate_type(tx, func, &ty, &self)?;
        let sq = tx.subquery;
        let mut expr = self.getsql(tx, sq)?;
        let argument = if expr.len() == 1 {
            expr.swap_remove(0)
        } else if tx.ctx.dialect.row_value_syntax() {
            SqlAst::Node(Tag::Row, expr)
        } else {
            return Err(composite_aggregate_error(tx));
        };
        let result_type = if func == Tag::Avg { Ty::Float } else { ty };
        let mut result = Monad::expr(result_type, SqlAst::Node(func, vec![argument]));
        result.aggregated = true;
        Ok(result)
    }

    /// String indexing, lowered to one-character `SUBSTR`. SQL positions
    /// are 1-based, so non-negative indices are shifted by one.
    pub fn index(self, index: Monad, tx: &mut SqlTranslator) -> Result<Monad> {
        if matches!(self.kind, MonadKind::Method { .. }) {
            return Err(forgot_parentheses(self.src.as_deref()).into());
        }
        if self.value_type(tx)? != Ty::Str {
            return Err(Error::invalid_type(format!(
                "'{}' object does not support indexing in {{EXPR}}",
                self.describe(tx)
            ))
            .into());
        }
        if matches!(index.kind, MonadKind::List(_)) {
            return Err(Error::invalid_type(
                "String index must be of 'int' type. Got 'tuple' in {EXPR}".to_string(),
            )
            .into());
        }
        if let (MonadKind::Const(Literal::String(value)), MonadKind::Const(Literal::Int(i))) =
            (&self.kind, &index.kind)
        {
            let chars: Vec<char> = value.chars().collect();
            let position = if *i < 0 { chars.len() as i64 + i } else { *i };
            let folded = usize::try_from(position)
                .ok()
                .and_then(|p| chars.get(p))
                .ok_or_else(|| {
                    Error::invalid_type("string index out of range in {EXPR}".to_string())
                })?;
            return Ok(Monad::constant(Literal::String(folded.to_string())));
        }
        if index.value_type(tx)? != Ty::Int {
            return Err(Error::invalid_type(format!(
                "String indices must be integers. Got '{}' in expression {{EXPR}}",
                index.describe(tx)
            ))
            .into());
        }
        let sq = tx.subquery;
        let expr_sql = self.getsql(tx, sq)?.into_only()?;
        let index_sql = match &index.kind {
            MonadKind::Const(Literal::Int(value)) => {
                let value = if *value >= 0 { value + 1 } else { *value };
                SqlAst::Value(Literal::Int(value))
            }
            _ => {
                let inner = index.getsql(tx, sq)?.into_only()?;
                // Shift only non-negative indices; negative ones address
                // the string from its end.
                SqlAst::Node(
                    Tag::Add,
                    vec![
                        inner.clone(),
                        SqlAst::Node(
                            Tag::Case,
                            vec![
                                SqlAst::Node(
                                    Tag::Ge,
                                    vec![inner, SqlAst::Value(Literal::Int(0))],
                                ),
                                SqlAst::Value(Literal::Int(1)),
                                SqlAst::Value(Literal::Int(0)),
                            ],
                        ),
                    ],
                )
            }
        };
        Ok(Monad::inheriting(
            MonadKind::Expr {
                ty: Ty::Str,
                sql: SqlAst::Node(
                    Tag::Substr,
                    vec![expr_sql, index_sql, SqlAst::Value(Literal::Int(1))],
                ),
            },
            &[&self, &index],
        ))
    }

    /// String slicing, lowered to `SUBSTR(expr, start, length)`. Negative
    /// bounds are rejected.
    pub fn slice(
        self,
        lower: Option<Monad>,
        upper: Option<Monad>,
        tx: &mut SqlTranslator,
    ) -> Result<Monad> {
        if self.value_type(tx)? != Ty::Str {
            return Err(Error::invalid_type(format!(
                "'{}' object does not support slicing in {{EXPR}}",
                self.describe(tx)
            ))
            .into());
        }
        if lower.is_none() && upper.is_none() {
            return Ok(self);
        }
        let const_bound = |bound: &Option<Monad>| -> Option<i64> {
            match bound {
                Some(Monad {
                    kind: MonadKind::Const(Literal::Int(value)),
                    ..
                }) => Some(*value),
                _ => None,
            }
        };
        let start_value = const_bound(&lower);
        let stop_value = const_bound(&upper);
        if start_value.map_or(false, |v| v < 0) || stop_value.map_or(false, |v| v < 0) {
            return Err(Error::unsupported(
                "Negative indices are not supported in string slice {EXPR}".to_string(),
            )
            .into());
        }
        if let MonadKind::Const(Literal::String(value)) = &self.kind {
            let both_const = (lower.is_none() || start_value.is_some())
                && (upper.is_none() || stop_value.is_some());
            if both_const {
                let chars: Vec<char> = value.chars().collect();
                let start = start_value.unwrap_or(0).min(chars.len() as i64) as usize;
                let stop = stop_value.unwrap_or(chars.len() as i64).min(chars.len() as i64);
                let stop = (stop as usize).max(start);
                let folded: String = chars[start..stop].iter().collect();
                return Ok(Monad::constant(Literal::String(folded)));
            }
        }
        for bound in lower.iter().chain(upper.iter()) {
            if bound.value_type(tx)? != Ty::Int {
                return Err(Error::invalid_type(format!(
                    "Invalid type of slice index (expected 'int', got '{}') in {{EXPR}}",
                    bound.describe(tx)
                ))
                .into());
            }
        }
        let sq = tx.subquery;
        let expr_sql = self.getsql(tx, sq)?.into_only()?;
        let mut children = vec![&self];
        children.extend(lower.iter());
        children.extend(upper.iter());
        let (aggregated, nogroup) = inherit_flags(&children);

        let start_sql = if let Some(value) = start_value {
            SqlAst::Value(Literal::Int(value + 1))
        } else if let Some(start) = &lower {
            let inner = start.getsql(tx, sq)?.into_only()?;
            SqlAst::Node(Tag::Add, vec![inner, SqlAst::Value(Literal::Int(1))])
        } else {
            SqlAst::Value(Literal::Int(1))
        };
        let len_sql = match &upper {
            None => None,
            Some(stop) => Some(if let Some(stop_v) = stop_value {
                match (start_value, &lower) {
                    (Some(start_v), _) => SqlAst::Value(Literal::Int(stop_v - start_v)),
                    (None, Some(start)) => {
                        let start_inner = start.getsql(tx, sq)?.into_only()?;
                        SqlAst::Node(
                            Tag::Sub,
                            vec![SqlAst::Value(Literal::Int(stop_v)), start_inner],
                        )
                    }
                    (None, None) => SqlAst::Value(Literal::Int(stop_v)),
                }
            } else {
                let stop_inner = stop.getsql(tx, sq)?.into_only()?;
                match (start_value, &lower) {
                    (Some(start_v), _) => SqlAst::Node(
                        Tag::Sub,
                        vec![stop_inner, SqlAst::Value(Literal::Int(start_v))],
                    ),
                    (None, Some(start)) => {
                        let start_inner = start.getsql(tx, sq)?.into_only()?;
                        SqlAst::Node(Tag::Sub, vec![stop_inner, start_inner])
                    }
                    (None, None) => stop_inner,
                }
            }),
        };
        let mut operands = vec![expr_sql, start_sql];
        operands.extend(len_sql);
        Ok(Monad {
            kind: MonadKind::Expr {
                ty: Ty::Str,
                sql: SqlAst::Node(Tag::Substr, operands),
            },
            aggregated,
            nogroup,
            src: None,
        })
    }

    pub fn requires_distinct(&self, tx: &SqlTranslator, joined: bool) -> bool {
        match &self.kind {
            MonadKind::ObjectIter { path, .. } => *path != tx.last_qual_name,
            MonadKind::ObjectAttr { parent, attr, .. } => {
                let reverse_is_collection = tx
                    .schema()
                    .reverse_of(tx.schema().attr(*attr))
                    .map(|r| r.is_collection)
                    .unwrap_or(false);
                reverse_is_collection || parent.requires_distinct(tx, joined)
            }
            MonadKind::AttrSet { .. } => self.attrset_requires_distinct(tx, joined, false),
            _ => false,
        }
    }
}

pub(super) fn columns_of(alias: &str, columns: &[String]) -> Vec<SqlAst> {
    columns
        .iter()
        .map(|c| SqlAst::Column(alias.to_string(), c.clone()))
        .collect()
}

/// Creates the monad for a scalar or entity-valued attribute access,
/// registering the joined tableref for the entity case.
pub(super) fn attr_monad(tx: &mut SqlTranslator, parent: Monad, attr: AttrRef) -> Result<Monad> {
    let attribute = tx.schema().attr(attr);
    let ty = attribute.ty.clone();
    let attr_name = attribute.name.clone();
    match ty {
        Ty::Entity(target) => {
            let parent_path = parent
                .object_path()
                .ok_or_else(|| {
                    Error::unsupported(
                        "attribute access on an external entity parameter \
                         is not supported in {EXPR}"
                            .to_string(),
                    )
                })?
                .to_string();
            let path = format!("{parent_path}-{attr_name}");
            if tx.ctx.scopes.owner_of(tx.subquery, &path).is_none() {
                let parent_sq = tx
                    .ctx
                    .scopes
                    .get_tableref(tx.subquery, &parent_path)
                    .map(|tr| tr.subquery)
                    .unwrap_or(tx.subquery);
                tx.ctx.scopes.add_joined(parent_sq, &path, &parent_path, attr, target);
            }
            Ok(Monad::inheriting(
                MonadKind::ObjectAttr {
                    parent: Box::new(parent.clone()),
                    attr,
                    entity: target,
                    path,
                },
                &[&parent],
            ))
        }
        ty => Ok(Monad::inheriting(
            MonadKind::Attr {
                parent: Box::new(parent.clone()),
                attr,
                ty,
            },
            &[&parent],
        )),
    }
}

/// Verifies the comparability relation, or raises the diagnostic carrying
/// both types.
pub(super) fn check_comparable(
    tx: &SqlTranslator,
    left: &Monad,
    right: &Monad,
    cmp: Comparison,
) -> Result<()> {
    if matches!(left.kind, MonadKind::Method { .. }) {
        return Err(forgot_parentheses(left.src.as_deref()).into());
    }
    if matches!(right.kind, MonadKind::Method { .. }) {
        return Err(forgot_parentheses(right.src.as_deref()).into());
    }
    let left_ty = left.value_type(tx)?;
    let right_ty = right.value_type(tx)?;
    if !are_comparable_types(tx.schema(), &left_ty, &right_ty, cmp) {
        let right_ty = match (cmp, right_ty) {
            (Comparison::Membership, Ty::Set(item)) => *item,
            (_, other) => other,
        };
        return Err(Error::incomparable(
            left_ty.describe(tx.schema()),
            right_ty.describe(tx.schema()),
        )
        .into());
    }
    Ok(())
}

fn cmp_getsql(
    tx: &mut SqlTranslator,
    sq: SubqueryId,
    op: CmpOp,
    left: &Monad,
    right: &Monad,
) -> Result<SqlAst> {
    let left_sql = left.getsql(tx, sq)?;
    match op {
        CmpOp::Is => {
            return Ok(sqland(
                left_sql
                    .into_iter()
                    .map(|item| SqlAst::Node(Tag::IsNull, vec![item]))
                    .collect(),
            ))
        }
        CmpOp::IsNot => {
            return Ok(sqland(
                left_sql
                    .into_iter()
                    .map(|item| SqlAst::Node(Tag::IsNotNull, vec![item]))
                    .collect(),
            ))
        }
        _ => {}
    }
    let right_sql = right.getsql(tx, sq)?;
    debug_assert_eq!(left_sql.len(), right_sql.len());
    match op {
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let tag = match op {
                CmpOp::Lt => Tag::Lt,
                CmpOp::Le => Tag::Le,
                CmpOp::Gt => Tag::Gt,
                _ => Tag::Ge,
            };
            Ok(SqlAst::Node(
                tag,
                vec![left_sql.into_only()?, right_sql.into_only()?],
            ))
        }
        CmpOp::Eq => Ok(sqland(
            left_sql
                .into_iter()
                .zip(right_sql)
                .map(|(a, b)| SqlAst::eq(a, b))
                .collect(),
        )),
        CmpOp::Ne => Ok(sqlor(
            left_sql
                .into_iter()
                .zip(right_sql)
                .map(|(a, b)| SqlAst::Node(Tag::Ne, vec![a, b]))
                .collect(),
        )),
        CmpOp::Is | CmpOp::IsNot | CmpOp::In | CmpOp::NotIn => {
            Err(Error::translation("malformed comparison".to_string()).into())
        }
    }
}

/// Arithmetic across collections defers evaluation into the correlated
/// subquery of the set operand.
fn numeric_set_expr(
    op: BinOp,
    left: Monad,
    right: Monad,
    tx: &mut SqlTranslator,
) -> Result<Monad> {
    fn unwrap_set(ty: Ty) -> Ty {
        match ty {
            Ty::Set(item) => *item,
            other => other,
        }
    }
    let left_ty = unwrap_set(left.value_type(tx)?);
    let right_ty = unwrap_set(right.value_type(tx)?);
    let result_type = match coerce_types(&left_ty, &right_ty) {
        Some(ty) if ty.is_numeric() => ty,
        _ => return Err(binop_type_error(tx, &left, &right, op)),
    };
    let sqlop = match op {
        BinOp::Add => Tag::Add,
        BinOp::Sub => Tag::Sub,
        BinOp::Mul => Tag::Mul,
        BinOp::Div => Tag::Div,
        BinOp::Pow => {
            return Err(binop_type_error(tx, &left, &right, op));
        }
    };
    let (aggregated, nogroup) = inherit_flags(&[&left, &right]);
    Ok(Monad {
        kind: MonadKind::NumericSetExpr {
            op,
            sqlop,
            left: Box::new(left),
            right: Box::new(right),
            ty: result_type,
        },
        aggregated,
        nogroup,
        src: None,
    })
}

fn binop_type_error(tx: &SqlTranslator, left: &Monad, right: &Monad, op: BinOp) -> anyhow::Error {
    Error::invalid_type(format!(
        "Unsupported operand types '{}' and '{}' for operation '{}' in expression: {{EXPR}}",
        left.describe(tx),
        right.describe(tx),
        op.symbol()
    ))
    .into()
}

pub(super) fn check_aggregate_type(
    tx: &SqlTranslator,
    func: Tag,
    ty: &Ty,
    monad: &Monad,
) -> Result<()> {
    match func {
        Tag::Sum | Tag::Avg => {
            if !ty.is_numeric() {
                return Err(Error::invalid_type(format!(
                    "Function '{}' expects query or items of numeric type, got '{}' in {{EXPR}}",
                    func.to_string().to_lowercase(),
                    monad.describe(tx)
                ))
                .into());
            }
        }
        Tag::Min | Tag::Max => {
            if !ty.is_comparable() {
                return Err(Error::invalid_type(format!(
                    "Function '{}' cannot be applied to type '{}' in {{EXPR}}",
                    func.to_string().to_lowercase(),
                    monad.describe(tx)
                ))
                .into());
            }
        }
        _ => {}
    }
    Ok(())
}

pub(super) fn composite_aggregate_error(tx: &SqlTranslator) -> anyhow::Error {
    Error::unsupported(format!(
        "{} database provider does not support entities with composite \
         primary keys inside aggregate functions. Got: {{EXPR}}",
        tx.ctx.dialect.name()
    ))
    .into()
}
