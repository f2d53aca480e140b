//! Set monads: collection traversals, nested comprehensions and arithmetic
//! across them.
//!
//! All three kinds translate to correlated subqueries. The correlation
//! predicates are harvested from the first join of the child scope
//! (`SubSelect::outer_conditions`) and either pasted back into a WHERE
//! clause (scalar form) or turned into join predicates when the subquery
//! is materialised into the outer FROM (hint-join form).

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::ast::Literal;
use crate::error::{Error, Result};
use crate::sql::ast::{sqland, FromClause, FromHead, SqlAst, Tag};
use crate::sql::monad::{
    check_aggregate_type, check_comparable, columns_of, composite_aggregate_error, Monad,
    MonadKind,
};
use crate::sql::scope::SubqueryId;
use crate::sql::translator::SqlTranslator;
use crate::types::{Comparison, Ty};
use crate::utils::IntoOnly;

/// The correlated subquery of a traversed collection.
pub(super) struct SubSelect {
    pub subquery: SubqueryId,
    pub expr_list: Vec<SqlAst>,
    /// Equality predicates correlating the subquery with its enclosing
    /// scope, detached from the first join.
    pub outer_conditions: Vec<SqlAst>,
    pub tableref_path: String,
}

type MakeAggr = Box<dyn Fn(&[SqlAst]) -> SqlAst>;

fn count_all() -> SqlAst {
    SqlAst::Node(Tag::Count, vec![SqlAst::Node(Tag::All, vec![])])
}

/// `COUNT(COUNT(*))`, collapsed over an extra GROUP BY.
fn count_of_count() -> SqlAst {
    SqlAst::Node(Tag::Count, vec![SqlAst::Node(Tag::All, vec![count_all()])])
}

fn count_distinct(exprs: &[SqlAst]) -> SqlAst {
    SqlAst::Node(
        Tag::Count,
        vec![SqlAst::Node(Tag::Distinct, exprs.to_vec())],
    )
}

impl Monad {
    fn attrset_parts(&self) -> (&Monad, crate::schema::AttrRef, bool) {
        match &self.kind {
            MonadKind::AttrSet {
                parent,
                attr,
                forced_distinct,
            } => (parent, *attr, *forced_distinct),
            _ => unreachable!("not an attribute set"),
        }
    }

    /// Resolves (creating if needed) the tableref chain of the traversal
    /// inside `sq` and returns the terminal name path.
    pub(super) fn make_tableref(&self, tx: &mut SqlTranslator, sq: SubqueryId) -> Result<String> {
        let (parent, attr, _) = self.attrset_parts();
        let parent_path = match &parent.kind {
            MonadKind::ObjectIter { .. } | MonadKind::ObjectAttr { .. } => parent
                .object_path()
                .map(String::from)
                .unwrap_or_default(),
            MonadKind::AttrSet { .. } => parent.make_tableref(tx, sq)?,
            _ => {
                return Err(Error::unsupported(
                    "collection traversal must start from a bound variable in {EXPR}".to_string(),
                )
                .into())
            }
        };
        let attribute = tx.schema().attr(attr);
        if attribute.reverse.is_none() {
            // A value column over the set: reuse the parent's tableref.
            return Ok(parent_path);
        }
        let attr_name = attribute.name.clone();
        let target = attribute.ty.as_entity().copied().ok_or_else(|| {
            Error::translation(format!("attribute '{attr_name}' is not a relation"))
        })?;
        let path = format!("{parent_path}-{attr_name}");
        if tx.ctx.scopes.owner_of(sq, &path).is_none() {
            tx.ctx.scopes.add_joined(sq, &path, &parent_path, attr, target);
        }
        Ok(path)
    }

    /// Column expressions of the terminal attribute on its joined alias.
    fn make_expr_list(
        &self,
        tx: &mut SqlTranslator,
        sq: SubqueryId,
        path: &str,
    ) -> Result<Vec<SqlAst>> {
        let (_, attr, _) = self.attrset_parts();
        let attribute = tx.schema().attr(attr);
        let has_reverse = attribute.reverse.is_some();
        let pk_only = has_reverse || attribute.pk_offset.is_some();
        let attr_columns = attribute.columns.clone();
        let columns_offset = attribute.pk_columns_offset;
        let (alias, columns) = tx.make_join_in(sq, path, pk_only)?;
        let columns = if has_reverse {
            columns
        } else if pk_only {
            columns[columns_offset..columns_offset + attr_columns.len()].to_vec()
        } else {
            attr_columns
        };
        Ok(columns_of(&alias, &columns))
    }

    fn subselect(&self, tx: &mut SqlTranslator) -> Result<SubSelect> {
        let (_, attr, _) = self.attrset_parts();
        let sq = tx.ctx.scopes.create_subquery(Some(tx.subquery), false);
        let path = self.make_tableref(tx, sq)?;
        let expr_list = self.make_expr_list(tx, sq, path.as_str())?;
        let attribute = tx.schema().attr(attr);
        if attribute.reverse.is_none() && !attribute.required {
            // Optional value columns would distort count/sum semantics.
            let subquery = tx.ctx.scopes.subquery_mut(sq);
            for expr in &expr_list {
                subquery
                    .conditions
                    .push(SqlAst::Node(Tag::IsNotNull, vec![expr.clone()]));
            }
        }
        let outer_conditions = tx.ctx.scopes.pop_first_join_condition(sq);
        Ok(SubSelect {
            subquery: sq,
            expr_list,
            outer_conditions,
            tableref_path: path,
        })
    }

    pub(super) fn attrset_requires_distinct(
        &self,
        tx: &SqlTranslator,
        joined: bool,
        for_count: bool,
    ) -> bool {
        let (parent, attr, _) = self.attrset_parts();
        if parent.requires_distinct(tx, joined) {
            return true;
        }
        let schema = tx.schema();
        let reverse = match schema.reverse_of(schema.attr(attr)) {
            Ok(reverse) => reverse,
            Err(_) => return true,
        };
        if reverse.is_collection {
            if !for_count && !tx.hint_join {
                return true;
            }
            if matches!(parent.kind, MonadKind::AttrSet { .. }) {
                return true;
            }
        }
        false
    }

    pub(super) fn attrset_getattr(self, name: &str, tx: &mut SqlTranslator) -> Result<Monad> {
        if name == "distinct" {
            return Ok(self.bind_method(name));
        }
        let (_, attr, _) = self.attrset_parts();
        let item = tx.schema().attr(attr).ty.clone();
        let entity = match item {
            Ty::Entity(entity) => entity,
            _ => {
                return Err(Error::unknown_attribute(
                    self.describe(tx),
                    name.to_string(),
                )
                .into())
            }
        };
        let next = tx.schema().attr_ref(entity, name).ok_or_else(|| {
            Error::unknown_attribute(
                tx.schema().entity(entity).name.clone(),
                name.to_string(),
            )
        })?;
        Ok(Monad::inheriting(
            MonadKind::AttrSet {
                parent: Box::new(self.clone()),
                attr: next,
                forced_distinct: false,
            },
            &[&self],
        ))
    }

    /// `distinct()` forces DISTINCT inside SUM/AVG over the set.
    pub(super) fn attrset_distinct(self) -> Monad {
        let kind = match self.kind {
            MonadKind::AttrSet { parent, attr, .. } => MonadKind::AttrSet {
                parent,
                attr,
                forced_distinct: true,
            },
            kind => kind,
        };
        Monad {
            kind,
            aggregated: self.aggregated,
            nogroup: self.nogroup,
            src: self.src,
        }
    }

    pub(super) fn set_getsql(
        &self,
        tx: &mut SqlTranslator,
        sq: SubqueryId,
    ) -> Result<Vec<SqlAst>> {
        match &self.kind {
            MonadKind::AttrSet { .. } => {
                let path = self.make_tableref(tx, sq)?;
                self.make_expr_list(tx, sq, &path)
            }
            MonadKind::NumericSetExpr { .. } => self.numeric_set_getsql(tx, sq),
            MonadKind::QuerySet(_) => Err(Error::unsupported(
                "nested query cannot be used as a plain value in {EXPR}".to_string(),
            )
            .into()),
            _ => unreachable!("not a set monad"),
        }
    }

    pub(super) fn attrset_exists(self, tx: &mut SqlTranslator, negated: bool) -> Result<Monad> {
        let sub = self.subselect(tx)?;
        let mut conditions = sub.outer_conditions.clone();
        conditions.extend(tx.ctx.scopes.subquery(sub.subquery).conditions.iter().cloned());
        let from_ast = SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone());
        let tag = if negated { Tag::NotExists } else { Tag::Exists };
        let sql = SqlAst::Node(tag, vec![from_ast, SqlAst::Node(Tag::Where, conditions)]);
        Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&self]))
    }

    pub(super) fn attrset_contains(
        self,
        item: Monad,
        not_in: bool,
        tx: &mut SqlTranslator,
    ) -> Result<Monad> {
        check_comparable(tx, &item, &self, Comparison::Membership)?;
        let outer_sq = tx.subquery;
        if !tx.hint_join {
            let sub = self.subselect(tx)?;
            let mut conditions = sub.outer_conditions.clone();
            conditions.extend(tx.ctx.scopes.subquery(sub.subquery).conditions.iter().cloned());
            let from_ast = SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone());
            let item_sql = item.getsql(tx, outer_sq)?;
            let sql = if sub.expr_list.len() == 1 {
                let subquery_ast = SqlAst::Node(
                    Tag::Select,
                    vec![
                        SqlAst::Node(Tag::All, sub.expr_list.clone()),
                        from_ast,
                        SqlAst::Node(Tag::Where, conditions),
                    ],
                );
                let tag = if not_in { Tag::NotIn } else { Tag::In };
                SqlAst::Node(tag, vec![item_sql.into_only()?, subquery_ast])
            } else if tx.ctx.dialect.row_value_syntax() {
                let subquery_ast = SqlAst::Node(
                    Tag::Select,
                    vec![
                        SqlAst::Node(Tag::All, sub.expr_list.clone()),
                        from_ast,
                        SqlAst::Node(Tag::Where, conditions),
                    ],
                );
                let tag = if not_in { Tag::NotIn } else { Tag::In };
                SqlAst::Node(tag, vec![SqlAst::Node(Tag::Row, item_sql), subquery_ast])
            } else {
                conditions.extend(
                    item_sql
                        .into_iter()
                        .zip(sub.expr_list.iter().cloned())
                        .map(|(a, b)| SqlAst::eq(a, b)),
                );
                let tag = if not_in { Tag::NotExists } else { Tag::Exists };
                SqlAst::Node(tag, vec![from_ast, SqlAst::Node(Tag::Where, conditions)])
            };
            Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&item, &self]))
        } else if !not_in {
            // Positive containment as an inner join against the outer FROM.
            tx.distinct = true;
            let path = self.make_tableref(tx, outer_sq)?;
            let expr_list = self.make_expr_list(tx, outer_sq, &path)?;
            let item_sql = item.getsql(tx, outer_sq)?;
            let sql = sqland(
                expr_list
                    .into_iter()
                    .zip(item_sql)
                    .map(|(a, b)| SqlAst::eq(a, b))
                    .collect(),
            );
            Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&item, &self]))
        } else {
            // Negative containment: LEFT JOIN the traversal and test for
            // the all-null row.
            let (_, attr, _) = self.attrset_parts();
            let sq = tx.ctx.scopes.create_subquery(Some(outer_sq), false);
            let path = self.make_tableref(tx, sq)?;
            let attribute = tx.schema().attr(attr).clone();
            let (alias, joined_columns) =
                tx.make_join_in(sq, &path, attribute.reverse.is_some())?;
            let expr_list = self.make_expr_list(tx, sq, &path)?;
            let columns = if attribute.reverse.is_none() {
                attribute.columns.clone()
            } else {
                joined_columns
            };
            let item_sql = item.getsql(tx, outer_sq)?;
            let mut conditions: Vec<SqlAst> = columns
                .iter()
                .zip(item_sql)
                .map(|(column, expr)| {
                    SqlAst::eq(SqlAst::Column(alias.clone(), column.clone()), expr)
                })
                .collect();
            let inner = tx.ctx.scopes.subquery_mut(sq);
            conditions.extend(std::mem::take(&mut inner.conditions));
            let items = std::mem::take(&mut inner.from.items);
            let outer_from = &mut tx.ctx.scopes.subquery_mut(outer_sq).from;
            outer_from.head = FromHead::LeftJoin;
            outer_from.items.extend(items);
            if let Some(last) = outer_from.items.last_mut() {
                let mut all = match last.condition.take() {
                    Some(condition) => vec![condition],
                    None => Vec::new(),
                };
                all.extend(conditions);
                last.condition = Some(sqland(all));
            }
            let sql = sqland(
                expr_list
                    .into_iter()
                    .map(|expr| SqlAst::Node(Tag::IsNull, vec![expr]))
                    .collect(),
            );
            Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&item, &self]))
        }
    }

    pub(super) fn attrset_count(self, tx: &mut SqlTranslator) -> Result<Monad> {
        let sub = self.subselect(tx)?;
        let distinct = self.attrset_requires_distinct(tx, tx.hint_join, true);
        let path = sub.tableref_path.clone();
        let optimizing = tx.optimize.as_deref() == Some(path.as_str());

        let mut sql_ast = None;
        let mut extra_grouping = false;
        let make_aggr: MakeAggr = if !distinct && !optimizing {
            Box::new(|_| count_all())
        } else if sub.expr_list.len() == 1 {
            Box::new(count_distinct)
        } else if tx.ctx.dialect.grouped_count() {
            if optimizing {
                return Err(Error::new(crate::error::ErrorKind::OptimizationFailed).into());
            }
            extra_grouping = true;
            if tx.hint_join {
                Box::new(|_| count_all())
            } else {
                Box::new(|_| count_of_count())
            }
        } else if tx.ctx.dialect.count_distinct_row() {
            Box::new(count_distinct)
        } else if let Some(rowid) = tx.ctx.dialect.rowid() {
            if !distinct {
                let (alias, _) = tx.make_join_in(sub.subquery, &path, true)?;
                let column = SqlAst::Column(alias, rowid.to_string());
                Box::new(move |_| {
                    SqlAst::Node(Tag::Count, vec![SqlAst::Node(Tag::All, vec![column.clone()])])
                })
            } else if tx.hint_join {
                extra_grouping = true;
                Box::new(|_| count_all())
            } else if tx.ctx.dialect.legacy_rowid_count() {
                let (alias, _) = tx.make_join_in(sub.subquery, &path, false)?;
                let column = SqlAst::Column(alias, rowid.to_string());
                Box::new(move |_| {
                    SqlAst::Node(
                        Tag::Count,
                        vec![SqlAst::Node(Tag::Distinct, vec![column.clone()])],
                    )
                })
            } else {
                // COUNT(*) over an inner SELECT DISTINCT.
                let mut conditions = sub.outer_conditions.clone();
                conditions
                    .extend(tx.ctx.scopes.subquery(sub.subquery).conditions.iter().cloned());
                let inner = SqlAst::Node(
                    Tag::Select,
                    vec![
                        SqlAst::Node(Tag::Distinct, sub.expr_list.clone()),
                        SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
                        SqlAst::Node(Tag::Where, conditions),
                    ],
                );
                let mut from = FromClause::new(FromHead::From);
                from.push_subselect("t".to_string(), inner, None);
                sql_ast = Some(SqlAst::Node(
                    Tag::Select,
                    vec![
                        SqlAst::Node(Tag::Aggregates, vec![count_all()]),
                        SqlAst::From(from),
                    ],
                ));
                Box::new(|_| count_all())
            }
        } else {
            return Err(composite_aggregate_error(tx));
        };

        let (sql_ast, optimized) = match sql_ast {
            Some(ast) => (ast, false),
            None if tx.hint_join => {
                self.joined_subselect(tx, &sub, &make_aggr, extra_grouping, true)?
            }
            None => self.aggregated_scalar_subselect(tx, &sub, &make_aggr, extra_grouping)?,
        };
        tx.aggregated_subquery_paths.insert(path);
        let mut result = Monad::expr(Ty::Int, sql_ast);
        if optimized {
            result.aggregated = true;
        } else {
            result.nogroup = true;
        }
        Ok(result)
    }

    pub(super) fn attrset_aggregate(self, func: Tag, tx: &mut SqlTranslator) -> Result<Monad> {
        let (_, attr, forced_distinct) = self.attrset_parts();
        let item_type = tx.schema().attr(attr).ty.clone();
        check_aggregate_type(tx, func, &item_type, &self)?;

        let make_aggr: MakeAggr = if forced_distinct && matches!(func, Tag::Sum | Tag::Avg) {
            Box::new(move |exprs| {
                SqlAst::Node(func, vec![SqlAst::Node(Tag::Distinct, exprs.to_vec())])
            })
        } else {
            Box::new(move |exprs| SqlAst::Node(func, exprs.to_vec()))
        };

        let sub = self.subselect(tx)?;
        let (sql_ast, optimized) = if tx.hint_join {
            self.joined_subselect(tx, &sub, &make_aggr, false, func == Tag::Sum)?
        } else {
            self.aggregated_scalar_subselect(tx, &sub, &make_aggr, false)?
        };
        let result_type = if func == Tag::Avg {
            Ty::Float
        } else {
            item_type
        };
        tx.aggregated_subquery_paths.insert(sub.tableref_path);
        let mut result = Monad::expr(result_type, sql_ast);
        if optimized {
            result.aggregated = true;
        } else {
            result.nogroup = true;
        }
        Ok(result)
    }

    /// Scalar correlated subselect placed directly into the outer
    /// expression. When the translator's optimize path names this
    /// traversal, the subquery is folded into the outer FROM instead and
    /// the bare aggregate is returned.
    fn aggregated_scalar_subselect(
        &self,
        tx: &mut SqlTranslator,
        sub: &SubSelect,
        make_aggr: &MakeAggr,
        extra_grouping: bool,
    ) -> Result<(SqlAst, bool)> {
        if tx.optimize.as_deref() == Some(sub.tableref_path.as_str()) {
            let sql_ast = make_aggr(&sub.expr_list);
            if !tx.from_optimized {
                let mut items =
                    std::mem::take(&mut tx.ctx.scopes.subquery_mut(sub.subquery).from.items);
                if let Some(first) = items.first_mut() {
                    let mut all = sub.outer_conditions.clone();
                    if let Some(existing) = first.condition.take() {
                        all.insert(0, existing);
                    }
                    if !all.is_empty() {
                        first.condition = Some(sqland(all));
                    }
                }
                tx.ctx
                    .scopes
                    .subquery_mut(tx.subquery)
                    .from
                    .items
                    .extend(items);
                tx.from_optimized = true;
            }
            return Ok((sql_ast, true));
        }
        let mut conditions = sub.outer_conditions.clone();
        conditions.extend(tx.ctx.scopes.subquery(sub.subquery).conditions.iter().cloned());
        let mut select_items = vec![
            SqlAst::Node(Tag::Aggregates, vec![make_aggr(&sub.expr_list)]),
            SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
        ];
        if !conditions.is_empty() {
            select_items.push(SqlAst::Node(Tag::Where, conditions));
        }
        if extra_grouping {
            select_items.push(SqlAst::Node(Tag::GroupBy, sub.expr_list.clone()));
        }
        Ok((SqlAst::Node(Tag::Select, select_items), false))
    }

    /// Materialises the aggregated subselect into the outer FROM as
    /// `(SELECT <group cols>, <aggr> AS expr-N … GROUP BY <group cols>)`,
    /// joined back on the harvested outer conditions.
    fn joined_subselect(
        &self,
        tx: &mut SqlTranslator,
        sub: &SubSelect,
        make_aggr: &MakeAggr,
        extra_grouping: bool,
        coalesce_to_zero: bool,
    ) -> Result<(SqlAst, bool)> {
        let split = |condition: &SqlAst| -> Result<(SqlAst, String, String)> {
            if let SqlAst::Node(Tag::Eq, items) = condition {
                if let [outer, SqlAst::Column(alias, name)] = items.as_slice() {
                    return Ok((outer.clone(), alias.clone(), name.clone()));
                }
            }
            Err(Error::unsupported(
                "cannot join an aggregated subquery on a non-equality correlation".to_string(),
            )
            .into())
        };
        let mut outer_conditions = sub
            .outer_conditions
            .iter()
            .map(split)
            .collect::<Result<Vec<_>>>()?;
        let mut groupby_columns: Vec<SqlAst> = outer_conditions
            .iter()
            .map(|(_, alias, name)| SqlAst::Column(alias.clone(), name.clone()))
            .collect();
        let inner_conditions = tx.ctx.scopes.subquery(sub.subquery).conditions.clone();
        let mut expr_list = sub.expr_list.clone();
        let mut from_ast = SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone());

        if extra_grouping {
            // An inner DISTINCT subselect renames every column once, so the
            // outer aggregate can COUNT(*) over it.
            let inner_alias = tx.ctx.scopes.get_short_alias(tx.subquery, None, "t");
            let mut renamed = Vec::new();
            let mut col_mapping: HashMap<(String, String), String> = HashMap::new();
            let mut col_names: HashSet<String> = HashSet::new();
            let column_count = groupby_columns.len();
            for (i, column_ast) in groupby_columns
                .iter_mut()
                .chain(expr_list.iter_mut())
                .enumerate()
            {
                let (table_name, column_name) = match &*column_ast {
                    SqlAst::Column(table_name, column_name) => {
                        (table_name.clone(), column_name.clone())
                    }
                    _ => {
                        return Err(Error::unsupported(
                            "grouped counting requires plain column expressions".to_string(),
                        )
                        .into())
                    }
                };
                let new_name = if col_names.insert(column_name.clone()) {
                    col_mapping
                        .insert((table_name.clone(), column_name.clone()), column_name.clone());
                    column_name.clone()
                } else {
                    let new_name = tx.ctx.scopes.next_expr_name();
                    col_mapping.insert((table_name.clone(), column_name.clone()), new_name.clone());
                    new_name
                };
                renamed.push(SqlAst::aliased(column_ast.clone(), &new_name));
                if i < column_count {
                    *column_ast = SqlAst::Column(inner_alias.clone(), new_name);
                }
            }
            let mut inner_select = vec![SqlAst::Node(Tag::Distinct, renamed), from_ast];
            if !inner_conditions.is_empty() {
                inner_select.push(SqlAst::Node(Tag::Where, inner_conditions.clone()));
            }
            let mut from = FromClause::new(FromHead::From);
            from.push_subselect(
                inner_alias.clone(),
                SqlAst::Node(Tag::Select, inner_select),
                None,
            );
            from_ast = SqlAst::From(from);
            for (_, alias, name) in outer_conditions.iter_mut() {
                if let Some(new_name) = col_mapping.get(&(alias.clone(), name.clone())) {
                    *name = new_name.clone();
                }
                *alias = inner_alias.clone();
            }
        }

        let mut subquery_columns = Vec::new();
        for column_ast in &groupby_columns {
            let name = match column_ast {
                SqlAst::Column(_, name) => name.clone(),
                _ => tx.ctx.scopes.next_expr_name(),
            };
            subquery_columns.push(SqlAst::aliased(column_ast.clone(), &name));
        }
        let expr_name = tx.ctx.scopes.next_expr_name();
        subquery_columns.push(SqlAst::aliased(make_aggr(&expr_list), &expr_name));
        let mut subquery_ast = vec![SqlAst::Node(Tag::All, subquery_columns), from_ast];
        if !inner_conditions.is_empty() && !extra_grouping {
            subquery_ast.push(SqlAst::Node(Tag::Where, inner_conditions));
        }
        subquery_ast.push(SqlAst::Node(Tag::GroupBy, groupby_columns));

        let alias = tx.ctx.scopes.get_short_alias(tx.subquery, None, "t");
        let join_condition = sqland(
            outer_conditions
                .into_iter()
                .map(|(outer, _, name)| {
                    SqlAst::eq(outer, SqlAst::Column(alias.clone(), name))
                })
                .collect_vec(),
        );
        tx.ctx.scopes.subquery_mut(tx.subquery).from.push_subselect(
            alias.clone(),
            SqlAst::Node(Tag::Select, subquery_ast),
            Some(join_condition),
        );
        let mut expr_ast = SqlAst::Column(alias, expr_name);
        if coalesce_to_zero {
            expr_ast = SqlAst::Node(
                Tag::Coalesce,
                vec![expr_ast, SqlAst::Value(Literal::Int(0))],
            );
        }
        Ok((expr_ast, false))
    }

    /// Renders the arithmetic node, verifying that both operands traverse
    /// the same chain. The check compares name-path prefixes textually, so
    /// equivalent traversals that reorder attributes are deliberately not
    /// recognised as equal.
    pub(super) fn numeric_set_getsql(
        &self,
        tx: &mut SqlTranslator,
        sq: SubqueryId,
    ) -> Result<Vec<SqlAst>> {
        let (sqlop, left, right) = match &self.kind {
            MonadKind::NumericSetExpr {
                sqlop, left, right, ..
            } => (*sqlop, left, right),
            _ => unreachable!("not a numeric set expression"),
        };
        let left_sql = left.getsql(tx, sq)?.into_only()?;
        let right_sql = right.getsql(tx, sq)?.into_only()?;
        let left_path = set_operand_path(left, tx, sq)?
            .map(|p| format!("{p}-"))
            .unwrap_or_default();
        let right_path = set_operand_path(right, tx, sq)?
            .map(|p| format!("{p}-"))
            .unwrap_or_default();
        if !left_path.starts_with(&right_path) && !right_path.starts_with(&left_path) {
            return Err(Error::translation(
                "Cartesian product detected in {EXPR}".to_string(),
            )
            .into());
        }
        Ok(vec![SqlAst::Node(sqlop, vec![left_sql, right_sql])])
    }

    pub(super) fn numeric_set_aggregate(self, func: Tag, tx: &mut SqlTranslator) -> Result<Monad> {
        let result_type = match (&func, self.value_type(tx)?) {
            (Tag::Avg, _) => Ty::Float,
            (_, ty) => ty,
        };
        let sq = tx.ctx.scopes.create_subquery(Some(tx.subquery), false);
        let expr = self.getsql(tx, sq)?.into_only()?;
        let mut conditions = tx.ctx.scopes.pop_first_join_condition(sq);
        conditions.extend(tx.ctx.scopes.subquery(sq).conditions.iter().cloned());
        let mut select_items = vec![
            SqlAst::Node(Tag::Aggregates, vec![SqlAst::Node(func, vec![expr])]),
            SqlAst::From(tx.ctx.scopes.subquery(sq).from.clone()),
        ];
        if !conditions.is_empty() {
            select_items.push(SqlAst::Node(Tag::Where, conditions));
        }
        Ok(Monad::expr(
            result_type,
            SqlAst::Node(Tag::Select, select_items),
        ))
    }

    fn queryset(&self) -> &crate::sql::translator::Translation {
        match &self.kind {
            MonadKind::QuerySet(sub) => sub,
            _ => unreachable!("not a query set"),
        }
    }

    pub(super) fn queryset_exists(self, tx: &mut SqlTranslator, negated: bool) -> Result<Monad> {
        let sub = self.queryset();
        let from_ast = SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone());
        let conditions = tx.ctx.scopes.subquery(sub.subquery).conditions.clone();
        let tag = if negated { Tag::NotExists } else { Tag::Exists };
        let sql = SqlAst::Node(tag, vec![from_ast, SqlAst::Node(Tag::Where, conditions)]);
        Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&self]))
    }

    pub(super) fn queryset_contains(
        self,
        item: Monad,
        not_in: bool,
        tx: &mut SqlTranslator,
    ) -> Result<Monad> {
        check_comparable(tx, &item, &self, Comparison::Membership)?;
        let outer_sq = tx.subquery;
        let sub = self.queryset().clone();
        let columns_ast = sub.expr_columns.clone();
        let mut conditions = tx.ctx.scopes.subquery(sub.subquery).conditions.clone();
        let item_columns = item.getsql(tx, outer_sq)?;

        if tx.hint_join {
            // Materialise the subquery into the outer FROM.
            if !not_in {
                tx.distinct = true;
                let from = &mut tx.ctx.scopes.subquery_mut(outer_sq).from;
                if from.head == FromHead::From {
                    from.head = FromHead::InnerJoin;
                }
            } else {
                tx.ctx.scopes.subquery_mut(outer_sq).from.head = FromHead::LeftJoin;
            }
            let mut col_names: HashSet<String> = HashSet::new();
            let mut new_names = Vec::new();
            let mut exprs = Vec::new();
            for column_ast in &columns_ast {
                if let SqlAst::Column(_, col_name) = column_ast {
                    if col_names.insert(col_name.clone()) {
                        new_names.push(col_name.clone());
                        exprs.push(SqlAst::aliased(column_ast.clone(), col_name));
                        continue;
                    }
                }
                let new_name = tx.ctx.scopes.next_expr_name();
                new_names.push(new_name.clone());
                exprs.push(SqlAst::aliased(column_ast.clone(), &new_name));
            }
            let mut from_clause = tx.ctx.scopes.subquery(sub.subquery).from.clone();
            let mut outer_conditions = from_clause
                .items
                .first_mut()
                .and_then(|item| item.condition.take())
                .map(crate::sql::ast::flatten_and)
                .unwrap_or_default();
            if sub.expr_nullable {
                conditions.extend(
                    sub.expr_columns
                        .iter()
                        .map(|c| SqlAst::Node(Tag::IsNotNull, vec![c.clone()])),
                );
            }
            let mut subquery_ast = vec![
                SqlAst::Node(Tag::All, exprs),
                SqlAst::From(from_clause),
            ];
            if !conditions.is_empty() {
                subquery_ast.push(SqlAst::Node(Tag::Where, conditions));
            }
            let alias = tx.ctx.scopes.get_short_alias(outer_sq, None, "t");
            outer_conditions.extend(item_columns.into_iter().zip(new_names.iter()).map(
                |(item_column, new_name)| {
                    SqlAst::eq(
                        item_column,
                        SqlAst::Column(alias.clone(), new_name.clone()),
                    )
                },
            ));
            tx.ctx.scopes.subquery_mut(outer_sq).from.push_subselect(
                alias.clone(),
                SqlAst::Node(Tag::Select, subquery_ast),
                Some(sqland(outer_conditions)),
            );
            let result_expr = if not_in {
                sqland(
                    new_names
                        .iter()
                        .map(|name| {
                            SqlAst::Node(
                                Tag::IsNull,
                                vec![SqlAst::Column(alias.clone(), name.clone())],
                            )
                        })
                        .collect(),
                )
            } else {
                SqlAst::eq(
                    SqlAst::Value(Literal::Int(1)),
                    SqlAst::Value(Literal::Int(1)),
                )
            };
            return Ok(Monad::inheriting(
                MonadKind::BoolExpr(result_expr),
                &[&item, &self],
            ));
        }

        if columns_ast.len() == 1 || tx.ctx.dialect.row_value_syntax() {
            if sub.expr_nullable {
                conditions.extend(
                    sub.expr_columns
                        .iter()
                        .map(|c| SqlAst::Node(Tag::IsNotNull, vec![c.clone()])),
                );
            }
            let mut subquery_ast = vec![
                SqlAst::Node(Tag::All, columns_ast.clone()),
                SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
            ];
            if !conditions.is_empty() {
                subquery_ast.push(SqlAst::Node(Tag::Where, conditions));
            }
            let expr_ast = if columns_ast.len() == 1 {
                item_columns.into_only()?
            } else {
                SqlAst::Node(Tag::Row, item_columns)
            };
            let tag = if not_in { Tag::NotIn } else { Tag::In };
            let sql = SqlAst::Node(
                tag,
                vec![expr_ast, SqlAst::Node(Tag::Select, subquery_ast)],
            );
            Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&item, &self]))
        } else {
            conditions.extend(
                item_columns
                    .into_iter()
                    .zip(columns_ast)
                    .map(|(a, b)| SqlAst::eq(a, b)),
            );
            let tag = if not_in { Tag::NotExists } else { Tag::Exists };
            let sql = SqlAst::Node(
                tag,
                vec![
                    SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
                    SqlAst::Node(Tag::Where, conditions),
                ],
            );
            Ok(Monad::inheriting(MonadKind::BoolExpr(sql), &[&item, &self]))
        }
    }

    fn queryset_select(
        &self,
        tx: &mut SqlTranslator,
        ty: Ty,
        select_clause: SqlAst,
    ) -> Result<Monad> {
        let sub = self.queryset();
        let conditions = tx.ctx.scopes.subquery(sub.subquery).conditions.clone();
        let mut items = vec![
            select_clause,
            SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
        ];
        if !conditions.is_empty() {
            items.push(SqlAst::Node(Tag::Where, conditions));
        }
        Ok(Monad::expr(ty, SqlAst::Node(Tag::Select, items)))
    }

    pub(super) fn queryset_count(self, tx: &mut SqlTranslator) -> Result<Monad> {
        let sub = self.queryset().clone();
        let is_row_result = matches!(sub.expr_type, Ty::Entity(_) | Ty::Row(_));
        if is_row_result {
            if !sub.distinct {
                let select = SqlAst::Node(Tag::Aggregates, vec![count_all()]);
                return self.queryset_select(tx, Ty::Int, select);
            }
            if sub.expr_columns.len() == 1 {
                let select =
                    SqlAst::Node(Tag::Aggregates, vec![count_distinct(&sub.expr_columns)]);
                return self.queryset_select(tx, Ty::Int, select);
            }
            if tx.ctx.dialect.grouped_count() {
                let conditions = tx.ctx.scopes.subquery(sub.subquery).conditions.clone();
                let mut items = vec![
                    SqlAst::Node(Tag::Aggregates, vec![count_of_count()]),
                    SqlAst::From(tx.ctx.scopes.subquery(sub.subquery).from.clone()),
                ];
                if !conditions.is_empty() {
                    items.push(SqlAst::Node(Tag::Where, conditions));
                }
                items.push(SqlAst::Node(Tag::GroupBy, sub.expr_columns.clone()));
                return Ok(Monad::expr(Ty::Int, SqlAst::Node(Tag::Select, items)));
            }
            if tx.ctx.dialect.count_distinct_row() {
                let select =
                    SqlAst::Node(Tag::Aggregates, vec![count_distinct(&sub.expr_columns)]);
                return self.queryset_select(tx, Ty::Int, select);
            }
            if let Some(rowid) = tx.ctx.dialect.rowid() {
                if sub.aggregated {
                    return Err(Error::translation(
                        "cannot count an aggregated nested query in {EXPR}".to_string(),
                    )
                    .into());
                }
                let path = sub.tableref.clone().ok_or_else(|| {
                    Error::translation("nested query has no countable table".to_string())
                })?;
                let (alias, _) = tx.make_join_in(sub.subquery, &path, false)?;
                let column = SqlAst::Column(alias, rowid.to_string());
                let select = SqlAst::Node(
                    Tag::Aggregates,
                    vec![SqlAst::Node(
                        Tag::Count,
                        vec![SqlAst::Node(Tag::Distinct, vec![column])],
                    )],
                );
                return self.queryset_select(tx, Ty::Int, select);
            }
            return Err(composite_aggregate_error(tx));
        }
        if sub.expr_columns.len() == 1 {
            let select = SqlAst::Node(Tag::Aggregates, vec![count_distinct(&sub.expr_columns)]);
            return self.queryset_select(tx, Ty::Int, select);
        }
        Err(composite_aggregate_error(tx))
    }

    pub(super) fn queryset_aggregate(self, func: Tag, tx: &mut SqlTranslator) -> Result<Monad> {
        let sub = self.queryset();
        let expr_type = sub.expr_type.clone();
        check_aggregate_type(tx, func, &expr_type, &self)?;
        let column = sub.expr_columns.clone().into_only()?;
        let select = SqlAst::Node(Tag::Aggregates, vec![SqlAst::Node(func, vec![column])]);
        let result_type = if func == Tag::Avg {
            Ty::Float
        } else {
            expr_type
        };
        self.queryset_select(tx, result_type, select)
    }
}

/// Name path grounding a set operand, `None` for plain scalars.
fn set_operand_path(
    monad: &Monad,
    tx: &mut SqlTranslator,
    sq: SubqueryId,
) -> Result<Option<String>> {
    match &monad.kind {
        MonadKind::AttrSet { .. } => Ok(Some(monad.make_tableref(tx, sq)?)),
        MonadKind::NumericSetExpr { left, right, .. } => {
            let left_path = set_operand_path(left, tx, sq)?.unwrap_or_default();
            let right_path = set_operand_path(right, tx, sq)?.unwrap_or_default();
            if left_path.len() >= right_path.len() {
                Ok(Some(left_path).filter(|p| !p.is_empty()))
            } else {
                Ok(Some(right_path).filter(|p| !p.is_empty()))
            }
        }
        _ => Ok(None),
    }
}

/// Wraps a finished nested translation as a set; the result always reads
/// as already grouped.
pub(super) fn queryset_monad(sub: crate::sql::translator::Translation) -> Monad {
    let mut monad = Monad::new(MonadKind::QuerySet(Box::new(sub)));
    monad.nogroup = true;
    monad
}
