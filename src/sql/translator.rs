//! The translator driver: processes the qualifier chain, walks the
//! selector expression bottom-up, and assembles the final SQL AST.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use log::debug;

use crate::ast::{CmpOp, Expr, ExprKind, GenExpr, Literal, Qualifier, Subscript};
use crate::codegen::ast2src;
use crate::error::{attach_expr_context, Error, Result};
use crate::schema::{AttrOffsets, EntityId, Schema};
use crate::sql::ast::{FromClause, FromHead, SqlAst, Tag};
use crate::sql::dialect::{Dialect, DialectHandler};
use crate::sql::monad::{inherit_flags, Monad, MonadKind};
use crate::sql::scope::{Scopes, SubqueryId};
use crate::sql::sets::queryset_monad;
use crate::types::Ty;

/// Opaque caller data carried through translation and surfaced unchanged.
pub type Extractors = HashMap<String, String>;

#[derive(Debug, Default)]
pub struct Options {
    pub dialect: Dialect,
    /// Start the root FROM as a LEFT JOIN chain.
    pub left_join: bool,
    /// Name path of a collection traversal whose aggregate may be folded
    /// into the outer query. Best effort: see `ErrorKind::OptimizationFailed`.
    pub optimize: Option<String>,
}

/// State shared by a translator and all its nested scopes.
pub(crate) struct Context<'env> {
    pub schema: &'env Schema,
    pub vartypes: &'env HashMap<String, Ty>,
    pub dialect: Box<dyn DialectHandler>,
    pub scopes: Scopes,
    pub database: Option<String>,
}

/// One slot of the result row: either an entity to hydrate from a pk
/// column range, or a single converted scalar.
#[derive(Debug, Clone)]
pub enum RowSlot {
    Entity {
        entity: EntityId,
        columns: Range<usize>,
        src: String,
        order_columns: Vec<usize>,
    },
    Scalar {
        ty: Ty,
        offset: usize,
        src: String,
        order_columns: Vec<usize>,
    },
}

/// The finished outputs of translating one comprehension.
#[derive(Debug, Clone)]
pub struct Translation {
    pub subquery: SubqueryId,
    pub expr_type: Ty,
    pub expr_columns: Vec<SqlAst>,
    pub row_layout: Option<Vec<RowSlot>>,
    pub having_conditions: Vec<SqlAst>,
    pub groupby_columns: Option<Vec<SqlAst>>,
    pub order: Vec<SqlAst>,
    pub distinct: bool,
    pub aggregated: bool,
    pub alias: Option<String>,
    /// Name path of the selected entity's tableref, when the selector is
    /// an entity.
    pub tableref: Option<String>,
    /// False only when the selector is a non-nullable scalar attribute.
    pub expr_nullable: bool,
    /// One-based result column positions of the selected entity's pk.
    pub orderby_columns: Vec<usize>,
    pub optimize: Option<String>,
    pub aggregated_subquery_paths: HashSet<String>,
}

/// Per-scope translation frame; the walker methods live here.
pub struct SqlTranslator<'a, 'env> {
    pub(crate) ctx: &'a mut Context<'env>,
    pub(crate) subquery: SubqueryId,
    has_parent: bool,
    left_join: bool,
    pub(crate) optimize: Option<String>,
    pub(crate) from_optimized: bool,
    pub(crate) distinct: bool,
    pub(crate) aggregated: bool,
    inside_not: bool,
    pub(crate) hint_join: bool,
    having_conditions: Vec<SqlAst>,
    pub(crate) aggregated_subquery_paths: HashSet<String>,
    pub(crate) last_qual_name: String,
    /// Entity bindings injected by the `Entity.select(lambda)` rewrite,
    /// standing in for an external name.
    prebound: HashMap<String, EntityId>,
}

impl<'a, 'env> SqlTranslator<'a, 'env> {
    pub(crate) fn run(
        ctx: &mut Context<'env>,
        tree: &GenExpr,
        parent_subquery: Option<SubqueryId>,
        left_join: bool,
        optimize: Option<String>,
        prebound: HashMap<String, EntityId>,
    ) -> Result<Translation> {
        let subquery = ctx.scopes.create_subquery(parent_subquery, left_join);
        let last_qual_name = tree
            .quals
            .last()
            .and_then(|q| q.assign.kind.as_name())
            .cloned()
            .unwrap_or_default();
        let aggregated = optimize.is_some();
        let tx = SqlTranslator {
            ctx,
            subquery,
            has_parent: parent_subquery.is_some(),
            left_join,
            optimize,
            from_optimized: false,
            distinct: false,
            aggregated,
            inside_not: false,
            hint_join: false,
            having_conditions: Vec::new(),
            aggregated_subquery_paths: HashSet::new(),
            last_qual_name,
            prebound,
        };
        tx.translate(tree)
    }

    pub(crate) fn schema(&self) -> &'env Schema {
        self.ctx.schema
    }

    pub(crate) fn make_join_in(
        &mut self,
        sq: SubqueryId,
        name_path: &str,
        pk_only: bool,
    ) -> Result<(String, Vec<String>)> {
        let ctx = &mut *self.ctx;
        ctx.scopes.make_join(ctx.schema, sq, name_path, pk_only)
    }

    fn check_database(&mut self, entity: EntityId) -> Result<()> {
        let database = self.ctx.schema.entity(entity).database.clone();
        match &self.ctx.database {
            None => {
                self.ctx.database = Some(database);
                Ok(())
            }
            Some(existing) if *existing == database => Ok(()),
            Some(_) => Err(Error::translation(
                "All entities in a query must belong to the same database",
            )
            .into()),
        }
    }

    fn translate(mut self, tree: &GenExpr) -> Result<Translation> {
        if tree.quals.is_empty() {
            return Err(Error::translation("query must have at least one 'for' clause").into());
        }
        debug!("qualifier pass: {} qualifiers", tree.quals.len());
        for i in 0..tree.quals.len() {
            self.process_qualifier(tree, i)?;
        }
        debug!("selector pass");
        self.process_selector(tree)
    }

    fn process_qualifier(&mut self, tree: &GenExpr, i: usize) -> Result<()> {
        let qual = &tree.quals[i];
        let name = qual
            .assign
            .kind
            .as_name()
            .ok_or_else(|| Error::unsupported(ast2src(&qual.assign)))?
            .clone();
        if self.ctx.scopes.is_bound_locally(self.subquery, &name) {
            return Err(Error::translation(format!("Duplicate name: '{name}'")).into());
        }
        if name.starts_with("__") {
            return Err(Error::translation(format!("Illegal name: '{name}'")).into());
        }

        let node = &qual.iter;
        let prebound = node
            .kind
            .as_name()
            .and_then(|n| self.prebound.get(n))
            .copied();
        let entity = if let Some(entity) = prebound {
            self.ctx.scopes.add_root(self.subquery, &name, entity);
            entity
        } else if node.external && !node.constant {
            let src = external_src(node)?;
            let iterable = self.ctx.vartypes.get(src).ok_or_else(|| {
                Error::translation(format!("Name '{src}' must be defined in query"))
            })?;
            let item = match iterable {
                Ty::Set(item) => item.as_ref(),
                _ => {
                    return Err(Error::translation(format!(
                        "Inside declarative query, iterator must be an entity. \
                         Got: for {name} in {}",
                        ast2src(node)
                    ))
                    .into())
                }
            };
            let entity = match item {
                Ty::Entity(entity) => *entity,
                _ => {
                    return Err(Error::translation(format!(
                        "for {name} in {}",
                        ast2src(node)
                    ))
                    .into())
                }
            };
            if i > 0 {
                if self.left_join {
                    return Err(Error::translation(format!(
                        "Collection expected inside left join query. \
                         Got: for {name} in {}",
                        ast2src(node)
                    ))
                    .into());
                }
                self.distinct = true;
            }
            self.ctx.scopes.add_root(self.subquery, &name, entity);
            entity
        } else {
            self.process_attribute_chain(tree, i, &name, node)?
        };

        self.check_database(entity)?;

        for test in &qual.ifs {
            let monad = self.dispatch(test)?;
            let monad = if matches!(monad.value_type(self), Ok(Ty::Bool)) {
                monad
            } else {
                monad.nonzero(self)?
            };
            let cond_monads = match monad.kind {
                MonadKind::And(operands) => operands,
                _ => vec![monad],
            };
            for m in cond_monads {
                let sql = m.getsql_here(self)?;
                if !m.aggregated {
                    self.ctx
                        .scopes
                        .subquery_mut(self.subquery)
                        .conditions
                        .extend(sql);
                } else {
                    self.having_conditions.extend(sql);
                }
            }
        }
        Ok(())
    }

    /// Binds `for <name> in parent.a.b.c`, creating one joined tableref per
    /// traversed attribute.
    fn process_attribute_chain(
        &mut self,
        tree: &GenExpr,
        i: usize,
        name: &str,
        node: &Expr,
    ) -> Result<EntityId> {
        let mut attr_names = Vec::new();
        let mut current = node;
        while let ExprKind::Getattr { expr, attr } = &current.kind {
            attr_names.push(attr.clone());
            current = expr.as_ref();
        }
        let node_name = match (&current.kind, attr_names.is_empty()) {
            (ExprKind::Name(node_name), false) => node_name.clone(),
            _ => {
                return Err(Error::translation(format!(
                    "for {name} in {}",
                    ast2src(node)
                ))
                .into())
            }
        };
        attr_names.reverse();

        let parent_tableref = self
            .ctx
            .scopes
            .get_tableref(self.subquery, &node_name)
            .ok_or_else(|| {
                Error::translation(format!("Name '{node_name}' must be defined in query"))
            })?;
        let mut parent_entity = parent_tableref.entity;
        let mut parent_path = node_name.clone();
        let mut name_path = node_name;
        let last_index = attr_names.len() - 1;
        for (j, attr_name) in attr_names.iter().enumerate() {
            let schema = self.ctx.schema;
            let attr = schema.attr_ref(parent_entity, attr_name).ok_or_else(|| {
                Error::unknown_attribute(
                    schema.entity(parent_entity).name.clone(),
                    attr_name.clone(),
                )
            })?;
            let attribute = schema.attr(attr);
            let entity = match attribute.ty.as_entity() {
                Some(entity) => *entity,
                None => {
                    return Err(Error::unsupported(format!(
                        "for {name} in {}",
                        ast2src(node)
                    ))
                    .into())
                }
            };
            if attribute.is_collection {
                let reverse = schema.reverse_of(attribute)?;
                if reverse.is_collection {
                    self.distinct = true;
                } else {
                    let previous = if i == 0 {
                        tree.quals.last()
                    } else {
                        tree.quals.get(i - 1)
                    };
                    let previous_name =
                        previous.and_then(|q| q.assign.kind.as_name()).cloned();
                    let parent_alias = self
                        .ctx
                        .scopes
                        .get_tableref(self.subquery, &parent_path)
                        .and_then(|tr| tr.alias.clone());
                    if parent_alias != previous_name {
                        self.distinct = true;
                    }
                }
            }
            name_path = if j == last_index {
                name.to_string()
            } else {
                format!("{name_path}-{}", attribute.name)
            };
            self.ctx
                .scopes
                .add_joined(self.subquery, &name_path, &parent_path, attr, entity);
            parent_path = name_path.clone();
            parent_entity = entity;
        }
        Ok(parent_entity)
    }

    fn process_selector(mut self, tree: &GenExpr) -> Result<Translation> {
        let monad = self.dispatch(&tree.expr)?;
        debug_assert!(!self.hint_join);
        debug_assert!(!self.inside_not);
        if let MonadKind::Param { .. } = &monad.kind {
            return Err(Error::translation(format!(
                "External parameter '{}' cannot be used as query result",
                ast2src(&tree.expr)
            ))
            .into());
        }

        let expr_type = match monad.value_type(&self)? {
            Ty::Set(item) => *item,
            other => other,
        };

        let translation = match expr_type {
            Ty::Entity(entity) => self.entity_selector(monad, entity)?,
            expr_type => self.row_selector(monad, expr_type)?,
        };

        // A nested scope's leading join condition correlates it with the
        // enclosing query; it belongs in WHERE, not in FROM.
        let mut translation = translation;
        let leading = self
            .ctx
            .scopes
            .subquery(translation.subquery)
            .from
            .items
            .first()
            .map(|item| item.condition.is_some())
            .unwrap_or(false);
        if leading {
            debug_assert!(self.has_parent);
            let popped = self.ctx.scopes.pop_first_join_condition(translation.subquery);
            let conditions = &mut self.ctx.scopes.subquery_mut(translation.subquery).conditions;
            conditions.splice(0..0, popped);
        }
        translation.having_conditions = self.having_conditions;
        Ok(translation)
    }

    fn entity_selector(&mut self, monad: Monad, entity: EntityId) -> Result<Translation> {
        if monad.aggregated {
            return Err(Error::translation(
                "aggregated expression cannot be used as query result",
            )
            .into());
        }
        let sq = self.subquery;
        let path = match &monad.kind {
            MonadKind::ObjectIter { .. } | MonadKind::ObjectAttr { .. } => monad
                .object_path()
                .map(String::from)
                .unwrap_or_default(),
            MonadKind::AttrSet { .. } => monad.make_tableref(self, sq)?,
            _ => {
                return Err(Error::translation(
                    "this expression cannot be used as query result",
                )
                .into())
            }
        };
        if !self.aggregated {
            self.distinct |= monad.requires_distinct(self, false);
        }
        let (alias, pk_columns) = self.make_join_in(sq, &path, self.has_parent)?;
        let groupby_columns = if self.aggregated {
            // The entity becomes the sole grouping key.
            Some(monad.getsql_here(self)?)
        } else {
            None
        };
        let expr_columns: Vec<SqlAst> = pk_columns
            .iter()
            .map(|c| SqlAst::Column(alias.clone(), c.clone()))
            .collect();
        Ok(Translation {
            subquery: self.subquery,
            expr_type: Ty::Entity(entity),
            orderby_columns: (1..=expr_columns.len()).collect(),
            expr_columns,
            row_layout: None,
            having_conditions: Vec::new(),
            groupby_columns,
            order: Vec::new(),
            distinct: self.distinct,
            aggregated: self.aggregated,
            alias: Some(alias),
            tableref: Some(path),
            expr_nullable: true,
            optimize: self.optimize.clone(),
            aggregated_subquery_paths: self.aggregated_subquery_paths.clone(),
        })
    }

    fn row_selector(&mut self, monad: Monad, expr_type: Ty) -> Result<Translation> {
        let expr_monads = match monad.kind {
            MonadKind::List(items) => items,
            _ => vec![monad],
        };
        let expr_type = match &expr_monads[..] {
            [single] => single.value_type(self).unwrap_or(expr_type),
            _ => Ty::Row(
                expr_monads
                    .iter()
                    .map(|m| m.value_type(self))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        let mut expr_columns = Vec::new();
        for m in &expr_monads {
            expr_columns.extend(m.getsql_here(self)?);
        }

        let mut groupby_columns = None;
        if self.aggregated {
            let mut columns = Vec::new();
            for m in expr_monads.iter().filter(|m| !m.aggregated && !m.nogroup) {
                columns.extend(m.getsql_here(self)?);
            }
            groupby_columns = Some(columns).filter(|c| !c.is_empty());
        } else {
            self.ensure_rows_distinct(&expr_monads);
        }

        // Row layout and ordering offsets, in one left-to-right pass.
        let schema = self.ctx.schema;
        let mut row_layout = Vec::with_capacity(expr_monads.len());
        let mut offset = 0;
        for m in &expr_monads {
            let ty = match m.value_type(self)? {
                Ty::Set(item) => *item,
                other => other,
            };
            let src = m.src.clone().unwrap_or_default();
            match ty {
                Ty::Entity(entity) => {
                    let width = schema.entity(entity).pk_columns.len();
                    row_layout.push(RowSlot::Entity {
                        entity,
                        columns: offset..offset + width,
                        src,
                        order_columns: (offset + 1..=offset + width).collect(),
                    });
                    offset += width;
                }
                ty => {
                    row_layout.push(RowSlot::Scalar {
                        ty,
                        offset,
                        src,
                        order_columns: vec![offset + 1],
                    });
                    offset += 1;
                }
            }
        }

        let expr_nullable = match &expr_monads[..] {
            [single] => match &single.kind {
                MonadKind::Attr { attr, .. } => schema.attr(*attr).nullable,
                _ => true,
            },
            _ => true,
        };

        Ok(Translation {
            subquery: self.subquery,
            expr_type,
            expr_columns,
            row_layout: Some(row_layout),
            having_conditions: Vec::new(),
            groupby_columns,
            order: Vec::new(),
            distinct: self.distinct,
            aggregated: self.aggregated,
            alias: None,
            tableref: None,
            expr_nullable,
            orderby_columns: Vec::new(),
            optimize: self.optimize.clone(),
            aggregated_subquery_paths: self.aggregated_subquery_paths.clone(),
        })
    }

    /// A non-aggregated projection must be DISTINCT when some bound table
    /// contributes no column (nor its full pk) to the output row.
    fn ensure_rows_distinct(&mut self, expr_monads: &[Monad]) {
        let mut expr_set: HashSet<(String, Option<String>)> = HashSet::new();
        for m in expr_monads {
            match &m.kind {
                MonadKind::ObjectIter { path, .. } => {
                    expr_set.insert((path.clone(), None));
                }
                MonadKind::Attr { parent, attr, .. } => {
                    if let MonadKind::ObjectIter { path, .. } = &parent.kind {
                        let name = self.ctx.schema.attr(*attr).name.clone();
                        expr_set.insert((path.clone(), Some(name)));
                    }
                }
                _ => {}
            }
        }
        for tr in self.ctx.scopes.subquery(self.subquery).tablerefs() {
            if expr_set.contains(&(tr.name_path.clone(), None)) {
                continue;
            }
            let entity = self.ctx.schema.entity(tr.entity);
            let covered = entity
                .pk_attrs
                .iter()
                .all(|a| expr_set.contains(&(tr.name_path.clone(), Some(a.clone()))));
            if covered {
                continue;
            }
            self.distinct = true;
            return;
        }
    }

    // --- the type-directed AST walk -----------------------------------

    pub(crate) fn dispatch(&mut self, node: &Expr) -> Result<Monad> {
        let mut monad = if node.external && !node.constant {
            self.dispatch_external(node)
                .map_err(|e| attach_expr_context(e, &ast2src(node)))?
        } else {
            self.dispatch_node(node)
                .map_err(|e| attach_expr_context(e, &ast2src(node)))?
        };
        if monad.src.is_none() {
            monad.src = Some(ast2src(node));
        }
        if monad.aggregated {
            self.aggregated = true;
            if monad.nogroup && !matches!(monad.kind, MonadKind::List(_)) {
                return Err(Error::unsupported(
                    "Aggregation functions with different semantics cannot be mixed. \
                     Got: {EXPR}",
                )
                .with_expr(ast2src(node))
                .into());
            }
        }
        Ok(monad)
    }

    /// Lifts a node referring to a value outside the query, using the type
    /// environment.
    fn dispatch_external(&mut self, node: &Expr) -> Result<Monad> {
        let src = external_src(node)?;
        let ty = self
            .ctx
            .vartypes
            .get(src)
            .ok_or_else(|| Error::translation(format!("Name '{src}' must be defined in query")))?
            .clone();
        match ty {
            Ty::None => Ok(Monad::constant(Literal::Null)),
            Ty::Set(item) => match *item {
                Ty::Entity(entity) => {
                    self.check_database(entity)?;
                    Ok(Monad::new(MonadKind::Entity(entity)))
                }
                _ => Err(Error::unsupported(format!(
                    "collection parameter '{src}' cannot be used inside a query"
                ))
                .into()),
            },
            Ty::Function(builtin) => Ok(Monad::new(MonadKind::Func(builtin))),
            Ty::Method(entity, method) => {
                self.check_database(entity)?;
                let entity_monad = Monad::new(MonadKind::Entity(entity));
                Ok(entity_monad.bind_method(&method))
            }
            Ty::Bool if matches!(node.kind.as_name().map(String::as_str), Some("True")) => {
                Ok(Monad::constant(Literal::Int(1)))
            }
            Ty::Bool if matches!(node.kind.as_name().map(String::as_str), Some("False")) => {
                Ok(Monad::constant(Literal::Int(0)))
            }
            Ty::Row(items) => Ok(Monad::new(MonadKind::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, ty)| {
                        Monad::new(MonadKind::Param {
                            key: crate::sql::ast::ParamKey::indexed(src, i),
                            ty,
                        })
                    })
                    .collect(),
            ))),
            ty => {
                if let Ty::Entity(entity) = &ty {
                    self.check_database(*entity)?;
                }
                Ok(Monad::new(MonadKind::Param {
                    key: crate::sql::ast::ParamKey::new(src),
                    ty,
                }))
            }
        }
    }

    fn dispatch_node(&mut self, node: &Expr) -> Result<Monad> {
        match &node.kind {
            ExprKind::Name(name) => {
                let tableref = self
                    .ctx
                    .scopes
                    .get_tableref(self.subquery, name)
                    .ok_or_else(|| {
                        Error::translation(format!("Name '{name}' must be defined in query"))
                    })?;
                Ok(Monad::new(MonadKind::ObjectIter {
                    path: name.clone(),
                    entity: tableref.entity,
                }))
            }
            ExprKind::Literal(value) => Ok(Monad::constant(value.clone())),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let monads = items
                    .iter()
                    .map(|item| self.dispatch(item))
                    .collect::<Result<Vec<_>>>()?;
                let children: Vec<&Monad> = monads.iter().collect();
                let (aggregated, nogroup) = inherit_flags(&children);
                Ok(Monad {
                    kind: MonadKind::List(monads),
                    aggregated,
                    nogroup,
                    src: None,
                })
            }
            ExprKind::Binary { left, op, right } => {
                let left_monad = self.dispatch(left)?;
                let right_monad = self.dispatch(right)?;
                left_monad.binop(*op, right_monad, self)
            }
            ExprKind::Neg(operand) => {
                let monad = self.dispatch(operand)?;
                monad.neg(self)
            }
            ExprKind::Compare { left, ops } => self.dispatch_compare(left, ops),
            ExprKind::And(items) => {
                let monads = items
                    .iter()
                    .map(|item| self.dispatch(item))
                    .collect::<Result<Vec<_>>>()?;
                self.logical(monads, true)
            }
            ExprKind::Or(items) => {
                let monads = items
                    .iter()
                    .map(|item| self.dispatch(item))
                    .collect::<Result<Vec<_>>>()?;
                self.logical(monads, false)
            }
            ExprKind::Not(operand) => {
                self.inside_not = !self.inside_not;
                let monad = self.dispatch(operand);
                self.inside_not = !self.inside_not;
                monad?.negate(self)
            }
            ExprKind::Getattr { expr, attr } => {
                let monad = self.dispatch(expr)?;
                monad.getattr(attr, self)
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                star_args,
                dstar_args,
            } => self.dispatch_call(func, args, keywords, star_args, dstar_args),
            ExprKind::Subscript { expr, index } => self.dispatch_subscript(expr, index),
            ExprKind::Lambda { .. } => Err(Error::unsupported(
                "lambda is only allowed as the argument of select() in {EXPR}",
            )
            .into()),
            ExprKind::Comprehension(inner) => {
                let sub = self.subtranslate(inner, HashMap::new())?;
                Ok(queryset_monad(sub))
            }
        }
    }

    fn dispatch_compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)]) -> Result<Monad> {
        let mut left_monad = self.dispatch(left)?;
        let inside_not = self.inside_not;
        let mut monads = Vec::with_capacity(ops.len());
        for (op, right) in ops {
            self.inside_not = if *op == CmpOp::NotIn {
                !inside_not
            } else {
                inside_not
            };
            let right_monad = self.dispatch(right)?;
            let mut monad = match op {
                CmpOp::In => right_monad
                    .clone()
                    .contains(left_monad.clone(), false, self)?,
                CmpOp::NotIn => right_monad
                    .clone()
                    .contains(left_monad.clone(), true, self)?,
                _ => left_monad.clone().cmp(*op, right_monad.clone(), self)?,
            };
            monad.aggregated = left_monad.aggregated || right_monad.aggregated;
            monad.nogroup = left_monad.nogroup || right_monad.nogroup;
            if monad.aggregated && monad.nogroup {
                return Err(Error::unsupported(
                    "Aggregation functions with different semantics cannot be mixed. \
                     Got: {EXPR}",
                )
                .into());
            }
            monads.push(monad);
            left_monad = right_monad;
        }
        self.inside_not = inside_not;
        if monads.len() == 1 {
            return Ok(monads.swap_remove(0));
        }
        self.logical(monads, true)
    }

    fn logical(&mut self, operands: Vec<Monad>, conjunction: bool) -> Result<Monad> {
        let mut items = Vec::with_capacity(operands.len());
        for operand in operands {
            let operand = if matches!(operand.value_type(self), Ok(Ty::Bool)) {
                operand
            } else {
                operand.nonzero(self)?
            };
            match operand.kind {
                MonadKind::And(inner) if conjunction => items.extend(inner),
                MonadKind::Or(inner) if !conjunction => items.extend(inner),
                _ => items.push(operand),
            }
        }
        let children: Vec<&Monad> = items.iter().collect();
        let (aggregated, nogroup) = inherit_flags(&children);
        let kind = if conjunction {
            MonadKind::And(items)
        } else {
            MonadKind::Or(items)
        };
        Ok(Monad {
            kind,
            aggregated,
            nogroup,
            src: None,
        })
    }

    fn dispatch_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
        star_args: &Option<Box<Expr>>,
        dstar_args: &Option<Box<Expr>>,
    ) -> Result<Monad> {
        if let Some(star) = star_args {
            return Err(Error::unsupported(format!(
                "*{} is not supported",
                ast2src(star)
            ))
            .into());
        }
        if let Some(dstar) = dstar_args {
            return Err(Error::unsupported(format!(
                "**{} is not supported",
                ast2src(dstar)
            ))
            .into());
        }
        if !matches!(func.kind, ExprKind::Name(_) | ExprKind::Getattr { .. }) {
            return Err(Error::unsupported("this callable cannot be used in {EXPR}").into());
        }
        let func_monad = self.dispatch(func)?;

        use crate::sql::functions::Builtin;
        if matches!(func_monad.kind, MonadKind::Func(Builtin::Join)) {
            // The hint scopes over the translation of the argument.
            if args.len() != 1 || !keywords.is_empty() {
                return Err(Error::invalid_type(
                    "JOIN() takes exactly 1 argument".to_string(),
                )
                .into());
            }
            let previous = self.hint_join;
            self.hint_join = true;
            let result = self.dispatch(&args[0]);
            self.hint_join = previous;
            return result;
        }

        if let [arg] = args {
            if let ExprKind::Lambda { .. } = &arg.kind {
                return self.entity_select_rewrite(func_monad, arg);
            }
        }

        let arg_monads = args
            .iter()
            .map(|arg| self.dispatch(arg))
            .collect::<Result<Vec<_>>>()?;
        let mut kwarg_monads = Vec::with_capacity(keywords.len());
        for (name, value) in keywords {
            kwarg_monads.push((name.clone(), self.dispatch(value)?));
        }
        let mut children: Vec<&Monad> = arg_monads.iter().collect();
        children.extend(kwarg_monads.iter().map(|(_, m)| m));
        let (aggregated, nogroup) = inherit_flags(&children);
        let mut result = func_monad.call(arg_monads, kwarg_monads, self)?;
        result.aggregated |= aggregated;
        result.nogroup |= nogroup;
        Ok(result)
    }

    /// Rewrites `Entity.select(lambda x: cond)` into a synthetic nested
    /// comprehension `x for x in Entity if cond`. The lambda parameter is
    /// bound in the inner scope and shadows outer targets of the same
    /// name; unshadowed outer names stay visible and correlate the
    /// subquery.
    fn entity_select_rewrite(&mut self, func_monad: Monad, lambda: &Expr) -> Result<Monad> {
        let entity = match &func_monad.kind {
            MonadKind::Method { parent, name } if name == "select" => match &parent.kind {
                MonadKind::Entity(entity) => *entity,
                _ => {
                    return Err(Error::unsupported(
                        "only select() on an entity accepts a lambda",
                    )
                    .into())
                }
            },
            _ => {
                return Err(
                    Error::unsupported("only select() on an entity accepts a lambda").into(),
                )
            }
        };
        let (params, body, varargs, kwargs) = match &lambda.kind {
            ExprKind::Lambda {
                params,
                body,
                varargs,
                kwargs,
            } => (params, body, *varargs, *kwargs),
            _ => unreachable!("caller matched a lambda"),
        };
        if params.len() != 1 || varargs || kwargs {
            return Err(Error::invalid_type(
                "select() lambda must take a single plain argument".to_string(),
            )
            .into());
        }
        let iter_name = params[0].clone();
        let entity_name = self.ctx.schema.entity(entity).name.clone();
        let inner = GenExpr {
            expr: Expr::name(iter_name.clone()),
            quals: vec![Qualifier {
                assign: Expr::name(iter_name),
                iter: Expr::name(entity_name.clone()),
                ifs: vec![(**body).clone()],
            }],
        };
        let mut prebound = HashMap::new();
        prebound.insert(entity_name, entity);
        let sub = self.subtranslate(&inner, prebound)?;
        Ok(queryset_monad(sub))
    }

    fn dispatch_subscript(&mut self, expr: &Expr, index: &Subscript) -> Result<Monad> {
        let monad = self.dispatch(expr)?;
        match index {
            Subscript::Item(item) => {
                let key = self.dispatch(item)?;
                monad.index(key, self)
            }
            Subscript::Tuple(items) => {
                let monads = items
                    .iter()
                    .map(|item| self.dispatch(item))
                    .collect::<Result<Vec<_>>>()?;
                monad.index(Monad::new(MonadKind::List(monads)), self)
            }
            Subscript::Slice { lower, upper, step } => {
                if step.is_some() {
                    return Err(Error::invalid_type("Step is not supported in {EXPR}").into());
                }
                let lower = lower
                    .as_ref()
                    .map(|e| self.dispatch(e))
                    .transpose()?;
                let upper = upper
                    .as_ref()
                    .map(|e| self.dispatch(e))
                    .transpose()?;
                monad.slice(lower, upper, self)
            }
        }
    }

    pub(crate) fn subtranslate(
        &mut self,
        inner: &GenExpr,
        prebound: HashMap<String, EntityId>,
    ) -> Result<Translation> {
        SqlTranslator::run(self.ctx, inner, Some(self.subquery), false, None, prebound)
    }
}

fn external_src(node: &Expr) -> Result<&str> {
    node.src.as_deref().ok_or_else(|| {
        Error::translation("external node carries no source key".to_string()).into()
    })
}

/// A constructed translator: the outputs of §6.3 plus final assembly.
pub struct Translator<'env> {
    ctx: Context<'env>,
    main: Translation,
    extractors: Extractors,
}

impl<'env> Translator<'env> {
    pub fn new(
        schema: &'env Schema,
        tree: &GenExpr,
        extractors: Extractors,
        vartypes: &'env HashMap<String, Ty>,
        options: Options,
    ) -> Result<Self> {
        let mut ctx = Context {
            schema,
            vartypes,
            dialect: options.dialect.handler(),
            scopes: Scopes::new(),
            database: None,
        };
        let main = SqlTranslator::run(
            &mut ctx,
            tree,
            None,
            options.left_join,
            options.optimize,
            HashMap::new(),
        )?;
        Ok(Translator {
            ctx,
            main,
            extractors,
        })
    }

    pub fn expr_type(&self) -> &Ty {
        &self.main.expr_type
    }

    pub fn expr_columns(&self) -> &[SqlAst] {
        &self.main.expr_columns
    }

    pub fn row_layout(&self) -> Option<&[RowSlot]> {
        self.main.row_layout.as_deref()
    }

    pub fn distinct(&self) -> bool {
        self.main.distinct
    }

    pub fn aggregated(&self) -> bool {
        self.main.aggregated
    }

    pub fn conditions(&self) -> &[SqlAst] {
        &self.ctx.scopes.subquery(self.main.subquery).conditions
    }

    pub fn having_conditions(&self) -> &[SqlAst] {
        &self.main.having_conditions
    }

    pub fn from_clause(&self) -> &FromClause {
        &self.ctx.scopes.subquery(self.main.subquery).from
    }

    pub fn extractors(&self) -> &Extractors {
        &self.extractors
    }

    /// One-based output column positions of the selected entity's pk, for
    /// callers assembling ORDER BY.
    pub fn orderby_columns(&self) -> &[usize] {
        &self.main.orderby_columns
    }

    /// Appends ordering keys emitted into the ORDER BY clause.
    pub fn order_by(&mut self, keys: Vec<SqlAst>) {
        self.main.order.extend(keys);
    }

    /// The single aggregated traversal that the caller may retry with
    /// `Options::optimize`, if any.
    pub fn can_be_optimized(&self) -> Option<&str> {
        if self.main.groupby_columns.is_some() {
            return None;
        }
        if self.main.aggregated_subquery_paths.len() != 1 {
            return None;
        }
        self.main
            .aggregated_subquery_paths
            .iter()
            .next()
            .map(String::as_str)
    }

    /// Assembles the final SQL AST.
    pub fn construct_sql_ast(
        &self,
        range: Option<(u64, u64)>,
        distinct: Option<bool>,
        aggr_func: Option<Tag>,
    ) -> Result<(SqlAst, Option<AttrOffsets>)> {
        let main = &self.main;
        let distinct = distinct.unwrap_or(main.distinct);
        let mut attr_offsets = None;
        let mut wrap_count = false;

        let select_ast = if let Some(aggr) = aggr_func {
            self.aggregate_select_clause(aggr, &mut wrap_count)?
        } else if let (Ty::Entity(entity), None) = (&main.expr_type, &main.optimize) {
            let alias = main.alias.clone().unwrap_or_default();
            let (select_ast, offsets) = self
                .ctx
                .schema
                .entity(*entity)
                .construct_select_clause(&alias, distinct);
            attr_offsets = Some(offsets);
            select_ast
        } else {
            let head = if distinct { Tag::Distinct } else { Tag::All };
            SqlAst::Node(head, main.expr_columns.clone())
        };

        let mut sql = vec![
            select_ast,
            SqlAst::From(self.ctx.scopes.subquery(main.subquery).from.clone()),
        ];
        let conditions = &self.ctx.scopes.subquery(main.subquery).conditions;
        if !conditions.is_empty() {
            sql.push(SqlAst::Node(Tag::Where, conditions.clone()));
        }
        let has_group_by = match &main.groupby_columns {
            Some(columns) => {
                sql.push(SqlAst::Node(Tag::GroupBy, columns.clone()));
                true
            }
            None => false,
        };
        if !main.having_conditions.is_empty() {
            if !has_group_by {
                return Err(Error::translation(
                    "In order to use aggregated functions such as SUM(), COUNT(), etc., \
                     query must have grouping columns (i.e. resulting non-aggregated values)",
                )
                .into());
            }
            sql.push(SqlAst::Node(Tag::Having, main.having_conditions.clone()));
        }
        if !main.order.is_empty() {
            sql.push(SqlAst::Node(Tag::OrderBy, main.order.clone()));
        }
        if let Some((start, stop)) = range {
            let mut limit = vec![SqlAst::Value(Literal::Int((stop - start) as i64))];
            if start > 0 {
                limit.push(SqlAst::Value(Literal::Int(start as i64)));
            }
            sql.push(SqlAst::Node(Tag::Limit, limit));
        }

        let mut sql_ast = SqlAst::Node(Tag::Select, sql);
        if wrap_count {
            // COUNT of a DISTINCT multi-column result wraps the whole
            // query: SELECT COUNT(*) FROM (SELECT DISTINCT …) t.
            let mut from = FromClause::new(FromHead::From);
            from.push_subselect("t".to_string(), sql_ast, None);
            sql_ast = SqlAst::Node(
                Tag::Select,
                vec![
                    SqlAst::Node(
                        Tag::Aggregates,
                        vec![SqlAst::Node(
                            Tag::Count,
                            vec![SqlAst::Node(Tag::All, vec![])],
                        )],
                    ),
                    SqlAst::From(from),
                ],
            );
        }
        Ok((sql_ast, attr_offsets))
    }

    fn aggregate_select_clause(&self, aggr: Tag, wrap_count: &mut bool) -> Result<SqlAst> {
        let main = &self.main;
        if !matches!(aggr, Tag::Count | Tag::Sum | Tag::Avg | Tag::Min | Tag::Max) {
            return Err(Error::translation(format!(
                "'{aggr}' is not an aggregate function"
            ))
            .into());
        }
        let is_row_result = matches!(main.expr_type, Ty::Entity(_) | Ty::Row(_));
        let column_ast = if !matches!(main.expr_type, Ty::Entity(_)) {
            if matches!(aggr, Tag::Sum | Tag::Avg) && !main.expr_type.is_numeric() {
                return Err(Error::translation(format!(
                    "'{}' is valid for numeric attributes only",
                    aggr.to_string().to_lowercase()
                ))
                .into());
            }
            main.expr_columns.first().cloned()
        } else if aggr != Tag::Count {
            return Err(Error::translation(format!(
                "Attribute should be specified for '{}' aggregate function",
                aggr.to_string().to_lowercase()
            ))
            .into());
        } else {
            None
        };
        if aggr == Tag::Count {
            if is_row_result {
                if main.distinct {
                    *wrap_count = true;
                    return Ok(SqlAst::Node(Tag::Distinct, main.expr_columns.clone()));
                }
                return Ok(SqlAst::Node(
                    Tag::Aggregates,
                    vec![SqlAst::Node(
                        Tag::Count,
                        vec![SqlAst::Node(Tag::All, vec![])],
                    )],
                ));
            }
            let column = column_ast.ok_or_else(|| {
                Error::translation("nothing to count in this query".to_string())
            })?;
            return Ok(SqlAst::Node(
                Tag::Aggregates,
                vec![SqlAst::Node(
                    Tag::Count,
                    vec![SqlAst::Node(Tag::Distinct, vec![column])],
                )],
            ));
        }
        let column = column_ast.ok_or_else(|| {
            Error::translation("nothing to aggregate in this query".to_string())
        })?;
        Ok(SqlAst::Node(
            Tag::Aggregates,
            vec![SqlAst::Node(aggr, vec![column])],
        ))
    }
}
