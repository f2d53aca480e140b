//! Translation scopes: the arena of [Subquery] values and the [TableRef]
//! lifecycle.
//!
//! A tableref starts unjoined; the first `make_join` materialises the
//! FROM/JOIN entry and is idempotent afterwards. When only the primary key
//! of a to-one relation is needed and the foreign key is embedded in the
//! parent row, the join is elided and the parent's alias is reused; a later
//! full join upgrades the tableref in place.

use std::collections::HashMap;

use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::schema::{AttrRef, EntityId, Schema};
use crate::sql::ast::{flatten_and, join_tables, FromClause, FromHead, SqlAst};
use crate::utils::NameGenerator;

const MAX_ALIAS_LENGTH: usize = 30;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern")
});

fn is_ident(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubqueryId(pub usize);

/// Arena of all subqueries of one translation, root first.
#[derive(Debug)]
pub struct Scopes {
    subqueries: Vec<Subquery>,
    expr_names: NameGenerator,
}

#[derive(Debug)]
pub struct Subquery {
    pub parent: Option<SubqueryId>,
    pub from: FromClause,
    pub conditions: Vec<SqlAst>,
    tablerefs: HashMap<String, TableRef>,
    alias_counters: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct TableRef {
    pub name_path: String,
    pub subquery: SubqueryId,
    pub entity: EntityId,
    pub alias: Option<String>,
    pub joined: bool,
    pub optimized: bool,
    pub pk_columns: Vec<String>,
    pub kind: TableRefKind,
}

#[derive(Debug, Clone)]
pub enum TableRefKind {
    /// Bound by a `for x in Entity` qualifier.
    Root,
    /// Bound by attribute traversal; joins lazily against its parent.
    Joined { parent: String, attr: AttrRef },
}

impl Scopes {
    pub fn new() -> Self {
        Scopes {
            subqueries: Vec::new(),
            expr_names: NameGenerator::new("expr"),
        }
    }

    pub fn create_subquery(&mut self, parent: Option<SubqueryId>, left_join: bool) -> SubqueryId {
        let head = if left_join {
            FromHead::LeftJoin
        } else {
            FromHead::From
        };
        let alias_counters = parent
            .map(|p| self.subqueries[p.0].alias_counters.clone())
            .unwrap_or_default();
        self.subqueries.push(Subquery {
            parent,
            from: FromClause::new(head),
            conditions: Vec::new(),
            tablerefs: HashMap::new(),
            alias_counters,
        });
        SubqueryId(self.subqueries.len() - 1)
    }

    pub fn subquery(&self, id: SubqueryId) -> &Subquery {
        &self.subqueries[id.0]
    }

    pub fn subquery_mut(&mut self, id: SubqueryId) -> &mut Subquery {
        &mut self.subqueries[id.0]
    }

    /// Name of the next anonymous output column.
    pub fn next_expr_name(&mut self) -> String {
        self.expr_names.gen()
    }

    /// The subquery whose lexical scope defines `name_path`, starting from
    /// `sq` and walking towards the root.
    pub fn owner_of(&self, sq: SubqueryId, name_path: &str) -> Option<SubqueryId> {
        let mut current = Some(sq);
        while let Some(id) = current {
            if self.subqueries[id.0].tablerefs.contains_key(name_path) {
                return Some(id);
            }
            current = self.subqueries[id.0].parent;
        }
        None
    }

    pub fn get_tableref(&self, sq: SubqueryId, name_path: &str) -> Option<&TableRef> {
        let owner = self.owner_of(sq, name_path)?;
        self.subqueries[owner.0].tablerefs.get(name_path)
    }

    /// Whether `name` is already bound in `sq` itself (not in an enclosing
    /// scope); duplicate targets are only illegal within one scope.
    pub fn is_bound_locally(&self, sq: SubqueryId, name: &str) -> bool {
        self.subqueries[sq.0].tablerefs.contains_key(name)
    }

    pub fn add_root(&mut self, sq: SubqueryId, name: &str, entity: EntityId) {
        self.subqueries[sq.0].tablerefs.insert(
            name.to_string(),
            TableRef {
                name_path: name.to_string(),
                subquery: sq,
                entity,
                alias: Some(name.to_string()),
                joined: false,
                optimized: false,
                pk_columns: Vec::new(),
                kind: TableRefKind::Root,
            },
        );
    }

    /// Registers a joined tableref. A repeated registration at the same
    /// path rebinds it unjoined, matching qualifier-chain scoping.
    pub fn add_joined(
        &mut self,
        sq: SubqueryId,
        name_path: &str,
        parent_path: &str,
        attr: AttrRef,
        entity: EntityId,
    ) {
        self.subqueries[sq.0].tablerefs.insert(
            name_path.to_string(),
            TableRef {
                name_path: name_path.to_string(),
                subquery: sq,
                entity,
                alias: None,
                joined: false,
                optimized: false,
                pk_columns: Vec::new(),
                kind: TableRefKind::Joined {
                    parent: parent_path.to_string(),
                    attr,
                },
            },
        );
    }

    /// Short SQL alias for a table occurrence. Identifier-shaped name paths
    /// are reused verbatim; everything else gets an entity-name prefix and
    /// a per-scope counter.
    pub fn get_short_alias(
        &mut self,
        sq: SubqueryId,
        name_path: Option<&str>,
        entity_name: &str,
    ) -> String {
        if let Some(path) = name_path {
            if path.len() <= MAX_ALIAS_LENGTH && is_ident(path) {
                return path.to_string();
            }
        }
        let base: String = entity_name
            .chars()
            .take(MAX_ALIAS_LENGTH - 3)
            .collect::<String>()
            .to_lowercase();
        let counter = self.subqueries[sq.0]
            .alias_counters
            .entry(base.clone())
            .or_insert(0);
        *counter += 1;
        format!("{base}-{counter}")
    }

    /// Materialises the FROM/JOIN entry for `name_path`, if not already
    /// emitted, and returns its alias together with the columns addressing
    /// the referenced rows.
    pub fn make_join(
        &mut self,
        schema: &Schema,
        sq: SubqueryId,
        name_path: &str,
        pk_only: bool,
    ) -> Result<(String, Vec<String>)> {
        let owner = self.owner_of(sq, name_path).ok_or_else(|| {
            Error::translation(format!("Name '{name_path}' must be defined in query"))
        })?;
        let tr = self.subqueries[owner.0].tablerefs[name_path].clone();
        let entity = schema.entity(tr.entity);
        match tr.kind {
            TableRefKind::Root => {
                let alias = tr.alias.unwrap_or_else(|| name_path.to_string());
                if !tr.joined {
                    trace!("joining root table {} as {alias}", entity.table);
                    let subquery = &mut self.subqueries[owner.0];
                    subquery
                        .from
                        .push_table(alias.clone(), entity.table.clone(), None);
                    if let Some(criteria) = entity.discriminator_criteria(&alias) {
                        subquery.conditions.push(criteria);
                    }
                    self.mark_joined(owner, name_path, &alias, &entity.pk_columns, false);
                }
                Ok((alias, entity.pk_columns.clone()))
            }
            TableRefKind::Joined { parent, attr } => {
                let pk_only = pk_only && entity.discriminator.is_none();
                if tr.joined && (pk_only || !tr.optimized) {
                    let alias = tr.alias.unwrap_or_default();
                    return Ok((alias, tr.pk_columns));
                }
                let attribute = schema.attr(attr).clone();
                let parent_pk_only = attribute.pk_offset.is_some() || attribute.is_collection;
                let (parent_alias, left_pk_columns) =
                    self.make_join(schema, owner, &parent, parent_pk_only)?;
                let pk_columns = entity.pk_columns.clone();
                let table = entity.table.clone();

                let alias = if !attribute.is_collection {
                    if attribute.columns.is_empty() {
                        // Relation owned by the reverse side.
                        let reverse_columns = schema.reverse_of(&attribute)?.columns.clone();
                        let alias = self.get_short_alias(owner, Some(name_path), &entity.name);
                        let condition = join_tables(
                            &parent_alias,
                            &alias,
                            &left_pk_columns,
                            &reverse_columns,
                        );
                        self.subqueries[owner.0]
                            .from
                            .push_table(alias.clone(), table, Some(condition));
                        alias
                    } else {
                        let left_columns = if attribute.pk_offset.is_some() {
                            let offset = attribute.pk_columns_offset;
                            left_pk_columns[offset..offset + attribute.columns.len()].to_vec()
                        } else {
                            attribute.columns.clone()
                        };
                        if pk_only {
                            // The foreign key lives in the parent row: the
                            // join is elided and the parent alias reused.
                            self.mark_optimized(owner, name_path, &parent_alias, &left_columns);
                            return Ok((parent_alias, left_columns));
                        }
                        let alias = self.get_short_alias(owner, Some(name_path), &entity.name);
                        let condition =
                            join_tables(&parent_alias, &alias, &left_columns, &pk_columns);
                        self.subqueries[owner.0]
                            .from
                            .push_table(alias.clone(), table, Some(condition));
                        alias
                    }
                } else {
                    let reverse = schema.reverse_of(&attribute)?.clone();
                    if !reverse.is_collection {
                        let alias = self.get_short_alias(owner, Some(name_path), &entity.name);
                        let condition = join_tables(
                            &parent_alias,
                            &alias,
                            &left_pk_columns,
                            &reverse.columns,
                        );
                        self.subqueries[owner.0]
                            .from
                            .push_table(alias.clone(), table, Some(condition));
                        alias
                    } else {
                        // Both ends are collections: go through the link
                        // table.
                        let right_m2m_columns = if attribute.symmetric {
                            attribute.reverse_columns.clone()
                        } else {
                            attribute.columns.clone()
                        };
                        let m2m_alias = if !tr.joined {
                            let m2m_table = attribute.m2m_table.clone().ok_or_else(|| {
                                Error::translation(format!(
                                    "attribute '{}' has no link table",
                                    attribute.name
                                ))
                            })?;
                            let m2m_alias = self.get_short_alias(owner, None, "t");
                            let link_columns = if attribute.symmetric {
                                attribute.columns.clone()
                            } else {
                                reverse.columns.clone()
                            };
                            let condition = join_tables(
                                &parent_alias,
                                &m2m_alias,
                                &left_pk_columns,
                                &link_columns,
                            );
                            self.subqueries[owner.0].from.push_table(
                                m2m_alias.clone(),
                                m2m_table,
                                Some(condition),
                            );
                            if pk_only {
                                // The link table alone already addresses the
                                // far side's keys.
                                self.mark_optimized(
                                    owner,
                                    name_path,
                                    &m2m_alias,
                                    &right_m2m_columns,
                                );
                                return Ok((m2m_alias, right_m2m_columns));
                            }
                            m2m_alias
                        } else {
                            // Upgrading an optimized link-table ref to a
                            // full join against the far table.
                            tr.alias.clone().unwrap_or_default()
                        };
                        let alias = self.get_short_alias(owner, Some(name_path), &entity.name);
                        let condition =
                            join_tables(&m2m_alias, &alias, &right_m2m_columns, &pk_columns);
                        self.subqueries[owner.0]
                            .from
                            .push_table(alias.clone(), table, Some(condition));
                        alias
                    }
                };

                if let Some(criteria) = entity.discriminator_criteria(&alias) {
                    self.subqueries[owner.0].conditions.insert(0, criteria);
                }
                self.mark_joined(owner, name_path, &alias, &pk_columns, false);
                trace!("joined {name_path} as {alias}");
                Ok((alias, pk_columns))
            }
        }
    }

    /// Detaches the join condition of the first FROM item, split into its
    /// equality conjuncts. Used to correlate a nested subquery with its
    /// enclosing scope.
    pub fn pop_first_join_condition(&mut self, sq: SubqueryId) -> Vec<SqlAst> {
        self.subqueries[sq.0]
            .from
            .items
            .first_mut()
            .and_then(|item| item.condition.take())
            .map(flatten_and)
            .unwrap_or_default()
    }

    fn mark_joined(
        &mut self,
        owner: SubqueryId,
        name_path: &str,
        alias: &str,
        pk_columns: &[String],
        optimized: bool,
    ) {
        if let Some(tr) = self.subqueries[owner.0].tablerefs.get_mut(name_path) {
            tr.alias = Some(alias.to_string());
            tr.pk_columns = pk_columns.to_vec();
            tr.joined = true;
            tr.optimized = optimized;
        }
    }

    fn mark_optimized(
        &mut self,
        owner: SubqueryId,
        name_path: &str,
        alias: &str,
        pk_columns: &[String],
    ) {
        self.mark_joined(owner, name_path, alias, pk_columns, true);
    }
}

impl Subquery {
    /// Table occurrences of this scope only, for the distinct analysis of
    /// the selector pass.
    pub fn tablerefs(&self) -> impl Iterator<Item = &TableRef> {
        self.tablerefs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Entity, Schema};
    use crate::types::Ty;

    fn two_entity_schema() -> (Schema, EntityId, EntityId) {
        let mut schema = Schema::new();
        let group = schema.add_entity(Entity {
            name: "Group".to_string(),
            database: "school".to_string(),
            table: "group".to_string(),
            pk_attrs: vec!["id".to_string()],
            pk_columns: vec!["id".to_string()],
            attrs: vec![Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0)],
            discriminator: None,
            root: None,
        });
        let student = schema.add_entity(Entity {
            name: "Student".to_string(),
            database: "school".to_string(),
            table: "student".to_string(),
            pk_attrs: vec!["id".to_string()],
            pk_columns: vec!["id".to_string()],
            attrs: vec![
                Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0),
                Attribute::foreign_key("group", group, vec!["group"], "students").required(),
            ],
            discriminator: None,
            root: None,
        });
        (schema, group, student)
    }

    #[test]
    fn test_root_join_is_idempotent() {
        let (schema, _, student) = two_entity_schema();
        let mut scopes = Scopes::new();
        let sq = scopes.create_subquery(None, false);
        scopes.add_root(sq, "s", student);
        let first = scopes.make_join(&schema, sq, "s", false).unwrap();
        let second = scopes.make_join(&schema, sq, "s", true).unwrap();
        assert_eq!(first, second);
        assert_eq!(scopes.subquery(sq).from.items.len(), 1);
    }

    #[test]
    fn test_pk_only_fk_join_is_elided() {
        let (schema, _, student) = two_entity_schema();
        let mut scopes = Scopes::new();
        let sq = scopes.create_subquery(None, false);
        scopes.add_root(sq, "s", student);
        let attr = schema.attr_ref(student, "group").unwrap();
        scopes.add_joined(sq, "s-group", "s", attr, schema.attr(attr).ty.as_entity().copied().unwrap());
        let (alias, columns) = scopes.make_join(&schema, sq, "s-group", true).unwrap();
        assert_eq!(alias, "s");
        assert_eq!(columns, vec!["group".to_string()]);
        // only the root table is in FROM
        assert_eq!(scopes.subquery(sq).from.items.len(), 1);
        assert!(scopes.get_tableref(sq, "s-group").unwrap().optimized);
    }

    #[test]
    fn test_optimized_ref_upgrades_to_full_join() {
        let (schema, _, student) = two_entity_schema();
        let mut scopes = Scopes::new();
        let sq = scopes.create_subquery(None, false);
        scopes.add_root(sq, "s", student);
        let attr = schema.attr_ref(student, "group").unwrap();
        scopes.add_joined(sq, "s-group", "s", attr, schema.attr(attr).ty.as_entity().copied().unwrap());
        scopes.make_join(&schema, sq, "s-group", true).unwrap();
        let (alias, columns) = scopes.make_join(&schema, sq, "s-group", false).unwrap();
        assert_eq!(alias, "group-1");
        assert_eq!(columns, vec!["id".to_string()]);
        assert_eq!(scopes.subquery(sq).from.items.len(), 2);
        assert!(!scopes.get_tableref(sq, "s-group").unwrap().optimized);
    }

    #[test]
    fn test_alias_allocation() {
        let (_, _, student) = two_entity_schema();
        let mut scopes = Scopes::new();
        let sq = scopes.create_subquery(None, false);
        scopes.add_root(sq, "s", student);
        assert_eq!(scopes.get_short_alias(sq, Some("s"), "Student"), "s");
        assert_eq!(scopes.get_short_alias(sq, Some("s-group"), "Group"), "group-1");
        assert_eq!(scopes.get_short_alias(sq, None, "Group"), "group-2");
        assert_eq!(scopes.get_short_alias(sq, None, "t"), "t-1");
    }
}
