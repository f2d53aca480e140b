//! Read-only view of the entity schema.
//!
//! Entities live in an arena owned by [Schema] and are referred to by
//! [EntityId]; attributes point at their target entity by id and at their
//! reverse relation by name, so the graph stays acyclic and cheap to share.

use serde::{Deserialize, Serialize};

use crate::ast::Literal;
use crate::error::{Error, Result};
use crate::sql::ast::{sqlor, SqlAst, Tag};
use crate::types::Ty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub usize);

/// One attribute of one entity, addressable without borrowing the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrRef {
    pub entity: EntityId,
    pub index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    entities: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    /// Label of the database the entity belongs to; a query may only mix
    /// entities with the same label.
    pub database: String,
    pub table: String,
    /// Primary key attribute names, in key order.
    pub pk_attrs: Vec<String>,
    /// The flattened column list of the primary key.
    pub pk_columns: Vec<String>,
    pub attrs: Vec<Attribute>,
    pub discriminator: Option<Discriminator>,
    /// Root of the inheritance tree; entities are comparable iff their
    /// roots coincide. `None` means the entity is its own root.
    pub root: Option<EntityId>,
}

/// Restricts a table shared between entity subclasses to the rows of one
/// entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discriminator {
    /// Name of the discriminator attribute.
    pub attr: String,
    /// Admissible values for this entity and its subclasses.
    pub values: Vec<Literal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    /// Declared type; for collections, the item type.
    pub ty: Ty,
    pub is_collection: bool,
    /// Columns in the owner's table, or the link table for many-to-many.
    /// Empty when the relation is owned by the reverse side.
    pub columns: Vec<String>,
    /// Name of the reverse attribute on the target entity.
    pub reverse: Option<String>,
    /// Position of the attribute within the owner's primary key.
    pub pk_offset: Option<usize>,
    /// Offset of the attribute's columns within the flattened pk columns.
    pub pk_columns_offset: usize,
    pub required: bool,
    pub nullable: bool,
    /// Link table of a many-to-many relation.
    pub m2m_table: Option<String>,
    /// Far-side link columns of a symmetric many-to-many relation.
    pub reverse_columns: Vec<String>,
    pub symmetric: bool,
}

/// Per-attribute column offsets of a hydrating SELECT clause.
pub type AttrOffsets = Vec<(String, Vec<usize>)>;

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        self.entities.push(entity);
        EntityId(self.entities.len() - 1)
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0]
    }

    pub fn attr(&self, r: AttrRef) -> &Attribute {
        &self.entities[r.entity.0].attrs[r.index]
    }

    pub fn attr_ref(&self, entity: EntityId, name: &str) -> Option<AttrRef> {
        let index = self.entity(entity).attrs.iter().position(|a| a.name == name)?;
        Some(AttrRef { entity, index })
    }

    pub fn entity_named(&self, name: &str) -> Option<EntityId> {
        self.entities
            .iter()
            .position(|e| e.name == name)
            .map(EntityId)
    }

    pub fn root_of(&self, id: EntityId) -> EntityId {
        self.entity(id).root.unwrap_or(id)
    }

    pub fn same_root(&self, a: EntityId, b: EntityId) -> bool {
        self.root_of(a) == self.root_of(b)
    }

    /// The reverse attribute of a relation, on its target entity.
    pub fn reverse_of(&self, attr: &Attribute) -> Result<&Attribute> {
        let target = attr.ty.as_entity().copied().ok_or_else(|| {
            Error::translation(format!("attribute '{}' is not a relation", attr.name))
        })?;
        let name = attr.reverse.as_deref().ok_or_else(|| {
            Error::translation(format!("attribute '{}' has no reverse relation", attr.name))
        })?;
        let entity = self.entity(target);
        entity
            .attr_named(name)
            .ok_or_else(|| Error::unknown_attribute(entity.name.as_str(), name).into())
    }
}

impl Entity {
    pub fn attr_named(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn pk_is_composite(&self) -> bool {
        self.pk_columns.len() > 1
    }

    /// The condition restricting `alias` to rows of this entity, when the
    /// table carries a discriminator.
    pub fn discriminator_criteria(&self, alias: &str) -> Option<SqlAst> {
        let discr = self.discriminator.as_ref()?;
        let column = self
            .attr_named(&discr.attr)
            .and_then(|a| a.columns.first())?;
        let column_ast = SqlAst::Column(alias.to_string(), column.clone());
        let criteria = sqlor(
            discr
                .values
                .iter()
                .map(|v| {
                    SqlAst::Node(
                        Tag::Eq,
                        vec![column_ast.clone(), SqlAst::Value(v.clone())],
                    )
                })
                .collect(),
        );
        Some(criteria)
    }

    /// Full column vector used to hydrate instances of the entity, plus the
    /// offsets of each attribute within it.
    pub fn construct_select_clause(&self, alias: &str, distinct: bool) -> (SqlAst, AttrOffsets) {
        let mut columns = Vec::new();
        let mut offsets: AttrOffsets = Vec::new();
        for attr in &self.attrs {
            if attr.is_collection || attr.columns.is_empty() {
                continue;
            }
            let start = columns.len();
            for column in &attr.columns {
                columns.push(SqlAst::Column(alias.to_string(), column.clone()));
            }
            offsets.push((attr.name.clone(), (start..columns.len()).collect()));
        }
        let head = if distinct { Tag::Distinct } else { Tag::All };
        (SqlAst::Node(head, columns), offsets)
    }

    /// Normalized type of each primary key column, in column order. Used to
    /// bind external entity parameters column by column.
    pub fn pk_column_types(&self, schema: &Schema) -> Vec<Ty> {
        let mut types = Vec::new();
        for name in &self.pk_attrs {
            let attr = match self.attr_named(name) {
                Some(attr) => attr,
                None => continue,
            };
            match &attr.ty {
                Ty::Entity(target) => {
                    types.extend(schema.entity(*target).pk_column_types(schema))
                }
                ty => types.push(ty.clone()),
            }
        }
        types
    }
}

impl Attribute {
    /// A plain value attribute stored in the owner's table.
    pub fn value<S: Into<String>>(name: S, ty: Ty, columns: Vec<&str>) -> Self {
        Attribute {
            name: name.into(),
            ty,
            is_collection: false,
            columns: columns.into_iter().map(String::from).collect(),
            reverse: None,
            pk_offset: None,
            pk_columns_offset: 0,
            required: false,
            nullable: true,
            m2m_table: None,
            reverse_columns: Vec::new(),
            symmetric: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.nullable = false;
        self
    }

    /// Marks the attribute as primary-key position `offset`, with its
    /// columns starting at `columns_offset` of the flattened pk.
    pub fn pk(mut self, offset: usize, columns_offset: usize) -> Self {
        self.pk_offset = Some(offset);
        self.pk_columns_offset = columns_offset;
        self.required = true;
        self.nullable = false;
        self
    }

    /// A to-one relation whose foreign key lives in the owner's row.
    pub fn foreign_key<S: Into<String>>(
        name: S,
        target: EntityId,
        columns: Vec<&str>,
        reverse: &str,
    ) -> Self {
        Attribute {
            reverse: Some(reverse.to_string()),
            ..Attribute::value(name, Ty::Entity(target), columns)
        }
    }

    /// A to-many relation owned by the reverse side.
    pub fn set<S: Into<String>>(name: S, target: EntityId, reverse: &str) -> Self {
        Attribute {
            is_collection: true,
            reverse: Some(reverse.to_string()),
            ..Attribute::value(name, Ty::Entity(target), vec![])
        }
    }

    /// A many-to-many relation through a link table; `columns` point at the
    /// target entity inside the link table.
    pub fn many_to_many<S: Into<String>>(
        name: S,
        target: EntityId,
        table: &str,
        columns: Vec<&str>,
        reverse: &str,
    ) -> Self {
        Attribute {
            m2m_table: Some(table.to_string()),
            ..Attribute::set(name, target, reverse)
        }
        .with_columns(columns)
    }

    fn with_columns(mut self, columns: Vec<&str>) -> Self {
        self.columns = columns.into_iter().map(String::from).collect();
        self
    }
}
