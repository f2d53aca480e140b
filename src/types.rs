//! Normalized types and the comparability/coercion relations between them.
//!
//! Everything the type environment can say about a free variable is a [Ty].
//! The enum itself is the canonical form: constructors of literals and
//! attributes only ever produce these variants, so user-facing aliases are
//! collapsed before they reach the translator.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::ast::Literal;
use crate::schema::{EntityId, Schema};
use crate::sql::functions::Builtin;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Ty {
    Int,
    Float,
    Decimal,
    Bool,
    Str,
    Buffer,
    None,
    Date,
    Datetime,
    Entity(EntityId),
    Set(Box<Ty>),
    Row(Vec<Ty>),
    /// A built-in function usable inside queries.
    Function(Builtin),
    /// A bound method of an entity class, e.g. `Student.select`.
    Method(EntityId, String),
}

/// The comparison category an operator belongs to; comparability is decided
/// per category, not per operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equality,
    Ordering,
    Membership,
    /// LIKE and other string-pattern operations.
    Pattern,
}

impl Ty {
    pub fn set_of(item: Ty) -> Ty {
        Ty::Set(Box::new(item))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float | Ty::Decimal | Ty::Bool)
    }

    /// Types valid as arguments of MIN/MAX and of the ordering operators.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Ty::Int | Ty::Float | Ty::Decimal | Ty::Str | Ty::Date | Ty::Datetime
        )
    }

    /// Human-readable name used in diagnostics.
    pub fn describe(&self, schema: &Schema) -> String {
        match self {
            Ty::Int => "int".to_string(),
            Ty::Float => "float".to_string(),
            Ty::Decimal => "Decimal".to_string(),
            Ty::Bool => "bool".to_string(),
            Ty::Str => "unicode".to_string(),
            Ty::Buffer => "buffer".to_string(),
            Ty::None => "NoneType".to_string(),
            Ty::Date => "date".to_string(),
            Ty::Datetime => "datetime".to_string(),
            Ty::Entity(id) => schema.entity(*id).name.clone(),
            Ty::Set(item) => format!("Set of {}", item.describe(schema)),
            Ty::Row(_) => "list".to_string(),
            Ty::Function(builtin) => format!("function {}", builtin.name()),
            Ty::Method(entity, name) => {
                format!("method {}.{name}", schema.entity(*entity).name)
            }
        }
    }
}

/// The normalized type of a literal value.
pub fn type_of_literal(value: &Literal) -> Ty {
    match value {
        Literal::Null => Ty::None,
        Literal::Int(_) => Ty::Int,
        Literal::Float(_) => Ty::Float,
        Literal::Decimal(_) => Ty::Decimal,
        Literal::String(_) => Ty::Str,
        Literal::Bytes(_) => Ty::Buffer,
        Literal::Date(_) => Ty::Date,
        Literal::Datetime(_) => Ty::Datetime,
    }
}

/// Numeric promotion: `bool ⊂ int ⊂ float` and `bool ⊂ int ⊂ Decimal`.
/// Mixing binary floats with exact decimals has no sound result and yields
/// `None`.
pub fn coerce_types(left: &Ty, right: &Ty) -> Option<Ty> {
    if left == right {
        return Some(left.clone());
    }
    match (left, right) {
        (Ty::Bool, Ty::Int) | (Ty::Int, Ty::Bool) => Some(Ty::Int),
        (Ty::Bool, Ty::Float) | (Ty::Float, Ty::Bool) => Some(Ty::Float),
        (Ty::Bool, Ty::Decimal) | (Ty::Decimal, Ty::Bool) => Some(Ty::Decimal),
        (Ty::Int, Ty::Float) | (Ty::Float, Ty::Int) => Some(Ty::Float),
        (Ty::Int, Ty::Decimal) | (Ty::Decimal, Ty::Int) => Some(Ty::Decimal),
        _ => None,
    }
}

/// Whether `left` and `right` may be compared under the given category.
pub fn are_comparable_types(schema: &Schema, left: &Ty, right: &Ty, cmp: Comparison) -> bool {
    match cmp {
        Comparison::Pattern => left == &Ty::Str && right == &Ty::Str,
        Comparison::Membership => match right {
            Ty::Set(item) => are_comparable_types(schema, left, item, Comparison::Equality),
            Ty::Row(items) => items
                .iter()
                .all(|item| are_comparable_types(schema, left, item, Comparison::Equality)),
            _ => false,
        },
        Comparison::Ordering => {
            if left.is_numeric() && right.is_numeric() {
                left != &Ty::Bool && right != &Ty::Bool && coerce_types(left, right).is_some()
            } else {
                left == right && left.is_comparable()
            }
        }
        Comparison::Equality => {
            if left == &Ty::None || right == &Ty::None {
                return true;
            }
            if left.is_numeric() && right.is_numeric() {
                return coerce_types(left, right).is_some();
            }
            match (left, right) {
                (Ty::Entity(a), Ty::Entity(b)) => schema.same_root(*a, *b),
                (Ty::Row(a), Ty::Row(b)) => {
                    a.len() == b.len()
                        && a.iter().zip(b).all(|(x, y)| {
                            are_comparable_types(schema, x, y, Comparison::Equality)
                        })
                }
                (a, b) => {
                    a == b
                        && matches!(a, Ty::Str | Ty::Buffer | Ty::Date | Ty::Datetime)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coercion_lattice() {
        assert_eq!(coerce_types(&Ty::Int, &Ty::Float), Some(Ty::Float));
        assert_eq!(coerce_types(&Ty::Int, &Ty::Decimal), Some(Ty::Decimal));
        assert_eq!(coerce_types(&Ty::Float, &Ty::Decimal), None);
        assert_eq!(coerce_types(&Ty::Bool, &Ty::Int), Some(Ty::Int));
    }

    #[test]
    fn test_ordering_excludes_bool() {
        let schema = Schema::default();
        assert!(!are_comparable_types(
            &schema,
            &Ty::Bool,
            &Ty::Bool,
            Comparison::Ordering
        ));
        assert!(are_comparable_types(
            &schema,
            &Ty::Int,
            &Ty::Float,
            Comparison::Ordering
        ));
    }

    #[test]
    fn test_none_compares_for_identity_only() {
        let schema = Schema::default();
        assert!(are_comparable_types(
            &schema,
            &Ty::Str,
            &Ty::None,
            Comparison::Equality
        ));
        assert!(!are_comparable_types(
            &schema,
            &Ty::Str,
            &Ty::None,
            Comparison::Ordering
        ));
    }

    #[test]
    fn test_membership_unwraps_set() {
        let schema = Schema::default();
        assert!(are_comparable_types(
            &schema,
            &Ty::Int,
            &Ty::set_of(Ty::Float),
            Comparison::Membership
        ));
        assert!(!are_comparable_types(
            &schema,
            &Ty::Str,
            &Ty::set_of(Ty::Float),
            Comparison::Membership
        ));
    }
}
