//! Capability map for SQL dialects.
//!
//! The translator dispatches on capabilities, never on dialect names, with
//! one deliberate exception: old SQLite versions are gated explicitly,
//! because the workaround (counting ROWID) depends on the exact release
//! that fixed COUNT over subqueries.
//!
//! Dialect-specifics should be added only when the generic emission is not
//! accepted by the target — a composite-key COUNT(DISTINCT …) is the
//! canonical case.

use core::fmt::Debug;
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Generic,
    Postgres,
    MySql,
    Oracle,
    Sqlite { version: (u32, u32, u32) },
}

impl Dialect {
    pub fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::Generic => Box::new(GenericDialect),
            Dialect::Postgres => Box::new(PostgresDialect),
            Dialect::MySql => Box::new(MySqlDialect),
            Dialect::Oracle => Box::new(OracleDialect),
            Dialect::Sqlite { version } => Box::new(SqliteDialect { version: *version }),
        }
    }

    /// A SQLite dialect at the newest behaviour level.
    pub fn sqlite() -> Dialect {
        Dialect::Sqlite {
            version: (3, 45, 0),
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Generic
    }
}

#[derive(Debug)]
pub struct GenericDialect;
#[derive(Debug)]
pub struct PostgresDialect;
#[derive(Debug)]
pub struct MySqlDialect;
#[derive(Debug)]
pub struct OracleDialect;
#[derive(Debug)]
pub struct SqliteDialect {
    pub version: (u32, u32, u32),
}

pub trait DialectHandler: Any + Debug {
    fn name(&self) -> &'static str;

    /// Support for `(a, b) OP (c, d)` and `(a, b) IN (SELECT …)`.
    fn row_value_syntax(&self) -> bool {
        true
    }

    /// Support for `COUNT(DISTINCT (a, b))` over a row value. Oracle has
    /// row values but not this form.
    fn count_distinct_row(&self) -> bool {
        self.row_value_syntax()
    }

    /// Whether composite-key counting uses `COUNT(COUNT(*))` with an extra
    /// GROUP BY instead of a distinct row count.
    fn grouped_count(&self) -> bool {
        false
    }

    /// Name of an implicit per-row identifier usable as a counting rescue
    /// for composite keys.
    fn rowid(&self) -> Option<&'static str> {
        None
    }

    /// True when COUNT over a DISTINCT subquery is unreliable and the
    /// ROWID rescue must be used instead.
    fn legacy_rowid_count(&self) -> bool {
        false
    }
}

impl DialectHandler for GenericDialect {
    fn name(&self) -> &'static str {
        "Generic"
    }
}

impl DialectHandler for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }
}

impl DialectHandler for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }
}

impl DialectHandler for OracleDialect {
    fn name(&self) -> &'static str {
        "Oracle"
    }

    fn count_distinct_row(&self) -> bool {
        false
    }

    fn grouped_count(&self) -> bool {
        true
    }
}

impl DialectHandler for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn row_value_syntax(&self) -> bool {
        false
    }

    fn rowid(&self) -> Option<&'static str> {
        Some("ROWID")
    }

    fn legacy_rowid_count(&self) -> bool {
        self.version < (3, 6, 21)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version_gate() {
        let old = SqliteDialect {
            version: (3, 6, 20),
        };
        let new = SqliteDialect {
            version: (3, 6, 21),
        };
        assert!(old.legacy_rowid_count());
        assert!(!new.legacy_rowid_count());
    }

    #[test]
    fn test_oracle_counts_by_grouping() {
        let oracle = OracleDialect;
        assert!(oracle.row_value_syntax());
        assert!(!oracle.count_distinct_row());
        assert!(oracle.grouped_count());
    }
}
