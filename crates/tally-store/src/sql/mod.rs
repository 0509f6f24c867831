//! Backend kinds, SQL dialects and the typed statement builder.
//!
//! Table and column names never reach SQL text through string
//! interpolation of caller input: they are [`Identifier`]s, validated when
//! constructed, and statements such as [`CreateTable`] render themselves for
//! a [`Dialect`].
//!
//! ```rust
//! use tally_store::sql::{Column, CreateTable, Dialect, Identifier, SqlType};
//!
//! # fn example() -> tally_store::Result<()> {
//! let table = CreateTable::new(Identifier::new("servers")?)
//!     .column(Column::new(Identifier::new("id")?, SqlType::Integer).auto_increment())
//!     .column(Column::new(Identifier::new("name")?, SqlType::Varchar(100)).not_null());
//!
//! assert_eq!(
//!     table.to_sql(Dialect::Sqlite),
//!     "CREATE TABLE IF NOT EXISTS servers (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(100) NOT NULL)"
//! );
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod identifier;
pub mod statement;

pub use identifier::Identifier;
pub use statement::{
    AddColumn, Column, CreateIndex, CreateTable, DefaultValue, DropColumn, DropTable, SqlType,
};

/// Identifies the kind of backend a database runs against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "kebab-case")]
pub enum DbType {
    /// Single-file engine with one long-lived connection
    #[default]
    EmbeddedFile,

    /// In-process engine served through a connection pool
    EmbeddedServer,

    /// Remote engine reached over the network through a connection pool
    Networked,
}

impl DbType {
    /// SQL dialect spoken by this backend kind.
    pub fn dialect(&self) -> Dialect {
        match self {
            DbType::EmbeddedFile | DbType::EmbeddedServer => Dialect::Sqlite,
            DbType::Networked => Dialect::MySql,
        }
    }

    /// Whether connections are borrowed from a pool rather than reused.
    pub fn is_pooled(&self) -> bool {
        !matches!(self, DbType::EmbeddedFile)
    }

    /// Convert to the configuration string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::EmbeddedFile => "embedded-file",
            DbType::EmbeddedServer => "embedded-server",
            DbType::Networked => "networked",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "embedded-file" | "sqlite" => Ok(DbType::EmbeddedFile),
            "embedded-server" => Ok(DbType::EmbeddedServer),
            "networked" | "mysql" => Ok(DbType::Networked),
            _ => Err(format!("Invalid database type: {s}")),
        }
    }
}

/// SQL dialect used to render statements and introspection queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    /// Type name for a column of `sql_type`.
    pub fn type_name(&self, sql_type: SqlType) -> String {
        match (self, sql_type) {
            (_, SqlType::Integer) => "INTEGER".to_string(),
            (_, SqlType::BigInt) => "BIGINT".to_string(),
            (Dialect::Sqlite, SqlType::Boolean) => "BOOLEAN".to_string(),
            (Dialect::MySql, SqlType::Boolean) => "TINYINT(1)".to_string(),
            (_, SqlType::Double) => "DOUBLE".to_string(),
            (_, SqlType::Varchar(length)) => format!("VARCHAR({length})"),
            (_, SqlType::Text) => "TEXT".to_string(),
            (_, SqlType::Uuid) => "VARCHAR(36)".to_string(),
        }
    }

    /// Column suffix for an auto-incrementing primary key.
    pub fn auto_increment_primary_key(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "PRIMARY KEY AUTOINCREMENT",
            Dialect::MySql => "PRIMARY KEY AUTO_INCREMENT",
        }
    }

    /// Literal for a boolean value. Both dialects store booleans as 0/1.
    pub fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    /// Query returning one row with a non-zero count when `table` exists.
    ///
    /// Binds one parameter: the table name.
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            Dialect::MySql => {
                "SELECT COUNT(*) FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
            }
        }
    }

    /// Query returning one row with a non-zero count when a column exists.
    ///
    /// Binds two parameters: the table name, then the column name.
    pub fn column_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            Dialect::MySql => {
                "SELECT COUNT(*) FROM information_schema.COLUMNS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?"
            }
        }
    }

    /// Query returning one row with a non-zero count when an index exists.
    ///
    /// Binds two parameters: the table name, then the index name.
    pub fn index_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2"
            }
            Dialect::MySql => {
                "SELECT COUNT(*) FROM information_schema.STATISTICS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = ?"
            }
        }
    }

    /// Whether `CREATE INDEX IF NOT EXISTS` is understood.
    pub fn supports_index_if_not_exists(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}
