//! Schema statements rendered per dialect.

use super::{Dialect, Identifier};

/// Column type, mapped to a concrete name by [`Dialect::type_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Boolean,
    Double,
    Varchar(u16),
    Text,
    Uuid,
}

/// Literal default value of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl DefaultValue {
    fn render(&self, dialect: Dialect) -> String {
        match self {
            DefaultValue::Integer(value) => value.to_string(),
            DefaultValue::Boolean(value) => dialect.boolean_literal(*value).to_string(),
            DefaultValue::Text(value) => format!("'{}'", value.replace('\'', "''")),
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: Identifier,
    sql_type: SqlType,
    auto_increment: bool,
    not_null: bool,
    unique: bool,
    default: Option<DefaultValue>,
    references: Option<(Identifier, Identifier)>,
}

impl Column {
    pub fn new(name: Identifier, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            auto_increment: false,
            not_null: false,
            unique: false,
            default: None,
            references: None,
        }
    }

    /// Marks the column as the auto-incrementing primary key.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Adds a foreign key to `table(column)`.
    pub fn references(mut self, table: Identifier, column: Identifier) -> Self {
        self.references = Some((table, column));
        self
    }

    pub fn name(&self) -> &Identifier {
        &self.name
    }

    /// Renders the column definition without any trailing constraint clause.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut sql = format!("{} {}", self.name, dialect.type_name(self.sql_type));
        if self.auto_increment {
            sql.push(' ');
            sql.push_str(dialect.auto_increment_primary_key());
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.render(dialect));
        }
        sql
    }

    fn foreign_key_sql(&self) -> Option<String> {
        self.references.as_ref().map(|(table, column)| {
            format!("FOREIGN KEY({}) REFERENCES {table}({column})", self.name)
        })
    }
}

/// `CREATE TABLE IF NOT EXISTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    table: Identifier,
    columns: Vec<Column>,
}

impl CreateTable {
    pub fn new(table: Identifier) -> Self {
        Self {
            table,
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn table(&self) -> &Identifier {
        &self.table
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        let definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| column.to_sql(dialect))
            .chain(self.columns.iter().filter_map(Column::foreign_key_sql))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            definitions.join(", ")
        )
    }
}

/// `ALTER TABLE .. ADD COLUMN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddColumn {
    table: Identifier,
    column: Column,
}

impl AddColumn {
    pub fn new(table: Identifier, column: Column) -> Self {
        Self { table, column }
    }

    pub fn table(&self) -> &Identifier {
        &self.table
    }

    pub fn column(&self) -> &Column {
        &self.column
    }

    /// Foreign keys are not part of the rendered statement; SQLite cannot add
    /// them after creation.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.table,
            self.column.to_sql(dialect)
        )
    }
}

/// `CREATE INDEX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIndex {
    name: Identifier,
    table: Identifier,
    columns: Vec<Identifier>,
}

impl CreateIndex {
    pub fn new(name: Identifier, table: Identifier, columns: Vec<Identifier>) -> Self {
        Self {
            name,
            table,
            columns,
        }
    }

    pub fn name(&self) -> &Identifier {
        &self.name
    }

    pub fn table(&self) -> &Identifier {
        &self.table
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        let columns: Vec<&str> = self.columns.iter().map(Identifier::as_str).collect();
        let guard = if dialect.supports_index_if_not_exists() {
            "IF NOT EXISTS "
        } else {
            ""
        };
        format!(
            "CREATE INDEX {guard}{} ON {} ({})",
            self.name,
            self.table,
            columns.join(", ")
        )
    }
}

/// `ALTER TABLE .. DROP COLUMN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropColumn {
    table: Identifier,
    column: Identifier,
}

impl DropColumn {
    pub fn new(table: Identifier, column: Identifier) -> Self {
        Self { table, column }
    }

    /// SQLite accepts this from 3.35 on; the bundled engine is newer.
    pub fn to_sql(&self, _dialect: Dialect) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", self.table, self.column)
    }
}

/// `DROP TABLE IF EXISTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTable {
    table: Identifier,
}

impl DropTable {
    pub fn new(table: Identifier) -> Self {
        Self { table }
    }

    pub fn to_sql(&self, _dialect: Dialect) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &'static str) -> Identifier {
        Identifier::known(name)
    }

    #[test]
    fn test_create_table_with_foreign_key() {
        let table = CreateTable::new(id("sessions"))
            .column(Column::new(id("id"), SqlType::Integer).auto_increment())
            .column(
                Column::new(id("user_id"), SqlType::Integer)
                    .not_null()
                    .references(id("users"), id("id")),
            );

        assert_eq!(
            table.to_sql(Dialect::MySql),
            "CREATE TABLE IF NOT EXISTS sessions (id INTEGER PRIMARY KEY AUTO_INCREMENT, \
             user_id INTEGER NOT NULL, FOREIGN KEY(user_id) REFERENCES users(id))"
        );
    }

    #[test]
    fn test_defaults_are_escaped() {
        let column = Column::new(id("note"), SqlType::Text)
            .default_value(DefaultValue::Text("it's".to_string()));
        assert_eq!(column.to_sql(Dialect::Sqlite), "note TEXT DEFAULT 'it''s'");

        let flag = Column::new(id("is_proxy"), SqlType::Boolean)
            .not_null()
            .default_value(DefaultValue::Boolean(false));
        assert_eq!(
            AddColumn::new(id("servers"), flag).to_sql(Dialect::MySql),
            "ALTER TABLE servers ADD COLUMN is_proxy TINYINT(1) NOT NULL DEFAULT 0"
        );
    }

    #[test]
    fn test_create_index_guard_depends_on_dialect() {
        let index = CreateIndex::new(id("idx_ping_date"), id("ping"), vec![id("date"), id("user_id")]);
        assert_eq!(
            index.to_sql(Dialect::Sqlite),
            "CREATE INDEX IF NOT EXISTS idx_ping_date ON ping (date, user_id)"
        );
        assert_eq!(
            index.to_sql(Dialect::MySql),
            "CREATE INDEX idx_ping_date ON ping (date, user_id)"
        );
    }
}
