//! Read-only units of work.

use std::marker::PhantomData;

use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension, Row};

use crate::{
    error::{DatabaseResultExt, Result},
    sql::{Dialect, Identifier},
};

/// A read that produces a `T` from one connection.
///
/// Statements and result sets opened by a query are released before `run`
/// returns, whether it succeeds or not.
pub trait Query<T> {
    fn run(&self, connection: &Connection) -> Result<T>;
}

impl<T, F> Query<T> for F
where
    F: Fn(&Connection) -> Result<T>,
{
    fn run(&self, connection: &Connection) -> Result<T> {
        self(connection)
    }
}

/// Maps every row of a parameterized `SELECT`.
pub struct RowsQuery<T, F> {
    sql: String,
    params: Vec<Value>,
    mapper: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> RowsQuery<T, F>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    pub fn new(sql: impl Into<String>, mapper: F) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            mapper,
            _output: PhantomData,
        }
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl<T, F> Query<Vec<T>> for RowsQuery<T, F>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    fn run(&self, connection: &Connection) -> Result<Vec<T>> {
        let mut statement = connection
            .prepare_cached(&self.sql)
            .sql_context("Failed to prepare query", &self.sql)?;
        let rows = statement
            .query_map(params_from_iter(self.params.iter()), |row| (self.mapper)(row))
            .sql_context("Failed to run query", &self.sql)?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
            .sql_context("Failed to read query results", &self.sql)
    }
}

/// Maps the first row of a parameterized `SELECT`, if there is one.
pub struct OptionalRowQuery<T, F> {
    sql: String,
    params: Vec<Value>,
    mapper: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> OptionalRowQuery<T, F>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    pub fn new(sql: impl Into<String>, mapper: F) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            mapper,
            _output: PhantomData,
        }
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl<T, F> Query<Option<T>> for OptionalRowQuery<T, F>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    fn run(&self, connection: &Connection) -> Result<Option<T>> {
        let mut statement = connection
            .prepare_cached(&self.sql)
            .sql_context("Failed to prepare query", &self.sql)?;
        statement
            .query_row(params_from_iter(self.params.iter()), |row| (self.mapper)(row))
            .optional()
            .sql_context("Failed to run query", &self.sql)
    }
}

/// Number of rows in `table`.
pub fn row_count(table: &Identifier) -> impl Query<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    move |connection: &Connection| {
        connection
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .sql_context("Failed to count rows", &sql)
    }
}

/// Whether `table` exists.
pub fn table_exists(dialect: Dialect, table: &Identifier) -> impl Query<bool> {
    let table = table.as_str().to_string();
    move |connection: &Connection| {
        connection
            .query_row(dialect.table_exists_sql(), [&table], |row| row.get::<_, i64>(0))
            .map(|count| count > 0)
            .sql_context("Failed to check table existence", dialect.table_exists_sql())
    }
}

/// Whether `table` has a column named `column`.
pub fn column_exists(dialect: Dialect, table: &Identifier, column: &Identifier) -> impl Query<bool> {
    let table = table.as_str().to_string();
    let column = column.as_str().to_string();
    move |connection: &Connection| {
        connection
            .query_row(dialect.column_exists_sql(), [&table, &column], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count > 0)
            .sql_context("Failed to check column existence", dialect.column_exists_sql())
    }
}

/// Whether an index named `index` exists on `table`.
pub fn index_exists(dialect: Dialect, table: &Identifier, index: &Identifier) -> impl Query<bool> {
    let table = table.as_str().to_string();
    let index = index.as_str().to_string();
    move |connection: &Connection| {
        connection
            .query_row(dialect.index_exists_sql(), [&table, &index], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count > 0)
            .sql_context("Failed to check index existence", dialect.index_exists_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO users (name) VALUES ('ada'), ('grace'), ('linus');",
            )
            .unwrap();
        connection
    }

    #[test]
    fn test_rows_query_maps_all_rows() {
        let query = RowsQuery::new("SELECT name FROM users WHERE id > ?1 ORDER BY id", |row| {
            row.get::<_, String>(0)
        })
        .bind(1_i64);

        assert_eq!(query.run(&connection()).unwrap(), vec!["grace", "linus"]);
    }

    #[test]
    fn test_optional_row_query() {
        let connection = connection();
        let find = |id: i64| {
            OptionalRowQuery::new("SELECT name FROM users WHERE id = ?1", |row| {
                row.get::<_, String>(0)
            })
            .bind(id)
        };

        assert_eq!(find(2).run(&connection).unwrap().as_deref(), Some("grace"));
        assert_eq!(find(99).run(&connection).unwrap(), None);
    }

    #[test]
    fn test_failed_query_carries_statement() {
        let query = RowsQuery::new("SELECT nope FROM users", |row| row.get::<_, i64>(0));

        match query.run(&connection()) {
            Err(StoreError::Operation { statement, .. }) => {
                assert_eq!(statement.as_deref(), Some("SELECT nope FROM users"));
            }
            other => panic!("Expected Operation error, got {other:?}"),
        }
    }

    #[test]
    fn test_introspection_helpers() {
        let connection = connection();
        let users = Identifier::known("users");

        assert_eq!(row_count(&users).run(&connection).unwrap(), 3);
        assert!(table_exists(Dialect::Sqlite, &users).run(&connection).unwrap());
        assert!(!table_exists(Dialect::Sqlite, &Identifier::known("ghosts"))
            .run(&connection)
            .unwrap());
        assert!(column_exists(Dialect::Sqlite, &users, &Identifier::known("name"))
            .run(&connection)
            .unwrap());
        assert!(!column_exists(Dialect::Sqlite, &users, &Identifier::known("email"))
            .run(&connection)
            .unwrap());
    }
}
