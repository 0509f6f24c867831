//! Write statements, single and batched.

use rusqlite::{params_from_iter, types::Value, Connection};

use crate::error::{DatabaseResultExt, Result};

/// One write against a connection.
pub trait Executable {
    /// Runs the write and reports whether any row was affected.
    ///
    /// Callers use the result for "update, and if nothing matched, insert".
    fn run(&self, connection: &Connection) -> Result<bool>;
}

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl Executable for Statement {
    fn run(&self, connection: &Connection) -> Result<bool> {
        let mut statement = connection
            .prepare_cached(&self.sql)
            .sql_context("Failed to prepare statement", &self.sql)?;
        let affected = statement
            .execute(params_from_iter(self.params.iter()))
            .sql_context("Failed to execute statement", &self.sql)?;
        Ok(affected > 0)
    }
}

/// One statement executed once per item of a collection.
///
/// The statement is prepared once; `binder` produces the parameters for each
/// item. An empty collection never touches the connection.
pub struct BatchStatement<I, F> {
    sql: String,
    items: Vec<I>,
    binder: F,
}

impl<I, F> BatchStatement<I, F>
where
    F: Fn(&I) -> Vec<Value>,
{
    pub fn new(sql: impl Into<String>, items: Vec<I>, binder: F) -> Self {
        Self {
            sql: sql.into(),
            items,
            binder,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<I, F> Executable for BatchStatement<I, F>
where
    F: Fn(&I) -> Vec<Value>,
{
    fn run(&self, connection: &Connection) -> Result<bool> {
        if self.items.is_empty() {
            return Ok(false);
        }

        let mut statement = connection
            .prepare_cached(&self.sql)
            .sql_context("Failed to prepare batch statement", &self.sql)?;
        let mut affected = 0;
        for item in &self.items {
            affected += statement
                .execute(params_from_iter((self.binder)(item)))
                .sql_context("Failed to execute batch statement", &self.sql)?;
        }
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    thread_local! {
        static TRACED: Cell<usize> = const { Cell::new(0) };
    }

    fn count_statement(_sql: &str) {
        TRACED.with(|traced| traced.set(traced.get() + 1));
    }

    fn traced_connection() -> Connection {
        let mut connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch("CREATE TABLE ping (user_id INTEGER, value INTEGER)")
            .unwrap();
        connection.trace(Some(count_statement));
        TRACED.with(|traced| traced.set(0));
        connection
    }

    #[test]
    fn test_statement_reports_affected_rows() {
        let connection = traced_connection();

        let update = Statement::new("UPDATE ping SET value = ?1 WHERE user_id = ?2")
            .bind(10_i64)
            .bind(1_i64);
        assert!(!update.run(&connection).unwrap());

        let insert = Statement::new("INSERT INTO ping (user_id, value) VALUES (?1, ?2)")
            .bind(1_i64)
            .bind(10_i64);
        assert!(insert.run(&connection).unwrap());
        assert!(update.run(&connection).unwrap());
    }

    #[test]
    fn test_empty_batch_executes_nothing() {
        let connection = traced_connection();
        let batch = BatchStatement::new(
            "INSERT INTO ping (user_id, value) VALUES (?1, ?2)",
            Vec::<(i64, i64)>::new(),
            |(user, value)| vec![Value::from(*user), Value::from(*value)],
        );

        assert!(batch.is_empty());
        assert!(!batch.run(&connection).unwrap());
        assert_eq!(TRACED.with(Cell::get), 0);
    }

    #[test]
    fn test_batch_binds_each_item() {
        let connection = traced_connection();
        let batch = BatchStatement::new(
            "INSERT INTO ping (user_id, value) VALUES (?1, ?2)",
            vec![(1_i64, 40_i64), (2, 55), (3, 61)],
            |(user, value)| vec![Value::from(*user), Value::from(*value)],
        );

        assert!(batch.run(&connection).unwrap());
        assert!(TRACED.with(Cell::get) >= 3);

        let total: i64 = connection
            .query_row("SELECT SUM(value) FROM ping", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 156);
    }
}
