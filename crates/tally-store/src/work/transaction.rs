//! Named compositions of statements run as one transaction.

use log::debug;
use rusqlite::{Connection, TransactionBehavior};

use super::{Executable, Query};
use crate::{
    error::{DatabaseResultExt, Result},
    sql::Dialect,
};

/// One logical write operation.
///
/// Everything `perform` does through its [`TxContext`] commits together, or
/// not at all when it returns an error.
pub trait Transaction: Send + 'static {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Operation-critical transactions belong to schema setup and pass the
    /// access gate while the database is patching.
    fn is_operation_critical(&self) -> bool {
        false
    }

    fn perform(&mut self, ctx: &TxContext<'_>) -> Result<()>;
}

/// The connection of a running transaction, plus the dialect it speaks.
pub struct TxContext<'c> {
    tx: rusqlite::Transaction<'c>,
    dialect: Dialect,
}

impl<'c> TxContext<'c> {
    pub(crate) fn begin(connection: &'c mut Connection, dialect: Dialect) -> Result<Self> {
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .db_context("Failed to begin transaction")?;
        Ok(Self { tx, dialect })
    }

    /// Runs a write; `true` if it affected any row.
    pub fn execute<E: Executable + ?Sized>(&self, executable: &E) -> Result<bool> {
        executable.run(&self.tx)
    }

    /// Runs a read inside the transaction, seeing its uncommitted writes.
    pub fn query<T, Q: Query<T> + ?Sized>(&self, query: &Q) -> Result<T> {
        query.run(&self.tx)
    }

    /// Runs one or more parameterless statements.
    pub fn execute_batch_sql(&self, sql: &str) -> Result<()> {
        self.tx
            .execute_batch(sql)
            .sql_context("Failed to execute statements", sql)
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn commit(self) -> Result<()> {
        self.tx.commit().db_context("Failed to commit transaction")
    }
}

/// Runs `transaction` on `connection`, committing only if it succeeds.
pub(crate) fn run_transaction(
    connection: &mut Connection,
    dialect: Dialect,
    transaction: &mut dyn Transaction,
) -> Result<()> {
    let ctx = TxContext::begin(connection, dialect)?;
    // Dropping an uncommitted context rolls it back
    transaction.perform(&ctx)?;
    ctx.commit()?;
    debug!("Committed transaction '{}'", transaction.name());
    Ok(())
}

/// A transaction built from a closure.
pub struct FnTransaction<F> {
    name: String,
    critical: bool,
    body: F,
}

impl<F> Transaction for FnTransaction<F>
where
    F: FnMut(&TxContext<'_>) -> Result<()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_operation_critical(&self) -> bool {
        self.critical
    }

    fn perform(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }
}

/// Ordinary transaction from a closure.
pub fn transaction<F>(name: impl Into<String>, body: F) -> FnTransaction<F>
where
    F: FnMut(&TxContext<'_>) -> Result<()> + Send + 'static,
{
    FnTransaction {
        name: name.into(),
        critical: false,
        body,
    }
}

/// Operation-critical transaction from a closure.
pub fn critical_transaction<F>(name: impl Into<String>, body: F) -> FnTransaction<F>
where
    F: FnMut(&TxContext<'_>) -> Result<()> + Send + 'static,
{
    FnTransaction {
        name: name.into(),
        critical: true,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::StoreError,
        work::{OptionalRowQuery, Statement},
    };

    fn connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch("CREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .unwrap();
        connection
    }

    fn store_setting(name: &'static str, value: &'static str) -> impl Transaction {
        transaction("store-setting", move |ctx| {
            let update = Statement::new("UPDATE settings SET value = ?1 WHERE name = ?2")
                .bind(value.to_string())
                .bind(name.to_string());
            if !ctx.execute(&update)? {
                ctx.execute(
                    &Statement::new("INSERT INTO settings (name, value) VALUES (?1, ?2)")
                        .bind(name.to_string())
                        .bind(value.to_string()),
                )?;
            }
            Ok(())
        })
    }

    fn setting(connection: &Connection, name: &'static str) -> Option<String> {
        OptionalRowQuery::new("SELECT value FROM settings WHERE name = ?1", |row| {
            row.get::<_, String>(0)
        })
        .bind(name.to_string())
        .run(connection)
        .unwrap()
    }

    #[test]
    fn test_update_or_insert_idiom() {
        let mut connection = connection();

        run_transaction(&mut connection, Dialect::Sqlite, &mut store_setting("theme", "dark")).unwrap();
        run_transaction(&mut connection, Dialect::Sqlite, &mut store_setting("theme", "light")).unwrap();

        assert_eq!(setting(&connection, "theme").as_deref(), Some("light"));
        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_failure_rolls_back_every_statement() {
        let mut connection = connection();
        let mut failing = transaction("half-done", |ctx| {
            ctx.execute(
                &Statement::new("INSERT INTO settings (name, value) VALUES ('a', '1')"),
            )?;
            ctx.execute(&Statement::new("INSERT INTO missing_table VALUES (1)"))?;
            Ok(())
        });

        let result = run_transaction(&mut connection, Dialect::Sqlite, &mut failing);

        assert!(matches!(result, Err(StoreError::Operation { .. })));
        assert_eq!(setting(&connection, "a"), None);
    }

    #[test]
    fn test_reads_see_uncommitted_writes() {
        let mut connection = connection();
        let mut tx = transaction("read-back", |ctx| {
            ctx.execute_batch_sql("INSERT INTO settings (name, value) VALUES ('k', 'v')")?;
            let seen = ctx.query(&OptionalRowQuery::new(
                "SELECT value FROM settings WHERE name = 'k'",
                |row| row.get::<_, String>(0),
            ))?;
            assert_eq!(seen.as_deref(), Some("v"));
            Ok(())
        });

        run_transaction(&mut connection, Dialect::Sqlite, &mut tx).unwrap();
    }

    fn noop(_: &TxContext<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_critical_flag() {
        assert!(!transaction("plain", noop).is_operation_critical());
        assert!(critical_transaction("setup", noop).is_operation_critical());
    }
}
