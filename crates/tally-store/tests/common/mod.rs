#![allow(dead_code)]

use std::{path::Path, sync::Arc, time::Duration};

use tally_store::{
    work::{transaction, OptionalRowQuery, Query, Statement, Transaction, TxContext},
    Database, DatabaseBuilder, Result,
};
use tempfile::TempDir;

/// Routes `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builder for a database file inside `dir`, without delayed index creation.
pub fn test_builder(dir: &Path) -> DatabaseBuilder {
    init_logging();
    DatabaseBuilder::new()
        .file(dir.join("tally.db"))
        .index_delay(None)
        .shutdown_grace(Duration::from_secs(5))
}

/// Helper function to create and open a database in a fresh directory
pub async fn create_test_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = test_builder(temp_dir.path())
        .open()
        .await
        .expect("Failed to open database");
    (temp_dir, db)
}

fn counter_row(ctx: &TxContext<'_>) -> Result<Option<i64>> {
    let content = ctx.query(&counter_query())?;
    Ok(content.and_then(|value| value.parse().ok()))
}

fn counter_query() -> impl Query<Option<String>> {
    OptionalRowQuery::new(
        "SELECT content FROM settings WHERE server_uuid = 'counter'",
        |row| row.get::<_, String>(0),
    )
}

/// Reads the counter, then writes it back incremented.
///
/// The read and the write are separate statements, so concurrent writers
/// would lose updates.
pub fn increment() -> impl Transaction {
    transaction("increment", |ctx| {
        match counter_row(ctx)? {
            Some(value) => ctx.execute(
                &Statement::new("UPDATE settings SET content = ?1 WHERE server_uuid = 'counter'")
                    .bind((value + 1).to_string()),
            )?,
            None => ctx.execute(&Statement::new(
                "INSERT INTO settings (server_uuid, updated, content) VALUES ('counter', 0, '1')",
            ))?,
        };
        Ok(())
    })
}

/// Current counter value, zero when it was never written.
pub async fn counter(db: &Arc<Database>) -> i64 {
    db.query_async(counter_query())
        .await
        .expect("Failed to read counter")
        .map_or(0, |value| value.parse().expect("counter is not a number"))
}
