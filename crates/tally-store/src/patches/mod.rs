//! Ordered, idempotent schema patches.
//!
//! [`registry`] is the fixed list every database runs through on `init()`.
//! Each patch runs in its own operation-critical transaction, so a failing
//! patch rolls back alone and aborts initialization. A patch that has
//! already been applied issues no writes, which makes running the registry
//! against a current schema a no-op.

use std::sync::Arc;

use jiff::Timestamp;
use log::{debug, info};
use serde::Serialize;

use crate::{
    error::Result,
    schema::columns,
    sql::{Column, Identifier},
    work::{OptionalRowQuery, Query, RowsQuery, Statement, Transaction, TxContext},
};

pub mod shapes;

pub use shapes::{AddColumnPatch, CopyColumnPatch, DropTablePatch};

/// One idempotent schema change.
pub trait Patch: Send + Sync {
    /// Stable name, recorded in `patch_log` once applied.
    fn name(&self) -> &str;

    /// Whether the schema already has this change.
    fn has_been_applied(&self, ctx: &TxContext<'_>) -> Result<bool>;

    /// Makes the change. Only called when `has_been_applied` is false.
    fn apply(&self, ctx: &TxContext<'_>) -> Result<()>;
}

fn id(name: &'static str) -> Identifier {
    Identifier::known(name)
}

fn add_column(name: &'static str, table: &'static str, column: Column) -> Arc<dyn Patch> {
    Arc::new(AddColumnPatch::new(name, id(table), column))
}

/// Every patch, in the order it must be applied.
pub fn registry() -> Vec<Arc<dyn Patch>> {
    vec![
        add_column("servers-is-proxy", "servers", columns::servers_is_proxy()),
        add_column("users-times-kicked", "users", columns::users_times_kicked()),
        add_column("user-info-hostname", "user_info", columns::user_info_hostname()),
        add_column(
            "geolocations-last-used",
            "geolocations",
            columns::geolocations_last_used(),
        ),
        add_column("nicknames-last-used", "nicknames", columns::nicknames_last_used()),
        add_column("worlds-server-uuid", "worlds", columns::worlds_server_uuid()),
        Arc::new(
            CopyColumnPatch::new(
                "sessions-afk-ms",
                id("sessions"),
                id("afk_time"),
                columns::sessions_afk_ms(),
            )
            .multiplied_by(1000),
        ),
        Arc::new(DropTablePatch::new("drop-transfer-table", id("transfer"))),
        Arc::new(DropTablePatch::new("drop-actions-table", id("actions"))),
    ]
}

/// Runs one patch and records it in `patch_log`.
pub(crate) struct PatchTransaction {
    patch: Arc<dyn Patch>,
    name: String,
}

impl PatchTransaction {
    pub(crate) fn new(patch: Arc<dyn Patch>) -> Self {
        let name = format!("patch:{}", patch.name());
        Self { patch, name }
    }
}

impl Transaction for PatchTransaction {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_operation_critical(&self) -> bool {
        true
    }

    fn perform(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        if self.patch.has_been_applied(ctx)? {
            debug!("Patch '{}' already applied", self.patch.name());
        } else {
            self.patch.apply(ctx)?;
            info!("Applied patch '{}'", self.patch.name());
        }
        record(ctx, self.patch.name())
    }
}

fn record(ctx: &TxContext<'_>, name: &str) -> Result<()> {
    let recorded = ctx.query(
        &OptionalRowQuery::new("SELECT name FROM patch_log WHERE name = ?1", |row| {
            row.get::<_, String>(0)
        })
        .bind(name.to_string()),
    )?;
    if recorded.is_none() {
        ctx.execute(
            &Statement::new("INSERT INTO patch_log (name, applied_at) VALUES (?1, ?2)")
                .bind(name.to_string())
                .bind(Timestamp::now().to_string()),
        )?;
    }
    Ok(())
}

/// A `patch_log` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedPatch {
    pub name: String,
    pub applied_at: Timestamp,
}

/// Reads `patch_log` in the order the patches were applied.
pub(crate) fn applied_patches_query() -> impl Query<Vec<AppliedPatch>> {
    RowsQuery::new(
        "SELECT name, applied_at FROM patch_log ORDER BY rowid",
        |row| {
            let name: String = row.get(0)?;
            let applied_at: String = row.get(1)?;
            let applied_at = applied_at.parse::<Timestamp>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(AppliedPatch { name, applied_at })
        },
    )
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use rusqlite::Connection;

    use super::*;
    use crate::{
        schema::CreateTablesTransaction,
        sql::Dialect,
        work::{column_exists, table_exists, transaction::run_transaction},
    };

    thread_local! {
        static WRITES: Cell<usize> = const { Cell::new(0) };
    }

    fn count_writes(sql: &str) {
        let statement = sql.trim_start().to_ascii_uppercase();
        if ["INSERT", "UPDATE", "ALTER", "DROP", "CREATE"]
            .iter()
            .any(|verb| statement.starts_with(verb))
        {
            WRITES.with(|writes| writes.set(writes.get() + 1));
        }
    }

    fn apply_registry(connection: &mut Connection) {
        for patch in registry() {
            run_transaction(connection, Dialect::Sqlite, &mut PatchTransaction::new(patch)).unwrap();
        }
    }

    fn fresh() -> Connection {
        let mut connection = Connection::open_in_memory().unwrap();
        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateTablesTransaction).unwrap();
        connection
    }

    /// A schema as an early release left it.
    fn legacy() -> Connection {
        let mut connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "CREATE TABLE servers (id INTEGER PRIMARY KEY AUTOINCREMENT, uuid VARCHAR(36) NOT NULL UNIQUE, name VARCHAR(100) NOT NULL, web_address VARCHAR(100), is_installed BOOLEAN NOT NULL DEFAULT 1, max_players INTEGER NOT NULL DEFAULT -1);
                 CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, uuid VARCHAR(36) NOT NULL UNIQUE, registered BIGINT NOT NULL, name VARCHAR(36) NOT NULL);
                 CREATE TABLE sessions (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER NOT NULL, server_id INTEGER NOT NULL, session_start BIGINT NOT NULL, session_end BIGINT NOT NULL, mob_kills INTEGER NOT NULL DEFAULT 0, deaths INTEGER NOT NULL DEFAULT 0, afk_time BIGINT NOT NULL DEFAULT 0);
                 CREATE TABLE worlds (id INTEGER PRIMARY KEY AUTOINCREMENT, world_name VARCHAR(100) NOT NULL);
                 CREATE TABLE transfer (sender_server_id INTEGER, expiry_date BIGINT, content_64 TEXT);
                 CREATE TABLE actions (user_id INTEGER, date BIGINT, action_id INTEGER);
                 INSERT INTO sessions (user_id, server_id, session_start, session_end, afk_time) VALUES (1, 1, 0, 600000, 42);",
            )
            .unwrap();
        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateTablesTransaction).unwrap();
        connection
    }

    #[test]
    fn test_registry_order_is_fixed() {
        let names: Vec<String> = registry().iter().map(|patch| patch.name().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "servers-is-proxy",
                "users-times-kicked",
                "user-info-hostname",
                "geolocations-last-used",
                "nicknames-last-used",
                "worlds-server-uuid",
                "sessions-afk-ms",
                "drop-transfer-table",
                "drop-actions-table",
            ]
        );
    }

    #[test]
    fn test_fresh_schema_needs_no_patch() {
        let mut connection = fresh();
        let ctx = TxContext::begin(&mut connection, Dialect::Sqlite).unwrap();

        for patch in registry() {
            assert!(patch.has_been_applied(&ctx).unwrap(), "{} not applied", patch.name());
        }
    }

    #[test]
    fn test_legacy_schema_is_upgraded() {
        let mut connection = legacy();
        apply_registry(&mut connection);

        let sqlite = Dialect::Sqlite;
        let sessions = id("sessions");
        assert!(column_exists(sqlite, &id("servers"), &id("is_proxy")).run(&connection).unwrap());
        assert!(column_exists(sqlite, &id("users"), &id("times_kicked")).run(&connection).unwrap());
        assert!(column_exists(sqlite, &id("worlds"), &id("server_uuid")).run(&connection).unwrap());
        assert!(column_exists(sqlite, &sessions, &id("afk_ms")).run(&connection).unwrap());
        assert!(!column_exists(sqlite, &sessions, &id("afk_time")).run(&connection).unwrap());
        assert!(!table_exists(sqlite, &id("transfer")).run(&connection).unwrap());
        assert!(!table_exists(sqlite, &id("actions")).run(&connection).unwrap());

        let afk_ms: i64 = connection
            .query_row("SELECT afk_ms FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(afk_ms, 42_000);
    }

    #[test]
    fn test_second_pass_writes_nothing() {
        let mut connection = legacy();
        apply_registry(&mut connection);

        let applied = applied_patches_query().run(&connection).unwrap();
        assert_eq!(applied.len(), registry().len());

        connection.trace(Some(count_writes));
        WRITES.with(|writes| writes.set(0));
        apply_registry(&mut connection);
        connection.trace(None);

        assert_eq!(WRITES.with(Cell::get), 0);
        assert_eq!(applied_patches_query().run(&connection).unwrap(), applied);
    }

    #[test]
    fn test_failed_patch_rolls_back_alone() {
        struct Broken;

        impl Patch for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            fn has_been_applied(&self, _ctx: &TxContext<'_>) -> Result<bool> {
                Ok(false)
            }

            fn apply(&self, ctx: &TxContext<'_>) -> Result<()> {
                ctx.execute_batch_sql("ALTER TABLE users ADD COLUMN half_done INTEGER")?;
                ctx.execute_batch_sql("ALTER TABLE nowhere ADD COLUMN x INTEGER")
            }
        }

        let mut connection = fresh();
        let result = run_transaction(
            &mut connection,
            Dialect::Sqlite,
            &mut PatchTransaction::new(Arc::new(Broken)),
        );

        assert!(result.is_err());
        assert!(!column_exists(Dialect::Sqlite, &id("users"), &id("half_done"))
            .run(&connection)
            .unwrap());
        assert!(applied_patches_query().run(&connection).unwrap().is_empty());
    }
}
