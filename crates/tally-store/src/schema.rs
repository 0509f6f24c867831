//! Current base schema and its secondary indexes.
//!
//! Fresh databases get every table in its current shape straight away; the
//! patches in [`crate::patches`] only have work to do on databases created by
//! older releases.

use log::{debug, info, warn};

use crate::{
    error::Result,
    sql::{Column, CreateIndex, CreateTable, DefaultValue, Identifier, SqlType},
    work::{index_exists, Transaction, TxContext},
};

fn id(name: &'static str) -> Identifier {
    Identifier::known(name)
}

fn primary_key() -> Column {
    Column::new(id("id"), SqlType::Integer).auto_increment()
}

fn reference(name: &'static str, table: &'static str) -> Column {
    Column::new(id(name), SqlType::Integer)
        .not_null()
        .references(id(table), id("id"))
}

fn counter(name: &'static str) -> Column {
    Column::new(id(name), SqlType::Integer)
        .not_null()
        .default_value(DefaultValue::Integer(0))
}

fn timestamp(name: &'static str) -> Column {
    Column::new(id(name), SqlType::BigInt).not_null()
}

/// Columns that later releases added to existing tables.
///
/// The base schema and the patches that bring old databases up to date share
/// these definitions.
pub(crate) mod columns {
    use super::*;

    pub(crate) fn servers_is_proxy() -> Column {
        Column::new(id("is_proxy"), SqlType::Boolean)
            .not_null()
            .default_value(DefaultValue::Boolean(false))
    }

    pub(crate) fn users_times_kicked() -> Column {
        counter("times_kicked")
    }

    pub(crate) fn user_info_hostname() -> Column {
        Column::new(id("hostname"), SqlType::Varchar(255))
    }

    pub(crate) fn geolocations_last_used() -> Column {
        Column::new(id("last_used"), SqlType::BigInt)
            .not_null()
            .default_value(DefaultValue::Integer(0))
    }

    pub(crate) fn nicknames_last_used() -> Column {
        Column::new(id("last_used"), SqlType::BigInt)
            .not_null()
            .default_value(DefaultValue::Integer(0))
    }

    pub(crate) fn worlds_server_uuid() -> Column {
        Column::new(id("server_uuid"), SqlType::Uuid)
    }

    pub(crate) fn sessions_afk_ms() -> Column {
        Column::new(id("afk_ms"), SqlType::BigInt)
            .not_null()
            .default_value(DefaultValue::Integer(0))
    }
}

/// Every base table, parents before the tables that reference them.
pub fn base_tables() -> Vec<CreateTable> {
    vec![
        CreateTable::new(id("servers"))
            .column(primary_key())
            .column(Column::new(id("uuid"), SqlType::Uuid).not_null().unique())
            .column(Column::new(id("name"), SqlType::Varchar(100)).not_null())
            .column(Column::new(id("web_address"), SqlType::Varchar(100)))
            .column(
                Column::new(id("is_installed"), SqlType::Boolean)
                    .not_null()
                    .default_value(DefaultValue::Boolean(true)),
            )
            .column(columns::servers_is_proxy())
            .column(
                Column::new(id("max_players"), SqlType::Integer)
                    .not_null()
                    .default_value(DefaultValue::Integer(-1)),
            ),
        CreateTable::new(id("users"))
            .column(primary_key())
            .column(Column::new(id("uuid"), SqlType::Uuid).not_null().unique())
            .column(timestamp("registered"))
            .column(Column::new(id("name"), SqlType::Varchar(36)).not_null())
            .column(columns::users_times_kicked()),
        CreateTable::new(id("user_info"))
            .column(primary_key())
            .column(reference("user_id", "users"))
            .column(reference("server_id", "servers"))
            .column(timestamp("registered"))
            .column(
                Column::new(id("opped"), SqlType::Boolean)
                    .not_null()
                    .default_value(DefaultValue::Boolean(false)),
            )
            .column(
                Column::new(id("banned"), SqlType::Boolean)
                    .not_null()
                    .default_value(DefaultValue::Boolean(false)),
            )
            .column(columns::user_info_hostname()),
        CreateTable::new(id("sessions"))
            .column(primary_key())
            .column(reference("user_id", "users"))
            .column(reference("server_id", "servers"))
            .column(timestamp("session_start"))
            .column(timestamp("session_end"))
            .column(counter("mob_kills"))
            .column(counter("deaths"))
            .column(columns::sessions_afk_ms()),
        CreateTable::new(id("nicknames"))
            .column(primary_key())
            .column(Column::new(id("user_uuid"), SqlType::Uuid).not_null())
            .column(Column::new(id("nickname"), SqlType::Varchar(75)).not_null())
            .column(Column::new(id("server_uuid"), SqlType::Uuid).not_null())
            .column(columns::nicknames_last_used()),
        CreateTable::new(id("geolocations"))
            .column(primary_key())
            .column(reference("user_id", "users"))
            .column(Column::new(id("geolocation"), SqlType::Varchar(50)).not_null())
            .column(columns::geolocations_last_used()),
        CreateTable::new(id("ping"))
            .column(primary_key())
            .column(reference("user_id", "users"))
            .column(reference("server_id", "servers"))
            .column(timestamp("date"))
            .column(Column::new(id("max_ping"), SqlType::Integer).not_null())
            .column(Column::new(id("min_ping"), SqlType::Integer).not_null())
            .column(Column::new(id("avg_ping"), SqlType::Double).not_null()),
        CreateTable::new(id("tps"))
            .column(reference("server_id", "servers"))
            .column(timestamp("date"))
            .column(Column::new(id("tps"), SqlType::Double).not_null())
            .column(Column::new(id("players_online"), SqlType::Integer).not_null())
            .column(Column::new(id("cpu_usage"), SqlType::Double).not_null())
            .column(Column::new(id("ram_usage"), SqlType::BigInt).not_null())
            .column(Column::new(id("entities"), SqlType::Integer).not_null())
            .column(Column::new(id("chunks_loaded"), SqlType::Integer).not_null())
            .column(Column::new(id("free_disk_space"), SqlType::BigInt).not_null()),
        CreateTable::new(id("worlds"))
            .column(primary_key())
            .column(Column::new(id("world_name"), SqlType::Varchar(100)).not_null())
            .column(columns::worlds_server_uuid()),
        CreateTable::new(id("world_times"))
            .column(primary_key())
            .column(reference("user_id", "users"))
            .column(reference("world_id", "worlds"))
            .column(reference("server_id", "servers"))
            .column(reference("session_id", "sessions"))
            .column(counter("survival_time"))
            .column(counter("creative_time"))
            .column(counter("adventure_time"))
            .column(counter("spectator_time")),
        CreateTable::new(id("settings"))
            .column(primary_key())
            .column(Column::new(id("server_uuid"), SqlType::Uuid).not_null().unique())
            .column(timestamp("updated"))
            .column(Column::new(id("content"), SqlType::Text).not_null()),
        CreateTable::new(id("patch_log"))
            .column(Column::new(id("name"), SqlType::Varchar(100)).not_null().unique())
            .column(Column::new(id("applied_at"), SqlType::Varchar(40)).not_null()),
    ]
}

/// Secondary indexes for the queries that scan the largest tables.
pub fn secondary_indexes() -> Vec<CreateIndex> {
    vec![
        CreateIndex::new(id("idx_sessions_user"), id("sessions"), vec![id("user_id")]),
        CreateIndex::new(
            id("idx_sessions_start"),
            id("sessions"),
            vec![id("server_id"), id("session_start")],
        ),
        CreateIndex::new(id("idx_ping_date"), id("ping"), vec![id("server_id"), id("date")]),
        CreateIndex::new(id("idx_tps_date"), id("tps"), vec![id("server_id"), id("date")]),
        CreateIndex::new(id("idx_user_info_user"), id("user_info"), vec![id("user_id")]),
        CreateIndex::new(
            id("idx_nicknames_user"),
            id("nicknames"),
            vec![id("user_uuid")],
        ),
        CreateIndex::new(
            id("idx_world_times_session"),
            id("world_times"),
            vec![id("session_id")],
        ),
    ]
}

/// Creates every base table that does not exist yet.
#[derive(Debug, Default)]
pub struct CreateTablesTransaction;

impl Transaction for CreateTablesTransaction {
    fn name(&self) -> &str {
        "create-tables"
    }

    fn is_operation_critical(&self) -> bool {
        true
    }

    fn perform(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        let tables = base_tables();
        for table in &tables {
            ctx.execute_batch_sql(&table.to_sql(ctx.dialect()))?;
        }
        debug!("Ensured {} base tables", tables.len());
        Ok(())
    }
}

/// Creates the secondary indexes that are missing.
#[derive(Debug, Default)]
pub struct CreateIndexesTransaction;

impl Transaction for CreateIndexesTransaction {
    fn name(&self) -> &str {
        "create-indexes"
    }

    fn perform(&mut self, ctx: &TxContext<'_>) -> Result<()> {
        // Queued in the background with nobody awaiting it
        create_missing_indexes(ctx).map_err(|e| {
            warn!("Failed to create secondary indexes: {e}");
            e
        })
    }
}

fn create_missing_indexes(ctx: &TxContext<'_>) -> Result<()> {
    let mut created = 0;
    for index in secondary_indexes() {
        if ctx.query(&index_exists(ctx.dialect(), index.table(), index.name()))? {
            continue;
        }
        ctx.execute_batch_sql(&index.to_sql(ctx.dialect()))?;
        created += 1;
    }
    if created > 0 {
        info!("Created {created} secondary indexes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;
    use crate::{
        sql::Dialect,
        work::{row_count, table_exists, transaction::run_transaction, Query},
    };

    #[test]
    fn test_base_tables_create_idempotently() {
        let mut connection = Connection::open_in_memory().unwrap();
        connection.execute_batch("PRAGMA foreign_keys = ON").unwrap();

        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateTablesTransaction).unwrap();
        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateTablesTransaction).unwrap();

        for table in base_tables() {
            assert!(table_exists(Dialect::Sqlite, table.table())
                .run(&connection)
                .unwrap());
            assert_eq!(row_count(table.table()).run(&connection).unwrap(), 0);
        }
    }

    #[test]
    fn test_indexes_skip_existing() {
        let mut connection = Connection::open_in_memory().unwrap();
        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateTablesTransaction).unwrap();
        connection
            .execute_batch("CREATE INDEX idx_ping_date ON ping (server_id, date)")
            .unwrap();

        run_transaction(&mut connection, Dialect::Sqlite, &mut CreateIndexesTransaction).unwrap();

        for index in secondary_indexes() {
            assert!(index_exists(Dialect::Sqlite, index.table(), index.name())
                .run(&connection)
                .unwrap());
        }
    }

    #[test]
    fn test_rendered_schema_is_valid_mysql_shape() {
        let servers = &base_tables()[0];
        let sql = servers.to_sql(Dialect::MySql);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS servers (id INTEGER PRIMARY KEY AUTO_INCREMENT"));
        assert!(sql.contains("is_proxy TINYINT(1) NOT NULL DEFAULT 0"));
    }
}
