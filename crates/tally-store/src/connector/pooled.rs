//! `r2d2` connection pool connector.
//!
//! Used directly for [`DbType::EmbeddedServer`] through
//! [`SqliteConnectionManager`], and by networked drivers that hand the engine
//! a manager of their own. Each borrow is validated on checkout; a lease held
//! past the leak-detection threshold is reported when it comes back.

use std::{path::Path, sync::Arc};

use log::{debug, info};
use parking_lot::RwLock;
use r2d2::{ManageConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use super::{apply_sqlite_pragmas, BackendConnector, ConnectionLease};
use crate::{
    config::PoolSettings,
    error::{ConnectReason, Result, StoreError},
    sql::DbType,
};

type ManagerFactory<M> = Arc<dyn Fn() -> M + Send + Sync>;

/// Runs on every connection the pool opens.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout: std::time::Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_sqlite_pragmas(conn, self.busy_timeout)
    }
}

/// Lends connections from a bounded pool.
///
/// The pool is rebuilt on every [`connect`](BackendConnector::connect), so a
/// database can be closed and initialised again.
pub struct PooledConnector<M>
where
    M: ManageConnection<Connection = Connection, Error = rusqlite::Error>,
{
    name: String,
    kind: DbType,
    settings: PoolSettings,
    busy_timeout: std::time::Duration,
    make_manager: ManagerFactory<M>,
    pool: RwLock<Option<Pool<M>>>,
}

impl PooledConnector<SqliteConnectionManager> {
    /// Pool of connections to the SQLite file at `path`.
    pub fn sqlite_file<P: AsRef<Path>>(name: impl Into<String>, path: P, settings: PoolSettings) -> Self {
        let path = path.as_ref().to_path_buf();
        Self::new(name, DbType::EmbeddedServer, settings, move || {
            SqliteConnectionManager::file(&path)
        })
    }
}

impl<M> PooledConnector<M>
where
    M: ManageConnection<Connection = Connection, Error = rusqlite::Error>,
{
    /// Pool whose connections come from managers built by `make_manager`.
    pub fn new<F>(name: impl Into<String>, kind: DbType, settings: PoolSettings, make_manager: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            settings,
            busy_timeout: std::time::Duration::from_secs(30),
            make_manager: Arc::new(make_manager),
            pool: RwLock::new(None),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: std::time::Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Open connections, idle and lent, or `None` when not connected.
    pub fn open_connections(&self) -> Option<u32> {
        self.pool.read().as_ref().map(|pool| pool.state().connections)
    }

    fn current_pool(&self) -> Result<Pool<M>> {
        self.pool.read().clone().ok_or_else(|| {
            StoreError::connect(self.kind, ConnectReason::NotConnected)
                .message(format!("pool '{}' is not connected", self.name))
        })
    }
}

impl<M> BackendConnector for PooledConnector<M>
where
    M: ManageConnection<Connection = Connection, Error = rusqlite::Error>,
{
    fn kind(&self) -> DbType {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
        let mut slot = self.pool.write();
        if slot.is_some() {
            return Ok(());
        }

        let pool = Pool::builder()
            .max_size(self.settings.max_size)
            .min_idle(Some(1))
            .max_lifetime(Some(self.settings.max_lifetime()))
            .connection_timeout(self.settings.connection_timeout())
            .test_on_check_out(true)
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout: self.busy_timeout,
            }))
            .build((self.make_manager)())
            .map_err(|e| {
                StoreError::connect(self.kind, ConnectReason::Unreachable).with_source(
                    format!(
                        "pool '{}' could not open a connection; check the backend address and credentials",
                        self.name
                    ),
                    e,
                )
            })?;

        info!(
            "Connected pool '{}' (max {} connections)",
            self.name, self.settings.max_size
        );
        *slot = Some(pool);
        Ok(())
    }

    fn borrow(&self) -> Result<ConnectionLease<'_>> {
        let pool = self.current_pool()?;
        // Checkout already discards connections that fail validation; a
        // second attempt covers a pool that was momentarily exhausted by them.
        let connection = match pool.get() {
            Ok(connection) => connection,
            Err(first) => {
                debug!("Checkout from '{}' failed, retrying once: {first}", self.name);
                pool.get().map_err(|e| {
                    StoreError::connect(self.kind, ConnectReason::Unreachable)
                        .with_source(format!("no usable connection in pool '{}'", self.name), e)
                })?
            }
        };
        Ok(ConnectionLease::new(
            Box::new(connection),
            &self.name,
            Some(self.settings.leak_detection_threshold()),
        ))
    }

    fn close(&self) {
        if self.pool.write().take().is_some() {
            info!("Closed pool '{}'", self.name);
        }
    }

    fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn settings(max_size: u32) -> PoolSettings {
        PoolSettings {
            max_size,
            connection_timeout_ms: 250,
            ..PoolSettings::default()
        }
    }

    #[test]
    fn test_leases_share_one_file() {
        let dir = TempDir::new().unwrap();
        let connector = PooledConnector::sqlite_file("test-pool", dir.path().join("pool.db"), settings(4));
        connector.connect().unwrap();

        let first = connector.borrow().unwrap();
        let second = connector.borrow().unwrap();
        first.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (3);").unwrap();
        let value: i64 = second.query_row("SELECT v FROM t", [], |row| row.get(0)).unwrap();

        assert_eq!(value, 3);
    }

    #[test]
    fn test_pragmas_applied_on_acquire() {
        let dir = TempDir::new().unwrap();
        let connector = PooledConnector::sqlite_file("pragma-pool", dir.path().join("p.db"), settings(2));
        connector.connect().unwrap();

        let lease = connector.borrow().unwrap();
        let journal: String = lease.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        let foreign_keys: i64 = lease.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();

        assert_eq!(journal, "wal");
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_exhausted_pool_fails_after_timeout() {
        let dir = TempDir::new().unwrap();
        let connector = PooledConnector::sqlite_file("tiny-pool", dir.path().join("t.db"), settings(1));
        connector.connect().unwrap();

        let _held = connector.borrow().unwrap();
        match connector.borrow() {
            Err(StoreError::Connect { reason, .. }) => assert_eq!(reason, ConnectReason::Unreachable),
            other => panic!("Expected Connect error, got {:?}", other.err()),
        };
    }

    #[test]
    fn test_leases_carry_leak_threshold() {
        let dir = TempDir::new().unwrap();
        let connector = PooledConnector::sqlite_file(
            "leaky-pool",
            dir.path().join("l.db"),
            PoolSettings {
                leak_detection_threshold_ms: 1,
                ..settings(2)
            },
        );
        connector.connect().unwrap();

        let lease = connector.borrow().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(lease.leaked_for().is_some());
    }

    #[test]
    fn test_close_and_reconnect() {
        let dir = TempDir::new().unwrap();
        let connector = PooledConnector::sqlite_file("cycle-pool", dir.path().join("c.db"), settings(2));

        assert!(connector.borrow().is_err());
        connector.connect().unwrap();
        assert!(connector.open_connections().unwrap() >= 1);

        connector.close();
        assert!(!connector.is_connected());
        assert_eq!(connector.open_connections(), None);

        connector.connect().unwrap();
        assert!(connector.borrow().is_ok());
    }
}
