//! Single-connection connector for the embedded single-file engine.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use super::{apply_sqlite_pragmas, BackendConnector, ConnectionLease};
use crate::{
    error::{ConnectReason, Result, StoreError},
    sql::DbType,
};

/// Where the embedded database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedLocation {
    File(PathBuf),
    /// Private in-memory database, lost when the connection closes
    Memory,
}

/// Reuses one long-lived connection for the lifetime of the database.
///
/// The single-file engine is not safe under concurrent writers, so the
/// connection sits behind a mutex and every lease is exclusive. Returning a
/// lease only releases the lock; the connection stays open until
/// [`close`](BackendConnector::close).
pub struct EmbeddedConnector {
    name: String,
    location: EmbeddedLocation,
    busy_timeout: Duration,
    keep_alive_interval: Duration,
    connection: Mutex<Option<Connection>>,
    connected: AtomicBool,
}

impl EmbeddedConnector {
    /// Creates a connector for the database file at `path`.
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self::new(EmbeddedLocation::File(path.as_ref().to_path_buf()))
    }

    /// Creates a connector for a private in-memory database.
    pub fn memory() -> Self {
        Self::new(EmbeddedLocation::Memory)
    }

    fn new(location: EmbeddedLocation) -> Self {
        let name = match &location {
            EmbeddedLocation::File(path) => format!("embedded:{}", path.display()),
            EmbeddedLocation::Memory => "embedded:memory".to_string(),
        };
        Self {
            name,
            location,
            busy_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(60),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn location(&self) -> &EmbeddedLocation {
        &self.location
    }

    fn open_connection(&self) -> Result<Connection> {
        let opened = match &self.location {
            EmbeddedLocation::File(path) => Connection::open(path),
            EmbeddedLocation::Memory => Connection::open_in_memory(),
        };
        let mut connection = opened.map_err(|e| {
            StoreError::connect(DbType::EmbeddedFile, ConnectReason::Unreachable)
                .with_source(self.open_hint(), e)
        })?;
        apply_sqlite_pragmas(&mut connection, self.busy_timeout).map_err(|e| {
            StoreError::connect(DbType::EmbeddedFile, ConnectReason::Unreachable)
                .with_source("failed to configure the database connection", e)
        })?;
        debug!("Opened connection for '{}'", self.name);
        Ok(connection)
    }

    fn open_hint(&self) -> String {
        match &self.location {
            EmbeddedLocation::File(path) => format!(
                "could not open '{}'; check that its directory exists and is writable",
                path.display()
            ),
            EmbeddedLocation::Memory => "could not open an in-memory database".to_string(),
        }
    }

    fn not_connected(&self) -> StoreError {
        StoreError::connect(DbType::EmbeddedFile, ConnectReason::NotConnected)
            .message(format!("'{}' is not connected", self.name))
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(self.not_connected());
        }
        let mut guard = self.connection.lock();
        if guard.is_none() {
            *guard = Some(self.open_connection()?);
        }
        Ok(guard)
    }
}

impl BackendConnector for EmbeddedConnector {
    fn kind(&self) -> DbType {
        DbType::EmbeddedFile
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            *guard = Some(self.open_connection()?);
        }
        self.connected.store(true, Ordering::Release);
        info!("Connected '{}'", self.name);
        Ok(())
    }

    fn borrow(&self) -> Result<ConnectionLease<'_>> {
        let guard = self.lock_open()?;
        let mapped = MutexGuard::try_map(guard, Option::as_mut).map_err(|_| self.not_connected())?;
        Ok(ConnectionLease::new(Box::new(mapped), &self.name, None))
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(connection) = self.connection.lock().take() {
            if let Err((_, e)) = connection.close() {
                warn!("Failed to close connection for '{}': {e}", self.name);
            }
        }
        info!("Closed '{}'", self.name);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        Some(self.keep_alive_interval)
    }

    fn keep_alive(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let mut guard = self.connection.lock();
        let healthy = guard
            .as_ref()
            .map(|connection| {
                connection
                    .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .is_ok()
            })
            .unwrap_or(false);

        if !healthy {
            warn!("Connection for '{}' failed its keep-alive check, reopening", self.name);
            if let Some(stale) = guard.take() {
                let _ = stale.close();
            }
            *guard = Some(self.open_connection()?);
        }
        Ok(())
    }
}
