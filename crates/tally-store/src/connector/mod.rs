//! Backend connectors: how a database obtains and releases connections.
//!
//! A [`BackendConnector`] is the only piece of the engine that knows whether
//! connections are pooled or reused. Everything above it works with a
//! [`ConnectionLease`], which derefs to a [`rusqlite::Connection`] and hands
//! the connection back when dropped.
//!
//! | Kind                         | Connector              | Return on drop     |
//! |------------------------------|------------------------|--------------------|
//! | [`DbType::EmbeddedFile`]     | [`EmbeddedConnector`]  | unlock, keep open  |
//! | [`DbType::EmbeddedServer`]   | [`PooledConnector`]    | back to the pool   |
//! | [`DbType::Networked`]        | injected by the caller | back to the pool   |

use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use log::warn;
use rusqlite::Connection;

use crate::{
    error::{ConnectReason, Result, StoreError},
    sql::DbType,
};

pub mod embedded;
pub mod pooled;

pub use embedded::EmbeddedConnector;
pub use pooled::PooledConnector;

/// Strategy that opens, lends and releases connections for one backend kind.
pub trait BackendConnector: Send + Sync {
    /// Backend kind served by this connector.
    fn kind(&self) -> DbType;

    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Establishes the connection or pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] when the backend cannot be reached or
    /// no driver is available.
    fn connect(&self) -> Result<()>;

    /// Lends a connection for exclusive use until the lease is dropped.
    fn borrow(&self) -> Result<ConnectionLease<'_>>;

    /// Releases every connection. Borrowing afterwards fails until
    /// [`connect`](Self::connect) is called again.
    fn close(&self);

    /// Whether [`connect`](Self::connect) succeeded and `close` has not run.
    fn is_connected(&self) -> bool;

    /// Interval at which [`keep_alive`](Self::keep_alive) should run, if the
    /// connector needs it.
    fn keep_alive_interval(&self) -> Option<Duration> {
        None
    }

    /// Re-validates long-lived connections, reopening them when broken.
    fn keep_alive(&self) -> Result<()> {
        Ok(())
    }
}

/// Exclusive use of one connection, returned to its connector on drop.
pub struct ConnectionLease<'a> {
    connection: Box<dyn DerefMut<Target = Connection> + 'a>,
    owner: &'a str,
    borrowed_at: Instant,
    leak_threshold: Option<Duration>,
}

impl<'a> ConnectionLease<'a> {
    pub(crate) fn new(
        connection: Box<dyn DerefMut<Target = Connection> + 'a>,
        owner: &'a str,
        leak_threshold: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            owner,
            borrowed_at: Instant::now(),
            leak_threshold,
        }
    }

    /// How long this lease has been held.
    pub fn held_for(&self) -> Duration {
        self.borrowed_at.elapsed()
    }

    /// How long the lease has been held, once that exceeds the connector's
    /// leak-detection threshold.
    pub fn leaked_for(&self) -> Option<Duration> {
        let threshold = self.leak_threshold?;
        let held = self.held_for();
        (held > threshold).then_some(held)
    }
}

impl Deref for ConnectionLease<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for ConnectionLease<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if let (Some(held), Some(threshold)) = (self.leaked_for(), self.leak_threshold) {
            warn!(
                "Connection from '{}' was held for {:?}, longer than the leak detection threshold of {:?}",
                self.owner, held, threshold
            );
        }
    }
}

/// Connector for a backend kind whose driver is not linked into this build.
///
/// Every `connect()` fails with an actionable [`StoreError::Connect`].
#[derive(Debug)]
pub struct MissingDriverConnector {
    kind: DbType,
    name: String,
}

impl MissingDriverConnector {
    pub fn new(kind: DbType) -> Self {
        Self {
            kind,
            name: format!("{kind}-unavailable"),
        }
    }

    fn error(&self) -> StoreError {
        StoreError::connect(self.kind, ConnectReason::DriverUnavailable).message(format!(
            "no {} driver is available in this build; supply a connector with \
             DatabaseBuilder::connector, or switch the database kind to embedded-file",
            self.kind
        ))
    }
}

impl BackendConnector for MissingDriverConnector {
    fn kind(&self) -> DbType {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<()> {
        Err(self.error())
    }

    fn borrow(&self) -> Result<ConnectionLease<'_>> {
        Err(self.error())
    }

    fn close(&self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

/// Pragmas applied to every SQLite connection the engine opens.
pub(crate) fn apply_sqlite_pragmas(
    connection: &mut Connection,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    connection.busy_timeout(busy_timeout)?;
    connection.execute_batch(
        "PRAGMA journal_mode = WAL;\
         PRAGMA foreign_keys = ON;\
         PRAGMA synchronous = NORMAL;",
    )
}
