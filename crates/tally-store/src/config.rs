//! Connection and engine settings supplied by the configuration subsystem.
//!
//! Every field has a default, so a collaborator only needs to provide what
//! differs:
//!
//! ```rust
//! use tally_store::{DatabaseConfig, DbType};
//!
//! let config = DatabaseConfig::from_json_str(
//!     r#"{ "kind": "embedded-server", "file": "/var/lib/tally/tally.db", "pool": { "max_size": 4 } }"#,
//! )
//! .unwrap();
//! assert_eq!(config.kind, DbType::EmbeddedServer);
//! assert_eq!(config.pool.max_size, 4);
//! ```

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StoreError},
    sql::DbType,
};

/// Settings for a networked backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct NetworkSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Driver-specific options appended to the connection URL
    pub launch_options: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "tally".to_string(),
            launch_options: "?rewriteBatchedStatements=true&useSSL=false".to_string(),
        }
    }
}

/// Bounds for pooled connectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of open connections (default: 10)
    pub max_size: u32,
    /// Connections older than this are retired (default: 25 minutes)
    pub max_lifetime_ms: u64,
    /// How long a borrow waits for a free connection (default: 5 seconds)
    pub connection_timeout_ms: u64,
    /// Leases held longer than this are reported as leaks (default: 10 minutes)
    pub leak_detection_threshold_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_lifetime_ms: 25 * 60 * 1000,
            connection_timeout_ms: 5_000,
            leak_detection_threshold_ms: 10 * 60 * 1000,
        }
    }
}

impl PoolSettings {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_detection_threshold_ms)
    }
}

/// Complete configuration of one database instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct DatabaseConfig {
    pub kind: DbType,
    /// Database file for the embedded kinds
    pub file: Option<PathBuf>,
    pub network: NetworkSettings,
    pub pool: PoolSettings,
    /// SQLite busy timeout applied to every new connection (default: 30 seconds)
    pub busy_timeout_ms: u32,
    /// Interval of the embedded keep-alive ping (default: 60 seconds)
    pub keep_alive_interval_ms: u64,
    /// How long `close()` waits for queued transactions (default: 20 seconds)
    pub shutdown_grace_ms: u64,
    /// Longest time a caller waits at the access gate (default: 60 seconds)
    pub gate_timeout_ms: u64,
    /// Delay before secondary indexes are created; `None` disables it
    /// (default: 30 seconds)
    pub index_delay_ms: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DbType::EmbeddedFile,
            file: None,
            network: NetworkSettings::default(),
            pool: PoolSettings::default(),
            busy_timeout_ms: 30_000,
            keep_alive_interval_ms: 60_000,
            shutdown_grace_ms: 20_000,
            gate_timeout_ms: 60_000,
            index_delay_ms: Some(30_000),
        }
    }
}

impl DatabaseConfig {
    /// Parses settings from JSON and validates them.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DatabaseConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the settings describe a usable backend.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(StoreError::invalid_input(
                "pool.max_size",
                "must allow at least one connection",
            ));
        }
        if self.kind == DbType::Networked {
            if self.network.host.trim().is_empty() {
                return Err(StoreError::invalid_input("network.host", "must not be empty"));
            }
            if self.network.port == 0 {
                return Err(StoreError::invalid_input("network.port", "must not be 0"));
            }
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn index_delay(&self) -> Option<Duration> {
        self.index_delay_ms.map(Duration::from_millis)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.busy_timeout_ms))
    }
}
