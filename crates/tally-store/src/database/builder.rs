//! Builder for creating and configuring Database instances.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::debug;

use super::Database;
use crate::{
    config::{DatabaseConfig, NetworkSettings, PoolSettings},
    connector::{BackendConnector, EmbeddedConnector, MissingDriverConnector, PooledConnector},
    error::{Result, StoreError},
    patches::{self, Patch},
    sql::DbType,
};

/// Builder for creating and configuring Database instances.
#[derive(Clone, Default)]
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    connector: Option<Arc<dyn BackendConnector>>,
    patches: Option<Vec<Arc<dyn Patch>>>,
}

impl DatabaseBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from settings supplied by the configuration subsystem.
    pub fn from_config(config: DatabaseConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: DbType) -> Self {
        self.config.kind = kind;
        self
    }

    /// Sets the database file for the embedded kinds.
    ///
    /// If not specified, uses XDG Base Directory specification:
    /// `$XDG_DATA_HOME/tally/database.db` or `~/.local/share/tally/database.db`
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn network(mut self, network: NetworkSettings) -> Self {
        self.config.network = network;
        self
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.config.pool = pool;
        self
    }

    /// How long `close()` waits for queued transactions.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = duration_ms(grace);
        self
    }

    /// Longest time a caller waits at the access gate.
    pub fn gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.gate_timeout_ms = duration_ms(timeout);
        self
    }

    /// Delay before secondary indexes are created; `None` skips them.
    pub fn index_delay(mut self, delay: Option<Duration>) -> Self {
        self.config.index_delay_ms = delay.map(duration_ms);
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval_ms = duration_ms(interval);
        self
    }

    /// Uses `connector` instead of the one the backend kind would select.
    ///
    /// This is how networked backends are wired in: the engine does not
    /// bundle a networked driver, so the caller supplies a connector whose
    /// connections speak the networked dialect.
    pub fn connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.config.kind = connector.kind();
        self.connector = Some(connector);
        self
    }

    /// Replaces the patch registry.
    pub(crate) fn patches(mut self, patches: Vec<Arc<dyn Patch>>) -> Self {
        self.patches = Some(patches);
        self
    }

    /// Builds the configured database, still closed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidInput` if the settings are inconsistent
    /// Returns `StoreError::FileSystem` if the database directory cannot be created
    /// Returns `StoreError::XdgDirectory` if no default location is available
    pub fn build(self) -> Result<Database> {
        self.config.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => Self::select_connector(&self.config)?,
        };
        debug!("Using connector '{}' for {}", connector.name(), connector.kind());

        let patches = self.patches.unwrap_or_else(patches::registry);
        Ok(Database::new(self.config, connector, patches))
    }

    /// Builds the database and initializes it on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns any error of [`build`](Self::build) or [`Database::init`]
    pub async fn open(self) -> Result<Arc<Database>> {
        let db = Arc::new(self.build()?);
        db.init_async().await?;
        Ok(db)
    }

    fn select_connector(config: &DatabaseConfig) -> Result<Arc<dyn BackendConnector>> {
        let connector: Arc<dyn BackendConnector> = match config.kind {
            DbType::EmbeddedFile => {
                let path = Self::prepare_file(config)?;
                Arc::new(
                    EmbeddedConnector::file(path)
                        .with_busy_timeout(config.busy_timeout())
                        .with_keep_alive_interval(config.keep_alive_interval()),
                )
            }
            DbType::EmbeddedServer => {
                let path = Self::prepare_file(config)?;
                let name = format!("pool:{}", path.display());
                Arc::new(
                    PooledConnector::sqlite_file(name, path, config.pool.clone())
                        .with_busy_timeout(config.busy_timeout()),
                )
            }
            DbType::Networked => Arc::new(MissingDriverConnector::new(DbType::Networked)),
        };
        Ok(connector)
    }

    fn prepare_file(config: &DatabaseConfig) -> Result<PathBuf> {
        let path = match &config.file {
            Some(path) => path.clone(),
            None => Self::default_database_path()?,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::FileSystem {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        Ok(path)
    }

    /// Returns the default database path following XDG Base Directory
    /// specification.
    fn default_database_path() -> Result<PathBuf> {
        xdg::BaseDirectories::with_prefix("tally")
            .place_data_file("database.db")
            .map_err(|e| StoreError::XdgDirectory(e.to_string()))
    }
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("config", &self.config)
            .field("connector", &self.connector.as_ref().map(|c| c.name().to_string()))
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_embedded_file_creates_parent_directories() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("nested").join("dir").join("tally.db");

        let db = DatabaseBuilder::new().file(&path).build().unwrap();

        assert_eq!(db.kind(), DbType::EmbeddedFile);
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_networked_without_connector_uses_placeholder() {
        let db = DatabaseBuilder::new().kind(DbType::Networked).build().unwrap();

        assert_eq!(db.kind(), DbType::Networked);
        assert_eq!(db.dialect(), crate::sql::Dialect::MySql);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let result = DatabaseBuilder::new()
            .pool(PoolSettings {
                max_size: 0,
                ..PoolSettings::default()
            })
            .build();

        match result {
            Err(StoreError::InvalidInput { field, .. }) => assert_eq!(field, "pool.max_size"),
            other => panic!("Expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn test_injected_connector_sets_kind() {
        let builder = DatabaseBuilder::new()
            .connector(Arc::new(EmbeddedConnector::memory()))
            .shutdown_grace(Duration::from_millis(1500));

        assert_eq!(builder.config.kind, DbType::EmbeddedFile);
        assert_eq!(builder.config.shutdown_grace_ms, 1500);
    }
}
