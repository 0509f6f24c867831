//! Transactional storage engine for the Tally analytics service.
//!
//! This crate owns one relational backend per [`Database`]: it opens the
//! connection or pool, brings an empty or legacy schema up to date through an
//! ordered list of idempotent patches, serializes every write through a
//! single worker, and lets reads run concurrently on the calling threads.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   query    ┌─────────────┐  borrow   ┌───────────────────┐
//! │              │──────────▶│ Access gate │─────────▶│                   │
//! │   Database   │            └─────────────┘           │ Backend connector │
//! │ (lifecycle)  │  execute   ┌─────────────┐  borrow   │ (embedded/pooled) │
//! │              │──────────▶│  Executor   │─────────▶│                   │
//! └──────────────┘            └─────────────┘           └───────────────────┘
//! ```
//!
//! - [`connector`]: how connections are opened, lent and released
//! - [`gate`]: holds ordinary work back while the schema is being patched
//! - [`work`]: [`Query`](work::Query), [`Executable`](work::Executable) and
//!   [`Transaction`](work::Transaction) units of work
//! - [`patches`]: the fixed, ordered patch registry
//! - [`sql`]: backend kinds, dialects and the typed statement builder
//!
//! # Quick Start
//!
//! ```rust
//! use tally_store::{sql::Identifier, work::row_count, DatabaseBuilder, DbState};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let db = DatabaseBuilder::new()
//!     .file(dir.path().join("tally.db"))
//!     .open()
//!     .await?;
//! assert_eq!(db.state(), DbState::Open);
//!
//! let users = db.query_async(row_count(&Identifier::new("users")?)).await?;
//! assert_eq!(users, 0);
//!
//! db.close_async().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod database;
pub mod error;
mod executor;
pub mod gate;
pub mod patches;
mod schedule;
pub mod schema;
pub mod sql;
pub mod state;
pub mod work;

// Re-export commonly used types
pub use config::{DatabaseConfig, NetworkSettings, PoolSettings};
pub use connector::{BackendConnector, ConnectionLease, EmbeddedConnector, PooledConnector};
pub use database::{Database, DatabaseBuilder};
pub use error::{ConnectReason, Result, StoreError};
pub use executor::TransactionHandle;
pub use patches::AppliedPatch;
pub use sql::{DbType, Dialect};
pub use state::DbState;
