//! Error types for the storage engine.

use std::{panic::Location, path::PathBuf};

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::{sql::DbType, state::DbState};

/// Why a backend connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// No driver is linked for the requested backend kind
    DriverUnavailable,
    /// The driver is present but the backend refused or failed to open
    Unreachable,
    /// A borrowed connection was requested before `connect()` or after `close()`
    NotConnected,
}

/// Comprehensive error type for all storage operations.
///
/// The first four variants are the engine's error kinds; callers match on
/// them to decide whether a failure is local to one unit of work or has
/// changed the state of the database.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unreachable or driver unavailable
    #[error("Failed to connect to {backend} database: {message}")]
    Connect {
        backend: DbType,
        reason: ConnectReason,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// A single statement failed; the database stays usable
    #[error("Database error: {message} (at {location})")]
    Operation {
        message: String,
        statement: Option<String>,
        location: &'static Location<'static>,
        #[source]
        source: rusqlite::Error,
    },
    /// Unrecoverable failure; the database has been forced closed
    #[error("Fatal database error: {message}")]
    Fatal {
        message: String,
        remediation: Option<String>,
        #[source]
        source: Option<Box<StoreError>>,
    },
    /// Queued transactions did not drain before the shutdown grace elapsed
    #[error("{pending} queued transactions did not finish before shutdown and were kept for the next start")]
    ShutdownTimeout { pending: usize },
    /// The database is not accepting this work in its current state
    #[error("Database is unavailable (state: {state})")]
    Unavailable { state: DbState },
    /// Table, column or index name failed validation
    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },
    /// Invalid input validation errors
    #[error("Invalid input for field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },
    /// File system operation errors
    #[error("File system error at path '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        source: std::io::Error,
    },
    /// XDG directory specification errors
    #[error("XDG directory error: {0}")]
    XdgDirectory(String),
    /// Serialization/deserialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Builder for creating operation errors with optional statement context.
pub struct OperationErrorBuilder {
    message: String,
    statement: Option<String>,
    location: &'static Location<'static>,
}

impl OperationErrorBuilder {
    /// Create a new operation error builder with a message.
    ///
    /// The caller's source location is recorded as the origin of the error.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            statement: None,
            location: Location::caller(),
        }
    }

    /// Override the recorded origin.
    pub fn at(mut self, location: &'static Location<'static>) -> Self {
        self.location = location;
        self
    }

    /// Attach the SQL text that failed.
    pub fn statement(mut self, sql: impl Into<String>) -> Self {
        self.statement = Some(sql.into());
        self
    }

    /// Build the error with the given source.
    pub fn with_source(self, source: rusqlite::Error) -> StoreError {
        StoreError::Operation {
            message: self.message,
            statement: self.statement,
            location: self.location,
            source,
        }
    }
}

/// Builder for creating connect errors.
pub struct ConnectErrorBuilder {
    backend: DbType,
    reason: ConnectReason,
}

impl ConnectErrorBuilder {
    /// Build the error with a message and no underlying cause.
    pub fn message(self, message: impl Into<String>) -> StoreError {
        StoreError::Connect {
            backend: self.backend,
            reason: self.reason,
            message: message.into(),
            source: None,
        }
    }

    /// Build the error with a message and the driver's error.
    pub fn with_source<E>(self, message: impl Into<String>, source: E) -> StoreError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Connect {
            backend: self.backend,
            reason: self.reason,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl StoreError {
    /// Creates a builder for operation errors.
    #[track_caller]
    pub fn operation(message: impl Into<String>) -> OperationErrorBuilder {
        OperationErrorBuilder::new(message)
    }

    /// Creates a builder for connect errors.
    pub fn connect(backend: DbType, reason: ConnectReason) -> ConnectErrorBuilder {
        ConnectErrorBuilder { backend, reason }
    }

    /// Creates an input validation error.
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error has forced (or must force) the database closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Fatal { .. } => true,
            StoreError::Operation { source, .. } => unrecoverable_code(source).is_some(),
            _ => false,
        }
    }

    /// Promotes this error to [`StoreError::Fatal`].
    ///
    /// Errors from operation-critical work are always escalated; other
    /// operation errors only when SQLite reports an unrecoverable condition.
    /// Already-fatal errors are returned unchanged.
    pub fn escalate(self, critical: bool) -> StoreError {
        if matches!(self, StoreError::Fatal { .. }) {
            return self;
        }
        if !critical && !self.is_fatal() {
            return self;
        }

        let remediation = match &self {
            StoreError::Operation { source, .. } => remediation_for(source),
            StoreError::Connect { message, .. } => Some(message.clone()),
            _ => None,
        };
        StoreError::Fatal {
            message: self.to_string(),
            remediation,
            source: Some(Box::new(self)),
        }
    }

    /// Remediation guidance, when the failure has a known fix.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            StoreError::Fatal { remediation, .. } => remediation.as_deref(),
            _ => None,
        }
    }
}

fn sqlite_code(error: &rusqlite::Error) -> Option<ErrorCode> {
    match error {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    }
}

fn unrecoverable_code(error: &rusqlite::Error) -> Option<ErrorCode> {
    sqlite_code(error).filter(|code| {
        matches!(
            code,
            ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
        )
    })
}

fn remediation_for(error: &rusqlite::Error) -> Option<String> {
    let hint = match sqlite_code(error)? {
        ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
            "The database file is damaged. Restore it from a backup, or move it aside to start with an empty database."
        }
        ErrorCode::DiskFull => "The disk holding the database is full. Free some space and restart.",
        ErrorCode::CannotOpen => {
            "The database file could not be opened. Check that the directory exists and is writable."
        }
        ErrorCode::ReadOnly => {
            "The database is read-only. Check the file permissions and that no other process holds it read-only."
        }
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
            "Another process is holding the database. Stop it or raise busy_timeout_ms."
        }
        ErrorCode::ConstraintViolation => {
            "A constraint failed while preparing the schema. The data may predate a patch; inspect the offending rows."
        }
        _ => return None,
    };
    Some(hint.to_string())
}

/// Specialized extension trait for database-related Results.
pub trait DatabaseResultExt<T> {
    /// Map database errors with a message.
    fn db_context(self, message: &str) -> Result<T>;

    /// Map database errors with a message and the failing SQL text.
    fn sql_context(self, message: &str, sql: &str) -> Result<T>;
}

impl<T> DatabaseResultExt<T> for std::result::Result<T, rusqlite::Error> {
    #[track_caller]
    fn db_context(self, message: &str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|e| StoreError::operation(message).at(location).with_source(e))
    }

    #[track_caller]
    fn sql_context(self, message: &str, sql: &str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|e| {
            StoreError::operation(message)
                .statement(sql)
                .at(location)
                .with_source(e)
        })
    }
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_constraint_failure_stays_local() {
        let error = StoreError::operation("Failed to insert")
            .with_source(sqlite_failure(ffi::SQLITE_CONSTRAINT));

        assert!(!error.is_fatal());
        assert!(matches!(error.escalate(false), StoreError::Operation { .. }));
    }

    #[test]
    fn test_corruption_is_fatal_with_remediation() {
        let error =
            StoreError::operation("Failed to read").with_source(sqlite_failure(ffi::SQLITE_CORRUPT));

        assert!(error.is_fatal());
        let escalated = error.escalate(false);
        assert!(matches!(escalated, StoreError::Fatal { .. }));
        assert!(escalated
            .remediation()
            .expect("corruption should carry a hint")
            .contains("backup"));
    }

    #[test]
    fn test_critical_failure_is_escalated() {
        let error = StoreError::operation("Patch failed")
            .statement("ALTER TABLE users ADD COLUMN x INTEGER")
            .with_source(sqlite_failure(ffi::SQLITE_ERROR));

        match error.escalate(true) {
            StoreError::Fatal { message, source, .. } => {
                assert!(message.contains("Patch failed"));
                assert!(matches!(
                    source.as_deref(),
                    Some(StoreError::Operation { statement: Some(_), .. })
                ));
            }
            other => panic!("Expected Fatal error, got {other:?}"),
        }
    }

    #[test]
    fn test_operation_error_records_call_site() {
        let result: rusqlite::Result<()> = Err(sqlite_failure(ffi::SQLITE_ERROR));
        let expected_line = line!() + 1;
        let error = result.sql_context("Failed to update", "UPDATE t SET v = 1").unwrap_err();

        match &error {
            StoreError::Operation {
                location, statement, ..
            } => {
                assert!(location.file().ends_with("error.rs"));
                assert_eq!(location.line(), expected_line);
                assert_eq!(statement.as_deref(), Some("UPDATE t SET v = 1"));
            }
            other => panic!("Expected Operation error, got {other:?}"),
        }
        assert!(error.to_string().contains("error.rs"));
    }

    #[test]
    fn test_escalating_fatal_is_identity() {
        let error = StoreError::Fatal {
            message: "boom".to_string(),
            remediation: None,
            source: None,
        };
        match error.escalate(true) {
            StoreError::Fatal { message, source, .. } => {
                assert_eq!(message, "boom");
                assert!(source.is_none());
            }
            other => panic!("Expected Fatal error, got {other:?}"),
        }
    }
}
