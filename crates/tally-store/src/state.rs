//! Lifecycle states of a [`crate::Database`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type-safe enumeration of database lifecycle states.
///
/// Legal transitions:
///
/// ```text
/// Closed ──▶ Patching ──▶ Open ──▶ Closing ──▶ Closed
///               │                               ▲
///               └───────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    /// Not connected; no work is accepted
    #[default]
    Closed,

    /// Schema setup in progress; only operation-critical work runs
    Patching,

    /// Schema is current and ordinary work is accepted
    Open,

    /// Shutdown in progress; queued work is draining
    Closing,
}

impl DbState {
    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(self, next: DbState) -> bool {
        matches!(
            (self, next),
            (DbState::Closed, DbState::Patching)
                | (DbState::Patching, DbState::Open)
                | (DbState::Patching, DbState::Closed)
                | (DbState::Open, DbState::Closing)
                | (DbState::Closing, DbState::Closed)
        )
    }

    /// Convert to the lowercase string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbState::Closed => "closed",
            DbState::Patching => "patching",
            DbState::Open => "open",
            DbState::Closing => "closing",
        }
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(DbState::Closed),
            "patching" => Ok(DbState::Patching),
            "open" => Ok(DbState::Open),
            "closing" => Ok(DbState::Closing),
            _ => Err(format!("Invalid database state: {s}")),
        }
    }
}
