//! Validated SQL identifiers.

use std::fmt;

use crate::error::{Result, StoreError};

const MAX_IDENTIFIER_LEN: usize = 64;

/// A table, column or index name that is safe to place in SQL text.
///
/// Identifiers start with an ASCII letter or underscore, continue with ASCII
/// alphanumerics or underscores, and are at most 64 bytes long (the MySQL
/// limit, which is the stricter of the supported dialects).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    /// Validates `name` and wraps it.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: &str| StoreError::InvalidIdentifier {
            value: name.clone(),
            reason: reason.to_string(),
        };

        let mut chars = name.chars();
        match chars.next() {
            None => return Err(invalid("identifier is empty")),
            Some(first) if !(first.is_ascii_alphabetic() || first == '_') => {
                return Err(invalid("must start with a letter or underscore"));
            }
            Some(_) => {}
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("longer than 64 characters"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("only letters, digits and underscores are allowed"));
        }

        Ok(Self(name))
    }

    /// Identifier for names fixed at compile time.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid identifier.
    pub(crate) fn known(name: &'static str) -> Self {
        match Self::new(name) {
            Ok(identifier) => identifier,
            Err(e) => panic!("built-in identifier is invalid: {e}"),
        }
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
