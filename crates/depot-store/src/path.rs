use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque, content-derived identifier for a store object. Equality is by
/// value; the name never changes after validation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    /// Validate a store object base name.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::BadStorePath` when the name is empty, contains a
    /// path separator, or starts with a period.
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name.contains('/') {
            Some("name may not contain path separators")
        } else if name.starts_with('.') {
            Some("name may not start with a period")
        } else if name
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            Some("name may not contain whitespace or control characters")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(StoreError::BadStorePath { name, reason }),
            None => Ok(Self(name)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
