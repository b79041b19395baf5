//! Kernel identifiers.
//!
//! A kernel id names one prepared kernel and its `kernel-<id>.json`
//! connection file. It is written to disk as a plain string. Callers may
//! pick their own; generated ones are UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a kernel managed by this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    /// Create from any string value.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Create a new ID using UUID v4 (random).
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// View as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for KernelId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for KernelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for KernelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for KernelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = KernelId::default();
        let b = KernelId::default();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = KernelId::from("kernel-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"kernel-a\"");
    }
}
