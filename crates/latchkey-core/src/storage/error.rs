//! Record store error types.
//!
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors (including injected faults)
//! - `Corrupt`: a stored key or value violates its layout

use thiserror::Error;

/// Errors that can occur during record store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored data does not match the expected layout
    #[error("corrupt {table} entry: {reason}")]
    Corrupt {
        /// Table holding the bad entry
        table: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    ///
    /// Only I/O failures are transient. Encoding problems and corrupt entries
    /// fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        assert!(StoreError::Io("disk full".to_string()).is_transient());
    }

    #[test]
    fn data_errors_are_fatal() {
        assert!(!StoreError::Serialization("bad cbor".to_string()).is_transient());
        assert!(
            !StoreError::Corrupt { table: "contacts", reason: "short key".to_string() }
                .is_transient()
        );
    }
}
