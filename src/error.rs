use std::io;

use thiserror::Error;

/// Main error type for tessera operations
#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Lock held: {0}")]
    LockHeld(String),

    #[error("Durability failure during {operation}: {source}")]
    Durability {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Capacity exceeded: {requested} documents requested, limit is {limit}")]
    CapacityExceeded { requested: u64, limit: u32 },

    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: String, reason: String },

    #[error("Corrupt commit {file}: {reason}")]
    CorruptCommit { file: String, reason: String },

    #[error("No index found in {0}")]
    IndexNotFound(String),

    #[error("Index writer is closed")]
    AlreadyClosed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Wrap an I/O failure that happened while writing durable state
    pub fn durability(operation: &'static str, source: io::Error) -> Self {
        TesseraError::Durability { operation, source }
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(self, TesseraError::LockHeld(_))
    }

    /// True when the error is a missing file, which readers treat as a
    /// signal that a concurrent commit replaced the one being opened.
    pub fn is_file_not_found(&self) -> bool {
        match self {
            TesseraError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            TesseraError::Durability { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::CapacityExceeded {
            requested: 2_147_483_648,
            limit: 2_147_483_647,
        };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: 2147483648 documents requested, limit is 2147483647"
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(TesseraError::LockHeld("write.lock".to_string()).is_retriable());
        assert!(!TesseraError::AlreadyClosed.is_retriable());
        assert!(!TesseraError::IndexNotFound("/tmp/x".to_string()).is_retriable());
    }

    #[test]
    fn test_file_not_found_detection() {
        let err: TesseraError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_file_not_found());

        let err = TesseraError::durability("flush", io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(!err.is_file_not_found());
    }
}
