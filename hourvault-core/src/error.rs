//! Error types for hourvault

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for hourvault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// hourvault error types
#[derive(Error, Debug)]
pub enum VaultError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Listener socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Timestamp or file name does not map to an hour bucket
    #[error("Invalid bucket: {0}")]
    InvalidBucket(String),

    /// Hour has already been compressed and can no longer take writes
    #[error("Bucket {0} is already archived")]
    Archived(String),

    /// Compression step failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Errors that abort the process when raised during startup
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            VaultError::Bind { .. } | VaultError::Config(_) | VaultError::Sqlite(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_classification() {
        let bind = VaultError::Bind {
            addr: "127.0.0.1:514".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(bind.is_fatal_at_startup());
        assert!(VaultError::Config("missing dir".into()).is_fatal_at_startup());
        assert!(!VaultError::Compression("xz exited 1".into()).is_fatal_at_startup());
        assert!(bind.to_string().contains("127.0.0.1:514"));
    }
}
