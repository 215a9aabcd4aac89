// zblock - Rust Implementation
// A compressed in-memory block device

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::{DeviceConfig, PoolConfig};
pub use storage::{Device, DeviceSet, StatsSnapshot, PAGE_SIZE, SECTOR_SIZE};

/// zblock error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid request: {0}")]
        InvalidRequest(String),

        #[error("Out of memory: could not allocate {requested} bytes")]
        OutOfMemory { requested: usize },

        #[error("Corrupt data in page {index}: {reason}")]
        CorruptData { index: u64, reason: String },

        #[error("Device is not initialized")]
        NotInitialized,

        #[error("Device is already initialized")]
        AlreadyInitialized,

        #[error("Pool error: {0}")]
        Pool(String),

        #[error("Compression error: {0}")]
        Compression(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::OutOfMemory { requested: 4096 };
        assert_eq!(
            err.to_string(),
            "Out of memory: could not allocate 4096 bytes"
        );

        let err = error::Error::CorruptData {
            index: 7,
            reason: "short output".to_string(),
        };
        assert!(err.to_string().contains("page 7"));
    }
}
