//! Error types for the acoustics core
//!
//! World errors are always recovered locally by the caller (the sample or cell is
//! skipped). Only configuration loading surfaces an error to the embedding code.

/// Errors returned by a [`crate::world::WorldQuery`] implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("cell ({x}, {y}, {z}) is not loaded")]
    Unloaded { x: i32, y: i32, z: i32 },

    #[error("column ({x}, {z}) is not loaded")]
    ColumnUnloaded { x: i32, z: i32 },
}

/// Errors that can occur while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
