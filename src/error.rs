use thiserror::Error;

use crate::domain::EntityId;

/// Main error type for the coordination protocol
#[derive(Error, Debug)]
pub enum MeshError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // World state errors
    #[error("Unknown world entity: {0}")]
    UnknownEntity(EntityId),

    // Policy errors
    #[error("Policy failure: {0}")]
    Policy(String),

    // Scenario errors
    #[error("Scenario error: {0}")]
    Scenario(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MeshError
pub type Result<T> = std::result::Result<T, MeshError>;
