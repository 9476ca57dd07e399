//! Error types for scrape_cluster operations.
//!
//! Component operations log backend failures and return benign values, so
//! only construction and configuration surface errors:
//! - Configuration loading and validation
//! - Connecting to the coordination store

use thiserror::Error;

use crate::cluster::store::StoreError;
use crate::config::ConfigError;

/// Errors that can occur while setting up a coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to coordination store at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: StoreError,
    },
}

/// Result type for coordinator setup.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_conversion() {
        let err: CoordinatorError = ConfigError::ValidationFailed("bad".to_string()).into();
        assert!(matches!(err, CoordinatorError::Config(_)));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_connection_error_display() {
        let err = CoordinatorError::Connection {
            url: "redis://nowhere:6379".to_string(),
            source: StoreError::ConnectionFailed("refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("redis://nowhere:6379"));
        assert!(msg.contains("refused"));
    }
}
