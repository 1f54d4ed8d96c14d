//! Controller-specific error types.
//!
//! This module defines error types specific to the multus-service controller
//! that are not covered by the cluster client's errors.

use crate::key::KeyError;
use cluster_client::ClusterError;
use thiserror::Error;

/// Errors that can occur in the multus-service controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster cache or API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// No selected pod carries a secondary-network device
    #[error("No secondary-network devices found for service {namespace}/{name}")]
    NoDevices {
        namespace: String,
        name: String,
    },

    /// Work-item key could not be decoded
    #[error("Malformed work-item key: {0}")]
    MalformedKey(#[from] KeyError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Probe(String),

    /// A handler panicked while reconciling a work item
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// Metrics could not be registered or rendered
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ControllerError {
    /// Whether the work item should go back on the queue.
    ///
    /// Transient cluster failures and handler panics are retried; malformed
    /// input fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Cluster(err) => err.is_retryable(),
            ControllerError::NoDevices { .. }
            | ControllerError::MalformedKey(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::Metrics(_) => false,
            ControllerError::Watch(_)
            | ControllerError::Probe(_)
            | ControllerError::HandlerPanicked(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let transient = ControllerError::Cluster(ClusterError::CacheUnavailable("pods".to_string()));
        assert!(transient.is_retryable());

        let invalid = ControllerError::Cluster(ClusterError::Invalid("bad port".to_string()));
        assert!(!invalid.is_retryable());

        let no_devices = ControllerError::NoDevices {
            namespace: "default".to_string(),
            name: "web".to_string(),
        };
        assert!(!no_devices.is_retryable());
        assert!(!ControllerError::MalformedKey(KeyError::FieldCount(3)).is_retryable());
        assert!(ControllerError::HandlerPanicked("boom".to_string()).is_retryable());
    }
}
