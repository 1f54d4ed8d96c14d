//! Cluster access errors
//!
//! The reconciler only needs to tell "already satisfied" outcomes
//! (`NotFound`, `AlreadyExists`) apart from real failures, so raw
//! `kube::Error` API statuses are folded into dedicated variants.

use thiserror::Error;

/// Errors that can occur when reading from the cache or writing to the API server
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Object does not exist (cache miss or HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists (HTTP 409, reason `AlreadyExists`)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency conflict (HTTP 409, stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// API server rejected the object as invalid (HTTP 422 / 400)
    #[error("Invalid object: {0}")]
    Invalid(String),

    /// The reflector cache has not synced or its writer is gone
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Any other Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(kube::Error),
}

impl ClusterError {
    /// Returns `true` for a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Returns `true` when a create raced with an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    /// Whether retrying the same request later can succeed.
    ///
    /// Invalid objects are rejected the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClusterError::Invalid(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref status) if status.code == 404 => {
                ClusterError::NotFound(status.message.clone())
            }
            kube::Error::Api(ref status) if status.code == 409 && status.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(status.message.clone())
            }
            kube::Error::Api(ref status) if status.code == 409 => {
                ClusterError::Conflict(status.message.clone())
            }
            kube::Error::Api(ref status) if status.code == 422 || status.code == 400 => {
                ClusterError::Invalid(status.message.clone())
            }
            other => ClusterError::Kube(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ClusterError::NotFound("svc".to_string()).is_not_found());
        assert!(!ClusterError::NotFound("svc".to_string()).is_already_exists());
        assert!(ClusterError::AlreadyExists("svc".to_string()).is_already_exists());
        assert!(ClusterError::CacheUnavailable("pods".to_string()).is_retryable());
        assert!(ClusterError::Conflict("stale resourceVersion".to_string()).is_retryable());
        assert!(!ClusterError::Invalid("name too long".to_string()).is_retryable());
    }
}
