//! ClusterClient trait for mocking
//!
//! The reconciler talks to the cluster only through this trait. The concrete
//! `KubeClusterClient` reads from reflector caches and writes through the API
//! server; tests use the in-memory `MockClusterClient`.

use crate::error::ClusterError;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;

/// Trait for cluster read/write operations
///
/// Reads are served from an eventually-consistent local cache and return the
/// last observed object. All async methods must be `Send` to work with Tokio's
/// work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // Cached reads
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError>;
    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>, ClusterError>;

    // Writes
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError>;
    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
