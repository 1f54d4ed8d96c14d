//! Cluster client for the multus-service controller
//!
//! The controller reads Services and Pods from locally cached reflector stores
//! and writes derived Services through the API server. This crate wraps both
//! behind one trait so reconciliation logic can be tested without a cluster.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//! use k8s_openapi::api::core::v1::{Pod, Service};
//! use kube_runtime::reflector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let (services, _service_writer) = reflector::store::<Service>();
//! let (pods, _pod_writer) = reflector::store::<Pod>();
//!
//! // The writers are fed by watch streams elsewhere
//! let cluster = KubeClusterClient::new(client, services, pods);
//! cluster.wait_until_ready().await?;
//!
//! let svc = cluster.get_service("default", "web").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod selector;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use error::ClusterError;
pub use selector::{matches_labels, pod_matches, selector_string};
pub use cluster_trait::ClusterClientTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockClusterClient, MockOperation};
