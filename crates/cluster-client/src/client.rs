//! Kubernetes-backed cluster client
//!
//! Reads come from `kube_runtime` reflector stores that the controller's watch
//! tasks keep up to date; writes go straight to the API server through
//! `Api<Service>`.

use crate::error::ClusterError;
use crate::cluster_trait::ClusterClientTrait;
use crate::selector::pod_matches;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use kube_runtime::reflector::{ObjectRef, Store};
use std::collections::BTreeMap;
use tracing::debug;

/// Cluster client over reflector caches
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    services: Store<Service>,
    pods: Store<Pod>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("cached_services", &self.services.state().len())
            .field("cached_pods", &self.pods.state().len())
            .finish()
    }
}

impl KubeClusterClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `client` - Kubernetes client used for writes
    /// * `services` - Reader half of the Service reflector
    /// * `pods` - Reader half of the Pod reflector
    pub fn new(client: Client, services: Store<Service>, pods: Store<Pod>) -> Self {
        Self {
            client,
            services,
            pods,
        }
    }

    /// Waits until both caches have completed their initial list.
    pub async fn wait_until_ready(&self) -> Result<(), ClusterError> {
        let (services, pods) = tokio::join!(
            self.services.wait_until_ready(),
            self.pods.wait_until_ready()
        );
        services.map_err(|e| ClusterError::CacheUnavailable(format!("services: {e}")))?;
        pods.map_err(|e| ClusterError::CacheUnavailable(format!("pods: {e}")))?;
        Ok(())
    }

    fn service_api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        let key = ObjectRef::<Service>::new(name).within(namespace);
        self.services
            .get(&key)
            .map(|svc| svc.as_ref().clone())
            .ok_or_else(|| ClusterError::NotFound(format!("service {namespace}/{name}")))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        Ok(self
            .services
            .state()
            .into_iter()
            .filter(|svc| svc.metadata.namespace.as_deref() == Some(namespace))
            .map(|svc| svc.as_ref().clone())
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        let pods: Vec<Pod> = self
            .pods
            .state()
            .into_iter()
            .filter(|pod| pod_matches(pod, namespace, selector))
            .map(|pod| pod.as_ref().clone())
            .collect();
        debug!("Matched {} pods in namespace {}", pods.len(), namespace);
        Ok(pods)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        Ok(self
            .service_api(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Invalid("service has no name".to_string()))?;
        Ok(self
            .service_api(namespace)
            .replace(name, &PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.service_api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
