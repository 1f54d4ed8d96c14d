//! Mock ClusterClient for unit testing
//!
//! Stores Services and Pods in memory and behaves like the API server for the
//! parts the controller relies on: creates fail with `AlreadyExists`, deletes
//! and updates of missing objects fail with `NotFound`, stale resourceVersions
//! conflict, and cluster IPs are allocated on create. Any operation can be
//! told to fail so retry paths can be exercised.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::selector::pod_matches;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Operations that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    GetService,
    ListServices,
    ListPods,
    CreateService,
    UpdateService,
    DeleteService,
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) services: Arc<Mutex<BTreeMap<(String, String), Service>>>,
    pub(crate) pods: Arc<Mutex<Vec<Pod>>>,
    pub(crate) failing: Arc<Mutex<HashSet<MockOperation>>>,
    pub(crate) calls: Arc<Mutex<HashMap<MockOperation, usize>>>,
    // Counter for resourceVersions, UIDs and cluster IPs
    pub(crate) next_id: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service to the mock store (for test setup), keeping its metadata as given
    pub fn add_service(&self, service: Service) {
        let key = Self::key_of(&service);
        self.services.lock().unwrap().insert(key, service);
    }

    /// Add a pod to the mock store (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    /// Remove every pod (for test setup)
    pub fn clear_pods(&self) {
        self.pods.lock().unwrap().clear();
    }

    /// Look up a stored service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all stored services in a namespace, sorted
    pub fn service_names(&self, namespace: &str) -> Vec<String> {
        self.services
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Make every call of `op` fail with a retryable error
    pub fn fail(&self, op: MockOperation) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Stop failing `op`
    pub fn recover(&self, op: MockOperation) {
        self.failing.lock().unwrap().remove(&op);
    }

    /// Number of times `op` was called, failed calls included
    pub fn call_count(&self, op: MockOperation) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn record(&self, op: MockOperation) -> Result<(), ClusterError> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        if self.failing.lock().unwrap().contains(&op) {
            return Err(ClusterError::CacheUnavailable(format!("injected failure for {op:?}")));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }

    fn key_of(service: &Service) -> (String, String) {
        (
            service.metadata.namespace.clone().unwrap_or_default(),
            service.metadata.name.clone().unwrap_or_default(),
        )
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.record(MockOperation::GetService)?;
        self.service(namespace, name)
            .ok_or_else(|| ClusterError::NotFound(format!("service {namespace}/{name}")))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        self.record(MockOperation::ListServices)?;
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, svc)| svc.clone())
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.record(MockOperation::ListPods)?;
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| pod_matches(pod, namespace, selector))
            .cloned()
            .collect())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        self.record(MockOperation::CreateService)?;
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("service has no name".to_string()))?;
        let key = (namespace.to_string(), name.clone());
        if self.services.lock().unwrap().contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("service {namespace}/{name}")));
        }

        let id = self.next_id();
        let mut created = service.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-{id}"));
        created.metadata.resource_version = Some(id.to_string());
        if let Some(spec) = created.spec.as_mut() {
            let headless = spec.cluster_ip.as_deref() == Some("None");
            if !headless {
                let ip = format!("10.96.0.{id}");
                spec.cluster_ip = Some(ip.clone());
                spec.cluster_ips = Some(vec![ip]);
            }
        }
        self.services.lock().unwrap().insert(key, created.clone());
        Ok(created)
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, ClusterError> {
        self.record(MockOperation::UpdateService)?;
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("service has no name".to_string()))?;
        let key = (namespace.to_string(), name.clone());
        let current = self
            .service(namespace, &name)
            .ok_or_else(|| ClusterError::NotFound(format!("service {namespace}/{name}")))?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(ClusterError::Conflict(format!(
                "service {namespace}/{name}: resourceVersion {:?} is stale",
                service.metadata.resource_version
            )));
        }

        let mut updated = service.clone();
        updated.metadata.namespace = Some(namespace.to_string());
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.resource_version = Some(self.next_id().to_string());
        self.services.lock().unwrap().insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.record(MockOperation::DeleteService)?;
        self.services
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("service {namespace}/{name}")))
    }
}
