//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watch tasks,
//! the work queue and the worker pool together. All shared state lives in one
//! [`Context`] handed to every worker behind an `Arc`.

use crate::backoff::MaxOfRateLimiter;
use crate::config::Config;
use crate::error::ControllerError;
use crate::key::{EventType, ResourceKind, WorkItem};
use crate::metrics::{Metrics, OUTCOME_DROPPED, OUTCOME_RETRY, OUTCOME_SUCCESS};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::watcher::{watch_pods, watch_services, Subscriptions};
use cluster_client::{ClusterClientTrait, KubeClusterClient};
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Api, Client};
use kube_runtime::reflector::{self, store::Writer};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Failed work items are requeued at most this many times before being dropped
pub const MAX_REQUEUES: u32 = 5;

/// Delay before a panicked worker is restarted
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// State shared by all workers
#[derive(Debug)]
pub struct Context {
    pub queue: Arc<WorkQueue<String>>,
    pub reconciler: Reconciler,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(client: Arc<dyn ClusterClientTrait>, metrics: Arc<Metrics>) -> Self {
        Self {
            queue: WorkQueue::new(Box::new(MaxOfRateLimiter::default_controller())),
            reconciler: Reconciler::new(client),
            metrics,
        }
    }

    /// Takes one key off the queue and reconciles it.
    ///
    /// Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.set_queue_depth(self.queue.len());

        // Released on every exit path, panics included
        let guard = self.queue.processing(key);
        let key = guard.item();

        let item = match WorkItem::decode(key) {
            Ok(item) => item,
            Err(e) => {
                error!("Dropping malformed work item {:?}: {}", key, e);
                self.queue.forget(key);
                self.metrics.record_drop();
                return true;
            }
        };

        // A panicking handler fails the item instead of losing it
        let result = match AssertUnwindSafe(self.dispatch(&item)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ControllerError::HandlerPanicked(panic_message(payload.as_ref()))),
        };
        self.handle_result(key, &item, result);
        true
    }

    async fn dispatch(&self, item: &WorkItem) -> Result<(), ControllerError> {
        let (namespace, name) = (item.namespace.as_str(), item.name.as_str());
        debug!("Processing {}", item);

        match (item.event, item.resource) {
            (EventType::Add, ResourceKind::Service) => {
                self.reconciler.handle_service_add(namespace, name).await
            }
            (EventType::Update, ResourceKind::Service) => {
                self.reconciler.handle_service_update(namespace, name).await
            }
            (EventType::Delete, ResourceKind::Service) => {
                self.reconciler.handle_service_delete(namespace, name).await
            }
            (
                EventType::Add | EventType::Update | EventType::Delete,
                ResourceKind::Pod | ResourceKind::Endpoints,
            ) => {
                debug!("No handler for {} events, ignoring {}", item.resource.as_str(), item);
                Ok(())
            }
        }
    }

    fn handle_result(&self, key: &String, item: &WorkItem, result: Result<(), ControllerError>) {
        let event = item.event.as_str();
        match result {
            Ok(()) => {
                self.queue.forget(key);
                self.metrics.record_reconcile(event, OUTCOME_SUCCESS);
            }
            Err(e) if e.is_retryable() && self.queue.num_requeues(key) < MAX_REQUEUES => {
                warn!("Error syncing {}: {}, requeueing", key, e);
                self.queue.add_rate_limited(key.clone());
                self.metrics.record_reconcile(event, OUTCOME_RETRY);
                self.metrics.record_requeue();
            }
            Err(e) => {
                self.queue.forget(key);
                if e.is_retryable() {
                    error!(
                        "Dropping {} out of the queue after {} retries: {}",
                        key, MAX_REQUEUES, e
                    );
                } else {
                    error!("Dropping {} out of the queue: {}", key, e);
                }
                self.metrics.record_reconcile(event, OUTCOME_DROPPED);
                self.metrics.record_drop();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handles of the running watch tasks, or the pieces needed to start them
enum Watches {
    Pending {
        services: Writer<Service>,
        pods: Writer<Pod>,
    },
    Running(Vec<JoinHandle<Result<(), ControllerError>>>),
}

/// Main controller for derived Service management.
pub struct Controller {
    context: Arc<Context>,
    kube_client: Client,
    namespace: Option<String>,
    cluster: Arc<KubeClusterClient>,
    ready: Arc<AtomicBool>,
    watches: Watches,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("namespace", &self.namespace)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: &Config) -> Result<Self, ControllerError> {
        info!("Initializing Multus Service Controller");

        // In-cluster configuration first, then kubeconfig
        let kube_client = Client::try_default()
            .await
            .map_err(|e| ControllerError::Cluster(e.into()))?;

        let (service_store, service_writer) = reflector::store::<Service>();
        let (pod_store, pod_writer) = reflector::store::<Pod>();
        let cluster = Arc::new(KubeClusterClient::new(kube_client.clone(), service_store, pod_store));

        let metrics = Arc::new(Metrics::new()?);
        let context = Arc::new(Context::new(Arc::clone(&cluster) as Arc<dyn ClusterClientTrait>, metrics));

        Ok(Self {
            context,
            kube_client,
            namespace: config.namespace.clone(),
            cluster,
            ready: Arc::new(AtomicBool::new(false)),
            watches: Watches::Pending {
                services: service_writer,
                pods: pod_writer,
            },
        })
    }

    /// Readiness flag, set once the caches have synced.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.context.metrics)
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.kube_client.clone(), ns),
            None => Api::all(self.kube_client.clone()),
        }
    }

    /// Starts the watch tasks and connects Service notifications to the queue.
    pub fn register_handlers(&mut self) -> Result<(), ControllerError> {
        let (services, pods) = match std::mem::replace(&mut self.watches, Watches::Running(Vec::new())) {
            Watches::Pending { services, pods } => (services, pods),
            running @ Watches::Running(_) => {
                self.watches = running;
                return Err(ControllerError::Watch("handlers are already registered".to_string()));
            }
        };

        let subscriptions = Subscriptions::default();
        let service_watcher = tokio::spawn(watch_services(
            self.api::<Service>(),
            services,
            subscriptions.services,
            Arc::clone(&self.context.queue),
        ));
        let pod_watcher = tokio::spawn(watch_pods(self.api::<Pod>(), pods));

        self.watches = Watches::Running(vec![service_watcher, pod_watcher]);
        info!("Registered Service event handlers");
        Ok(())
    }

    /// Blocks until the Service and Pod caches have completed their initial list.
    pub async fn wait_for_cache_sync(&self) -> Result<(), ControllerError> {
        if matches!(self.watches, Watches::Pending { .. }) {
            return Err(ControllerError::Watch(
                "caches cannot sync before handlers are registered".to_string(),
            ));
        }

        info!("Waiting for informer caches to sync");
        self.cluster.wait_until_ready().await?;
        self.ready.store(true, Ordering::Release);
        info!("Caches are synced");
        Ok(())
    }

    /// Runs `threadiness` workers until `shutdown` resolves or a watch task fails.
    ///
    /// On shutdown the queue stops handing out keys: handlers in flight
    /// finish, queued keys are abandoned.
    pub async fn run(
        mut self,
        threadiness: usize,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ControllerError> {
        let watches = match &mut self.watches {
            Watches::Running(handles) => handles,
            Watches::Pending { .. } => {
                return Err(ControllerError::Watch("handlers are not registered".to_string()));
            }
        };

        info!("Starting {} workers", threadiness);
        let workers: Vec<_> = (0..threadiness)
            .map(|id| tokio::spawn(supervise_worker(Arc::clone(&self.context), id)))
            .collect();

        let outcome = tokio::select! {
            () = shutdown => {
                info!("Shutdown requested, stopping workers");
                Ok(())
            }
            result = first_exit(watches) => {
                error!("Watch task stopped: {:?}", result);
                result.and(Err(ControllerError::Watch("watch task stopped".to_string())))
            }
        };

        self.context.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        for handle in watches.iter() {
            handle.abort();
        }

        info!("Controller stopped");
        outcome
    }
}

async fn first_exit(handles: &mut [JoinHandle<Result<(), ControllerError>>]) -> Result<(), ControllerError> {
    if handles.is_empty() {
        return futures::future::pending().await;
    }
    let (result, _, _) = futures::future::select_all(handles.iter_mut()).await;
    result.map_err(|e| ControllerError::Watch(format!("watch task panicked: {e}")))?
}

/// Runs one worker, restarting it after a panic until the queue shuts down.
async fn supervise_worker(context: Arc<Context>, id: usize) {
    loop {
        let worker = tokio::spawn(run_worker(Arc::clone(&context)));
        match worker.await {
            Ok(()) => {
                debug!("Worker {} stopped", id);
                return;
            }
            Err(e) if e.is_panic() => {
                error!("Worker {} panicked, restarting in {:?}", id, WORKER_RESTART_DELAY);
                tokio::time::sleep(WORKER_RESTART_DELAY).await;
                if context.queue.is_shutting_down() {
                    return;
                }
            }
            Err(e) => {
                warn!("Worker {} was cancelled: {}", id, e);
                return;
            }
        }
    }
}

async fn run_worker(context: Arc<Context>) {
    while context.process_next_item().await {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_pod, create_test_service};
    use cluster_client::{ClusterError, MockClusterClient, MockOperation};
    use std::collections::BTreeMap;

    const NS: &str = "default";

    /// Client whose every call panics
    #[derive(Debug)]
    struct PanickingClient;

    #[async_trait::async_trait]
    impl ClusterClientTrait for PanickingClient {
        async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
            panic!("get_service {namespace}/{name}")
        }

        async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
            panic!("list_services {namespace}")
        }

        async fn list_pods(
            &self,
            namespace: &str,
            _selector: &BTreeMap<String, String>,
        ) -> Result<Vec<Pod>, ClusterError> {
            panic!("list_pods {namespace}")
        }

        async fn create_service(&self, namespace: &str, _service: &Service) -> Result<Service, ClusterError> {
            panic!("create_service {namespace}")
        }

        async fn update_service(&self, namespace: &str, _service: &Service) -> Result<Service, ClusterError> {
            panic!("update_service {namespace}")
        }

        async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
            panic!("delete_service {namespace}/{name}")
        }
    }

    fn panicking_context() -> Arc<Context> {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        Arc::new(Context::new(Arc::new(PanickingClient), metrics))
    }

    fn context(mock: &MockClusterClient) -> Arc<Context> {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        Arc::new(Context::new(Arc::new(mock.clone()), metrics))
    }

    #[tokio::test]
    async fn test_successful_item_is_forgotten() {
        let mock = MockClusterClient::new();
        mock.add_service(create_test_service("web", NS, Some("true")));
        mock.add_pod(create_test_pod("web-1", NS, &[("app", "web")], Some("macvlan@net1")));
        let ctx = context(&mock);

        ctx.queue.add("default/web/add/services".to_string());
        assert!(ctx.process_next_item().await);

        assert!(mock.service(NS, "multus-service-web-net1").is_some());
        assert!(ctx.queue.is_empty());
        assert_eq!(ctx.queue.num_requeues(&"default/web/add/services".to_string()), 0);
        assert_eq!(ctx.metrics.reconciles("add", OUTCOME_SUCCESS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_five_requeues() {
        let mock = MockClusterClient::new();
        mock.add_service(create_test_service("web", NS, Some("true")));
        mock.fail(MockOperation::GetService);
        let ctx = context(&mock);
        let key = "default/web/add/services".to_string();

        ctx.queue.add(key.clone());
        for _ in 0..6 {
            assert!(ctx.process_next_item().await);
        }

        assert_eq!(mock.call_count(MockOperation::GetService), 6);
        assert_eq!(ctx.metrics.requeues(), 5);
        assert_eq!(ctx.metrics.drops(), 1);
        assert_eq!(ctx.queue.num_requeues(&key), 0);

        // Nothing is scheduled any more
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(ctx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mock = MockClusterClient::new();
        mock.add_service(create_test_service("web", NS, Some("true")));
        let ctx = context(&mock);

        ctx.queue.add("default/web/add/services".to_string());
        assert!(ctx.process_next_item().await);

        assert_eq!(ctx.metrics.requeues(), 0);
        assert_eq!(ctx.metrics.drops(), 1);
        assert_eq!(ctx.metrics.reconciles("add", OUTCOME_DROPPED), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let mock = MockClusterClient::new();
        let ctx = context(&mock);

        ctx.queue.add("default/web/add".to_string());
        assert!(ctx.process_next_item().await);

        assert!(ctx.queue.is_empty());
        assert_eq!(ctx.metrics.drops(), 1);
        assert_eq!(mock.call_count(MockOperation::GetService), 0);
    }

    #[tokio::test]
    async fn test_pod_and_endpoint_keys_are_ignored() {
        let mock = MockClusterClient::new();
        let ctx = context(&mock);

        ctx.queue.add("default/web-1/update/pods".to_string());
        ctx.queue.add("default/web/add/endpoints".to_string());
        assert!(ctx.process_next_item().await);
        assert!(ctx.process_next_item().await);

        assert_eq!(mock.call_count(MockOperation::GetService), 0);
        assert_eq!(ctx.metrics.reconciles("update", OUTCOME_SUCCESS), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_requeued() {
        let ctx = panicking_context();
        let key = "default/web/add/services".to_string();

        ctx.queue.add(key.clone());
        assert!(ctx.process_next_item().await);

        assert_eq!(ctx.queue.num_requeues(&key), 1);
        assert_eq!(ctx.metrics.requeues(), 1);
        assert_eq!(ctx.metrics.reconciles("add", OUTCOME_RETRY), 1);
        assert_eq!(ctx.metrics.drops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeatedly_panicking_handler_is_dropped() {
        let ctx = panicking_context();
        let key = "default/web/update/services".to_string();

        ctx.queue.add(key.clone());
        for _ in 0..=MAX_REQUEUES {
            assert!(ctx.process_next_item().await);
        }

        assert_eq!(ctx.metrics.requeues(), u64::from(MAX_REQUEUES));
        assert_eq!(ctx.metrics.drops(), 1);
        assert_eq!(ctx.metrics.reconciles("update", OUTCOME_DROPPED), 1);
        assert_eq!(ctx.queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let mock = MockClusterClient::new();
        let ctx = context(&mock);
        let worker = tokio::spawn(supervise_worker(Arc::clone(&ctx), 0));

        ctx.queue.shut_down();

        worker.await.expect("worker exits cleanly");
        assert!(!ctx.process_next_item().await);
    }
}
