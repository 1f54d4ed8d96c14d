//! Kubernetes resource watchers.
//!
//! This module runs the watch streams that keep the reflector caches current
//! and turns Service notifications into work-item keys.
//!
//! Only Services are subscribed to. Pods are watched for the cache the
//! reconciler reads, but a pod change never produces a key on its own, and
//! Endpoints are not watched at all.

use crate::desired::OptIn;
use crate::error::ControllerError;
use crate::key::{EventType, ResourceKind, WorkItem};
use crate::queue::WorkQueue;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube_runtime::reflector::store::Writer;
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns Service watch events into add/update keys.
///
/// The watch stream reports "this object now looks like X" rather than
/// separate add and update notifications, so the filter remembers the last
/// resourceVersion it saw per Service. A Service seen for the first time is an
/// add, a new resourceVersion is an update, and a re-delivery of the same
/// version (initial list, relist after a dropped watch) is ignored.
///
/// The reflector only publishes a relist to its store once the relist is
/// complete, so keys found during a relist are held back until `InitDone`.
/// Workers then never look up a Service the cache does not show yet.
#[derive(Debug, Default)]
pub struct EventFilter {
    seen: HashMap<(String, String), String>,
    /// Services re-delivered during the relist in progress, if any
    relisted: Option<HashSet<(String, String)>>,
    /// Keys waiting for the relist in progress to reach the store
    held: Vec<WorkItem>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Work items that are ready to be queued after one watch event.
    ///
    /// Items found between `Init` and `InitDone` are returned together with
    /// `InitDone`.
    pub fn observe(&mut self, event: &watcher::Event<Service>) -> Vec<WorkItem> {
        match event {
            watcher::Event::Init => {
                debug!("Service relist started");
                // A restarted relist keeps what the interrupted one held back
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(service) => {
                if let (Some(relisted), Some(id)) = (self.relisted.as_mut(), identity(service)) {
                    relisted.insert(id);
                }
                if let Some(item) = self.apply(service) {
                    self.held.push(item);
                }
                Vec::new()
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    let before = self.seen.len();
                    self.seen.retain(|id, _| relisted.contains(id));
                    debug!(
                        "Service relist complete, forgot {} services that disappeared",
                        before - self.seen.len()
                    );
                }
                std::mem::take(&mut self.held)
            }
            watcher::Event::Apply(service) => self.apply(service).into_iter().collect(),
            watcher::Event::Delete(service) => {
                if let Some(id) = identity(service) {
                    info!(
                        "Service {}/{} deleted; derived services are removed by owner-reference garbage collection",
                        id.0, id.1
                    );
                    self.seen.remove(&id);
                }
                Vec::new()
            }
        }
    }

    fn apply(&mut self, service: &Service) -> Option<WorkItem> {
        let (namespace, name) = identity(service)?;
        let version = service.metadata.resource_version.clone().unwrap_or_default();

        let event = match self.seen.insert((namespace.clone(), name.clone()), version.clone()) {
            None => EventType::Add,
            Some(previous) if previous != version => EventType::Update,
            Some(_) => return None,
        };

        let opt_in = OptIn::of(service);
        if !opt_in.is_well_formed() {
            if opt_in == OptIn::Malformed {
                warn!("Service {}/{} has a malformed opt-in annotation, ignoring", namespace, name);
            }
            return None;
        }

        debug!("Service {}/{} {} (resourceVersion {})", namespace, name, event.as_str(), version);
        Some(WorkItem::new(namespace, name, event, ResourceKind::Service))
    }
}

fn identity(service: &Service) -> Option<(String, String)> {
    Some((service.metadata.namespace.clone()?, service.metadata.name.clone()?))
}

/// Notification subscriptions of the controller.
///
/// Services are the only subscribed kind. Pod and Endpoints notifications
/// are not subscribed to, so there is no field for them.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pub services: EventFilter,
}

/// Watches Services, feeding the Service cache and the work queue.
///
/// Runs until the stream ends; watch errors are logged and the watcher
/// re-establishes itself with backoff.
pub async fn watch_services(
    api: Api<Service>,
    writer: Writer<Service>,
    mut filter: EventFilter,
    queue: Arc<WorkQueue<String>>,
) -> Result<(), ControllerError> {
    info!("Starting Service watcher");

    let mut stream = Box::pin(
        watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer),
    );

    while let Some(result) = stream.next().await {
        match result {
            // `reflect` has already applied the event to the store
            Ok(event) => {
                for item in filter.observe(&event) {
                    queue.add(item.encode());
                }
            }
            Err(e) => warn!("Service watch error: {}", e),
        }
    }

    Err(ControllerError::Watch("Service watch stream ended".to_string()))
}

/// Watches Pods for the cache only.
pub async fn watch_pods(api: Api<Pod>, writer: Writer<Pod>) -> Result<(), ControllerError> {
    info!("Starting Pod watcher");

    let mut stream = Box::pin(
        watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer),
    );

    while let Some(result) = stream.next().await {
        match result {
            Ok(watcher::Event::InitDone) => debug!("Pod cache synchronized"),
            Ok(_) => {}
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }

    Err(ControllerError::Watch("Pod watch stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::ENABLE_ANNOTATION;
    use crate::test_utils::create_test_service;
    use kube_runtime::reflector::{self, ObjectRef, Store};

    fn versioned(name: &str, enable: Option<&str>, version: &str) -> Service {
        let mut service = create_test_service(name, "default", enable);
        service.metadata.resource_version = Some(version.to_string());
        service
    }

    fn encoded(items: Vec<WorkItem>) -> Vec<String> {
        items.iter().map(WorkItem::encode).collect()
    }

    /// The resourceVersion the store holds for a work item's Service
    fn cached_version(store: &Store<Service>, item: &WorkItem) -> Option<String> {
        let key = ObjectRef::<Service>::new(&item.name).within(&item.namespace);
        store.get(&key).and_then(|service| service.metadata.resource_version.clone())
    }

    #[test]
    fn test_first_sighting_is_add_then_update() {
        let mut filter = EventFilter::new();

        let add = filter.observe(&watcher::Event::Apply(versioned("web", Some("true"), "1")));
        assert_eq!(encoded(add), vec!["default/web/add/services"]);

        let update = filter.observe(&watcher::Event::Apply(versioned("web", Some("true"), "2")));
        assert_eq!(encoded(update), vec!["default/web/update/services"]);
    }

    #[test]
    fn test_same_version_is_ignored() {
        let mut filter = EventFilter::new();
        filter.observe(&watcher::Event::Apply(versioned("web", Some("true"), "1")));

        assert!(filter
            .observe(&watcher::Event::Apply(versioned("web", Some("true"), "1")))
            .is_empty());
    }

    #[test]
    fn test_only_well_formed_opt_in_is_enqueued() {
        let mut filter = EventFilter::new();

        assert!(filter.observe(&watcher::Event::Apply(versioned("plain", None, "1"))).is_empty());
        assert!(filter
            .observe(&watcher::Event::Apply(versioned("typo", Some("yes"), "1")))
            .is_empty());

        // Disabled services are still reconciled
        let disabled = filter.observe(&watcher::Event::Apply(versioned("off", Some("false"), "1")));
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].event, EventType::Add);
    }

    #[test]
    fn test_opting_in_later_is_an_update() {
        let mut filter = EventFilter::new();
        assert!(filter.observe(&watcher::Event::Apply(versioned("web", None, "1"))).is_empty());

        let mut service = versioned("web", None, "2");
        service
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ENABLE_ANNOTATION.to_string(), "true".to_string());

        let items = filter.observe(&watcher::Event::Apply(service));
        assert_eq!(encoded(items), vec!["default/web/update/services"]);
    }

    #[test]
    fn test_delete_produces_no_key_and_forgets() {
        let mut filter = EventFilter::new();
        filter.observe(&watcher::Event::Apply(versioned("web", Some("true"), "1")));

        assert!(filter
            .observe(&watcher::Event::Delete(versioned("web", Some("true"), "1")))
            .is_empty());

        // Recreated under the same name: a fresh add
        let items = filter.observe(&watcher::Event::Apply(versioned("web", Some("true"), "5")));
        assert_eq!(encoded(items), vec!["default/web/add/services"]);
    }

    #[test]
    fn test_relist_prunes_vanished_services() {
        let mut filter = EventFilter::new();
        filter.observe(&watcher::Event::Apply(versioned("kept", Some("true"), "1")));
        filter.observe(&watcher::Event::Apply(versioned("gone", Some("true"), "1")));

        filter.observe(&watcher::Event::Init);
        filter.observe(&watcher::Event::InitApply(versioned("kept", Some("true"), "1")));
        assert!(filter.observe(&watcher::Event::InitDone).is_empty());

        let items = filter.observe(&watcher::Event::Apply(versioned("gone", Some("true"), "7")));
        assert_eq!(encoded(items), vec!["default/gone/add/services"]);
    }

    #[test]
    fn test_relist_keys_are_released_at_init_done() {
        let mut filter = EventFilter::new();
        filter.observe(&watcher::Event::Init);

        assert!(filter
            .observe(&watcher::Event::InitApply(versioned("web", Some("true"), "1")))
            .is_empty());
        assert!(filter
            .observe(&watcher::Event::InitApply(versioned("db", Some("true"), "1")))
            .is_empty());

        let items = filter.observe(&watcher::Event::InitDone);
        assert_eq!(encoded(items), vec!["default/web/add/services", "default/db/add/services"]);

        // Nothing is released twice
        filter.observe(&watcher::Event::Init);
        assert!(filter.observe(&watcher::Event::InitDone).is_empty());
    }

    #[test]
    fn test_restarted_relist_keeps_held_keys() {
        let mut filter = EventFilter::new();
        filter.observe(&watcher::Event::Init);
        filter.observe(&watcher::Event::InitApply(versioned("web", Some("true"), "1")));

        // The watch dropped mid-relist and started over
        filter.observe(&watcher::Event::Init);
        assert!(filter
            .observe(&watcher::Event::InitApply(versioned("web", Some("true"), "1")))
            .is_empty());

        let items = filter.observe(&watcher::Event::InitDone);
        assert_eq!(encoded(items), vec!["default/web/add/services"]);
    }

    #[test]
    fn test_every_key_is_resolvable_in_the_store() {
        let (store, mut writer) = reflector::store::<Service>();
        let mut filter = EventFilter::new();

        let events = vec![
            watcher::Event::Init,
            watcher::Event::InitDone,
            watcher::Event::Apply(versioned("web", Some("true"), "1")),
            // The watch dropped and the relist sees a new version plus a new Service
            watcher::Event::Init,
            watcher::Event::InitApply(versioned("web", Some("true"), "2")),
            watcher::Event::InitApply(versioned("api", Some("true"), "1")),
            watcher::Event::InitDone,
            watcher::Event::Apply(versioned("api", Some("true"), "2")),
        ];

        let mut released = Vec::new();
        for event in &events {
            // Same order as `reflect`: the store first, then the filter
            writer.apply_watcher_event(event);
            for item in filter.observe(event) {
                assert!(
                    cached_version(&store, &item).is_some(),
                    "{} was queued before the store held it",
                    item.encode()
                );
                released.push((item.encode(), cached_version(&store, &item)));
            }
        }

        assert_eq!(
            released,
            vec![
                ("default/web/add/services".to_string(), Some("1".to_string())),
                ("default/web/update/services".to_string(), Some("2".to_string())),
                ("default/api/add/services".to_string(), Some("1".to_string())),
                ("default/api/update/services".to_string(), Some("2".to_string())),
            ]
        );
    }

    #[test]
    fn test_store_lags_relist_until_init_done() {
        let (store, mut writer) = reflector::store::<Service>();
        let mut filter = EventFilter::new();

        let init = watcher::Event::Init;
        let apply = watcher::Event::InitApply(versioned("web", Some("true"), "1"));
        writer.apply_watcher_event(&init);
        filter.observe(&init);
        writer.apply_watcher_event(&apply);

        // The store has not published the relist yet, so no key may leave the filter
        let key = ObjectRef::<Service>::new("web").within("default");
        assert!(store.get(&key).is_none());
        assert!(filter.observe(&apply).is_empty());

        writer.apply_watcher_event(&watcher::Event::InitDone);
        let items = filter.observe(&watcher::Event::InitDone);
        assert_eq!(encoded(items), vec!["default/web/add/services"]);
        assert!(store.get(&key).is_some());
    }
}
