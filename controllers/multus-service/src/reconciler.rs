//! Reconciliation logic for opted-in Services.
//!
//! Each handler converges the derived Services of one source Service towards
//! the desired state and is safe to run any number of times: objects that
//! already exist are left to the update path, objects that are already gone
//! count as deleted.
//!
//! A source is in one of three states:
//! - Disabled: annotation absent or `"false"`, no derived Services
//! - Enabled, synced: one derived Service per device suffix
//! - Enabled, stale: derived Services differ from the device set or the source spec

use crate::desired::{
    carry_forward, derived_name, desired_service, device_of, is_owned_by, needs_update,
    with_owner, OptIn,
};
use crate::devices::{dedup_devices, device_suffixes};
use crate::error::ControllerError;
use cluster_client::{selector_string, ClusterClientTrait};
use k8s_openapi::api::core::v1::Service;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reconciles derived Services against their source.
#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn ClusterClientTrait>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(client: Arc<dyn ClusterClientTrait>) -> Self {
        Self { client }
    }

    /// Creates one derived Service per device suffix.
    ///
    /// This method:
    /// 1. Reads the source Service from the cache
    /// 2. Returns early unless the source is opted in
    /// 3. Resolves the device-name set from the selected pods
    /// 4. Creates every derived Service, treating "already exists" as done
    ///
    /// Objects created before a failure are kept; the retry picks up where
    /// this pass stopped.
    pub async fn handle_service_add(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(source) = self.source(namespace, name).await? else {
            return Ok(());
        };

        if !OptIn::of(&source).is_enabled() {
            info!("Service {}/{} is not opted in, nothing to create", namespace, name);
            return Ok(());
        }

        let devices = self.device_names(namespace, &source).await?;
        if devices.is_empty() {
            error!(
                "No secondary-network devices found for service {}/{} (no selected pod carries an attachment)",
                namespace, name
            );
            return Err(ControllerError::NoDevices {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        self.create_derived(namespace, &source, &devices).await
    }

    /// Brings derived Services in line with the current source and device set.
    ///
    /// An opted-out source has all of its derived Services removed. An
    /// opted-in source gets missing derived Services created, existing ones
    /// updated with the current spec, and ones whose device disappeared deleted.
    /// When no device is left at all the owned derived Services are removed
    /// before `NoDevices` is reported.
    pub async fn handle_service_update(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(source) = self.source(namespace, name).await? else {
            return Ok(());
        };

        if !OptIn::of(&source).is_enabled() {
            return self.tear_down(namespace, &source).await;
        }

        let devices = self.device_names(namespace, &source).await?;
        if devices.is_empty() {
            error!("No secondary-network devices found for service {}/{}", namespace, name);
            // Every device is gone, so every owned derived Service is stale
            self.prune_stale(namespace, &source, &devices).await?;
            return Err(ControllerError::NoDevices {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let template = with_owner(desired_service(&source), &source);
        let mut missing = Vec::new();

        for device in &devices {
            let derived = derived_name(name, device);
            let existing = match self.client.get_service(namespace, &derived).await {
                Ok(existing) => existing,
                Err(e) if e.is_not_found() => {
                    missing.push(derived);
                    continue;
                }
                Err(e) => {
                    error!("Failed to read derived service {}/{}: {}", namespace, derived, e);
                    return Err(e.into());
                }
            };

            let mut desired = template.clone();
            desired.metadata.name = Some(derived.clone());
            carry_forward(&mut desired, &existing);

            if !needs_update(&existing, &desired) {
                debug!("Derived service {}/{} is up to date", namespace, derived);
                continue;
            }

            if let Err(e) = self.client.update_service(namespace, &desired).await {
                error!("Failed to update derived service {}/{}: {}", namespace, derived, e);
                return Err(e.into());
            }
            info!("Service {}/{} updated", namespace, derived);
        }

        if !missing.is_empty() {
            info!(
                "Creating missing derived services for {}/{}: {}",
                namespace,
                name,
                missing.join(", ")
            );
            self.create_derived(namespace, &source, &devices).await?;
        }

        self.prune_stale(namespace, &source, &devices).await
    }

    /// Deletes the derived Services of a source that is still in the cache.
    pub async fn handle_service_delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let Some(source) = self.source(namespace, name).await? else {
            return Ok(());
        };

        for device in self.device_names(namespace, &source).await? {
            let derived = derived_name(name, &device);
            match self.client.get_service(namespace, &derived).await {
                Ok(_) => self.delete_derived(namespace, &derived).await?,
                Err(e) if e.is_not_found() => {
                    debug!("Derived service {}/{} already gone", namespace, derived);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Resolves the distinct device suffixes of the pods `source` selects in `namespace`.
    pub async fn device_names(
        &self,
        namespace: &str,
        source: &Service,
    ) -> Result<BTreeSet<String>, ControllerError> {
        let name = source.metadata.name.as_deref().unwrap_or("<unknown>");
        let selector = source
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default();

        let pods = self
            .client
            .list_pods(namespace, &selector)
            .await
            .map_err(|e| {
                error!(
                    "Failed to list pods for service {}/{} (selector {}): {}",
                    namespace,
                    name,
                    selector_string(&selector),
                    e
                );
                e
            })?;

        let devices = dedup_devices(device_suffixes(&pods));
        debug!("Service {}/{} devices: {:?}", namespace, name, devices);
        Ok(devices)
    }

    async fn source(&self, namespace: &str, name: &str) -> Result<Option<Service>, ControllerError> {
        match self.client.get_service(namespace, name).await {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.is_not_found() => {
                info!("Service {}/{} no longer exists, nothing to reconcile", namespace, name);
                Ok(None)
            }
            Err(e) => {
                error!("Failed to read service {}/{}: {}", namespace, name, e);
                Err(e.into())
            }
        }
    }

    async fn create_derived(
        &self,
        namespace: &str,
        source: &Service,
        devices: &BTreeSet<String>,
    ) -> Result<(), ControllerError> {
        let source_name = source.metadata.name.as_deref().unwrap_or_default();
        let template = with_owner(desired_service(source), source);

        for device in devices {
            let mut derived = template.clone();
            let derived_name = derived_name(source_name, device);
            derived.metadata.name = Some(derived_name.clone());

            match self.client.create_service(namespace, &derived).await {
                Ok(_) => info!("Service {}/{} created", namespace, derived_name),
                Err(e) if e.is_already_exists() => {
                    info!("Service {}/{} already exists", namespace, derived_name);
                }
                Err(e) => {
                    error!("Failed to create derived service {}/{}: {}", namespace, derived_name, e);
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Removes every derived Service of an opted-out source.
    ///
    /// Covers both the names the current pods imply and any derived Service the
    /// source still owns, so pods that went away do not leave orphans behind.
    async fn tear_down(&self, namespace: &str, source: &Service) -> Result<(), ControllerError> {
        let name = source.metadata.name.as_deref().unwrap_or_default();
        info!("Service {}/{} opted out, removing derived services", namespace, name);

        let mut targets: BTreeSet<String> = self
            .device_names(namespace, source)
            .await?
            .iter()
            .map(|device| derived_name(name, device))
            .collect();
        targets.extend(self.owned_derived(namespace, source).await?.into_keys());

        for derived in &targets {
            self.delete_derived(namespace, derived).await?;
        }
        Ok(())
    }

    /// Deletes derived Services whose device is no longer attached to any selected pod.
    async fn prune_stale(
        &self,
        namespace: &str,
        source: &Service,
        devices: &BTreeSet<String>,
    ) -> Result<(), ControllerError> {
        for (derived, device) in self.owned_derived(namespace, source).await? {
            if !devices.contains(&device) {
                info!("Device {} is gone, removing {}/{}", device, namespace, derived);
                self.delete_derived(namespace, &derived).await?;
            }
        }
        Ok(())
    }

    /// Cached derived Services owned by `source`, keyed by name, with their device suffix.
    async fn owned_derived(
        &self,
        namespace: &str,
        source: &Service,
    ) -> Result<BTreeMap<String, String>, ControllerError> {
        let (Some(name), Some(uid)) = (source.metadata.name.as_deref(), source.metadata.uid.as_deref()) else {
            return Ok(BTreeMap::new());
        };

        Ok(self
            .client
            .list_services(namespace)
            .await?
            .into_iter()
            .filter(|svc| is_owned_by(svc, uid))
            .filter_map(|svc| {
                let derived = svc.metadata.name?;
                let device = device_of(&derived, name)?.to_string();
                Some((derived, device))
            })
            .collect())
    }

    async fn delete_derived(&self, namespace: &str, derived: &str) -> Result<(), ControllerError> {
        match self.client.delete_service(namespace, derived).await {
            Ok(()) => {
                info!("Service {}/{} deleted", namespace, derived);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Service {}/{} already deleted", namespace, derived);
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete derived service {}/{}: {}", namespace, derived, e);
                Err(e.into())
            }
        }
    }
}
