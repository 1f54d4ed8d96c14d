//! Desired state of derived Services.
//!
//! A derived Service is a copy of its source with everything the platform
//! assigns stripped off, so the API server can allocate it afresh. It selects
//! no pods and is never node-reachable.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::info;

/// Service annotation opting a Service in (`"true"`) or out (`"false"`)
pub const ENABLE_ANNOTATION: &str = "k8s.v1.cni.cncf.io/multus-service-enable";

/// Name prefix of every derived Service
pub const DERIVED_NAME_PREFIX: &str = "multus-service-";

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
const CLUSTER_IP: &str = "ClusterIP";
const NODE_REACHABLE_TYPES: [&str; 2] = ["NodePort", "LoadBalancer"];

/// Value of the opt-in annotation on a Service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptIn {
    Enabled,
    Disabled,
    Absent,
    Malformed,
}

impl OptIn {
    pub fn of(service: &Service) -> Self {
        let value = service
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ENABLE_ANNOTATION));
        match value.map(String::as_str) {
            Some("true") => OptIn::Enabled,
            Some("false") => OptIn::Disabled,
            Some(_) => OptIn::Malformed,
            None => OptIn::Absent,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == OptIn::Enabled
    }

    /// `"true"` or `"false"`: both are worth a reconciliation.
    pub fn is_well_formed(self) -> bool {
        matches!(self, OptIn::Enabled | OptIn::Disabled)
    }
}

/// `multus-service-<source>`: the template name before a device suffix is added.
pub fn derived_base_name(source_name: &str) -> String {
    format!("{DERIVED_NAME_PREFIX}{source_name}")
}

/// `multus-service-<source>-<device>`
pub fn derived_name(source_name: &str, device: &str) -> String {
    format!("{DERIVED_NAME_PREFIX}{source_name}-{device}")
}

/// Returns the device suffix when `name` is a derived name of `source_name`.
pub fn device_of<'a>(name: &'a str, source_name: &str) -> Option<&'a str> {
    name.strip_prefix(DERIVED_NAME_PREFIX)?
        .strip_prefix(source_name)?
        .strip_prefix('-')
        .filter(|device| !device.is_empty())
}

/// Builds the derived-Service template for `source`.
///
/// The caller appends the device suffix to the name and attaches the owner
/// reference.
pub fn desired_service(source: &Service) -> Service {
    let source_name = source.metadata.name.as_deref().unwrap_or_default();
    let mut derived = source.clone();

    let meta = &mut derived.metadata;
    meta.name = Some(derived_base_name(source_name));
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.self_link = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(ENABLE_ANNOTATION);
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }

    derived.status = None;

    if let Some(spec) = derived.spec.as_mut() {
        // Headless stays headless; anything else is allocated anew
        if spec.cluster_ip.as_deref() != Some("None") {
            spec.cluster_ip = None;
            spec.cluster_ips = None;
        } else {
            spec.cluster_ips = None;
        }
        spec.selector = None;

        if spec
            .type_
            .as_deref()
            .is_some_and(|t| NODE_REACHABLE_TYPES.contains(&t))
        {
            info!(
                "{} type is not supported for derived services, using ClusterIP for {}",
                spec.type_.as_deref().unwrap_or_default(),
                derived_base_name(source_name)
            );
            spec.type_ = Some(CLUSTER_IP.to_string());
            for port in spec.ports.iter_mut().flatten() {
                port.node_port = None;
            }
            spec.external_traffic_policy = None;
            spec.health_check_node_port = None;
            spec.allocate_load_balancer_node_ports = None;
            spec.load_balancer_class = None;
            spec.load_balancer_ip = None;
            spec.load_balancer_source_ranges = None;
        }
    }

    derived
}

/// Controller owner reference pointing at `source`.
///
/// `None` when the source has not been persisted yet (no UID).
pub fn owner_reference(source: &Service) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: source.metadata.name.clone()?,
        uid: source.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Attaches the owner reference of `source` to `derived`.
pub fn with_owner(mut derived: Service, source: &Service) -> Service {
    derived.metadata.owner_references = owner_reference(source).map(|owner| vec![owner]);
    derived
}

/// Whether `service` carries an owner reference to the object with `uid`.
pub fn is_owned_by(service: &Service, uid: &str) -> bool {
    service
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == uid)
}

/// Copies identity and platform-allocated addresses from the live object.
///
/// Updates carry the live resourceVersion so the API server can detect
/// concurrent writers.
pub fn carry_forward(desired: &mut Service, existing: &Service) {
    desired.metadata.uid = existing.metadata.uid.clone();
    desired.metadata.resource_version = existing.metadata.resource_version.clone();

    if let (Some(spec), Some(live)) = (desired.spec.as_mut(), existing.spec.as_ref()) {
        if spec.cluster_ip.is_none() {
            spec.cluster_ip = live.cluster_ip.clone();
            spec.cluster_ips = live.cluster_ips.clone();
        }
    }
}

/// Returns `true` when the live object differs from the desired one in
/// anything this controller manages.
pub fn needs_update(existing: &Service, desired: &Service) -> bool {
    existing.metadata.labels != desired.metadata.labels
        || existing.metadata.annotations != desired.metadata.annotations
        || existing.metadata.owner_references != desired.metadata.owner_references
        || existing.spec != desired.spec
}
