//! Label-equality selectors
//!
//! Services select pods with a plain `key=value` map. An empty or missing
//! selector places no constraint, so it matches every pod in the namespace.

use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Returns `true` when every selector entry is present with the same value in `labels`.
///
/// An empty selector matches any label set, unlabelled objects included.
pub fn matches_labels(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.and_then(|labels| labels.get(key)) == Some(value))
}

/// Returns `true` when the pod lives in `namespace` and its labels satisfy `selector`.
pub fn pod_matches(pod: &Pod, namespace: &str, selector: &BTreeMap<String, String>) -> bool {
    pod.metadata.namespace.as_deref() == Some(namespace)
        && matches_labels(selector, pod.metadata.labels.as_ref())
}

/// Renders the selector in `kubectl` syntax, for log lines.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
