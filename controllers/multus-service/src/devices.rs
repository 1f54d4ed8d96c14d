//! Secondary-network device discovery.
//!
//! Pods list their Multus attachments in the `k8s.v1.cni.cncf.io/networks`
//! annotation, either as `attachment@device` pairs separated by commas or as
//! a JSON list of network selection elements. The device part of every
//! attachment becomes a derived-service suffix.
//!
//! Garbled annotations are skipped entry by entry: one bad pod or one bad
//! entry must not stop the others from being discovered.

use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Pod annotation listing the attached secondary networks
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// JSON form of one attachment. Only the interface matters here.
#[derive(Debug, Deserialize)]
struct NetworkSelectionElement {
    name: String,
    #[serde(default)]
    interface: Option<String>,
}

/// Collects the device suffix of every well-formed attachment on `pods`.
///
/// Duplicates are kept; callers fold them with [`dedup_devices`].
pub fn device_suffixes<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> Vec<String> {
    let mut suffixes = Vec::new();

    for pod in pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or("<unknown>");
        let value = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(NETWORKS_ANNOTATION))
            .map(|value| value.trim())
            .unwrap_or_default();

        if value.is_empty() {
            info!("Pod {} has no usable {} annotation, skipped", pod_name, NETWORKS_ANNOTATION);
            continue;
        }

        if value.starts_with('[') {
            suffixes.extend(parse_json_networks(pod_name, value));
        } else {
            suffixes.extend(parse_networks(pod_name, value));
        }
    }

    suffixes
}

/// Folds raw suffixes into the device-name set.
pub fn dedup_devices(suffixes: Vec<String>) -> BTreeSet<String> {
    suffixes.into_iter().collect()
}

fn parse_networks(pod_name: &str, value: &str) -> Vec<String> {
    let mut suffixes = Vec::new();

    for entry in value.split(',') {
        let parts: Vec<&str> = entry.split('@').collect();
        if parts.len() < 2 {
            info!(
                "Pod {}: expected attachment@device but found {:?}, ignored",
                pod_name, entry
            );
            continue;
        }
        let device = parts[1].trim();
        if device.is_empty() {
            info!("Pod {}: attachment {:?} names no device, ignored", pod_name, entry);
            continue;
        }
        suffixes.push(device.to_string());
    }

    suffixes
}

fn parse_json_networks(pod_name: &str, value: &str) -> Vec<String> {
    let elements: Vec<NetworkSelectionElement> = match serde_json::from_str(value) {
        Ok(elements) => elements,
        Err(e) => {
            info!("Pod {}: {} is not a valid network list: {}", pod_name, NETWORKS_ANNOTATION, e);
            return Vec::new();
        }
    };

    elements
        .into_iter()
        .filter_map(|element| match element.interface {
            Some(interface) if !interface.trim().is_empty() => Some(interface.trim().to_string()),
            _ => {
                debug!("Pod {}: network {} has no interface name, ignored", pod_name, element.name);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pod;

    #[test]
    fn test_malformed_entry_is_skipped() {
        let pod = create_test_pod("web-1", "default", &[("app", "web")], Some("net1@devA,garbled,net2@devB"));

        let devices = dedup_devices(device_suffixes([&pod]));

        assert_eq!(devices, BTreeSet::from(["devA".to_string(), "devB".to_string()]));
    }

    #[test]
    fn test_missing_and_empty_annotations_are_skipped() {
        let bare = create_test_pod("web-1", "default", &[("app", "web")], None);
        let empty = create_test_pod("web-2", "default", &[("app", "web")], Some(""));
        let good = create_test_pod("web-3", "default", &[("app", "web")], Some("macvlan@net1"));

        assert_eq!(device_suffixes([&bare, &empty, &good]), vec!["net1".to_string()]);
    }

    #[test]
    fn test_duplicates_kept_until_dedup() {
        let a = create_test_pod("web-1", "default", &[("app", "web")], Some("macvlan@net1"));
        let b = create_test_pod("web-2", "default", &[("app", "web")], Some("macvlan@net1,sriov@net2"));

        let raw = device_suffixes([&a, &b]);
        assert_eq!(raw.len(), 3);
        assert_eq!(dedup_devices(raw).len(), 2);
    }

    #[test]
    fn test_set_is_independent_of_pod_order() {
        let a = create_test_pod("web-1", "default", &[("app", "web")], Some("macvlan@net3,macvlan@net1"));
        let b = create_test_pod("web-2", "default", &[("app", "web")], Some("sriov@net2"));
        let c = create_test_pod("web-3", "default", &[("app", "web")], Some("sriov@net1"));

        let forward = dedup_devices(device_suffixes([&a, &b, &c]));
        let backward = dedup_devices(device_suffixes([&c, &b, &a]));
        let shuffled = dedup_devices(device_suffixes([&b, &c, &a]));

        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_empty_device_and_whitespace() {
        let pod = create_test_pod("web-1", "default", &[("app", "web")], Some("net1@, net2@devB "));

        assert_eq!(device_suffixes([&pod]), vec!["devB".to_string()]);
    }

    #[test]
    fn test_extra_at_fields_use_second() {
        let pod = create_test_pod("web-1", "default", &[("app", "web")], Some("net1@devA@ignored"));

        assert_eq!(device_suffixes([&pod]), vec!["devA".to_string()]);
    }

    #[test]
    fn test_json_network_list() {
        let pod = create_test_pod(
            "web-1",
            "default",
            &[("app", "web")],
            Some(r#"[{"name":"macvlan-conf","interface":"net1"},{"name":"sriov-conf"}]"#),
        );

        assert_eq!(device_suffixes([&pod]), vec!["net1".to_string()]);
    }

    #[test]
    fn test_invalid_json_is_skipped() {
        let broken = create_test_pod("web-1", "default", &[("app", "web")], Some("[{\"name\":"));
        let good = create_test_pod("web-2", "default", &[("app", "web")], Some("macvlan@net1"));

        assert_eq!(device_suffixes([&broken, &good]), vec!["net1".to_string()]);
    }
}
