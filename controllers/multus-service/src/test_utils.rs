//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::devices::NETWORKS_ANNOTATION;
use crate::desired::ENABLE_ANNOTATION;
use crate::reconciler::Reconciler;
use cluster_client::MockClusterClient;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::sync::Arc;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Helper to create a test source Service selecting `app=<name>`
///
/// `enable` is the value of the opt-in annotation, if any.
pub fn create_test_service(name: &str, namespace: &str, enable: Option<&str>) -> Service {
    let annotations = enable.map(|value| {
        BTreeMap::from([(ENABLE_ANNOTATION.to_string(), value.to_string())])
    });
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            resource_version: Some("1".to_string()),
            labels: Some(labels(&[("app", name)])),
            annotations,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("10.96.100.1".to_string()),
            cluster_ips: Some(vec!["10.96.100.1".to_string()]),
            selector: Some(labels(&[("app", name)])),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    target_port: Some(IntOrString::Int(8443)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Turns a test Service into a NodePort Service with the given node ports
pub fn with_node_ports(mut service: Service, node_ports: &[i32]) -> Service {
    if let Some(spec) = service.spec.as_mut() {
        spec.type_ = Some("NodePort".to_string());
        spec.external_traffic_policy = Some("Local".to_string());
        for (port, node_port) in spec.ports.iter_mut().flatten().zip(node_ports) {
            port.node_port = Some(*node_port);
        }
    }
    service
}

/// Helper to create a test Pod with an optional networks annotation
pub fn create_test_pod(
    name: &str,
    namespace: &str,
    pod_labels: &[(&str, &str)],
    networks: Option<&str>,
) -> Pod {
    let annotations = networks.map(|value| {
        BTreeMap::from([(NETWORKS_ANNOTATION.to_string(), value.to_string())])
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(pod_labels)),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reconciler over a fresh mock, returned together with the mock for setup
pub fn create_test_reconciler() -> (Reconciler, MockClusterClient) {
    let mock = MockClusterClient::new();
    let reconciler = Reconciler::new(Arc::new(mock.clone()));
    (reconciler, mock)
}
