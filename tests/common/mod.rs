use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Node, NodeSpec, PersistentVolume, PersistentVolumeSpec, VsphereVirtualDiskVolumeSource,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use vsphere_node_checker::cluster::StaticClusterState;
use vsphere_node_checker::config::{CheckerConfig, RetryConfig, Workspace};
use vsphere_node_checker::context::{Cancellation, CheckContext};
use vsphere_node_checker::crd::{Infrastructure, InfrastructureSpec, InfrastructureStatus};
use vsphere_node_checker::simulator::SimulatedInventory;

pub const VM0: &str = "DC0_H0_VM0";
pub const VM1: &str = "DC0_H0_VM1";
pub const VM0_UUID: &str = "265104de-1472-547c-b873-6dc7883fb6cb";
pub const VM1_UUID: &str = "12f8928d-f144-5c57-89db-dd2d0902c9fa";
pub const HOST_ID: &str = "host-24";

/// Node with the given name and raw provider ID.
#[allow(dead_code)]
pub fn make_node(name: Option<&str>, provider_id: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: name.map(str::to_string),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: provider_id.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn vsphere_node(name: &str, uuid: &str) -> Node {
    make_node(Some(name), Some(&format!("vsphere://{uuid}")))
}

/// The two nodes backed by the standard inventory's VMs.
#[allow(dead_code)]
pub fn default_nodes() -> Vec<Node> {
    vec![vsphere_node(VM0, VM0_UUID), vsphere_node(VM1, VM1_UUID)]
}

#[allow(dead_code)]
pub fn make_infrastructure(name: &str) -> Infrastructure {
    let mut infra = Infrastructure::new("cluster", InfrastructureSpec::default());
    infra.status = Some(InfrastructureStatus {
        infrastructure_name: Some(name.to_string()),
        platform: Some("VSphere".to_string()),
        ..Default::default()
    });
    infra
}

/// Config pointing at the standard inventory's root VM folder, with fast retries.
#[allow(dead_code)]
pub fn test_config() -> CheckerConfig {
    let mut config = CheckerConfig {
        workspace: Workspace {
            server: "vcenter.test".to_string(),
            datacenter: "DC0".to_string(),
            default_datastore: Some("LocalDS_0".to_string()),
            folder: Some("/DC0/vm".to_string()),
            user: Some("testuser".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    config.executor.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_millis: 1,
        max_backoff_millis: 5,
    };
    config
}

#[allow(dead_code)]
pub fn snapshot(nodes: Vec<Node>) -> StaticClusterState {
    StaticClusterState::new(make_infrastructure("my-cluster-id"), nodes)
}

#[allow(dead_code)]
pub async fn make_context(
    sim: Arc<SimulatedInventory>,
    cluster: StaticClusterState,
    config: &CheckerConfig,
    cancellation: Cancellation,
) -> CheckContext {
    CheckContext::new(Arc::new(cluster), sim, config, cancellation)
        .await
        .expect("context should build")
}

/// Context over the standard inventory with the default nodes.
#[allow(dead_code)]
pub async fn standard_context(sim: Arc<SimulatedInventory>) -> CheckContext {
    make_context(sim, snapshot(default_nodes()), &test_config(), Cancellation::new()).await
}

#[allow(dead_code)]
pub fn make_storage_class(name: &str, provisioner: &str, datastore: Option<&str>) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        parameters: datastore.map(|ds| BTreeMap::from([("datastore".to_string(), ds.to_string())])),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn make_vsphere_pv(name: &str, volume_path: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            vsphere_volume: Some(VsphereVirtualDiskVolumeSource {
                volume_path: volume_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
