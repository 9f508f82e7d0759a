use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ListParams;
use kube::{Api, Client};
use serde::Deserialize;

use crate::crd::{INFRASTRUCTURE_NAME, Infrastructure};

/* ============================= ACCESSOR ============================= */

/// Read-only view of cluster state. Every call returns a fresh snapshot.
#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn get_infrastructure(&self) -> Result<Infrastructure>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>>;
}

/* ============================= LIVE CLUSTER ============================= */

/// Accessor backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn get_infrastructure(&self) -> Result<Infrastructure> {
        let api: Api<Infrastructure> = Api::all(self.client.clone());
        api.get(INFRASTRUCTURE_NAME)
            .await
            .context("Failed to read Infrastructure 'cluster'. Check RBAC permissions.")
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes. Check RBAC permissions.")?;
        Ok(list.items)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list storage classes. Check RBAC permissions.")?;
        Ok(list.items)
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list persistent volumes. Check RBAC permissions.")?;
        Ok(list.items)
    }
}

/* ============================= STATIC SNAPSHOT ============================= */

/// Fixed cluster snapshot, built in code or loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticClusterState {
    pub infrastructure: Option<Infrastructure>,
    pub nodes: Vec<Node>,
    pub storage_classes: Vec<StorageClass>,
    pub persistent_volumes: Vec<PersistentVolume>,
}

impl StaticClusterState {
    pub fn new(infrastructure: Infrastructure, nodes: Vec<Node>) -> Self {
        Self {
            infrastructure: Some(infrastructure),
            nodes,
            ..Default::default()
        }
    }

    pub fn with_storage_classes(mut self, storage_classes: Vec<StorageClass>) -> Self {
        self.storage_classes = storage_classes;
        self
    }

    pub fn with_pvs(mut self, pvs: Vec<PersistentVolume>) -> Self {
        self.persistent_volumes = pvs;
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse cluster snapshot")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster snapshot {}", path.display()))?;
        Self::from_yaml(&raw)
    }
}

#[async_trait]
impl ClusterState for StaticClusterState {
    async fn get_infrastructure(&self) -> Result<Infrastructure> {
        self.infrastructure
            .clone()
            .context("Infrastructure 'cluster' not present in snapshot")
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.storage_classes.clone())
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.persistent_volumes.clone())
    }
}

/* ============================= NODE HELPERS ============================= */

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn provider_id(node: &Node) -> Option<&str> {
    node.spec.as_ref().and_then(|s| s.provider_id.as_deref())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"
infrastructure:
  apiVersion: config.openshift.io/v1
  kind: Infrastructure
  metadata:
    name: cluster
  spec: {}
  status:
    infrastructureName: my-cluster-id
    platform: VSphere
nodes:
  - apiVersion: v1
    kind: Node
    metadata:
      name: DC0_H0_VM0
    spec:
      providerID: vsphere://265104de-1472-547c-b873-6dc7883fb6cb
  - apiVersion: v1
    kind: Node
    metadata:
      name: no-provider
storageClasses:
  - apiVersion: storage.k8s.io/v1
    kind: StorageClass
    metadata:
      name: thin
    provisioner: kubernetes.io/vsphere-volume
    parameters:
      datastore: LocalDS_0
"#;

    #[tokio::test]
    async fn test_snapshot_from_yaml() {
        let state = StaticClusterState::from_yaml(SNAPSHOT).expect("snapshot should parse");

        let infra = state.get_infrastructure().await.unwrap();
        assert_eq!(infra.infrastructure_name(), Some("my-cluster-id"));

        let nodes = state.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(node_name(&nodes[0]), "DC0_H0_VM0");
        assert_eq!(
            provider_id(&nodes[0]),
            Some("vsphere://265104de-1472-547c-b873-6dc7883fb6cb")
        );
        assert_eq!(provider_id(&nodes[1]), None);

        let scs = state.list_storage_classes().await.unwrap();
        assert_eq!(scs[0].provisioner, "kubernetes.io/vsphere-volume");
        assert!(state.list_pvs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_infrastructure_is_error() {
        let state = StaticClusterState::default();
        let err = state.get_infrastructure().await.unwrap_err();
        assert!(err.to_string().contains("Infrastructure"));
    }
}
