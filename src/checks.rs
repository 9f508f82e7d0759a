use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde::Serialize;

use crate::config::CheckerConfig;
use crate::context::CheckContext;
use crate::error::{CheckError, ErrorKind};
use crate::identity::InfrastructureObjectRef;
use crate::infra::{Property, PropertyBag};

/* ============================= OUTCOMES ============================= */

/// Result of one check against one node (or the cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CheckOutcome {
    /// The assertion held.
    Pass,
    /// The assertion did not hold; the infrastructure is misconfigured.
    Fail { reason: String },
    /// The check did not apply or was not started.
    Skip { reason: String },
    /// The check could not run.
    Error { kind: ErrorKind, cause: String },
}

impl CheckOutcome {
    pub fn fail(reason: impl Into<String>) -> Self {
        CheckOutcome::Fail {
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        CheckOutcome::Skip {
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::skip("cancelled")
    }

    /// Cancellation becomes `Skip(cancelled)`; every other error is recorded
    /// as `Error` with its kind.
    pub fn from_error(error: &CheckError) -> Self {
        match error {
            CheckError::Cancelled => Self::cancelled(),
            other => CheckOutcome::Error {
                kind: other.kind(),
                cause: other.to_string(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckOutcome::Pass => "pass",
            CheckOutcome::Fail { .. } => "fail",
            CheckOutcome::Skip { .. } => "skip",
            CheckOutcome::Error { .. } => "error",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            CheckOutcome::Pass => "",
            CheckOutcome::Fail { reason } | CheckOutcome::Skip { reason } => reason,
            CheckOutcome::Error { cause, .. } => cause,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Pass)
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Pass => write!(f, "PASS"),
            CheckOutcome::Fail { reason } => write!(f, "FAIL ({reason})"),
            CheckOutcome::Skip { reason } => write!(f, "SKIP ({reason})"),
            CheckOutcome::Error { kind, cause } => write!(f, "ERROR [{kind}] ({cause})"),
        }
    }
}

/* ============================= CONTRACTS ============================= */

/// A node's VM with the properties every selected check declared.
#[derive(Debug, Clone)]
pub struct ResolvedVm {
    pub reference: InfrastructureObjectRef,
    pub properties: PropertyBag,
}

/// A check evaluated once per node against its resolved VM.
#[async_trait]
pub trait NodeCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// VM properties the executor must fetch before running this check.
    fn required_properties(&self) -> &'static [Property];

    async fn run(
        &self,
        ctx: &CheckContext,
        node: &Node,
        vm: &ResolvedVm,
    ) -> Result<CheckOutcome, CheckError>;
}

/// A check evaluated once per run against cluster-wide configuration.
#[async_trait]
pub trait ClusterCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError>;
}

/* ============================= VERSIONS ============================= */

/// Parse `6.7.3` into `[6, 7, 3]`.
pub fn parse_dotted_version(version: &str) -> Option<Vec<u32>> {
    let version = version.trim();
    if version.is_empty() {
        return None;
    }
    version.split('.').map(|p| p.parse::<u32>().ok()).collect()
}

/// Compare dotted versions, padding the shorter one with zeros.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = parse_dotted_version(a)?;
    let b = parse_dotted_version(b)?;
    let len = a.len().max(b.len());
    let at = |v: &[u32], i: usize| v.get(i).copied().unwrap_or(0);
    Some(
        (0..len)
            .map(|i| at(&a, i).cmp(&at(&b, i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
    )
}

/// Parse a VM hardware version such as `vmx-13`.
pub fn parse_hardware_version(version: &str) -> Option<u32> {
    version.trim().strip_prefix("vmx-")?.parse().ok()
}

/* ============================= NODE CHECKS ============================= */

pub const HARDWARE_VERSION: &str = "hardware-version";
pub const HOST_VERSION: &str = "host-version";
pub const DISK_UUID: &str = "disk-uuid";
pub const DEFAULT_DATASTORE: &str = "default-datastore";
pub const STORAGE_CLASS_DATASTORES: &str = "storage-class-datastores";
pub const PV_DATASTORES: &str = "pv-datastores";
pub const PERMISSIONS: &str = "permissions";

/// VM hardware version must be at least `minimum`.
pub struct HardwareVersionCheck {
    pub minimum: u32,
}

#[async_trait]
impl NodeCheck for HardwareVersionCheck {
    fn name(&self) -> &'static str {
        HARDWARE_VERSION
    }

    fn required_properties(&self) -> &'static [Property] {
        &[Property::ConfigVersion]
    }

    async fn run(
        &self,
        _ctx: &CheckContext,
        _node: &Node,
        vm: &ResolvedVm,
    ) -> Result<CheckOutcome, CheckError> {
        let Some(raw) = vm.properties.text(Property::ConfigVersion) else {
            return Ok(CheckOutcome::fail("VM reports no hardware version"));
        };
        Ok(match parse_hardware_version(raw) {
            Some(v) if v >= self.minimum => CheckOutcome::Pass,
            Some(_) => CheckOutcome::fail(format!(
                "hardware version {raw} is older than vmx-{}",
                self.minimum
            )),
            None => CheckOutcome::fail(format!("unrecognized hardware version {raw:?}")),
        })
    }
}

/// The ESXi host running the VM must be at least `minimum`.
pub struct HostVersionCheck {
    pub minimum: String,
}

#[async_trait]
impl NodeCheck for HostVersionCheck {
    fn name(&self) -> &'static str {
        HOST_VERSION
    }

    fn required_properties(&self) -> &'static [Property] {
        &[Property::RuntimeHost]
    }

    async fn run(
        &self,
        ctx: &CheckContext,
        _node: &Node,
        vm: &ResolvedVm,
    ) -> Result<CheckOutcome, CheckError> {
        let Some(host) = vm.properties.reference(Property::RuntimeHost) else {
            return Ok(CheckOutcome::skip("VM is not assigned to a host"));
        };

        let host_props = ctx.host_properties(host).await?;
        let host_name = host_props.text(Property::Name).unwrap_or(&host.value);
        let Some(version) = host_props.text(Property::ProductVersion) else {
            return Ok(CheckOutcome::fail(format!(
                "host {host_name} reports no product version"
            )));
        };

        Ok(match compare_versions(version, &self.minimum) {
            Some(Ordering::Less) => CheckOutcome::fail(format!(
                "host {host_name} runs ESXi {version}, minimum is {}",
                self.minimum
            )),
            Some(_) => CheckOutcome::Pass,
            None => CheckOutcome::fail(format!(
                "host {host_name} reports unrecognized version {version:?}"
            )),
        })
    }
}

/// `disk.enableUUID` must be enabled so the guest sees stable disk IDs.
pub struct DiskUuidCheck;

#[async_trait]
impl NodeCheck for DiskUuidCheck {
    fn name(&self) -> &'static str {
        DISK_UUID
    }

    fn required_properties(&self) -> &'static [Property] {
        &[Property::ConfigExtraConfig]
    }

    async fn run(
        &self,
        _ctx: &CheckContext,
        _node: &Node,
        vm: &ResolvedVm,
    ) -> Result<CheckOutcome, CheckError> {
        Ok(
            match vm
                .properties
                .option(Property::ConfigExtraConfig, "disk.enableUUID")
            {
                Some(v) if v.eq_ignore_ascii_case("true") => CheckOutcome::Pass,
                Some(v) => CheckOutcome::fail(format!("disk.enableUUID is {v:?}")),
                None => CheckOutcome::fail("disk.enableUUID is not set"),
            },
        )
    }
}

/* ============================= CLUSTER CHECKS ============================= */

/// Longest datastore path the platform accepts for a volume file.
pub const MAX_VOLUME_PATH_LEN: usize = 255;

const VSPHERE_PROVISIONERS: &[&str] = &["kubernetes.io/vsphere-volume", "csi.vsphere.vmware.com"];

/// Length of the path a dynamically provisioned volume gets on `datastore`.
pub fn dynamic_volume_path_len(datastore: &str, infrastructure_name: &str) -> usize {
    // [<datastore>] kubevols/<infra>-dynamic-pvc-<uuid>.vmdk
    let uuid_len = 36;
    format!("[{datastore}] kubevols/{infrastructure_name}-dynamic-pvc-").len() + uuid_len + ".vmdk".len()
}

/// Datastore name from an in-tree volume path such as `[LocalDS_0] kubevols/disk.vmdk`.
pub fn datastore_from_volume_path(path: &str) -> Option<&str> {
    let rest = path.trim().strip_prefix('[')?;
    let (name, _) = rest.split_once(']')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

fn cluster_state_error(e: anyhow::Error) -> CheckError {
    CheckError::ClusterStateUnavailable(format!("{e:#}"))
}

async fn datastore_exists(ctx: &CheckContext, name: &str) -> Result<bool, CheckError> {
    let path = ctx.metadata().datastore_path(name);
    Ok(!ctx.find_by_path(&path).await?.is_empty())
}

/// The configured default datastore must exist, be accessible and leave room
/// for generated volume paths.
pub struct DefaultDatastoreCheck;

#[async_trait]
impl ClusterCheck for DefaultDatastoreCheck {
    fn name(&self) -> &'static str {
        DEFAULT_DATASTORE
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let Some(datastore) = ctx.metadata().default_datastore() else {
            return Ok(CheckOutcome::skip("no default datastore configured"));
        };

        let len = dynamic_volume_path_len(datastore, ctx.metadata().infrastructure_name());
        if len > MAX_VOLUME_PATH_LEN {
            return Ok(CheckOutcome::fail(format!(
                "datastore name {datastore} yields volume paths of {len} characters, limit is {MAX_VOLUME_PATH_LEN}"
            )));
        }

        let path = ctx.metadata().datastore_path(datastore);
        let found = ctx.find_by_path(&path).await?;
        let Some(object) = found.first() else {
            return Ok(CheckOutcome::fail(format!(
                "default datastore {datastore} not found at {path}"
            )));
        };

        let props = ctx
            .fetch_properties(object, &[Property::DatastoreAccessible])
            .await?;
        if props.flag(Property::DatastoreAccessible) == Some(false) {
            return Ok(CheckOutcome::fail(format!(
                "default datastore {datastore} is not accessible"
            )));
        }
        Ok(CheckOutcome::Pass)
    }
}

/// vSphere storage classes must name datastores that exist.
pub struct StorageClassDatastoreCheck;

#[async_trait]
impl ClusterCheck for StorageClassDatastoreCheck {
    fn name(&self) -> &'static str {
        STORAGE_CLASS_DATASTORES
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let classes = ctx
            .cluster()
            .list_storage_classes()
            .await
            .map_err(cluster_state_error)?;

        let mut known: BTreeMap<String, bool> = BTreeMap::new();
        let mut missing = Vec::new();

        for sc in &classes {
            if !VSPHERE_PROVISIONERS.contains(&sc.provisioner.as_str()) {
                continue;
            }
            let Some(datastore) = sc.parameters.as_ref().and_then(|p| {
                p.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("datastore"))
                    .map(|(_, v)| v.clone())
            }) else {
                continue;
            };

            let exists = match known.get(&datastore) {
                Some(e) => *e,
                None => {
                    let e = datastore_exists(ctx, &datastore).await?;
                    known.insert(datastore.clone(), e);
                    e
                }
            };
            if !exists {
                let sc_name = sc.metadata.name.as_deref().unwrap_or("<unnamed>");
                missing.push(format!("{sc_name} -> {datastore}"));
            }
        }

        if missing.is_empty() {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::fail(format!(
                "storage classes reference unknown datastores: {}",
                missing.join(", ")
            )))
        }
    }
}

/// In-tree vSphere persistent volumes must live on datastores that exist.
pub struct PvDatastoreCheck;

#[async_trait]
impl ClusterCheck for PvDatastoreCheck {
    fn name(&self) -> &'static str {
        PV_DATASTORES
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let pvs = ctx.cluster().list_pvs().await.map_err(cluster_state_error)?;

        let mut known: BTreeMap<String, bool> = BTreeMap::new();
        let mut problems = Vec::new();

        for pv in &pvs {
            let Some(source) = pv.spec.as_ref().and_then(|s| s.vsphere_volume.as_ref()) else {
                continue;
            };
            let pv_name = pv.metadata.name.as_deref().unwrap_or("<unnamed>");
            let Some(datastore) = datastore_from_volume_path(&source.volume_path) else {
                problems.push(format!("{pv_name} has malformed volume path {:?}", source.volume_path));
                continue;
            };

            let exists = match known.get(datastore) {
                Some(e) => *e,
                None => {
                    let e = datastore_exists(ctx, datastore).await?;
                    known.insert(datastore.to_string(), e);
                    e
                }
            };
            if !exists {
                problems.push(format!("{pv_name} -> {datastore}"));
            }
        }

        if problems.is_empty() {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::fail(format!(
                "persistent volumes on unknown datastores: {}",
                problems.join(", ")
            )))
        }
    }
}

/// Privileges the checker account needs on the datacenter.
pub const DATACENTER_PRIVILEGES: &[&str] = &["System.Read", "System.View"];

/// Privileges needed on the VM folder to attach and detach volumes.
pub const FOLDER_PRIVILEGES: &[&str] = &[
    "System.Read",
    "System.View",
    "VirtualMachine.Config.AddExistingDisk",
    "VirtualMachine.Config.AddRemoveDevice",
    "VirtualMachine.Config.RemoveDisk",
];

/// Privileges needed on the default datastore to provision volumes.
pub const DATASTORE_PRIVILEGES: &[&str] = &[
    "Datastore.AllocateSpace",
    "Datastore.Browse",
    "Datastore.FileManagement",
];

/// The configured account must hold the privileges volume provisioning needs
/// on the datacenter, the VM folder and the default datastore.
pub struct PermissionsCheck;

#[async_trait]
impl ClusterCheck for PermissionsCheck {
    fn name(&self) -> &'static str {
        PERMISSIONS
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let md = ctx.metadata();
        let Some(user) = md.user() else {
            return Ok(CheckOutcome::skip("no user configured"));
        };

        let mut targets = vec![
            ("datacenter", md.datacenter_path(), DATACENTER_PRIVILEGES),
            ("folder", md.vm_folder().to_string(), FOLDER_PRIVILEGES),
        ];
        if let Some(datastore) = md.default_datastore() {
            targets.push(("datastore", md.datastore_path(datastore), DATASTORE_PRIVILEGES));
        }

        let mut problems = Vec::new();
        for (what, path, required) in targets {
            let found = ctx.find_by_path(&path).await?;
            let Some(entity) = found.first() else {
                problems.push(format!("{what} {path} not found"));
                continue;
            };
            let granted = ctx.user_privileges(entity, user).await?;
            let missing: Vec<&str> = required
                .iter()
                .copied()
                .filter(|p| !granted.iter().any(|g| g.as_str() == *p))
                .collect();
            if !missing.is_empty() {
                problems.push(format!("{what} {path} lacks {}", missing.join(", ")));
            }
        }

        if problems.is_empty() {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::fail(format!(
                "user {user} is missing privileges: {}",
                problems.join("; ")
            )))
        }
    }
}

/* ============================= REGISTRY ============================= */

/// The ordered set of checks one run executes.
#[derive(Clone, Default)]
pub struct CheckSet {
    pub node: Vec<Arc<dyn NodeCheck>>,
    pub cluster: Vec<Arc<dyn ClusterCheck>>,
}

impl std::fmt::Debug for CheckSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckSet")
            .field("node", &self.node.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("cluster", &self.cluster.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl CheckSet {
    /// Built-in checks in declared order, minus those disabled in config.
    pub fn from_config(config: &CheckerConfig) -> Self {
        let node: Vec<Arc<dyn NodeCheck>> = vec![
            Arc::new(HardwareVersionCheck {
                minimum: config.checks.min_hardware_version,
            }),
            Arc::new(HostVersionCheck {
                minimum: config.checks.min_host_version.clone(),
            }),
            Arc::new(DiskUuidCheck),
        ];
        let cluster: Vec<Arc<dyn ClusterCheck>> = vec![
            Arc::new(DefaultDatastoreCheck),
            Arc::new(StorageClassDatastoreCheck),
            Arc::new(PvDatastoreCheck),
            Arc::new(PermissionsCheck),
        ];

        Self {
            node: node
                .into_iter()
                .filter(|c| config.is_check_enabled(c.name()))
                .collect(),
            cluster: cluster
                .into_iter()
                .filter(|c| config.is_check_enabled(c.name()))
                .collect(),
        }
    }

    /// Keep only the named checks. Unknown names are an error.
    pub fn only(self, names: &[String]) -> anyhow::Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        let available = self.names();
        if let Some(unknown) = names.iter().find(|n| !available.contains(&n.as_str())) {
            anyhow::bail!(
                "Unknown check '{}'. Available: {}",
                unknown,
                available.join(", ")
            );
        }
        let wanted = |name: &str| names.iter().any(|n| n == name);
        Ok(Self {
            node: self.node.into_iter().filter(|c| wanted(c.name())).collect(),
            cluster: self.cluster.into_iter().filter(|c| wanted(c.name())).collect(),
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.node
            .iter()
            .map(|c| c.name())
            .chain(self.cluster.iter().map(|c| c.name()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_empty() && self.cluster.is_empty()
    }
}

/* ============================= TESTS ============================= */
