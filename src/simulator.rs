//! In-memory virtualization inventory implementing [`InfraClient`].
//!
//! Each instance owns its own state; nothing is registered globally, so tests
//! and runs can hold as many independent inventories as they need. Besides
//! serving lookups, property fetches and reconfiguration tasks it offers
//! direct mutation (host versions), fault injection and call counters.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::checks;
use crate::infra::{
    ConfigSpec, InfraClient, InfraError, ObjectKind, ObjectRef, OptionValue, Property,
    PropertyBag, PropertyValue, TaskRef,
};

/* ============================= MODEL ============================= */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryModel {
    pub datacenters: Vec<DatacenterModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatacenterModel {
    pub name: String,
    pub hosts: Vec<HostModel>,
    pub datastores: Vec<DatastoreModel>,
    pub vms: Vec<VmModel>,
    pub permissions: Vec<PermissionModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostModel {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreModel {
    pub id: String,
    pub name: String,
    #[serde(default = "default_accessible")]
    pub accessible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmModel {
    pub id: String,
    pub name: String,
    pub uuid: String,
    /// Folder below `/<datacenter>/vm`; empty means the root VM folder.
    #[serde(default)]
    pub folder: String,
    /// Id of the host the VM runs on.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_hardware_version")]
    pub hardware_version: String,
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
}

/// Privileges granted to `user` on the object at `entity` (an inventory
/// path such as `/DC0/vm`), inherited by descendants when `propagate` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionModel {
    pub user: String,
    pub entity: String,
    pub privileges: Vec<String>,
    #[serde(default = "default_propagate")]
    pub propagate: bool,
}

fn default_propagate() -> bool {
    true
}

fn default_accessible() -> bool {
    true
}

fn default_hardware_version() -> String {
    "vmx-13".to_string()
}

impl InventoryModel {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse inventory model")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid inventory file {}", path.display()))
    }

    /// One datacenter `DC0` with host `DC0_H0`, datastore `LocalDS_0`, two
    /// VMs with stable UUIDs and user `testuser` holding every privilege the
    /// permission check asks for.
    pub fn standard() -> Self {
        let vm = |id: &str, name: &str, uuid: &str| VmModel {
            id: id.to_string(),
            name: name.to_string(),
            uuid: uuid.to_string(),
            folder: String::new(),
            host: "host-24".to_string(),
            hardware_version: default_hardware_version(),
            extra_config: BTreeMap::new(),
        };

        Self {
            datacenters: vec![DatacenterModel {
                name: "DC0".to_string(),
                hosts: vec![HostModel {
                    id: "host-24".to_string(),
                    name: "DC0_H0".to_string(),
                    version: "6.5.0".to_string(),
                    api_version: "6.5".to_string(),
                }],
                datastores: vec![DatastoreModel {
                    id: "datastore-61".to_string(),
                    name: "LocalDS_0".to_string(),
                    accessible: true,
                }],
                vms: vec![
                    vm("vm-57", "DC0_H0_VM0", "265104de-1472-547c-b873-6dc7883fb6cb"),
                    vm("vm-60", "DC0_H0_VM1", "12f8928d-f144-5c57-89db-dd2d0902c9fa"),
                ],
                permissions: vec![PermissionModel {
                    user: "testuser".to_string(),
                    entity: "/DC0".to_string(),
                    privileges: checks::DATACENTER_PRIVILEGES
                        .iter()
                        .chain(checks::FOLDER_PRIVILEGES)
                        .chain(checks::DATASTORE_PRIVILEGES)
                        .map(|p| p.to_string())
                        .collect(),
                    propagate: true,
                }],
            }],
        }
    }
}

/* ============================= STATE ============================= */

#[derive(Default)]
struct Inventory {
    paths: HashMap<String, Vec<ObjectRef>>,
    vms: HashMap<String, VmModel>,
    hosts: HashMap<String, HostModel>,
    datastores: HashMap<String, DatastoreModel>,
    entity_paths: HashMap<ObjectRef, String>,
    permissions: Vec<PermissionModel>,
    logged_out: bool,
}

impl Inventory {
    fn register(&mut self, path: &str, object: ObjectRef) {
        let path = normalize_path(path);
        self.entity_paths.insert(object.clone(), path.clone());
        self.paths.entry(path).or_default().push(object);
    }

    fn register_folder(&mut self, path: &str) {
        let path = normalize_path(path);
        if !self.paths.contains_key(&path) {
            self.register(&path, ObjectRef::new(ObjectKind::Folder, &path));
        }
    }
}

struct PendingTask {
    vm: String,
    spec: ConfigSpec,
}

#[derive(Default)]
struct TaskTable {
    next: u64,
    pending: HashMap<String, PendingTask>,
}

#[derive(Default)]
struct Faults {
    lookup_failures: u32,
    fetch_failures: u32,
    kind_fetch_failures: HashMap<ObjectKind, u32>,
    task_failure: Option<String>,
    task_delay: Duration,
    call_delay: Duration,
}

/// Decrements the in-flight counter when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimulatedInventory {
    inventory: RwLock<Inventory>,
    tasks: Mutex<TaskTable>,
    faults: Mutex<Faults>,
    lookups: AtomicUsize,
    fetches: AtomicUsize,
    reconfigures: AtomicUsize,
    logins: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    tasks_in_flight: AtomicUsize,
    peak_tasks_in_flight: AtomicUsize,
}

fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

impl SimulatedInventory {
    pub fn new(model: InventoryModel) -> Result<Self> {
        let mut inv = Inventory::default();

        for dc in &model.datacenters {
            if dc.name.is_empty() {
                anyhow::bail!("datacenter without a name in inventory model");
            }
            inv.register(&format!("/{}", dc.name), ObjectRef::new(ObjectKind::Datacenter, &dc.name));
            inv.register_folder(&format!("/{}/vm", dc.name));

            for host in &dc.hosts {
                inv.register(
                    &format!("/{}/host/{}", dc.name, host.name),
                    ObjectRef::new(ObjectKind::HostSystem, &host.id),
                );
                inv.hosts.insert(host.id.clone(), host.clone());
            }
            for ds in &dc.datastores {
                inv.register(
                    &format!("/{}/datastore/{}", dc.name, ds.name),
                    ObjectRef::new(ObjectKind::Datastore, &ds.id),
                );
                inv.datastores.insert(ds.id.clone(), ds.clone());
            }
            for vm in &dc.vms {
                if !vm.host.is_empty() && !dc.hosts.iter().any(|h| h.id == vm.host) {
                    anyhow::bail!(
                        "VM {} references unknown host {} in datacenter {}",
                        vm.name,
                        vm.host,
                        dc.name
                    );
                }
                if inv.vms.contains_key(&vm.id) {
                    anyhow::bail!("duplicate VM id {}", vm.id);
                }
                Uuid::parse_str(&vm.uuid)
                    .with_context(|| format!("VM {} has invalid uuid {:?}", vm.name, vm.uuid))?;

                let mut folder = format!("/{}/vm", dc.name);
                for segment in vm.folder.split('/').filter(|s| !s.is_empty()) {
                    folder = format!("{folder}/{segment}");
                    inv.register_folder(&folder);
                }
                inv.register(
                    &format!("{folder}/{}", vm.name),
                    ObjectRef::new(ObjectKind::VirtualMachine, &vm.id),
                );
                inv.vms.insert(vm.id.clone(), vm.clone());
            }
            for perm in &dc.permissions {
                inv.permissions.push(PermissionModel {
                    entity: normalize_path(&perm.entity),
                    ..perm.clone()
                });
            }
        }

        Ok(Self {
            inventory: RwLock::new(inv),
            tasks: Mutex::new(TaskTable::default()),
            faults: Mutex::new(Faults::default()),
            lookups: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            reconfigures: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            tasks_in_flight: AtomicUsize::new(0),
            peak_tasks_in_flight: AtomicUsize::new(0),
        })
    }

    /// Inventory built from [`InventoryModel::standard`].
    pub fn standard() -> Self {
        match Self::new(InventoryModel::standard()) {
            Ok(sim) => sim,
            Err(e) => unreachable!("standard inventory model is consistent: {e}"),
        }
    }

    /* ---------- mutation ---------- */

    pub async fn set_host_version(
        &self,
        host_id: &str,
        version: &str,
        api_version: &str,
    ) -> Result<(), InfraError> {
        let mut inv = self.inventory.write().await;
        let host = inv
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| InfraError::NotFound(format!("HostSystem:{host_id}")))?;
        host.version = version.to_string();
        host.api_version = api_version.to_string();
        Ok(())
    }

    pub async fn set_datastore_accessible(
        &self,
        datastore_id: &str,
        accessible: bool,
    ) -> Result<(), InfraError> {
        let mut inv = self.inventory.write().await;
        let ds = inv
            .datastores
            .get_mut(datastore_id)
            .ok_or_else(|| InfraError::NotFound(format!("Datastore:{datastore_id}")))?;
        ds.accessible = accessible;
        Ok(())
    }

    /* ---------- fault injection ---------- */

    /// The next `n` path lookups fail with a transient error.
    pub async fn inject_lookup_failures(&self, n: u32) {
        self.faults.lock().await.lookup_failures = n;
    }

    /// The next `n` property fetches fail with a transient error.
    pub async fn inject_fetch_failures(&self, n: u32) {
        self.faults.lock().await.fetch_failures = n;
    }

    /// The next `n` property fetches on objects of `kind` fail with a
    /// transient error.
    pub async fn inject_fetch_failures_on(&self, kind: ObjectKind, n: u32) {
        self.faults.lock().await.kind_fetch_failures.insert(kind, n);
    }

    /// Make every reconfiguration task fail with `reason` until cleared.
    pub async fn fail_tasks(&self, reason: Option<&str>) {
        self.faults.lock().await.task_failure = reason.map(str::to_string);
    }

    /// Latency of every reconfiguration task.
    pub async fn set_task_delay(&self, delay: Duration) {
        self.faults.lock().await.task_delay = delay;
    }

    /// Latency of every path lookup and property fetch.
    pub async fn set_call_delay(&self, delay: Duration) {
        self.faults.lock().await.call_delay = delay;
    }

    /* ---------- introspection ---------- */

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reconfigure_count(&self) -> usize {
        self.reconfigures.load(Ordering::SeqCst)
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Most lookups and fetches observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Most reconfiguration tasks observed running at the same time.
    pub fn peak_tasks_in_flight(&self) -> usize {
        self.peak_tasks_in_flight.load(Ordering::SeqCst)
    }

    pub async fn is_logged_out(&self) -> bool {
        self.inventory.read().await.logged_out
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = self.faults.lock().await.call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    async fn ensure_session(&self) -> Result<(), InfraError> {
        if self.inventory.read().await.logged_out {
            return Err(InfraError::SessionClosed);
        }
        Ok(())
    }
}

fn vm_property(vm: &VmModel, property: Property) -> Option<PropertyValue> {
    match property {
        Property::Name => Some(PropertyValue::Text(vm.name.clone())),
        Property::ConfigUuid => Some(PropertyValue::Text(vm.uuid.clone())),
        Property::ConfigVersion => Some(PropertyValue::Text(vm.hardware_version.clone())),
        Property::ConfigExtraConfig => Some(PropertyValue::Options(
            vm.extra_config
                .iter()
                .map(|(k, v)| OptionValue::new(k, v))
                .collect(),
        )),
        Property::RuntimeHost if !vm.host.is_empty() => Some(PropertyValue::Reference(
            ObjectRef::new(ObjectKind::HostSystem, &vm.host),
        )),
        _ => None,
    }
}

fn host_property(host: &HostModel, property: Property) -> Option<PropertyValue> {
    match property {
        Property::Name => Some(PropertyValue::Text(host.name.clone())),
        Property::ProductVersion => Some(PropertyValue::Text(host.version.clone())),
        Property::ProductApiVersion => Some(PropertyValue::Text(host.api_version.clone())),
        _ => None,
    }
}

fn datastore_property(ds: &DatastoreModel, property: Property) -> Option<PropertyValue> {
    match property {
        Property::Name => Some(PropertyValue::Text(ds.name.clone())),
        Property::DatastoreAccessible => Some(PropertyValue::Flag(ds.accessible)),
        _ => None,
    }
}

/* ============================= CLIENT ============================= */

#[async_trait]
impl InfraClient for SimulatedInventory {
    async fn find_by_path(&self, path: &str) -> Result<Vec<ObjectRef>, InfraError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter().await;
        self.ensure_session().await?;
        {
            let mut faults = self.faults.lock().await;
            if faults.lookup_failures > 0 {
                faults.lookup_failures -= 1;
                return Err(InfraError::Transient(format!("lookup of {path} interrupted")));
            }
        }

        let inv = self.inventory.read().await;
        let found = inv
            .paths
            .get(&normalize_path(path))
            .cloned()
            .unwrap_or_default();
        debug!(path, matches = found.len(), "simulator_find_by_path");
        Ok(found)
    }

    async fn retrieve_properties(
        &self,
        object: &ObjectRef,
        properties: &[Property],
    ) -> Result<PropertyBag, InfraError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter().await;
        self.ensure_session().await?;
        {
            let mut faults = self.faults.lock().await;
            let remaining = faults.kind_fetch_failures.get_mut(&object.kind);
            let kind_failure = match remaining {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            if kind_failure || faults.fetch_failures > 0 {
                if !kind_failure {
                    faults.fetch_failures -= 1;
                }
                return Err(InfraError::Transient(format!(
                    "property collector for {object} interrupted"
                )));
            }
        }

        let inv = self.inventory.read().await;
        let exists = match object.kind {
            ObjectKind::VirtualMachine => inv.vms.contains_key(&object.value),
            ObjectKind::HostSystem => inv.hosts.contains_key(&object.value),
            ObjectKind::Datastore => inv.datastores.contains_key(&object.value),
            ObjectKind::Datacenter | ObjectKind::Folder => {
                inv.entity_paths.contains_key(object)
            }
        };
        if !exists {
            return Err(InfraError::NotFound(object.to_string()));
        }

        let mut bag = PropertyBag::new();
        for &property in properties {
            let value = match object.kind {
                ObjectKind::VirtualMachine => inv
                    .vms
                    .get(&object.value)
                    .and_then(|vm| vm_property(vm, property)),
                ObjectKind::HostSystem => inv
                    .hosts
                    .get(&object.value)
                    .and_then(|host| host_property(host, property)),
                ObjectKind::Datastore => inv
                    .datastores
                    .get(&object.value)
                    .and_then(|ds| datastore_property(ds, property)),
                ObjectKind::Datacenter | ObjectKind::Folder => match property {
                    Property::Name => inv.entity_paths.get(object).map(|path| {
                        let name = path.rsplit('/').next().unwrap_or_default();
                        PropertyValue::Text(name.to_string())
                    }),
                    _ => None,
                },
            };
            if let Some(value) = value {
                bag.insert(property, value);
            }
        }
        Ok(bag)
    }

    async fn reconfigure(
        &self,
        object: &ObjectRef,
        spec: &ConfigSpec,
    ) -> Result<TaskRef, InfraError> {
        self.reconfigures.fetch_add(1, Ordering::SeqCst);
        self.ensure_session().await?;
        if object.kind != ObjectKind::VirtualMachine {
            return Err(InfraError::Remote(format!(
                "{object} is not a virtual machine"
            )));
        }
        if !self.inventory.read().await.vms.contains_key(&object.value) {
            return Err(InfraError::NotFound(object.to_string()));
        }

        let mut tasks = self.tasks.lock().await;
        tasks.next += 1;
        let id = format!("task-{}", tasks.next);
        tasks.pending.insert(
            id.clone(),
            PendingTask {
                vm: object.value.clone(),
                spec: spec.clone(),
            },
        );
        Ok(TaskRef(id))
    }

    async fn wait_for_task(&self, task: &TaskRef) -> Result<(), InfraError> {
        self.ensure_session().await?;
        let pending = self
            .tasks
            .lock()
            .await
            .pending
            .remove(&task.0)
            .ok_or_else(|| InfraError::NotFound(format!("Task:{task}")))?;

        let running = self.tasks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_tasks_in_flight.fetch_max(running, Ordering::SeqCst);
        let _task = InFlight(&self.tasks_in_flight);

        let (delay, failure) = {
            let faults = self.faults.lock().await;
            (faults.task_delay, faults.task_failure.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(InfraError::TaskFailed(reason));
        }

        let mut inv = self.inventory.write().await;
        let vm = inv
            .vms
            .get_mut(&pending.vm)
            .ok_or_else(|| InfraError::NotFound(format!("VirtualMachine:{}", pending.vm)))?;
        if let Some(version) = &pending.spec.version {
            vm.hardware_version = version.clone();
        }
        for opt in &pending.spec.extra_config {
            // an empty value removes the key
            if opt.value.is_empty() {
                vm.extra_config.remove(&opt.key);
            } else {
                vm.extra_config.insert(opt.key.clone(), opt.value.clone());
            }
        }
        debug!(task = %task, vm = %pending.vm, "simulator_task_completed");
        Ok(())
    }

    async fn user_privileges(
        &self,
        entity: &ObjectRef,
        user: &str,
    ) -> Result<Vec<String>, InfraError> {
        let _call = self.enter().await;
        self.ensure_session().await?;

        let inv = self.inventory.read().await;
        let path = inv
            .entity_paths
            .get(entity)
            .ok_or_else(|| InfraError::NotFound(entity.to_string()))?;

        let granted: BTreeSet<&str> = inv
            .permissions
            .iter()
            .filter(|perm| perm.user == user)
            .filter(|perm| {
                perm.entity == *path
                    || (perm.propagate
                        && (perm.entity == "/"
                            || path.starts_with(&format!("{}/", perm.entity))))
            })
            .flat_map(|perm| perm.privileges.iter().map(String::as_str))
            .collect();
        debug!(entity = %entity, user, privileges = granted.len(), "simulator_user_privileges");
        Ok(granted.into_iter().map(str::to_string).collect())
    }

    async fn login(&self) -> Result<(), InfraError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.inventory.write().await.logged_out = false;
        Ok(())
    }

    async fn logout(&self) -> Result<(), InfraError> {
        let mut inv = self.inventory.write().await;
        if inv.logged_out {
            return Err(InfraError::SessionClosed);
        }
        inv.logged_out = true;
        Ok(())
    }
}

/* ============================= TESTS ============================= */
