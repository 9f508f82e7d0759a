use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, OnceCell, watch};
use tracing::{debug, info, warn};

use crate::cluster::ClusterState;
use crate::config::{CheckerConfig, Workspace};
use crate::crd::Infrastructure;
use crate::error::CheckError;
use crate::executor::RetryPolicy;
use crate::infra::{ConfigSpec, InfraClient, InfraError, ObjectRef, Property, PropertyBag};

/* ============================= CLUSTER METADATA ============================= */

/// Per-run snapshot of where the cluster lives in the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMetadata {
    infrastructure_name: String,
    datacenter: String,
    vm_folder: String,
    default_datastore: Option<String>,
    user: Option<String>,
}

impl ClusterMetadata {
    pub fn new(infrastructure: &Infrastructure, workspace: &Workspace) -> Result<Self> {
        let infrastructure_name = infrastructure
            .infrastructure_name()
            .ok_or_else(|| anyhow::anyhow!("Infrastructure status has no infrastructureName"))?
            .to_string();

        let datacenter = workspace.datacenter.trim_matches('/').to_string();
        if datacenter.is_empty() {
            anyhow::bail!("workspace.datacenter must be set");
        }

        let vm_folder = match workspace.folder.as_deref().map(str::trim) {
            Some(f) if f.starts_with('/') => f.trim_end_matches('/').to_string(),
            Some(f) if !f.is_empty() => {
                format!("/{}/vm/{}", datacenter, f.trim_end_matches('/'))
            }
            _ => format!("/{}/vm/{}", datacenter, infrastructure_name),
        };

        Ok(Self {
            infrastructure_name,
            datacenter,
            vm_folder,
            default_datastore: workspace
                .default_datastore
                .clone()
                .filter(|d| !d.is_empty()),
            user: workspace.user.clone().filter(|u| !u.trim().is_empty()),
        })
    }

    pub fn infrastructure_name(&self) -> &str {
        &self.infrastructure_name
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn vm_folder(&self) -> &str {
        &self.vm_folder
    }

    pub fn default_datastore(&self) -> Option<&str> {
        self.default_datastore.as_deref()
    }

    /// Account the infrastructure session belongs to, when configured.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn datacenter_path(&self) -> String {
        format!("/{}", self.datacenter)
    }

    /// Expected inventory path of the VM backing `node_name`.
    pub fn vm_path(&self, node_name: &str) -> String {
        format!("{}/{}", self.vm_folder, node_name)
    }

    pub fn datastore_path(&self, datastore: &str) -> String {
        format!("/{}/datastore/{}", self.datacenter, datastore)
    }
}

/* ============================= CANCELLATION ============================= */

/// Run-scoped cancellation signal. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/* ============================= CONTEXT ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Ready,
    Closed,
}

const HOST_PROPERTIES: &[Property] = &[
    Property::Name,
    Property::ProductVersion,
    Property::ProductApiVersion,
];

/// Everything a check may touch during one run: the cluster-state accessor,
/// the infrastructure client, cluster metadata and the cancellation scope.
///
/// Construction logs the infrastructure client in; [`CheckContext::close`]
/// logs it out. Remote calls made through the context are bounded by the
/// configured call timeout, abort when the run is cancelled and fail with
/// [`CheckError::ContextClosed`] once the context is closed.
pub struct CheckContext {
    cancellation: Cancellation,
    infra: Arc<dyn InfraClient>,
    cluster: Arc<dyn ClusterState>,
    metadata: ClusterMetadata,
    call_timeout: Duration,
    reconfigure_timeout: Duration,
    retry: RetryPolicy,
    closed: AtomicBool,
    host_cache: Mutex<HashMap<ObjectRef, Arc<OnceCell<PropertyBag>>>>,
    object_locks: Mutex<HashMap<ObjectRef, Arc<Mutex<()>>>>,
}

impl CheckContext {
    pub async fn new(
        cluster: Arc<dyn ClusterState>,
        infra: Arc<dyn InfraClient>,
        config: &CheckerConfig,
        cancellation: Cancellation,
    ) -> Result<Self> {
        let infrastructure = cluster.get_infrastructure().await?;
        let metadata = ClusterMetadata::new(&infrastructure, &config.workspace)?;
        infra
            .login()
            .await
            .context("Failed to establish infrastructure session")?;

        info!(
            infrastructure = metadata.infrastructure_name(),
            datacenter = metadata.datacenter(),
            vm_folder = metadata.vm_folder(),
            "check_context_ready"
        );

        Ok(Self {
            cancellation,
            infra,
            cluster,
            metadata,
            call_timeout: config.executor.call_timeout(),
            reconfigure_timeout: config.executor.reconfigure_timeout(),
            retry: RetryPolicy::from(&config.executor.retry),
            closed: AtomicBool::new(false),
            host_cache: Mutex::new(HashMap::new()),
            object_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub fn cluster(&self) -> &dyn ClusterState {
        self.cluster.as_ref()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn state(&self) -> ContextState {
        if self.closed.load(Ordering::SeqCst) {
            ContextState::Closed
        } else {
            ContextState::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    /// Fail fast when the context can no longer serve checks.
    pub fn ensure_ready(&self) -> Result<(), CheckError> {
        if self.is_closed() {
            return Err(CheckError::ContextClosed);
        }
        if self.is_cancelled() {
            return Err(CheckError::Cancelled);
        }
        Ok(())
    }

    /// Release the infrastructure session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.infra.logout().await {
            Ok(()) | Err(InfraError::SessionClosed) => {}
            Err(e) => warn!(error = %e, "infra_logout_failed"),
        }
        info!("check_context_closed");
    }

    /* ---------- remote primitives ---------- */

    async fn remote<T, F>(&self, op: &'static str, limit: Duration, call: F) -> Result<T, CheckError>
    where
        F: Future<Output = Result<T, InfraError>>,
    {
        self.ensure_ready()?;

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(CheckError::Cancelled),
            res = tokio::time::timeout(limit, call) => match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(InfraError::SessionClosed)) => {
                    // the session is gone; nothing else can run on it
                    self.closed.store(true, Ordering::SeqCst);
                    warn!(op, "infra_session_lost");
                    Err(CheckError::ContextClosed)
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(CheckError::TransientRemote(format!(
                    "{op} timed out after {limit:?}"
                ))),
            },
        }
    }

    /// Look up every object registered at an inventory path.
    pub async fn find_by_path(&self, path: &str) -> Result<Vec<ObjectRef>, CheckError> {
        debug!(path, "find_by_path");
        self.remote("find_by_path", self.call_timeout, self.infra.find_by_path(path))
            .await
    }

    /// Fetch exactly the declared properties of one object.
    pub async fn fetch_properties(
        &self,
        object: &ObjectRef,
        properties: &[Property],
    ) -> Result<PropertyBag, CheckError> {
        let mut wanted = properties.to_vec();
        wanted.sort();
        wanted.dedup();

        debug!(object = %object, properties = wanted.len(), "fetch_properties");
        self.remote(
            "retrieve_properties",
            self.call_timeout,
            self.infra.retrieve_properties(object, &wanted),
        )
        .await
    }

    /// Host properties (name and product versions), fetched once per host per
    /// run. Transient failures are retried; nodes on the same host share the
    /// fetch while different hosts are fetched concurrently.
    pub async fn host_properties(&self, host: &ObjectRef) -> Result<PropertyBag, CheckError> {
        let cell = self
            .host_cache
            .lock()
            .await
            .entry(host.clone())
            .or_default()
            .clone();

        cell.get_or_try_init(|| {
            self.retry.run(self, "fetch_host_properties", || {
                self.fetch_properties(host, HOST_PROPERTIES)
            })
        })
        .await
        .cloned()
    }

    /// Privileges `user` holds on `entity`, retried on transient failures.
    pub async fn user_privileges(
        &self,
        entity: &ObjectRef,
        user: &str,
    ) -> Result<Vec<String>, CheckError> {
        self.retry
            .run(self, "user_privileges", || {
                self.remote(
                    "user_privileges",
                    self.call_timeout,
                    self.infra.user_privileges(entity, user),
                )
            })
            .await
    }

    /// Forget cached host properties; called at the start of every run.
    pub async fn begin_run(&self) {
        self.host_cache.lock().await.clear();
    }

    /// Apply `spec` to `object` and wait for the resulting task.
    ///
    /// `timeout` bounds the task wait; `None` uses the configured default.
    /// Reconfigurations of the same object are serialized. Failures are
    /// never retried and surface as [`CheckError::ReconfigureFailed`].
    pub async fn reconfigure(
        &self,
        object: &ObjectRef,
        spec: &ConfigSpec,
        timeout: Option<Duration>,
    ) -> Result<(), CheckError> {
        let lock = self.object_lock(object).await;
        let _guard = lock.lock().await;

        let task = self
            .remote(
                "reconfigure",
                self.call_timeout,
                self.infra.reconfigure(object, spec),
            )
            .await
            .map_err(as_reconfigure_failure)?;

        let wait = timeout.unwrap_or(self.reconfigure_timeout);
        self.remote("wait_for_task", wait, self.infra.wait_for_task(&task))
            .await
            .map_err(as_reconfigure_failure)?;

        info!(object = %object, task = %task, "reconfigure_completed");
        Ok(())
    }

    async fn object_lock(&self, object: &ObjectRef) -> Arc<Mutex<()>> {
        self.object_locks
            .lock()
            .await
            .entry(object.clone())
            .or_default()
            .clone()
    }
}

fn as_reconfigure_failure(e: CheckError) -> CheckError {
    match e {
        CheckError::Cancelled
        | CheckError::ContextClosed
        | CheckError::ReconfigureFailed { .. } => e,
        other => CheckError::ReconfigureFailed {
            cause: other.to_string(),
        },
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticClusterState;
    use crate::crd::{InfrastructureSpec, InfrastructureStatus};
    use crate::config::RetryConfig;
    use crate::infra::{ObjectKind, OptionValue};
    use crate::simulator::{HostModel, InventoryModel, SimulatedInventory};

    fn infrastructure(name: &str) -> Infrastructure {
        let mut infra = Infrastructure::new("cluster", InfrastructureSpec::default());
        infra.status = Some(InfrastructureStatus {
            infrastructure_name: Some(name.to_string()),
            ..Default::default()
        });
        infra
    }

    fn workspace(folder: Option<&str>) -> Workspace {
        Workspace {
            datacenter: "DC0".to_string(),
            folder: folder.map(str::to_string),
            default_datastore: Some("LocalDS_0".to_string()),
            ..Default::default()
        }
    }

    fn config() -> CheckerConfig {
        let mut config = CheckerConfig {
            workspace: workspace(Some("/DC0/vm")),
            ..Default::default()
        };
        config.executor.retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_millis: 1,
            max_backoff_millis: 5,
        };
        config
    }

    async fn context(sim: Arc<SimulatedInventory>) -> CheckContext {
        let cluster = Arc::new(StaticClusterState::new(infrastructure("my-cluster-id"), vec![]));
        CheckContext::new(cluster, sim, &config(), Cancellation::new())
            .await
            .expect("context should build")
    }

    fn vm0() -> ObjectRef {
        ObjectRef::new(ObjectKind::VirtualMachine, "vm-57")
    }

    fn host(id: &str) -> ObjectRef {
        ObjectRef::new(ObjectKind::HostSystem, id)
    }

    fn hardware_spec(version: &str) -> ConfigSpec {
        ConfigSpec {
            version: Some(version.into()),
            ..Default::default()
        }
    }

    // ── ClusterMetadata ──

    #[test]
    fn test_folder_defaults_to_infrastructure_name() {
        let md = ClusterMetadata::new(&infrastructure("my-cluster-id"), &workspace(None)).unwrap();
        assert_eq!(md.vm_folder(), "/DC0/vm/my-cluster-id");
        assert_eq!(md.vm_path("worker-0"), "/DC0/vm/my-cluster-id/worker-0");
    }

    #[test]
    fn test_absolute_folder_used_verbatim() {
        let md =
            ClusterMetadata::new(&infrastructure("x"), &workspace(Some("/DC0/vm/"))).unwrap();
        assert_eq!(md.vm_path("DC0_H0_VM0"), "/DC0/vm/DC0_H0_VM0");
    }

    #[test]
    fn test_relative_folder_under_datacenter() {
        let md =
            ClusterMetadata::new(&infrastructure("x"), &workspace(Some("ocp/prod"))).unwrap();
        assert_eq!(md.vm_folder(), "/DC0/vm/ocp/prod");
    }

    #[test]
    fn test_datastore_path() {
        let md = ClusterMetadata::new(&infrastructure("x"), &workspace(None)).unwrap();
        assert_eq!(md.datastore_path("LocalDS_0"), "/DC0/datastore/LocalDS_0");
        assert_eq!(md.default_datastore(), Some("LocalDS_0"));
    }

    #[test]
    fn test_missing_infrastructure_name_rejected() {
        let infra = Infrastructure::new("cluster", InfrastructureSpec::default());
        assert!(ClusterMetadata::new(&infra, &workspace(None)).is_err());
    }

    // ── Cancellation ──

    #[tokio::test]
    async fn test_cancellation_shared_between_clones() {
        let c = Cancellation::new();
        let observer = c.clone();
        assert!(!observer.is_cancelled());
        c.cancel();
        assert!(observer.is_cancelled());
        // resolves immediately once cancelled
        observer.cancelled().await;
    }

    // ── CheckContext ──

    #[tokio::test]
    async fn test_context_starts_ready() {
        let ctx = context(Arc::new(SimulatedInventory::standard())).await;
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.metadata().infrastructure_name(), "my-cluster-id");
    }

    #[tokio::test]
    async fn test_new_context_reopens_session_after_close() {
        let sim = Arc::new(SimulatedInventory::standard());
        let first = context(sim.clone()).await;
        first.close().await;
        assert!(sim.is_logged_out().await);

        let second = context(sim.clone()).await;
        assert_eq!(sim.login_count(), 2);
        assert_eq!(second.find_by_path("/DC0/vm/DC0_H0_VM0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_context_construction_needs_infrastructure() {
        let cluster = Arc::new(StaticClusterState::default());
        let sim = Arc::new(SimulatedInventory::standard());
        let res = CheckContext::new(cluster, sim, &config(), Cancellation::new()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_close_logs_out_and_rejects_calls() {
        let sim = Arc::new(SimulatedInventory::standard());
        let ctx = context(sim.clone()).await;

        ctx.close().await;
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(sim.is_logged_out().await);

        let err = ctx.find_by_path("/DC0/vm/DC0_H0_VM0").await.unwrap_err();
        assert_eq!(err, CheckError::ContextClosed);

        // second close is a no-op
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_session_loss_closes_context() {
        let sim = Arc::new(SimulatedInventory::standard());
        let ctx = context(sim.clone()).await;
        sim.logout().await.unwrap();

        let err = ctx.fetch_properties(&vm0(), &[Property::Name]).await.unwrap_err();
        assert_eq!(err, CheckError::ContextClosed);
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[tokio::test]
    async fn test_fetch_dedups_requested_properties() {
        let ctx = context(Arc::new(SimulatedInventory::standard())).await;
        let bag = ctx
            .fetch_properties(
                &vm0(),
                &[Property::ConfigVersion, Property::ConfigVersion, Property::Name],
            )
            .await
            .unwrap();
        assert_eq!(bag.len(), 2);
    }

    #[tokio::test]
    async fn test_read_after_reconfigure() {
        let ctx = context(Arc::new(SimulatedInventory::standard())).await;
        let spec = ConfigSpec {
            version: Some("vmx-15".into()),
            extra_config: vec![OptionValue::new("disk.enableUUID", "TRUE")],
        };
        ctx.reconfigure(&vm0(), &spec, None).await.unwrap();

        let bag = ctx
            .fetch_properties(&vm0(), &[Property::ConfigVersion, Property::ConfigExtraConfig])
            .await
            .unwrap();
        assert_eq!(bag.text(Property::ConfigVersion), Some("vmx-15"));
        assert_eq!(
            bag.option(Property::ConfigExtraConfig, "disk.enableUUID"),
            Some("TRUE")
        );
    }

    #[tokio::test]
    async fn test_reconfigure_task_failure() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.fail_tasks(Some("insufficient permissions")).await;
        let ctx = context(sim).await;

        let spec = ConfigSpec {
            version: Some("vmx-15".into()),
            ..Default::default()
        };
        let err = ctx.reconfigure(&vm0(), &spec, None).await.unwrap_err();
        assert_eq!(
            err,
            CheckError::ReconfigureFailed {
                cause: "insufficient permissions".into()
            }
        );
    }

    #[tokio::test]
    async fn test_reconfigure_wait_honours_caller_timeout() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.set_task_delay(Duration::from_secs(5)).await;
        let ctx = context(sim).await;

        let spec = ConfigSpec {
            version: Some("vmx-15".into()),
            ..Default::default()
        };
        let err = ctx
            .reconfigure(&vm0(), &spec, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        // timeouts during reconfigure are terminal, not transient
        assert!(matches!(err, CheckError::ReconfigureFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_reconfigure() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.set_task_delay(Duration::from_secs(5)).await;
        let ctx = Arc::new(context(sim).await);

        let canceller = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let spec = ConfigSpec {
            version: Some("vmx-15".into()),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let err = ctx.reconfigure(&vm0(), &spec, None).await.unwrap_err();
        assert_eq!(err, CheckError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_host_properties_cached() {
        let sim = Arc::new(SimulatedInventory::standard());
        let ctx = context(sim.clone()).await;
        let host = ObjectRef::new(ObjectKind::HostSystem, "host-24");

        let first = ctx.host_properties(&host).await.unwrap();
        let second = ctx.host_properties(&host).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.text(Property::ProductVersion), Some("6.5.0"));
        assert_eq!(sim.fetch_count(), 1);

        ctx.begin_run().await;
        ctx.host_properties(&host).await.unwrap();
        assert_eq!(sim.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_host_fetch_retried_after_transient_failure() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.inject_fetch_failures_on(ObjectKind::HostSystem, 1).await;
        let ctx = context(sim.clone()).await;

        let bag = ctx.host_properties(&host("host-24")).await.unwrap();
        assert_eq!(bag.text(Property::Name), Some("DC0_H0"));
        assert_eq!(sim.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_host_fetch_gives_up_after_max_attempts() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.inject_fetch_failures_on(ObjectKind::HostSystem, 10).await;
        let ctx = context(sim.clone()).await;

        let err = ctx.host_properties(&host("host-24")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(sim.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_of_one_host_share_a_fetch() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.set_call_delay(Duration::from_millis(50)).await;
        let ctx = context(sim.clone()).await;
        let h = host("host-24");

        let (a, b) = tokio::join!(ctx.host_properties(&h), ctx.host_properties(&h));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(sim.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_hosts_are_fetched_concurrently() {
        let mut model = InventoryModel::standard();
        model.datacenters[0].hosts.push(HostModel {
            id: "host-25".into(),
            name: "DC0_H1".into(),
            version: "7.0.3".into(),
            api_version: "7.0".into(),
        });
        let sim = Arc::new(SimulatedInventory::new(model).unwrap());
        sim.set_call_delay(Duration::from_millis(200)).await;
        let ctx = context(sim.clone()).await;

        let (host24, host25) = (host("host-24"), host("host-25"));
        let (h0, h1) = tokio::join!(
            ctx.host_properties(&host24),
            ctx.host_properties(&host25)
        );
        assert_eq!(h0.unwrap().text(Property::ProductVersion), Some("6.5.0"));
        assert_eq!(h1.unwrap().text(Property::ProductVersion), Some("7.0.3"));
        assert_eq!(sim.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_reconfigures_of_one_object_never_overlap() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.set_task_delay(Duration::from_millis(50)).await;
        let ctx = context(sim.clone()).await;

        let vm = vm0();
        let (spec14, spec15) = (hardware_spec("vmx-14"), hardware_spec("vmx-15"));
        let (a, b) = tokio::join!(
            ctx.reconfigure(&vm, &spec14, None),
            ctx.reconfigure(&vm, &spec15, None)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(sim.reconfigure_count(), 2);
        assert_eq!(sim.peak_tasks_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_reconfigures_of_different_objects_overlap() {
        let sim = Arc::new(SimulatedInventory::standard());
        sim.set_task_delay(Duration::from_millis(50)).await;
        let ctx = context(sim.clone()).await;
        let vm1 = ObjectRef::new(ObjectKind::VirtualMachine, "vm-60");

        let vm = vm0();
        let (spec_a, spec_b) = (hardware_spec("vmx-15"), hardware_spec("vmx-15"));
        let (a, b) = tokio::join!(
            ctx.reconfigure(&vm, &spec_a, None),
            ctx.reconfigure(&vm1, &spec_b, None)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(sim.peak_tasks_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_user_privileges_through_context() {
        let ctx = context(Arc::new(SimulatedInventory::standard())).await;
        let dc = ObjectRef::new(ObjectKind::Datacenter, "DC0");

        let granted = ctx.user_privileges(&dc, "testuser").await.unwrap();
        assert!(granted.iter().any(|p| p == "System.Read"));
        assert!(ctx.user_privileges(&dc, "nobody").await.unwrap().is_empty());
    }
}
