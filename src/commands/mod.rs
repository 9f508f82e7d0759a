pub mod check;
pub mod nodes;
pub mod version;
pub mod watch;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use vsphere_node_checker::checks::CheckSet;
use vsphere_node_checker::cluster::{ClusterState, KubeClusterState, StaticClusterState};
use vsphere_node_checker::config::CheckerConfig;
use vsphere_node_checker::context::{Cancellation, CheckContext};
use vsphere_node_checker::infra::InfraClient;
use vsphere_node_checker::simulator::{InventoryModel, SimulatedInventory};

use crate::cli::SourceArgs;

/* ============================= PROGRESS ============================= */

const STEP_WIDTH: usize = 28;

/// Dotted progress line: `  Label ............ `, completed by `done`.
pub(crate) fn step(progress: bool, label: &str) {
    if progress {
        let dots = ".".repeat(STEP_WIDTH.saturating_sub(label.len()));
        print!("  {label} {dots} ");
    }
}

pub(crate) fn done(progress: bool, status: impl std::fmt::Display) {
    if progress {
        println!("{status}");
    }
}

/* ============================= SESSION ============================= */

/// Configuration, selected checks and the two backends, built from the CLI
/// sources. Check contexts are opened per run.
pub(crate) struct Session {
    pub config: CheckerConfig,
    pub checks: CheckSet,
    pub cluster: Arc<dyn ClusterState>,
    pub infra: Arc<dyn InfraClient>,
}

impl Session {
    /// Fresh context: cluster metadata is re-read and the infrastructure
    /// client logs in again. The caller closes it.
    pub async fn context(&self, cancellation: Cancellation) -> Result<CheckContext> {
        CheckContext::new(
            self.cluster.clone(),
            self.infra.clone(),
            &self.config,
            cancellation,
        )
        .await
    }

    pub async fn open_context(&self, cancellation: Cancellation, progress: bool) -> Result<CheckContext> {
        step(progress, "Check context");
        match self.context(cancellation).await {
            Ok(ctx) => {
                done(progress, format!("OK ({})", ctx.metadata().vm_folder()));
                Ok(ctx)
            }
            Err(e) => {
                done(progress, "FAIL");
                Err(e)
            }
        }
    }
}

/// Config file (or defaults) with CLI overrides applied. Without a config
/// file the datacenter is taken from a single-datacenter inventory.
pub(crate) fn load_config(source: &SourceArgs, datacenters: &[String]) -> Result<CheckerConfig> {
    let mut config = match &source.config {
        Some(path) => CheckerConfig::load(path)?,
        None => CheckerConfig::default(),
    };
    if config.workspace.datacenter.is_empty()
        && let [dc] = datacenters
    {
        config.workspace.datacenter = dc.clone();
    }
    if let Some(workers) = source.workers {
        config.executor.workers = workers;
    }
    if let Some(timeout) = source.timeout {
        config.executor.call_timeout_seconds = timeout;
    }
    config.validate()?;
    Ok(config)
}

async fn cluster_state(source: &SourceArgs, progress: bool) -> Result<Arc<dyn ClusterState>> {
    if let Some(path) = &source.cluster_snapshot {
        let snapshot = StaticClusterState::load(path)?;
        done(progress, format!("OK (snapshot, {} nodes)", snapshot.nodes.len()));
        return Ok(Arc::new(snapshot));
    }

    let live = match KubeClusterState::try_default().await {
        Ok(c) => c,
        Err(e) => {
            done(progress, "FAIL");
            return Err(e);
        }
    };
    match live.client().apiserver_version().await {
        Ok(v) => done(progress, format!("OK (v{}.{})", v.major, v.minor)),
        Err(e) => {
            done(progress, "FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }
    Ok(Arc::new(live))
}

/// Load every source and resolve `check_names` (empty selects all). Nothing
/// remote is opened until the first [`Session::context`].
pub(crate) async fn open_session(
    source: &SourceArgs,
    check_names: &[String],
    progress: bool,
) -> Result<Session> {
    step(progress, "Inventory");
    let model = match InventoryModel::load(&source.inventory) {
        Ok(model) => model,
        Err(e) => {
            done(progress, "FAIL");
            return Err(e);
        }
    };
    let datacenters: Vec<String> = model.datacenters.iter().map(|dc| dc.name.clone()).collect();
    let vms: usize = model.datacenters.iter().map(|dc| dc.vms.len()).sum();
    let inventory = match SimulatedInventory::new(model) {
        Ok(inv) => inv,
        Err(e) => {
            done(progress, "FAIL");
            return Err(e.context(format!("Invalid inventory {}", source.inventory.display())));
        }
    };
    done(progress, format!("OK ({vms} VMs)"));

    step(progress, "Configuration");
    let config = match load_config(source, &datacenters) {
        Ok(c) => c,
        Err(e) => {
            done(progress, "FAIL");
            return Err(e);
        }
    };
    done(
        progress,
        match &source.config {
            Some(path) => format!("OK ({})", path.display()),
            None => format!("OK (defaults, datacenter {})", config.workspace.datacenter),
        },
    );

    step(progress, "Checks");
    let checks = match CheckSet::from_config(&config).only(check_names) {
        Ok(checks) => checks,
        Err(e) => {
            done(progress, "FAIL");
            return Err(e);
        }
    };
    done(progress, format!("OK ({} selected)", checks.names().len()));

    step(progress, "Cluster state");
    let cluster = cluster_state(source, progress).await?;

    Ok(Session {
        config,
        checks,
        cluster,
        infra: Arc::new(inventory),
    })
}

/// Cancel `cancellation` on Ctrl+C.
pub(crate) fn cancel_on_ctrl_c(cancellation: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown_signal_received");
            cancellation.cancel();
        }
    });
}
