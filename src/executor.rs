use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, future};
use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::checks::{CheckOutcome, CheckSet, ClusterCheck, NodeCheck, ResolvedVm};
use crate::cluster::node_name;
use crate::config::{ExecutorConfig, RetryConfig};
use crate::context::CheckContext;
use crate::error::{CheckError, ErrorKind};
use crate::identity;
use crate::infra::Property;

/* ============================= RETRY ============================= */

/// Bounded exponential backoff for transient remote errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_millis),
            max_backoff: Duration::from_millis(cfg.max_backoff_millis),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `call`, retrying while it fails with a transient error.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &CheckContext,
        op: &'static str,
        mut call: F,
    ) -> Result<T, CheckError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CheckError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient_error_retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancellation().cancelled() => return Err(CheckError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                res => return res,
            }
        }
    }
}

/* ============================= REPORT ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRow {
    pub node: String,
    pub check: String,
    pub outcome: CheckOutcome,
}

impl OutcomeRow {
    pub fn new(node: impl Into<String>, check: impl Into<String>, outcome: CheckOutcome) -> Self {
        Self {
            node: node.into(),
            check: check.into(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSummary {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub error: usize,
}

impl OutcomeSummary {
    pub fn total(&self) -> usize {
        self.pass + self.fail + self.skip + self.error
    }
}

/// Every outcome of one run: node rows in node-then-check order, followed
/// by cluster-wide rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: Vec<OutcomeRow>,
    pub cluster_rows: Vec<OutcomeRow>,
}

impl RunReport {
    pub fn all_rows(&self) -> impl Iterator<Item = &OutcomeRow> {
        self.rows.iter().chain(self.cluster_rows.iter())
    }

    pub fn summary(&self) -> OutcomeSummary {
        let mut s = OutcomeSummary::default();
        for row in self.all_rows() {
            match row.outcome {
                CheckOutcome::Pass => s.pass += 1,
                CheckOutcome::Fail { .. } => s.fail += 1,
                CheckOutcome::Skip { .. } => s.skip += 1,
                CheckOutcome::Error { .. } => s.error += 1,
            }
        }
        s
    }

    /// True when nothing failed and nothing errored.
    pub fn is_clean(&self) -> bool {
        let s = self.summary();
        s.fail == 0 && s.error == 0
    }

    pub fn outcome(&self, node: &str, check: &str) -> Option<&CheckOutcome> {
        self.rows
            .iter()
            .find(|r| r.node == node && r.check == check)
            .map(|r| &r.outcome)
    }

    pub fn cluster_outcome(&self, check: &str) -> Option<&CheckOutcome> {
        self.cluster_rows
            .iter()
            .find(|r| r.check == check)
            .map(|r| &r.outcome)
    }

    pub fn rows_for_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a OutcomeRow> {
        self.rows.iter().filter(move |r| r.node == node)
    }
}

/// Node column value used for cluster-wide rows.
pub const CLUSTER_ROW: &str = "(cluster)";

/* ============================= EXECUTOR ============================= */

pub struct Executor {
    workers: usize,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(workers: usize, retry: RetryPolicy) -> Self {
        Self {
            workers: workers.max(1),
            retry,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.workers, RetryPolicy::from(&config.retry))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every check in `checks` and collect a complete report.
    pub async fn run(&self, ctx: &CheckContext, nodes: &[Node], checks: &CheckSet) -> RunReport {
        let started_at = Utc::now();
        ctx.begin_run().await;
        info!(
            nodes = nodes.len(),
            node_checks = checks.node.len(),
            cluster_checks = checks.cluster.len(),
            workers = self.workers,
            "run_started"
        );

        let rows = self.run_node_checks(ctx, nodes, &checks.node).await;
        let cluster_rows = self.run_cluster_checks(ctx, &checks.cluster).await;

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            rows,
            cluster_rows,
        };
        let s = report.summary();
        info!(
            pass = s.pass,
            fail = s.fail,
            skip = s.skip,
            error = s.error,
            "run_completed"
        );
        report
    }

    /// One row per (node, check), ordered by node then declared check order,
    /// regardless of the order in which nodes complete.
    pub async fn run_node_checks(
        &self,
        ctx: &CheckContext,
        nodes: &[Node],
        checks: &[Arc<dyn NodeCheck>],
    ) -> Vec<OutcomeRow> {
        let properties = required_properties(checks);
        let properties = properties.as_slice();

        // At most `workers` nodes in flight; join_all yields in input order.
        let semaphore = Semaphore::new(self.workers);
        let semaphore = &semaphore;
        let per_node = future::join_all(nodes.iter().map(|node| async move {
            let _permit = semaphore.acquire().await;
            self.check_node(ctx, node, checks, properties).await
        }))
        .await;

        per_node.into_iter().flatten().collect()
    }

    pub async fn run_cluster_checks(
        &self,
        ctx: &CheckContext,
        checks: &[Arc<dyn ClusterCheck>],
    ) -> Vec<OutcomeRow> {
        let mut rows = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = match ctx.ensure_ready() {
                Err(e) => CheckOutcome::from_error(&e),
                Ok(()) => guarded(check.run(ctx)).await,
            };
            info!(check = check.name(), outcome = outcome.label(), "cluster_check_completed");
            rows.push(OutcomeRow::new(CLUSTER_ROW, check.name(), outcome));
        }
        rows
    }

    async fn check_node(
        &self,
        ctx: &CheckContext,
        node: &Node,
        checks: &[Arc<dyn NodeCheck>],
        properties: &[Property],
    ) -> Vec<OutcomeRow> {
        let name = display_name(node);
        if checks.is_empty() {
            return Vec::new();
        }

        let vm = match ctx.ensure_ready() {
            Err(e) => Err(e),
            Ok(()) => self.resolve_vm(ctx, node, properties).await,
        };
        let vm = match vm {
            Ok(vm) => vm,
            Err(e) => {
                if e != CheckError::Cancelled {
                    warn!(node = %name, error = %e, "node_resolution_failed");
                }
                let outcome = CheckOutcome::from_error(&e);
                return checks
                    .iter()
                    .map(|c| OutcomeRow::new(name.clone(), c.name(), outcome.clone()))
                    .collect();
            }
        };

        let mut rows = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = match ctx.ensure_ready() {
                Err(e) => CheckOutcome::from_error(&e),
                Ok(()) => guarded(check.run(ctx, node, &vm)).await,
            };
            info!(
                node = %name,
                check = check.name(),
                outcome = outcome.label(),
                "check_completed"
            );
            rows.push(OutcomeRow::new(name.clone(), check.name(), outcome));
        }
        rows
    }

    async fn resolve_vm(
        &self,
        ctx: &CheckContext,
        node: &Node,
        properties: &[Property],
    ) -> Result<ResolvedVm, CheckError> {
        let reference = self
            .retry
            .run(ctx, "resolve", || identity::resolve(ctx, node))
            .await?;

        let bag = self
            .retry
            .run(ctx, "fetch_properties", || {
                ctx.fetch_properties(&reference.object, properties)
            })
            .await?;

        identity::verify_identity(&reference, &bag)?;
        debug!(node = %reference.node, object = %reference.object, "vm_properties_loaded");
        Ok(ResolvedVm {
            reference,
            properties: bag,
        })
    }
}

/// Union of the properties the checks declare, plus the UUID needed to
/// confirm identity.
pub fn required_properties(checks: &[Arc<dyn NodeCheck>]) -> Vec<Property> {
    let mut set: BTreeSet<Property> = checks
        .iter()
        .flat_map(|c| c.required_properties().iter().copied())
        .collect();
    set.insert(Property::ConfigUuid);
    set.into_iter().collect()
}

fn display_name(node: &Node) -> String {
    match node_name(node) {
        "" => "<unnamed>".to_string(),
        name => name.to_string(),
    }
}

/// Run a check future, turning errors and panics into outcomes.
async fn guarded<F>(check: F) -> CheckOutcome
where
    F: Future<Output = Result<CheckOutcome, CheckError>>,
{
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => CheckOutcome::from_error(&e),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "check_panicked");
            CheckOutcome::Error {
                kind: ErrorKind::UnexpectedCheckFailure,
                cause: format!("check panicked: {message}"),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/* ============================= TESTS ============================= */
