use std::fmt::Write as _;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::executor::{OutcomeRow, RunReport};

/* ============================= TABLE ============================= */

const OUTCOMES: [&str; 4] = ["pass", "fail", "skip", "error"];

fn push_rows(out: &mut String, rows: &[OutcomeRow]) {
    let _ = writeln!(
        out,
        "{:<32} {:<26} {:<8} {}",
        "NODE", "CHECK", "RESULT", "DETAIL"
    );
    let _ = writeln!(out, "{}", "-".repeat(100));
    for row in rows {
        let _ = writeln!(
            out,
            "{:<32} {:<26} {:<8} {}",
            row.node,
            row.check,
            row.outcome.label().to_uppercase(),
            row.outcome.detail()
        );
    }
}

/// Human-readable rendering of a run, one line per outcome.
pub fn render_table(report: &RunReport) -> String {
    let mut out = String::new();

    if !report.rows.is_empty() {
        push_rows(&mut out, &report.rows);
        out.push('\n');
    }
    if !report.cluster_rows.is_empty() {
        push_rows(&mut out, &report.cluster_rows);
        out.push('\n');
    }

    let s = report.summary();
    let elapsed = report
        .finished_at
        .signed_duration_since(report.started_at)
        .num_milliseconds();
    let _ = writeln!(
        out,
        "Total: {} checks ({} pass, {} fail, {} skip, {} error) in {} ms",
        s.total(),
        s.pass,
        s.fail,
        s.skip,
        s.error,
        elapsed
    );
    out
}

pub fn render_json(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize run report")
}

/* ============================= PROMETHEUS ============================= */

/// Outcome gauges for the latest run, kept in a registry of their own.
pub struct ReportMetrics {
    registry: Registry,
    node_outcomes: IntGaugeVec,
    cluster_outcomes: IntGaugeVec,
    runs: IntCounter,
    last_run: IntGauge,
}

impl ReportMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let node_outcomes = IntGaugeVec::new(
            Opts::new(
                "vsphere_node_check_outcomes",
                "Nodes per check and outcome in the latest run",
            ),
            &["check", "outcome"],
        )?;
        let cluster_outcomes = IntGaugeVec::new(
            Opts::new(
                "vsphere_cluster_check_outcomes",
                "Cluster check outcomes in the latest run (1 = current outcome)",
            ),
            &["check", "outcome"],
        )?;
        let runs = IntCounter::new("vsphere_check_runs_total", "Completed check runs")?;
        let last_run = IntGauge::new(
            "vsphere_check_last_run_timestamp_seconds",
            "Unix time the latest run finished",
        )?;

        registry.register(Box::new(node_outcomes.clone()))?;
        registry.register(Box::new(cluster_outcomes.clone()))?;
        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(last_run.clone()))?;

        Ok(Self {
            registry,
            node_outcomes,
            cluster_outcomes,
            runs,
            last_run,
        })
    }

    /// Replace the gauges with the outcomes of `report`.
    pub fn observe(&self, report: &RunReport) {
        self.node_outcomes.reset();
        self.cluster_outcomes.reset();

        for row in &report.rows {
            // every label combination for a check exists, even at zero
            for outcome in OUTCOMES {
                self.node_outcomes.with_label_values(&[row.check.as_str(), outcome]);
            }
            self.node_outcomes
                .with_label_values(&[row.check.as_str(), row.outcome.label()])
                .inc();
        }
        for row in &report.cluster_rows {
            for outcome in OUTCOMES {
                self.cluster_outcomes.with_label_values(&[row.check.as_str(), outcome]);
            }
            self.cluster_outcomes
                .with_label_values(&[row.check.as_str(), row.outcome.label()])
                .set(1);
        }

        self.runs.inc();
        self.last_run.set(report.finished_at.timestamp());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }
}

/* ============================= TESTS ============================= */
