use anyhow::Result;
use tracing::info;

use vsphere_node_checker::context::Cancellation;
use vsphere_node_checker::executor::Executor;
use vsphere_node_checker::report::{self, ReportMetrics};

use super::{cancel_on_ctrl_c, done, open_session, step};
use crate::cli::{CheckArgs, OutputFormat};

/// Single run. Returns whether every check passed or was skipped.
pub async fn run(args: CheckArgs) -> Result<bool> {
    let progress = args.output == OutputFormat::Table;
    if progress {
        println!("Running vSphere node checks...\n");
    }

    let cancellation = Cancellation::new();
    cancel_on_ctrl_c(cancellation.clone());

    let session = open_session(&args.source, &args.checks, progress).await?;
    let ctx = &session.open_context(cancellation, progress).await?;

    step(progress, "Cluster nodes");
    let nodes = match ctx.cluster().list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            done(progress, "FAIL");
            ctx.close().await;
            return Err(e);
        }
    };
    done(progress, format!("OK ({} nodes)", nodes.len()));
    if progress {
        println!();
    }

    let executor = Executor::from_config(&session.config.executor);
    let report = executor.run(ctx, &nodes, &session.checks).await;
    ctx.close().await;

    match args.output {
        OutputFormat::Table => {
            print!("{}", report::render_table(&report));
            if ctx.is_cancelled() {
                println!("\nRun cancelled; checks not started are reported as skipped.");
            }
        }
        OutputFormat::Json => println!("{}", report::render_json(&report)?),
        OutputFormat::Prometheus => {
            let metrics = ReportMetrics::new()?;
            metrics.observe(&report);
            print!("{}", metrics.render()?);
        }
    }

    info!(clean = report.is_clean(), "check_command_finished");
    Ok(report.is_clean())
}
