use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::{signal, time::sleep};
use tracing::{error, info, warn};

use vsphere_node_checker::context::Cancellation;
use vsphere_node_checker::executor::{Executor, RunReport};
use vsphere_node_checker::report::ReportMetrics;

use super::{Session, open_session};
use crate::cli::WatchArgs;

/* ============================= STATE ============================= */

#[derive(Default)]
pub(crate) struct WatchState {
    pub(crate) ready: bool,
    pub(crate) runs: u64,
    pub(crate) last_clean: Option<bool>,
}

type SharedState = Arc<Mutex<WatchState>>;

/* ============================= ENTRY ============================= */

pub async fn run(args: WatchArgs) -> Result<()> {
    println!("Starting watch controller...\n");
    info!("controller_starting");

    let cancellation = Cancellation::new();
    let session = open_session(&args.source, &args.checks, true).await?;
    // fail fast on bad metadata or credentials; every run opens its own context
    session.open_context(cancellation.clone(), true).await?.close().await;
    let executor = Executor::from_config(&session.config.executor);
    let session = Arc::new(session);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let interval = Duration::from_secs(args.interval.max(1));

    println!("  HTTP server ................. http://{addr}");
    println!("  Run interval ................ {}s", interval.as_secs());
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness endpoint (always 200 OK)");
    println!("    GET /readyz ............... Readiness endpoint (200 while the latest run completed)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Watch controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state: SharedState = Arc::new(Mutex::new(WatchState::default()));
    let metrics = Arc::new(ReportMetrics::new()?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let loop_handle = tokio::spawn({
        let cancellation = cancellation.clone();
        let state = state.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_tx.subscribe();
        async move {
            check_loop(session, executor, interval, cancellation, state, metrics, shutdown).await
        }
    });

    let http_handle = tokio::spawn({
        let state = state.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_tx.subscribe();
        async move { start_http_server(state, metrics, shutdown, addr).await }
    });

    supervise(
        signal::ctrl_c(),
        loop_handle,
        http_handle,
        shutdown_tx,
        cancellation,
        state,
    )
    .await?;

    info!("controller_stopped");
    println!("Watch controller stopped.");
    Ok(())
}

/// Wait for `stop`, then cancel the in-flight run and stop both tasks. If the
/// check loop ends first, readiness is dropped and the server is shut down.
async fn supervise(
    stop: impl Future<Output = std::io::Result<()>>,
    mut loop_handle: JoinHandle<()>,
    http_handle: JoinHandle<Result<()>>,
    shutdown_tx: broadcast::Sender<()>,
    cancellation: Cancellation,
    state: SharedState,
) -> Result<()> {
    tokio::select! {
        signalled = stop => {
            signalled?;
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping watch controller...");
            println!("{}", "=".repeat(70));

            // abort the in-flight run, then stop both loops
            cancellation.cancel();
            let _ = shutdown_tx.send(());

            loop_handle.await?;
            http_handle.await??;
            Ok(())
        }
        exited = &mut loop_handle => {
            mark_not_ready(&state).await;
            error!("check_loop_exited");
            cancellation.cancel();
            let _ = shutdown_tx.send(());
            http_handle.await??;

            match exited {
                Ok(()) => bail!("Check loop stopped unexpectedly"),
                Err(e) => Err(anyhow::Error::new(e).context("Check loop failed")),
            }
        }
    }
}

/* ============================= CHECK LOOP ============================= */

async fn check_loop(
    session: Arc<Session>,
    executor: Executor,
    interval: Duration,
    cancellation: Cancellation,
    state: SharedState,
    metrics: Arc<ReportMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        match run_once(&session, &executor, &cancellation).await {
            Ok(Some(report)) => record_run(&state, &metrics, &report).await,
            Ok(None) => {
                info!("check_loop_cancelled");
                return;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "watch_run_failed");
                mark_not_ready(&state).await;
            }
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("check_loop_stopped");
                return;
            }
            _ = sleep(interval) => {}
        }
    }
}

/// One run on its own context, closed afterwards. `None` when cancelled.
async fn run_once(
    session: &Session,
    executor: &Executor,
    cancellation: &Cancellation,
) -> Result<Option<RunReport>> {
    let ctx = session.context(cancellation.clone()).await?;
    let nodes = match ctx.cluster().list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            ctx.close().await;
            return Err(e.context("Failed to list nodes"));
        }
    };

    let report = executor.run(&ctx, &nodes, &session.checks).await;
    ctx.close().await;
    Ok((!ctx.is_cancelled()).then_some(report))
}

async fn mark_not_ready(state: &SharedState) {
    state.lock().await.ready = false;
}

pub(crate) async fn record_run(state: &SharedState, metrics: &ReportMetrics, report: &RunReport) {
    metrics.observe(report);

    let mut state = state.lock().await;
    state.ready = true;
    state.runs += 1;
    state.last_clean = Some(report.is_clean());

    let s = report.summary();
    info!(
        run = state.runs,
        pass = s.pass,
        fail = s.fail,
        skip = s.skip,
        error = s.error,
        "watch_run_recorded"
    );
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(state: SharedState, metrics: Arc<ReportMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(move || metrics_handler(metrics.clone())))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(move || ready_handler(state.clone())))
}

async fn start_http_server(
    state: SharedState,
    metrics: Arc<ReportMetrics>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_router(state, metrics);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: SharedState) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(metrics: Arc<ReportMetrics>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}
