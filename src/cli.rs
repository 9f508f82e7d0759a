use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "vsphere-node-checker")]
#[command(about = "Correlate Kubernetes nodes with their vSphere VMs and check their configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Prometheus,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Run every check once and print the results
    Check(CheckArgs),

    /// List cluster nodes and the VMs they resolve to
    Nodes {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Re-run the checks periodically and serve metrics over HTTP
    Watch(WatchArgs),
}

/// Where the cluster state, inventory and configuration come from.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Inventory model (YAML) backing the infrastructure client
    #[arg(long)]
    pub inventory: PathBuf,

    /// Checker configuration (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Read cluster state from a snapshot file instead of the live cluster
    #[arg(long)]
    pub cluster_snapshot: Option<PathBuf>,

    /// Nodes checked concurrently (overrides the config file)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-call timeout in seconds (overrides the config file)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,

    /// Run only the named check (repeatable)
    #[arg(long = "check", value_name = "NAME")]
    pub checks: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Seconds between runs
    #[arg(long, default_value_t = 300)]
    pub interval: u64,

    /// HTTP port for /healthz, /readyz and /metrics
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Run only the named check (repeatable)
    #[arg(long = "check", value_name = "NAME")]
    pub checks: Vec<String>,
}
