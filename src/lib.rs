pub mod checks;
pub mod cluster;
pub mod config;
pub mod context;
pub mod crd;
pub mod error;
pub mod executor;
pub mod identity;
pub mod infra;
pub mod report;
pub mod simulator;
