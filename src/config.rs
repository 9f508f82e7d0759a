use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/* ============================= DEFAULTS ============================= */

pub const DEFAULT_MIN_HARDWARE_VERSION: u32 = 15;
pub const DEFAULT_MIN_HOST_VERSION: &str = "6.7.3";
pub const DEFAULT_WORKERS: usize = 8;

/* ============================= TYPES ============================= */

/// Top-level checker configuration, loaded from YAML.
///
/// Every section is optional; omitted fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckerConfig {
    pub workspace: Workspace,
    pub checks: CheckThresholds,
    pub executor: ExecutorConfig,
}

/// Where cluster objects live in the virtualization inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Workspace {
    pub server: String,
    /// Account the infrastructure client logs in as; its privileges are checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub datacenter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_datastore: Option<String>,
    /// VM folder, absolute (`/DC0/vm/ocp`) or relative to `/<datacenter>/vm`.
    /// When unset the folder is named after the cluster infrastructure name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resourcepool_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckThresholds {
    pub min_hardware_version: u32,
    pub min_host_version: String,
    /// Check names excluded from every run.
    pub disabled: Vec<String>,
}

impl Default for CheckThresholds {
    fn default() -> Self {
        Self {
            min_hardware_version: DEFAULT_MIN_HARDWARE_VERSION,
            min_host_version: DEFAULT_MIN_HOST_VERSION.to_string(),
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub call_timeout_seconds: u64,
    pub reconfigure_timeout_seconds: u64,
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            call_timeout_seconds: 30,
            reconfigure_timeout_seconds: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn reconfigure_timeout(&self) -> Duration {
        Duration::from_secs(self.reconfigure_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_millis: 200,
            max_backoff_millis: 2_000,
        }
    }
}

/* ============================= LOADING ============================= */

impl CheckerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CheckerConfig =
            serde_yaml::from_str(yaml).context("Failed to parse checker configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace.datacenter.trim().is_empty() {
            anyhow::bail!("workspace.datacenter must be set");
        }
        if self.executor.workers == 0 {
            anyhow::bail!("executor.workers must be at least 1");
        }
        if self.executor.retry.max_attempts == 0 {
            anyhow::bail!("executor.retry.maxAttempts must be at least 1");
        }
        if self.executor.call_timeout_seconds == 0 {
            anyhow::bail!("executor.callTimeoutSeconds must be positive");
        }
        if crate::checks::parse_dotted_version(&self.checks.min_host_version).is_none() {
            anyhow::bail!(
                "checks.minHostVersion '{}' is not a dotted version",
                self.checks.min_host_version
            );
        }
        Ok(())
    }

    pub fn is_check_enabled(&self, name: &str) -> bool {
        !self.checks.disabled.iter().any(|d| d == name)
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
workspace:
  server: vcenter.example.com
  user: ocp-checker@vsphere.local
  datacenter: DC0
  defaultDatastore: LocalDS_0
  folder: /DC0/vm
  resourcepoolPath: /DC0/host/DC0_H0/Resources
checks:
  minHardwareVersion: 13
  minHostVersion: "7.0.2"
  disabled: [disk-uuid]
executor:
  workers: 4
  callTimeoutSeconds: 10
  retry:
    maxAttempts: 5
"#;

    #[test]
    fn test_full_config_parses() {
        let cfg = CheckerConfig::from_yaml(FULL).expect("should parse");
        assert_eq!(cfg.workspace.datacenter, "DC0");
        assert_eq!(cfg.workspace.user.as_deref(), Some("ocp-checker@vsphere.local"));
        assert_eq!(cfg.workspace.default_datastore.as_deref(), Some("LocalDS_0"));
        assert_eq!(cfg.workspace.folder.as_deref(), Some("/DC0/vm"));
        assert_eq!(cfg.checks.min_hardware_version, 13);
        assert_eq!(cfg.checks.min_host_version, "7.0.2");
        assert_eq!(cfg.executor.workers, 4);
        assert_eq!(cfg.executor.call_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.executor.retry.max_attempts, 5);
        // untouched nested defaults survive
        assert_eq!(cfg.executor.retry.initial_backoff_millis, 200);
        assert_eq!(cfg.executor.reconfigure_timeout_seconds, 300);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = CheckerConfig::from_yaml("workspace:\n  datacenter: DC1\n").unwrap();
        assert_eq!(cfg.checks.min_hardware_version, DEFAULT_MIN_HARDWARE_VERSION);
        assert_eq!(cfg.checks.min_host_version, DEFAULT_MIN_HOST_VERSION);
        assert_eq!(cfg.executor.workers, DEFAULT_WORKERS);
        assert!(cfg.workspace.folder.is_none());
    }

    #[test]
    fn test_missing_datacenter_rejected() {
        let err = CheckerConfig::from_yaml("checks:\n  minHardwareVersion: 15\n").unwrap_err();
        assert!(err.to_string().contains("datacenter"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = "workspace:\n  datacenter: DC0\nexecutor:\n  workers: 0\n";
        assert!(CheckerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bad_host_version_rejected() {
        let yaml = "workspace:\n  datacenter: DC0\nchecks:\n  minHostVersion: seven\n";
        assert!(CheckerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_disabled_checks() {
        let cfg = CheckerConfig::from_yaml(FULL).unwrap();
        assert!(!cfg.is_check_enabled("disk-uuid"));
        assert!(cfg.is_check_enabled("hardware-version"));
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = CheckerConfig::load("/nonexistent/checker.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/checker.yaml"));
    }
}
