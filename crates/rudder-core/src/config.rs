//! rudderd.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Application, DeploymentPolicy, PlatformKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8470 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/rudder"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Desired-state polling interval.
    pub poll_interval_secs: u64,
    /// Live-state drift re-poll interval. Should be slower than polling.
    pub drift_interval_secs: u64,
    /// How long an instance's claim on a running deployment stays valid
    /// without renewal.
    pub lease_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            drift_interval_secs: 600,
            lease_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Root of the desired-state tree: one directory per application.
    pub root: PathBuf,
}

/// An application registered from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,
    #[serde(default = "default_project")]
    pub project_id: String,
    pub name: Option<String>,
    pub platform: PlatformKind,
    #[serde(default)]
    pub policy: DeploymentPolicy,
}

fn default_project() -> String {
    "default".to_string()
}

impl ApplicationConfig {
    /// Build the application record, stamped with `now` (epoch seconds).
    pub fn to_application(&self, now: u64) -> Application {
        Application {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            platform: self.platform,
            policy: self.policy.clone(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        let mut seen = std::collections::HashSet::new();
        for app in &config.applications {
            if !seen.insert(app.id.as_str()) {
                anyhow::bail!("application `{}` is declared twice", app.id);
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressiveStrategy;

    #[test]
    fn parse_minimal() {
        let config = DaemonConfig::parse(
            r#"
[source]
root = "/srv/desired"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8470);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert!(config.applications.is_empty());
    }

    #[test]
    fn parse_application_with_progressive_policy() {
        let config = DaemonConfig::parse(
            r#"
[source]
root = "/srv/desired"

[[applications]]
id = "checkout"
platform = "kubernetes"

[applications.policy]
auto_rollback = true

[applications.policy.progressive]
strategy = "canary"
canary_steps = [10, 50, 100]
analysis_secs = 120

[applications.policy.approval]
required = true
approvers = ["alice"]
"#,
        )
        .unwrap();

        let app = config.applications[0].to_application(1000);
        assert_eq!(app.name, "checkout");
        assert_eq!(app.project_id, "default");
        assert_eq!(app.platform, PlatformKind::Kubernetes);
        let progressive = app.policy.progressive.unwrap();
        assert_eq!(progressive.strategy, ProgressiveStrategy::Canary);
        assert_eq!(progressive.canary_steps, vec![10, 50, 100]);
        assert!(app.policy.approval.required);
        // Unset fields keep their defaults.
        assert_eq!(app.policy.retry.max_attempts, 3);
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result = DaemonConfig::parse(
            r#"
[source]
root = "/srv"

[[applications]]
id = "a"
platform = "local"

[applications.policy]
stage_timeout_secs = -5
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_applications_are_rejected() {
        let result = DaemonConfig::parse(
            r#"
[source]
root = "/srv"

[[applications]]
id = "a"
platform = "local"

[[applications]]
id = "a"
platform = "local"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = DaemonConfig::parse("[source]\nroot = \"/srv\"\n").unwrap();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("/srv"));
    }
}
