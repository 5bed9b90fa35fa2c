//! Daemon assembly: state store, drivers, desired-state source, scheduler
//! and API router, wired from a [`DaemonConfig`].

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use rudder_core::clock::epoch_secs;
use rudder_core::{
    ChannelReporter, DaemonConfig, DriverRegistry, FanoutReporter, FileProvider, TracingReporter,
    TransitionEvent,
};
use rudder_planner::validate_policy;
use rudder_scheduler::{RecoveryReport, Scheduler};
use rudder_state::StateStore;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::local::LocalDriver;

/// File name of the state database inside the data directory.
pub const DB_FILE: &str = "rudder.redb";

/// Append-only JSON-lines log of committed transitions, inside the data
/// directory.
pub const TRANSITIONS_FILE: &str = "transitions.jsonl";

const TRANSITION_BUFFER: usize = 1024;

/// How long shutdown waits for the transition log to drain.
const LOG_DRAIN: Duration = Duration::from_secs(5);

/// A started agent, ready to serve its API.
pub struct Daemon {
    pub scheduler: Scheduler,
    pub router: Router,
    pub driver: Arc<LocalDriver>,
    pub recovery: RecoveryReport,
    transition_log: JoinHandle<()>,
    port: u16,
}

impl Daemon {
    /// Open the store, upsert the configured applications, recover
    /// unfinished deployments and start the per-application tasks.
    pub async fn start(config: &DaemonConfig) -> anyhow::Result<Self> {
        let data_dir = &config.storage.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let db_path = data_dir.join(DB_FILE);
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let driver = Arc::new(LocalDriver::new());
        let drivers = DriverRegistry::new().with(driver.clone());
        let provider = Arc::new(FileProvider::new(&config.source.root));
        info!(root = ?provider.root(), "desired-state source configured");

        let (events, rx) = ChannelReporter::new(TRANSITION_BUFFER);
        let log_path = data_dir.join(TRANSITIONS_FILE);
        info!(path = ?log_path, "transition log opened");
        let transition_log = tokio::spawn(write_transitions(rx, log_path));
        let reporter = FanoutReporter::new()
            .with(Arc::new(TracingReporter))
            .with(Arc::new(events));

        let scheduler = Scheduler::new(
            store,
            provider,
            drivers,
            Arc::new(reporter),
            config.scheduler.clone(),
        );

        for app in &config.applications {
            scheduler
                .register_application(app.to_application(epoch_secs()))
                .await
                .with_context(|| format!("registering application {}", app.id))?;
        }

        let recovery = scheduler.start().await?;
        if !recovery.resumed.is_empty() {
            warn!(deployments = ?recovery.resumed, "resumed unfinished deployments");
        }

        let router = rudder_api::build_router(scheduler.clone());
        Ok(Self {
            scheduler,
            router,
            driver,
            recovery,
            transition_log,
            port: config.server.port,
        })
    }

    /// Serve the API until `shutdown` resolves, then stop every task.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let Daemon {
            scheduler,
            router,
            transition_log,
            port,
            ..
        } = self;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(%addr, "API server starting");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        scheduler.shutdown().await;
        // The log task ends once the last reporter handle is gone.
        drop(scheduler);
        if tokio::time::timeout(LOG_DRAIN, transition_log).await.is_err() {
            warn!("transition log did not drain before exit");
        }
        info!("rudder daemon stopped");
        Ok(())
    }
}

/// Append every event from `rx` to `path` as one JSON object per line.
async fn write_transitions(mut rx: mpsc::Receiver<TransitionEvent>, path: PathBuf) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            warn!(path = ?path, error = %e, "transition log unavailable; events are only traced");
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(deployment = %event.deployment_id, error = %e, "unencodable transition event");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            warn!(path = ?path, error = %e, "transition log write failed");
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!(path = ?path, error = %e, "transition log flush failed");
        }
    }
    debug!(path = ?path, "transition log closed");
}

/// Validate a configuration without starting anything. Returns one line
/// per problem found.
pub fn check_config(config: &DaemonConfig) -> Vec<String> {
    let drivers = DriverRegistry::new().with(Arc::new(LocalDriver::new()));
    let mut problems = Vec::new();

    let scheduler = &config.scheduler;
    if scheduler.poll_interval_secs == 0 {
        problems.push("scheduler.poll_interval_secs must be positive".to_string());
    }
    if scheduler.drift_interval_secs < scheduler.poll_interval_secs {
        problems.push(format!(
            "scheduler.drift_interval_secs ({}) is shorter than poll_interval_secs ({})",
            scheduler.drift_interval_secs, scheduler.poll_interval_secs
        ));
    }
    if scheduler.lease_ttl_secs < 3 {
        problems.push(format!(
            "scheduler.lease_ttl_secs ({}) must be at least 3",
            scheduler.lease_ttl_secs
        ));
    }
    if !config.source.root.is_dir() {
        problems.push(format!(
            "source.root {} is not a directory",
            config.source.root.display()
        ));
    }

    for app in &config.applications {
        match drivers.get(app.platform) {
            None => {
                let mut available: Vec<String> =
                    drivers.kinds().iter().map(ToString::to_string).collect();
                available.sort();
                problems.push(format!(
                    "{}: no driver available for platform {} (available: {})",
                    app.id,
                    app.platform,
                    available.join(", ")
                ));
            }
            Some(driver) => {
                if let Err(e) = validate_policy(&app.policy, &driver.bounds()) {
                    problems.push(format!("{}: {e}", app.id));
                }
            }
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &std::path::Path, apps: &str) -> DaemonConfig {
        DaemonConfig::parse(&format!(
            "[source]\nroot = {:?}\n{apps}",
            root.display().to_string()
        ))
        .unwrap()
    }

    #[test]
    fn valid_config_has_no_problems() {
        let root = tempfile::tempdir().unwrap();
        let config = config(
            root.path(),
            "[[applications]]\nid = \"web\"\nplatform = \"local\"\n",
        );
        assert!(check_config(&config).is_empty());
    }

    #[test]
    fn reports_every_problem() {
        let root = tempfile::tempdir().unwrap();
        let config = config(
            root.path(),
            r#"
[scheduler]
poll_interval_secs = 60
drift_interval_secs = 30
lease_ttl_secs = 1

[[applications]]
id = "fn"
platform = "lambda"

[[applications]]
id = "web"
platform = "local"
[applications.policy.progressive]
canary_steps = [50, 90]
"#,
        );
        let problems = check_config(&config);
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems[0].contains("drift_interval_secs"));
        assert!(problems[1].contains("lease_ttl_secs"));
        assert!(problems[2].starts_with("fn:"));
        assert!(problems[2].ends_with("(available: local)"), "{}", problems[2]);
        assert!(problems[3].starts_with("web:"));
    }

    #[test]
    fn missing_source_root_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        let problems = check_config(&config(&missing, ""));
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("source.root"));
    }
}
