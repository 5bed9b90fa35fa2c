//! End-to-end: a daemon over a manifest directory and the local driver.

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rudder_core::DaemonConfig;
use rudderd::Daemon;
use serde_json::Value;
use tower::ServiceExt;

fn write_manifests(root: &Path, workload: &str, config: &str) {
    let dir = root.join("web");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("workload.toml"), workload).unwrap();
    std::fs::write(dir.join("config.toml"), config).unwrap();
}

fn daemon_config(source: &Path, data: &Path) -> DaemonConfig {
    DaemonConfig::parse(&format!(
        r#"
[storage]
data_dir = {data:?}

[scheduler]
poll_interval_secs = 3600
drift_interval_secs = 3600

[source]
root = {source:?}

[[applications]]
id = "web"
platform = "local"

[applications.policy.progressive]
strategy = "canary"
canary_steps = [50, 100]
analysis_secs = 0
"#,
        data = data.display().to_string(),
        source = source.display().to_string(),
    ))
    .unwrap()
}

async fn get(daemon: &Daemon, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(daemon, request).await
}

async fn post(daemon: &Daemon, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(daemon, request).await
}

async fn send(daemon: &Daemon, request: Request<Body>) -> (StatusCode, Value) {
    let response = daemon.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Wait until `count` deployments exist and the newest one succeeded.
async fn wait_succeeded(daemon: &Daemon, count: usize) -> Value {
    for _ in 0..500 {
        let (_, body) = get(daemon, "/api/v1/applications/web/deployments").await;
        if let Some(list) = body["data"].as_array()
            && list.len() == count
            && list[0]["status"] == "SUCCEEDED"
        {
            return list[0].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("deployment {count} never succeeded");
}

async fn wait_synced(daemon: &Daemon) {
    for _ in 0..500 {
        let (_, body) = get(daemon, "/api/v1/applications/web").await;
        if body["data"]["evaluation"]["sync_state"]["state"] == "synced" {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("application never reported synced");
}

#[tokio::test]
async fn deploys_from_manifests_then_quick_syncs_config_changes() {
    let source = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_manifests(
        source.path(),
        "[workload]\nimage = \"web:v1\"\nreplicas = 2\n",
        "[config]\nlevel = \"info\"\n",
    );

    let daemon = Daemon::start(&daemon_config(source.path(), data.path()))
        .await
        .unwrap();
    assert!(data.path().join(rudderd::daemon::DB_FILE).exists());

    // Nothing is live yet, so the first deployment is a workload change.
    let first = wait_succeeded(&daemon, 1).await;
    assert_eq!(first["path"], "progressive");
    let revision = first["trigger_revision"].as_str().unwrap().to_string();
    assert_eq!(
        daemon.driver.live_revision("web").await.as_deref(),
        Some(revision.as_str())
    );
    assert_eq!(daemon.driver.canary("web").await, None);

    // Every committed transition also lands in the transition log.
    let log = data.path().join(rudderd::daemon::TRANSITIONS_FILE);
    let id = first["id"].as_str().unwrap().to_string();
    let mut logged = Vec::new();
    for _ in 0..500 {
        logged = std::fs::read_to_string(&log)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter(|e| e["deployment_id"] == id.as_str() && e["transition"]["scope"] == "deployment")
            .map(|e| e["transition"]["to"].as_str().unwrap().to_string())
            .collect();
        if logged.last().map(String::as_str) == Some("SUCCEEDED") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(logged, vec!["PLANNED", "RUNNING", "SUCCEEDED"]);

    // A config-only edit goes out through a single SYNC stage.
    write_manifests(
        source.path(),
        "[workload]\nimage = \"web:v1\"\nreplicas = 2\n",
        "[config]\nlevel = \"debug\"\n",
    );
    let (status, _) = post(&daemon, "/api/v1/applications/web/sync").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let second = wait_succeeded(&daemon, 2).await;
    assert_eq!(second["path"], "quick_sync");
    assert_eq!(second["pipeline"].as_array().unwrap().len(), 1);
    assert_ne!(second["trigger_revision"], first["trigger_revision"]);

    wait_synced(&daemon).await;

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn unsupported_platform_fails_startup() {
    let source = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut config = daemon_config(source.path(), data.path());
    config.applications[0].platform = rudder_core::PlatformKind::Ecs;

    let err = Daemon::start(&config).await.err().unwrap();
    assert!(format!("{err:#}").contains("web"), "{err:#}");
}
