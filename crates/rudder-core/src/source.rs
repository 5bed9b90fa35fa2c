//! Desired-state sources.
//!
//! The core only sees a [`DesiredStateProvider`]; repository access lives
//! behind it. [`FileProvider`] serves snapshots from a local directory tree
//! and content-addresses them with SHA-256.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::types::{DesiredStateSnapshot, Revision};

/// Errors returned by a desired-state provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no desired state for application: {0}")]
    NotFound(String),

    /// Retried by the scheduler on its next tick.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// Blocks planning until the configuration is corrected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Yields the latest desired-state snapshot of an application.
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    async fn snapshot(&self, application_id: &str) -> Result<DesiredStateSnapshot, ProviderError>;
}

/// Serves desired state from `<root>/<application-id>/*.toml`.
///
/// Files are read in name order. The revision is the hex SHA-256 of every
/// file name and content, so identical trees always produce the same
/// revision. Top-level tables of all files are merged into one payload;
/// a key defined in two files is a configuration error.
#[derive(Debug, Clone)]
pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn manifest_files(&self, dir: &Path) -> Result<Vec<PathBuf>, ProviderError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ProviderError::TransientFetch(format!("{}: {e}", dir.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProviderError::TransientFetch(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DesiredStateProvider for FileProvider {
    async fn snapshot(&self, application_id: &str) -> Result<DesiredStateSnapshot, ProviderError> {
        if application_id.is_empty()
            || application_id.contains(['/', '\\'])
            || application_id.starts_with('.')
        {
            return Err(ProviderError::InvalidConfig(format!(
                "application id {application_id:?} is not a valid directory name"
            )));
        }

        let dir = self.root.join(application_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ProviderError::NotFound(application_id.to_string()));
        }

        let files = self.manifest_files(&dir).await?;
        if files.is_empty() {
            return Err(ProviderError::InvalidConfig(format!(
                "{} contains no .toml manifests",
                dir.display()
            )));
        }

        let mut hasher = Sha256::new();
        let mut merged = toml::Table::new();
        for path in &files {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ProviderError::TransientFetch(format!("{}: {e}", path.display())))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());

            let table: toml::Table = toml::from_str(&content)
                .map_err(|e| ProviderError::InvalidConfig(format!("{name}: {e}")))?;
            for (key, value) in table {
                if merged.contains_key(&key) {
                    return Err(ProviderError::InvalidConfig(format!(
                        "{name}: key `{key}` is defined in more than one manifest"
                    )));
                }
                merged.insert(key, value);
            }
        }

        let revision: Revision = hex::encode(hasher.finalize());
        let payload = serde_json::to_value(&merged)
            .map_err(|e| ProviderError::InvalidConfig(e.to_string()))?;

        debug!(application = %application_id, %revision, files = files.len(), "desired state loaded");
        Ok(DesiredStateSnapshot {
            application_id: application_id.to_string(),
            revision,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn snapshot_is_content_addressed() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("web");
        write(&app, "workload.toml", "[workload]\nimage = \"web:v1\"\n");
        write(&app, "config.toml", "[config]\nlog_level = \"info\"\n");

        let provider = FileProvider::new(root.path());
        let first = provider.snapshot("web").await.unwrap();
        let second = provider.snapshot("web").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.revision.len(), 64);
        assert_eq!(first.payload["workload"]["image"], "web:v1");
        assert_eq!(first.payload["config"]["log_level"], "info");

        write(&app, "workload.toml", "[workload]\nimage = \"web:v2\"\n");
        let changed = provider.snapshot("web").await.unwrap();
        assert_ne!(changed.revision, first.revision);
    }

    #[tokio::test]
    async fn missing_application_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(root.path());
        let err = provider.snapshot("nope").await.unwrap_err();
        assert_eq!(err, ProviderError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn malformed_manifest_is_invalid_config() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("api"), "app.toml", "[workload\nimage = ");
        let provider = FileProvider::new(root.path());
        let err = provider.snapshot("api").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn duplicate_keys_across_files_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("api");
        write(&app, "a.toml", "[workload]\nimage = \"a\"\n");
        write(&app, "b.toml", "[workload]\nimage = \"b\"\n");
        let provider = FileProvider::new(root.path());
        let err = provider.snapshot("api").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(root.path());
        let err = provider.snapshot("../etc").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(_)));
    }
}
