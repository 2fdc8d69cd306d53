//! Directory-backed artifact store: one `<stem>.json` file per node.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use mls_outline::{KeyEntry, check_file_stems, file_stem};
use mls_shared::{MlsError, NodeArtifact, Result};

use crate::AnnotationStore;

/// Stores each artifact as pretty-printed JSON named after the node key's
/// [`file_stem`] (`section-1.2` is stored as `section-1-2.json`).
#[derive(Debug, Clone)]
pub struct FsAnnotationStore {
    dir: PathBuf,
}

impl FsAnnotationStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| MlsError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact file for `node_id`.
    pub fn artifact_path(&self, node_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(node_id)))
    }
}

#[async_trait]
impl AnnotationStore for FsAnnotationStore {
    async fn has(&self, node_id: &str) -> Result<bool> {
        let path = self.artifact_path(node_id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| MlsError::io(&path, e))
    }

    async fn get(&self, node_id: &str) -> Result<Option<NodeArtifact>> {
        let path = self.artifact_path(node_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MlsError::io(&path, e)),
        };

        let artifact = serde_json::from_str(&content).map_err(|e| {
            MlsError::parse(format!("invalid artifact {}: {e}", path.display()))
        })?;
        Ok(Some(artifact))
    }

    async fn put(&self, node_id: &str, artifact: &NodeArtifact) -> Result<bool> {
        let path = self.artifact_path(node_id);
        if self.has(node_id).await? {
            debug!(node = node_id, ?path, "artifact exists, not overwriting");
            return Ok(false);
        }

        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| MlsError::Storage(format!("failed to serialize artifact: {e}")))?;

        // Temp file, then hard-link into place; the link fails if the target exists.
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_stem(node_id), Uuid::now_v7()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| MlsError::io(&tmp, e))?;
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                debug!(node = node_id, ?path, "artifact written");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(node = node_id, ?path, "artifact appeared concurrently, not overwriting");
                Ok(false)
            }
            Err(e) => Err(MlsError::io(&path, e)),
        }
    }

    fn check_keys(&self, keys: &[KeyEntry]) -> Result<()> {
        check_file_stems(keys)
    }
}
