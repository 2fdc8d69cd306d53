//! libSQL-backed artifact store (local file, offline mode).

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{debug, info};

use mls_shared::{MlsError, NodeArtifact, Result};

use crate::{AnnotationStore, migrations};

/// Artifacts stored as JSON rows in the `node_artifacts` table.
pub struct LibsqlAnnotationStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl LibsqlAnnotationStore {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MlsError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| MlsError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| MlsError::Storage(e.to_string()))?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    MlsError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Number of stored artifacts.
    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM node_artifacts", params![])
            .await
            .map_err(|e| MlsError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| MlsError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(MlsError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl AnnotationStore for LibsqlAnnotationStore {
    async fn has(&self, node_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM node_artifacts WHERE node_id = ?1",
                params![node_id],
            )
            .await
            .map_err(|e| MlsError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(MlsError::Storage(e.to_string())),
        }
    }

    async fn get(&self, node_id: &str) -> Result<Option<NodeArtifact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT artifact_json FROM node_artifacts WHERE node_id = ?1",
                params![node_id],
            )
            .await
            .map_err(|e| MlsError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(|e| MlsError::Storage(e.to_string()))?;
                let artifact = serde_json::from_str(&json).map_err(|e| {
                    MlsError::parse(format!("invalid artifact for '{node_id}': {e}"))
                })?;
                Ok(Some(artifact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(MlsError::Storage(e.to_string())),
        }
    }

    async fn put(&self, node_id: &str, artifact: &NodeArtifact) -> Result<bool> {
        let json = serde_json::to_string(artifact)
            .map_err(|e| MlsError::Storage(format!("failed to serialize artifact: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let inserted = self
            .conn
            .execute(
                "INSERT INTO node_artifacts (node_id, artifact_json, model_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node_id) DO NOTHING",
                params![node_id, json.as_str(), artifact.model.as_deref(), now.as_str()],
            )
            .await
            .map_err(|e| MlsError::Storage(e.to_string()))?;

        debug!(node = node_id, written = inserted > 0, "artifact put");
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("mls_test_{}.db", Uuid::now_v7()))
    }

    async fn test_store() -> (LibsqlAnnotationStore, PathBuf) {
        let path = temp_db();
        let store = LibsqlAnnotationStore::open(&path).await.expect("open test db");
        (store, path)
    }

    /// Remove the database file and its journal siblings.
    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(name));
        }
    }

    fn artifact(node_id: &str, summary: &str) -> NodeArtifact {
        NodeArtifact {
            node_id: node_id.into(),
            annotation: json!({"content_summary": summary}),
            model: Some("gemini-2.0-flash".into()),
            excerpt_sha256: Some("abc123".into()),
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let (store, path) = test_store().await;
        assert_eq!(store.schema_version().await, 1);

        drop(store);
        cleanup(&path);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let path = temp_db();
        let first = LibsqlAnnotationStore::open(&path).await.expect("first open");
        drop(first);
        let second = LibsqlAnnotationStore::open(&path).await.expect("second open");
        assert_eq!(second.schema_version().await, 1);

        drop(second);
        cleanup(&path);
    }

    #[tokio::test]
    async fn put_get_has() {
        let (store, path) = test_store().await;
        assert!(!store.has("section-1.1").await.unwrap());
        assert!(store.get("section-1.1").await.unwrap().is_none());

        let written = artifact("section-1.1", "homage");
        assert!(store.put("section-1.1", &written).await.unwrap());

        assert!(store.has("section-1.1").await.unwrap());
        assert_eq!(store.get("section-1.1").await.unwrap(), Some(written));
        assert_eq!(store.count().await.unwrap(), 1);

        drop(store);
        cleanup(&path);
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let (store, path) = test_store().await;
        assert!(store.put("chapter-1", &artifact("chapter-1", "first")).await.unwrap());
        assert!(!store.put("chapter-1", &artifact("chapter-1", "second")).await.unwrap());

        let stored = store.get("chapter-1").await.unwrap().unwrap();
        assert_eq!(stored.annotation["content_summary"], "first");
        assert_eq!(store.count().await.unwrap(), 1);

        drop(store);
        cleanup(&path);
    }

    #[tokio::test]
    async fn keys_with_equal_file_stems_are_accepted() {
        let (store, path) = test_store().await;
        let keys = [
            mls_outline::KeyEntry {
                key: "section-1.2".into(),
                path: "[0]".into(),
            },
            mls_outline::KeyEntry {
                key: "section-1-2".into(),
                path: "[1]".into(),
            },
        ];
        assert!(store.check_keys(&keys).is_ok());
        assert!(store.put("section-1.2", &artifact("section-1.2", "a")).await.unwrap());
        assert!(store.put("section-1-2", &artifact("section-1-2", "b")).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);

        drop(store);
        cleanup(&path);
    }
}
