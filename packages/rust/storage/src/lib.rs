//! Per-node artifact storage.
//!
//! Generated annotations are persisted one artifact per outline node so an
//! interrupted run can resume where it stopped. Every store is write-once:
//! [`AnnotationStore::put`] never replaces an existing artifact.
//!
//! Two backends are provided:
//! - [`FsAnnotationStore`]: one JSON file per node in a directory
//! - [`LibsqlAnnotationStore`]: a table in a local libSQL database

mod db;
mod fs;
mod migrations;

use async_trait::async_trait;
use mls_outline::KeyEntry;
use mls_shared::{NodeArtifact, Result};

pub use db::LibsqlAnnotationStore;
pub use fs::FsAnnotationStore;

/// Keyed, write-once store of [`NodeArtifact`]s.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Whether an artifact exists for `node_id`.
    async fn has(&self, node_id: &str) -> Result<bool>;

    /// Load the artifact for `node_id`, if any.
    async fn get(&self, node_id: &str) -> Result<Option<NodeArtifact>>;

    /// Persist `artifact` under `node_id`.
    ///
    /// Returns `false` and leaves the store untouched if an artifact already
    /// exists for that key.
    async fn put(&self, node_id: &str, artifact: &NodeArtifact) -> Result<bool>;

    /// Check that every key in `keys` maps to its own artifact.
    ///
    /// Keyed backends accept any set of distinct keys; backends that derive
    /// names from keys override this.
    fn check_keys(&self, _keys: &[KeyEntry]) -> Result<()> {
        Ok(())
    }
}
