//! Durable checkpoint ledger.
//!
//! Checkpoints are keyed by `(thread_id, checkpoint_ns, checkpoint_id)` and
//! linked to their parent. Composite channel values are stored out of line as
//! versioned blobs; scalars stay inline in the checkpoint row. Every backend
//! applies the same split so readers never observe it.

mod codec;
mod error;
mod memory;
mod split;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use relay_kernel::{
    Channel, ChannelValue, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointTuple,
};
use serde_json::Value;

pub use codec::{FragmentCompat, JsonCodec, PayloadCodec};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Metadata field -> expected JSON value; every entry must match.
    pub filter: BTreeMap<String, Value>,
    /// Only checkpoints whose id sorts strictly before this one.
    pub before: Option<CheckpointId>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn before(mut self, checkpoint_id: CheckpointId) -> Self {
        self.before = Some(checkpoint_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stores `checkpoint` as a child of `config.checkpoint_id` (the head the
    /// caller observed). Blobs for `new_versions` are written before the row;
    /// repeating the call with the same checkpoint rewrites the same row.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
        new_versions: &ChannelVersions,
    ) -> Result<CheckpointConfig, StoreError>;

    /// Records task output against `config.checkpoint_id`. Batches touching only
    /// replace-mode channels upsert per `(task_id, channel)`; anything else is
    /// appended in arrival order.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(Channel, ChannelValue)],
        task_id: &str,
        task_path: &str,
    ) -> Result<(), StoreError>;

    /// Exact checkpoint when `config.checkpoint_id` is set, otherwise the newest
    /// one for the thread and namespace.
    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError>;

    /// Newest first. `None` lists across every thread.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        query: &ListQuery,
    ) -> Result<Vec<CheckpointTuple>, StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
