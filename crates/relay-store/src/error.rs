use relay_kernel::{Channel, CheckpointId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload encoding: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("payload codec: {0}")]
    Codec(String),

    #[error("checkpoint {id} cannot be its own parent")]
    SelfParent { id: CheckpointId },

    #[error("parent checkpoint {parent} not found in thread {thread_id}")]
    MissingParent {
        thread_id: String,
        parent: CheckpointId,
    },

    #[error("checkpoint {id} does not sort after its parent {parent}")]
    OutOfOrder {
        id: CheckpointId,
        parent: CheckpointId,
    },

    #[error("channel {channel} holds a blob value but has no version")]
    MissingVersion { channel: Channel },

    #[error("blob {channel}@{version} referenced by checkpoint {id} is not stored")]
    MissingBlob {
        id: CheckpointId,
        channel: Channel,
        version: String,
    },

    #[error("stored checkpoint {id} references blob {channel}@{version}, which is gone")]
    UnresolvedBlob {
        id: CheckpointId,
        channel: Channel,
        version: String,
    },

    #[error("pending writes need a checkpoint id")]
    MissingCheckpointId,

    #[error("checkpoint store is closed")]
    Closed,

    #[error("store worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    /// Caller supplied an inconsistent write; retrying the same call cannot succeed.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::SelfParent { .. }
                | Self::MissingParent { .. }
                | Self::OutOfOrder { .. }
                | Self::MissingVersion { .. }
                | Self::MissingBlob { .. }
                | Self::MissingCheckpointId
        )
    }
}
