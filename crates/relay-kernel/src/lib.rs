mod channel;
mod checkpoint;
mod message;
pub mod sse;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use channel::{Channel, ChannelValue, ChannelVersion, ChannelVersions, UiEvent, WriteMode};
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, NodeKind, PendingWrite, CHECKPOINT_FORMAT_VERSION,
};
pub use message::{Message, ToolCall, ToolSpec, ToolStatus};

/// One observable step of a run, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub thread_id: String,
    pub run_id: String,
    pub timestamp_ms: u64,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    NodeStarted {
        node: NodeKind,
        step: i64,
    },
    ReasoningDelta {
        delta: String,
    },
    ToolStarted {
        call_id: String,
        name: String,
        args: Value,
    },
    ToolFinished {
        call_id: String,
        name: String,
        status: ToolStatus,
        duration_ms: u64,
    },
    CheckpointSaved {
        checkpoint_id: CheckpointId,
        step: i64,
        next: NodeKind,
    },
    Interrupted {
        tool_calls: Vec<ToolCall>,
    },
    RunFinished {
        reason: String,
    },
}

impl Event {
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        seq: u64,
        kind: EventKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            timestamp_ms: now_ms(),
            seq,
            kind,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
