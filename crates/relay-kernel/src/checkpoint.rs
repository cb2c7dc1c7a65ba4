use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{Channel, ChannelValue, ChannelVersions};
use crate::message::Message;
use crate::now_ms;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);

/// Opaque checkpoint identifier. Generated ids sort in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Millisecond clock shifted left with a 12-bit counter; never repeats or
    /// goes backwards within a process even if the wall clock does.
    pub fn generate() -> Self {
        let now = now_ms() << 12;
        let previous = LAST_ISSUED
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let issued = now.max(previous + 1);
        Self(format!("{issued:020}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CheckpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Reasoning,
    ToolExec,
    Terminal,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::ToolExec => "tool_exec",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub v: u32,
    pub id: CheckpointId,
    pub ts_ms: u64,
    #[serde(default)]
    pub channel_values: BTreeMap<Channel, ChannelValue>,
    #[serde(default)]
    pub channel_versions: ChannelVersions,
}

impl Checkpoint {
    pub fn new(id: CheckpointId) -> Self {
        Self {
            v: CHECKPOINT_FORMAT_VERSION,
            id,
            ts_ms: now_ms(),
            channel_values: BTreeMap::new(),
            channel_versions: ChannelVersions::new(),
        }
    }

    pub fn value(&self, channel: Channel) -> Option<&ChannelValue> {
        self.channel_values.get(&channel)
    }

    pub fn messages(&self) -> &[Message] {
        self.value(Channel::Messages)
            .map(ChannelValue::as_messages)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    Input,
    Loop,
    Update,
}

impl CheckpointSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Loop => "loop",
            Self::Update => "update",
        }
    }
}

/// Provenance recorded alongside each checkpoint. `next` is the node a resumed
/// run re-enters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    pub step: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
    pub next: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CheckpointMetadata {
    pub fn new(source: CheckpointSource, step: i64, next: NodeKind) -> Self {
        Self {
            source,
            step,
            writer: None,
            next,
            run_id: None,
            extra: BTreeMap::new(),
        }
    }

    /// Equality match of every filter key against the serialized metadata.
    pub fn matches(&self, filter: &BTreeMap<String, Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// Address of a thread head (`checkpoint_id` absent) or of one exact checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_namespace(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    pub fn at(&self, checkpoint_id: CheckpointId) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint_id),
        }
    }

    pub fn head(&self) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub task_path: String,
    pub channel: Channel,
    pub value: ChannelValue,
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_config: Option<CheckpointConfig>,
    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,
}
