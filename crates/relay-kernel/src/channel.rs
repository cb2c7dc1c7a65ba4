use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, ToolCall};

/// Named slots of accumulated run state. The set is closed; storage layout and
/// write semantics are decided per channel, never per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Messages,
    UiEvents,
    Step,
    Error,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Last write wins; retries overwrite.
    Replace,
    /// Every write is kept in arrival order.
    Append,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Messages,
        Channel::UiEvents,
        Channel::Step,
        Channel::Error,
        Channel::Interrupt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::UiEvents => "ui_events",
            Self::Step => "step",
            Self::Error => "error",
            Self::Interrupt => "interrupt",
        }
    }

    pub fn write_mode(self) -> WriteMode {
        match self {
            Self::Messages | Self::UiEvents => WriteMode::Append,
            Self::Step | Self::Error | Self::Interrupt => WriteMode::Replace,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == raw)
            .ok_or_else(|| format!("unknown channel '{raw}'"))
    }
}

/// Component event surfaced to the caller's UI, produced by structured tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub props: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ChannelValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Messages(Vec<Message>),
    UiEvents(Vec<UiEvent>),
    ToolCalls(Vec<ToolCall>),
}

impl ChannelValue {
    /// Scalars live inside the checkpoint row; composites are stored as versioned blobs.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Text(_)
        )
    }

    pub fn as_messages(&self) -> &[Message] {
        match self {
            Self::Messages(messages) => messages,
            _ => &[],
        }
    }

    pub fn as_ui_events(&self) -> &[UiEvent] {
        match self {
            Self::UiEvents(events) => events,
            _ => &[],
        }
    }

    pub fn as_tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::ToolCalls(calls) => calls,
            _ => &[],
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Folds `incoming` into `self` following the channel's write mode. Appended
    /// messages with an id already present replace the earlier entry.
    pub fn merge(&mut self, incoming: ChannelValue, mode: WriteMode) {
        if mode == WriteMode::Replace {
            *self = incoming;
            return;
        }
        match (self, incoming) {
            (Self::Messages(current), Self::Messages(incoming)) => {
                for message in incoming {
                    match current.iter_mut().find(|m| m.id() == message.id()) {
                        Some(existing) => *existing = message,
                        None => current.push(message),
                    }
                }
            }
            (Self::UiEvents(current), Self::UiEvents(incoming)) => {
                for event in incoming {
                    match current.iter_mut().find(|e| e.id == event.id) {
                        Some(existing) => *existing = event,
                        None => current.push(event),
                    }
                }
            }
            (Self::ToolCalls(current), Self::ToolCalls(incoming)) => current.extend(incoming),
            (current, incoming) => *current = incoming,
        }
    }
}

/// Monotonic per-channel version; zero padded so string order matches numeric order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelVersion(String);

pub type ChannelVersions = BTreeMap<Channel, ChannelVersion>;

impl ChannelVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn next_after(previous: Option<&ChannelVersion>) -> Self {
        let current = previous.map(ChannelVersion::ordinal).unwrap_or(0);
        Self(format!("{:020}", current + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn ordinal(&self) -> u64 {
        self.0
            .split('.')
            .next()
            .and_then(|head| head.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
