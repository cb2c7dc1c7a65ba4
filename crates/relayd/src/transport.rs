use std::fmt::Display;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use relay_kernel::sse::encode_frame;
use serde::Serialize;
use serde_json::{json, Value};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// One frame of the caller-facing event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Data(Value),
    Ping,
    Completed,
    Error { message: String },
}

impl StreamFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Ping => "ping",
            Self::Completed => "event",
            Self::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Data(value) => value.clone(),
            Self::Ping => json!({ "message": "heartbeat" }),
            Self::Completed => json!({ "status": "completed" }),
            Self::Error { message } => json!({ "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn encode(&self) -> String {
        encode_frame(self.name(), &self.payload())
    }
}

/// Relays `source` as frames. Waits at most `interval` for each item and
/// emits a ping whenever it elapses. Ends with exactly one terminal frame:
/// `Completed` on exhaustion or `Error` on the first failure.
///
/// The returned stream owns `source`; dropping it drops the source at its
/// current wait.
pub fn heartbeat<S, T, E>(source: S, interval: Duration) -> impl Stream<Item = StreamFrame> + Send
where
    S: Stream<Item = Result<T, E>> + Send + Unpin + 'static,
    T: Serialize + Send,
    E: Display + Send,
{
    stream::unfold(Some(source), move |state| async move {
        let mut source = state?;
        let frame = match tokio::time::timeout(interval, source.next()).await {
            Err(_) => return Some((StreamFrame::Ping, Some(source))),
            Ok(Some(Ok(item))) => match serde_json::to_value(&item) {
                Ok(value) => return Some((StreamFrame::Data(value), Some(source))),
                Err(err) => StreamFrame::error(err.to_string()),
            },
            Ok(Some(Err(err))) => StreamFrame::error(err.to_string()),
            Ok(None) => StreamFrame::Completed,
        };
        Some((frame, None))
    })
}
