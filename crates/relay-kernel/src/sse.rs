//! Server-sent event framing shared by the HTTP transport, the reasoning
//! client and the MCP tool client.

use serde_json::Value;

const DONE_SENTINEL: &str = "[DONE]";

/// One dispatched frame. Non-JSON payloads are surfaced rather than dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Done,
    Json {
        event: Option<String>,
        data: Value,
    },
    Invalid {
        event: Option<String>,
        raw: String,
        error: String,
    },
}

impl SseFrame {
    fn decode(raw: String, event: Option<String>) -> Self {
        if raw == DONE_SENTINEL {
            return Self::Done;
        }
        match serde_json::from_str(&raw) {
            Ok(data) => Self::Json { event, data },
            Err(err) => Self::Invalid {
                event,
                raw,
                error: err.to_string(),
            },
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Done => None,
            Self::Json { event, .. } | Self::Invalid { event, .. } => event.as_deref(),
        }
    }
}

/// Incremental decoder; chunks may split frames (and lines) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial_line: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.partial_line.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=end).collect();
            self.feed_line(line.trim_end_matches(['\n', '\r']), &mut frames);
        }
        frames
    }

    /// Flushes a trailing frame whose blank line never arrived.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let rest = std::mem::take(&mut self.partial_line);
        if !rest.is_empty() {
            self.feed_line(rest.trim_end_matches('\r'), &mut frames);
        }
        self.dispatch(&mut frames);
        frames
    }

    fn feed_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.trim().to_string()).filter(|v| !v.is_empty()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.data).join("\n");
        frames.push(SseFrame::decode(raw, event));
    }
}

/// `event: <name>\ndata: <json>\n\n`
pub fn encode_frame(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}
