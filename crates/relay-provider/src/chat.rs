use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_kernel::sse::{SseDecoder, SseFrame};
use relay_kernel::{Message, ToolCall, ToolSpec};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AssistantTurn, ProviderError, ReasoningRequest, ReasoningService};

#[derive(Clone, Debug)]
pub struct ChatCompletionsConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

impl ChatCompletionsConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
            temperature: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// Streaming client for OpenAI-compatible `chat/completions` endpoints.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    config: ChatCompletionsConfig,
    closed: AtomicBool,
}

impl ChatCompletionsClient {
    pub fn new(config: ChatCompletionsConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: ChatCompletionsConfig) -> Self {
        Self {
            http,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ChatCompletionsConfig {
        &self.config
    }

    pub fn build_payload(&self, request: &ReasoningRequest) -> Value {
        let mut payload = json!({
            "messages": request.messages.iter().map(message_param).collect::<Vec<_>>(),
            "stream": true,
        });
        if let Some(model) = self.config.model.as_deref() {
            payload["model"] = Value::String(model.to_string());
        }
        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(request.tools.iter().map(tool_param).collect());
        }
        payload
    }
}

#[async_trait]
impl ReasoningService for ChatCompletionsClient {
    async fn respond(
        &self,
        request: ReasoningRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AssistantTurn, ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }

        let payload = self.build_payload(&request);
        let mut http_request = self.http.post(&self.config.endpoint).json(&payload);
        if let Some(key) = self.config.api_key.as_deref() {
            http_request = http_request.bearer_auth(key);
        }

        debug!(
            endpoint = %self.config.endpoint,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "reasoning request"
        );
        let response = http_request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "reasoning service rejected request");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_event_stream {
            let body: Value = response
                .json()
                .await
                .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
            let turn = turn_from_completion(&body)?;
            if !turn.content.is_empty() {
                on_delta(&turn.content);
            }
            return Ok(turn);
        }

        let mut collector = TurnCollector::default();
        let mut decoder = SseDecoder::new();
        let mut utf8_buf = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(next) = stream.next().await {
            let chunk = next.map_err(|err| ProviderError::Transport(err.to_string()))?;
            utf8_buf.extend_from_slice(&chunk);
            let text = take_utf8(&mut utf8_buf);
            for frame in decoder.push(&text) {
                collector.apply(frame, on_delta)?;
            }
            if collector.done {
                break;
            }
        }
        if !collector.done {
            for frame in decoder.finish() {
                collector.apply(frame, on_delta)?;
            }
        }
        collector.finish()
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn message_param(message: &Message) -> Value {
    match message {
        Message::System { content, .. } => json!({ "role": "system", "content": content }),
        Message::User { content, .. } => json!({ "role": "user", "content": content }),
        Message::Assistant {
            content,
            tool_calls,
            ..
        } => {
            let mut value = json!({ "role": "assistant", "content": content });
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            value
        }
        Message::Tool {
            tool_call_id,
            content,
            ..
        } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
    }
}

fn tool_param(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialCall {
    fn into_call(self, index: u64) -> Result<ToolCall, ProviderError> {
        if self.name.is_empty() {
            return Err(ProviderError::InvalidResponse(format!(
                "tool call {index} has no name"
            )));
        }
        let id = if self.id.is_empty() {
            format!("call_{}", Uuid::new_v4().simple())
        } else {
            self.id
        };
        let arguments = parse_arguments(&self.arguments)?;
        Ok(ToolCall::new(id, self.name, arguments))
    }
}

/// Accumulates streamed chunks; tool-call fragments are keyed by their `index`.
#[derive(Default)]
struct TurnCollector {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

impl TurnCollector {
    fn apply(
        &mut self,
        frame: SseFrame,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), ProviderError> {
        match frame {
            SseFrame::Done => {
                self.done = true;
                Ok(())
            }
            SseFrame::Invalid { raw, error, .. } => Err(ProviderError::InvalidResponse(format!(
                "{error}: {raw}"
            ))),
            SseFrame::Json { data, .. } => self.apply_chunk(&data, on_delta),
        }
    }

    fn apply_chunk(
        &mut self,
        chunk: &Value,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), ProviderError> {
        if let Some(error) = chunk.get("error") {
            return Err(ProviderError::InvalidResponse(format!(
                "stream error: {error}"
            )));
        }
        let Some(delta) = chunk.pointer("/choices/0/delta") else {
            return Ok(());
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                on_delta(text);
            }
        }

        if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, fragment) in fragments.iter().enumerate() {
                let index = fragment
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    entry.name.push_str(name);
                }
                if let Some(arguments) = fragment
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    entry.arguments.push_str(arguments);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<AssistantTurn, ProviderError> {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| call.into_call(index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AssistantTurn {
            content: self.content,
            tool_calls,
        })
    }
}

fn turn_from_completion(body: &Value) -> Result<AssistantTurn, ProviderError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::InvalidResponse("completion has no message".into()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let partial = PartialCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            tool_calls.push(partial.into_call(index as u64)?);
        }
    }
    Ok(AssistantTurn {
        content,
        tool_calls,
    })
}

fn parse_arguments(raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
        .map_err(|err| ProviderError::InvalidResponse(format!("tool arguments: {err}")))
}

/// Drains the decodable prefix of `buf`, keeping an incomplete trailing
/// sequence for the next chunk.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(text) => {
            let text = text.to_string();
            buf.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let tail = buf.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(buf).into_owned();
            *buf = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            text
        }
    }
}
