use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_kernel::sse::{SseDecoder, SseFrame};
use relay_kernel::ToolSpec;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::debug;

use crate::runtime::{handler_fn, ToolInvocation, ToolRegistry};
use crate::{ToolError, ToolResultEnvelope};

/// JSON-RPC client for a remote MCP server over streamable HTTP. Responses may
/// arrive as a plain JSON document or as an SSE stream carrying it.
pub struct McpClient {
    http: reqwest::Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Headers sent on every request (e.g. a static API key).
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let response = self.rpc("tools/list", json!({}), &BTreeMap::new()).await?;
        if let Some(error) = response.get("error") {
            return Err(ToolError::Protocol(format!("tools/list failed: {error}")));
        }
        let tools = response
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::Protocol("tools/list result has no tools".into()))?;

        Ok(tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?;
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let mut spec = ToolSpec::new(name, description);
                if let Some(schema) = tool.get("inputSchema").filter(|v| v.is_object()) {
                    spec = spec.with_parameters(schema.clone());
                }
                Some(spec)
            })
            .collect())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<ToolResultEnvelope, ToolError> {
        let response = self
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                headers,
            )
            .await?;
        ToolResultEnvelope::from_jsonrpc(&response)
    }

    async fn rpc(
        &self,
        method: &str,
        params: Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body);
        for (key, value) in self.headers.iter().chain(headers.iter()) {
            request = request.header(key.as_str(), value.as_str());
        }

        debug!(endpoint = %self.endpoint, method, id, "mcp request");
        let response = request
            .send()
            .await
            .map_err(|err| ToolError::Transport(err.to_string()))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response
            .text()
            .await
            .map_err(|err| ToolError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(ToolError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }
        decode_body(&content_type, &text, id)
    }
}

/// Picks the JSON-RPC response for `id` out of a JSON or SSE body.
fn decode_body(content_type: &str, body: &str, id: u64) -> Result<Value, ToolError> {
    if !content_type.starts_with("text/event-stream") {
        return serde_json::from_str(body)
            .map_err(|err| ToolError::Protocol(format!("invalid json response: {err}")));
    }

    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(body);
    frames.extend(decoder.finish());

    let mut fallback = None;
    for frame in frames {
        let SseFrame::Json { data, .. } = frame else {
            continue;
        };
        let is_response = data.get("result").is_some() || data.get("error").is_some();
        if !is_response {
            continue;
        }
        if data.get("id").and_then(Value::as_u64) == Some(id) {
            return Ok(data);
        }
        fallback = Some(data);
    }
    fallback.ok_or_else(|| ToolError::Protocol("event stream carried no JSON-RPC response".into()))
}

/// Binds each remote tool into `registry`; invocations forward their caller headers.
pub fn register_mcp_tools(registry: &ToolRegistry, client: Arc<McpClient>, specs: Vec<ToolSpec>) {
    for spec in specs {
        let client = client.clone();
        let remote_name = spec.name.clone();
        registry.register(
            spec,
            handler_fn(move |invocation: ToolInvocation| {
                let client = client.clone();
                let remote_name = remote_name.clone();
                async move {
                    client
                        .call_tool(&remote_name, invocation.args, &invocation.headers)
                        .await
                }
            }),
        );
    }
}
