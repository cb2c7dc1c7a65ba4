use relay_kernel::ToolStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolError;

/// Result of one tool call, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultEnvelope {
    Text { text: String },
    Structured { value: Value },
    Error { message: String },
}

impl ToolResultEnvelope {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn structured(value: Value) -> Self {
        Self::Structured { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn status(&self) -> ToolStatus {
        match self {
            Self::Error { .. } => ToolStatus::Error,
            _ => ToolStatus::Success,
        }
    }

    /// Text handed back to the reasoning service as the tool message body.
    pub fn to_content(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Structured { value } => value.to_string(),
            Self::Error { message } => {
                serde_json::json!({ "ok": false, "error": message }).to_string()
            }
        }
    }

    /// Decodes a JSON-RPC `tools/call` response document.
    ///
    /// A JSON-RPC `error` or a result flagged `isError` becomes `Error`;
    /// `structuredContent` or a first text block holding a JSON document becomes
    /// `Structured`; any other first text block becomes `Text`.
    pub fn from_jsonrpc(response: &Value) -> Result<Self, ToolError> {
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Ok(Self::error(message));
        }

        let result = response
            .get("result")
            .ok_or_else(|| ToolError::Protocol("response has neither result nor error".into()))?;

        let first_text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            })
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::error(
                first_text.unwrap_or_else(|| "tool reported an error".to_string()),
            ));
        }

        if let Some(structured) = result.get("structuredContent") {
            if !structured.is_null() {
                return Ok(Self::structured(structured.clone()));
            }
        }

        match first_text {
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => Ok(Self::structured(value)),
                _ => Ok(Self::text(text)),
            },
            None => Ok(Self::text(String::new())),
        }
    }
}
