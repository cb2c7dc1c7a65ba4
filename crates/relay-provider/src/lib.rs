//! Reasoning service boundary: messages in, one assistant turn out.

mod chat;
mod error;

use async_trait::async_trait;
use relay_kernel::{Message, ToolCall, ToolSpec};

pub use chat::{ChatCompletionsClient, ChatCompletionsConfig};
pub use error::ProviderError;

#[derive(Debug, Clone, Default)]
pub struct ReasoningRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl ReasoningRequest {
    pub fn new(messages: Vec<Message>, tools: Vec<ToolSpec>) -> Self {
        Self { messages, tools }
    }
}

/// Final output of one reasoning call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn into_message(self) -> Message {
        Message::assistant(self.content, self.tool_calls)
    }
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Runs one reasoning call. Incremental text is reported through
    /// `on_delta` before the assembled turn is returned.
    async fn respond(
        &self,
        request: ReasoningRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AssistantTurn, ProviderError>;

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
