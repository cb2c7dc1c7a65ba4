use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_kernel::{ToolCall, ToolSpec};
use relay_provider::{AssistantTurn, ProviderError, ReasoningRequest, ReasoningService};
use relay_store::{CheckpointStore, MemoryStore};
use relay_tools::{handler_fn, ToolError, ToolInvocation, ToolRegistry, ToolResultEnvelope, ToolRunner};
use serde_json::json;

use crate::graph::{EngineOptions, GraphEngine};

/// Replays canned turns in order; answers "done" once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedReasoner {
    turns: Mutex<VecDeque<Result<AssistantTurn, ProviderError>>>,
    requests: Mutex<Vec<ReasoningRequest>>,
    delay: Option<Duration>,
    closed: AtomicBool,
}

impl ScriptedReasoner {
    pub(crate) fn new(turns: Vec<AssistantTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub(crate) fn failing(err: ProviderError) -> Self {
        Self {
            turns: Mutex::new(VecDeque::from([Err(err)])),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().expect("requests").clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    async fn respond(
        &self,
        request: ReasoningRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AssistantTurn, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().expect("requests").push(request);
        let next = self.turns.lock().expect("turns").pop_front();
        let turn = next.unwrap_or_else(|| Ok(AssistantTurn::text("done")))?;
        if !turn.content.is_empty() {
            on_delta(&turn.content);
        }
        Ok(turn)
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn call(id: &str, name: &str) -> ToolCall {
    ToolCall::new(id, name, json!({ "symbol": "ACME" }))
}

pub(crate) fn calls_turn(calls: Vec<ToolCall>) -> AssistantTurn {
    AssistantTurn::text("").with_tool_calls(calls)
}

/// `get_price` answers with a structured quote, `explode` always fails.
pub(crate) fn price_tools() -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::default());
    registry.register(
        ToolSpec::new("get_price", "Latest price for a symbol"),
        handler_fn(|invocation: ToolInvocation| async move {
            Ok(ToolResultEnvelope::Structured {
                value: json!({ "symbol": invocation.args["symbol"], "price": 42.5 }),
            })
        }),
    );
    registry.register(
        ToolSpec::new("explode", "Always fails"),
        handler_fn(|_invocation: ToolInvocation| async move {
            Err::<ToolResultEnvelope, _>(ToolError::Failed("quote feed offline".to_string()))
        }),
    );
    registry
}

pub(crate) fn confirm_trade() -> ToolSpec {
    ToolSpec::new("confirm_trade", "Ask the user to confirm a trade")
}

pub(crate) fn engine_with(
    store: Arc<dyn CheckpointStore>,
    reasoner: Arc<dyn ReasoningService>,
    registry: Arc<ToolRegistry>,
) -> GraphEngine {
    let options = EngineOptions {
        client_tools: vec![confirm_trade()],
        ..EngineOptions::default()
    };
    GraphEngine::new(store, reasoner, Arc::new(ToolRunner::new(registry, 4)), options)
}

pub(crate) fn memory_engine(reasoner: Arc<dyn ReasoningService>) -> GraphEngine {
    engine_with(Arc::new(MemoryStore::new()), reasoner, price_tools())
}
