//! Caller-facing façade over one [`GraphEngine`].
//!
//! Runs on the same thread id are serialized through [`ThreadLocks`]; runs on
//! different threads proceed concurrently. Streaming runs carry their guard
//! inside the returned [`EngineStream`], so a disconnected caller releases the
//! thread as soon as the stream is dropped.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use relay_kernel::{CheckpointId, CheckpointTuple, Message, ToolCall, ToolSpec, UiEvent};
use relay_provider::{ChatCompletionsClient, ReasoningService};
use relay_store::{
    CheckpointStore, FragmentCompat, JsonCodec, ListQuery, MemoryStore, SqliteStore, StoreError,
};
use relay_tools::{register_mcp_tools, McpClient, ToolRegistry, ToolRunner};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{ApiKeySource, RelayConfig, StoreConfig};
use crate::error::RunnerError;
use crate::graph::{ClientToolResult, EventSink, GraphEngine, RunContext, RunInput, RunOutput};
use crate::stream::EngineStream;
use crate::thread_lock::{ThreadGuard, ThreadLocks};
use crate::transport::DEFAULT_HEARTBEAT;

pub const END_USER_HEADER: &str = "x-end-user-id";
pub const USER_AUTHORIZATION_HEADER: &str = "x-user-authorization";

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub message: String,
    /// A fresh UUID v4 thread is started when absent.
    pub thread_id: Option<String>,
    /// Forwarded to remote tools; `x-end-user-id` is also recorded in checkpoint metadata.
    pub extra_headers: BTreeMap<String, String>,
    pub client_tools: Vec<ToolSpec>,
    /// Results for client tool calls the thread is suspended on.
    pub tool_results: Vec<ClientToolResult>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn on_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_tool_results(mut self, results: Vec<ClientToolResult>) -> Self {
        self.tool_results = results;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RunResult {
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<Message>,
    pub thread_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_user_id: Option<String>,
    /// Text of the last assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_message: Option<String>,
    /// Client tool calls awaiting results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub interrupt: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub ui_events: Vec<UiEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub checkpoint_id: Option<CheckpointId>,
}

impl RunResult {
    fn from_output(output: RunOutput, end_user_id: Option<String>) -> Self {
        let final_message = output
            .messages
            .iter()
            .rev()
            .find(|message| matches!(message, Message::Assistant { .. }))
            .map(|message| message.content().to_string())
            .filter(|content| !content.is_empty());
        Self {
            thread_id: output.thread_id,
            run_id: output.run_id,
            end_user_id,
            final_message,
            interrupt: output.interrupt,
            ui_events: output.ui_events,
            checkpoint_id: output.checkpoint.and_then(|config| config.checkpoint_id),
            messages: output.messages,
        }
    }
}

pub struct Runner {
    engine: Arc<GraphEngine>,
    locks: ThreadLocks,
    heartbeat: Duration,
    closed: AtomicBool,
}

impl Runner {
    pub fn new(engine: GraphEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            locks: ThreadLocks::new(),
            heartbeat: DEFAULT_HEARTBEAT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Opens the store, connects the reasoning service and registers every
    /// reachable MCP server's tools. Unreachable MCP servers are skipped.
    pub async fn from_config(config: &RelayConfig) -> Result<Self, RunnerError> {
        let provider = config.provider_config().ok_or_else(|| {
            RunnerError::Validation(
                "no reasoning endpoint configured (provider.endpoint or RELAY_ENDPOINT)".into(),
            )
        })?;
        let reasoner: Arc<dyn ReasoningService> = Arc::new(ChatCompletionsClient::new(provider));
        let store = open_store(config)?;

        let registry = Arc::new(ToolRegistry::default());
        for (name, server) in &config.mcp_servers {
            let mut headers = server.headers.clone();
            if let Some(key) = server.api_key.as_ref().and_then(ApiKeySource::resolve) {
                headers.insert("authorization".to_string(), format!("Bearer {key}"));
            }
            let client = Arc::new(McpClient::new(server.url.clone()).with_headers(headers));
            match client.list_tools().await {
                Ok(specs) => {
                    info!(server = %name, tools = specs.len(), "registered mcp tools");
                    register_mcp_tools(&registry, client, specs);
                }
                Err(err) => warn!(server = %name, url = %server.url, %err, "skipping mcp server"),
            }
        }

        let options = config.engine_options();
        let tools = ToolRunner::new(registry, config.tool_concurrency())
            .with_default_timeout(options.tool_timeout_ms);
        let engine = GraphEngine::new(store, reasoner, Arc::new(tools), options);
        Ok(Self::new(engine).with_heartbeat(config.heartbeat()))
    }

    pub fn engine(&self) -> &Arc<GraphEngine> {
        &self.engine
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drives the thread to TERMINAL and returns its final state.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, RunnerError> {
        let (ctx, end_user_id) = self.prepare(request)?;
        let _guard = self.lock(&ctx.thread_id).await?;
        let sink = EventSink::detached(&ctx);
        let output = self.engine.execute(ctx, sink).await?;
        Ok(RunResult::from_output(output, end_user_id))
    }

    /// Same as [`Runner::run`] but exposes every intermediate event. Input is
    /// validated before the stream is returned.
    pub fn stream(&self, request: RunRequest) -> Result<EngineStream, RunnerError> {
        let (ctx, _) = self.prepare(request)?;
        let (sender, events) = mpsc::unbounded_channel();
        let sink = EventSink::new(&ctx, sender);
        let engine = self.engine.clone();
        let locks = self.locks.clone();

        Ok(EngineStream::new(
            async move {
                let _guard = locks
                    .acquire(&ctx.thread_id)
                    .await
                    .ok_or(RunnerError::Closed)?;
                Ok(engine.execute(ctx, sink).await?)
            },
            events,
        ))
    }

    /// Re-enters a thread at its latest checkpoint without new input, e.g. after
    /// a crash between tool execution and the next reasoning step.
    pub async fn resume(
        &self,
        thread_id: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<RunResult, RunnerError> {
        self.ensure_open()?;
        let config = self.engine.thread_config(thread_id);
        if self.engine.store().get_tuple(&config).await?.is_none() {
            return Err(RunnerError::Validation(format!(
                "thread {thread_id} has no checkpoints"
            )));
        }

        let end_user_id = headers.get(END_USER_HEADER).cloned();
        let mut ctx = RunContext::new(thread_id, Uuid::new_v4().to_string());
        ctx.metadata = end_user_metadata(end_user_id.as_deref());
        ctx.headers = headers;

        let _guard = self.lock(thread_id).await?;
        let sink = EventSink::detached(&ctx);
        let output = self.engine.resume(ctx, sink).await?;
        Ok(RunResult::from_output(output, end_user_id))
    }

    /// Checkpoints of one thread, newest first.
    pub async fn history(
        &self,
        thread_id: &str,
        query: ListQuery,
    ) -> Result<Vec<CheckpointTuple>, RunnerError> {
        self.ensure_open()?;
        let config = self.engine.thread_config(thread_id);
        Ok(self.engine.store().list(Some(&config), &query).await?)
    }

    /// Releases the store and the reasoning client. Idempotent; pending and
    /// later runs fail with [`RunnerError::Closed`].
    pub async fn close(&self) -> Result<(), RunnerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing runner");
        self.locks.close();
        if let Err(err) = self.engine.reasoner().close().await {
            warn!(%err, "reasoning service did not close cleanly");
        }
        self.engine.store().close().await?;
        Ok(())
    }

    /// Runs `f` and closes the runner afterwards, whether `f` returns, fails or panics.
    pub async fn scope<F, Fut, T>(self: Arc<Self>, f: F) -> Result<T, RunnerError>
    where
        F: FnOnce(Arc<Runner>) -> Fut,
        Fut: Future<Output = Result<T, RunnerError>>,
    {
        let outcome = AssertUnwindSafe(f(self.clone())).catch_unwind().await;
        let closed = self.close().await;
        match outcome {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Err(err)) => {
                if let Err(close_err) = closed {
                    warn!(%close_err, "close failed after run error");
                }
                Err(err)
            }
            Ok(Ok(value)) => closed.map(|()| value),
        }
    }

    fn ensure_open(&self) -> Result<(), RunnerError> {
        if self.is_closed() {
            return Err(RunnerError::Closed);
        }
        Ok(())
    }

    async fn lock(&self, thread_id: &str) -> Result<ThreadGuard, RunnerError> {
        self.locks
            .acquire(thread_id)
            .await
            .ok_or(RunnerError::Closed)
    }

    fn prepare(&self, request: RunRequest) -> Result<(RunContext, Option<String>), RunnerError> {
        self.ensure_open()?;
        let input = RunInput {
            message: Some(request.message).filter(|text| !text.trim().is_empty()),
            tool_results: request.tool_results,
        };
        if input.is_empty() {
            return Err(RunnerError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let thread_id = match request.thread_id {
            Some(id) if id.trim().is_empty() => {
                return Err(RunnerError::Validation(
                    "thread_id must not be blank".to_string(),
                ))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let end_user_id = request.extra_headers.get(END_USER_HEADER).cloned();
        let mut ctx = RunContext::new(thread_id, Uuid::new_v4().to_string()).with_input(input);
        ctx.metadata = end_user_metadata(end_user_id.as_deref());
        ctx.headers = request.extra_headers;
        ctx.client_tools = request.client_tools;
        Ok((ctx, end_user_id))
    }
}

fn end_user_metadata(end_user_id: Option<&str>) -> BTreeMap<String, serde_json::Value> {
    end_user_id
        .map(|id| BTreeMap::from([("end_user_id".to_string(), id.into())]))
        .unwrap_or_default()
}

fn open_store(config: &RelayConfig) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    let legacy = matches!(
        config.store,
        StoreConfig::Sqlite {
            legacy_fragments: true,
            ..
        }
    );
    let store: Arc<dyn CheckpointStore> = match config.sqlite_path() {
        None => Arc::new(MemoryStore::new()),
        Some(path) if legacy => Arc::new(SqliteStore::open_with_codec(
            &path,
            FragmentCompat::new(JsonCodec),
        )?),
        Some(path) => Arc::new(SqliteStore::open(&path)?),
    };
    Ok(store)
}
