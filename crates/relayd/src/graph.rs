//! Resumable reasoning / tool-execution loop.
//!
//! Every node transition ends in a checkpoint whose metadata names the node to
//! enter next, so a restarted run re-enters exactly where the last committed
//! transition left off. Tool results are recorded as pending writes against
//! the head checkpoint as they complete; a resumed tool step skips calls whose
//! results are already recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use relay_kernel::{
    Channel, ChannelValue, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointTuple, Event, EventKind,
    Message, NodeKind, ToolCall, ToolSpec, ToolStatus, UiEvent,
};
use relay_provider::{ProviderError, ReasoningRequest, ReasoningService};
use relay_store::{CheckpointStore, StoreError};
use relay_tools::{should_continue_server_side, ToolCallResult, ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_STEPS: u32 = 25;
const TOOL_TASK_PATH: &str = "tool_exec";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run exceeded {0} steps")]
    StepLimit(u32),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub system_prompt: Option<String>,
    /// Tools advertised to the reasoning service but executed by the caller.
    pub client_tools: Vec<ToolSpec>,
    pub max_steps: u32,
    pub tool_timeout_ms: Option<u64>,
    pub checkpoint_ns: String,
    pub writer: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            client_tools: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout_ms: None,
            checkpoint_ns: String::new(),
            writer: "relay".to_string(),
        }
    }
}

/// Result reported by the caller for a client-resident tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientToolResult {
    pub call_id: String,
    pub content: Value,
    #[serde(default = "default_status")]
    pub status: ToolStatus,
}

fn default_status() -> ToolStatus {
    ToolStatus::Success
}

impl ClientToolResult {
    pub fn new(call_id: impl Into<String>, content: Value) -> Self {
        Self {
            call_id: call_id.into(),
            content,
            status: ToolStatus::Success,
        }
    }

    fn into_message(self, call: &ToolCall) -> Message {
        let content = match self.content {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Message::tool_result(call, content, self.status)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub message: Option<String>,
    pub tool_results: Vec<ClientToolResult>,
}

impl RunInput {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            tool_results: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true)
            && self.tool_results.is_empty()
    }
}

/// Everything one run needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub run_id: String,
    /// `None` resumes from the latest checkpoint without new input.
    pub input: Option<RunInput>,
    /// Forwarded to remote tools (auth, end user id).
    pub headers: BTreeMap<String, String>,
    /// Per-request client tools, in addition to the configured ones.
    pub client_tools: Vec<ToolSpec>,
    /// Extra fields recorded in every checkpoint's metadata.
    pub metadata: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            input: None,
            headers: BTreeMap::new(),
            client_tools: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: RunInput) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutput {
    pub thread_id: String,
    pub run_id: String,
    pub messages: Vec<Message>,
    /// Client tool calls awaiting results; empty when the run completed.
    pub interrupt: Vec<ToolCall>,
    pub ui_events: Vec<UiEvent>,
    pub checkpoint: Option<CheckpointConfig>,
}

/// Numbered event emitter for one run. Events are dropped when detached.
pub struct EventSink {
    thread_id: String,
    run_id: String,
    seq: u64,
    sender: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(ctx: &RunContext, sender: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            thread_id: ctx.thread_id.clone(),
            run_id: ctx.run_id.clone(),
            seq: 0,
            sender: Some(sender),
        }
    }

    pub fn detached(ctx: &RunContext) -> Self {
        Self {
            thread_id: ctx.thread_id.clone(),
            run_id: ctx.run_id.clone(),
            seq: 0,
            sender: None,
        }
    }

    pub fn emit(&mut self, kind: EventKind) {
        let event = Event::new(&self.thread_id, &self.run_id, self.seq, kind);
        self.seq += 1;
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Working copy of a thread's channels between two checkpoints.
struct ThreadState {
    head: Option<CheckpointTuple>,
    values: BTreeMap<Channel, ChannelValue>,
    versions: ChannelVersions,
    changed: ChannelVersions,
}

impl ThreadState {
    fn load(head: Option<CheckpointTuple>) -> Self {
        let (values, versions) = head
            .as_ref()
            .map(|tuple| {
                (
                    tuple.checkpoint.channel_values.clone(),
                    tuple.checkpoint.channel_versions.clone(),
                )
            })
            .unwrap_or_default();
        Self {
            head,
            values,
            versions,
            changed: ChannelVersions::new(),
        }
    }

    fn next_node(&self) -> NodeKind {
        self.head
            .as_ref()
            .map(|tuple| tuple.metadata.next)
            .unwrap_or(NodeKind::Terminal)
    }

    fn step(&self) -> i64 {
        self.head
            .as_ref()
            .map(|tuple| tuple.metadata.step + 1)
            .unwrap_or(0)
    }

    fn messages(&self) -> &[Message] {
        self.values
            .get(&Channel::Messages)
            .map(ChannelValue::as_messages)
            .unwrap_or(&[])
    }

    fn interrupt(&self) -> &[ToolCall] {
        self.values
            .get(&Channel::Interrupt)
            .map(ChannelValue::as_tool_calls)
            .unwrap_or(&[])
    }

    fn write(&mut self, channel: Channel, value: ChannelValue) {
        match self.values.get_mut(&channel) {
            Some(current) => current.merge(value, channel.write_mode()),
            None => {
                self.values.insert(channel, value);
            }
        }
        let version = ChannelVersion::next_after(self.versions.get(&channel));
        self.versions.insert(channel, version.clone());
        self.changed.insert(channel, version);
    }
}

pub struct GraphEngine {
    store: Arc<dyn CheckpointStore>,
    reasoner: Arc<dyn ReasoningService>,
    tools: Arc<ToolRunner>,
    options: EngineOptions,
}

impl GraphEngine {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        reasoner: Arc<dyn ReasoningService>,
        tools: Arc<ToolRunner>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            reasoner,
            tools,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn reasoner(&self) -> &Arc<dyn ReasoningService> {
        &self.reasoner
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn thread_config(&self, thread_id: &str) -> CheckpointConfig {
        CheckpointConfig::new(thread_id).with_namespace(self.options.checkpoint_ns.clone())
    }

    /// Continues an interrupted run from the latest checkpoint without new input.
    pub async fn resume(
        &self,
        mut ctx: RunContext,
        sink: EventSink,
    ) -> Result<RunOutput, EngineError> {
        ctx.input = None;
        self.execute(ctx, sink).await
    }

    /// Drives the thread until it reaches TERMINAL with no input left to apply.
    pub async fn execute(
        &self,
        mut ctx: RunContext,
        mut sink: EventSink,
    ) -> Result<RunOutput, EngineError> {
        let config = self.thread_config(&ctx.thread_id);
        let mut input = ctx.input.take();
        if input.as_ref().map(RunInput::is_empty).unwrap_or(false) {
            return Err(EngineError::InvalidInput(
                "a message or tool results are required".to_string(),
            ));
        }

        info!(thread_id = %ctx.thread_id, run_id = %ctx.run_id, "run started");
        sink.emit(EventKind::RunStarted);

        let mut steps = 0u32;
        loop {
            let mut state = ThreadState::load(self.store.get_tuple(&config).await?);
            let mut source = CheckpointSource::Loop;
            let node = match state.next_node() {
                NodeKind::Terminal => match input.take() {
                    Some(pending) => {
                        apply_input(&mut state, pending)?;
                        source = CheckpointSource::Input;
                        NodeKind::Reasoning
                    }
                    None => break,
                },
                node => node,
            };

            steps += 1;
            if steps > self.options.max_steps {
                warn!(thread_id = %ctx.thread_id, max_steps = self.options.max_steps, "step limit reached");
                return Err(EngineError::StepLimit(self.options.max_steps));
            }

            let step = state.step();
            debug!(thread_id = %ctx.thread_id, node = node.as_str(), step, "entering node");
            sink.emit(EventKind::NodeStarted { node, step });
            let next = match node {
                NodeKind::Reasoning => self.reason(&ctx, &mut state, &mut sink).await?,
                NodeKind::ToolExec => self.execute_tools(&ctx, &mut state, &mut sink).await?,
                NodeKind::Terminal => NodeKind::Terminal,
            };
            self.commit(&config, &ctx, state, source, next, &mut sink)
                .await?;
        }

        let head = self.store.get_tuple(&config).await?;
        let output = output_from(&ctx, head);
        let reason = if output.interrupt.is_empty() {
            "completed"
        } else {
            "interrupted"
        };
        info!(thread_id = %ctx.thread_id, run_id = %ctx.run_id, reason, "run finished");
        sink.emit(EventKind::RunFinished {
            reason: reason.to_string(),
        });
        Ok(output)
    }

    async fn reason(
        &self,
        ctx: &RunContext,
        state: &mut ThreadState,
        sink: &mut EventSink,
    ) -> Result<NodeKind, EngineError> {
        let client_tools = self.client_tools(ctx);
        let mut tools = self.tools.registry().specs();
        tools.extend(client_tools.iter().cloned());

        let mut messages = Vec::with_capacity(state.messages().len() + 1);
        if let Some(prompt) = self.options.system_prompt.as_deref() {
            messages.push(Message::system(prompt));
        }
        messages.extend(state.messages().iter().cloned());

        let turn = {
            let mut on_delta = |delta: &str| {
                sink.emit(EventKind::ReasoningDelta {
                    delta: delta.to_string(),
                })
            };
            self.reasoner
                .respond(ReasoningRequest::new(messages, tools), &mut on_delta)
                .await?
        };

        let calls = turn.tool_calls.clone();
        state.write(Channel::Messages, ChannelValue::Messages(vec![turn.into_message()]));

        let client_names: Vec<&str> = client_tools.iter().map(|spec| spec.name.as_str()).collect();
        if should_continue_server_side(&calls, &client_names) {
            return Ok(NodeKind::ToolExec);
        }
        if !calls.is_empty() {
            info!(
                thread_id = %ctx.thread_id,
                calls = calls.len(),
                "suspending for client tool calls"
            );
            state.write(Channel::Interrupt, ChannelValue::ToolCalls(calls.clone()));
            sink.emit(EventKind::Interrupted { tool_calls: calls });
        }
        Ok(NodeKind::Terminal)
    }

    async fn execute_tools(
        &self,
        ctx: &RunContext,
        state: &mut ThreadState,
        sink: &mut EventSink,
    ) -> Result<NodeKind, EngineError> {
        let calls: Vec<ToolCall> = state
            .messages()
            .iter()
            .rev()
            .find(|message| matches!(message, Message::Assistant { .. }))
            .map(|message| message.tool_calls().to_vec())
            .unwrap_or_default();
        let Some(head) = state.head.as_ref() else {
            return Ok(NodeKind::Reasoning);
        };
        let head_config = head.config.clone();

        let mut recorded = recorded_writes(head);
        if !recorded.is_empty() {
            debug!(
                thread_id = %ctx.thread_id,
                recorded = recorded.len(),
                "reusing recorded tool results"
            );
        }

        let mut in_flight = FuturesUnordered::new();
        for call in &calls {
            if recorded.contains_key(&call.id) {
                continue;
            }
            sink.emit(EventKind::ToolStarted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                args: call.arguments.clone(),
            });
            let mut invocation = ToolInvocation::from_call(call);
            invocation.headers = ctx.headers.clone();
            invocation.timeout_ms = self.options.tool_timeout_ms;
            in_flight.push(self.tools.run(invocation));
        }

        while let Some(result) = in_flight.next().await {
            sink.emit(EventKind::ToolFinished {
                call_id: result.call_id.clone(),
                name: result.name.clone(),
                status: result.status(),
                duration_ms: result.duration_ms,
            });
            let writes = result_writes(&result);
            self.store
                .put_writes(&head_config, &writes, &result.call_id, TOOL_TASK_PATH)
                .await?;
            recorded.insert(result.call_id.clone(), writes);
        }

        for call in &calls {
            if let Some(writes) = recorded.remove(&call.id) {
                for (channel, value) in writes {
                    state.write(channel, value);
                }
            }
        }
        Ok(NodeKind::Reasoning)
    }

    async fn commit(
        &self,
        config: &CheckpointConfig,
        ctx: &RunContext,
        mut state: ThreadState,
        source: CheckpointSource,
        next: NodeKind,
        sink: &mut EventSink,
    ) -> Result<(), EngineError> {
        let step = state.step();
        state.write(Channel::Step, ChannelValue::Int(step));

        let mut checkpoint = Checkpoint::new(CheckpointId::generate());
        checkpoint.channel_values = state.values;
        checkpoint.channel_versions = state.versions;

        let mut metadata = CheckpointMetadata::new(source, step, next);
        metadata.writer = Some(self.options.writer.clone());
        metadata.run_id = Some(ctx.run_id.clone());
        metadata.extra = ctx.metadata.clone();

        let parent = state
            .head
            .as_ref()
            .map(|tuple| tuple.config.clone())
            .unwrap_or_else(|| config.head());
        let saved = self
            .store
            .put(&parent, &checkpoint, &metadata, &state.changed)
            .await?;
        debug!(
            thread_id = %ctx.thread_id,
            checkpoint_id = %checkpoint.id,
            step,
            next = next.as_str(),
            "checkpoint saved"
        );
        sink.emit(EventKind::CheckpointSaved {
            checkpoint_id: saved.checkpoint_id.unwrap_or(checkpoint.id),
            step,
            next,
        });
        Ok(())
    }

    fn client_tools(&self, ctx: &RunContext) -> Vec<ToolSpec> {
        let mut seen = HashSet::new();
        self.options
            .client_tools
            .iter()
            .chain(ctx.client_tools.iter())
            .filter(|spec| seen.insert(spec.name.clone()))
            .cloned()
            .collect()
    }
}

/// Folds caller input into the state: results for an outstanding interrupt
/// first, then the new user message.
fn apply_input(state: &mut ThreadState, input: RunInput) -> Result<(), EngineError> {
    let pending = state.interrupt().to_vec();
    if pending.is_empty() && !input.tool_results.is_empty() {
        return Err(EngineError::InvalidInput(
            "tool results supplied but no tool calls are pending".to_string(),
        ));
    }

    if !pending.is_empty() {
        let mut supplied: HashMap<String, ClientToolResult> = input
            .tool_results
            .into_iter()
            .map(|result| (result.call_id.clone(), result))
            .collect();
        let messages: Vec<Message> = pending
            .iter()
            .map(|call| match supplied.remove(&call.id) {
                Some(result) => result.into_message(call),
                None => Message::tool_result(
                    call,
                    json!({
                        "ok": false,
                        "tool": call.name,
                        "error": "no result supplied",
                    })
                    .to_string(),
                    ToolStatus::Error,
                ),
            })
            .collect();
        for call_id in supplied.keys() {
            warn!(%call_id, "ignoring result for unknown tool call");
        }
        state.write(Channel::Messages, ChannelValue::Messages(messages));
        state.write(Channel::Interrupt, ChannelValue::Null);
    }

    if let Some(text) = input.message.filter(|text| !text.trim().is_empty()) {
        state.write(
            Channel::Messages,
            ChannelValue::Messages(vec![Message::user(text)]),
        );
    }
    Ok(())
}

/// Writes already recorded against the head, grouped by tool call id.
fn recorded_writes(head: &CheckpointTuple) -> HashMap<String, Vec<(Channel, ChannelValue)>> {
    let mut pending: Vec<_> = head
        .pending_writes
        .iter()
        .filter(|write| write.task_path == TOOL_TASK_PATH)
        .collect();
    pending.sort_by_key(|write| write.seq);

    let mut recorded: HashMap<String, Vec<(Channel, ChannelValue)>> = HashMap::new();
    for write in pending {
        recorded
            .entry(write.task_id.clone())
            .or_default()
            .push((write.channel, write.value.clone()));
    }
    recorded
}

fn result_writes(result: &ToolCallResult) -> Vec<(Channel, ChannelValue)> {
    let mut writes = vec![(
        Channel::Messages,
        ChannelValue::Messages(vec![result.to_message()]),
    )];
    if let Some(value) = result.structured_value() {
        writes.push((
            Channel::UiEvents,
            ChannelValue::UiEvents(vec![UiEvent {
                id: Uuid::new_v4().to_string(),
                tool_call_id: Some(result.call_id.clone()),
                name: result.name.clone(),
                props: value.clone(),
            }]),
        ));
    }
    writes
}

fn output_from(ctx: &RunContext, head: Option<CheckpointTuple>) -> RunOutput {
    let Some(head) = head else {
        return RunOutput {
            thread_id: ctx.thread_id.clone(),
            run_id: ctx.run_id.clone(),
            messages: Vec::new(),
            interrupt: Vec::new(),
            ui_events: Vec::new(),
            checkpoint: None,
        };
    };
    let channel = |channel: Channel| head.checkpoint.value(channel);
    RunOutput {
        thread_id: ctx.thread_id.clone(),
        run_id: ctx.run_id.clone(),
        messages: head.checkpoint.messages().to_vec(),
        interrupt: channel(Channel::Interrupt)
            .map(|value| value.as_tool_calls().to_vec())
            .unwrap_or_default(),
        ui_events: channel(Channel::UiEvents)
            .map(|value| value.as_ui_events().to_vec())
            .unwrap_or_default(),
        checkpoint: Some(head.config.clone()),
    }
}
