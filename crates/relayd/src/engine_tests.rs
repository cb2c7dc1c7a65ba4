use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relay_kernel::{
    Channel, ChannelValue, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointMetadata, CheckpointSource, EventKind, Message, NodeKind, ToolSpec,
    ToolStatus,
};
use relay_provider::AssistantTurn;
use relay_store::{CheckpointStore, ListQuery, MemoryStore, SqliteStore};
use relay_tools::{handler_fn, ToolInvocation, ToolRegistry, ToolResultEnvelope, ToolRunner};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::graph::{
    ClientToolResult, EngineError, EngineOptions, EventSink, GraphEngine, RunContext, RunInput,
};
use crate::testing::{call, calls_turn, engine_with, memory_engine, price_tools, ScriptedReasoner};

fn ask(thread: &str, text: &str) -> RunContext {
    RunContext::new(thread, "run-1").with_input(RunInput::message(text))
}

async fn history(engine: &GraphEngine, thread: &str) -> Vec<relay_kernel::CheckpointTuple> {
    engine
        .store()
        .list(Some(&engine.thread_config(thread)), &ListQuery::default())
        .await
        .expect("list")
}

fn tool_messages(messages: &[Message]) -> Vec<&Message> {
    messages
        .iter()
        .filter(|message| matches!(message, Message::Tool { .. }))
        .collect()
}

#[tokio::test]
async fn server_tool_round_trip_checkpoints_each_transition() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![
        calls_turn(vec![call("c1", "get_price")]),
        AssistantTurn::text("ACME trades at 42.5"),
    ]));
    let engine = memory_engine(reasoner.clone());
    let ctx = ask("t1", "price of ACME?");
    let output = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("run");

    let last = output.messages.last().expect("last");
    assert!(last.tool_calls().is_empty());
    assert_eq!(last.content(), "ACME trades at 42.5");
    assert!(output.interrupt.is_empty());
    assert_eq!(output.ui_events.len(), 1);
    assert_eq!(output.ui_events[0].tool_call_id.as_deref(), Some("c1"));

    let nexts: Vec<NodeKind> = history(&engine, "t1")
        .await
        .iter()
        .map(|tuple| tuple.metadata.next)
        .collect();
    assert_eq!(
        nexts,
        vec![NodeKind::Terminal, NodeKind::Reasoning, NodeKind::ToolExec]
    );

    let second_request = &reasoner.requests()[1];
    let tool_message = tool_messages(&second_request.messages)[0];
    assert_eq!(tool_message.tool_call_id(), Some("c1"));
    let content: Value = serde_json::from_str(tool_message.content()).expect("json");
    assert_eq!(content["price"], 42.5);
}

#[tokio::test]
async fn client_tool_suspends_after_one_checkpoint() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![calls_turn(vec![call(
        "c1",
        "confirm_trade",
    )])]));
    let engine = memory_engine(reasoner);
    let ctx = ask("t2", "buy 10 ACME");
    let output = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("run");

    assert_eq!(output.interrupt.len(), 1);
    assert_eq!(output.interrupt[0].name, "confirm_trade");
    assert!(tool_messages(&output.messages).is_empty());

    let checkpoints = history(&engine, "t2").await;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].metadata.next, NodeKind::Terminal);
    assert_eq!(checkpoints[0].metadata.source, CheckpointSource::Input);
}

#[tokio::test]
async fn mixed_batch_is_not_partially_executed() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![calls_turn(vec![
        call("s1", "get_price"),
        call("c1", "confirm_trade"),
    ])]));
    let engine = memory_engine(reasoner);
    let ctx = ask("t3", "check and buy");
    let output = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("run");

    assert_eq!(output.interrupt.len(), 2);
    assert!(tool_messages(&output.messages).is_empty());
    assert!(output.ui_events.is_empty());
}

#[tokio::test]
async fn failing_tool_becomes_a_correlated_failure_result() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![
        calls_turn(vec![call("bad", "explode"), call("good", "get_price")]),
        AssistantTurn::text("the quote feed is down"),
    ]));
    let engine = memory_engine(reasoner);
    let ctx = ask("t4", "price?");
    let output = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("run completes");

    let tools = tool_messages(&output.messages);
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].tool_call_id(), Some("bad"));
    assert_eq!(tools[1].tool_call_id(), Some("good"));
    match tools[0] {
        Message::Tool { status, content, .. } => {
            assert_eq!(*status, ToolStatus::Error);
            let body: Value = serde_json::from_str(content).expect("json");
            assert_eq!(body["ok"], false);
            assert_eq!(body["tool"], "explode");
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(
        output.messages.last().map(Message::content),
        Some("the quote feed is down")
    );
}

#[tokio::test]
async fn reused_call_ids_keep_every_turns_result() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![
        calls_turn(vec![call("call_0", "get_price")]),
        AssistantTurn::text("42.5"),
        calls_turn(vec![call("call_0", "explode")]),
        AssistantTurn::text("feed is down"),
    ]));
    let engine = memory_engine(reasoner.clone());
    let first = ask("t-reuse", "price?");
    engine
        .execute(first.clone(), EventSink::detached(&first))
        .await
        .expect("first run");
    let second = ask("t-reuse", "again?");
    let output = engine
        .execute(second.clone(), EventSink::detached(&second))
        .await
        .expect("second run");

    let results = tool_messages(&output.messages);
    assert_eq!(results.len(), 2);
    assert!(results[0].content().contains("42.5"));
    assert!(results[1].content().contains("quote feed offline"));

    // Every assistant tool call is answered by the message right after it.
    for (index, message) in output.messages.iter().enumerate() {
        if let Some(call) = message.tool_calls().first() {
            let answer = &output.messages[index + 1];
            assert_eq!(answer.tool_call_id(), Some(call.id.as_str()));
        }
    }
    assert_eq!(output.messages.last().map(Message::content), Some("feed is down"));

    let last_request = reasoner.requests().pop().expect("request");
    assert_eq!(tool_messages(&last_request.messages).len(), 2);
}

#[tokio::test]
async fn events_follow_the_run_in_order() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![
        calls_turn(vec![call("c1", "get_price")]),
        AssistantTurn::text("done"),
    ]));
    let engine = memory_engine(reasoner);
    let ctx = ask("t5", "price?");
    let (sender, mut receiver) = mpsc::unbounded_channel();
    engine
        .execute(ctx.clone(), EventSink::new(&ctx, sender))
        .await
        .expect("run");

    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    let seqs: Vec<u64> = events.iter().map(|event| event.seq).collect();
    assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
    assert!(matches!(events[0].kind, EventKind::RunStarted));
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(EventKind::RunFinished { reason }) if reason == "completed"
    ));

    let saved = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::CheckpointSaved { .. }))
        .count();
    assert_eq!(saved, 3);
    let started = events
        .iter()
        .position(|event| matches!(event.kind, EventKind::ToolStarted { .. }))
        .expect("tool started");
    let finished = events
        .iter()
        .position(|event| {
            matches!(&event.kind, EventKind::ToolFinished { call_id, status, .. }
                if call_id == "c1" && *status == ToolStatus::Success)
        })
        .expect("tool finished");
    assert!(started < finished);
}

#[tokio::test]
async fn client_results_resume_the_suspended_thread() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![
        calls_turn(vec![call("c1", "confirm_trade"), call("c2", "confirm_trade")]),
        AssistantTurn::text("first confirmed"),
    ]));
    let engine = memory_engine(reasoner.clone());
    let ctx = ask("t6", "buy twice");
    engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("suspend");

    let follow_up = RunContext::new("t6", "run-2").with_input(RunInput {
        message: None,
        tool_results: vec![ClientToolResult::new("c1", Value::String("yes".into()))],
    });
    let output = engine
        .execute(follow_up.clone(), EventSink::detached(&follow_up))
        .await
        .expect("resume");

    assert!(output.interrupt.is_empty());
    let tools = tool_messages(&output.messages);
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].content(), "yes");
    match tools[1] {
        Message::Tool {
            status, content, ..
        } => {
            assert_eq!(*status, ToolStatus::Error);
            assert!(content.contains("no result supplied"));
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(reasoner.requests().len(), 2);
}

#[tokio::test]
async fn tool_results_without_pending_calls_are_rejected() {
    let engine = memory_engine(Arc::new(ScriptedReasoner::default()));
    let ctx = RunContext::new("t7", "run-1").with_input(RunInput {
        message: None,
        tool_results: vec![ClientToolResult::new("ghost", Value::Null)],
    });
    let err = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect_err("nothing pending");
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert!(history(&engine, "t7").await.is_empty());
}

#[tokio::test]
async fn resumed_tool_step_skips_recorded_calls() {
    let executed = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ToolRegistry::default());
    let counter = executed.clone();
    registry.register(
        ToolSpec::new("count", "Counts executions"),
        handler_fn(move |invocation: ToolInvocation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ToolResultEnvelope::text(format!("ran {}", invocation.call_id)))
            }
        }),
    );
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let engine = engine_with(
        store.clone(),
        Arc::new(ScriptedReasoner::new(vec![AssistantTurn::text("both done")])),
        registry,
    );

    // A run that committed the tool-call turn and recorded one result before stopping.
    let config = CheckpointConfig::new("crash");
    let mut checkpoint = Checkpoint::new(CheckpointId::generate());
    checkpoint.channel_values.insert(
        Channel::Messages,
        ChannelValue::Messages(vec![
            Message::user("run both"),
            Message::assistant("", vec![call("c1", "count"), call("c2", "count")]),
        ]),
    );
    let version = ChannelVersion::next_after(None);
    checkpoint
        .channel_versions
        .insert(Channel::Messages, version.clone());
    let saved = store
        .put(
            &config,
            &checkpoint,
            &CheckpointMetadata::new(CheckpointSource::Input, 0, NodeKind::ToolExec),
            &ChannelVersions::from([(Channel::Messages, version)]),
        )
        .await
        .expect("put");
    let recorded = Message::tool_result(&call("c1", "count"), "recorded c1", ToolStatus::Success);
    store
        .put_writes(
            &saved,
            &[(Channel::Messages, ChannelValue::Messages(vec![recorded]))],
            "c1",
            "tool_exec",
        )
        .await
        .expect("writes");

    let ctx = RunContext::new("crash", "run-2");
    let output = engine
        .resume(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("resume");

    assert_eq!(executed.load(Ordering::SeqCst), 1);
    let contents: Vec<&str> = tool_messages(&output.messages)
        .into_iter()
        .map(Message::content)
        .collect();
    assert_eq!(contents, vec!["recorded c1", "ran c2"]);
    assert_eq!(output.messages.last().map(Message::content), Some("both done"));
}

#[tokio::test]
async fn step_limit_stops_a_looping_run() {
    let turns = (0..10)
        .map(|i| calls_turn(vec![call(&format!("c{i}"), "get_price")]))
        .collect();
    let reasoner = Arc::new(ScriptedReasoner::new(turns));
    let engine = GraphEngine::new(
        Arc::new(MemoryStore::new()),
        reasoner,
        Arc::new(ToolRunner::new(price_tools(), 2)),
        EngineOptions {
            max_steps: 3,
            ..EngineOptions::default()
        },
    );
    let ctx = ask("loop", "go");
    let err = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect_err("limit");
    assert!(matches!(err, EngineError::StepLimit(3)));
    assert_eq!(history(&engine, "loop").await.len(), 3);
}

#[tokio::test]
async fn reasoning_sees_prompt_history_and_every_tool() {
    let reasoner = Arc::new(ScriptedReasoner::new(vec![AssistantTurn::text("hello")]));
    let engine = GraphEngine::new(
        Arc::new(MemoryStore::new()),
        reasoner.clone(),
        Arc::new(ToolRunner::new(price_tools(), 2)),
        EngineOptions {
            system_prompt: Some("You are a trading assistant.".into()),
            client_tools: vec![ToolSpec::new("confirm_trade", "")],
            ..EngineOptions::default()
        },
    );
    let mut ctx = ask("t8", "hi");
    ctx.client_tools = vec![
        ToolSpec::new("confirm_trade", "duplicate"),
        ToolSpec::new("show_chart", ""),
    ];
    engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("run");

    let request = &reasoner.requests()[0];
    assert!(matches!(request.messages[0], Message::System { .. }));
    assert_eq!(request.messages[1].content(), "hi");
    let names: Vec<&str> = request.tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(names, vec!["explode", "get_price", "confirm_trade", "show_chart"]);
}

#[tokio::test]
async fn sqlite_threads_survive_a_reopen() {
    let dir = tempfile::tempdir().expect("tmp");
    let path = dir.path().join("checkpoints.db");
    {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&path).expect("open"));
        let engine = engine_with(
            store.clone(),
            Arc::new(ScriptedReasoner::new(vec![
                calls_turn(vec![call("c1", "get_price")]),
                AssistantTurn::text("42.5"),
            ])),
            price_tools(),
        );
        let ctx = ask("durable", "price?");
        engine
            .execute(ctx.clone(), EventSink::detached(&ctx))
            .await
            .expect("run");
        store.close().await.expect("close");
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&path).expect("reopen"));
    let engine = engine_with(
        store,
        Arc::new(ScriptedReasoner::new(vec![AssistantTurn::text("still here")])),
        price_tools(),
    );
    let checkpoints = history(&engine, "durable").await;
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(checkpoints[0].checkpoint.messages().len(), 4);

    let ctx = ask("durable", "and now?");
    let output = engine
        .execute(ctx.clone(), EventSink::detached(&ctx))
        .await
        .expect("continue");
    assert_eq!(output.messages.len(), 6);
}
