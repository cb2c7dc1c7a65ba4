use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use futures_util::{future::BoxFuture, FutureExt};
use relay_kernel::{Message, ToolCall, ToolSpec, ToolStatus};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{ToolError, ToolResultEnvelope};

#[derive(Clone, Debug)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    /// Caller-scoped headers forwarded to remote tools (auth, end user id).
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl ToolInvocation {
    pub fn from_call(call: &ToolCall) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            args: call.arguments.clone(),
            headers: BTreeMap::new(),
            timeout_ms: None,
        }
    }
}

/// Outcome of one tool call; failures are data, never a reason to abort a batch.
#[derive(Clone, Debug)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub outcome: Result<ToolResultEnvelope, ToolError>,
    pub duration_ms: u64,
}

impl ToolCallResult {
    pub fn status(&self) -> ToolStatus {
        match &self.outcome {
            Ok(envelope) => envelope.status(),
            Err(_) => ToolStatus::Error,
        }
    }

    pub fn structured_value(&self) -> Option<&Value> {
        match &self.outcome {
            Ok(ToolResultEnvelope::Structured { value }) => Some(value),
            _ => None,
        }
    }

    /// Tool message correlated to the originating call id.
    pub fn to_message(&self) -> Message {
        let call = ToolCall::new(self.call_id.clone(), self.name.clone(), Value::Null);
        let content = match &self.outcome {
            Ok(envelope) => envelope.to_content(),
            Err(error) => serde_json::json!({
                "ok": false,
                "tool": self.name,
                "error": error.to_string(),
            })
            .to_string(),
        };
        Message::tool_result(&call, content, self.status())
    }
}

pub type ToolHandler = Arc<
    dyn Fn(ToolInvocation) -> BoxFuture<'static, Result<ToolResultEnvelope, ToolError>>
        + Send
        + Sync,
>;

pub fn handler_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResultEnvelope, ToolError>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(f(invocation)))
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, (ToolSpec, ToolHandler)>>,
    aliases: Mutex<HashMap<String, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToolRegistry {
    pub fn register(&self, spec: ToolSpec, handler: ToolHandler) {
        lock(&self.tools).insert(spec.name.clone(), (spec, handler));
    }

    pub fn register_alias(&self, alias: impl Into<String>, target: impl Into<String>) {
        lock(&self.aliases).insert(alias.into(), target.into());
    }

    pub fn get(&self, name: &str) -> Option<ToolHandler> {
        if let Some((_, handler)) = lock(&self.tools).get(name) {
            return Some(handler.clone());
        }
        let target = lock(&self.aliases).get(name)?.clone();
        lock(&self.tools)
            .get(&target)
            .map(|(_, handler)| handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Specs in name order, as advertised to the reasoning service.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = lock(&self.tools)
            .values()
            .map(|(spec, _)| spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    default_timeout_ms: Option<u64>,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            default_timeout_ms: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn run(&self, invocation: ToolInvocation) -> ToolCallResult {
        let started_at = Instant::now();
        let call_id = invocation.call_id.clone();
        let name = invocation.name.clone();
        let outcome = self.execute(invocation).await;
        if let Err(error) = &outcome {
            warn!(%call_id, tool = %name, %error, "tool call failed");
        }
        ToolCallResult {
            call_id,
            name,
            outcome,
            duration_ms: started_at.elapsed().as_millis() as u64,
        }
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<ToolResultEnvelope, ToolError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ToolError::Failed("tool runner is shut down".to_string()))?;

        let handler = self
            .registry
            .get(&invocation.name)
            .ok_or_else(|| ToolError::UnknownTool(invocation.name.clone()))?;

        let timeout_ms = invocation.timeout_ms.or(self.default_timeout_ms);
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| (handler)(invocation)))
            .map_err(|payload| ToolError::Panicked(panic_message(payload)))?;
        let guarded = AssertUnwindSafe(future).catch_unwind();

        let output = match timeout_ms {
            Some(timeout_ms) => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), guarded)
                    .await
                    .map_err(|_| ToolError::Timeout(timeout_ms))?
            }
            None => guarded.await,
        };
        output.map_err(|payload| ToolError::Panicked(panic_message(payload)))?
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::pending;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn invocation(name: &str) -> ToolInvocation {
        ToolInvocation {
            call_id: format!("call-{name}"),
            name: name.to_string(),
            args: serde_json::json!({}),
            headers: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn runs_tool_and_returns_envelope() {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(
            ToolSpec::new("echo", "echo args"),
            handler_fn(|invocation: ToolInvocation| async move {
                Ok(ToolResultEnvelope::text(format!("hi:{}", invocation.args)))
            }),
        );

        let runner = ToolRunner::new(registry, 2);
        let mut call = invocation("echo");
        call.args = serde_json::json!("world");
        let result = runner.run(call).await;

        assert_eq!(result.call_id, "call-echo");
        assert_eq!(result.status(), ToolStatus::Success);
        assert_eq!(
            result.outcome,
            Ok(ToolResultEnvelope::text("hi:\"world\""))
        );
        let message = result.to_message();
        assert_eq!(message.tool_call_id(), Some("call-echo"));
        assert_eq!(message.content(), "hi:\"world\"");
    }

    #[tokio::test]
    async fn alias_resolves_to_target() {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(
            ToolSpec::new("get_price", ""),
            handler_fn(|_invocation| async move { Ok(ToolResultEnvelope::text("ok")) }),
        );
        registry.register_alias("price", "get_price");

        assert!(registry.contains("price"));
        let handler = registry.get("price").expect("alias");
        let output = handler(invocation("price")).await;
        assert_eq!(output, Ok(ToolResultEnvelope::text("ok")));
        assert_eq!(registry.specs().len(), 1);
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(
            ToolSpec::new("slow", ""),
            handler_fn(|_invocation| async move {
                pending::<Result<ToolResultEnvelope, ToolError>>().await
            }),
        );

        let runner = ToolRunner::new(registry, 1);
        let mut call = invocation("slow");
        call.timeout_ms = Some(10);
        let result = runner.run(call).await;
        assert_eq!(result.outcome, Err(ToolError::Timeout(10)));
    }

    #[tokio::test]
    async fn default_timeout_applies_when_call_has_none() {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(
            ToolSpec::new("slow", ""),
            handler_fn(|_invocation| async move {
                pending::<Result<ToolResultEnvelope, ToolError>>().await
            }),
        );

        let runner = ToolRunner::new(registry, 1).with_default_timeout(Some(10));
        let result = runner.run(invocation("slow")).await;
        assert_eq!(result.outcome, Err(ToolError::Timeout(10)));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_failure() {
        let runner = ToolRunner::new(Arc::new(ToolRegistry::default()), 1);
        let result = runner.run(invocation("missing")).await;
        assert_eq!(
            result.outcome,
            Err(ToolError::UnknownTool("missing".to_string()))
        );

        let message = result.to_message();
        let body: Value = serde_json::from_str(message.content()).expect("json");
        assert_eq!(body["ok"], false);
        assert_eq!(body["tool"], "missing");
        assert_eq!(message.tool_call_id(), Some("call-missing"));
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(
            ToolSpec::new("explode", ""),
            handler_fn(|_invocation| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(ToolResultEnvelope::text("unreachable"))
            }),
        );

        let runner = ToolRunner::new(registry, 1);
        let result = runner.run(invocation("explode")).await;
        assert_eq!(
            result.outcome,
            Err(ToolError::Panicked("kaboom".to_string()))
        );
    }

    #[tokio::test]
    async fn limits_concurrency() {
        let registry = Arc::new(ToolRegistry::default());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let active_clone = active.clone();
        let max_clone = max_seen.clone();
        registry.register(
            ToolSpec::new("block", ""),
            handler_fn(move |_invocation| {
                let active = active_clone.clone();
                let max_seen = max_clone.clone();
                async move {
                    let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(ToolResultEnvelope::text("ok"))
                }
            }),
        );

        let runner = ToolRunner::new(registry, 1);
        let _ = tokio::join!(runner.run(invocation("block")), runner.run(invocation("block")));
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
