use std::{collections::BTreeMap, convert::Infallible, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{sse::Event as SseEvent, IntoResponse, Response, Sse},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use relay_kernel::{CheckpointId, CheckpointTuple, ToolSpec};
use relay_store::ListQuery;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::error::RunnerError;
use crate::graph::ClientToolResult;
use crate::runner::{RunRequest, RunResult, Runner, END_USER_HEADER, USER_AUTHORIZATION_HEADER};
use crate::transport::heartbeat;

const FORWARDED_HEADERS: [&str; 2] = [USER_AUTHORIZATION_HEADER, END_USER_HEADER];
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub(crate) struct AppState {
    runner: Arc<Runner>,
    openapi_json: Arc<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct QueryPayload {
    #[serde(default)]
    message: String,
    #[serde(default)]
    thread_id: Option<String>,
    /// Tools the caller executes itself for this request.
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    client_tools: Vec<ToolSpec>,
    /// Results for the client tool calls the thread is suspended on.
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    tool_results: Vec<ClientToolResult>,
}

impl QueryPayload {
    fn into_request(self, headers: &HeaderMap) -> RunRequest {
        RunRequest {
            message: self.message,
            thread_id: self.thread_id,
            extra_headers: forwarded_headers(headers),
            client_tools: self.client_tools,
            tool_results: self.tool_results,
        }
    }
}

/// Query form of `/agent/stream`; client tools and tool results need the POST body.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct StreamParams {
    message: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct HistoryParams {
    /// Only checkpoints older than this id.
    before: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub(crate) struct CheckpointSummary {
    pub(crate) checkpoint_id: String,
    pub(crate) parent_checkpoint_id: Option<String>,
    pub(crate) step: i64,
    pub(crate) source: String,
    pub(crate) next: String,
    pub(crate) run_id: Option<String>,
    pub(crate) ts_ms: u64,
    pub(crate) message_count: usize,
    pub(crate) pending_writes: usize,
}

impl From<&CheckpointTuple> for CheckpointSummary {
    fn from(tuple: &CheckpointTuple) -> Self {
        Self {
            checkpoint_id: tuple.checkpoint.id.as_str().to_string(),
            parent_checkpoint_id: tuple
                .parent_config
                .as_ref()
                .and_then(|parent| parent.checkpoint_id.as_ref())
                .map(|id| id.as_str().to_string()),
            step: tuple.metadata.step,
            source: tuple.metadata.source.as_str().to_string(),
            next: tuple.metadata.next.as_str().to_string(),
            run_id: tuple.metadata.run_id.clone(),
            ts_ms: tuple.checkpoint.ts_ms,
            message_count: tuple.checkpoint.messages().len(),
            pending_writes: tuple.pending_writes.len(),
        }
    }
}

#[derive(OpenApi)]
#[openapi(info(
    title = "Relay Agent Server",
    description = "Resumable agent runs over HTTP/SSE.",
    version = "0.1.0"
))]
struct ApiDoc;

/// Serves until ctrl-c, then closes the runner.
pub async fn serve(runner: Arc<Runner>, addr: &str) -> anyhow::Result<()> {
    let app = build_app(runner.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("relayd listening on http://{}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await;
    runner.close().await?;
    Ok(served?)
}

pub fn build_app(runner: Arc<Runner>) -> Router {
    let (router, openapi_json) = build_openapi_router();
    let state = AppState {
        runner,
        openapi_json: Arc::new(openapi_json),
    };
    router
        .route("/openapi.json", get(openapi_spec))
        .with_state(state)
}

pub(crate) fn build_openapi_router() -> (Router<AppState>, String) {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(query_agent))
        .routes(routes!(stream_agent, stream_agent_with_body))
        .routes(routes!(list_checkpoints))
        .routes(routes!(resume_thread))
        .split_for_parts();
    let json = api
        .to_pretty_json()
        .map(|value| format!("{value}\n"))
        .unwrap_or_else(|err| {
            warn!(%err, "failed to render openapi document");
            "{}\n".to_string()
        });
    (router, json)
}

#[utoipa::path(
    post,
    path = "/agent/query",
    request_body = QueryPayload,
    params(
        ("x-user-authorization" = Option<String>, Header, description = "Forwarded to remote tools"),
        ("x-end-user-id" = Option<String>, Header, description = "Recorded with each checkpoint")
    ),
    responses(
        (status = 200, description = "Final thread state", body = RunResult),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Run failed")
    )
)]
async fn query_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<QueryPayload>, JsonRejection>,
) -> Result<Json<RunResult>, RunnerError> {
    let Json(payload) = payload.map_err(|err| RunnerError::Validation(err.body_text()))?;
    let request = payload.into_request(&headers);
    Ok(Json(state.runner.run(request).await?))
}

#[utoipa::path(
    get,
    path = "/agent/stream",
    params(StreamParams),
    responses(
        (status = 200, description = "SSE frames: data, ping, event (completed), error"),
        (status = 400, description = "Invalid request")
    )
)]
async fn stream_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Response {
    let request = RunRequest {
        message: params.message,
        thread_id: params.thread_id,
        extra_headers: forwarded_headers(&headers),
        ..RunRequest::default()
    };
    sse_response(&state, request)
}

#[utoipa::path(
    post,
    path = "/agent/stream",
    request_body = QueryPayload,
    description = "Same as the GET form, but the body may carry client tools and the results for a suspended thread.",
    responses(
        (status = 200, description = "SSE frames: data, ping, event (completed), error"),
        (status = 400, description = "Invalid request")
    )
)]
async fn stream_agent_with_body(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<QueryPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => sse_response(&state, payload.into_request(&headers)),
        Err(err) => RunnerError::Validation(err.body_text()).into_response(),
    }
}

fn sse_response(state: &AppState, request: RunRequest) -> Response {
    let events = match state.runner.stream(request) {
        Ok(events) => events,
        Err(err) => return err.into_response(),
    };

    let frames = heartbeat(events, state.runner.heartbeat_interval()).map(|frame| {
        Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .event(frame.name())
                .data(frame.payload().to_string()),
        )
    });
    Sse::new(frames).into_response()
}

#[utoipa::path(
    get,
    path = "/threads/{thread_id}/checkpoints",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        HistoryParams
    ),
    responses(
        (status = 200, description = "Checkpoints, newest first", body = Vec<CheckpointSummary>)
    )
)]
async fn list_checkpoints(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<CheckpointSummary>>, RunnerError> {
    let mut query = ListQuery::default().limit(params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    if let Some(before) = params.before.filter(|id| !id.is_empty()) {
        query = query.before(CheckpointId::new(before));
    }
    let history = state.runner.history(&thread_id, query).await?;
    Ok(Json(history.iter().map(CheckpointSummary::from).collect()))
}

#[utoipa::path(
    post,
    path = "/threads/{thread_id}/resume",
    params(
        ("thread_id" = String, Path, description = "Thread id")
    ),
    responses(
        (status = 200, description = "Thread state after resuming", body = RunResult),
        (status = 400, description = "Unknown thread")
    )
)]
async fn resume_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RunResult>, RunnerError> {
    let result = state
        .runner
        .resume(&thread_id, forwarded_headers(&headers))
        .await?;
    Ok(Json(result))
}

async fn openapi_spec(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        state.openapi_json.as_str().to_owned(),
    )
}

fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
