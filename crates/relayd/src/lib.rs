mod config;
mod error;
mod graph;
mod runner;
mod server;
mod stream;
mod telemetry;
mod thread_lock;
mod transport;

pub use config::{
    load_config, ApiKeySource, ConfigError, EngineConfig, McpServerConfig, ProviderConfig,
    RelayConfig, ServerConfig, StoreConfig, DEFAULT_ADDR,
};
pub use error::RunnerError;
pub use graph::{
    ClientToolResult, EngineError, EngineOptions, EventSink, GraphEngine, RunContext, RunInput,
    RunOutput, DEFAULT_MAX_STEPS,
};
pub use runner::{RunRequest, RunResult, Runner, END_USER_HEADER, USER_AUTHORIZATION_HEADER};
pub use server::{build_app, serve};
pub use stream::EngineStream;
pub use telemetry::init_tracing;
pub use thread_lock::{ThreadGuard, ThreadLocks};
pub use transport::{heartbeat, StreamFrame, DEFAULT_HEARTBEAT};

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod server_tests;
#[cfg(test)]
mod testing;
