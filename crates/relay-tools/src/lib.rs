mod envelope;
mod error;
mod mcp;
mod router;
mod runtime;

pub use envelope::ToolResultEnvelope;
pub use error::ToolError;
pub use mcp::{register_mcp_tools, McpClient};
pub use router::should_continue_server_side;
pub use runtime::{
    handler_fn, ToolCallResult, ToolHandler, ToolInvocation, ToolRegistry, ToolRunner,
};
