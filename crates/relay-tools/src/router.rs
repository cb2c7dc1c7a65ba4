use std::collections::HashSet;

use relay_kernel::ToolCall;

/// True when the whole batch can run inside the engine. An empty batch has
/// nothing to run, and a single client-side call suspends the entire batch.
pub fn should_continue_server_side<S: AsRef<str>>(
    tool_calls: &[ToolCall],
    client_tool_names: &[S],
) -> bool {
    if tool_calls.is_empty() {
        return false;
    }
    let client: HashSet<&str> = client_tool_names.iter().map(AsRef::as_ref).collect();
    !tool_calls
        .iter()
        .any(|call| client.contains(call.name.as_str()))
}
