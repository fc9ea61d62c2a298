//! Tool definitions and dispatch.
//!
//! Tool *semantics* live behind the terminal runtime and its executor;
//! this module only defines what the model sees and routes calls to the
//! resolved terminal.

use leon_domain::message::{ToolCall, ToolDefinition};

use super::terminal::TerminalRuntime;

/// The tool surface exposed to the model.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: "shell".into(),
        description: "Run a shell command in the thread's sandbox terminal. \
                      The working directory and environment persist across calls."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute."
                }
            },
            "required": ["command"]
        }),
    }]
}

/// Execute one tool call against the thread's terminal. Returns the
/// result content and whether it is an error; tool failures become error
/// results, never a crashed run.
pub async fn dispatch(
    terminal: &mut TerminalRuntime,
    thread_id: &str,
    call: &ToolCall,
) -> (String, bool) {
    match call.tool_name.as_str() {
        "shell" => {
            let Some(command) = call.arguments.get("command").and_then(|v| v.as_str()) else {
                return ("shell: missing required argument `command`".into(), true);
            };
            match terminal.run_command(thread_id, command).await {
                Ok(output) => {
                    let is_error = output.is_error();
                    let exit_code = output.exit_code;
                    let mut content = output.stdout;
                    if !output.stderr.is_empty() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&output.stderr);
                    }
                    if is_error {
                        content.push_str(&format!("\n(exit code {})", exit_code));
                    }
                    (content, is_error)
                }
                Err(e) => (e.to_string(), true),
            }
        }
        other => (format!("unknown tool: {other}"), true),
    }
}
