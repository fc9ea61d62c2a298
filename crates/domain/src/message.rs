use serde::{Deserialize, Serialize};

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
///
/// `id` is the language-model message UUID carried through run events so
/// clients can deduplicate streamed chunks; synthetic messages (summaries,
/// steering reminders) mint a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Tool calls attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool-role messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn bare(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::bare(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::bare(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, text)
    }

    pub fn assistant_with_tools(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::bare(Role::Assistant, text)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::bare(Role::Tool, content)
        }
    }

    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Text(t) => t.as_str(),
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content = MessageContent::Text(text.into());
    }

    /// An assistant message that is still waiting for tool results.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_role_and_linkage() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert!(m.tool_call_id.is_none());

        let tr = Message::tool_result("tc_1", "output");
        assert_eq!(tr.role, Role::Tool);
        assert_eq!(tr.tool_call_id.as_deref(), Some("tc_1"));
    }

    #[test]
    fn assistant_with_tools_keeps_calls() {
        let m = Message::assistant_with_tools(
            "running",
            vec![ToolCall {
                call_id: "tc_1".into(),
                tool_name: "shell".into(),
                arguments: serde_json::json!({"command": "ls"}),
            }],
        );
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls[0].tool_name, "shell");
    }

    #[test]
    fn messages_get_distinct_ids() {
        assert_ne!(Message::user("a").id, Message::user("a").id);
    }

    #[test]
    fn serde_roundtrip_preserves_linkage() {
        let m = Message::tool_result("tc_9", "data");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_call_id.as_deref(), Some("tc_9"));
        assert_eq!(back.text(), "data");
    }
}
