//! Deterministic provider for dev mode and tests.
//!
//! Turns are queued ahead of time; each `chat`/`chat_stream` call consumes
//! the next one. With no queued turn the provider echoes the last user
//! message, so a freshly-booted dev server answers without any credentials.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use leon_domain::message::{Role, ToolCall};
use leon_domain::stream::{BoxStream, StreamEvent, Usage};
use leon_domain::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// One pre-scripted model turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Text chunks streamed one by one, all sharing a single message id.
    pub chunks: Vec<String>,
    /// Tool calls emitted after the text.
    pub tool_calls: Vec<ToolCall>,
    /// Usage reported on `done`.
    pub usage: Usage,
    /// Sleep before the first chunk (for cancellation tests).
    pub delay: Option<Duration>,
    /// When set, the turn fails with a transient upstream error instead.
    pub fail: Option<String>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![text.into()],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn tool(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                call_id: format!("tc_{}", uuid::Uuid::new_v4().simple()),
                tool_name: name.into(),
                arguments,
            }],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = Usage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        };
        self
    }
}

pub struct ScriptedProvider {
    model: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            turns: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a turn; turns are consumed FIFO across chat and stream calls.
    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn pending(&self) -> usize {
        self.turns.lock().len()
    }

    fn next_turn(&self, req: &ChatRequest) -> ScriptedTurn {
        if let Some(turn) = self.turns.lock().pop_front() {
            return turn;
        }
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text().to_owned())
            .unwrap_or_default();
        ScriptedTurn::text(format!("(scripted) {last_user}"))
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let turn = self.next_turn(&req);
        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = turn.fail {
            return Err(Error::TransientUpstream(message));
        }
        Ok(ChatResponse {
            content: turn.chunks.concat(),
            tool_calls: turn.tool_calls,
            usage: Some(turn.usage),
            model: self.model.clone(),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let turn = self.next_turn(&req);
        let stream = async_stream::stream! {
            if let Some(delay) = turn.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = turn.fail {
                yield Err(Error::TransientUpstream(message));
                return;
            }
            let message_id = uuid::Uuid::new_v4().to_string();
            for chunk in turn.chunks {
                yield Ok(StreamEvent::Chunk {
                    message_id: message_id.clone(),
                    text: chunk,
                });
            }
            for call in turn.tool_calls {
                yield Ok(StreamEvent::ToolCall {
                    message_id: message_id.clone(),
                    call,
                });
            }
            yield Ok(StreamEvent::Done {
                usage: Some(turn.usage),
            });
        };
        Ok(Box::pin(stream))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use leon_domain::message::Message;

    fn req(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echoes_without_script() {
        let provider = ScriptedProvider::new("scripted");
        let resp = provider.chat(req("hello")).await.unwrap();
        assert_eq!(resp.content, "(scripted) hello");
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn scripted_turns_consumed_fifo() {
        let provider = ScriptedProvider::new("scripted");
        provider.push(ScriptedTurn::text("first"));
        provider.push(ScriptedTurn::text("second"));

        assert_eq!(provider.chat(req("x")).await.unwrap().content, "first");
        assert_eq!(provider.chat(req("x")).await.unwrap().content, "second");
        assert_eq!(provider.pending(), 0);
    }

    #[tokio::test]
    async fn stream_yields_chunks_then_tools_then_done() {
        let provider = ScriptedProvider::new("scripted");
        provider.push(ScriptedTurn {
            chunks: vec!["a".into(), "b".into()],
            tool_calls: vec![ToolCall {
                call_id: "tc_1".into(),
                tool_name: "shell".into(),
                arguments: serde_json::json!({}),
            }],
            ..Default::default()
        });

        let mut stream = provider.chat_stream(req("x")).await.unwrap();
        let mut kinds = Vec::new();
        let mut message_ids = Vec::new();
        while let Some(evt) = stream.next().await {
            match evt.unwrap() {
                StreamEvent::Chunk { message_id, .. } => {
                    kinds.push("chunk");
                    message_ids.push(message_id);
                }
                StreamEvent::ToolCall { .. } => kinds.push("tool"),
                StreamEvent::Done { .. } => kinds.push("done"),
                StreamEvent::Error { .. } => kinds.push("error"),
            }
        }
        assert_eq!(kinds, vec!["chunk", "chunk", "tool", "done"]);
        // Chunks of one turn share a message id.
        assert_eq!(message_ids[0], message_ids[1]);
    }

    #[tokio::test]
    async fn failing_turn_is_transient_upstream() {
        let provider = ScriptedProvider::new("scripted");
        provider.push(ScriptedTurn::failing("rate limited"));
        let err = provider.chat(req("x")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
