use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::message::ToolCall;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text chunk. Chunks sharing `message_id` belong to one model
    /// message; the server emits each chunk individually and clients
    /// deduplicate by `message_id`.
    #[serde(rename = "chunk")]
    Chunk { message_id: String, text: String },

    /// A fully-assembled tool call.
    #[serde(rename = "tool_call")]
    ToolCall { message_id: String, call: ToolCall },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done { usage: Option<Usage> },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for one model call, including prompt-cache subfields when
/// the provider reports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if let Some(r) = other.cache_read_tokens {
            *self.cache_read_tokens.get_or_insert(0) += r;
        }
        if let Some(w) = other.cache_write_tokens {
            *self.cache_write_tokens.get_or_insert(0) += w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_accumulates_cache_fields() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: Some(3),
            cache_write_tokens: None,
        });
        total.add(&Usage {
            input_tokens: 2,
            output_tokens: 1,
            cache_read_tokens: Some(4),
            cache_write_tokens: Some(8),
        });
        assert_eq!(total.total(), 18);
        assert_eq!(total.cache_read_tokens, Some(7));
        assert_eq!(total.cache_write_tokens, Some(8));
    }
}
