// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// OpenAI wire representation.
//
// These are the canonical output types the transcoder and the
// non-streaming handler produce. Streaming responses are framed as
// SSE `data: <json>\n\n` records ending with `data: [DONE]\n\n`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Streaming terminator, sent exactly once at the end of every stream.
pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

/// A single streamed chunk: `{"object":"chat.completion.chunk",...}`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Incremental message payload. `role` is set on the first chunk of a
/// stream only; `content` is absent on the bare finish chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Non-streaming completion body (`object: "chat.completion"`).
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Chunk construction
// ---------------------------------------------------------------------------

/// Builds chunks for one stream: same `id`, per-chunk timestamps, and
/// whatever model name is current when the chunk is emitted.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    id: String,
    role_sent: bool,
}

impl ChunkBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role_sent: false,
        }
    }

    /// A content delta chunk. The first delta of a stream also carries
    /// `role: "assistant"`.
    pub fn delta(&mut self, model: &str, content: impl Into<String>) -> ChatCompletionChunk {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        };
        self.chunk(
            model,
            Delta {
                role,
                content: Some(content.into()),
            },
            None,
        )
    }

    /// A terminal chunk with `finish_reason` set. `content` is included
    /// when the terminal event carries assistant-visible text (upstream
    /// errors, generated image links).
    pub fn finish(
        &mut self,
        model: &str,
        content: Option<String>,
        reason: &str,
    ) -> ChatCompletionChunk {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        };
        self.chunk(
            model,
            Delta { role, content },
            Some(reason.to_string()),
        )
    }

    fn chunk(&self, model: &str, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

impl ChatCompletion {
    /// Build a non-streaming completion with a single assistant choice.
    pub fn assistant(id: impl Into<String>, model: impl Into<String>, content: String) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: None,
        }
    }
}

/// Encode a serializable payload as one SSE record.
pub fn sse_data<T: Serialize>(payload: &T) -> Bytes {
    // Serialization of our own wire types cannot fail.
    let json = serde_json::to_string(payload).expect("SSE payload serialization");
    Bytes::from(format!("data: {json}\n\n"))
}

/// Generate a stream id in the `chatcmpl-<32 hex>` form.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
