// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Upstream NDJSON to OpenAI SSE transcoding.
//
// Responsibilities:
// - Reassemble NDJSON lines from the upstream byte stream
// - Emit OpenAI `chat.completion.chunk` SSE records in frame order
// - Bracket chain-of-thought in `<think>` markers (at most one region)
// - Route image and video side streams to their special emissions
// - Enforce the four layered timeout budgets plus the video idle override
// - Always terminate with one finish chunk, one `[DONE]`, one finish hook

mod processor;
mod types;

pub use processor::{collect_completion, Transcoder};
pub use types::{
    AssetContext, FinishHook, FinishInfo, TimeoutBudgets, TranscodeError, TranscodeOptions,
};
