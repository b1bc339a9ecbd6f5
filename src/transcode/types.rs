// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Transcoder types: options, timeout budgets, finish reporting, errors.

use std::time::Duration;

/// The four layered timeout budgets, plus the idle override that
/// applies while a video generation is in flight. A zero duration
/// disables that budget.
#[derive(Debug, Clone)]
pub struct TimeoutBudgets {
    /// Maximum wait for the first upstream frame.
    pub first_response: Duration,
    /// Maximum gap between upstream reads once streaming (backstop).
    pub chunk: Duration,
    /// Whole-response ceiling. The only budget that truncates an
    /// in-flight read.
    pub total: Duration,
    /// Maximum gap between parsed frames.
    pub idle: Duration,
    /// Replaces `idle` while the stream is in video mode.
    pub video_idle: Duration,
}

impl Default for TimeoutBudgets {
    fn default() -> Self {
        Self {
            first_response: Duration::from_secs(30),
            chunk: Duration::from_secs(90),
            total: Duration::from_secs(600),
            idle: Duration::from_secs(120),
            video_idle: Duration::from_secs(600),
        }
    }
}

/// Where rewritten asset URLs point.
#[derive(Debug, Clone, Default)]
pub struct AssetContext {
    /// Configured public base URL; empty means use `origin`.
    pub base_url: String,
    /// Scheme + authority of the inbound request.
    pub origin: String,
    /// Render video completions as a clickable poster block.
    pub video_poster_preview: bool,
}

/// Per-stream transcoding options. Built by the handler from the
/// settings store and the inbound request.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// SSE id stamped on every chunk (`chatcmpl-…`).
    pub stream_id: String,
    /// Requested model; replaced when the upstream names one.
    pub model: String,
    /// Tag names the cross-chunk filter suppresses.
    pub filter_tags: Vec<String>,
    /// Surface chain-of-thought wrapped in `<think>` brackets.
    pub show_thinking: bool,
    pub timeouts: TimeoutBudgets,
    pub assets: AssetContext,
}

impl TranscodeOptions {
    pub fn new(stream_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            model: model.into(),
            filter_tags: Vec::new(),
            show_thinking: true,
            timeouts: TimeoutBudgets::default(),
            assets: AssetContext::default(),
        }
    }
}

/// Handed to the completion hook exactly once per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishInfo {
    /// Effective status for request logging: 200 on success, 500 on
    /// upstream/processing errors, 502 on transport stream errors.
    pub status: u16,
    pub duration: Duration,
}

/// Invoked exactly once on any terminal path.
pub type FinishHook = Box<dyn FnOnce(FinishInfo) + Send + 'static>;

/// Errors surfaced by the non-streaming aggregation path. Streaming
/// terminal conditions are encoded in the SSE output instead.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream read failed: {0}")]
    Read(String),
}
