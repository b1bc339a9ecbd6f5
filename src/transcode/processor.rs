// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// NDJSON -> OpenAI SSE transcoder.
//
// Consumes the upstream byte stream, reassembles NDJSON lines, and
// emits OpenAI `chat.completion.chunk` SSE records. Handles thinking
// bracketing, cross-chunk tag filtering, image and video side streams,
// and the layered timeout budgets. Every run ends with exactly one
// finish chunk, exactly one `[DONE]`, and exactly one finish-hook
// invocation, regardless of how the stream terminated.

use super::types::{FinishHook, FinishInfo, TranscodeError, TranscodeOptions};
use crate::assets::{encode_asset_path, img_proxy_url, normalize_generated_asset_urls, video_html};
use crate::filter::TagFilter;
use crate::frame::{GrokFrame, ResponseEnvelope, SearchResult};
use crate::openai::{sse_data, ChatCompletion, ChunkBuilder, DONE_EVENT};
use bytes::Bytes;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// One-shot NDJSON-to-SSE translator for a single upstream response.
pub struct Transcoder {
    opts: TranscodeOptions,
}

impl Transcoder {
    pub fn new(opts: TranscodeOptions) -> Self {
        Self { opts }
    }

    /// Translate `input` into an SSE byte stream.
    ///
    /// The returned stream yields well-formed `data:` records and is
    /// closed after the `[DONE]` sentinel. `on_finish` fires exactly
    /// once with the effective status and elapsed time.
    pub fn transcode<S, E>(
        self,
        input: S,
        on_finish: FinishHook,
    ) -> ReceiverStream<Bytes>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Bytes>(64);

        tokio::spawn(async move {
            let mut run = RunState::new(self.opts);
            let exit = run.pump(input, &tx).await;
            run.finalize(exit, &tx).await;
            on_finish(FinishInfo {
                status: run.final_status,
                duration: run.start.elapsed(),
            });
        });

        ReceiverStream::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// How the frame loop ended.
enum LoopExit {
    /// Normal stop: EOF, a timer expiry, or a transport stream error.
    /// The finish chunk has not been emitted yet.
    Clean,
    /// A terminal chunk carrying `finish_reason` was already emitted
    /// (upstream error, generated images, processing error).
    Finished,
    /// The SSE consumer went away; emit nothing further.
    Disconnected,
}

/// Outcome of handling a single frame.
enum Step {
    Continue,
    Exit(LoopExit),
}

/// Mutable state carried through one transcoding run.
struct RunState {
    opts: TranscodeOptions,
    chunks: ChunkBuilder,
    filter: TagFilter,
    start: Instant,
    last_chunk: Instant,
    first_received: bool,
    final_status: u16,
    model: String,
    is_image: bool,
    is_video: bool,
    is_thinking: bool,
    thinking_finished: bool,
    video_progress_started: bool,
    last_video_progress: i64,
    line_buf: String,
}

impl RunState {
    fn new(opts: TranscodeOptions) -> Self {
        let now = Instant::now();
        Self {
            chunks: ChunkBuilder::new(opts.stream_id.clone()),
            filter: TagFilter::new(opts.filter_tags.iter()),
            model: opts.model.clone(),
            opts,
            start: now,
            last_chunk: now,
            first_received: false,
            final_status: 200,
            is_image: false,
            is_video: false,
            is_thinking: false,
            thinking_finished: false,
            video_progress_started: false,
            last_video_progress: 0,
            line_buf: String::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    async fn pump<S, E>(&mut self, mut input: S, tx: &mpsc::Sender<Bytes>) -> LoopExit
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Display,
    {
        loop {
            // Deadline checks, in priority order. The first that fires
            // wins; all of them end in a clean stop except idle, which
            // is logged as a stall rather than treated as an error.
            let now = Instant::now();
            let budgets = &self.opts.timeouts;

            if !self.first_received
                && !budgets.first_response.is_zero()
                && now - self.start > budgets.first_response
            {
                tracing::warn!(stream = %self.opts.stream_id, "no first response within budget");
                return LoopExit::Clean;
            }
            if !budgets.total.is_zero() && now - self.start > budgets.total {
                tracing::warn!(stream = %self.opts.stream_id, "total budget exceeded");
                return LoopExit::Clean;
            }
            let effective_idle = if self.is_video {
                budgets.video_idle
            } else {
                budgets.idle
            };
            if self.first_received
                && !effective_idle.is_zero()
                && now - self.last_chunk > effective_idle
            {
                tracing::warn!(
                    stream = %self.opts.stream_id,
                    video = self.is_video,
                    "upstream idle beyond budget, closing stream"
                );
                return LoopExit::Clean;
            }
            if self.first_received
                && !budgets.chunk.is_zero()
                && now - self.last_chunk > budgets.chunk
            {
                tracing::warn!(stream = %self.opts.stream_id, "chunk gap backstop fired");
                return LoopExit::Clean;
            }

            // Race the read against the tightest remaining budget; on
            // expiry, loop back so the ordered checks decide.
            let next = match self.read_budget(now) {
                Some(budget) => match tokio::time::timeout(budget, input.next()).await {
                    Ok(item) => item,
                    Err(_) => continue,
                },
                None => input.next().await,
            };

            match next {
                None => {
                    // Upstream EOF: a final unterminated line still counts.
                    let rest = std::mem::take(&mut self.line_buf);
                    if let Step::Exit(exit) = self.handle_line(rest.trim_end(), tx).await {
                        return exit;
                    }
                    return LoopExit::Clean;
                }
                Some(Err(e)) => return self.classify_read_error(e, tx).await,
                Some(Ok(bytes)) => {
                    self.line_buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = self.line_buf.find('\n') {
                        let line: String = self.line_buf.drain(..=pos).collect();
                        if let Step::Exit(exit) =
                            self.handle_line(line.trim_end_matches(['\n', '\r']), tx).await
                        {
                            return exit;
                        }
                    }
                }
            }
        }
    }

    /// Tightest per-read budget: chunk gap (or first-response before any
    /// frame arrived), bounded by the remaining total budget.
    fn read_budget(&self, now: Instant) -> Option<Duration> {
        let budgets = &self.opts.timeouts;
        let gap = if self.first_received {
            budgets.chunk
        } else {
            budgets.first_response
        };

        let mut budget: Option<Duration> = if gap.is_zero() { None } else { Some(gap) };
        if !budgets.total.is_zero() {
            let remaining = budgets
                .total
                .saturating_sub(now - self.start)
                .max(Duration::from_millis(1));
            budget = Some(budget.map_or(remaining, |b| b.min(remaining)));
        }
        budget
    }

    async fn classify_read_error<E: Display>(
        &mut self,
        error: E,
        tx: &mpsc::Sender<Bytes>,
    ) -> LoopExit {
        let message = error.to_string();
        let lower = message.to_lowercase();
        // Transport hiccups on the upstream HTTP/2 connection end the
        // stream cleanly with a gateway status. The `stream` substring
        // is deliberately broad; such failures must never surface as an
        // error chunk.
        if lower.contains("http/2") || lower.contains("curl: (92)") || lower.contains("stream") {
            tracing::warn!(stream = %self.opts.stream_id, error = %message, "transport stream error");
            self.final_status = 502;
            return LoopExit::Clean;
        }

        tracing::error!(stream = %self.opts.stream_id, error = %message, "transcoding failed");
        self.final_status = 500;
        let chunk = self
            .chunks
            .finish(&self.model, Some(format!("处理错误: {message}")), "error");
        match self.send(tx, sse_data(&chunk)).await {
            Ok(()) => LoopExit::Finished,
            Err(()) => LoopExit::Disconnected,
        }
    }

    // -----------------------------------------------------------------------
    // Per-frame handling
    // -----------------------------------------------------------------------

    async fn handle_line(&mut self, line: &str, tx: &mpsc::Sender<Bytes>) -> Step {
        // Lines that fail to parse are skipped without aborting.
        let Some(frame) = GrokFrame::parse(line) else {
            return Step::Continue;
        };

        self.first_received = true;
        self.last_chunk = Instant::now();

        if let Some(message) = frame.error_message() {
            self.final_status = 500;
            let chunk = self
                .chunks
                .finish(&self.model, Some(format!("Error: {message}")), "stop");
            return match self.send(tx, sse_data(&chunk)).await {
                Ok(()) => Step::Exit(LoopExit::Finished),
                Err(()) => Step::Exit(LoopExit::Disconnected),
            };
        }

        let Some(resp) = frame.response().cloned() else {
            return Step::Continue;
        };

        if let Some(model) = resp.display_model() {
            self.model = model.to_string();
        }

        if let Some(video) = &resp.video {
            return self.handle_video_frame(video.clone(), tx).await;
        }

        if resp.image_attachment_info.is_some() {
            self.is_image = true;
        }

        if self.is_image {
            return self.handle_image_frame(&resp, tx).await;
        }

        self.handle_text_frame(&resp, tx).await
    }

    async fn handle_video_frame(
        &mut self,
        video: crate::frame::VideoGeneration,
        tx: &mpsc::Sender<Bytes>,
    ) -> Step {
        self.is_video = true;

        if let Some(progress) = video.progress {
            if progress > self.last_video_progress {
                if self.opts.show_thinking {
                    let open = if self.video_progress_started { "" } else { "<think>" };
                    let close = if progress >= 100 { "</think>\n" } else { "\n" };
                    let text = format!("{open}视频已生成{progress}%{close}");
                    let chunk = self.chunks.delta(&self.model, text);
                    if self.send(tx, sse_data(&chunk)).await.is_err() {
                        return Step::Exit(LoopExit::Disconnected);
                    }
                    self.video_progress_started = true;
                }
                self.last_video_progress = progress;
            }
        }

        if let Some(url) = video.video_url.as_deref().filter(|u| !u.is_empty()) {
            let assets = &self.opts.assets;
            let video_url = img_proxy_url(&assets.base_url, &assets.origin, &encode_asset_path(url));
            let poster_url = video
                .thumbnail_image_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .map(|u| img_proxy_url(&assets.base_url, &assets.origin, &encode_asset_path(u)));
            let html = video_html(
                &video_url,
                poster_url.as_deref(),
                assets.video_poster_preview,
            );
            let chunk = self.chunks.delta(&self.model, html);
            if self.send(tx, sse_data(&chunk)).await.is_err() {
                return Step::Exit(LoopExit::Disconnected);
            }
        }

        Step::Continue
    }

    async fn handle_image_frame(
        &mut self,
        resp: &ResponseEnvelope,
        tx: &mpsc::Sender<Bytes>,
    ) -> Step {
        if let Some(urls) = resp
            .model_response
            .as_ref()
            .and_then(|mr| mr.generated_image_urls.as_deref())
        {
            let urls = normalize_generated_asset_urls(urls);
            if !urls.is_empty() {
                let assets = &self.opts.assets;
                let markdown = urls
                    .iter()
                    .map(|u| {
                        let proxied =
                            img_proxy_url(&assets.base_url, &assets.origin, &encode_asset_path(u));
                        format!("![image]({proxied})")
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let chunk = self.chunks.finish(&self.model, Some(markdown), "stop");
                return match self.send(tx, sse_data(&chunk)).await {
                    Ok(()) => Step::Exit(LoopExit::Finished),
                    Err(()) => Step::Exit(LoopExit::Disconnected),
                };
            }
        }

        // Image-mode progress text passes through unfiltered.
        if let Some(token) = resp.token_str() {
            let chunk = self.chunks.delta(&self.model, token);
            if self.send(tx, sse_data(&chunk)).await.is_err() {
                return Step::Exit(LoopExit::Disconnected);
            }
        }

        Step::Continue
    }

    async fn handle_text_frame(
        &mut self,
        resp: &ResponseEnvelope,
        tx: &mpsc::Sender<Bytes>,
    ) -> Step {
        let Some(token) = resp.token_str() else {
            return Step::Continue;
        };

        let mut text = self.filter.filter(token);
        if text.is_empty() {
            return Step::Continue;
        }

        let current_thinking = resp.is_thinking.unwrap_or(false);

        // Search citations: a tool usage card paired with a results
        // array is only rendered inside a surfaced thinking region and
        // skipped everywhere else. A card id without a results array is
        // an ordinary token frame.
        if resp.tool_usage_card_id.is_some() {
            if let Some(results) = resp.search_results() {
                if current_thinking && self.opts.show_thinking {
                    append_citations(&mut text, results);
                } else {
                    return Step::Continue;
                }
            }
        }

        if resp.message_tag.as_deref() == Some("header") {
            text = format!("\n\n{text}\n\n");
        }

        // Thinking bracketing. A closed thinking region never reopens.
        if current_thinking && !self.opts.show_thinking {
            self.is_thinking = current_thinking;
            return Step::Continue;
        }
        if current_thinking && self.thinking_finished {
            self.is_thinking = current_thinking;
            return Step::Continue;
        }
        if !self.is_thinking && current_thinking {
            text = format!("<think>\n{text}");
        } else if self.is_thinking && !current_thinking {
            if self.opts.show_thinking && !self.thinking_finished {
                text = format!("\n</think>\n{text}");
            }
            self.thinking_finished = true;
        }
        self.is_thinking = current_thinking;

        let chunk = self.chunks.delta(&self.model, text);
        match self.send(tx, sse_data(&chunk)).await {
            Ok(()) => Step::Continue,
            Err(()) => Step::Exit(LoopExit::Disconnected),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal paths
    // -----------------------------------------------------------------------

    async fn finalize(&mut self, exit: LoopExit, tx: &mpsc::Sender<Bytes>) {
        match exit {
            LoopExit::Clean => {
                // Release bytes still held for tag disambiguation and
                // close an open thinking region so the bracket grammar
                // holds even on truncated upstreams.
                let mut tail = self.filter.flush();
                if self.is_thinking && !self.thinking_finished && self.opts.show_thinking {
                    tail.push_str("\n</think>\n");
                }
                if !tail.is_empty() {
                    let chunk = self.chunks.delta(&self.model, tail);
                    if self.send(tx, sse_data(&chunk)).await.is_err() {
                        return;
                    }
                }

                let stop = self.chunks.finish(&self.model, None, "stop");
                if self.send(tx, sse_data(&stop)).await.is_err() {
                    return;
                }
                let _ = self.send(tx, Bytes::from_static(DONE_EVENT)).await;
            }
            LoopExit::Finished => {
                let _ = self.send(tx, Bytes::from_static(DONE_EVENT)).await;
            }
            LoopExit::Disconnected => {}
        }
    }

    async fn send(&self, tx: &mpsc::Sender<Bytes>, bytes: Bytes) -> Result<(), ()> {
        tx.send(bytes).await.map_err(|_| ())
    }
}

fn append_citations(text: &mut String, results: &[SearchResult]) {
    for result in results {
        let title = result.title.as_deref().unwrap_or("");
        let url = result.url.as_deref().unwrap_or("");
        let preview = result
            .preview
            .as_deref()
            .unwrap_or("")
            .replace(['\n', '\r'], " ");
        text.push_str(&format!("\n- [{title}]({url} \"{preview}\")"));
    }
    text.push('\n');
}

// ---------------------------------------------------------------------------
// Non-streaming aggregation
// ---------------------------------------------------------------------------

/// Drain an upstream response into a single `chat.completion` body.
///
/// Prefers the upstream's own `modelResponse.message`; otherwise the
/// token deltas are accumulated. Tag filtering is applied to the final
/// content in one pass.
pub async fn collect_completion<S, E>(
    mut input: S,
    opts: &TranscodeOptions,
) -> Result<ChatCompletion, TranscodeError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: Display,
{
    let mut model = opts.model.clone();
    let mut accumulated = String::new();
    let mut final_message: Option<String> = None;
    let mut line_buf = String::new();
    let mut in_thinking = false;
    let mut thinking_open = false;

    let deadline = if opts.timeouts.total.is_zero() {
        None
    } else {
        Some(Instant::now() + opts.timeouts.total)
    };

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, input.next()).await {
                Ok(item) => item,
                // Total budget exhausted: use what we have.
                Err(_) => break,
            },
            None => input.next().await,
        };
        let Some(item) = next else { break };
        let bytes = item.map_err(|e| TranscodeError::Read(e.to_string()))?;
        line_buf.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=pos).collect();
            let Some(frame) = GrokFrame::parse(&line) else {
                continue;
            };
            if let Some(message) = frame.error_message() {
                return Err(TranscodeError::Upstream(message.to_string()));
            }
            let Some(resp) = frame.response() else {
                continue;
            };
            if let Some(m) = resp.display_model() {
                model = m.to_string();
            }
            if let Some(mr) = &resp.model_response {
                if let Some(error) = mr.error.as_deref().filter(|e| !e.is_empty()) {
                    return Err(TranscodeError::Upstream(error.to_string()));
                }
                if let Some(m) = mr.model.as_deref().filter(|m| !m.is_empty()) {
                    model = m.to_string();
                }
                if let Some(message) = mr.message.as_deref().filter(|m| !m.is_empty()) {
                    final_message = Some(message.to_string());
                }
            }
            if let Some(token) = resp.token_str() {
                let current = resp.is_thinking.unwrap_or(false);
                if current && !opts.show_thinking {
                    in_thinking = current;
                    continue;
                }
                if current && !in_thinking {
                    accumulated.push_str("<think>\n");
                    thinking_open = true;
                } else if !current && in_thinking && thinking_open {
                    accumulated.push_str("\n</think>\n");
                    thinking_open = false;
                }
                accumulated.push_str(token);
                in_thinking = current;
            }
        }
    }

    if thinking_open {
        accumulated.push_str("\n</think>\n");
    }

    let raw = final_message.unwrap_or(accumulated);
    let mut filter = TagFilter::new(opts.filter_tags.iter());
    let mut content = filter.filter(&raw);
    content.push_str(&filter.flush());

    Ok(ChatCompletion::assistant(
        opts.stream_id.clone(),
        model,
        content,
    ))
}
