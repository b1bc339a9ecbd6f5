// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Bounded worker pool.
//
// Runs a processor over an item queue with a fixed number of workers.
// Cancellation is cooperative: checked between items, never preempting
// an in-flight call. Worker failures are recorded on the task, not
// propagated.

use super::task::{BatchTask, RecordOutcome};
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Something the pool can process: carries the label used in progress
/// events.
pub trait BatchItem: Send + 'static {
    fn label(&self) -> String;
}

/// What a processor reports for one item.
#[derive(Debug, Clone, Default)]
pub struct ItemOutcome {
    pub ok: bool,
    pub detail: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded() -> Self {
        Self {
            ok: true,
            detail: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: None,
            error: Some(error.into()),
        }
    }
}

/// Process `items` with at most `concurrency` concurrent invocations.
///
/// Items are pulled FIFO from a shared queue; each result (including
/// processor errors) is recorded on the task. When the run was
/// cancelled, the pool performs the terminal transition itself once
/// all workers drain; otherwise the caller finishes the task.
pub async fn run_in_batches<T, F, Fut, E>(
    items: Vec<T>,
    task: Arc<BatchTask>,
    processor: F,
    concurrency: usize,
) where
    T: BatchItem,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<ItemOutcome, E>> + Send + 'static,
    E: Display,
{
    let workers = concurrency.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let task = Arc::clone(&task);
        let processor = processor.clone();
        set.spawn(async move {
            loop {
                if task.is_cancelled() {
                    break;
                }
                let item = queue.lock().unwrap().pop_front();
                let Some(item) = item else { break };
                let label = item.label();
                let outcome = match processor(item).await {
                    Ok(outcome) => outcome,
                    Err(e) => ItemOutcome::failed(e.to_string()),
                };
                task.record(RecordOutcome {
                    ok: outcome.ok,
                    item: Some(label),
                    detail: outcome.detail,
                    error: outcome.error,
                });
            }
        });
    }

    while set.join_next().await.is_some() {}

    if task.is_cancelled() {
        task.finish_cancelled();
    }
}
