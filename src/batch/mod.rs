// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Batch admin jobs.
//
// Responsibilities:
// - Task lifecycle: counters, status transitions, immutable final event
// - Pub/sub with per-subscriber channels and late-subscriber replay
// - Bounded worker pool with cooperative cancellation
// - SSE bridge exposing one task to any number of observers

mod pool;
mod sse;
mod task;

pub use pool::{run_in_batches, BatchItem, ItemOutcome, DEFAULT_CONCURRENCY};
pub use sse::task_sse_stream;
pub use task::{
    BatchTask, RecordOutcome, Subscription, SubscriptionKind, TaskEvent, TaskRegistry,
    TaskSnapshot, TaskStatus, DEFAULT_EXPIRY,
};

#[cfg(test)]
mod tests;
