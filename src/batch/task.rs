// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Batch task lifecycle and pub/sub.
//
// A task tracks counters for one bounded-concurrency admin job and
// publishes progress to any number of subscribers. Terminal state is
// recorded exactly once as an immutable final event so that late
// subscribers can still observe the outcome.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a terminated task stays queryable before the registry
/// drops it.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Done,
    Error,
    Cancelled,
}

/// Counter snapshot carried by the `init` event.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub total: u64,
    pub processed: u64,
    pub ok: u64,
    pub fail: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Events delivered to subscribers, tagged for the SSE wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TaskEvent {
    Init {
        #[serde(flatten)]
        snapshot: TaskSnapshot,
    },
    Progress {
        processed: u64,
        total: u64,
        ok: u64,
        fail: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        item: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Done {
        result: serde_json::Map<String, serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Error {
        error: String,
    },
    Cancelled,
}

impl TaskEvent {
    /// Whether this event ends a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Done { .. } | TaskEvent::Error { .. } | TaskEvent::Cancelled
        )
    }
}

/// One processed item, as reported to `record`.
#[derive(Debug, Clone, Default)]
pub struct RecordOutcome {
    pub ok: bool,
    pub item: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// BatchTask
// ---------------------------------------------------------------------------

struct TaskInner {
    total: u64,
    processed: u64,
    ok: u64,
    fail: u64,
    status: TaskStatus,
    warning: Option<String>,
    final_event: Option<TaskEvent>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<TaskEvent>)>,
    next_subscriber: u64,
}

/// A single batch job. Counters are mutated only by the producer side
/// (workers and the terminal methods); subscribers observe events in
/// publication order. All mutation is serialized behind one mutex, and
/// publication delivers into unbounded per-subscriber channels so the
/// producer never blocks on a slow consumer.
pub struct BatchTask {
    id: String,
    created_at: DateTime<Utc>,
    cancelled: AtomicBool,
    inner: Mutex<TaskInner>,
}

/// Outcome of `subscribe`: either the task already terminated (replay
/// the final event and stop) or a live event channel.
pub struct Subscription {
    pub snapshot: TaskSnapshot,
    pub kind: SubscriptionKind,
}

pub enum SubscriptionKind {
    /// Task already terminated; this is the final event to replay.
    Terminal(TaskEvent),
    Live {
        events: mpsc::UnboundedReceiver<TaskEvent>,
        handle: u64,
    },
}

impl BatchTask {
    fn new(id: String, total: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                total,
                processed: 0,
                ok: 0,
                fail: 0,
                status: TaskStatus::Running,
                warning: None,
                final_event: None,
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.inner.lock().unwrap();
        snapshot_of(&self.id, &inner)
    }

    /// Record one processed item and publish a progress event.
    /// Ignored once the task has terminated.
    pub fn record(&self, outcome: RecordOutcome) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != TaskStatus::Running {
            return;
        }
        inner.processed += 1;
        if outcome.ok {
            inner.ok += 1;
        } else {
            inner.fail += 1;
        }
        let event = TaskEvent::Progress {
            processed: inner.processed,
            total: inner.total,
            ok: inner.ok,
            fail: inner.fail,
            item: outcome.item,
            detail: outcome.detail,
            error: outcome.error,
        };
        publish(&mut inner, event);
    }

    /// Terminate successfully. Returns false if a terminal method
    /// already ran.
    pub fn finish(
        &self,
        result: serde_json::Map<String, serde_json::Value>,
        warning: Option<String>,
    ) -> bool {
        self.terminate(TaskStatus::Done, |inner| {
            inner.warning.clone_from(&warning);
            TaskEvent::Done {
                result,
                warning,
            }
        })
    }

    /// Terminate with a task-level error.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        self.terminate(TaskStatus::Error, |_| TaskEvent::Error { error })
    }

    /// Terminal transition after a cancelled run drains.
    pub fn finish_cancelled(&self) -> bool {
        self.terminate(TaskStatus::Cancelled, |_| TaskEvent::Cancelled)
    }

    /// Request cooperative cancellation. Workers check this between
    /// items; the terminal transition happens only once they drain.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().unwrap().status
    }

    /// The immutable terminal event, once set.
    pub fn final_event(&self) -> Option<TaskEvent> {
        self.inner.lock().unwrap().final_event.clone()
    }

    /// Snapshot and attach in one step, so a subscriber arriving while
    /// the task terminates sees either the live channel or the final
    /// event, never neither.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = snapshot_of(&self.id, &inner);
        if let Some(event) = inner.final_event.clone() {
            return Subscription {
                snapshot,
                kind: SubscriptionKind::Terminal(event),
            };
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push((handle, tx));
        Subscription {
            snapshot,
            kind: SubscriptionKind::Live { events: rx, handle },
        }
    }

    pub fn unsubscribe(&self, handle: u64) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .retain(|(id, _)| *id != handle);
    }

    fn terminate<F>(&self, status: TaskStatus, build: F) -> bool
    where
        F: FnOnce(&mut TaskInner) -> TaskEvent,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.final_event.is_some() {
            return false;
        }
        inner.status = status;
        let event = build(&mut inner);
        inner.final_event = Some(event.clone());
        publish(&mut inner, event);
        true
    }
}

fn snapshot_of(id: &str, inner: &TaskInner) -> TaskSnapshot {
    TaskSnapshot {
        id: id.to_string(),
        status: inner.status,
        total: inner.total,
        processed: inner.processed,
        ok: inner.ok,
        fail: inner.fail,
        warning: inner.warning.clone(),
    }
}

/// Deliver to every subscriber; ones whose channel is gone are dropped.
fn publish(inner: &mut TaskInner, event: TaskEvent) {
    inner
        .subscribers
        .retain(|(_, tx)| tx.send(event.clone()).is_ok());
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Process-wide map of live tasks, owned by application state and
/// injected where needed. Expiry is the only release path.
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<BatchTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Allocate a task with a fresh 32-hex-char id and register it.
    pub fn create_task(&self, total: u64) -> Arc<BatchTask> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let task = Arc::new(BatchTask::new(id.clone(), total));
        self.tasks.insert(id, Arc::clone(&task));
        task
    }

    pub fn get(&self, id: &str) -> Option<Arc<BatchTask>> {
        self.tasks.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop the task after `delay`. Call once the terminal event is
    /// recorded; subscribers attached before the deadline still replay.
    pub fn expire_task(self: Arc<Self>, id: impl Into<String>, delay: Duration) {
        let id = id.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if self.tasks.remove(&id).is_some() {
                tracing::debug!(task = %id, "expired batch task");
            }
        });
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
