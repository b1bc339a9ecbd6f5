// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Tests for batch tasks, the worker pool, and the SSE bridge.
//
// Tests cover:
//  1. Task ids are 32 hex chars; counters hold processed = ok + fail
//  2. Progress events arrive in record order
//  3. Terminal transitions happen exactly once; final event immutable
//  4. Late subscribers replay init + final event only
//  5. Worker pool bounds concurrency and drains FIFO
//  6. Processor errors are recorded as failures
//  7. Cancellation drains cooperatively and terminates as cancelled
//  8. Registry expiry removes terminated tasks
//  9. Dead subscribers are dropped without disturbing the producer

use super::*;
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

struct NamedItem(String);

impl BatchItem for NamedItem {
    fn label(&self) -> String {
        self.0.clone()
    }
}

fn items(n: usize) -> Vec<NamedItem> {
    (0..n).map(|i| NamedItem(format!("item-{i}"))).collect()
}

fn result_map(key: &str, value: i64) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), serde_json::Value::from(value));
    map
}

async fn collect_bridge(stream: tokio_stream::wrappers::ReceiverStream<Bytes>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    tokio::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        for record in text.split("\n\n").filter(|r| !r.is_empty()) {
            let data = record.strip_prefix("data: ").unwrap();
            events.push(serde_json::from_str(data).unwrap());
        }
    }
    events
}

// ---------------------------------------------------------------------------
// Test 1: ids and counter invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_id_is_32_hex_chars() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(3);
    assert_eq!(task.id().len(), 32);
    assert!(task.id().chars().all(|c| c.is_ascii_hexdigit()));
    assert!(registry.get(task.id()).is_some());
}

#[tokio::test]
async fn counters_hold_processed_equals_ok_plus_fail() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(3);

    task.record(RecordOutcome {
        ok: true,
        item: Some("a".into()),
        ..Default::default()
    });
    task.record(RecordOutcome {
        ok: false,
        error: Some("nope".into()),
        ..Default::default()
    });

    let snap = task.snapshot();
    assert_eq!(snap.processed, 2);
    assert_eq!(snap.ok, 1);
    assert_eq!(snap.fail, 1);
    assert_eq!(snap.processed, snap.ok + snap.fail);
    assert_eq!(snap.status, TaskStatus::Running);
}

// ---------------------------------------------------------------------------
// Test 2: progress events arrive in record order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_events_in_record_order() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(3);

    let SubscriptionKind::Live { mut events, .. } = task.subscribe().kind else {
        panic!("task must be live");
    };

    for i in 0..3 {
        task.record(RecordOutcome {
            ok: true,
            item: Some(format!("item-{i}")),
            ..Default::default()
        });
    }

    for expected in 1..=3u64 {
        match events.recv().await.unwrap() {
            TaskEvent::Progress { processed, item, .. } => {
                assert_eq!(processed, expected);
                assert_eq!(item.unwrap(), format!("item-{}", expected - 1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Test 3: terminal transitions exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_transition_is_exactly_once() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(1);

    assert!(task.finish(result_map("n", 1), None));
    assert_eq!(task.status(), TaskStatus::Done);

    // Subsequent terminal calls and records are ignored.
    assert!(!task.fail("too late"));
    assert!(!task.finish_cancelled());
    task.record(RecordOutcome {
        ok: true,
        ..Default::default()
    });

    assert_eq!(task.status(), TaskStatus::Done);
    assert_eq!(task.snapshot().processed, 0);
    assert!(matches!(task.final_event(), Some(TaskEvent::Done { .. })));
}

#[tokio::test]
async fn fail_sets_error_status_and_event() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(1);
    assert!(task.fail("exploded"));
    assert_eq!(task.status(), TaskStatus::Error);
    match task.final_event().unwrap() {
        TaskEvent::Error { error } => assert_eq!(error, "exploded"),
        other => panic!("unexpected event: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test 4: late subscribers replay init + final event only
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_replays_init_and_final_event() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(2);

    task.record(RecordOutcome {
        ok: true,
        ..Default::default()
    });
    task.record(RecordOutcome {
        ok: true,
        ..Default::default()
    });
    task.finish(result_map("n", 2), None);

    let events = collect_bridge(task_sse_stream(Arc::clone(&task))).await;

    assert_eq!(events.len(), 2, "late subscriber sees init + final only");
    assert_eq!(events[0]["event"], "init");
    assert_eq!(events[0]["status"], "done");
    assert_eq!(events[0]["processed"], 2);
    assert_eq!(events[0]["ok"], 2);
    assert_eq!(events[1]["event"], "done");
    assert_eq!(events[1]["result"]["n"], 2);
}

#[tokio::test]
async fn live_subscriber_sees_progress_then_terminal() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(1);

    let bridge = tokio::spawn(collect_bridge(task_sse_stream(Arc::clone(&task))));
    // Give the bridge a tick to attach before producing.
    tokio::task::yield_now().await;

    task.record(RecordOutcome {
        ok: true,
        item: Some("only".into()),
        ..Default::default()
    });
    task.finish(result_map("n", 1), Some("partial data".into()));

    let events = bridge.await.unwrap();
    assert_eq!(events[0]["event"], "init");
    assert_eq!(events[0]["status"], "running");

    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert!(kinds.contains(&"done"));
    assert_eq!(*kinds.last().unwrap(), "done");
    let done = events.last().unwrap();
    assert_eq!(done["warning"], "partial data");
}

// ---------------------------------------------------------------------------
// Test 5: worker pool bounds concurrency and drains FIFO
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_never_exceeds_configured_concurrency() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(20);

    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let live_ref = Arc::clone(&live);
    let peak_ref = Arc::clone(&peak);
    run_in_batches(
        items(20),
        Arc::clone(&task),
        move |_item: NamedItem| {
            let live = Arc::clone(&live_ref);
            let peak = Arc::clone(&peak_ref);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Infallible>(ItemOutcome::succeeded())
            }
        },
        3,
    )
    .await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let snap = task.snapshot();
    assert_eq!(snap.processed, 20);
    assert_eq!(snap.ok, 20);
}

#[tokio::test]
async fn pool_with_more_workers_than_items_processes_everything_once() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(2);

    run_in_batches(
        items(2),
        Arc::clone(&task),
        |_item: NamedItem| async { Ok::<_, Infallible>(ItemOutcome::succeeded()) },
        DEFAULT_CONCURRENCY,
    )
    .await;

    assert_eq!(task.snapshot().processed, 2);
}

// ---------------------------------------------------------------------------
// Test 6: processor errors are recorded as failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn processor_errors_recorded_as_failures() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(4);

    run_in_batches(
        items(4),
        Arc::clone(&task),
        |item: NamedItem| async move {
            if item.0.ends_with(['1', '3']) {
                Err(std::io::Error::other("credential rejected"))
            } else {
                Ok(ItemOutcome::succeeded())
            }
        },
        2,
    )
    .await;

    let snap = task.snapshot();
    assert_eq!(snap.processed, 4);
    assert_eq!(snap.ok, 2);
    assert_eq!(snap.fail, 2);
}

// ---------------------------------------------------------------------------
// Test 7: cancellation drains cooperatively
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_stops_remaining_items_and_finishes_cancelled() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(50);

    let task_ref = Arc::clone(&task);
    run_in_batches(
        items(50),
        Arc::clone(&task),
        move |_item: NamedItem| {
            let task = Arc::clone(&task_ref);
            async move {
                // Cancel mid-run, from inside the third processed item.
                if task.snapshot().processed == 2 {
                    task.cancel();
                }
                Ok::<_, Infallible>(ItemOutcome::succeeded())
            }
        },
        1,
    )
    .await;

    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert!(matches!(task.final_event(), Some(TaskEvent::Cancelled)));
    let snap = task.snapshot();
    assert!(snap.processed < 50, "cancellation must stop the queue");
    assert_eq!(snap.processed, snap.ok + snap.fail);
}

// ---------------------------------------------------------------------------
// Test 8: registry expiry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expiry_removes_terminated_tasks_after_delay() {
    let registry = Arc::new(TaskRegistry::new());
    let task = registry.create_task(0);
    task.finish(result_map("n", 0), None);

    Arc::clone(&registry).expire_task(task.id().to_string(), DEFAULT_EXPIRY);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(registry.get(task.id()).is_some(), "not yet expired");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(registry.get(task.id()).is_none(), "expired");
}

// ---------------------------------------------------------------------------
// Test 9: dead subscribers dropped without disturbing the producer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_subscribers_are_dropped_on_publish() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(2);

    let dropped = task.subscribe();
    drop(dropped);

    let SubscriptionKind::Live { mut events, .. } = task.subscribe().kind else {
        panic!("task must be live");
    };

    task.record(RecordOutcome {
        ok: true,
        ..Default::default()
    });
    task.finish(result_map("n", 1), None);

    // The surviving subscriber still sees everything.
    assert!(matches!(
        events.recv().await.unwrap(),
        TaskEvent::Progress { .. }
    ));
    assert!(matches!(events.recv().await.unwrap(), TaskEvent::Done { .. }));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let registry = TaskRegistry::new();
    let task = registry.create_task(1);

    let SubscriptionKind::Live { mut events, handle } = task.subscribe().kind else {
        panic!("task must be live");
    };
    task.unsubscribe(handle);

    task.record(RecordOutcome {
        ok: true,
        ..Default::default()
    });

    // Channel closed because the sender side was removed.
    assert!(events.recv().await.is_none());
}
