// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// SSE bridge over a batch task.
//
// Adapts one task subscription to a byte stream of `data: <json>\n\n`
// records: an `init` snapshot first, then either the replayed final
// event (late subscriber) or live events until a terminal one arrives.

use super::task::{BatchTask, SubscriptionKind, TaskEvent};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Build the event stream for one subscriber.
pub fn task_sse_stream(task: Arc<BatchTask>) -> ReceiverStream<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let subscription = task.subscribe();
        let init = TaskEvent::Init {
            snapshot: subscription.snapshot,
        };
        if send_event(&tx, &init).await.is_err() {
            return;
        }

        match subscription.kind {
            SubscriptionKind::Terminal(event) => {
                let _ = send_event(&tx, &event).await;
            }
            SubscriptionKind::Live { mut events, handle } => {
                while let Some(event) = events.recv().await {
                    let terminal = event.is_terminal();
                    if send_event(&tx, &event).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                task.unsubscribe(handle);
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Write one event as an SSE record. A consumer that went away is an
/// error (ends the subscription); a serialization failure is logged
/// and skipped, never propagated to the task.
async fn send_event(tx: &mpsc::Sender<Bytes>, event: &TaskEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize task event");
            return Ok(());
        }
    };
    tx.send(Bytes::from(format!("data: {json}\n\n")))
        .await
        .map_err(|_| ())
}
