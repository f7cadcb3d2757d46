// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered, non-failing append queue
//!
//! One queue exists per turn. Events are handed to a single worker task over
//! an unbounded channel, so the reader never waits on storage and two events
//! can never be written out of order.

use std::sync::Arc;

use af_domain_types::CanonicalEvent;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::EventLog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendStats {
    pub written: usize,
    pub failed: usize,
}

pub struct AppendQueue {
    tx: mpsc::UnboundedSender<CanonicalEvent>,
    worker: JoinHandle<AppendStats>,
}

impl AppendQueue {
    pub fn spawn(log: Arc<dyn EventLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CanonicalEvent>();
        let worker = tokio::spawn(async move {
            let mut stats = AppendStats::default();
            while let Some(event) = rx.recv().await {
                match log.append(&event).await {
                    Ok(id) => {
                        stats.written += 1;
                        debug!(id, kind = %event.kind, task_id = %event.task_id, "Event appended");
                    }
                    Err(e) => {
                        stats.failed += 1;
                        warn!(
                            kind = %event.kind,
                            task_id = %event.task_id,
                            "Dropping event after append failure: {}",
                            e
                        );
                    }
                }
            }
            stats
        });
        Self { tx, worker }
    }

    /// Queue an event behind every event enqueued before it
    pub fn enqueue(&self, event: CanonicalEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(kind = %e.0.kind, "Append worker is gone, event dropped");
        }
    }

    /// Close the queue and wait until every queued event was attempted
    pub async fn drain(self) -> AppendStats {
        drop(self.tx);
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Append worker terminated abnormally: {}", e);
                AppendStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, StoreResult};
    use af_domain_types::NormalizedEvent;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(seq: usize) -> CanonicalEvent {
        CanonicalEvent::from_normalized(
            "task-1",
            "turn-1",
            None,
            NormalizedEvent::assistant_text(seq.to_string(), None),
        )
    }

    /// Event log whose appends take a per-event delay
    struct SlowLog {
        delays_ms: Vec<u64>,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EventLog for SlowLog {
        async fn append(&self, event: &CanonicalEvent) -> StoreResult<i64> {
            let seq: usize = event.as_normalized().text().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(self.delays_ms[seq])).await;
            let mut seen = self.seen.lock().unwrap();
            seen.push(seq);
            Ok(seen.len() as i64)
        }

        async fn list_for_task(&self, _task_id: &str) -> StoreResult<Vec<CanonicalEvent>> {
            Ok(Vec::new())
        }
    }

    proptest! {
        #[test]
        fn appends_preserve_enqueue_order(
            delays_ms in proptest::collection::vec(0u64..20, 1..40),
            yield_every in 1usize..5,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let count = delays_ms.len();
            let log = Arc::new(SlowLog { delays_ms, seen: Mutex::new(Vec::new()) });

            let stats = rt.block_on({
                let log = Arc::clone(&log);
                async move {
                    let queue = AppendQueue::spawn(log);
                    for seq in 0..count {
                        queue.enqueue(event(seq));
                        if seq % yield_every == 0 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                    queue.drain().await
                }
            });

            prop_assert_eq!(stats, AppendStats { written: count, failed: 0 });
            let seen = log.seen.lock().unwrap().clone();
            prop_assert_eq!(seen, (0..count).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_failed_appends_are_counted_not_raised() {
        let store = Arc::new(MemoryStore::new());
        let queue = AppendQueue::spawn(store.clone());
        queue.enqueue(event(0));
        // Let the first append land before failures start.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.fail_appends(true);
        queue.enqueue(event(1));
        queue.enqueue(event(2));
        let stats = queue.drain().await;

        assert_eq!(stats, AppendStats { written: 1, failed: 2 });
        assert_eq!(store.list_for_task("task-1").await.unwrap().len(), 1);
    }
}
