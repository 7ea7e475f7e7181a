//! Concurrent fan-out over a registry snapshot.
//!
//! [`execute`] spawns one task per snapshot entry and hands back a channel
//! that yields one [`BroadcastResult`] per entry, in completion order. The
//! channel closes once every task has finished, so draining it until `None`
//! means every target was attempted.
//!
//! There is no concurrency cap: a snapshot of N entries spawns N tasks.
//! Timeouts belong to the operation itself.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use log::error;
use tokio::sync::mpsc;

use crate::error::Panicked;
use crate::registry::Snapshot;
use crate::types::{EndpointKey, EndpointRecord};

/// The outcome of running the operation against one target.
#[derive(Debug)]
pub struct BroadcastResult<T, E> {
    pub key: EndpointKey,
    pub outcome: Result<T, E>,
}

/// Runs `operation` against every entry of `snapshot` concurrently.
///
/// Operation failures are carried in [`BroadcastResult::outcome`]; a panic
/// inside the operation is reported as an error built from [`Panicked`].
/// Spawned tasks keep running if the returned receiver is dropped.
pub fn execute<F, Fut, T, E>(snapshot: Snapshot, operation: F) -> mpsc::Receiver<BroadcastResult<T, E>>
where
    F: Fn(EndpointKey, EndpointRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<Panicked> + Send + 'static,
{
    // Capacity covers every result, so no task ever waits on the consumer.
    let (tx, rx) = mpsc::channel(snapshot.len().max(1));
    let operation = Arc::new(operation);

    for (key, record) in snapshot {
        let tx = tx.clone();
        let operation = Arc::clone(&operation);
        tokio::spawn(async move {
            let call = {
                let key = key.clone();
                async move { operation(key, record).await }
            };
            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let panicked = Panicked::from_payload(payload);
                    error!("[{}] {}", key, panicked);
                    Err(E::from(panicked))
                }
            };
            // The receiver may be gone if the caller stopped listening.
            let _ = tx.send(BroadcastResult { key, outcome }).await;
        });
    }

    // Each task owns a sender; the channel closes when the last one finishes.
    drop(tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    #[derive(Debug)]
    struct Failed(String);

    impl From<Panicked> for Failed {
        fn from(panicked: Panicked) -> Self {
            Failed(panicked.to_string())
        }
    }

    fn snapshot(n: usize) -> Snapshot {
        (0..n)
            .map(|i| {
                let key = EndpointKey::new(format!("10.0.0.{}", i + 1), 80);
                (key.clone(), EndpointRecord::new(key, None))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_yields_one_result_per_entry() {
        let mut results = execute(snapshot(5), |key, _record| async move {
            if key.ip.ends_with(".2") || key.ip.ends_with(".4") {
                Err(Failed(format!("{} failed", key)))
            } else {
                Ok(key.port)
            }
        });

        let mut ok = BTreeSet::new();
        let mut failed = BTreeSet::new();
        while let Some(result) = results.recv().await {
            match result.outcome {
                Ok(_) => ok.insert(result.key.to_string()),
                Err(_) => failed.insert(result.key.to_string()),
            };
        }

        assert_eq!(ok.len(), 3);
        assert_eq!(
            failed,
            BTreeSet::from(["10.0.0.2:80".to_string(), "10.0.0.4:80".to_string()])
        );
    }

    #[tokio::test]
    async fn test_panicking_operation_still_yields_result() {
        let mut results = execute(snapshot(3), |key, _record| async move {
            if key.ip == "10.0.0.1" {
                panic!("cache node handler blew up");
            }
            Ok::<_, Failed>(())
        });

        let mut count = 0;
        let mut panicked = Vec::new();
        while let Some(result) = results.recv().await {
            count += 1;
            if let Err(Failed(message)) = result.outcome {
                panicked.push((result.key.to_string(), message));
            }
        }

        assert_eq!(count, 3);
        assert_eq!(panicked.len(), 1);
        assert_eq!(panicked[0].0, "10.0.0.1:80");
        assert!(panicked[0].1.contains("cache node handler blew up"));
    }

    #[tokio::test]
    async fn test_empty_snapshot_closes_immediately() {
        let mut results = execute(Vec::new(), |_key, _record| async move { Ok::<(), Failed>(()) });
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_operations_run_concurrently() {
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let mut results = execute(snapshot(n), move |_key, _record| {
            let barrier = Arc::clone(&barrier);
            async move {
                // Only completes if all n operations are in flight at once.
                barrier.wait().await;
                Ok::<(), Failed>(())
            }
        });

        let mut count = 0;
        let drained = timeout(Duration::from_secs(5), async {
            while results.recv().await.is_some() {
                count += 1;
            }
        })
        .await;

        assert!(drained.is_ok(), "operations were serialized");
        assert_eq!(count, n);
    }

    #[tokio::test]
    async fn test_closes_only_after_slowest_operation() {
        let mut results = execute(snapshot(3), |key, _record| async move {
            if key.ip.ends_with(".1") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok::<_, Failed>(key)
        });

        let mut last = None;
        while let Some(result) = results.recv().await {
            last = Some(result.key);
        }
        assert_eq!(last, Some(EndpointKey::new("10.0.0.1", 80)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_finish_after_receiver_dropped() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let results = execute(snapshot(4), move |_key, _record| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Failed>(())
            }
        });

        // The caller goes away before any target has answered.
        drop(results);
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }
}
