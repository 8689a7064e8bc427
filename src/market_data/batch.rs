//! Debounced coalescing of multi-id lookups.
//!
//! Callers arriving within the collection window share one upstream request
//! for the union of their ids. Every arrival restarts the window; the flush
//! fires once the window passes with no new arrival.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{MarketDataError, Result};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Upstream multi-id lookup the aggregator calls once per flushed batch.
pub type BatchFetch<V> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>>> + Send + Sync>;

type Reply<V> = oneshot::Sender<Result<HashMap<String, V>>>;

struct Waiter<V> {
    ids: Vec<String>,
    reply: Reply<V>,
}

struct Pending<V> {
    ids: BTreeSet<String>,
    waiters: Vec<Waiter<V>>,
    /// Bumped on every arrival; a timer only flushes if it saw the latest one.
    generation: u64,
}

struct Inner<V> {
    name: String,
    window: Duration,
    fetch: BatchFetch<V>,
    pending: Mutex<Pending<V>>,
}

pub struct BatchAggregator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for BatchAggregator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> BatchAggregator<V> {
    pub fn new(name: impl Into<String>, window: Duration, fetch: BatchFetch<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                window,
                fetch,
                pending: Mutex::new(Pending {
                    ids: BTreeSet::new(),
                    waiters: Vec::new(),
                    generation: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Resolves `ids` as part of the next flushed batch. The returned map only
    /// holds the requested ids that the upstream answered for. An upstream
    /// failure is returned to every caller of the batch.
    pub async fn request_ids(&self, ids: &[String]) -> Result<HashMap<String, V>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let (reply, answer) = oneshot::channel();
        let generation = {
            let mut pending = self.inner.lock();
            pending.ids.extend(ids.iter().cloned());
            pending.waiters.push(Waiter {
                ids: ids.to_vec(),
                reply,
            });
            pending.generation += 1;
            pending.generation
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.flush_if_current(generation).await;
        });

        answer.await.unwrap_or_else(|_| {
            Err(MarketDataError::call_failed(
                &self.inner.name,
                "batch was dropped before completion",
            ))
        })
    }
}

impl<V: Clone + Send + 'static> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, Pending<V>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush_if_current(&self, generation: u64) {
        // Taking the batch happens under the same lock as appends, so a late
        // arrival either makes this flush or starts the next batch.
        let (ids, waiters) = {
            let mut pending = self.lock();
            if pending.generation != generation || pending.waiters.is_empty() {
                return;
            }
            (
                std::mem::take(&mut pending.ids),
                std::mem::take(&mut pending.waiters),
            )
        };

        let ids: Vec<String> = ids.into_iter().collect();
        debug!(
            provider = %self.name,
            ids = ids.len(),
            callers = waiters.len(),
            "flushing batched lookup"
        );

        match (self.fetch)(ids).await {
            Ok(results) => {
                for waiter in waiters {
                    let mine: HashMap<String, V> = waiter
                        .ids
                        .iter()
                        .filter_map(|id| results.get(id).map(|v| (id.clone(), v.clone())))
                        .collect();
                    let _ = waiter.reply.send(Ok(mine));
                }
            }
            Err(e) => {
                warn!(
                    provider = %self.name,
                    error = %e,
                    callers = waiters.len(),
                    "batched lookup failed"
                );
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(e.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::time::Instant;

    type Calls = Arc<Mutex<Vec<Vec<String>>>>;

    fn recording(calls: Calls, fail: bool) -> BatchFetch<f64> {
        Arc::new(move |ids: Vec<String>| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(ids.clone());
                if fail {
                    return Err(MarketDataError::call_failed("coingecko", "boom"));
                }
                let found: HashMap<String, f64> = ids
                    .into_iter()
                    .filter(|id| id != "unknown-coin")
                    .map(|id| (id, 1.0))
                    .collect();
                Ok(found)
            }
            .boxed()
        })
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_call() {
        let calls: Calls = Arc::default();
        let batch =
            BatchAggregator::new("coingecko", DEFAULT_WINDOW, recording(calls.clone(), false));

        let a = ids(&["bitcoin", "ethereum"]);
        let b = ids(&["ethereum", "solana"]);
        let c = ids(&["unknown-coin"]);
        let (ra, rb, rc) = tokio::join!(
            batch.request_ids(&a),
            batch.request_ids(&b),
            batch.request_ids(&c)
        );

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls, vec![ids(&["bitcoin", "ethereum", "solana", "unknown-coin"])]);

        let ra = ra.unwrap();
        assert_eq!(ra.len(), 2);
        assert!(ra.contains_key("bitcoin") && ra.contains_key("ethereum"));
        let rb = rb.unwrap();
        assert!(rb.contains_key("solana") && !rb.contains_key("bitcoin"));
        assert!(rc.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn each_arrival_restarts_the_window() {
        let calls: Calls = Arc::default();
        let batch =
            BatchAggregator::new("coingecko", DEFAULT_WINDOW, recording(calls.clone(), false));
        let start = Instant::now();

        let late = {
            let batch = batch.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                batch.request_ids(&ids(&["solana"])).await
            }
        };
        let first = ids(&["bitcoin"]);
        let (r1, r2) = tokio::join!(batch.request_ids(&first), late);
        r1.unwrap();
        r2.unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(Instant::now() - start >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn arrivals_after_flush_start_a_new_batch() {
        let calls: Calls = Arc::default();
        let batch =
            BatchAggregator::new("coingecko", DEFAULT_WINDOW, recording(calls.clone(), false));

        batch.request_ids(&ids(&["bitcoin"])).await.unwrap();
        batch.request_ids(&ids(&["ethereum"])).await.unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls, vec![ids(&["bitcoin"]), ids(&["ethereum"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_caller() {
        let calls: Calls = Arc::default();
        let batch =
            BatchAggregator::new("coingecko", DEFAULT_WINDOW, recording(calls.clone(), true));

        let a = ids(&["bitcoin"]);
        let b = ids(&["ethereum"]);
        let (ra, rb) = tokio::join!(batch.request_ids(&a), batch.request_ids(&b));
        assert_eq!(ra.unwrap_err(), rb.unwrap_err());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_request_skips_upstream() {
        let calls: Calls = Arc::default();
        let batch =
            BatchAggregator::new("coingecko", DEFAULT_WINDOW, recording(calls.clone(), false));
        assert!(batch.request_ids(&[]).await.unwrap().is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }
}
