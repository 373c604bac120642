//! Fingerprint-keyed single-flight deduplication.
//!
//! Flights are registered by an updater that already holds the repository
//! lease ([`join`](Inflight::join) first, lock, then
//! [`start`](Inflight::start) — the fixed repo-lock → dedup order). Producers
//! run on detached tasks, so a waiter cancelling never abandons work in
//! progress, and joiners hold no lock while they wait.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Dedup key: `(repository cache key, request fingerprint)`.
pub type FlightKey = (String, String);

type Slot<T> = watch::Receiver<Option<Arc<T>>>;
type FlightMap<T> = Arc<Mutex<HashMap<FlightKey, Slot<T>>>>;

/// Process-wide map of in-flight producers.
pub struct Inflight<T> {
    map: FlightMap<T>,
}

/// Removes the flight's map entry when the producer task ends, result or not.
struct FlightGuard<T> {
    map: FlightMap<T>,
    key: FlightKey,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

impl<T: Send + Sync + 'static> Default for Inflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Inflight<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of producers currently running.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Awaits the result of an existing flight for `key`, if one is
    /// registered. Returns `None` when there is no flight, or when the
    /// flight's task was torn down without posting a result.
    pub async fn join(&self, key: &FlightKey) -> Option<Arc<T>> {
        let mut rx = self.map.lock().get(key).cloned()?;
        loop {
            if let Some(result) = rx.borrow().clone() {
                return Some(result);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Registers a new flight for `key`, spawns `producer` on a detached
    /// task, and awaits its result. The caller is expected to have
    /// established exclusivity for `key` (the repository lease) before
    /// registering, so an existing entry can only be a dead leftover and is
    /// replaced.
    pub async fn start<F, Fut>(&self, key: FlightKey, producer: F) -> Arc<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(None);
        self.map.lock().insert(key.clone(), rx.clone());
        let guard = FlightGuard {
            map: self.map.clone(),
            key,
        };
        let fut = producer();
        tokio::spawn(async move {
            let _guard = guard;
            let result = Arc::new(fut.await);
            let _ = tx.send(Some(result));
        });

        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Our own producer task died without posting; that only
                // happens if it panicked.
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                panic!("single-flight producer vanished without a result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn key(fp: &str) -> FlightKey {
        ("https/github.com/a/b.git".to_string(), fp.to_string())
    }

    #[tokio::test]
    async fn test_join_without_flight_is_none() {
        let inflight = Inflight::<u32>::new();
        assert!(inflight.join(&key("fp")).await.is_none());
    }

    #[tokio::test]
    async fn test_joiners_share_one_producer() {
        let inflight = Arc::new(Inflight::<u32>::new());
        let produced = Arc::new(AtomicU32::new(0));

        let starter = {
            let inflight = inflight.clone();
            let produced = produced.clone();
            tokio::spawn(async move {
                *inflight
                    .start(key("fp1"), move || async move {
                        produced.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        42u32
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut joiners = Vec::new();
        for _ in 0..50 {
            let inflight = inflight.clone();
            joiners.push(tokio::spawn(
                async move { inflight.join(&key("fp1")).await },
            ));
        }
        for joiner in joiners {
            assert_eq!(*joiner.await.unwrap().unwrap(), 42);
        }
        assert_eq!(starter.await.unwrap(), 42);
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let inflight = Inflight::<&'static str>::new();
        let a = inflight.start(key("fp-a"), || async { "a" });
        let b = inflight.start(key("fp-b"), || async { "b" });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(*a, "a");
        assert_eq!(*b, "b");
    }

    #[tokio::test]
    async fn test_flight_completes_after_starter_cancel() {
        let inflight = Arc::new(Inflight::<u32>::new());
        let produced = Arc::new(AtomicU32::new(0));

        let starter = {
            let inflight = inflight.clone();
            let produced = produced.clone();
            tokio::spawn(async move {
                inflight
                    .start(key("fp"), move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        produced.fetch_add(1, Ordering::SeqCst);
                        7u32
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        starter.abort();

        // The detached producer still runs to completion.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_flights_rerun() {
        let inflight = Inflight::<u32>::new();
        let first = inflight.start(key("fp"), || async { 1 }).await;
        assert!(inflight.join(&key("fp")).await.is_none());
        let second = inflight.start(key("fp"), || async { 2 }).await;
        assert_eq!(*first, 1);
        assert_eq!(*second, 2);
    }

    #[tokio::test]
    async fn test_joiners_share_failure() {
        let inflight = Arc::new(Inflight::<Result<u32, String>>::new());

        let starter = {
            let inflight = inflight.clone();
            tokio::spawn(async move {
                inflight
                    .start(key("fp"), || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<u32, String>("upstream down".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let joined = inflight.join(&key("fp")).await.unwrap();
        assert_eq!(joined.as_ref().clone().unwrap_err(), "upstream down");
        let started = starter.await.unwrap();
        assert_eq!(started.as_ref().clone().unwrap_err(), "upstream down");
    }
}
