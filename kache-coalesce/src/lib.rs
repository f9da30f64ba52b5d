//! Singleflight request coalescing: ensures at most one concurrent upstream
//! round-trip per key, with duplicate concurrent callers waiting for and
//! sharing a copy of the leader's response.
//!
//! There are no condition variables in async Rust, so the leader/follower
//! handoff below uses a [`tokio::sync::Notify`] instead: the leader stores
//! the settled outcome and calls `notify_waiters` while holding the Call's
//! own lock, and each follower registers its `notified()` future before
//! checking whether the outcome already landed, closing the missed-wakeup
//! race. Followers never see the leader's owned `HttpResponse`; the outcome
//! is materialized to its wire bytes once and each follower decodes its own
//! copy so no follower can observe or mutate another's response.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use kache_types::{CacheError, HttpResponse, Result as CacheResult};
use tokio::sync::Notify;

#[derive(Clone)]
enum Outcome {
    Response(Vec<u8>),
    Error(String),
}

struct Call {
    state: StdMutex<CallState>,
    notify: Notify,
}

enum CallState {
    Pending { coalesced: bool },
    Done(Outcome),
}

impl Call {
    fn fresh() -> Arc<Self> {
        Arc::new(Call { state: StdMutex::new(CallState::Pending { coalesced: false }), notify: Notify::new() })
    }
}

/// Map from coalescing key to in-flight [`Call`]. One instance is shared by
/// the whole caching transport; keys are primary cache key strings.
#[derive(Default)]
pub struct Coalescer {
    calls: StdMutex<HashMap<String, Arc<Call>>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `upstream` for `key`, coalescing concurrent callers when
    /// `coalesce` is true (the caller decides this from the request method:
    /// only GET is coalesced per the method's contract). Non-coalesced calls
    /// pass straight through with no bookkeeping.
    pub async fn round_trip<F, Fut>(&self, key: &str, coalesce: bool, upstream: F) -> CacheResult<HttpResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<HttpResponse>>,
    {
        if !coalesce {
            return upstream().await;
        }

        enum Role {
            Leader(Arc<Call>),
            Follower(Arc<Call>),
        }

        let role = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(key) {
                Some(call) => {
                    let call = Arc::clone(call);
                    // Lock the Call and record our presence *before* releasing
                    // the map lock. The leader only removes the map entry
                    // after its upstream round-trip returns, and only checks
                    // this flag after that removal, so this ordering is what
                    // guarantees the leader never misses a follower that was
                    // actually present.
                    if let CallState::Pending { coalesced } = &mut *call.state.lock().unwrap() {
                        *coalesced = true;
                    }
                    Role::Follower(call)
                }
                None => {
                    let call = Call::fresh();
                    calls.insert(key.to_string(), Arc::clone(&call));
                    Role::Leader(call)
                }
            }
        };

        match role {
            Role::Leader(call) => self.lead(key, call, upstream).await,
            Role::Follower(call) => follow(call).await,
        }
    }

    async fn lead<F, Fut>(&self, key: &str, call: Arc<Call>, upstream: F) -> CacheResult<HttpResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<HttpResponse>>,
    {
        let result = upstream().await;

        {
            let mut calls = self.calls.lock().unwrap();
            calls.remove(key);
        }

        let had_followers = matches!(*call.state.lock().unwrap(), CallState::Pending { coalesced: true });
        if had_followers {
            let outcome = match &result {
                Ok(response) => match bincode::serialize(response) {
                    Ok(bytes) => Outcome::Response(bytes),
                    Err(err) => Outcome::Error(CacheError::from(err).to_string()),
                },
                Err(err) => Outcome::Error(err.to_string()),
            };
            *call.state.lock().unwrap() = CallState::Done(outcome);
            call.notify.notify_waiters();
        }

        result
    }
}

/// Follower path: register the wake future before checking the Call's
/// state, then wait only if the leader hadn't settled yet.
async fn follow(call: Arc<Call>) -> CacheResult<HttpResponse> {
    let notified = call.notify.notified();

    let already_done = {
        let state = call.state.lock().unwrap();
        match &*state {
            CallState::Done(outcome) => Some(outcome.clone()),
            CallState::Pending { .. } => None,
        }
    };

    let outcome = match already_done {
        Some(outcome) => outcome,
        None => {
            notified.await;
            match &*call.state.lock().unwrap() {
                CallState::Done(outcome) => outcome.clone(),
                CallState::Pending { .. } => {
                    unreachable!("leader settles the call before notifying waiters")
                }
            }
        }
    };

    match outcome {
        Outcome::Response(bytes) => bincode::deserialize(&bytes).map_err(CacheError::from),
        Outcome::Error(message) => Err(CacheError::BackendUnavailable(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kache_types::HttpVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn response(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn uncoalesced_calls_always_pass_through() {
        let coalescer = Coalescer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            coalescer
                .round_trip("k", false, || async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(response("x"))
                })
                .await
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_coalesced_calls_share_one_upstream_hit() {
        let coalescer = Arc::new(Coalescer::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(50));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let coalescer = Arc::clone(&coalescer);
            let hits = Arc::clone(&hits);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                coalescer
                    .round_trip("/coalesced", true, || async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(response("42"))
                    })
                    .await
            }));
        }

        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.body, b"42".to_vec());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_coalesced_key_is_not_blocked_by_in_flight_coalesced_key() {
        let coalescer = Arc::new(Coalescer::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let blocked = {
            let coalescer = Arc::clone(&coalescer);
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                coalescer
                    .round_trip("/coalesced", true, || async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(response("slow"))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let fast = coalescer
            .round_trip("/non-coalesced", true, || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(response("fast"))
            })
            .await
            .unwrap();
        assert_eq!(fast.body, b"fast".to_vec());

        blocked.await.unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_error_is_reconstructed_for_followers() {
        let coalescer = Arc::new(Coalescer::new());
        let barrier = Arc::new(Barrier::new(2));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let coalescer = Arc::clone(&coalescer);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                coalescer
                    .round_trip("/failing", true, || async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(CacheError::BackendUnavailable("upstream down".to_string()))
                    })
                    .await
            }));
        }

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("upstream down"));
        }
    }
}
