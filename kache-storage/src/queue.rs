//! Fixed-capacity job queue used to batch writes to the remote tier.
//!
//! A bounded `tokio::mpsc` channel of boxed thunks, drained by a fixed pool
//! of worker tasks. `dispatch` never blocks: a saturated channel returns
//! [`kache_types::CacheError::QueueFull`] immediately so the caller can log
//! and move on rather than stall the request path.

use std::sync::Arc;

use kache_types::{CacheError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() -> futures_like::BoxFuture + Send + 'static>;

// A tiny local stand-in for a boxed future, avoiding a dependency on the
// `futures` crate for a single alias.
mod futures_like {
    use std::future::Future;
    use std::pin::Pin;
    pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Dispatches thunks onto a bounded channel drained by `concurrency` worker
/// tasks. `stop` closes the channel and joins every worker.
pub struct JobQueue {
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(capacity: usize, concurrency: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut workers = Vec::with_capacity(concurrency.max(1));
        for _ in 0..concurrency.max(1) {
            let receiver = Arc::clone(&receiver);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => job().await,
                        None => break,
                    }
                }
            }));
        }
        Arc::new(Self {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
        })
    }

    /// Non-blocking enqueue. Returns [`CacheError::QueueFull`] when the
    /// buffer is saturated, and also when the queue has already been
    /// stopped.
    pub fn dispatch<F, Fut>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: Job = Box::new(move || Box::pin(job()));
        let guard = self.sender.lock().unwrap();
        match guard.as_ref() {
            Some(sender) => sender.try_send(boxed).map_err(|_| CacheError::QueueFull),
            None => Err(CacheError::QueueFull),
        }
    }

    /// Closes the channel and joins every worker. Idempotent.
    pub async fn stop(&self) {
        self.sender.lock().unwrap().take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}
