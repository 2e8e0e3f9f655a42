//! Reconciliation runtime.
//!
//! Event-driven controllers with parallel per-resource workers. The work
//! queue deduplicates enqueues for the same key and guarantees that at
//! most one reconcile is in flight per key at any instant — enqueues
//! arriving mid-reconcile are remembered and replayed when the in-flight
//! pass finishes, so per-session history stays linearized while distinct
//! sessions reconcile concurrently.
//!
//! Worker failure policy: `Transient` errors requeue with capped
//! exponential backoff and jitter; everything else is the reconciler's
//! own problem to absorb (the session controller converts non-retryable
//! faults into `Failed` transitions before returning).

mod policy;
mod session;

pub use policy::{PolicyReconciler, PolicyReconcilerConfig};
pub use session::{SessionReconciler, SessionReconcilerConfig};

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, ErrorKind};

/// What a reconcile pass wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing further until the resource changes.
    No,
    /// Reconcile again after the given delay.
    After(Duration),
}

/// Deduplicating work queue with per-key serialization.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty_while_in_flight: HashSet<K>,
    closed: bool,
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                dirty_while_in_flight: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueues a key. Duplicate enqueues collapse; a key currently being
    /// reconciled is re-enqueued when its pass completes.
    pub fn enqueue(&self, key: K) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.closed {
            return;
        }
        if state.in_flight.contains(&key) {
            state.dirty_while_in_flight.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueues a key after a delay.
    pub fn enqueue_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Takes the next key, marking it in flight. Returns `None` once the
    /// queue is closed and drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state =
                    self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a key's reconcile pass finished, replaying any enqueue that
    /// arrived while it was in flight.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.in_flight.remove(key);
        if state.dirty_while_in_flight.remove(key) && !state.closed {
            if state.queued.insert(key.clone()) {
                state.ready.push_back(key.clone());
                drop(state);
                self.notify.notify_one();
            }
        }
    }

    /// Closes the queue; workers drain in-flight work then exit.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of keys waiting (excluding in-flight).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ready
            .len()
    }

    /// Whether no keys are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A controller driven by the worker pool.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The queue key type.
    type Key: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static;

    /// Controller name for logs.
    fn name(&self) -> &'static str;

    /// Runs one reconcile pass for a key.
    async fn reconcile(&self, key: &Self::Key) -> crate::error::Result<Requeue>;
}

/// Spawns `workers` tasks draining `queue` through `reconciler`.
///
/// Transient errors requeue the key with exponential backoff (reset on
/// the first successful pass); other errors are logged — reconcilers are
/// expected to have already absorbed them into resource state.
pub fn spawn_workers<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let attempts: Arc<Mutex<HashMap<R::Key, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    (0..workers.max(1))
        .map(|worker_id| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            let attempts = Arc::clone(&attempts);
            tokio::spawn(async move {
                let backoff = ExponentialBackoff::default();
                while let Some(key) = queue.next().await {
                    let outcome = reconciler.reconcile(&key).await;
                    queue.done(&key);
                    match outcome {
                        Ok(requeue) => {
                            attempts
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .remove(&key);
                            if let Requeue::After(delay) = requeue {
                                queue.enqueue_after(key, delay);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Transient => {
                            let attempt = {
                                let mut attempts = attempts
                                    .lock()
                                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                                let n = attempts.entry(key.clone()).or_insert(0);
                                *n += 1;
                                *n
                            };
                            let delay = backoff.jittered_delay(attempt);
                            tracing::warn!(
                                controller = reconciler.name(),
                                ?key,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "transient reconcile failure, requeueing"
                            );
                            queue.enqueue_after(key, delay);
                        }
                        Err(e) => log_unabsorbed(reconciler.name(), &key, &e),
                    }
                }
                tracing::debug!(
                    controller = reconciler.name(),
                    worker_id,
                    "reconcile worker stopped"
                );
            })
        })
        .collect()
}

fn log_unabsorbed<K: std::fmt::Debug>(controller: &str, key: &K, e: &Error) {
    tracing::error!(
        controller,
        ?key,
        kind = %e.kind(),
        error = %e,
        "non-retryable reconcile error escaped the controller"
    );
}
