//! Bounded concurrent retry queue.
//!
//! Requests wait in a two-lane [`WaitList`] until one of `max_concurrent`
//! slots frees up, then run through [`execute_with_retry`] on a spawned task.
//! A slot stays occupied through backoff sleeps and is released when the
//! request reaches a terminal state, which immediately re-runs admission.
//!
//! All queue state sits behind one mutex that is never held across an
//! `.await`.

mod history;
mod waitlist;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, QueueConfig};
use crate::retry::{execute_with_retry, Attempt, RetryError, RetryPolicy};

pub use self::history::FailureRecord;
pub use self::waitlist::{Priority, WaitList};

use self::history::FailureHistory;

const ABANDONED_ERROR: &str = "attempt panicked or was cancelled before reaching a terminal state";

#[derive(Debug, Error)]
pub enum QueueError<E> {
    /// The request reached FAILED; carries the last underlying error.
    #[error(transparent)]
    Failed(#[from] RetryError<E>),

    /// The task driving the request went away (runtime shutdown or a
    /// panicking attempt) before an outcome was produced. The request is
    /// still listed in [`RequestQueue::failures`].
    #[error("request {0} was dropped before reaching a terminal state")]
    Abandoned(Uuid),
}

impl<E> QueueError<E> {
    /// The underlying error of the final attempt, if there was one.
    pub fn cause(&self) -> Option<&E> {
        match self {
            QueueError::Failed(e) => Some(e.cause()),
            QueueError::Abandoned(_) => None,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            QueueError::Failed(e) => Some(e.attempts()),
            QueueError::Abandoned(_) => None,
        }
    }
}

/// Point-in-time view of the queue. Reading it has no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub waiting_high: usize,
    pub waiting_low: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub low_priority_paused: bool,
    pub failures: usize,
}

/// A request waiting for a slot. `job` is inert until polled.
struct Pending {
    id: Uuid,
    job: BoxFuture<'static, Option<FailureRecord>>,
}

struct QueueState {
    waiting: WaitList<Pending>,
    active: usize,
    low_paused: bool,
    failures: FailureHistory,
}

struct Shared {
    max_concurrent: usize,
    policy: RetryPolicy,
    low_priority_spacing: Duration,
    state: Mutex<QueueState>,
}

/// Handle to a shared request queue. Cloning is cheap; all clones drive the
/// same waiting list and slots.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("policy", &self.shared.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestQueue {
    pub fn new(config: &QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                max_concurrent: config.max_concurrent,
                policy: config.retry_policy(),
                low_priority_spacing: config.low_priority_spacing(),
                state: Mutex::new(QueueState {
                    waiting: WaitList::default(),
                    active: 0,
                    low_paused: false,
                    failures: FailureHistory::new(config.failure_history_limit),
                }),
            }),
        })
    }

    /// Default retry policy applied by [`RequestQueue::submit`].
    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Queue `attempt` with the configured retry policy.
    ///
    /// Must be called from within a tokio runtime. Never fails for capacity
    /// reasons; only the returned [`Outcome`] can resolve to an error.
    pub fn submit<A>(&self, attempt: A, priority: Priority) -> Outcome<A::Output, A::Error>
    where
        A: Attempt + 'static,
        A::Output: 'static,
        A::Error: fmt::Display + 'static,
    {
        let policy = self.shared.policy.clone();
        self.submit_with_policy(attempt, priority, policy)
    }

    /// Queue `attempt` with a per-request retry budget.
    pub fn submit_with_retries<A>(
        &self,
        attempt: A,
        priority: Priority,
        max_retries: u32,
    ) -> Outcome<A::Output, A::Error>
    where
        A: Attempt + 'static,
        A::Output: 'static,
        A::Error: fmt::Display + 'static,
    {
        let policy = self.shared.policy.with_max_retries(max_retries);
        self.submit_with_policy(attempt, priority, policy)
    }

    pub fn submit_with_policy<A>(
        &self,
        attempt: A,
        priority: Priority,
        policy: RetryPolicy,
    ) -> Outcome<A::Output, A::Error>
    where
        A: Attempt + 'static,
        A::Output: 'static,
        A::Error: fmt::Display + 'static,
    {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let job = async move {
            let result = execute_with_retry(&attempt, &policy).await;

            let failure = match &result {
                Ok(_) => {
                    debug!("request succeeded");
                    None
                }
                Err(err) => {
                    match err {
                        RetryError::Exhausted { .. } => {
                            error!(attempts = err.attempts(), error = %err.cause(), "retries exhausted")
                        }
                        RetryError::Rejected { .. } => {
                            warn!(attempts = err.attempts(), error = %err.cause(), "request rejected")
                        }
                    }
                    Some(FailureRecord {
                        request_id: id,
                        priority,
                        error: err.cause().to_string(),
                        attempts: err.attempts(),
                        failed_at: Utc::now(),
                    })
                }
            };

            if tx.send(result).is_err() {
                debug!("outcome handle dropped before completion");
            }
            failure
        }
        .instrument(info_span!("request", request_id = %id, %priority))
        .boxed();

        {
            let mut state = self.lock();
            state.waiting.push(priority, Pending { id, job });
            debug!(
                request_id = %id,
                %priority,
                waiting = state.waiting.len(),
                active = state.active,
                "request queued"
            );
        }

        self.try_admit_next();
        Outcome { id, rx }
    }

    /// Hold back Low requests; High requests keep flowing.
    pub fn pause_low_priority(&self) {
        self.lock().low_paused = true;
        info!("low priority admission paused");
    }

    pub fn resume_low_priority(&self) {
        self.lock().low_paused = false;
        info!("low priority admission resumed");
        self.try_admit_next();
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            waiting: state.waiting.len(),
            waiting_high: state.waiting.len_of(Priority::High),
            waiting_low: state.waiting.len_of(Priority::Low),
            active: state.active,
            max_concurrent: self.shared.max_concurrent,
            low_priority_paused: state.low_paused,
            failures: state.failures.len(),
        }
    }

    /// Most recent terminal failures, oldest first.
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.snapshot()
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // State is only touched in short non-panicking sections; a poisoned
        // lock still holds consistent data.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit waiters while slots are free.
    fn try_admit_next(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime in scope; admission deferred");
            return;
        };

        loop {
            let (priority, pending) = {
                let mut state = self.lock();
                if state.active >= self.shared.max_concurrent {
                    return;
                }
                let allow_low = !state.low_paused;
                match state.waiting.pop(allow_low) {
                    Some(next) => {
                        state.active += 1;
                        next
                    }
                    None => return,
                }
            };

            debug!(request_id = %pending.id, %priority, "request admitted");

            let mut slot = ActiveSlot {
                queue: self.clone(),
                request_id: pending.id,
                priority,
                completed: false,
            };
            let spacing = match priority {
                Priority::Low => self.shared.low_priority_spacing,
                Priority::High => Duration::ZERO,
            };

            runtime.spawn(async move {
                let failure = pending.job.await;
                slot.completed = true;
                if let Some(record) = failure {
                    slot.queue.lock().failures.push(record);
                }
                if !spacing.is_zero() {
                    tokio::time::sleep(spacing).await;
                }
                drop(slot);
            });
        }
    }
}

/// One occupied slot. Releasing it (including on panic or task
/// cancellation) frees capacity and re-runs admission.
///
/// A slot dropped before its job completed belongs to an abandoned request,
/// which is recorded in the failure history with zero attempts.
struct ActiveSlot {
    queue: RequestQueue,
    request_id: Uuid,
    priority: Priority,
    completed: bool,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        {
            let mut state = self.queue.lock();
            if !self.completed {
                warn!(
                    request_id = %self.request_id,
                    priority = %self.priority,
                    "request abandoned before reaching a terminal state"
                );
                state.failures.push(FailureRecord {
                    request_id: self.request_id,
                    priority: self.priority,
                    error: ABANDONED_ERROR.to_string(),
                    attempts: 0,
                    failed_at: Utc::now(),
                });
            }
            state.active = state.active.saturating_sub(1);
        }
        self.queue.try_admit_next();
    }
}

/// Single-resolution handle to a submitted request.
///
/// Resolves exactly once. Dropping it discards the result but does not
/// cancel the request.
#[must_use = "dropping an Outcome discards the result; the request still runs"]
pub struct Outcome<T, E> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, RetryError<E>>>,
}

impl<T, E> Outcome<T, E> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T, E> fmt::Debug for Outcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome").field("id", &self.id).finish()
    }
}

impl<T, E> Future for Outcome<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(result) => result.map_err(QueueError::Failed),
            Err(_) => Err(QueueError::Abandoned(id)),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
