//! Start barrier: a producer waits here until every consumer has started.
//!
//! The barrier is a counter of outstanding completions plus a wake-up
//! notification. Completions may arrive before [`StartBarrier::wait`] is
//! called (a consumer that is already running completes synchronously) and
//! are never lost. The state is inspectable at any time through
//! [`StartBarrier::snapshot`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use knive_core::Error;

use crate::graph::StageId;

/// Observable barrier state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierState {
    /// Number of consumers that must complete.
    pub expected: usize,
    /// Consumers that completed, in completion order.
    pub completed: Vec<StageId>,
    /// The first consumer that failed, if any.
    pub failed: Option<StageId>,
}

impl BarrierState {
    pub fn outstanding(&self) -> usize {
        self.expected.saturating_sub(self.completed.len())
    }

    pub fn is_cleared(&self) -> bool {
        self.failed.is_none() && self.outstanding() == 0
    }
}

/// Why a barrier did not clear.
#[derive(Debug)]
pub struct BarrierFailure {
    pub consumer: StageId,
    pub error: Error,
}

struct Inner {
    state: Mutex<BarrierState>,
    error: Mutex<Option<Error>>,
    notify: Notify,
}

/// Counter of outstanding consumer starts. Cheap to clone.
#[derive(Clone)]
pub struct StartBarrier {
    inner: Arc<Inner>,
}

impl StartBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BarrierState {
                    expected,
                    completed: Vec::with_capacity(expected),
                    failed: None,
                }),
                error: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Record that `consumer` started. Repeated completions of the same
    /// consumer count once. Returns `true` when this completion cleared the
    /// barrier.
    pub fn complete(&self, consumer: StageId) -> bool {
        let cleared = {
            let mut state = self.inner.state.lock();
            if state.completed.contains(&consumer) || state.is_cleared() {
                return false;
            }
            state.completed.push(consumer);
            state.is_cleared()
        };
        if cleared {
            self.inner.notify.notify_one();
        }
        cleared
    }

    /// Record that `consumer` failed to start. Only the first failure is
    /// kept; the barrier will never clear afterwards.
    pub fn fail(&self, consumer: StageId, error: Error) {
        {
            let mut state = self.inner.state.lock();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(consumer);
            *self.inner.error.lock() = Some(error);
        }
        self.inner.notify.notify_one();
    }

    pub fn snapshot(&self) -> BarrierState {
        self.inner.state.lock().clone()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding()
    }

    /// Wait until every consumer completed or one failed.
    ///
    /// Only one task may wait on a barrier.
    pub async fn wait(&self) -> Result<Vec<StageId>, BarrierFailure> {
        loop {
            {
                let state = self.inner.state.lock();
                if let Some(consumer) = state.failed {
                    let error = self
                        .inner
                        .error
                        .lock()
                        .take()
                        .unwrap_or_else(|| Error::Internal("barrier failure already taken".into()));
                    return Err(BarrierFailure { consumer, error });
                }
                if state.outstanding() == 0 {
                    return Ok(state.completed.clone());
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for StartBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StartBarrier").field(&self.snapshot()).finish()
    }
}
