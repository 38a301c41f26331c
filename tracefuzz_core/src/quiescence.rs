use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Tracks instrumentation callbacks that are currently executing, possibly on
/// threads spawned by the target, so a driver can wait until every event of a
/// trial has been applied.
#[derive(Debug, Clone, Default)]
pub struct QuiescenceBarrier {
    inner: Arc<InFlight>,
}

/// Marks one callback as in flight until dropped.
#[must_use = "the callback is only counted while the guard is alive"]
pub struct CallbackGuard {
    inner: Arc<InFlight>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.inner.drained.notify_all();
        }
    }
}

impl QuiescenceBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> CallbackGuard {
        *self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        CallbackGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no callback is in flight.
    pub fn wait_for_quiescence(&self) {
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .inner
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_for_quiescence`](Self::wait_for_quiescence) but gives up
    /// after `timeout`. Returns whether quiescence was reached.
    pub fn wait_for_quiescence_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .inner
                .drained
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}
