//! Host-visible fence

use super::events::TaskEvents;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct FenceState {
    outstanding: usize,
    signaled: bool,
}

/// Counts outstanding draws and signals when they all finish.
///
/// Attach a fence as the `TaskEvents` observer of one or more draws, then
/// `wait` for completion. Waiting with a deadline reports a timeout without
/// cancelling work.
#[derive(Default)]
pub struct Fence {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    /// Creates an unsignaled fence
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all observed draws have finished
    pub fn is_signaled(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.signaled && state.outstanding == 0
    }

    /// Returns the fence to the unsignaled state
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.outstanding, 0, "reset of a fence with work in flight");
        state.signaled = false;
    }

    /// Blocks until every observed draw has finished
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !(state.signaled && state.outstanding == 0) {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Blocks until signaled or `deadline`; returns whether the fence
    /// signaled. Timing out does not cancel outstanding work.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.signaled && state.outstanding == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Convenience wrapper over [`Fence::wait_until`]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

impl TaskEvents for Fence {
    fn start(&self) {
        let mut state = self.state.lock().unwrap();
        state.outstanding += 1;
        state.signaled = false;
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.outstanding > 0);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.signaled = true;
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fence_signals_after_all_finishes() {
        let fence = Arc::new(Fence::new());
        fence.start();
        fence.start();
        assert!(!fence.is_signaled());
        fence.finish();
        assert!(!fence.is_signaled());
        fence.finish();
        assert!(fence.is_signaled());
        fence.wait(); // returns immediately
    }

    #[test]
    fn test_wait_until_times_out_without_cancelling() {
        let fence = Fence::new();
        fence.start();
        assert!(!fence.wait_timeout(Duration::from_millis(5)));
        fence.finish();
        assert!(fence.wait_timeout(Duration::from_millis(5)));
    }
}
