//! Blocking synchronization primitives
//!
//! [`Event`] is a manual-reset event used by the routine caches and the
//! coroutine runtimes. [`WaitGroup`] joins a set of forked tasks; its wait is
//! scheduler-aware so a joining worker keeps draining pixel work.

use crate::task::Scheduler;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How long a helping waiter parks when no pixel work is available.
const HELP_PARK: Duration = Duration::from_micros(200);

/// Manual-reset event.
///
/// `signal` wakes all current and future waiters until `clear` is called.
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Creates an unsignaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, releasing all waiters
    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    /// Returns the event to the unsignaled state
    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    /// Returns whether the event is currently signaled
    pub fn test(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Blocks until the event is signaled
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    /// Returns whether the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*state {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        true
    }
}

struct WaitGroupInner {
    count: Mutex<usize>,
    cond: Condvar,
}

/// Counts outstanding tasks; `wait` returns when the count reaches zero.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    /// Creates a wait group with an initial count
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: Mutex::new(count),
                cond: Condvar::new(),
            }),
        }
    }

    /// Adds `n` to the outstanding count
    pub fn add(&self, n: usize) {
        *self.inner.count.lock().unwrap() += n;
    }

    /// Marks one task complete
    pub fn done(&self) {
        let mut count = self.inner.count.lock().unwrap();
        assert!(*count > 0, "WaitGroup::done called more times than add");
        *count -= 1;
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        *self.inner.count.lock().unwrap() == 0
    }

    /// Waits for the count to reach zero, running queued pixel tasks inline
    /// while waiting.
    pub fn wait(&self, scheduler: &Scheduler) {
        loop {
            if self.is_done() {
                return;
            }
            if scheduler.help_one() {
                continue;
            }
            let count = self.inner.count.lock().unwrap();
            if *count == 0 {
                return;
            }
            let _ = self.inner.cond.wait_timeout(count, HELP_PARK).unwrap();
        }
    }

    /// Waits for the count to reach zero without helping
    pub fn wait_blocking(&self) {
        let mut count = self.inner.count.lock().unwrap();
        while *count > 0 {
            count = self.inner.cond.wait(count).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signal_releases_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        event.signal();
        waiter.join().unwrap();
        assert!(event.test());

        event.clear();
        assert!(!event.test());
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_group_joins_all() {
        let group = WaitGroup::new(0);
        group.add(4);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let group = group.clone();
                std::thread::spawn(move || group.done())
            })
            .collect();
        group.wait_blocking();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
