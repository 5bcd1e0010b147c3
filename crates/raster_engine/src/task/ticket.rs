//! FIFO ticket queue
//!
//! Tickets linearize pixel writes across batches and draws. A draw reserves
//! one ticket per batch at submission time; a batch's pixel phase waits for
//! its ticket to come up, and retiring a ticket admits the next. Tickets may
//! be released out of order (a discarded batch retires its ticket without
//! waiting), but they always *retire* in numeric order.

use crate::task::Scheduler;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const HELP_PARK: Duration = Duration::from_micros(200);

struct TicketState {
    /// Next ticket number to hand out
    next: u64,
    /// All tickets below this number have retired
    serving: u64,
    /// Released-but-not-yet-retired numbers above `serving`
    released: BTreeSet<u64>,
}

struct TicketShared {
    state: Mutex<TicketState>,
    cond: Condvar,
}

/// A FIFO of monotonically numbered reservation tokens
pub struct TicketQueue {
    shared: Arc<TicketShared>,
}

impl Default for TicketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketQueue {
    /// Creates an empty queue; the first ticket taken is number zero
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TicketShared {
                state: Mutex::new(TicketState {
                    next: 0,
                    serving: 0,
                    released: BTreeSet::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Takes the next ticket. Wait-free: only a counter increment under the
    /// state lock.
    pub fn take(&self) -> Ticket {
        self.take_n(1).pop().unwrap()
    }

    /// Takes `n` consecutive tickets, in order
    pub fn take_n(&self, n: usize) -> Vec<Ticket> {
        let mut state = self.shared.state.lock().unwrap();
        let first = state.next;
        state.next += n as u64;
        (first..first + n as u64)
            .map(|number| Ticket {
                number,
                shared: Arc::clone(&self.shared),
                released: false,
            })
            .collect()
    }
}

/// A single reservation token. Dropping an unreleased ticket releases it.
pub struct Ticket {
    number: u64,
    shared: Arc<TicketShared>,
    released: bool,
}

impl Ticket {
    /// The ticket's position in the queue
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Waits until every earlier ticket has retired, draining queued pixel
    /// tasks while blocked.
    pub fn wait(&self, scheduler: &Scheduler) {
        loop {
            {
                let state = self.shared.state.lock().unwrap();
                if state.serving >= self.number {
                    return;
                }
            }
            if scheduler.help_one() {
                continue;
            }
            let state = self.shared.state.lock().unwrap();
            if state.serving >= self.number {
                return;
            }
            let _ = self.shared.cond.wait_timeout(state, HELP_PARK).unwrap();
        }
    }

    /// Waits without helping; for host threads outside the worker pool
    pub fn wait_blocking(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.serving < self.number {
            state = self.shared.cond.wait(state).unwrap();
        }
    }

    /// Releases the ticket. It retires once all earlier tickets have retired.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.shared.state.lock().unwrap();
        state.released.insert(self.number);
        loop {
            let serving = state.serving;
            if !state.released.remove(&serving) {
                break;
            }
            state.serving += 1;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_are_strictly_increasing() {
        let queue = TicketQueue::new();
        let a = queue.take();
        let b = queue.take();
        let more = queue.take_n(3);
        assert_eq!(a.number(), 0);
        assert_eq!(b.number(), 1);
        assert_eq!(
            more.iter().map(Ticket::number).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_out_of_order_release_retires_in_order() {
        let queue = TicketQueue::new();
        let mut tickets = queue.take_n(3);
        let t2 = tickets.pop().unwrap();
        let t1 = tickets.pop().unwrap();
        let t0 = tickets.pop().unwrap();

        // Release the last ticket first; nothing retires yet.
        t2.done();
        {
            let state = queue.shared.state.lock().unwrap();
            assert_eq!(state.serving, 0);
        }

        t0.done();
        t1.done();
        let state = queue.shared.state.lock().unwrap();
        assert_eq!(state.serving, 3);
        assert!(state.released.is_empty());
    }

    #[test]
    fn test_wait_blocks_until_predecessors_retire() {
        let queue = TicketQueue::new();
        let t0 = queue.take();
        let t1 = queue.take();

        let waiter = std::thread::spawn(move || {
            t1.wait_blocking();
            t1.done();
        });

        std::thread::sleep(Duration::from_millis(5));
        t0.done();
        waiter.join().unwrap();
    }
}
