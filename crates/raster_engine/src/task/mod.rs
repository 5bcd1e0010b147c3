//! Task scheduling and synchronization
//!
//! All parallelism in the engine runs on one [`Scheduler`]: draw batches,
//! cluster-striped pixel work, and the task-backed coroutine runtime. The
//! synchronization types here are scheduler-aware — a thread blocked on a
//! [`Ticket`](ticket::Ticket) or [`WaitGroup`](sync::WaitGroup) drains queued
//! pixel tasks instead of idling, which keeps nested fork/join draw work from
//! starving the worker pool.

pub mod pool;
pub mod scheduler;
pub mod sync;
pub mod ticket;

pub use pool::{Loan, Pool};
pub use scheduler::Scheduler;
pub use sync::{Event, WaitGroup};
pub use ticket::{Ticket, TicketQueue};
