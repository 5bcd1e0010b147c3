//! Worker-thread scheduler
//!
//! A fixed pool of worker threads fed by two FIFO queues: a general queue for
//! batch work and a pixel queue for the cluster tasks forked inside a batch.
//! Pixel tasks never block, so a thread that is itself waiting (on a ticket or
//! a wait group) may safely execute them inline via [`Scheduler::help_one`].
//! General tasks may block, and are only ever run by the worker loop.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

struct Queues {
    general_tx: Sender<Message>,
    general_rx: Receiver<Message>,
    pixel_tx: Sender<Message>,
    pixel_rx: Receiver<Message>,
}

/// Shared worker-thread pool
pub struct Scheduler {
    queues: Arc<Queues>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl Scheduler {
    /// Creates a pool with `worker_count` threads (0 selects the hardware
    /// thread count).
    pub fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = if worker_count == 0 {
            std::thread::available_parallelism().map_or(4, |n| n.get())
        } else {
            worker_count
        };

        let (general_tx, general_rx) = unbounded();
        let (pixel_tx, pixel_rx) = unbounded();
        let queues = Arc::new(Queues {
            general_tx,
            general_rx,
            pixel_tx,
            pixel_rx,
        });

        let workers = (0..worker_count)
            .map(|index| {
                let queues = Arc::clone(&queues);
                std::thread::Builder::new()
                    .name(format!("raster-worker-{index}"))
                    .spawn(move || worker_loop(&queues))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::debug!("scheduler started with {worker_count} worker threads");

        Arc::new(Self {
            queues,
            workers,
            worker_count,
        })
    }

    /// Number of worker threads in the pool
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Enqueues a general task. General tasks may block on tickets and wait
    /// groups.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.queues
            .general_tx
            .send(Message::Run(Box::new(job)))
            .expect("scheduler queue closed");
    }

    /// Enqueues a pixel task. Pixel tasks must not block; they are eligible
    /// for inline execution by waiting threads.
    pub fn spawn_pixel(&self, job: impl FnOnce() + Send + 'static) {
        self.queues
            .pixel_tx
            .send(Message::Run(Box::new(job)))
            .expect("scheduler queue closed");
    }

    /// Runs one queued pixel task on the calling thread, if any is pending.
    /// Returns whether a task was executed.
    pub fn help_one(&self) -> bool {
        match self.queues.pixel_rx.try_recv() {
            Ok(Message::Run(job)) => {
                job();
                true
            }
            _ => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.queues.general_tx.send(Message::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(queues: &Queues) {
    loop {
        // Drain pixel work ahead of general work: cluster tasks gate the
        // batch that forked them.
        match queues.pixel_rx.try_recv() {
            Ok(Message::Run(job)) => {
                job();
                continue;
            }
            Ok(Message::Stop) => return,
            Err(_) => {}
        }

        crossbeam::select! {
            recv(queues.pixel_rx) -> message => match message {
                Ok(Message::Run(job)) => job(),
                Ok(Message::Stop) | Err(_) => return,
            },
            recv(queues.general_rx) -> message => match message {
                Ok(Message::Run(job)) => job(),
                Ok(Message::Stop) | Err(_) => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::sync::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_spawn_runs_tasks() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let group = crate::task::WaitGroup::new(8);

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let group = group.clone();
            scheduler.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                group.done();
            });
        }

        group.wait(&scheduler);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_help_one_runs_pixel_tasks_inline() {
        let scheduler = Scheduler::new(1);
        // Occupy the single worker so the pixel task stays queued.
        let gate = Arc::new(Event::new());
        {
            let gate = Arc::clone(&gate);
            scheduler.spawn(move || gate.wait());
        }

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            scheduler.spawn_pixel(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        while !scheduler.help_one() {
            std::thread::yield_now();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        gate.signal();
    }
}
