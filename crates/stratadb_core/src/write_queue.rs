//! Single-writer admission queue.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

/// The write coordinator: admits exactly one read-write transaction at
/// a time, in strict FIFO ticket order.
///
/// Synchronous writers take a ticket and block in [`WriteQueue::admit`]
/// until it is served. Asynchronous writers take their ticket at
/// submission time and run on an internal worker thread, so sync and
/// async write requests are totally ordered by ticket. Read
/// transactions never touch the queue.
pub struct WriteQueue {
    next_ticket: AtomicU64,
    now_serving: Mutex<u64>,
    served: Condvar,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Creates an empty queue with its worker thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("stratadb-write-queue".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .ok();
        Self {
            next_ticket: AtomicU64::new(0),
            now_serving: Mutex::new(0),
            served: Condvar::new(),
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Takes the next ticket. Admission order equals ticket order.
    pub fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// Blocks until `ticket` is served, returning the admission guard.
    ///
    /// Dropping the guard admits the next queued writer, including when
    /// the transaction body fails.
    pub fn admit(&self, ticket: u64) -> AdmissionGuard<'_> {
        let mut serving = self.now_serving.lock();
        while *serving != ticket {
            self.served.wait(&mut serving);
        }
        AdmissionGuard {
            queue: self,
            ticket,
        }
    }

    /// Enqueues an asynchronous job on the worker thread.
    ///
    /// The job is responsible for admitting the ticket it captured at
    /// submission time.
    pub fn submit(&self, job: Job) {
        if let Some(tx) = self.jobs.lock().as_ref() {
            // A send failure means the queue is shutting down; the job
            // is dropped along with its completion.
            let _ = tx.send(job);
        }
    }

    fn release(&self, ticket: u64) {
        let mut serving = self.now_serving.lock();
        *serving = ticket + 1;
        self.served.notify_all();
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            // A queued job may own the last handle to the structure
            // holding this queue; joining from the worker itself would
            // deadlock, so let it wind down detached.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("next_ticket", &self.next_ticket.load(Ordering::SeqCst))
            .field("now_serving", &*self.now_serving.lock())
            .finish_non_exhaustive()
    }
}

/// Proof of admission to the single write slot.
pub struct AdmissionGuard<'a> {
    queue: &'a WriteQueue,
    ticket: u64,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.queue.release(self.ticket);
    }
}
