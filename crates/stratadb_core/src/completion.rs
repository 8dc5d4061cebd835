//! Serial execution contexts for completion callbacks.

use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

/// A serial execution context: jobs posted to it run one at a time, in
/// posting order, on a dedicated thread.
///
/// Asynchronous database operations deliver their completion callbacks
/// through a `CompletionQueue`. The database owns a default one (the
/// user-facing delivery context); callers may supply their own to any
/// async API instead. Because completions are posted from inside the
/// write slot, posting order equals commit order.
pub struct CompletionQueue {
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionQueue {
    /// Creates a queue with its own worker thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("stratadb-completion".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .ok();
        Self {
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Posts a job to run on this queue's thread.
    pub fn post(&self, job: Job) {
        if let Some(tx) = self.jobs.lock().as_ref() {
            let _ = tx.send(job);
        }
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            // A posted completion may own the last handle to the
            // structure holding this queue; joining from the worker
            // itself would deadlock, so let it wind down detached.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue").finish_non_exhaustive()
    }
}
