//! Connection pool for recycling storage engine handles.

use crate::error::CoreResult;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use stratadb_storage::{StorageEngine, StorageHandle};

/// Default capacity of the idle pool.
pub const DEFAULT_POOL_CAPACITY: usize = 5;

/// Default idle lifetime before a pooled handle is evicted.
pub const DEFAULT_POOL_LIFETIME: Duration = Duration::from_secs(90);

/// A reusable handle to the underlying storage engine.
///
/// The engine handle is the expensive part of a connection; pooling it
/// amortizes the open cost across connection lifetimes.
pub struct PooledHandle {
    handle: Box<dyn StorageHandle>,
    id: u64,
}

impl PooledHandle {
    /// The underlying engine handle.
    pub(crate) fn storage(&mut self) -> &mut dyn StorageHandle {
        self.handle.as_mut()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle").field("id", &self.id).finish()
    }
}

struct IdleEntry {
    handle: PooledHandle,
    /// When the sweeper should evict this entry; `None` disables
    /// eviction (lifetime was non-positive at release time).
    deadline: Option<Instant>,
}

struct PoolShared {
    engine: Arc<dyn StorageEngine>,
    idle: Mutex<Vec<IdleEntry>>,
    wake: Condvar,
    max_idle: AtomicUsize,
    lifetime_ms: AtomicU64,
    shutdown: AtomicBool,
    next_handle_id: AtomicU64,
}

/// Bounded pool of idle engine handles with timed eviction.
///
/// `acquire` prefers the most recently pooled handle and opens a fresh
/// engine handle when the pool is empty; there is no cap on
/// concurrently open handles, only on the idle pool. A single sweeper
/// thread evicts handles whose idle deadline has passed. Capacity and
/// lifetime are runtime-mutable and apply to future operations only:
/// each entry's eviction deadline is fixed when it is released.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates a pool over `engine` with the default capacity and
    /// lifetime.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        let shared = Arc::new(PoolShared {
            engine,
            idle: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            max_idle: AtomicUsize::new(DEFAULT_POOL_CAPACITY),
            lifetime_ms: AtomicU64::new(DEFAULT_POOL_LIFETIME.as_millis() as u64),
            shutdown: AtomicBool::new(false),
            next_handle_id: AtomicU64::new(1),
        });
        let sweeper = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("stratadb-pool-sweeper".into())
                .spawn(move || sweeper_loop(&shared))
                .ok()
        };
        Self {
            shared,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Returns an idle handle, or opens a new one when the pool is
    /// empty.
    pub fn acquire(&self) -> CoreResult<PooledHandle> {
        if let Some(entry) = self.shared.idle.lock().pop() {
            return Ok(entry.handle);
        }
        let handle = self.shared.engine.open_handle()?;
        Ok(PooledHandle {
            handle,
            id: self.shared.next_handle_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Returns a handle to the pool, or closes it when the pool is at
    /// capacity.
    pub fn release(&self, handle: PooledHandle) {
        let max = self.shared.max_idle.load(Ordering::SeqCst);
        let mut idle = self.shared.idle.lock();
        if self.shared.shutdown.load(Ordering::SeqCst) || idle.len() >= max {
            drop(idle);
            // Dropping the handle closes the engine connection.
            drop(handle);
            return;
        }
        let lifetime_ms = self.shared.lifetime_ms.load(Ordering::SeqCst);
        let deadline = (lifetime_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(lifetime_ms));
        idle.push(IdleEntry { handle, deadline });
        self.shared.wake.notify_all();
    }

    /// Number of handles currently idling in the pool.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Returns the idle pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.max_idle.load(Ordering::SeqCst)
    }

    /// Sets the idle pool capacity. Affects future releases only.
    pub fn set_capacity(&self, capacity: usize) {
        self.shared.max_idle.store(capacity, Ordering::SeqCst);
    }

    /// Returns the idle lifetime. `Duration::ZERO` means eviction is
    /// disabled.
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.shared.lifetime_ms.load(Ordering::SeqCst))
    }

    /// Sets the idle lifetime. `Duration::ZERO` disables eviction.
    /// Affects future releases only; already-pooled handles keep the
    /// deadline assigned when they were released.
    pub fn set_lifetime(&self, lifetime: Duration) {
        self.shared
            .lifetime_ms
            .store(lifetime.as_millis() as u64, Ordering::SeqCst);
        self.shared.wake.notify_all();
    }
}

fn sweeper_loop(shared: &PoolShared) {
    let mut idle = shared.idle.lock();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let before = idle.len();
        idle.retain(|entry| entry.deadline.map_or(true, |deadline| deadline > now));
        let evicted = before - idle.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale pooled handles");
        }
        match idle.iter().filter_map(|entry| entry.deadline).min() {
            Some(deadline) => {
                let _ = shared.wake.wait_until(&mut idle, deadline);
            }
            None => shared.wake.wait(&mut idle),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Close everything still idling.
        self.shared.idle.lock().clear();
        self.shared.wake.notify_all();
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.join();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle_count", &self.idle_count())
            .field("capacity", &self.capacity())
            .field("lifetime", &self.lifetime())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_storage::MemoryEngine;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(Arc::new(MemoryEngine::new()))
    }

    #[test]
    fn recycles_released_handles() {
        let pool = pool();
        let handle = pool.acquire().unwrap();
        let id = handle.id();
        pool.release(handle);
        assert_eq!(pool.idle_count(), 1);

        let recycled = pool.acquire().unwrap();
        assert_eq!(recycled.id(), id);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn acquire_prefers_most_recently_pooled() {
        let pool = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.acquire().unwrap().id(), id_b);
        assert_eq!(pool.acquire().unwrap().id(), id_a);
    }

    #[test]
    fn idle_pool_never_exceeds_capacity() {
        let pool = pool();
        pool.set_capacity(3);
        let handles: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        for handle in handles {
            pool.release(handle);
        }
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn stale_handles_are_evicted() {
        let pool = pool();
        pool.set_lifetime(Duration::from_millis(20));
        pool.release(pool.acquire().unwrap());
        assert_eq!(pool.idle_count(), 1);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn zero_lifetime_disables_eviction() {
        let pool = pool();
        pool.set_lifetime(Duration::ZERO);
        pool.release(pool.acquire().unwrap());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn lifetime_change_applies_to_future_releases_only() {
        let pool = pool();
        pool.set_lifetime(Duration::ZERO);
        pool.release(pool.acquire().unwrap());

        // The already-pooled handle keeps its no-eviction deadline.
        pool.set_lifetime(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = Arc::new(pool());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let handle = pool.acquire().unwrap();
                    pool.release(handle);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle_count() <= pool.capacity());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use stratadb_storage::MemoryEngine;

    proptest! {
        /// Any interleaving of acquires and releases keeps the idle
        /// pool within capacity.
        #[test]
        fn idle_count_bounded(ops in proptest::collection::vec(any::<bool>(), 1..64),
                              capacity in 0usize..6) {
            let pool = ConnectionPool::new(Arc::new(MemoryEngine::new()));
            pool.set_capacity(capacity);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    held.push(pool.acquire().unwrap());
                } else if let Some(handle) = held.pop() {
                    pool.release(handle);
                }
                prop_assert!(pool.idle_count() <= capacity);
            }
        }
    }
}
