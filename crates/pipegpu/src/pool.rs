//! Fixed-block object pools and the screen-wide coordinator that switches their locking mode.
//!
//! A screen owns one buffer-object pool shared by every context it created. While at most one
//! context is alive the pool runs in [`ThreadSafety::SingleThreaded`] mode and takes its lock
//! through an uncontended `try_lock` fast path; as soon as a second context appears the
//! coordinator switches it to [`ThreadSafety::MultiThreaded`].

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadSafety {
    SingleThreaded,
    MultiThreaded,
}

impl ThreadSafety {
    /// Mode required while `live_contexts` contexts share a pool.
    pub fn for_live_contexts(live_contexts: usize) -> Self {
        if live_contexts > 1 {
            ThreadSafety::MultiThreaded
        } else {
            ThreadSafety::SingleThreaded
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            ThreadSafety::SingleThreaded => 0,
            ThreadSafety::MultiThreaded => 1,
        }
    }

    fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            ThreadSafety::SingleThreaded
        } else {
            ThreadSafety::MultiThreaded
        }
    }
}

#[derive(Debug, Default)]
struct SlotPoolInner {
    free: Vec<u32>,
    capacity: u32,
    in_use: usize,
    contended: u64,
}

/// Pool of slot indices growing in fixed-size blocks.
#[derive(Debug)]
pub struct SlotPool {
    name: &'static str,
    slots_per_block: u32,
    mode: AtomicU8,
    inner: Mutex<SlotPoolInner>,
}

impl SlotPool {
    pub fn new(name: &'static str, slots_per_block: u32, mode: ThreadSafety) -> Self {
        Self {
            name,
            slots_per_block: slots_per_block.max(1),
            mode: AtomicU8::new(mode.to_raw()),
            inner: Mutex::new(SlotPoolInner::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::from_raw(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_thread_safety(&self, mode: ThreadSafety) {
        let prev = ThreadSafety::from_raw(self.mode.swap(mode.to_raw(), Ordering::SeqCst));
        if prev != mode {
            debug!(pool = self.name, ?mode, "pool thread-safety changed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotPoolInner> {
        if self.thread_safety() == ThreadSafety::SingleThreaded {
            match self.inner.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    // A second context is mid-registration; fall through to the blocking path.
                }
            }
            let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            guard.contended += 1;
            trace!(pool = self.name, "single-threaded pool contended");
            return guard;
        }
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take a slot, growing the pool by one block when it is exhausted.
    pub fn acquire(self: &Arc<Self>) -> PoolSlot {
        let mut inner = self.lock();
        if inner.free.is_empty() {
            let start = inner.capacity;
            let end = start + self.slots_per_block;
            inner.capacity = end;
            inner.free.extend((start..end).rev());
            trace!(pool = self.name, capacity = inner.capacity, "pool grew");
        }
        // The branch above guarantees at least one free slot.
        let index = inner.free.pop().unwrap_or(inner.capacity);
        inner.in_use += 1;
        PoolSlot {
            pool: Arc::clone(self),
            index,
        }
    }

    fn release(&self, index: u32) {
        let mut inner = self.lock();
        debug_assert!(inner.in_use > 0, "pool `{}` released more than acquired", self.name);
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push(index);
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn capacity(&self) -> u32 {
        self.lock().capacity
    }

    /// Lock acquisitions that missed the single-threaded fast path.
    pub fn contended(&self) -> u64 {
        self.lock().contended
    }
}

/// A pool slot held for the lifetime of some object. Dropping it returns the slot.
#[derive(Debug)]
pub struct PoolSlot {
    pool: Arc<SlotPool>,
    index: u32,
}

impl PoolSlot {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Slots per block of the screen's buffer-object pool.
pub const BUFFER_POOL_BLOCK: u32 = 512;

/// Tracks live contexts on a screen and keeps shared pools in the right locking mode.
#[derive(Debug)]
pub struct PoolCoordinator {
    live: AtomicUsize,
    transition: Mutex<()>,
    buffers: Arc<SlotPool>,
}

impl Default for PoolCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolCoordinator {
    pub fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            transition: Mutex::new(()),
            buffers: Arc::new(SlotPool::new(
                "buffers",
                BUFFER_POOL_BLOCK,
                ThreadSafety::SingleThreaded,
            )),
        }
    }

    pub fn buffers(&self) -> &Arc<SlotPool> {
        &self.buffers
    }

    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        self.buffers.thread_safety()
    }

    /// Register a new context. Returns the live count after the change.
    pub fn context_created(&self) -> usize {
        let _transition = self.transition.lock().unwrap_or_else(|p| p.into_inner());
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.buffers
            .set_thread_safety(ThreadSafety::for_live_contexts(live));
        live
    }

    /// Unregister a context. Returns the live count after the change.
    pub fn context_destroyed(&self) -> usize {
        let _transition = self.transition.lock().unwrap_or_else(|p| p.into_inner());
        let prev = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug_assert!(prev > 0, "context destroyed with no live contexts");
        let live = prev.saturating_sub(1);
        self.buffers
            .set_thread_safety(ThreadSafety::for_live_contexts(live));
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_after_release() {
        let pool = Arc::new(SlotPool::new("test", 2, ThreadSafety::SingleThreaded));
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(pool.capacity(), 2);

        let c = pool.acquire();
        assert_eq!(c.index(), 2);
        assert_eq!(pool.capacity(), 4);

        drop(b);
        assert_eq!(pool.acquire().index(), 1);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn exhausted_pool_grows_by_whole_blocks() {
        let pool = Arc::new(SlotPool::new("test", 3, ThreadSafety::MultiThreaded));
        let slots: Vec<_> = (0..7).map(|_| pool.acquire()).collect();
        let indices: Vec<u32> = slots.iter().map(PoolSlot::index).collect();
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
        assert_eq!(pool.capacity(), 9);
        assert_eq!(pool.in_use(), 7);
    }

    #[test]
    fn mode_follows_live_context_count() {
        let coordinator = PoolCoordinator::new();
        assert_eq!(coordinator.thread_safety(), ThreadSafety::SingleThreaded);

        assert_eq!(coordinator.context_created(), 1);
        assert_eq!(coordinator.thread_safety(), ThreadSafety::SingleThreaded);

        assert_eq!(coordinator.context_created(), 2);
        assert_eq!(coordinator.thread_safety(), ThreadSafety::MultiThreaded);

        assert_eq!(coordinator.context_destroyed(), 1);
        assert_eq!(coordinator.thread_safety(), ThreadSafety::SingleThreaded);

        assert_eq!(coordinator.context_destroyed(), 0);
        assert_eq!(coordinator.thread_safety(), ThreadSafety::SingleThreaded);
    }

    #[test]
    fn concurrent_registration_never_loses_counts() {
        let coordinator = Arc::new(PoolCoordinator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        coordinator.context_created();
                        let _slot = coordinator.buffers().acquire();
                        coordinator.context_destroyed();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(coordinator.live_contexts(), 0);
        assert_eq!(coordinator.buffers().in_use(), 0);
        assert_eq!(coordinator.thread_safety(), ThreadSafety::SingleThreaded);
    }
}
