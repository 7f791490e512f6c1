use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::lock_api::RawMutex as _;

/// The locking capability used by the allocator facade.
///
/// A `Lock` either really excludes other threads ([`SpinLock`], [`OsLock`])
/// or compiles down to nothing ([`NullLock`]) when the caller guarantees
/// single-threaded access.
pub trait Lock: Default {
    fn lock(&self);
    fn unlock(&self);
}

/// A no-op lock for single-threaded use.
///
/// `NullLock` is deliberately neither `Send` nor `Sync`: anything guarded by
/// it inherits the single-thread restriction instead of silently losing it.
#[derive(Default)]
pub struct NullLock {
    _marker: PhantomData<*mut ()>,
}

impl Lock for NullLock {
    #[inline]
    fn lock(&self) {}
    #[inline]
    fn unlock(&self) {}
}

/// A test-and-set spin lock.
///
/// Spins with [`std::hint::spin_loop`] on contention. Suited to critical
/// sections that are themselves constant-time, like a TLSF allocate.
#[derive(Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub fn try_lock(&self) -> bool {
        // The relaxed pre-check avoids hammering the cache line with
        // exchanges while another thread holds the lock.
        !self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire)
    }
}

impl Lock for SpinLock {
    fn lock(&self) {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A blocking lock backed by `parking_lot`.
pub struct OsLock {
    raw: parking_lot::RawMutex,
}

impl Default for OsLock {
    fn default() -> OsLock {
        OsLock {
            raw: parking_lot::RawMutex::INIT,
        }
    }
}

impl Lock for OsLock {
    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn unlock(&self) {
        // The guard pairs every unlock with a prior lock on this thread.
        unsafe { self.raw.unlock() }
    }
}

/// RAII guard pairing [`Lock::lock`] with [`Lock::unlock`].
pub struct LockGuard<'a, L: Lock> {
    lock: &'a L,
}

impl<'a, L: Lock> LockGuard<'a, L> {
    pub fn new(lock: &'a L) -> LockGuard<'a, L> {
        lock.lock();
        LockGuard { lock }
    }
}

impl<L: Lock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// How a thread waits when it has nothing to do.
///
/// Spin loops that outlive their welcome should degrade to yielding or
/// sleeping; the strategies below cover the usual choices.
pub trait Slumber {
    fn wait(&mut self);
}

/// Yield to the OS scheduler on every wait.
#[derive(Default, Clone, Copy)]
pub struct SlumberYield;

impl Slumber for SlumberYield {
    fn wait(&mut self) {
        std::thread::yield_now();
    }
}

/// Sleep for a fixed duration on every wait.
#[derive(Clone, Copy)]
pub struct SlumberSleep {
    duration: Duration,
}

impl SlumberSleep {
    pub fn new(duration: Duration) -> SlumberSleep {
        SlumberSleep { duration }
    }
}

impl Default for SlumberSleep {
    fn default() -> SlumberSleep {
        SlumberSleep::new(Duration::from_micros(200))
    }
}

impl Slumber for SlumberSleep {
    fn wait(&mut self) {
        std::thread::sleep(self.duration);
    }
}

/// Spin for a bounded number of waits, then fall back to sleeping.
#[derive(Clone, Copy)]
pub struct SlumberProgressive {
    loop_count: u32,
    max_loop_count: u32,
    sleep: SlumberSleep,
}

impl SlumberProgressive {
    pub fn new(max_loop_count: u32, duration: Duration) -> SlumberProgressive {
        SlumberProgressive {
            loop_count: 0,
            max_loop_count,
            sleep: SlumberSleep::new(duration),
        }
    }
}

impl Default for SlumberProgressive {
    fn default() -> SlumberProgressive {
        SlumberProgressive::new(3500, Duration::from_micros(200))
    }
}

impl Slumber for SlumberProgressive {
    fn wait(&mut self) {
        if self.loop_count < self.max_loop_count {
            self.loop_count += 1;
            std::hint::spin_loop();
        } else {
            self.sleep.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn spin_lock_excludes() {
        struct Shared {
            lock: SpinLock,
            counter: AtomicUsize,
        }

        let shared = Arc::new(Shared {
            lock: SpinLock::default(),
            counter: AtomicUsize::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let _guard = LockGuard::new(&shared.lock);
                    let v = shared.counter.load(Ordering::Relaxed);
                    shared.counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(shared.counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn spin_try_lock() {
        let lock = SpinLock::default();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn os_lock_guard() {
        let lock = OsLock::default();
        {
            let _guard = LockGuard::new(&lock);
        }
        // Reacquirable after the guard dropped
        let _guard = LockGuard::new(&lock);
    }

    #[test]
    fn slumber_progressive_degrades() {
        let mut slumber = SlumberProgressive::new(3, Duration::from_nanos(1));
        for _ in 0..10 {
            slumber.wait();
        }
        assert_eq!(slumber.loop_count, 3);
    }
}
