use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::sync::{Lock, LockGuard, NullLock, OsLock};
use crate::tlsf::TlsfArena;

/// The narrow allocation capability every container in this crate consumes.
///
/// Implementors hand out word-aligned regions of at least the requested
/// size and take them back by pointer alone. `None` means out of memory;
/// there is no error channel beyond that (callers degrade or retry).
pub trait BlockAlloc {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on the same instance and must not be
    /// used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);
}

/// Adapts a [`TlsfArena`] into the [`BlockAlloc`] capability, taking the
/// lock `L` around every arena call. The arena core itself is not
/// thread-safe; the lock policy decides who may share the facade:
///
/// - [`RtAllocSt`] uses [`NullLock`] and is therefore neither `Send` nor
///   `Sync` — single-threaded use costs nothing.
/// - [`RtAllocMt`] uses [`OsLock`] and can be shared freely.
///
/// The facade does not own the backing buffer. Keep the buffer (for example
/// a [`MappedRegion`]) alive until after [`uninit`].
///
/// ## Example
///
/// ```
/// use rtmem::{BlockAlloc, MappedRegion, RtAllocMt};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
///
/// let alloc = RtAllocMt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let ptr = alloc.allocate(128).unwrap();
/// unsafe { alloc.deallocate(ptr) };
/// ```
///
/// [`MappedRegion`]: crate::MappedRegion
/// [`uninit`]: RtAlloc::uninit
pub struct RtAlloc<L: Lock = NullLock> {
    arena: UnsafeCell<Option<NonNull<TlsfArena>>>,
    lock: L,
}

/// A real-time allocator for use by a single thread.
pub type RtAllocSt = RtAlloc<NullLock>;

/// A real-time allocator shareable between threads.
pub type RtAllocMt = RtAlloc<OsLock>;

// SAFETY: every access to the arena cell happens with the lock held, and
// the lock type gates which of these bounds are actually satisfiable.
// NullLock is !Send + !Sync, so RtAllocSt stays confined to one thread.
unsafe impl<L: Lock + Send> Send for RtAlloc<L> {}
unsafe impl<L: Lock + Send + Sync> Sync for RtAlloc<L> {}

impl<L: Lock> RtAlloc<L> {
    /// Creates an empty facade; [`init`] must be called before use.
    ///
    /// [`init`]: RtAlloc::init
    pub fn new() -> RtAlloc<L> {
        RtAlloc {
            arena: UnsafeCell::new(None),
            lock: L::default(),
        }
    }

    /// Builds an arena over `capacity` bytes of `buf`. Returns false when
    /// the region is rejected (see [`ArenaError`]); an already-initialized
    /// facade returns true untouched.
    ///
    /// [`ArenaError`]: crate::ArenaError
    pub fn init(&self, buf: *mut u8, capacity: usize) -> bool {
        let _guard = LockGuard::new(&self.lock);
        let slot = unsafe { &mut *self.arena.get() };

        if slot.is_some() {
            return true;
        }
        if buf.is_null() || capacity == 0 {
            return false;
        }

        match unsafe { TlsfArena::new(buf, capacity) } {
            Ok(arena) => {
                *slot = Some(arena);
                true
            }
            Err(err) => {
                log::debug!("allocator init rejected: {}", err);
                false
            }
        }
    }

    /// Forgets the arena. The caller is responsible for releasing the
    /// backing buffer; outstanding allocations become dangling.
    pub fn uninit(&self) {
        let _guard = LockGuard::new(&self.lock);
        unsafe { *self.arena.get() = None };
    }

    pub fn is_initialized(&self) -> bool {
        let _guard = LockGuard::new(&self.lock);
        unsafe { (*self.arena.get()).is_some() }
    }
}

impl<L: Lock> BlockAlloc for RtAlloc<L> {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let _guard = LockGuard::new(&self.lock);
        let slot = unsafe { &mut *self.arena.get() };
        let mut arena = (*slot)?;
        NonNull::new(unsafe { arena.as_mut() }.allocate(bytes))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let _guard = LockGuard::new(&self.lock);
        let slot = &mut *self.arena.get();
        if let Some(mut arena) = *slot {
            arena.as_mut().free(ptr.as_ptr());
        } else {
            debug_assert!(false, "deallocate on uninitialized allocator");
        }
    }
}

impl<L: Lock> Default for RtAlloc<L> {
    fn default() -> RtAlloc<L> {
        RtAlloc::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MappedRegion;

    #[test]
    fn init_lifecycle() {
        let mut region = MappedRegion::new();
        assert!(region.init(1024 * 1024));

        let alloc = RtAllocSt::new();
        assert!(!alloc.is_initialized());
        assert!(alloc.allocate(8).is_none());

        assert!(alloc.init(region.buffer(), region.capacity()));
        assert!(alloc.is_initialized());

        // Repeated init keeps the first arena
        assert!(alloc.init(region.buffer(), region.capacity()));

        let ptr = alloc.allocate(64).unwrap();
        unsafe { alloc.deallocate(ptr) };

        alloc.uninit();
        assert!(!alloc.is_initialized());
    }

    #[test]
    fn rejects_bad_regions() {
        let alloc = RtAllocSt::new();
        assert!(!alloc.init(std::ptr::null_mut(), 4096));

        let mut region = MappedRegion::new();
        assert!(region.init(4096));
        // Too small for the arena state
        assert!(!alloc.init(region.buffer(), 64));
    }

    #[test]
    fn allocations_are_usable() {
        let mut region = MappedRegion::new();
        assert!(region.init(1024 * 1024));

        let alloc = RtAllocSt::new();
        assert!(alloc.init(region.buffer(), region.capacity()));

        let mut ptrs = Vec::new();
        for i in 0..100usize {
            let ptr = alloc.allocate(32 + i).unwrap();
            unsafe { ptr.as_ptr().write_bytes(i as u8, 32 + i) };
            ptrs.push((ptr, 32 + i, i as u8));
        }
        for (ptr, len, pattern) in ptrs {
            unsafe {
                for off in 0..len {
                    assert_eq!(ptr.as_ptr().add(off).read(), pattern);
                }
                alloc.deallocate(ptr);
            }
        }
    }

    #[test]
    fn shared_between_threads() {
        use std::sync::{Arc, Barrier};

        let mut region = MappedRegion::new();
        assert!(region.init(8 * 1024 * 1024));

        let alloc = Arc::new(RtAllocMt::new());
        assert!(alloc.init(region.buffer(), region.capacity()));

        let nthreads = 4;
        let barrier = Arc::new(Barrier::new(nthreads));
        let mut handles = Vec::new();

        for t in 0..nthreads {
            let alloc = alloc.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let mut live = Vec::new();
                for i in 0..500usize {
                    if let Some(ptr) = alloc.allocate(16 + (i % 128)) {
                        unsafe { ptr.as_ptr().write_bytes(t as u8, 16 + (i % 128)) };
                        live.push((ptr, 16 + (i % 128)));
                    }
                    if i % 3 == 0 {
                        if let Some((ptr, len)) = live.pop() {
                            unsafe {
                                for off in 0..len {
                                    assert_eq!(ptr.as_ptr().add(off).read(), t as u8);
                                }
                                alloc.deallocate(ptr);
                            }
                        }
                    }
                }
                for (ptr, _) in live {
                    unsafe { alloc.deallocate(ptr) };
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // region must outlive the allocator uses above
        drop(region);
    }
}
