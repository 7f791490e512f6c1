use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::alloc::BlockAlloc;
use crate::tlsf::WORD_SIZE;
use crate::vector::RtVec;

/// A pool of pre-allocated `T` slots.
///
/// [`get`] pops a raw slot and constructs a `T` in place; [`put`] destroys
/// the `T` and recycles the slot. When the pool runs dry, it refills itself
/// by `elasticity` slots in one go instead of allocating one at a time.
///
/// The pool is single-threaded (it is neither `Send` nor `Sync`); methods
/// take `&self` so RAII handles from [`get_auto`] can coexist with further
/// pool calls.
///
/// Dropping the pool releases the raw slots it holds but runs no `T`
/// destructors: destructors run in [`put`], so every live object must be
/// returned before the pool goes away.
///
/// ## Example
///
/// ```
/// use rtmem::{MappedRegion, ObjectPool, RtAllocSt};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
/// let alloc = RtAllocSt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let pool: ObjectPool<u64, _> = ObjectPool::new(&alloc, 16, 4);
/// let obj = pool.get(42).unwrap();
/// unsafe {
///     assert_eq!(*obj.as_ref(), 42);
///     pool.put(obj);
/// }
/// ```
///
/// [`get`]: ObjectPool::get
/// [`put`]: ObjectPool::put
/// [`get_auto`]: ObjectPool::get_auto
pub struct ObjectPool<'a, T, A: BlockAlloc> {
    slots: UnsafeCell<RtVec<'a, NonNull<T>, A>>,
    alloc: &'a A,
    elasticity: std::cell::Cell<usize>,
    _marker: PhantomData<*mut ()>,
}

impl<'a, T, A: BlockAlloc> ObjectPool<'a, T, A> {
    /// Creates a pool holding `num_objects` raw slots, refilling by
    /// `elasticity` (clamped to at least 1) when empty. A short initial
    /// fill is not an error; [`len`] tells how many slots were obtained.
    ///
    /// [`len`]: ObjectPool::len
    pub fn new(alloc: &'a A, num_objects: usize, elasticity: usize) -> ObjectPool<'a, T, A> {
        debug_assert!(std::mem::align_of::<T>() <= WORD_SIZE);
        let pool = ObjectPool {
            slots: UnsafeCell::new(RtVec::new(alloc)),
            alloc,
            elasticity: std::cell::Cell::new(elasticity.max(1)),
            _marker: PhantomData,
        };
        pool.add_to_pool(num_objects);
        pool
    }

    /// Pre-allocates `num_objects` more raw slots (no constructors run).
    /// Returns how many were actually obtained before the allocator gave
    /// out.
    pub fn add_to_pool(&self, num_objects: usize) -> usize {
        let slots = unsafe { &mut *self.slots.get() };
        slots.reserve(slots.len() + num_objects);

        for i in 0..num_objects {
            let raw = match self.alloc.allocate(std::mem::size_of::<T>()) {
                Some(ptr) => ptr.cast::<T>(),
                None => return i,
            };
            if !slots.push(raw) {
                unsafe { self.alloc.deallocate(raw.cast()) };
                return i;
            }
        }

        num_objects
    }

    /// Constructs `value` in a pooled slot. None when the pool is empty
    /// and the elasticity refill cannot obtain a single slot.
    ///
    /// Every pointer obtained here must go back through [`put`], or the
    /// slot leaks.
    ///
    /// [`put`]: ObjectPool::put
    pub fn get(&self, value: T) -> Option<NonNull<T>> {
        let slot = self.take_slot()?;
        unsafe {
            slot.as_ptr().write(value);
        }
        Some(slot)
    }

    /// Like [`get`] but initializes the slot through `initializer`,
    /// avoiding an intermediate copy of `T`.
    ///
    /// The initializer must fully initialize the value; the pool hands the
    /// memory back to [`put`] as a live `T`.
    ///
    /// [`get`]: ObjectPool::get
    /// [`put`]: ObjectPool::put
    pub fn get_with<F>(&self, initializer: F) -> Option<NonNull<T>>
    where
        F: FnOnce(&mut MaybeUninit<T>),
    {
        let slot = self.take_slot()?;
        unsafe {
            initializer(&mut *(slot.as_ptr() as *mut MaybeUninit<T>));
        }
        Some(slot)
    }

    /// [`get`] wrapped in an RAII handle that returns the object to the
    /// pool when dropped.
    ///
    /// [`get`]: ObjectPool::get
    pub fn get_auto(&self, value: T) -> Option<PoolGuard<'_, 'a, T, A>> {
        let ptr = self.get(value)?;
        Some(PoolGuard { pool: self, ptr })
    }

    /// Destroys the object and recycles its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must hold a live `T` obtained from [`get`]/[`get_with`] on
    /// this pool and must not be used afterwards.
    ///
    /// [`get`]: ObjectPool::get
    /// [`get_with`]: ObjectPool::get_with
    pub unsafe fn put(&self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());

        let slots = &mut *self.slots.get();
        if !slots.push(ptr) {
            // Could not track the slot anymore, give it back outright
            self.alloc.deallocate(ptr.cast());
        }
    }

    /// Raw slots currently parked in the pool.
    pub fn len(&self) -> usize {
        unsafe { &*self.slots.get() }.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elasticity(&self) -> usize {
        self.elasticity.get()
    }

    pub fn set_elasticity(&self, elasticity: usize) {
        self.elasticity.set(elasticity.max(1));
    }

    fn take_slot(&self) -> Option<NonNull<T>> {
        {
            let slots = unsafe { &mut *self.slots.get() };
            if let Some(slot) = slots.pop() {
                return Some(slot);
            }
        }

        log::debug!("pool empty, refilling by {}", self.elasticity.get());
        if self.add_to_pool(self.elasticity.get()) < 1 {
            return None;
        }
        unsafe { &mut *self.slots.get() }.pop()
    }
}

impl<T, A: BlockAlloc> Drop for ObjectPool<'_, T, A> {
    fn drop(&mut self) {
        // Only raw storage is released here; objects still out there were
        // the caller's to return
        let slots = unsafe { &mut *self.slots.get() };
        while let Some(slot) = slots.pop() {
            unsafe { self.alloc.deallocate(slot.cast()) };
        }
    }
}

/// Owns one pooled object; hands it back on drop.
pub struct PoolGuard<'p, 'a, T, A: BlockAlloc> {
    pool: &'p ObjectPool<'a, T, A>,
    ptr: NonNull<T>,
}

impl<T, A: BlockAlloc> std::ops::Deref for PoolGuard<'_, '_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: BlockAlloc> std::ops::DerefMut for PoolGuard<'_, '_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: BlockAlloc> Drop for PoolGuard<'_, '_, T, A> {
    fn drop(&mut self) {
        unsafe { self.pool.put(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MappedRegion;
    use crate::RtAllocSt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (MappedRegion, RtAllocSt) {
        let mut region = MappedRegion::new();
        assert!(region.init(4 * 1024 * 1024));
        let alloc = RtAllocSt::new();
        assert!(alloc.init(region.buffer(), region.capacity()));
        (region, alloc)
    }

    #[test]
    fn get_put_cycle() {
        let (_region, alloc) = setup();
        let pool: ObjectPool<u64, _> = ObjectPool::new(&alloc, 4, 1);

        assert_eq!(pool.len(), 4);

        let a = pool.get(1).unwrap();
        let b = pool.get(2).unwrap();
        assert_eq!(pool.len(), 2);
        unsafe {
            assert_eq!(*a.as_ref(), 1);
            assert_eq!(*b.as_ref(), 2);
            pool.put(a);
            pool.put(b);
        }
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn refills_by_elasticity() {
        let (_region, alloc) = setup();
        let pool: ObjectPool<u64, _> = ObjectPool::new(&alloc, 1, 5);

        let a = pool.get(1).unwrap();
        assert!(pool.is_empty());

        // The next get refills by the elasticity
        let b = pool.get(2).unwrap();
        assert_eq!(pool.len(), 4);

        unsafe {
            pool.put(a);
            pool.put(b);
        }
        assert_eq!(pool.len(), 6);

        assert_eq!(pool.elasticity(), 5);
        pool.set_elasticity(0);
        assert_eq!(pool.elasticity(), 1);
    }

    #[test]
    fn failing_allocator_yields_none() {
        struct NoAlloc;
        impl BlockAlloc for NoAlloc {
            fn allocate(&self, _bytes: usize) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn deallocate(&self, _ptr: NonNull<u8>) {}
        }

        let alloc = NoAlloc;
        let pool: ObjectPool<u64, _> = ObjectPool::new(&alloc, 8, 2);
        assert!(pool.is_empty());
        assert!(pool.get(1).is_none());
    }

    #[test]
    fn put_runs_destructor() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted(#[allow(dead_code)] u32);
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (_region, alloc) = setup();
        let pool: ObjectPool<Counted, _> = ObjectPool::new(&alloc, 4, 1);

        let a = pool.get(Counted(7)).unwrap();
        assert_eq!(DROPS.load(Ordering::Relaxed), 0);
        unsafe { pool.put(a) };
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        // Pool drop releases slots without running destructors
        drop(pool);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn guard_returns_object() {
        let (_region, alloc) = setup();
        let pool: ObjectPool<u64, _> = ObjectPool::new(&alloc, 2, 1);

        {
            let mut guard = pool.get_auto(10).unwrap();
            assert_eq!(*guard, 10);
            *guard = 11;
            assert_eq!(*guard, 11);
            assert_eq!(pool.len(), 1);

            // A second live handle from the same pool
            let other = pool.get_auto(20).unwrap();
            assert_eq!(*other, 20);
            assert_eq!(pool.len(), 0);
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn get_with_initializes_in_place() {
        let (_region, alloc) = setup();
        let pool: ObjectPool<[u8; 32], _> = ObjectPool::new(&alloc, 2, 1);

        let obj = pool
            .get_with(|uninit| {
                let ptr = uninit.as_mut_ptr() as *mut u8;
                unsafe {
                    for i in 0..32 {
                        ptr.add(i).write(i as u8);
                    }
                }
            })
            .unwrap();

        unsafe {
            assert_eq!(obj.as_ref()[31], 31);
            pool.put(obj);
        }
    }
}
