use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

use crate::alloc::BlockAlloc;
use crate::tlsf::WORD_SIZE;

/// The bookkeeping record shared by every [`Shared`] and [`Weak`] handle of
/// one payload: the allocator that produced the payload, the payload
/// pointer with its element count, and the two reference counts.
///
/// The weak count carries one extra slot owned collectively by the strong
/// handles; it is released when the last strong handle goes, and the block
/// itself is released when the weak count reaches zero.
struct ControlBlk<'a, T, A: BlockAlloc> {
    strong: AtomicU32,
    weak: AtomicU32,
    len: usize,
    data: *mut T,
    alloc: &'a A,
}

impl<'a, T, A: BlockAlloc> ControlBlk<'a, T, A> {
    fn inc_strong(&self) {
        let prev = self.strong.fetch_add(1, SeqCst);
        debug_assert!(prev > 0, "strong acquire on a dead payload");
        debug_assert!(prev < u32::MAX);
    }

    fn inc_weak(&self) {
        self.weak.fetch_add(1, SeqCst);
    }

    /// Drops one strong reference. When it was the last, the payload is
    /// destroyed here — exactly once, on the calling thread — and the
    /// strongs' collective weak slot is released. True when the control
    /// block itself must be freed.
    unsafe fn dec_strong(&self) -> bool {
        let prev = self.strong.fetch_sub(1, SeqCst);
        debug_assert!(prev != 0);

        if prev == 1 {
            self.release_payload();
            return self.dec_weak();
        }
        false
    }

    /// True when the control block must be freed.
    unsafe fn dec_weak(&self) -> bool {
        let prev = self.weak.fetch_sub(1, SeqCst);
        debug_assert!(prev != 0);
        prev == 1
    }

    unsafe fn release_payload(&self) {
        for i in 0..self.len {
            ptr::drop_in_place(self.data.add(i));
        }
        self.alloc
            .deallocate(NonNull::new_unchecked(self.data as *mut u8));
    }
}

/// Allocates and seeds a control block; the payload must already exist.
fn new_ctrl<'a, T, A: BlockAlloc>(
    alloc: &'a A,
    data: *mut T,
    len: usize,
) -> Option<NonNull<ControlBlk<'a, T, A>>> {
    let raw = alloc.allocate(std::mem::size_of::<ControlBlk<'a, T, A>>())?;
    let ctrl = raw.as_ptr() as *mut ControlBlk<'a, T, A>;
    unsafe {
        ctrl.write(ControlBlk {
            // One strong handle, plus the weak slot the strongs share
            strong: AtomicU32::new(1),
            weak: AtomicU32::new(1),
            len,
            data,
            alloc,
        });
        Some(NonNull::new_unchecked(ctrl))
    }
}

/// An allocator-aware reference-counting pointer.
///
/// `Shared<T>` provides shared ownership of one `T` — or, through
/// [`new_array`], of a slice of them — constructed in memory from the
/// caller's allocator. Cloning bumps an atomic count; when the last
/// `Shared` goes away the payload is destroyed, and the control block
/// follows once the last [`Weak`] is gone too.
///
/// All count updates are sequentially consistent atomic RMWs, so handles
/// can be cloned and dropped from any thread (given `T: Send + Sync`).
/// Payload destruction runs exactly once, on whichever thread drops the
/// final strong handle.
///
/// Every constructor returns `None` when the allocator cannot supply the
/// control block or the payload.
///
/// ## Example
///
/// ```
/// use rtmem::{MappedRegion, RtAllocMt, Shared};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
/// let alloc = RtAllocMt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let a = Shared::new(&alloc, 41i64).unwrap();
/// let b = a.clone();
/// assert_eq!(*a + 1, 42);
/// assert_eq!(b.strong_count(), 2);
/// ```
///
/// [`new_array`]: Shared::new_array
pub struct Shared<'a, T, A: BlockAlloc> {
    ctrl: NonNull<ControlBlk<'a, T, A>>,
    _marker: PhantomData<ControlBlk<'a, T, A>>,
}

// SAFETY: the counts are atomic and payload destruction is serialized by
// the strong count reaching zero exactly once. Sending a handle moves
// access to both &T and the allocator across threads, hence the bounds.
unsafe impl<T: Send + Sync, A: BlockAlloc + Sync> Send for Shared<'_, T, A> {}
unsafe impl<T: Send + Sync, A: BlockAlloc + Sync> Sync for Shared<'_, T, A> {}

impl<'a, T, A: BlockAlloc> Shared<'a, T, A> {
    /// Moves `value` into allocator-owned memory behind a fresh control
    /// block.
    pub fn new(alloc: &'a A, value: T) -> Option<Shared<'a, T, A>> {
        Self::new_with(alloc, |uninit| {
            uninit.write(value);
        })
    }

    /// Constructs the payload in place, avoiding an intermediate copy.
    /// `initializer` must fully initialize its argument.
    pub fn new_with<F>(alloc: &'a A, initializer: F) -> Option<Shared<'a, T, A>>
    where
        F: FnOnce(&mut MaybeUninit<T>),
    {
        debug_assert!(std::mem::align_of::<T>() <= WORD_SIZE);

        let data = match alloc.allocate(std::mem::size_of::<T>()) {
            Some(ptr) => ptr.as_ptr() as *mut T,
            None => return None,
        };
        unsafe {
            initializer(&mut *(data as *mut MaybeUninit<T>));
        }

        match new_ctrl(alloc, data, 1) {
            Some(ctrl) => Some(Shared {
                ctrl,
                _marker: PhantomData,
            }),
            None => unsafe {
                ptr::drop_in_place(data);
                alloc.deallocate(NonNull::new_unchecked(data as *mut u8));
                None
            },
        }
    }

    /// Allocates `count` elements and constructs each one with
    /// `initializer(index)`. `count` of zero yields `None`.
    pub fn new_array<F>(alloc: &'a A, count: usize, mut initializer: F) -> Option<Shared<'a, T, A>>
    where
        F: FnMut(usize) -> T,
    {
        debug_assert!(std::mem::align_of::<T>() <= WORD_SIZE);

        if count == 0 {
            return None;
        }
        let bytes = count.checked_mul(std::mem::size_of::<T>())?;
        let data = match alloc.allocate(bytes) {
            Some(ptr) => ptr.as_ptr() as *mut T,
            None => return None,
        };
        unsafe {
            for i in 0..count {
                data.add(i).write(initializer(i));
            }
        }

        match new_ctrl(alloc, data, count) {
            Some(ctrl) => Some(Shared {
                ctrl,
                _marker: PhantomData,
            }),
            None => unsafe {
                for i in 0..count {
                    ptr::drop_in_place(data.add(i));
                }
                alloc.deallocate(NonNull::new_unchecked(data as *mut u8));
                None
            },
        }
    }

    fn ctrl(&self) -> &ControlBlk<'a, T, A> {
        unsafe { self.ctrl.as_ref() }
    }

    pub fn strong_count(&self) -> u32 {
        self.ctrl().strong.load(SeqCst)
    }

    /// Weak handles plus the one slot held collectively by the strongs.
    pub fn weak_count(&self) -> u32 {
        self.ctrl().weak.load(SeqCst)
    }

    /// Number of payload elements: 1 for scalars, the array count
    /// otherwise.
    pub fn len(&self) -> usize {
        self.ctrl().len
    }

    pub fn as_slice(&self) -> &[T] {
        let ctrl = self.ctrl();
        unsafe { std::slice::from_raw_parts(ctrl.data, ctrl.len) }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ctrl().data
    }

    /// A non-owning handle to the same payload.
    pub fn downgrade(&self) -> Weak<'a, T, A> {
        self.ctrl().inc_weak();
        Weak {
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<'a, T, A: BlockAlloc> Clone for Shared<'a, T, A> {
    fn clone(&self) -> Shared<'a, T, A> {
        self.ctrl().inc_strong();
        Shared {
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<T, A: BlockAlloc> std::ops::Deref for Shared<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.ctrl().data }
    }
}

impl<T, A: BlockAlloc> Drop for Shared<'_, T, A> {
    fn drop(&mut self) {
        unsafe {
            // Read the allocator out first: a true return means the block
            // memory must go back, and by then the block is logically dead
            let alloc = self.ctrl().alloc;
            if self.ctrl().dec_strong() {
                alloc.deallocate(self.ctrl.cast());
            }
        }
    }
}

impl<T: std::fmt::Debug, A: BlockAlloc> std::fmt::Debug for Shared<'_, T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

impl<T: std::fmt::Display, A: BlockAlloc> std::fmt::Display for Shared<'_, T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&**self, f)
    }
}

/// A non-owning observer of a [`Shared`] payload.
///
/// A `Weak` keeps the control block alive but not the payload. [`upgrade`]
/// attempts to win a new strong reference with a compare-exchange retry
/// loop, so it can never resurrect a payload that a concurrent drop is
/// already destroying.
///
/// [`upgrade`]: Weak::upgrade
pub struct Weak<'a, T, A: BlockAlloc> {
    ctrl: NonNull<ControlBlk<'a, T, A>>,
    _marker: PhantomData<ControlBlk<'a, T, A>>,
}

unsafe impl<T: Send + Sync, A: BlockAlloc + Sync> Send for Weak<'_, T, A> {}
unsafe impl<T: Send + Sync, A: BlockAlloc + Sync> Sync for Weak<'_, T, A> {}

impl<'a, T, A: BlockAlloc> Weak<'a, T, A> {
    fn ctrl(&self) -> &ControlBlk<'a, T, A> {
        unsafe { self.ctrl.as_ref() }
    }

    /// Strong references currently alive.
    pub fn use_count(&self) -> u32 {
        self.ctrl().strong.load(SeqCst)
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Tries to obtain a strong handle. None once the payload is gone.
    pub fn upgrade(&self) -> Option<Shared<'a, T, A>> {
        let ctrl = self.ctrl();
        let mut strong = ctrl.strong.load(SeqCst);
        loop {
            if strong == 0 {
                return None;
            }
            match ctrl
                .strong
                .compare_exchange_weak(strong, strong + 1, SeqCst, SeqCst)
            {
                Ok(_) => {
                    return Some(Shared {
                        ctrl: self.ctrl,
                        _marker: PhantomData,
                    })
                }
                Err(current) => strong = current,
            }
        }
    }
}

impl<'a, T, A: BlockAlloc> Clone for Weak<'a, T, A> {
    fn clone(&self) -> Weak<'a, T, A> {
        self.ctrl().inc_weak();
        Weak {
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<T, A: BlockAlloc> Drop for Weak<'_, T, A> {
    fn drop(&mut self) {
        unsafe {
            let alloc = self.ctrl().alloc;
            if self.ctrl().dec_weak() {
                alloc.deallocate(self.ctrl.cast());
            }
        }
    }
}

/// Exclusive ownership of one allocator-constructed `T`; the counted
/// pointers' single-owner sibling. Destroys and frees the payload on drop.
///
/// ## Example
///
/// ```
/// use rtmem::{MappedRegion, RtAllocSt, RtBox};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
/// let alloc = RtAllocSt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let mut value = RtBox::new(&alloc, 7u32).unwrap();
/// *value += 1;
/// assert_eq!(*value, 8);
/// ```
pub struct RtBox<'a, T, A: BlockAlloc> {
    alloc: &'a A,
    data: NonNull<T>,
}

unsafe impl<T: Send, A: BlockAlloc + Sync> Send for RtBox<'_, T, A> {}
unsafe impl<T: Sync, A: BlockAlloc + Sync> Sync for RtBox<'_, T, A> {}

impl<'a, T, A: BlockAlloc> RtBox<'a, T, A> {
    pub fn new(alloc: &'a A, value: T) -> Option<RtBox<'a, T, A>> {
        Self::new_with(alloc, |uninit| {
            uninit.write(value);
        })
    }

    /// Constructs the payload in place. `initializer` must fully
    /// initialize its argument.
    pub fn new_with<F>(alloc: &'a A, initializer: F) -> Option<RtBox<'a, T, A>>
    where
        F: FnOnce(&mut MaybeUninit<T>),
    {
        debug_assert!(std::mem::align_of::<T>() <= WORD_SIZE);

        let data = alloc.allocate(std::mem::size_of::<T>())?.cast::<T>();
        unsafe {
            initializer(&mut *(data.as_ptr() as *mut MaybeUninit<T>));
        }
        Some(RtBox { alloc, data })
    }

    pub fn as_ptr(&self) -> *mut T {
        self.data.as_ptr()
    }
}

impl<T, A: BlockAlloc> std::ops::Deref for RtBox<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.data.as_ref() }
    }
}

impl<T, A: BlockAlloc> std::ops::DerefMut for RtBox<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.data.as_mut() }
    }
}

impl<T, A: BlockAlloc> Drop for RtBox<'_, T, A> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.data.as_ptr());
            self.alloc.deallocate(self.data.cast());
        }
    }
}
