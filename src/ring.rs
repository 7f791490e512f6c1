use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

/// A contiguous region of the ring handed out by [`SpscRing::alloc_contig`]
/// or [`SpscRing::read_contig`].
///
/// `len` is the number of bytes usable at `ptr`, at most the requested
/// count. When `len` came up short, `end_of_buffer` tells why:
///
/// - `true` — the physical end of the buffer is in the way. Waiting will
///   not produce a larger contiguous run; wrap (or, for reads, consume the
///   tail first).
/// - `false` — the other side's index is in the way. The region can grow
///   once the peer makes progress.
#[derive(Debug, Clone, Copy)]
pub struct ContigRegion {
    pub ptr: *mut u8,
    pub len: u32,
    pub end_of_buffer: bool,
}

/// Both writable segments of the ring at once, from
/// [`SpscRing::compound_alloc_contig`].
///
/// `first` runs from the write position to the end of the buffer or to the
/// read index; `second` is the prefix past the wrap point (length zero when
/// wrapping is not possible). Pointers are null when the matching length is
/// zero.
#[derive(Debug, Clone, Copy)]
pub struct CompoundRegion {
    pub first: *mut u8,
    pub first_len: u32,
    pub second: *mut u8,
    pub second_len: u32,
    /// True if the write index is numerically at or past the read index.
    pub write_ahead_of_read: bool,
}

/// A lock-free single-producer / single-consumer byte ring over a
/// caller-supplied buffer.
///
/// One slot is sacrificed to tell a full ring from an empty one, so a
/// buffer of `capacity` bytes stores at most `capacity - 1`. The two
/// indices live on separate cache lines to keep the producer and consumer
/// from false-sharing, and synchronize with acquire/release pairs: the
/// producer publishes bytes with its `write_index` store, the consumer
/// frees space with its `read_index` store.
///
/// Protocol — the caller upholds the SPSC split:
/// - only the producing thread calls `write`, `write_bytes`,
///   `alloc_contig`, `compound_alloc_contig` and `commit_write`;
/// - only the consuming thread calls `read`, `read_contig` and
///   `commit_read`.
///
/// The ring does not own the buffer; keep it alive for the ring's
/// lifetime.
///
/// ## Example
///
/// ```
/// use rtmem::SpscRing;
///
/// let mut buf = [0u8; 8];
/// let ring = SpscRing::new(buf.as_mut_ptr(), 8);
///
/// assert!(ring.write(&[1, 2, 3]));
/// let mut out = [0u8; 8];
/// assert_eq!(ring.read(&mut out), 3);
/// assert_eq!(&out[..3], &[1, 2, 3]);
/// ```
pub struct SpscRing {
    buf: *mut u8,
    capacity: u32,
    writable_capacity: u32,

    /// Owned by the consumer; names the next unread byte.
    read_index: CachePadded<AtomicU32>,
    /// Owned by the producer; names the next byte to write.
    write_index: CachePadded<AtomicU32>,
}

// SAFETY: the byte buffer is partitioned by the index invariant — the
// producer only writes bytes the consumer cannot yet read, and index
// updates use release stores matched by acquire loads on the other side.
// The one-producer / one-consumer restriction is documented protocol.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

impl SpscRing {
    /// Builds a ring over `capacity` bytes at `buf`. The usable capacity is
    /// `capacity - 1`.
    pub fn new(buf: *mut u8, capacity: u32) -> SpscRing {
        SpscRing {
            buf,
            capacity,
            writable_capacity: capacity.saturating_sub(1),
            read_index: CachePadded::new(AtomicU32::new(0)),
            write_index: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Bytes the ring can hold in total.
    #[inline]
    pub fn writable_capacity(&self) -> u32 {
        self.writable_capacity
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.read_index.load(Ordering::Acquire) == self.write_index.load(Ordering::Acquire)
    }

    /// Bytes currently stored. Approximate from any thread that is not the
    /// only producer and consumer: a concurrent write makes it an
    /// undercount, a concurrent read an overcount.
    pub fn approx_size(&self) -> u32 {
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Acquire);
        self.bytes_stored(write_index, read_index)
    }

    /// Free bytes, with the same caveat as [`approx_size`].
    ///
    /// [`approx_size`]: SpscRing::approx_size
    #[inline]
    pub fn approx_free_bytes(&self) -> u32 {
        self.writable_capacity - self.approx_size()
    }

    /// Writes all of `input` or nothing. Zero-length writes succeed;
    /// anything longer than the writable capacity or the current free
    /// space is rejected without touching the ring.
    pub fn write(&self, input: &[u8]) -> bool {
        let sz = input.len() as u32;
        if input.len() > self.writable_capacity as usize {
            return false;
        }
        if sz == 0 {
            return true;
        }

        let write_index = self.write_index.load(Ordering::Relaxed);
        let read_index = self.read_index.load(Ordering::Acquire);

        let stored = self.bytes_stored(write_index, read_index);
        let space_left = self.writable_capacity - stored;
        if sz > space_left {
            return false;
        }

        unsafe { self.copy_in(input.as_ptr(), sz, write_index) };

        self.write_index
            .store((write_index + sz) % self.capacity, Ordering::Release);

        true
    }

    /// Writes as much of `input` as fits (possibly non-contiguously) and
    /// returns the byte count actually stored.
    pub fn write_bytes(&self, input: &[u8]) -> u32 {
        let mut sz = input.len() as u32;
        if input.len() > self.writable_capacity as usize {
            sz = self.writable_capacity;
        }
        if sz == 0 {
            return 0;
        }

        let write_index = self.write_index.load(Ordering::Relaxed);
        let read_index = self.read_index.load(Ordering::Acquire);

        let stored = self.bytes_stored(write_index, read_index);
        let space_left = self.writable_capacity - stored;
        let amount = sz.min(space_left);
        if amount == 0 {
            return 0;
        }

        unsafe { self.copy_in(input.as_ptr(), amount, write_index) };

        self.write_index
            .store((write_index + amount) % self.capacity, Ordering::Release);

        amount
    }

    /// Reads up to `output.len()` bytes into `output`, returning the count
    /// actually read.
    pub fn read(&self, output: &mut [u8]) -> u32 {
        let max_read = (output.len() as u32).min(self.writable_capacity);
        if max_read == 0 {
            return 0;
        }

        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Relaxed);

        let stored = self.bytes_stored(write_index, read_index);
        let amount = max_read.min(stored);
        if amount == 0 {
            return 0;
        }

        unsafe {
            if write_index >= read_index {
                ptr::copy_nonoverlapping(
                    self.buf.add(read_index as usize),
                    output.as_mut_ptr(),
                    amount as usize,
                );
            } else {
                let until_end = (self.capacity - read_index).min(amount);
                ptr::copy_nonoverlapping(
                    self.buf.add(read_index as usize),
                    output.as_mut_ptr(),
                    until_end as usize,
                );
                ptr::copy_nonoverlapping(
                    self.buf,
                    output.as_mut_ptr().add(until_end as usize),
                    (amount - until_end) as usize,
                );
            }
        }

        self.read_index
            .store((read_index + amount) % self.capacity, Ordering::Release);

        amount
    }

    /// Reserves up to `requested` contiguous bytes at the write position.
    ///
    /// Nothing is committed until [`commit_write`] is called with the byte
    /// count actually written. Calling this again before committing simply
    /// returns the same region; interleaving `write`/`write_bytes` before
    /// the commit invalidates the region.
    ///
    /// [`commit_write`]: SpscRing::commit_write
    pub fn alloc_contig(&self, requested: u32) -> ContigRegion {
        let write_index = self.write_index.load(Ordering::Relaxed);
        let read_index = self.read_index.load(Ordering::Acquire);

        let (largest, end_of_buffer) = if write_index >= read_index {
            let mut largest = self.writable_capacity - write_index;
            if read_index != 0 {
                // The producer may run right up to the buffer end and wrap
                // into slot zero, so one more byte is usable and the limit
                // is the physical end
                largest += 1;
                (largest, true)
            } else {
                (largest, false)
            }
        } else {
            (read_index - write_index - 1, false)
        };

        ContigRegion {
            ptr: unsafe { self.buf.add(write_index as usize) },
            len: largest.min(requested),
            end_of_buffer,
        }
    }

    /// Publishes `sz` bytes previously written into an [`alloc_contig`]
    /// region.
    ///
    /// [`alloc_contig`]: SpscRing::alloc_contig
    pub fn commit_write(&self, sz: u32) {
        if sz == 0 {
            return;
        }
        let write_index = self.write_index.load(Ordering::Relaxed);
        self.write_index
            .store((write_index + sz) % self.capacity, Ordering::Release);
    }

    /// Returns every byte writable right now as two segments: the run from
    /// the write position, and the wrapped prefix at the buffer start.
    pub fn compound_alloc_contig(&self) -> CompoundRegion {
        let write_index = self.write_index.load(Ordering::Relaxed);
        let read_index = self.read_index.load(Ordering::Acquire);

        let mut result = CompoundRegion {
            first: ptr::null_mut(),
            first_len: 0,
            second: ptr::null_mut(),
            second_len: 0,
            write_ahead_of_read: write_index >= read_index,
        };

        let stored = self.bytes_stored(write_index, read_index);
        let mut free = self.writable_capacity - stored;

        let largest = if write_index >= read_index {
            let mut largest = self.writable_capacity - write_index;
            if read_index != 0 {
                largest += 1;
            }
            largest
        } else {
            read_index - write_index - 1
        };

        if largest == 0 {
            return result;
        }

        result.first = unsafe { self.buf.add(write_index as usize) };
        result.first_len = largest;

        debug_assert!(largest <= free);
        free -= largest;
        if free == 0 {
            return result;
        }

        result.second = self.buf;
        result.second_len = free;

        result
    }

    /// Exposes up to `requested` contiguous readable bytes at the read
    /// position. Commit with [`commit_read`]; the same
    /// repeat-before-commit rules as [`alloc_contig`] apply.
    ///
    /// [`commit_read`]: SpscRing::commit_read
    /// [`alloc_contig`]: SpscRing::alloc_contig
    pub fn read_contig(&self, requested: u32) -> ContigRegion {
        let write_index = self.write_index.load(Ordering::Acquire);
        let read_index = self.read_index.load(Ordering::Relaxed);

        let (largest, end_of_buffer) = if write_index >= read_index {
            (write_index - read_index, false)
        } else {
            (self.capacity - read_index, true)
        };

        ContigRegion {
            ptr: unsafe { self.buf.add(read_index as usize) },
            len: largest.min(requested),
            end_of_buffer,
        }
    }

    /// Releases `sz` bytes previously taken through a [`read_contig`]
    /// region.
    ///
    /// [`read_contig`]: SpscRing::read_contig
    pub fn commit_read(&self, sz: u32) {
        if sz == 0 {
            return;
        }
        let read_index = self.read_index.load(Ordering::Relaxed);
        self.read_index
            .store((read_index + sz) % self.capacity, Ordering::Release);
    }

    fn bytes_stored(&self, write_index: u32, read_index: u32) -> u32 {
        if write_index >= read_index {
            write_index - read_index
        } else {
            self.writable_capacity - read_index + 1 + write_index
        }
    }

    /// Copies `amount` bytes to the write position, splitting at the
    /// physical end of the buffer when needed.
    unsafe fn copy_in(&self, input: *const u8, amount: u32, write_index: u32) {
        let until_end = (self.capacity - write_index).min(amount);
        ptr::copy_nonoverlapping(input, self.buf.add(write_index as usize), until_end as usize);
        ptr::copy_nonoverlapping(
            input.add(until_end as usize),
            self.buf,
            (amount - until_end) as usize,
        );
    }
}
