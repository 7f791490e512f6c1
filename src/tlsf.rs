use std::ptr::{self, NonNull};

use static_assertions::const_assert;
use thiserror::Error;

use crate::bits::align;

/// Native word size in bytes. Every block size and payload address is a
/// multiple of this.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

#[cfg(target_pointer_width = "64")]
mod config {
    /// Second-level bitmap: one bit per linear subdivision of a power of two.
    pub type SlBitmap = u128;

    pub const MIN_FLI: u32 = 8;
    pub const MAX_FLI: u32 = 62;
    pub const FLI_SHIFT_VAL: u32 = 7;
}

#[cfg(target_pointer_width = "32")]
mod config {
    pub type SlBitmap = u64;

    pub const MIN_FLI: u32 = 7;
    pub const MAX_FLI: u32 = 30;
    pub const FLI_SHIFT_VAL: u32 = 6;
}

pub(crate) use config::SlBitmap;
pub(crate) use config::{FLI_SHIFT_VAL, MAX_FLI, MIN_FLI};

/// Requests below this size all share the first free-list row, subdivided
/// linearly by the word size.
pub(crate) const MIN_FLI_ALLOCATION: usize = 1 << MIN_FLI;
pub(crate) const FLI_COUNT: usize = (MAX_FLI - MIN_FLI + 1) as usize;
pub(crate) const SL_COUNT: usize = 1 << FLI_SHIFT_VAL;

// The linear subdivisions of the smallest row are word-sized, so the row
// needs MIN_FLI_ALLOCATION / WORD_SIZE slots; both must fit the bitmap.
const_assert!(MIN_FLI_ALLOCATION / WORD_SIZE <= SL_COUNT);
const_assert!(SL_COUNT <= std::mem::size_of::<SlBitmap>() * 8);
const_assert!(FLI_COUNT <= std::mem::size_of::<usize>() * 8);

const BLOCK_FREE_BIT: usize = 1;
const BLOCK_LAST_BIT: usize = 2;
const FLAGS_MASK: usize = BLOCK_FREE_BIT | BLOCK_LAST_BIT;

/// Header prefixed to every block. Busy blocks only use `size` and
/// `prev_phys`; the free-list links overlay the first payload bytes, which
/// is why the payload starts at [`PAYLOAD_OFFSET`] rather than past the full
/// header.
#[repr(C)]
pub(crate) struct BlockHdr {
    /// Total block size including the header. Sizes are word-aligned, so
    /// the two low bits double as the free and last flags.
    size: usize,
    /// Physically preceding block, null for the first block in the arena.
    prev_phys: *mut BlockHdr,
    next_free: *mut BlockHdr,
    prev_free: *mut BlockHdr,
}

/// Offset from a block header to the payload handed out by `allocate`.
pub(crate) const PAYLOAD_OFFSET: usize = 2 * WORD_SIZE;
/// Smallest representable block: header plus both free-list links.
pub(crate) const MIN_BLOCK_SIZE: usize = std::mem::size_of::<BlockHdr>();

const_assert!(MIN_BLOCK_SIZE == 4 * WORD_SIZE);

impl BlockHdr {
    #[inline]
    fn size(&self) -> usize {
        self.size & !FLAGS_MASK
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size & FLAGS_MASK, 0);
        self.size = size | (self.size & FLAGS_MASK);
    }

    #[inline]
    fn is_free(&self) -> bool {
        self.size & BLOCK_FREE_BIT != 0
    }

    #[inline]
    fn set_free(&mut self) {
        self.size |= BLOCK_FREE_BIT;
    }

    #[inline]
    fn set_busy(&mut self) {
        self.size &= !BLOCK_FREE_BIT;
    }

    #[inline]
    fn is_last(&self) -> bool {
        self.size & BLOCK_LAST_BIT != 0
    }

    #[inline]
    fn set_last(&mut self) {
        self.size |= BLOCK_LAST_BIT;
    }

    #[inline]
    fn set_not_last(&mut self) {
        self.size &= !BLOCK_LAST_BIT;
    }

    #[inline]
    unsafe fn payload(blk: *mut BlockHdr) -> *mut u8 {
        (blk as *mut u8).add(PAYLOAD_OFFSET)
    }

    #[inline]
    unsafe fn from_payload(ptr: *mut u8) -> *mut BlockHdr {
        ptr.sub(PAYLOAD_OFFSET) as *mut BlockHdr
    }

    #[inline]
    unsafe fn next_phys(blk: *mut BlockHdr) -> *mut BlockHdr {
        (blk as *mut u8).add((*blk).size()) as *mut BlockHdr
    }
}

/// Why [`TlsfArena::new`] rejected a region.
///
/// The discriminants mirror the classic C contract: `Misaligned` is −2,
/// `TooSmall` is −3, `TooLarge` is −4. (The −1 "null out-parameter" code has
/// no equivalent here.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The region start is not aligned for the arena state.
    #[error("region is not aligned to {0} bytes")]
    Misaligned(usize),
    /// The region cannot hold the arena state plus one minimum block.
    #[error("region is smaller than minimum_arena_size()")]
    TooSmall,
    /// The region exceeds what the size field can index.
    #[error("region is larger than maximum_arena_size()")]
    TooLarge,
}

/// Smallest region accepted by [`TlsfArena::new`]: the in-region arena state
/// plus one minimum-size block.
pub fn minimum_arena_size() -> usize {
    arena_state_size() + MIN_BLOCK_SIZE
}

/// Largest region accepted by [`TlsfArena::new`]. Bounded by the free-list
/// index range and capped at 4 GiB − 1; larger arenas are out of scope.
pub fn maximum_arena_size() -> usize {
    let index_bound = (1usize << (MAX_FLI.min(usize::BITS - 1))) - 1;
    index_bound.min(u32::MAX as usize)
}

fn arena_state_size() -> usize {
    align(WORD_SIZE, std::mem::size_of::<TlsfArena>())
}

/// A Two-Level Segregated-Fit allocator over a single caller-owned byte
/// region.
///
/// The arena writes all of its state (bitmaps and free-list heads) at the
/// start of the region and never allocates metadata anywhere else. Both
/// `allocate` and `free` run in constant time: free blocks are segregated
/// into size classes indexed by a first level (power of two) and a second
/// level (linear subdivision), and the non-empty classes are tracked in
/// bitmaps so that a fit is found with two bit scans.
///
/// The arena is not thread-safe; wrap it in [`RtAllocMt`] to share it.
///
/// ## Example
///
/// ```
/// use rtmem::{MappedRegion, TlsfArena};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
///
/// let mut arena = unsafe {
///     TlsfArena::new(region.buffer(), region.capacity()).unwrap()
/// };
/// let arena = unsafe { arena.as_mut() };
///
/// let ptr = arena.allocate(100);
/// assert!(!ptr.is_null());
/// arena.free(ptr);
/// ```
///
/// [`RtAllocMt`]: crate::RtAllocMt
#[repr(C)]
pub struct TlsfArena {
    /// Bit i set iff row i has at least one non-empty class.
    fl_bitmap: usize,
    /// Per-row occupancy of the linear subdivisions.
    sl_bitmap: [SlBitmap; FLI_COUNT],
    free_lists: [[*mut BlockHdr; SL_COUNT]; FLI_COUNT],
}

impl TlsfArena {
    /// Builds an arena inside `region`.
    ///
    /// On success the arena state occupies the start of the region and one
    /// free block covers the remainder. The returned pointer aliases the
    /// region; the error cases leave the region untouched.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes and must
    /// outlive every use of the arena and of the payloads it hands out. The
    /// caller releases the region itself (munmap, free, ...) after the arena
    /// is no longer used.
    pub unsafe fn new(region: *mut u8, size: usize) -> Result<NonNull<TlsfArena>, ArenaError> {
        let state_align = std::mem::align_of::<TlsfArena>();
        if region as usize % state_align != 0 {
            return Err(ArenaError::Misaligned(state_align));
        }
        if size < minimum_arena_size() {
            return Err(ArenaError::TooSmall);
        }
        if size > maximum_arena_size() {
            return Err(ArenaError::TooLarge);
        }

        let arena = region as *mut TlsfArena;
        ptr::write_bytes(region, 0, arena_state_size());

        let first = region.add(arena_state_size()) as *mut BlockHdr;
        let block_size = (size - arena_state_size()) & !(WORD_SIZE - 1);

        (*first).size = 0;
        (*first).set_size(block_size);
        (*first).set_free();
        (*first).set_last();
        (*first).prev_phys = ptr::null_mut();
        (*first).next_free = ptr::null_mut();
        (*first).prev_free = ptr::null_mut();

        (*arena).insert_block(first);

        log::debug!(
            "tlsf arena over {} bytes, {} managed after state",
            size,
            block_size
        );

        Ok(NonNull::new_unchecked(arena))
    }

    /// Allocates at least `sz` contiguous bytes, or null when no block can
    /// satisfy the request. The result is word-aligned. Never calls into
    /// the system heap.
    pub fn allocate(&mut self, sz: usize) -> *mut u8 {
        if sz > maximum_arena_size() {
            return ptr::null_mut();
        }

        let mut needed = align(WORD_SIZE, sz) + PAYLOAD_OFFSET;
        if needed < MIN_BLOCK_SIZE {
            needed = MIN_BLOCK_SIZE;
        }
        if needed > maximum_arena_size() {
            return ptr::null_mut();
        }

        let (fli, sli) = Self::mapping_search(needed);
        let (fli, sli) = match self.find_suitable_block(fli, sli) {
            Some(found) => found,
            None => return ptr::null_mut(),
        };

        let blk = self.free_lists[Self::row(fli)][sli as usize];
        debug_assert!(!blk.is_null());

        unsafe {
            self.remove_block(blk);

            if (*blk).size() - needed >= MIN_BLOCK_SIZE {
                let tail = Self::split_block(blk, needed);
                (*tail).set_free();
                self.insert_block(tail);
            }

            (*blk).set_busy();
            BlockHdr::payload(blk)
        }
    }

    /// Returns a payload obtained from [`allocate`] to the arena, eagerly
    /// coalescing with both physical neighbours. Null is tolerated; a
    /// foreign or already-freed pointer is undefined behavior.
    ///
    /// [`allocate`]: TlsfArena::allocate
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        unsafe {
            let mut blk = BlockHdr::from_payload(ptr);
            debug_assert!(!(*blk).is_free(), "double free");
            (*blk).set_free();

            blk = self.merge_prev(blk);
            blk = self.merge_next(blk);

            (*blk).next_free = ptr::null_mut();
            (*blk).prev_free = ptr::null_mut();
            self.insert_block(blk);
        }
    }

    #[inline]
    fn row(fli: u32) -> usize {
        debug_assert!(fli >= MIN_FLI - 1);
        (fli - (MIN_FLI - 1)) as usize
    }

    #[cfg(target_pointer_width = "64")]
    #[inline]
    fn fls_word(word: usize) -> u32 {
        crate::bits::fls64(word as u64)
    }

    #[cfg(target_pointer_width = "32")]
    #[inline]
    fn fls_word(word: usize) -> u32 {
        crate::bits::fls32(word as u32)
    }

    /// Maps a block size to the class it belongs to.
    fn mapping_insert(size: usize) -> (u32, u32) {
        if size < MIN_FLI_ALLOCATION {
            return (MIN_FLI - 1, (size / WORD_SIZE) as u32);
        }
        let fli = Self::fls_word(size);
        let sli = (size >> (fli - FLI_SHIFT_VAL)) & (SL_COUNT - 1);
        (fli, sli as u32)
    }

    /// Maps a request size to a class guaranteed to only contain blocks
    /// large enough: the size is rounded up to the next subdivision before
    /// indexing, so a head block from the class always fits.
    fn mapping_search(mut size: usize) -> (u32, u32) {
        if size >= MIN_FLI_ALLOCATION {
            let fli = Self::fls_word(size);
            size += (1usize << (fli - FLI_SHIFT_VAL)) - 1;
        }
        Self::mapping_insert(size)
    }

    /// Finds the first non-empty class at or above `(fli, sli)`.
    fn find_suitable_block(&self, fli: u32, sli: u32) -> Option<(u32, u32)> {
        let row = Self::row(fli);
        if row >= FLI_COUNT {
            return None;
        }

        let masked = self.sl_bitmap[row] & (SlBitmap::MAX << sli);
        if masked != 0 {
            return Some((fli, masked.trailing_zeros()));
        }

        // Nothing left in this power of two, take the smallest class of the
        // next non-empty row.
        let fl_masked = self.fl_bitmap & (usize::MAX << (row as u32 + 1));
        if fl_masked == 0 {
            return None;
        }
        let row = fl_masked.trailing_zeros() as usize;
        let sl = self.sl_bitmap[row];
        debug_assert!(sl != 0);
        Some((row as u32 + (MIN_FLI - 1), sl.trailing_zeros()))
    }

    /// Pushes a free block at the head of its class and marks the class
    /// occupied in both bitmaps.
    unsafe fn insert_block(&mut self, blk: *mut BlockHdr) {
        let (fli, sli) = Self::mapping_insert((*blk).size());
        let (row, col) = (Self::row(fli), sli as usize);

        let head = self.free_lists[row][col];
        (*blk).prev_free = ptr::null_mut();
        (*blk).next_free = head;
        if !head.is_null() {
            (*head).prev_free = blk;
        }
        self.free_lists[row][col] = blk;

        self.sl_bitmap[row] |= (1 as SlBitmap) << col;
        self.fl_bitmap |= 1usize << row;
    }

    /// Unlinks a block from the class matching its current size, clearing
    /// the bitmap bits when the class empties.
    unsafe fn remove_block(&mut self, blk: *mut BlockHdr) {
        let (fli, sli) = Self::mapping_insert((*blk).size());
        let (row, col) = (Self::row(fli), sli as usize);

        let prev = (*blk).prev_free;
        let next = (*blk).next_free;

        if !next.is_null() {
            (*next).prev_free = prev;
        }
        if !prev.is_null() {
            (*prev).next_free = next;
        } else if self.free_lists[row][col] == blk {
            self.free_lists[row][col] = next;
            if next.is_null() {
                self.sl_bitmap[row] &= !((1 as SlBitmap) << col);
                if self.sl_bitmap[row] == 0 {
                    self.fl_bitmap &= !(1usize << row);
                }
            }
        }

        (*blk).next_free = ptr::null_mut();
        (*blk).prev_free = ptr::null_mut();
    }

    /// Shrinks `blk` to `new_size` and returns the remainder as a fresh
    /// block. The last flag moves to the tail; the physical successor (if
    /// any) is rewired to it.
    unsafe fn split_block(blk: *mut BlockHdr, new_size: usize) -> *mut BlockHdr {
        debug_assert_eq!(new_size % WORD_SIZE, 0);
        debug_assert!((*blk).size() > new_size);

        let tail = (blk as *mut u8).add(new_size) as *mut BlockHdr;
        (*tail).size = 0;
        (*tail).set_size((*blk).size() - new_size);
        (*tail).prev_phys = blk;
        (*tail).next_free = ptr::null_mut();
        (*tail).prev_free = ptr::null_mut();

        if (*blk).is_last() {
            (*tail).set_last();
            (*blk).set_not_last();
        } else {
            (*BlockHdr::next_phys(tail)).prev_phys = tail;
        }

        (*blk).set_size(new_size);

        tail
    }

    /// Coalesces `blk` with its physical predecessor when that one is free.
    /// Returns the surviving block.
    unsafe fn merge_prev(&mut self, blk: *mut BlockHdr) -> *mut BlockHdr {
        let prev = (*blk).prev_phys;
        if prev.is_null() || !(*prev).is_free() {
            return blk;
        }

        self.remove_block(prev);
        (*prev).set_size((*prev).size() + (*blk).size());
        if (*blk).is_last() {
            (*prev).set_last();
        } else {
            (*BlockHdr::next_phys(prev)).prev_phys = prev;
        }

        prev
    }

    /// Coalesces `blk` with its physical successor when that one is free.
    unsafe fn merge_next(&mut self, blk: *mut BlockHdr) -> *mut BlockHdr {
        if (*blk).is_last() {
            return blk;
        }

        let next = BlockHdr::next_phys(blk);
        if !(*next).is_free() {
            return blk;
        }

        self.remove_block(next);
        (*blk).set_size((*blk).size() + (*next).size());
        if (*next).is_last() {
            (*blk).set_last();
        } else {
            (*BlockHdr::next_phys(blk)).prev_phys = blk;
        }

        blk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A usize buffer is aligned for the arena state on every supported
    // target width except when the second-level bitmap forces a wider
    // alignment, so over-align explicitly.
    fn make_region(bytes: usize) -> Vec<SlBitmap> {
        vec![0 as SlBitmap; bytes / std::mem::size_of::<SlBitmap>() + 1]
    }

    unsafe fn arena_in<'r>(region: &mut Vec<SlBitmap>, bytes: usize) -> &'r mut TlsfArena {
        let ptr = region.as_mut_ptr() as *mut u8;
        TlsfArena::new(ptr, bytes).unwrap().as_mut()
    }

    /// Walks the physical block chain, checking what the arena maintains
    /// between operations: contiguity of prev pointers, a single trailing
    /// last flag, no two adjacent free blocks, and conservation of the
    /// managed length.
    unsafe fn check_block_chain(arena: *mut TlsfArena, managed: usize) {
        let mut blk = (arena as *mut u8).add(arena_state_size()) as *mut BlockHdr;
        let mut prev: *mut BlockHdr = std::ptr::null_mut();
        let mut total = 0usize;
        let mut prev_was_free = false;

        loop {
            assert_eq!((*blk).prev_phys, prev);
            assert!((*blk).size() >= MIN_BLOCK_SIZE);
            assert_eq!((*blk).size() % WORD_SIZE, 0);
            if prev_was_free {
                assert!(!(*blk).is_free(), "adjacent free blocks");
            }
            prev_was_free = (*blk).is_free();
            total += (*blk).size();

            if (*blk).is_last() {
                break;
            }
            prev = blk;
            blk = BlockHdr::next_phys(blk);
        }

        assert_eq!(total, managed);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn constants_for_word_size() {
        assert_eq!(WORD_SIZE, 8);
        assert_eq!(MIN_FLI, 8);
        assert_eq!(MIN_FLI_ALLOCATION, 256);
        assert_eq!(MAX_FLI, 62);
        assert_eq!(FLI_COUNT, 55);
        assert_eq!(FLI_SHIFT_VAL, 7);
        assert_eq!(SL_COUNT, 128);
    }

    #[test]
    fn block_header_flags() {
        let mut hdr = BlockHdr {
            size: 0,
            prev_phys: std::ptr::null_mut(),
            next_free: std::ptr::null_mut(),
            prev_free: std::ptr::null_mut(),
        };

        hdr.set_size(136);
        hdr.set_free();
        hdr.set_busy();
        hdr.set_free();
        hdr.set_last();

        assert_eq!(hdr.size(), 136);
        hdr.set_size(48);
        assert_eq!(hdr.size(), 48);

        assert!(hdr.is_free());
        assert!(hdr.is_last());

        hdr.set_busy();
        hdr.set_not_last();

        assert!(!hdr.is_free());
        assert!(!hdr.is_last());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn mapping_boundaries() {
        assert_eq!(TlsfArena::mapping_insert(2056), (11, 0));
        assert_eq!(TlsfArena::mapping_search(2056), (11, 1));
        assert_eq!(TlsfArena::mapping_insert(8), (MIN_FLI - 1, 1));
        assert_eq!(
            TlsfArena::mapping_insert(MIN_FLI_ALLOCATION - WORD_SIZE),
            (MIN_FLI - 1, (MIN_FLI_ALLOCATION / WORD_SIZE - 1) as u32)
        );
        assert_eq!(TlsfArena::mapping_insert(MIN_FLI_ALLOCATION), (MIN_FLI, 0));
    }

    #[test]
    fn arena_construction_errors() {
        let mut region = make_region(16 * 1024);
        let ptr = region.as_mut_ptr() as *mut u8;

        unsafe {
            assert_eq!(
                TlsfArena::new(ptr.add(1), 16 * 1024).unwrap_err(),
                ArenaError::Misaligned(std::mem::align_of::<TlsfArena>())
            );
            assert_eq!(
                TlsfArena::new(ptr, minimum_arena_size() - 1).unwrap_err(),
                ArenaError::TooSmall
            );
            assert_eq!(
                TlsfArena::new(ptr, maximum_arena_size() + 1).unwrap_err(),
                ArenaError::TooLarge
            );
        }
    }

    #[test]
    fn split_and_merge() {
        const REGION: usize = 256 * 1024;
        let mut scratch = make_region(REGION);
        let mut buf = [0 as SlBitmap; 64];

        unsafe {
            let arena = arena_in(&mut scratch, REGION);

            let blk = buf.as_mut_ptr() as *mut BlockHdr;
            (*blk).size = 0;
            (*blk).set_size(200);
            (*blk).prev_phys = std::ptr::null_mut();
            (*blk).next_free = std::ptr::null_mut();
            (*blk).prev_free = std::ptr::null_mut();
            (*blk).set_free();
            (*blk).set_last();

            let next = TlsfArena::split_block(blk, 136);
            (*next).set_free();

            assert_eq!((*next).prev_phys, blk);
            assert_eq!((*blk).size(), 136);
            assert_eq!((*next).size(), 64);
            assert!((*next).is_last());
            assert!(!(*blk).is_last());

            let next_next = TlsfArena::split_block(next, 16);
            (*next_next).set_free();

            assert_eq!((*next).size(), 16);
            assert_eq!((*next_next).size(), 48);
            assert!((*next_next).is_last());
            assert!(!(*next).is_last());
            assert!(!(*blk).is_last());

            assert_eq!((*next_next).prev_phys, next);
            assert_eq!(BlockHdr::next_phys(blk), next);
            assert_eq!(BlockHdr::next_phys(next), next_next);

            let merged = arena.merge_prev(next);
            assert_eq!(merged, blk);
            assert_eq!((*merged).size(), 152);
            assert!(!(*merged).is_last());
            assert!((*next_next).is_last());
            assert_eq!(BlockHdr::next_phys(merged), next_next);
            assert_eq!((*next_next).prev_phys, merged);

            // No free neighbour on either end, both are no-ops
            assert_eq!(arena.merge_prev(merged), merged);
            assert_eq!(arena.merge_next(next_next), next_next);

            let merged = arena.merge_next(merged);
            assert_eq!(merged, blk);
            assert_eq!((*merged).size(), 200);
            assert!((*merged).is_last());
            assert!(!(*next_next).is_last());
        }
    }

    #[test]
    fn arena_smoke() {
        const REGION: usize = 256 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);
            let initial_fl = arena.fl_bitmap;
            let managed = (REGION - arena_state_size()) & !(WORD_SIZE - 1);

            let a = arena.allocate(std::mem::size_of::<u32>());
            let b = arena.allocate(std::mem::size_of::<u32>());
            let c = arena.allocate(std::mem::size_of::<u32>());
            let d = arena.allocate(81);
            assert!(!a.is_null() && !b.is_null() && !c.is_null() && !d.is_null());

            (a as *mut u32).write(0x6666_6666);
            (b as *mut u32).write(0x7777_7777);
            (c as *mut u32).write(0x8888_8888);
            for i in 0..81 {
                d.add(i).write(0x44);
            }

            let blk_a = BlockHdr::from_payload(a);
            let blk_b = BlockHdr::from_payload(b);
            let blk_c = BlockHdr::from_payload(c);
            let blk_d = BlockHdr::from_payload(d);

            assert!((*blk_a).prev_phys.is_null());
            assert_eq!((*blk_b).prev_phys, blk_a);
            assert_eq!((*blk_d).prev_phys, blk_c);
            assert!(!(*blk_d).is_free());
            assert!(!(*blk_d).is_last());

            // The remainder of the arena sits right after the last
            // allocation, free and flagged last.
            let rest = BlockHdr::next_phys(blk_d);
            assert!((*rest).is_free());
            assert!((*rest).is_last());
            assert_eq!((*rest).prev_phys, blk_d);

            assert_eq!((a as *mut u32).read(), 0x6666_6666);
            assert_eq!((b as *mut u32).read(), 0x7777_7777);

            check_block_chain(arena, managed);

            arena.free(c);
            assert_eq!((*blk_d).prev_phys, blk_c);
            check_block_chain(arena, managed);

            arena.free(b);
            assert_eq!((*blk_d).prev_phys, blk_b);
            check_block_chain(arena, managed);

            arena.free(a);
            assert_eq!((*blk_d).prev_phys, blk_a);
            check_block_chain(arena, managed);

            arena.free(d);
            check_block_chain(arena, managed);

            // Everything freed and coalesced: back to the initial shape
            assert_eq!(arena.fl_bitmap, initial_fl);
            let first = (arena as *mut TlsfArena as *mut u8).add(arena_state_size())
                as *mut BlockHdr;
            assert_eq!((*first).size(), managed);
            assert!((*first).is_free());
            assert!((*first).is_last());
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        const REGION: usize = 128 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);

            assert!(arena.allocate(REGION).is_null());

            let mut live = Vec::new();
            loop {
                let ptr = arena.allocate(1024);
                if ptr.is_null() {
                    break;
                }
                live.push(ptr);
            }
            assert!(!live.is_empty());
            assert!(arena.allocate(1024).is_null());

            for ptr in live {
                arena.free(ptr);
            }

            // After returning everything a big request fits again
            assert!(!arena.allocate(REGION / 2).is_null());
        }
    }

    #[test]
    fn free_null_is_noop() {
        const REGION: usize = 128 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);
            arena.free(std::ptr::null_mut());
        }
    }

    #[test]
    fn payloads_do_not_overlap() {
        const REGION: usize = 256 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);

            let mut ptrs = Vec::new();
            for i in 0..64usize {
                let sz = 16 + (i * 7) % 200;
                let ptr = arena.allocate(sz);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % WORD_SIZE, 0);
                ptrs.push((ptr, sz, (i & 0xFF) as u8));
                ptr.write_bytes((i & 0xFF) as u8, sz);
            }

            // Free every other one, patterns in the survivors must hold
            for (idx, (ptr, _, _)) in ptrs.iter().enumerate() {
                if idx % 2 == 0 {
                    arena.free(*ptr);
                }
            }
            for (idx, (ptr, sz, pattern)) in ptrs.iter().enumerate() {
                if idx % 2 == 1 {
                    for off in 0..*sz {
                        assert_eq!(ptr.add(off).read(), *pattern);
                    }
                    arena.free(*ptr);
                }
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn arbitrary_op_sequences_hold_the_invariants(ops: Vec<(bool, u16)>) {
        const REGION: usize = 192 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);
            let managed = (REGION - arena_state_size()) & !(WORD_SIZE - 1);
            let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

            for (do_alloc, raw) in ops {
                if do_alloc || live.is_empty() {
                    let sz = usize::from(raw) % 4096 + 1;
                    let ptr = arena.allocate(sz);
                    if !ptr.is_null() {
                        let pattern = (raw & 0xFF) as u8;
                        ptr.write_bytes(pattern, sz);
                        live.push((ptr, sz, pattern));
                    }
                } else {
                    let (ptr, sz, pattern) = live.swap_remove(usize::from(raw) % live.len());
                    for off in 0..sz {
                        assert_eq!(ptr.add(off).read(), pattern);
                    }
                    arena.free(ptr);
                }
                check_block_chain(arena, managed);
            }

            for (ptr, _, _) in live {
                arena.free(ptr);
            }
            check_block_chain(arena, managed);
        }
    }

    #[test]
    fn random_alloc_free_conserves_arena() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const REGION: usize = 512 * 1024;
        let mut region = make_region(REGION);

        unsafe {
            let arena = arena_in(&mut region, REGION);
            let managed = (REGION - arena_state_size()) & !(WORD_SIZE - 1);

            let mut rng = StdRng::seed_from_u64(0x7713);
            let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

            for round in 0..2_000 {
                if live.is_empty() || rng.gen_bool(0.6) {
                    let sz = rng.gen_range(1..2048);
                    let ptr = arena.allocate(sz);
                    if !ptr.is_null() {
                        let pattern = (round & 0xFF) as u8;
                        ptr.write_bytes(pattern, sz);
                        live.push((ptr, sz, pattern));
                    }
                } else {
                    let idx = rng.gen_range(0..live.len());
                    let (ptr, sz, pattern) = live.swap_remove(idx);
                    for off in 0..sz {
                        assert_eq!(ptr.add(off).read(), pattern);
                    }
                    arena.free(ptr);
                }

                if round % 64 == 0 {
                    check_block_chain(arena, managed);
                }
            }

            for (ptr, sz, pattern) in live {
                for off in 0..sz {
                    assert_eq!(ptr.add(off).read(), pattern);
                }
                arena.free(ptr);
            }
            check_block_chain(arena, managed);
        }
    }
}
