use std::ptr;

/// A contiguous byte region acquired through an anonymous private mapping.
///
/// The usual way to feed an arena on a hosted target: map once at startup,
/// hand [`buffer`]/[`capacity`] to the allocator, unmap at shutdown. The
/// region itself never reallocates.
///
/// ## Example
///
/// ```
/// use rtmem::MappedRegion;
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(64 * 1024));
/// assert_eq!(region.capacity(), 64 * 1024);
/// region.uninit();
/// ```
///
/// [`buffer`]: MappedRegion::buffer
/// [`capacity`]: MappedRegion::capacity
pub struct MappedRegion {
    initialized: bool,
    buf: *mut u8,
    capacity: usize,
}

unsafe impl Send for MappedRegion {}

impl MappedRegion {
    pub fn new() -> MappedRegion {
        MappedRegion {
            initialized: false,
            buf: ptr::null_mut(),
            capacity: 0,
        }
    }

    /// Maps `capacity` bytes. Returns false if the mapping fails or the
    /// capacity is zero; calling it on an initialized region is a no-op
    /// returning true.
    pub fn init(&mut self, capacity: usize) -> bool {
        if self.initialized {
            return true;
        }
        if capacity == 0 {
            return false;
        }

        let buf = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if buf == libc::MAP_FAILED {
            log::warn!("mmap of {} bytes failed", capacity);
            return false;
        }

        self.buf = buf as *mut u8;
        self.capacity = capacity;
        self.initialized = true;

        true
    }

    /// Unmaps the region. Pointers into the region are dangling afterwards.
    pub fn uninit(&mut self) {
        if !self.initialized {
            return;
        }

        unsafe {
            libc::munmap(self.buf as *mut libc::c_void, self.capacity);
        }

        self.buf = ptr::null_mut();
        self.capacity = 0;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn buffer(&self) -> *mut u8 {
        self.buf
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MappedRegion {
    fn default() -> MappedRegion {
        MappedRegion::new()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_uninit_cycle() {
        let mut region = MappedRegion::new();
        assert!(!region.is_initialized());
        assert_eq!(region.capacity(), 0);

        assert!(region.init(4096));
        assert!(region.is_initialized());
        assert!(!region.buffer().is_null());
        assert_eq!(region.capacity(), 4096);

        // Second init is a no-op
        assert!(region.init(8192));
        assert_eq!(region.capacity(), 4096);

        region.uninit();
        assert!(!region.is_initialized());
        assert!(region.buffer().is_null());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut region = MappedRegion::new();
        assert!(!region.init(0));
        assert!(!region.is_initialized());
    }

    #[test]
    fn mapped_bytes_are_writable() {
        let mut region = MappedRegion::new();
        assert!(region.init(4096));

        unsafe {
            for i in 0..4096 {
                *region.buffer().add(i) = (i & 0xFF) as u8;
            }
            for i in 0..4096 {
                assert_eq!(*region.buffer().add(i), (i & 0xFF) as u8);
            }
        }
    }
}
