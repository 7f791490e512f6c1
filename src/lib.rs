//! Allocator-aware primitives for code that cannot afford a trip to the
//! general-purpose heap on its hot path: a constant-time TLSF arena over a
//! caller-supplied region, containers that take every byte from a
//! [`BlockAlloc`] capability, a lock-free SPSC byte ring, and counted
//! pointers whose control blocks live in arena memory too.
//!
//! The usual composition: map a region once, build an arena over it, and
//! hand the facade to everything else.
//!
//! ```
//! use rtmem::{MappedRegion, RtAllocMt, RtHashMap};
//!
//! let mut region = MappedRegion::new();
//! assert!(region.init(4 * 1024 * 1024));
//!
//! let alloc = RtAllocMt::new();
//! assert!(alloc.init(region.buffer(), region.capacity()));
//!
//! let mut positions: RtHashMap<u32, (f64, f64), _> = RtHashMap::new(&alloc);
//! assert!(positions.put(7, (1.0, -1.0)));
//! ```

mod alloc;
mod bits;
mod hash;
mod lru;
mod map;
mod pool;
mod primes;
mod region;
mod ring;
mod shared;
mod sync;
mod tlsf;
mod vector;

pub use {
    alloc::{BlockAlloc, RtAlloc, RtAllocMt, RtAllocSt},
    bits::{align, ffs32, ffs64, fls32, fls64},
    hash::{fnv1a, Hash32, FNV1A_32_OFFSET, FNV1A_32_PRIME},
    lru::LruCache,
    map::{MapState, RtHashMap},
    pool::{ObjectPool, PoolGuard},
    primes::prime_above_power_of_two,
    region::MappedRegion,
    ring::{CompoundRegion, ContigRegion, SpscRing},
    shared::{RtBox, Shared, Weak},
    sync::{
        Lock, LockGuard, NullLock, OsLock, Slumber, SlumberProgressive, SlumberSleep,
        SlumberYield, SpinLock,
    },
    tlsf::{maximum_arena_size, minimum_arena_size, ArenaError, TlsfArena},
    vector::RtVec,
};
