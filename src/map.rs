use std::ptr;

use crate::alloc::BlockAlloc;
use crate::hash::Hash32;
use crate::primes::prime_above_power_of_two;
use crate::tlsf::WORD_SIZE;
use crate::vector::RtVec;

/// How many entries a single operation may move from the old table to the
/// new one while a resize is in flight.
const TRANSFER_BUDGET: usize = 512;

/// Bucket-count exponents are clamped to this range; the lower bound keeps
/// fresh maps at 17 buckets, the upper bound is the end of the prime table.
const MIN_POW2: u32 = 4;
const MAX_POW2: u32 = 31;

/// Where the map currently keeps its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// An allocation failed while reshaping the map; every subsequent
    /// operation fails without touching the remains.
    Error,
    /// All keys live in the main table.
    Stable,
    /// A resize is in flight: keys are spread over the main table and its
    /// larger successor, and every operation moves a few more across.
    Transfer,
}

/// One key with a pointer to its heap-constructed value. Values live behind
/// a pointer so a table transfer moves words, never values, and value
/// addresses observed by callers survive the resize.
struct Entry<K, V> {
    key: K,
    val: *mut V,
}

impl<K, V> Entry<K, V> {
    fn new(key: K) -> Entry<K, V> {
        Entry {
            key,
            val: ptr::null_mut(),
        }
    }

    /// Stores `value`, reusing the existing allocation when there is one.
    /// False when a fresh allocation is needed and the allocator refuses;
    /// the entry is left unchanged in that case.
    fn construct<A: BlockAlloc>(&mut self, alloc: &A, value: V) -> bool {
        debug_assert!(std::mem::align_of::<V>() <= WORD_SIZE);

        if !self.val.is_null() {
            unsafe {
                *self.val = value;
            }
            return true;
        }

        let raw = match alloc.allocate(std::mem::size_of::<V>()) {
            Some(ptr) => ptr.as_ptr() as *mut V,
            None => return false,
        };
        unsafe {
            raw.write(value);
        }
        self.val = raw;
        true
    }

    fn deconstruct<A: BlockAlloc>(&mut self, alloc: &A) {
        if self.val.is_null() {
            return;
        }
        unsafe {
            ptr::drop_in_place(self.val);
            alloc.deallocate(std::ptr::NonNull::new_unchecked(self.val as *mut u8));
        }
        self.val = ptr::null_mut();
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        debug_assert!(self.val.is_null(), "entry dropped with live value");
    }
}

struct Bucket<'a, K, V, A: BlockAlloc> {
    entries: RtVec<'a, Entry<K, V>, A>,
}

impl<'a, K: Eq, V, A: BlockAlloc> Bucket<'a, K, V, A> {
    fn new(alloc: &'a A) -> Bucket<'a, K, V, A> {
        Bucket {
            entries: RtVec::new(alloc),
        }
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == *key)
    }

    fn value_ptr(&self, key: &K) -> *mut V {
        match self.entries.iter().find(|entry| entry.key == *key) {
            Some(entry) => entry.val,
            None => ptr::null_mut(),
        }
    }

    /// Makes room for one more entry up front, so a following push cannot
    /// fail and drop its argument.
    fn ensure_capacity_for_push(&mut self) -> bool {
        if self.entries.len() < self.entries.capacity() {
            return true;
        }
        let wanted = (2 * self.entries.capacity()).max(1);
        self.entries.reserve(wanted)
    }

    fn remove<AA: BlockAlloc>(&mut self, key: &K, alloc: &AA) -> bool {
        match self.find_index(key) {
            Some(index) => {
                self.entries[index].deconstruct(alloc);
                self.entries.remove_fast(index);
                true
            }
            None => false,
        }
    }

    fn deconstruct_all<AA: BlockAlloc>(&mut self, alloc: &AA) {
        for entry in self.entries.as_mut_slice() {
            entry.deconstruct(alloc);
        }
    }

    fn delete_all<AA: BlockAlloc>(&mut self, alloc: &AA) {
        self.deconstruct_all(alloc);
        self.entries.clear();
    }
}

struct Table<'a, K, V, A: BlockAlloc> {
    buckets: RtVec<'a, Bucket<'a, K, V, A>, A>,
    total_entries: usize,
    num_buckets: usize,
    pow2: u32,
}

impl<'a, K: Hash32 + Eq, V, A: BlockAlloc> Table<'a, K, V, A> {
    /// Builds a table with `prime_above_power_of_two(pow2)` buckets. On
    /// allocator exhaustion the bucket count comes up short; callers decide
    /// whether a short table is acceptable.
    fn new(alloc: &'a A, pow2: u32) -> Table<'a, K, V, A> {
        let pow2 = pow2.clamp(MIN_POW2, MAX_POW2);
        let wanted = prime_above_power_of_two(pow2) as usize;

        let mut buckets = RtVec::new(alloc);
        let _ = buckets.reserve(wanted);
        let mut achieved = 0;
        for _ in 0..wanted {
            if !buckets.push(Bucket::new(alloc)) {
                break;
            }
            achieved += 1;
        }

        Table {
            buckets,
            total_entries: 0,
            num_buckets: achieved,
            pow2,
        }
    }

    fn bucket_index(&self, key: &K) -> usize {
        debug_assert!(self.num_buckets > 0);
        (key.hash32() % self.num_buckets as u32) as usize
    }

    fn value_ptr(&self, key: &K) -> *mut V {
        if self.num_buckets == 0 {
            return ptr::null_mut();
        }
        self.buckets[self.bucket_index(key)].value_ptr(key)
    }

    fn remove<AA: BlockAlloc>(&mut self, key: &K, alloc: &AA) -> bool {
        if self.num_buckets == 0 {
            return false;
        }
        let index = self.bucket_index(key);
        let removed = self.buckets[index].remove(key, alloc);
        if removed {
            self.total_entries -= 1;
        }
        removed
    }

    fn delete_all<AA: BlockAlloc>(&mut self, alloc: &AA) {
        for bucket in self.buckets.as_mut_slice() {
            bucket.delete_all(alloc);
        }
        self.total_entries = 0;
    }

    fn deconstruct_all<AA: BlockAlloc>(&mut self, alloc: &AA) {
        for bucket in self.buckets.as_mut_slice() {
            bucket.deconstruct_all(alloc);
            bucket.entries.clear();
        }
    }
}

/// A chained hash table with amortized incremental resizing.
///
/// When the load factor threshold is crossed, the map does not rehash in
/// one O(N) burst. Instead it allocates a roughly twice-as-large shadow
/// table and every subsequent operation carries a bounded batch of entries
/// across, so each individual call stays bounded. Lookups consult both
/// tables while the transfer is in flight.
///
/// Values are constructed through the caller's allocator and addressed by
/// pointer, so a transfer moves pointers only and the address of a value
/// never changes for the lifetime of its key.
///
/// The map is single-writer; it has no interior synchronization.
///
/// ## Example
///
/// ```
/// use rtmem::{MappedRegion, RtAllocMt, RtHashMap};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(1024 * 1024));
/// let alloc = RtAllocMt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let mut map: RtHashMap<u32, u32, _> = RtHashMap::new(&alloc);
/// assert!(map.put(1, 100));
/// assert_eq!(map.get(&1).copied(), Some(100));
/// assert!(map.del(&1));
/// assert_eq!(map.get(&1), None);
/// ```
pub struct RtHashMap<'a, K, V, A: BlockAlloc> {
    alloc: &'a A,
    main: Option<Table<'a, K, V, A>>,
    secondary: Option<Table<'a, K, V, A>>,
    state: MapState,
    max_load_factor_percent: usize,
    cursor: usize,
    locked: bool,
}

impl<'a, K: Hash32 + Eq, V, A: BlockAlloc> RtHashMap<'a, K, V, A> {
    /// A map with the default maximum load factor of 5.0. Chaining makes
    /// load factors above one reasonable.
    pub fn new(alloc: &'a A) -> RtHashMap<'a, K, V, A> {
        Self::with_load_factor(alloc, 5.0)
    }

    /// `max_load_factor` is kept with percent precision; fractional values
    /// like 0.05 are honored.
    pub fn with_load_factor(alloc: &'a A, max_load_factor: f32) -> RtHashMap<'a, K, V, A> {
        let main = Table::new(alloc, MIN_POW2);
        RtHashMap {
            alloc,
            main: Some(main),
            secondary: None,
            state: MapState::Stable,
            max_load_factor_percent: (max_load_factor * 100.0) as usize,
            cursor: 0,
            locked: false,
        }
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    /// Total number of keys across both tables.
    pub fn len(&self) -> usize {
        self.main.as_ref().map_or(0, |t| t.total_entries)
            + self.secondary.as_ref().map_or(0, |t| t.total_entries)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket count of the table new keys currently land in.
    pub fn num_buckets(&self) -> usize {
        match self.state {
            MapState::Error => 0,
            MapState::Stable => self.main.as_ref().map_or(0, |t| t.num_buckets),
            MapState::Transfer => self.secondary.as_ref().map_or(0, |t| t.num_buckets),
        }
    }

    /// Stops the load-factor check from ever starting a resize. Used by
    /// callers that pre-size the table and bound the entry count themselves.
    pub fn lock_table_size(&mut self) {
        self.locked = true;
    }

    pub fn unlock_table_size(&mut self) {
        self.locked = false;
    }

    /// Buckets needed to hold `expected_item_count` entries at the current
    /// maximum load factor.
    pub fn approx_buckets_needed(&self, expected_item_count: u32) -> u32 {
        let percent = (self.max_load_factor_percent as u64).max(1);
        ((u64::from(expected_item_count) * 100 / percent) + 1) as u32
    }

    /// True if `key` is present. Never advances a resize, so it is the one
    /// read that leaves the map untouched.
    pub fn contains(&self, key: &K) -> bool {
        match self.state {
            MapState::Error => false,
            MapState::Stable => !self.main.as_ref().unwrap().value_ptr(key).is_null(),
            MapState::Transfer => {
                !self.secondary.as_ref().unwrap().value_ptr(key).is_null()
                    || !self.main.as_ref().unwrap().value_ptr(key).is_null()
            }
        }
    }

    /// Looks up `key`. Drives the resize machinery: a lookup may start a
    /// resize or move a batch of entries between tables.
    pub fn get(&mut self, key: &K) -> Option<&mut V> {
        match self.state {
            MapState::Error => None,
            MapState::Stable => {
                let found = self.main.as_ref().unwrap().value_ptr(key);

                if self.should_resize() {
                    let next = self.main.as_ref().unwrap().pow2 + 1;
                    if !self.begin_resize(next) {
                        self.state = MapState::Error;
                        return None;
                    }
                }

                unsafe { found.as_mut() }
            }
            MapState::Transfer => {
                let mut found = self.secondary.as_ref().unwrap().value_ptr(key);
                if found.is_null() {
                    found = self.main.as_ref().unwrap().value_ptr(key);
                }

                if !self.perform_partial_transfer() {
                    self.state = MapState::Error;
                    return None;
                }
                if self.is_transfer_complete() {
                    self.end_resize();
                }

                unsafe { found.as_mut() }
            }
        }
    }

    /// Inserts or overwrites. Overwrites reuse the existing value
    /// allocation, so addresses handed out by earlier lookups stay valid.
    pub fn put(&mut self, key: K, value: V) -> bool {
        match self.state {
            MapState::Error => false,
            MapState::Stable => {
                let stored = self.put_stable(key, value);

                if self.should_resize() {
                    let next = self.main.as_ref().unwrap().pow2 + 1;
                    if !self.begin_resize(next) {
                        self.state = MapState::Error;
                        return false;
                    }
                }

                stored
            }
            MapState::Transfer => {
                let stored = self.put_transfer(key, value);

                if !self.perform_partial_transfer() {
                    self.state = MapState::Error;
                    return false;
                }
                if self.is_transfer_complete() {
                    self.end_resize();
                }

                stored
            }
        }
    }

    /// Removes `key` and destroys its value. False when the key is absent.
    pub fn del(&mut self, key: &K) -> bool {
        match self.state {
            MapState::Error => false,
            MapState::Stable => {
                let removed = self.main.as_mut().unwrap().remove(key, self.alloc);

                if self.should_resize() {
                    let next = self.main.as_ref().unwrap().pow2 + 1;
                    if !self.begin_resize(next) {
                        self.state = MapState::Error;
                        return false;
                    }
                }

                removed
            }
            MapState::Transfer => {
                let mut removed = self.main.as_mut().unwrap().remove(key, self.alloc);
                if !removed {
                    removed = self.secondary.as_mut().unwrap().remove(key, self.alloc);
                }

                if !self.perform_partial_transfer() {
                    self.state = MapState::Error;
                    return false;
                }
                if self.is_transfer_complete() {
                    self.end_resize();
                }

                removed
            }
        }
    }

    /// Drops every key from both tables and settles back to STABLE.
    pub fn clear(&mut self) {
        match self.state {
            MapState::Error => {}
            MapState::Stable => {
                self.main.as_mut().unwrap().delete_all(self.alloc);
            }
            MapState::Transfer => {
                self.main.as_mut().unwrap().delete_all(self.alloc);
                self.secondary.as_mut().unwrap().delete_all(self.alloc);
                let _ = self.finalize();
            }
        }
    }

    /// Runs any in-flight transfer to completion. Not amortized.
    pub fn finalize(&mut self) -> bool {
        match self.state {
            MapState::Error => false,
            MapState::Stable => true,
            MapState::Transfer => {
                while !self.is_transfer_complete() {
                    if !self.perform_partial_transfer() {
                        return false;
                    }
                }
                self.end_resize();
                true
            }
        }
    }

    /// Resizes to at least `number_of_buckets` buckets in one go (not
    /// amortized). Never shrinks. False on zero, on counts beyond the prime
    /// table, or on allocation failure.
    pub fn reserve(&mut self, number_of_buckets: u32) -> bool {
        if self.state == MapState::Error {
            return false;
        }
        if number_of_buckets == 0 {
            return false;
        }

        let mut wanted_pow2 = None;
        for i in 0..32 {
            if prime_above_power_of_two(i) >= number_of_buckets {
                wanted_pow2 = Some(i);
                break;
            }
        }
        let wanted_pow2 = match wanted_pow2 {
            Some(pow2) => pow2,
            None => return false,
        };

        if self.state == MapState::Transfer {
            while !self.is_transfer_complete() {
                if !self.perform_partial_transfer() {
                    return false;
                }
            }
            self.end_resize();
        }

        if wanted_pow2 <= self.main.as_ref().unwrap().pow2 {
            return true;
        }

        if !self.begin_resize(wanted_pow2) {
            self.state = MapState::Error;
            return false;
        }

        while !self.is_transfer_complete() {
            if !self.perform_partial_transfer() {
                return false;
            }
        }
        self.end_resize();

        true
    }

    fn put_stable(&mut self, key: K, value: V) -> bool {
        let alloc = self.alloc;
        let main = self.main.as_mut().unwrap();
        if main.num_buckets == 0 {
            return false;
        }

        let index = main.bucket_index(&key);
        let bucket = &mut main.buckets[index];

        if let Some(i) = bucket.find_index(&key) {
            return bucket.entries[i].construct(alloc, value);
        }

        if !bucket.ensure_capacity_for_push() {
            return false;
        }
        let _ = bucket.entries.push(Entry::new(key));

        let last = bucket.entries.len() - 1;
        if bucket.entries[last].construct(alloc, value) {
            main.total_entries += 1;
            true
        } else {
            // Out of memory for the value itself, take the entry back out
            let _ = bucket.entries.pop();
            false
        }
    }

    fn put_transfer(&mut self, key: K, value: V) -> bool {
        let alloc = self.alloc;
        let main = self.main.as_mut().unwrap();
        let sec = self.secondary.as_mut().unwrap();
        if sec.num_buckets == 0 {
            return false;
        }

        let sindex = sec.bucket_index(&key);

        if let Some(i) = sec.buckets[sindex].find_index(&key) {
            return sec.buckets[sindex].entries[i].construct(alloc, value);
        }

        if !sec.buckets[sindex].ensure_capacity_for_push() {
            return false;
        }
        let _ = sec.buckets[sindex].entries.push(Entry::new(key));
        let last = sec.buckets[sindex].entries.len() - 1;

        // The key may still live in the old table. Adopt its value
        // allocation (keeping the value address stable for observers) and
        // drop the drained entry, so the key exists in exactly one table.
        let adopted = {
            let key_ref = &sec.buckets[sindex].entries[last].key;
            if main.num_buckets > 0 {
                let mindex = main.bucket_index(key_ref);
                let mbucket = &mut main.buckets[mindex];
                match mbucket.find_index(key_ref) {
                    Some(mi) => {
                        let val = mbucket.entries[mi].val;
                        mbucket.entries[mi].val = ptr::null_mut();
                        mbucket.entries.remove_fast(mi);
                        main.total_entries -= 1;
                        val
                    }
                    None => ptr::null_mut(),
                }
            } else {
                ptr::null_mut()
            }
        };

        let entry = &mut sec.buckets[sindex].entries[last];
        if !adopted.is_null() {
            entry.val = adopted;
        }

        if entry.construct(alloc, value) {
            sec.total_entries += 1;
            true
        } else {
            let _ = sec.buckets[sindex].entries.pop();
            false
        }
    }

    fn should_resize(&self) -> bool {
        debug_assert_eq!(self.state, MapState::Stable);
        debug_assert!(self.secondary.is_none());

        if self.locked {
            return false;
        }

        let main = self.main.as_ref().unwrap();
        let max_key_count = self.max_load_factor_percent * main.num_buckets / 100;
        main.total_entries >= max_key_count
    }

    fn begin_resize(&mut self, new_pow2: u32) -> bool {
        debug_assert_eq!(self.state, MapState::Stable);
        debug_assert!(self.secondary.is_none());

        let table = Table::new(self.alloc, new_pow2);
        let expected = prime_above_power_of_two(table.pow2) as usize;
        if table.num_buckets != expected {
            // The shadow table came up short, give up before moving keys
            log::debug!(
                "map resize to {} buckets failed at {}",
                expected,
                table.num_buckets
            );
            return false;
        }

        log::debug!("map resize begins: {} buckets", expected);
        self.secondary = Some(table);
        self.state = MapState::Transfer;
        self.cursor = 0;

        true
    }

    /// Moves up to [`TRANSFER_BUDGET`] entries from the old table into the
    /// shadow table, walking buckets from a persistent cursor.
    fn perform_partial_transfer(&mut self) -> bool {
        debug_assert_eq!(self.state, MapState::Transfer);

        let alloc = self.alloc;
        let main = self.main.as_mut().unwrap();
        let sec = self.secondary.as_mut().unwrap();

        let mut budget = TRANSFER_BUDGET;

        while self.cursor < main.num_buckets {
            while !main.buckets[self.cursor].entries.is_empty() {
                if budget == 0 {
                    return true;
                }
                budget -= 1;

                let mut entry = main.buckets[self.cursor].entries.pop().unwrap();
                main.total_entries -= 1;

                let sindex = sec.bucket_index(&entry.key);
                let sbucket = &mut sec.buckets[sindex];

                if sbucket.find_index(&entry.key).is_some() {
                    // A put during the transfer already claimed this key;
                    // the old value is stale, drop it
                    entry.deconstruct(alloc);
                    continue;
                }

                if !sbucket.ensure_capacity_for_push() {
                    entry.deconstruct(alloc);
                    return false;
                }
                let _ = sbucket.entries.push(entry);
                sec.total_entries += 1;
            }
            self.cursor += 1;
        }

        true
    }

    fn is_transfer_complete(&self) -> bool {
        debug_assert_eq!(self.state, MapState::Transfer);
        self.main.as_ref().unwrap().total_entries == 0
    }

    fn end_resize(&mut self) {
        debug_assert_eq!(self.state, MapState::Transfer);
        debug_assert!(self.is_transfer_complete());

        self.main = self.secondary.take();
        self.state = MapState::Stable;
        self.cursor = 0;

        log::debug!(
            "map resize complete: {} buckets",
            self.main.as_ref().unwrap().num_buckets
        );
    }
}

impl<K, V, A: BlockAlloc> Drop for RtHashMap<'_, K, V, A> {
    fn drop(&mut self) {
        // Values are owned through raw pointers, release them before the
        // bucket storage goes
        for table in [&mut self.main, &mut self.secondary] {
            if let Some(table) = table {
                for bucket in table.buckets.as_mut_slice() {
                    for entry in bucket.entries.as_mut_slice() {
                        entry.deconstruct(self.alloc);
                    }
                    bucket.entries.clear();
                }
            }
        }
    }
}
