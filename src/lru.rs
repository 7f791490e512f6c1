use std::ptr::{self, NonNull};

use crate::alloc::BlockAlloc;
use crate::hash::Hash32;
use crate::map::RtHashMap;
use crate::pool::ObjectPool;

/// An intrusively linked cache node. Nodes are recycled through the pool so
/// steady-state cache traffic allocates nothing.
struct LruNode<K, V> {
    key: K,
    val: V,
    prev: *mut LruNode<K, V>,
    next: *mut LruNode<K, V>,
}

/// An allocator-aware least-recently-used cache of bounded capacity.
///
/// Entries live in pool-recycled nodes on an intrusive recency list, with a
/// hash map from key to node for O(1) lookup. The map is pre-sized for the
/// capacity and its table size is locked, so no cache operation ever
/// triggers a rehash.
///
/// [`put`] beyond capacity evicts the least recently used entry. [`get`]
/// refreshes recency; [`contains`] does not.
///
/// ## Example
///
/// ```
/// use rtmem::{LruCache, MappedRegion, RtAllocMt};
///
/// let mut region = MappedRegion::new();
/// assert!(region.init(4 * 1024 * 1024));
/// let alloc = RtAllocMt::new();
/// assert!(alloc.init(region.buffer(), region.capacity()));
///
/// let mut cache: LruCache<u32, &str, _> = LruCache::new(&alloc, 2);
/// assert!(cache.put(1, "one"));
/// assert!(cache.put(2, "two"));
/// assert!(cache.put(3, "three")); // evicts 1
/// assert!(!cache.contains(&1));
/// assert_eq!(cache.get(&3), Some(&"three"));
/// ```
///
/// [`put`]: LruCache::put
/// [`get`]: LruCache::get
/// [`contains`]: LruCache::contains
pub struct LruCache<'a, K: Hash32 + Eq + Clone, V, A: BlockAlloc> {
    head: *mut LruNode<K, V>,
    tail: *mut LruNode<K, V>,
    map: RtHashMap<'a, K, NonNull<LruNode<K, V>>, A>,
    pool: ObjectPool<'a, LruNode<K, V>, A>,
    capacity: usize,
    size: usize,
}

impl<'a, K: Hash32 + Eq + Clone, V, A: BlockAlloc> LruCache<'a, K, V, A> {
    /// A cache holding up to `capacity` entries (at least one). Node
    /// storage is pre-allocated and the map is sized up front, then locked
    /// against resizing.
    pub fn new(alloc: &'a A, capacity: usize) -> LruCache<'a, K, V, A> {
        let capacity = capacity.max(1);
        let mut map = RtHashMap::new(alloc);
        let wanted = map.approx_buckets_needed(capacity as u32);
        if map.reserve(wanted) {
            map.lock_table_size();
        }

        LruCache {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            map,
            pool: ObjectPool::new(alloc, capacity, 1),
            capacity,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if `key` is cached. Leaves the recency order alone.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    /// Returns the cached value and makes it the most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.refresh(key).map(|node| unsafe { &(*node).val })
    }

    /// Mutable access with the same recency refresh as [`get`].
    ///
    /// [`get`]: LruCache::get
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.refresh(key).map(|node| unsafe { &mut (*node).val })
    }

    /// Caches `value` under `key` as the most recently used entry,
    /// overwriting in place when the key is present and evicting the least
    /// recently used entry when the cache is full. False when node or map
    /// storage cannot be obtained.
    pub fn put(&mut self, key: K, value: V) -> bool {
        if let Some(node) = self.map.get(&key).copied() {
            let node = node.as_ptr();
            self.take_node(node);
            unsafe {
                (*node).key = key;
                (*node).val = value;
            }
            self.push_front(node);
            return true;
        }

        if self.size == self.capacity {
            let victim = self.tail;
            debug_assert!(!victim.is_null());
            let victim_key = unsafe { (*victim).key.clone() };
            self.map.del(&victim_key);
            self.pop_back();
        }

        let node = match self.pool.get(LruNode {
            key: key.clone(),
            val: value,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }) {
            Some(node) => node,
            None => return false,
        };

        if !self.map.put(key, node) {
            unsafe { self.pool.put(node) };
            return false;
        }

        self.push_front(node.as_ptr());
        true
    }

    /// Drops every cached entry.
    pub fn clear(&mut self) {
        while !self.head.is_null() {
            self.pop_back();
        }
        self.map.clear();
        self.size = 0;
    }

    fn refresh(&mut self, key: &K) -> Option<*mut LruNode<K, V>> {
        let node = self.map.get(key).copied()?.as_ptr();
        self.take_node(node);
        self.push_front(node);
        Some(node)
    }

    /// Unlinks `node` from the recency list.
    fn take_node(&mut self, node: *mut LruNode<K, V>) {
        debug_assert!(self.size > 0);

        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();

            if self.size == 1 {
                self.head = ptr::null_mut();
                self.tail = ptr::null_mut();
            } else if node == self.head {
                self.head = next;
                (*next).prev = ptr::null_mut();
            } else if node == self.tail {
                self.tail = prev;
                (*prev).next = ptr::null_mut();
            } else {
                (*prev).next = next;
                (*next).prev = prev;
            }
        }

        self.size -= 1;
    }

    fn push_front(&mut self, node: *mut LruNode<K, V>) {
        unsafe {
            debug_assert!((*node).prev.is_null() && (*node).next.is_null());

            if self.size == 0 {
                self.head = node;
                self.tail = node;
            } else {
                (*node).next = self.head;
                (*self.head).prev = node;
                self.head = node;
            }
        }

        self.size += 1;
    }

    /// Returns the least recently used node to the pool (running its
    /// destructor).
    fn pop_back(&mut self) {
        let node = match self.size {
            0 => return,
            1 => {
                let node = self.head;
                self.head = ptr::null_mut();
                self.tail = ptr::null_mut();
                node
            }
            _ => {
                let node = self.tail;
                unsafe {
                    self.tail = (*node).prev;
                    (*self.tail).next = ptr::null_mut();
                }
                node
            }
        };

        unsafe { self.pool.put(NonNull::new_unchecked(node)) };
        self.size -= 1;
    }
}

impl<K: Hash32 + Eq + Clone, V, A: BlockAlloc> Drop for LruCache<'_, K, V, A> {
    fn drop(&mut self) {
        // Nodes go back to the pool before the pool itself is dropped
        while !self.head.is_null() {
            self.pop_back();
        }
    }
}
