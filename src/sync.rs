use std::hash::{BuildHasher, Hash};

use equivalent::Equivalent;

use crate::{
    arena::Token,
    options::{default_shard_bits, Options, MAX_SHARD_BITS},
    rw_lock::RwLock,
    shard::{CacheShard, Deleter},
    shim::sync::atomic::{AtomicU64, Ordering},
    DefaultHashBuilder,
};

/// A concurrent, capacity-bounded cache whose entries stay pinned in memory
/// while the caller holds a [PinnedEntry] to them.
///
/// # Keys and charges
/// Every entry carries a `charge`, its cost against the cache capacity in
/// whatever unit the caller picks (commonly bytes). A key maps to at most one
/// entry at a time; inserting over an existing key detaches the old entry,
/// which lives on only while pinned.
///
/// # Value
/// Cache values are cloned when fetched through a handle. Users should wrap
/// expensive values with `Arc<_>`.
///
/// # Thread safety and concurrency
/// The cache can be shared between threads by reference (or `Arc`). Every
/// operation locks only the shard owning the key, so operations on different
/// shards never contend.
pub struct Cache<Key, Val, B = DefaultHashBuilder> {
    hash_builder: B,
    shards: Box<[RwLock<CacheShard<Key, Val>>]>,
    shard_bits: u32,
    next_id: AtomicU64,
}

impl<Key: Eq + Hash, Val, B: Default + BuildHasher> Cache<Key, Val, B> {
    /// Creates a cache holding up to `capacity` total charge, with a shard
    /// count derived from the detected parallelism.
    pub fn new(capacity: u64) -> Self {
        Self::with_options(
            Options {
                shard_bits: None,
                capacity,
                estimated_entries: 0,
            },
            B::default(),
        )
    }

    /// Creates a cache with 2^`shard_bits` shards splitting `capacity`.
    ///
    /// # Panics
    /// Panics if `shard_bits` exceeds 12.
    pub fn with_shard_bits(capacity: u64, shard_bits: u32) -> Self {
        assert!(
            shard_bits <= MAX_SHARD_BITS,
            "shard_bits must be at most {MAX_SHARD_BITS}"
        );
        Self::with_options(
            Options {
                shard_bits: Some(shard_bits),
                capacity,
                estimated_entries: 0,
            },
            B::default(),
        )
    }
}

impl<Key: Eq + Hash, Val, B: BuildHasher> Cache<Key, Val, B> {
    /// Creates a cache from [Options] built with
    /// [OptionsBuilder][crate::OptionsBuilder].
    pub fn with_options(options: Options, hash_builder: B) -> Self {
        let shard_bits = options
            .shard_bits
            .unwrap_or_else(|| default_shard_bits(options.capacity));
        let num_shards = 1usize << shard_bits;
        let shard_entries = options.estimated_entries / num_shards;
        // remainder spread over the first shards so the slices sum exactly
        let (base, remainder) = (
            options.capacity / num_shards as u64,
            options.capacity % num_shards as u64,
        );
        let shards = (0..num_shards as u64)
            .map(|i| RwLock::new(CacheShard::new(shard_entries, base + (i < remainder) as u64)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            hash_builder,
            shards,
            shard_bits,
            next_id: AtomicU64::new(0),
        }
    }

    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hash_builder.hash_one(key)
    }

    /// The hash's high bits select the shard.
    #[inline]
    fn shard_for(&self, hash: u64) -> usize {
        (hash.rotate_left(self.shard_bits) as usize) & (self.shards.len() - 1)
    }

    /// Inserts `key -> value` and returns a handle pinning the new entry.
    ///
    /// Displaced and evicted entries are reclaimed after the shard lock is
    /// dropped. Insertion never fails; a charge larger than the whole
    /// capacity is accepted and simply becomes the first eviction candidate
    /// once unpinned.
    pub fn insert(&self, key: Key, value: Val, charge: u64) -> PinnedEntry<'_, Key, Val, B> {
        self.insert_inner(key, value, charge, None)
    }

    /// Like [Cache::insert], additionally registering a deleter invoked with
    /// the owned key and value exactly once when the entry is destroyed.
    ///
    /// The deleter runs outside the shard lock, on the thread that dropped
    /// the entry's last reference.
    pub fn insert_with_deleter(
        &self,
        key: Key,
        value: Val,
        charge: u64,
        deleter: Deleter<Key, Val>,
    ) -> PinnedEntry<'_, Key, Val, B> {
        self.insert_inner(key, value, charge, Some(deleter))
    }

    fn insert_inner(
        &self,
        key: Key,
        value: Val,
        charge: u64,
        deleter: Option<Deleter<Key, Val>>,
    ) -> PinnedEntry<'_, Key, Val, B> {
        let hash = self.hash(&key);
        let shard = self.shard_for(hash);
        let (token, reclaims) = self.shards[shard]
            .write()
            .insert(hash, key, value, charge, deleter);
        for reclaim in reclaims {
            reclaim.run();
        }
        PinnedEntry {
            cache: self,
            shard,
            token,
        }
    }

    /// Fetches and pins the entry at `key`. Pinned entries are ineligible
    /// for eviction until the handle is dropped, which also marks them most
    /// recently used.
    pub fn get<Q>(&self, key: &Q) -> Option<PinnedEntry<'_, Key, Val, B>>
    where
        Q: Hash + Equivalent<Key> + ?Sized,
    {
        let hash = self.hash(key);
        let shard = self.shard_for(hash);
        let token = self.shards[shard].write().lookup(hash, key)?;
        Some(PinnedEntry {
            cache: self,
            shard,
            token,
        })
    }

    /// Whether `key` is currently indexed, without pinning or touching
    /// recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<Key> + ?Sized,
    {
        let hash = self.hash(key);
        self.shards[self.shard_for(hash)].read().contains(hash, key)
    }

    /// Removes the entry at `key` from the index. Returns whether the key was
    /// present. Never blocks on outstanding handles: a pinned entry survives,
    /// unreachable, until its last handle is dropped.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<Key> + ?Sized,
    {
        let hash = self.hash(key);
        let (found, reclaim) = self.shards[self.shard_for(hash)].write().erase(hash, key);
        if let Some(reclaim) = reclaim {
            reclaim.run();
        }
        found
    }
}

impl<Key, Val, B> Cache<Key, Val, B> {
    /// Updates the total capacity, re-split across the shards. Lowering it
    /// evicts unpinned entries until usage fits; usage may legitimately stay
    /// above the new capacity while entries are pinned.
    pub fn set_capacity(&self, capacity: u64) {
        let num_shards = self.shards.len() as u64;
        let (base, remainder) = (capacity / num_shards, capacity % num_shards);
        for (i, shard) in self.shards.iter().enumerate() {
            let reclaims = shard.write().set_capacity(base + ((i as u64) < remainder) as u64);
            for reclaim in reclaims {
                reclaim.run();
            }
        }
    }

    /// Sum of charges of all indexed entries.
    pub fn usage(&self) -> u64 {
        self.shards.iter().map(|s| s.read().usage()).sum()
    }

    /// Sum of charges of all pinned entries, including entries already
    /// overwritten or removed but kept alive by handles.
    pub fn pinned_usage(&self) -> u64 {
        self.shards.iter().map(|s| s.read().pinned_usage()).sum()
    }

    pub fn capacity(&self) -> u64 {
        self.shards.iter().map(|s| s.read().capacity()).sum()
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of hits
    #[cfg(feature = "stats")]
    pub fn hits(&self) -> u64 {
        self.shards.iter().map(|s| s.read().hits()).sum()
    }

    /// Returns the number of misses
    #[cfg(feature = "stats")]
    pub fn misses(&self) -> u64 {
        self.shards.iter().map(|s| s.read().misses()).sum()
    }

    /// A monotonically increasing id, unique within this cache instance.
    /// Useful for multiple logical users sharing one cache to prefix their
    /// keys with.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Invokes `f(value, charge)` for every indexed entry, pinned or not.
    /// Each shard's lock is held while it is visited, so per-shard snapshots
    /// are consistent. The callback must not call back into the cache or
    /// drop handles, as that would re-enter a held lock.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Val, u64),
    {
        for shard in self.shards.iter() {
            shard.read().for_each(&mut f);
        }
    }

    /// Like [Cache::for_each], relying on `&mut self` exclusivity instead of
    /// holding each shard's lock for the whole pass (e.g. during shutdown).
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&Val, u64),
    {
        for shard in self.shards.iter() {
            shard.write().for_each(&mut f);
        }
    }
}

impl<Key, Val, B> std::fmt::Debug for Cache<Key, Val, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

/// A pinned reference to a cache entry, obtained from [Cache::insert] or
/// [Cache::get].
///
/// While the handle is alive the entry cannot be evicted, even if it has
/// been overwritten or removed from the index. Dropping the handle releases
/// the reference; the last drop re-queues an indexed entry at the MRU end of
/// its shard's LRU list, or destroys it (running its deleter) if it is no
/// longer indexed. The handle is move-only and releases exactly once, so
/// double-release and use-after-release cannot be expressed.
pub struct PinnedEntry<'cache, Key, Val, B> {
    cache: &'cache Cache<Key, Val, B>,
    shard: usize,
    token: Token,
}

impl<Key, Val, B> PinnedEntry<'_, Key, Val, B> {
    /// The entry's payload, cloned under the shard lock.
    pub fn value(&self) -> Val
    where
        Val: Clone,
    {
        self.cache.shards[self.shard].read().value(self.token).clone()
    }

    /// The charge this entry counts against the cache capacity.
    pub fn charge(&self) -> u64 {
        self.cache.shards[self.shard].read().charge(self.token)
    }

    /// Releases the pin. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<Key, Val, B> Drop for PinnedEntry<'_, Key, Val, B> {
    fn drop(&mut self) {
        let reclaim = self.cache.shards[self.shard].write().release(self.token);
        // the deleter, if any, runs after the lock is gone
        if let Some(reclaim) = reclaim {
            reclaim.run();
        }
    }
}

impl<Key, Val, B> std::fmt::Debug for PinnedEntry<'_, Key, Val, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedEntry").finish_non_exhaustive()
    }
}
