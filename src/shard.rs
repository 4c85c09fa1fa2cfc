use equivalent::Equivalent;
use hashbrown::HashTable;

use crate::arena::{Arena, Token};

/// Callback supplied at insert time and invoked with the owned key and value
/// exactly once, when the entry's reference count drops to zero.
///
/// Deleters run strictly after the owning shard's lock is dropped, so a
/// deleter may call back into the cache.
pub type Deleter<Key, Val> = Box<dyn FnOnce(Key, Val) + Send + Sync>;

struct Entry<Key, Val> {
    hash: u64,
    key: Key,
    value: Val,
    charge: u64,
    deleter: Option<Deleter<Key, Val>>,
    /// Outstanding handles, plus one while the entry is in the index.
    refs: u32,
    in_index: bool,
}

impl<Key, Val> Entry<Key, Val> {
    /// Pinned entries have at least one outstanding handle and are never in
    /// the LRU ring.
    #[inline]
    fn pinned(&self) -> bool {
        self.refs > self.in_index as u32
    }

    fn into_reclaim(self) -> Reclaim<Key, Val> {
        Reclaim {
            key: self.key,
            value: self.value,
            deleter: self.deleter,
        }
    }
}

/// An entry detached under the shard lock, carried out of the critical
/// section so its deleter (and the key/value drops) run unlocked.
pub(crate) struct Reclaim<Key, Val> {
    key: Key,
    value: Val,
    deleter: Option<Deleter<Key, Val>>,
}

impl<Key, Val> Reclaim<Key, Val> {
    pub(crate) fn run(self) {
        if let Some(deleter) = self.deleter {
            deleter(self.key, self.value);
        }
    }
}

/// One independent LRU cache slice: hash index + LRU ring + capacity slice.
/// The caller (the sharding façade) provides the lock and the key hashes.
///
/// Entries are held in a token-addressed arena; the index and the handles
/// refer to them by token. An entry is in the LRU ring iff it is in the index
/// and unpinned, so the ring head is always a valid eviction victim.
pub(crate) struct CacheShard<Key, Val> {
    /// Maps entry hashes to arena tokens. Keys live in the arena.
    map: HashTable<Token>,
    entries: Arena<Entry<Key, Val>>,
    /// Head of the LRU ring, the next eviction victim. Entries are linked
    /// before the head, so the head's `prev` is the MRU end.
    lru_head: Option<Token>,
    capacity: u64,
    /// Sum of charges of in-index entries.
    usage: u64,
    /// Sum of charges of pinned entries, in-index or not.
    pinned_usage: u64,
    #[cfg(feature = "stats")]
    hits: u64,
    #[cfg(feature = "stats")]
    misses: u64,
}

impl<Key, Val> CacheShard<Key, Val> {
    pub fn new(estimated_entries: usize, capacity: u64) -> Self {
        Self {
            map: HashTable::with_capacity(estimated_entries),
            entries: Arena::with_capacity(estimated_entries),
            lru_head: None,
            capacity,
            usage: 0,
            pinned_usage: 0,
            #[cfg(feature = "stats")]
            hits: 0,
            #[cfg(feature = "stats")]
            misses: 0,
        }
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn pinned_usage(&self) -> u64 {
        self.pinned_usage
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(feature = "stats")]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[cfg(feature = "stats")]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Payload of a pinned entry. The token must come from an outstanding
    /// handle.
    pub fn value(&self, token: Token) -> &Val {
        &self.entries.get(token).unwrap().value
    }

    /// Charge of a pinned entry. The token must come from an outstanding
    /// handle.
    pub fn charge(&self, token: Token) -> u64 {
        self.entries.get(token).unwrap().charge
    }

    /// Invokes `f(value, charge)` for every in-index entry, pinned or not.
    /// Detached-but-pinned entries are no longer reachable by key and are
    /// skipped.
    pub fn for_each<F>(&self, f: &mut F)
    where
        F: FnMut(&Val, u64),
    {
        for entry in self.entries.iter() {
            if entry.in_index {
                f(&entry.value, entry.charge);
            }
        }
    }

    fn lru_remove(&mut self, token: Token) {
        let next = self.entries.unlink(token);
        if self.lru_head == Some(token) {
            self.lru_head = next;
        }
    }

    fn lru_push_mru(&mut self, token: Token) {
        self.lru_head = Some(self.entries.link_before(token, self.lru_head));
    }

    #[inline]
    fn map_insert(&mut self, hash: u64, token: Token) {
        let entries = &self.entries;
        self.map
            .insert_unique(hash, token, |&t| entries.get(t).unwrap().hash);
    }

    #[inline]
    fn map_remove(&mut self, hash: u64, token: Token) {
        match self.map.find_entry(hash, |&t| t == token) {
            Ok(entry) => {
                entry.remove();
            }
            Err(_) => debug_assert!(false, "token not in index"),
        }
    }

    /// Removes the entry from the index, destroying it unless handles keep it
    /// pinned. The charge stops counting towards usage either way.
    fn detach(&mut self, hash: u64, token: Token) -> Option<Reclaim<Key, Val>> {
        self.map_remove(hash, token);
        let entry = self.entries.get_mut(token).unwrap();
        debug_assert!(entry.in_index);
        entry.in_index = false;
        entry.refs -= 1;
        self.usage -= entry.charge;
        if entry.refs == 0 {
            self.lru_remove(token);
            let (entry, _) = self.entries.remove(token).unwrap();
            Some(entry.into_reclaim())
        } else {
            // Still pinned, so not in the ring. Keeps counting towards
            // pinned_usage until the last handle goes away.
            None
        }
    }

    /// Pops ring heads until usage fits the capacity or only pinned entries
    /// remain. Over-capacity usage due to pins is expected, not an error.
    fn evict(&mut self, reclaims: &mut Vec<Reclaim<Key, Val>>) {
        while self.usage > self.capacity {
            let Some(victim) = self.lru_head else { break };
            let hash = self.entries.get(victim).unwrap().hash;
            self.map_remove(hash, victim);
            self.lru_remove(victim);
            let (entry, _) = self.entries.remove(victim).unwrap();
            debug_assert_eq!(entry.refs, 1);
            self.usage -= entry.charge;
            reclaims.push(entry.into_reclaim());
        }
    }

    /// Releases one handle reference; the façade turns the handle drop into
    /// this call. Returns the entry for reclamation if this was its last
    /// reference, or if it unpinned while the shard is over capacity.
    pub fn release(&mut self, token: Token) -> Option<Reclaim<Key, Val>> {
        let entry = self.entries.get_mut(token).unwrap();
        debug_assert!(entry.pinned());
        entry.refs -= 1;
        let charge = entry.charge;
        if entry.refs == 0 {
            // last reference of an erased or overwritten entry
            self.pinned_usage -= charge;
            let (entry, _) = self.entries.remove(token).unwrap();
            Some(entry.into_reclaim())
        } else if entry.in_index && entry.refs == 1 {
            // last handle went away, the entry unpins
            let hash = entry.hash;
            self.pinned_usage -= charge;
            if self.usage > self.capacity {
                // over budget: evict the freshly unpinned entry right away
                // instead of parking it in the ring
                self.map_remove(hash, token);
                self.usage -= charge;
                let (entry, _) = self.entries.remove(token).unwrap();
                Some(entry.into_reclaim())
            } else {
                self.lru_push_mru(token);
                None
            }
        } else {
            None
        }
    }

    pub fn set_capacity(&mut self, capacity: u64) -> Vec<Reclaim<Key, Val>> {
        self.capacity = capacity;
        let mut reclaims = Vec::new();
        self.evict(&mut reclaims);
        reclaims
    }
}

impl<Key: Eq, Val> CacheShard<Key, Val> {
    #[inline]
    fn search<Q>(&self, hash: u64, key: &Q) -> Option<Token>
    where
        Q: Equivalent<Key> + ?Sized,
    {
        self.map
            .find(hash, |&t| key.equivalent(&self.entries.get(t).unwrap().key))
            .copied()
    }

    pub fn contains<Q>(&self, hash: u64, key: &Q) -> bool
    where
        Q: Equivalent<Key> + ?Sized,
    {
        self.search(hash, key).is_some()
    }

    /// Pins and returns the entry indexed at `key`, if any. A resting entry
    /// leaves the LRU ring; it returns at the MRU end on release.
    pub fn lookup<Q>(&mut self, hash: u64, key: &Q) -> Option<Token>
    where
        Q: Equivalent<Key> + ?Sized,
    {
        let Some(token) = self.search(hash, key) else {
            #[cfg(feature = "stats")]
            {
                self.misses += 1;
            }
            return None;
        };
        #[cfg(feature = "stats")]
        {
            self.hits += 1;
        }
        let entry = self.entries.get_mut(token).unwrap();
        debug_assert!(entry.in_index);
        entry.refs += 1;
        let charge = entry.charge;
        if entry.refs == 2 {
            // was resting unpinned in the ring
            self.pinned_usage += charge;
            self.lru_remove(token);
        }
        Some(token)
    }

    /// Installs a new pinned entry for `key`, detaching any previous entry at
    /// that key, then evicts down to capacity. Returns the new entry's token
    /// and the entries to reclaim outside the lock.
    pub fn insert(
        &mut self,
        hash: u64,
        key: Key,
        value: Val,
        charge: u64,
        deleter: Option<Deleter<Key, Val>>,
    ) -> (Token, Vec<Reclaim<Key, Val>>) {
        let mut reclaims = Vec::new();
        if let Some(old) = self.search(hash, &key) {
            if let Some(reclaim) = self.detach(hash, old) {
                reclaims.push(reclaim);
            }
        }
        // refs: one for the index, one for the returned handle
        let token = self.entries.insert(Entry {
            hash,
            key,
            value,
            charge,
            deleter,
            refs: 2,
            in_index: true,
        });
        self.map_insert(hash, token);
        self.usage += charge;
        self.pinned_usage += charge;
        self.evict(&mut reclaims);
        (token, reclaims)
    }

    /// Detaches the entry indexed at `key`. Never blocks on outstanding
    /// handles; a pinned entry lives on until its last release. Returns
    /// whether the key was present.
    pub fn erase<Q>(&mut self, hash: u64, key: &Q) -> (bool, Option<Reclaim<Key, Val>>)
    where
        Q: Equivalent<Key> + ?Sized,
    {
        match self.search(hash, key) {
            Some(token) => (true, self.detach(hash, token)),
            None => (false, None),
        }
    }
}

impl<Key, Val> Drop for CacheShard<Key, Val> {
    fn drop(&mut self) {
        // Outstanding handles borrow the cache, so by now every surviving
        // entry is unpinned and just needs its deleter.
        for entry in self.entries.drain() {
            entry.into_reclaim().run();
        }
    }
}

#[cfg(test)]
impl<Key, Val> CacheShard<Key, Val> {
    pub fn validate(&self) {
        self.entries.validate();
        let mut usage = 0;
        let mut pinned_usage = 0;
        let mut resting = Vec::new();
        for entry in self.entries.iter() {
            if entry.in_index {
                usage += entry.charge;
            }
            if entry.pinned() {
                pinned_usage += entry.charge;
            } else {
                assert!(entry.in_index, "unpinned entries must be indexed");
                assert_eq!(entry.refs, 1);
                resting.push(entry.hash);
            }
        }
        assert_eq!(usage, self.usage);
        assert_eq!(pinned_usage, self.pinned_usage);
        assert_eq!(self.map.len(), self.entries.iter().filter(|e| e.in_index).count());
        match self.lru_head {
            Some(head) => assert_eq!(self.entries.ring(head).len(), resting.len()),
            None => assert!(resting.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestShard {
        shard: CacheShard<u64, u64>,
        hasher: crate::DefaultHashBuilder,
    }

    impl TestShard {
        fn new(capacity: u64) -> Self {
            Self {
                shard: CacheShard::new(0, capacity),
                hasher: Default::default(),
            }
        }

        fn hash(&self, key: u64) -> u64 {
            std::hash::BuildHasher::hash_one(&self.hasher, key)
        }

        fn insert(&mut self, key: u64, charge: u64) -> (Token, Vec<Reclaim<u64, u64>>) {
            let hash = self.hash(key);
            self.shard.insert(hash, key, key * 10, charge, None)
        }

        fn insert_counted(
            &mut self,
            key: u64,
            charge: u64,
            deleted: &Arc<AtomicUsize>,
        ) -> (Token, Vec<Reclaim<u64, u64>>) {
            let hash = self.hash(key);
            let deleted = deleted.clone();
            let deleter: Deleter<u64, u64> = Box::new(move |_k, _v| {
                deleted.fetch_add(1, Ordering::Relaxed);
            });
            self.shard.insert(hash, key, key * 10, charge, Some(deleter))
        }

        fn lookup(&mut self, key: u64) -> Option<Token> {
            self.shard.lookup(self.hash(key), &key)
        }

        fn erase(&mut self, key: u64) -> (bool, Option<Reclaim<u64, u64>>) {
            self.shard.erase(self.hash(key), &key)
        }
    }

    #[test]
    fn evicts_in_lru_order() {
        let mut t = TestShard::new(2);
        for key in 1..=2 {
            let (token, reclaims) = t.insert(key, 1);
            assert!(reclaims.is_empty());
            assert!(t.shard.release(token).is_none());
        }
        assert_eq!(t.shard.usage(), 2);
        let (token, reclaims) = t.insert(3, 1);
        assert_eq!(reclaims.len(), 1);
        assert!(t.shard.release(token).is_none());
        t.shard.validate();
        // key 1 was least recently used
        assert!(t.lookup(1).is_none());
        for key in 2..=3 {
            let token = t.lookup(key).unwrap();
            assert_eq!(*t.shard.value(token), key * 10);
            assert!(t.shard.release(token).is_none());
        }
        t.shard.validate();
    }

    #[test]
    fn lookup_refreshes_recency() {
        let mut t = TestShard::new(2);
        for key in [1, 2] {
            let (token, _) = t.insert(key, 1);
            assert!(t.shard.release(token).is_none());
        }
        let token = t.lookup(1).unwrap();
        assert!(t.shard.release(token).is_none());
        // 2 is now the LRU victim
        let (token, reclaims) = t.insert(3, 1);
        assert_eq!(reclaims.len(), 1);
        assert!(t.shard.release(token).is_none());
        assert!(t.lookup(2).is_none());
        let survivor = t.lookup(1).unwrap();
        assert!(t.shard.release(survivor).is_none());
        t.shard.validate();
    }

    #[test]
    fn pinned_entries_are_never_evicted() {
        let mut t = TestShard::new(2);
        let (pinned, _) = t.insert(1, 1);
        for key in 2..10 {
            let (token, _) = t.insert(key, 1);
            let _ = t.shard.release(token);
        }
        t.shard.validate();
        let token = t.lookup(1).unwrap();
        assert_eq!(*t.shard.value(token), 10);
        assert!(t.shard.release(token).is_none());
        assert!(t.shard.release(pinned).is_none());
        t.shard.validate();
    }

    #[test]
    fn overwrite_detaches_but_keeps_pinned_entry() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let mut t = TestShard::new(10);
        let (old, _) = t.insert_counted(1, 1, &deleted);
        let (new, reclaims) = t.insert(1, 1);
        // the old entry left the index but survives through its handle
        assert!(reclaims.is_empty());
        assert_eq!(t.shard.usage(), 1);
        assert_eq!(t.shard.pinned_usage(), 2);
        assert_eq!(t.shard.len(), 1);
        t.shard.validate();
        let reclaim = t.shard.release(old).unwrap();
        reclaim.run();
        assert_eq!(deleted.load(Ordering::Relaxed), 1);
        assert_eq!(t.shard.pinned_usage(), 1);
        assert!(t.shard.release(new).is_none());
        t.shard.validate();
        assert_eq!(t.shard.usage(), 1);
    }

    #[test]
    fn release_over_capacity_evicts_released_entry() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let mut t = TestShard::new(2);
        let mut tokens = Vec::new();
        for key in 1..=3 {
            let (token, reclaims) = t.insert_counted(key, 1, &deleted);
            assert!(reclaims.is_empty());
            tokens.push(token);
        }
        // everything pinned, nothing evictable
        assert_eq!(t.shard.usage(), 3);
        assert_eq!(t.shard.pinned_usage(), 3);
        // the first release is over budget and reclaims its own entry
        let reclaim = t.shard.release(tokens[0]).unwrap();
        reclaim.run();
        assert_eq!(deleted.load(Ordering::Relaxed), 1);
        assert_eq!(t.shard.usage(), 2);
        assert!(t.shard.release(tokens[1]).is_none());
        assert!(t.shard.release(tokens[2]).is_none());
        t.shard.validate();
        assert!(t.lookup(1).is_none());
    }

    #[test]
    fn erase_defers_deleter_until_last_release() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let mut t = TestShard::new(10);
        let (token, _) = t.insert_counted(1, 1, &deleted);
        let (found, reclaim) = t.erase(1);
        assert!(found);
        assert!(reclaim.is_none());
        assert_eq!(t.shard.usage(), 0);
        assert_eq!(t.shard.pinned_usage(), 1);
        assert!(t.lookup(1).is_none());
        t.shard.validate();
        let reclaim = t.shard.release(token).unwrap();
        reclaim.run();
        assert_eq!(deleted.load(Ordering::Relaxed), 1);
        assert_eq!(t.shard.pinned_usage(), 0);
        t.shard.validate();
    }

    #[test]
    fn erase_missing_key_is_noop() {
        let mut t = TestShard::new(10);
        let (found, reclaim) = t.erase(42);
        assert!(!found);
        assert!(reclaim.is_none());
    }

    #[test]
    fn zero_charge_entries_rest_in_the_ring() {
        let mut t = TestShard::new(2);
        for key in [1, 2] {
            let (token, _) = t.insert(key, 0);
            assert!(t.shard.release(token).is_none());
        }
        assert_eq!(t.shard.usage(), 0);
        assert_eq!(t.shard.len(), 2);
        // fits without touching the zero-charge entries
        let (token, reclaims) = t.insert(3, 1);
        assert!(reclaims.is_empty());
        assert!(t.shard.release(token).is_none());
        let token = t.lookup(1).unwrap();
        assert!(t.shard.release(token).is_none());
        // ring order is now [2, 3, 1]; an over-budget insert walks it as
        // usual, zero charges included, stopping once usage fits
        let (token, reclaims) = t.insert(4, 2);
        assert_eq!(reclaims.len(), 2);
        assert!(t.shard.release(token).is_none());
        assert_eq!(t.shard.usage(), 2);
        assert_eq!(t.shard.len(), 2);
        assert!(t.lookup(2).is_none());
        assert!(t.lookup(3).is_none());
        let token = t.lookup(1).unwrap();
        assert!(t.shard.release(token).is_none());
        t.shard.validate();
    }

    #[test]
    fn lower_capacity_evicts_down() {
        let mut t = TestShard::new(5);
        for key in 1..=5 {
            let (token, _) = t.insert(key, 1);
            assert!(t.shard.release(token).is_none());
        }
        let reclaims = t.shard.set_capacity(2);
        assert_eq!(reclaims.len(), 3);
        assert_eq!(t.shard.usage(), 2);
        assert_eq!(t.shard.capacity(), 2);
        t.shard.validate();
        // raising never evicts
        assert!(t.shard.set_capacity(10).is_empty());
        assert_eq!(t.shard.usage(), 2);
    }

    #[test]
    fn drop_runs_remaining_deleters() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let mut t = TestShard::new(10);
        for key in 1..=4 {
            let (token, _) = t.insert_counted(key, 1, &deleted);
            assert!(t.shard.release(token).is_none());
        }
        drop(t);
        assert_eq!(deleted.load(Ordering::Relaxed), 4);
    }
}
