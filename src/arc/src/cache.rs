use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use shardcache_common::{Result, ShardCacheError};

use crate::entry::{Entry, EntryGuts, EntryState};
use crate::store::{BackingStore, FetchResult};

struct CacheState<K, V> {
    index: HashMap<K, Arc<Entry<K, V>>>,
    mru: VecDeque<Arc<Entry<K, V>>>,
    mfu: VecDeque<Arc<Entry<K, V>>>,
    mrug: VecDeque<Arc<Entry<K, V>>>,
    mfug: VecDeque<Arc<Entry<K, V>>>,
    mru_size: usize,
    mfu_size: usize,
    mrug_size: usize,
    mfug_size: usize,
    p: usize,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash,
{
    fn list_mut(&mut self, which: EntryState) -> &mut VecDeque<Arc<Entry<K, V>>> {
        match which {
            EntryState::Mru => &mut self.mru,
            EntryState::Mfu => &mut self.mfu,
            EntryState::Mrug => &mut self.mrug,
            EntryState::Mfug => &mut self.mfug,
            EntryState::Unlinked => unreachable!("Unlinked entries are not in any list"),
        }
    }

    fn size_mut(&mut self, which: EntryState) -> &mut usize {
        match which {
            EntryState::Mru => &mut self.mru_size,
            EntryState::Mfu => &mut self.mfu_size,
            EntryState::Mrug => &mut self.mrug_size,
            EntryState::Mfug => &mut self.mfug_size,
            EntryState::Unlinked => unreachable!("Unlinked entries carry no size total"),
        }
    }

    /// Removes `entry` from `origin`'s list and debits its size from that
    /// list's accounted total. `size` must already be known by the caller
    /// (read from the entry's own lock before this is called) so that this
    /// never needs to lock the entry itself while the cache lock is held.
    fn unlink(&mut self, origin: EntryState, entry: &Arc<Entry<K, V>>, size: usize) {
        if origin == EntryState::Unlinked {
            return;
        }
        *self.size_mut(origin) = self.size_mut(origin).saturating_sub(size);
        let list = self.list_mut(origin);
        if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, entry)) {
            list.remove(pos);
        }
    }

    fn prepend(&mut self, target: EntryState, entry: Arc<Entry<K, V>>, size: usize) {
        *self.size_mut(target) += size;
        self.list_mut(target).push_front(entry);
    }
}

/// A concurrent four-list Adaptive Replacement Cache.
///
/// Capacity is a byte budget shared between the MRU and MFU lists; the
/// ghost lists (MRUG, MFUG) are bounded by the same byte budget, tracked
/// from each entry's last known size at the moment it was demoted to a
/// ghost (a ghost carries no payload, but its accounted size is retained
/// until it is evicted for good).
pub struct ArcCache<K, V> {
    capacity: usize,
    store: Arc<dyn BackingStore<K, V>>,
    state: Mutex<CacheState<K, V>>,
    needs_rebalance: AtomicBool,
    num_items: AtomicUsize,
}

impl<K, V> ArcCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, store: Arc<dyn BackingStore<K, V>>) -> Self {
        Self {
            capacity,
            store,
            state: Mutex::new(CacheState {
                index: HashMap::new(),
                mru: VecDeque::new(),
                mfu: VecDeque::new(),
                mrug: VecDeque::new(),
                mfug: VecDeque::new(),
                mru_size: 0,
                mfu_size: 0,
                mrug_size: 0,
                mfug_size: 0,
                p: capacity / 2,
            }),
            needs_rebalance: AtomicBool::new(false),
            num_items: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current target MRU size; only moves on ghost hits (§4.1.2).
    pub fn p(&self) -> usize {
        self.state.lock().unwrap().p
    }

    /// Sum of accounted sizes of entries resident in MRU and MFU.
    pub fn size(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.mru_size + state.mfu_size
    }

    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::SeqCst)
    }

    /// Look up `key`, creating and fetching it on a miss. Returns a
    /// retained handle plus a clone of the resident payload, if any.
    pub fn lookup(&self, key: &K, is_async: bool) -> Result<(Arc<Entry<K, V>>, Option<V>)> {
        let existing = {
            let state = self.state.lock().unwrap();
            state.index.get(key).cloned()
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = Arc::new(Entry {
                    key: key.clone(),
                    guts: Mutex::new(EntryGuts {
                        state: EntryState::Unlinked,
                        size: 0,
                        payload: None,
                        is_async,
                    }),
                    store: self.store.clone(),
                });
                {
                    let mut state = self.state.lock().unwrap();
                    state.index.insert(key.clone(), entry.clone());
                }
                self.move_entry(&entry, Some(EntryState::Mru))?;
                self.balance(0);
                let value = entry.value();
                return Ok((entry, value));
            }
        };

        let bypass = {
            let guts = entry.guts.lock().unwrap();
            is_async && guts.is_async
        };
        if bypass {
            let value = entry.value();
            return Ok((entry, value));
        }

        self.move_entry(&entry, Some(EntryState::Mfu))?;
        self.balance(0);
        let value = entry.value();
        Ok((entry, value))
    }

    /// Remove `key` from the index and unlink it from whichever list it
    /// occupies. Any handles already held by callers remain valid until
    /// released.
    pub fn remove(&self, key: &K) {
        let entry = {
            let mut state = self.state.lock().unwrap();
            state.index.remove(key)
        };
        let Some(entry) = entry else { return };
        let was_live = matches!(entry.state(), EntryState::Mru | EntryState::Mfu);
        let _ = self.move_entry(&entry, None);
        if was_live {
            self.num_items.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Adjust the accounted size of a live (MRU/MFU) entry, e.g. after a
    /// backing layer finishes populating an asynchronously fetched value.
    pub fn update_size(&self, key: &K, new_size: usize) {
        let entry = {
            let state = self.state.lock().unwrap();
            state.index.get(key).cloned()
        };
        let Some(entry) = entry else { return };

        let (old_size, target) = {
            let mut guts = entry.guts.lock().unwrap();
            if !matches!(guts.state, EntryState::Mru | EntryState::Mfu) {
                return;
            }
            let old_size = guts.size;
            guts.size = new_size;
            guts.is_async = false;
            (old_size, guts.state)
        };

        let mut state = self.state.lock().unwrap();
        match target {
            EntryState::Mru => state.mru_size = state.mru_size.saturating_sub(old_size) + new_size,
            EntryState::Mfu => state.mfu_size = state.mfu_size.saturating_sub(old_size) + new_size,
            _ => {}
        }
        drop(state);
        self.needs_rebalance.store(true, Ordering::SeqCst);
    }

    /// The single operation that mutates list membership (§4.1.2).
    fn move_entry(&self, entry: &Arc<Entry<K, V>>, target: Option<EntryState>) -> Result<()> {
        let mut guts = entry.guts.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let origin = guts.state;

        if origin != EntryState::Unlinked && target.is_some() {
            match origin {
                EntryState::Mrug => {
                    let (mrug_len, mfug_len) = (state.mrug.len(), state.mfug.len());
                    let delta = if mrug_len > 0 {
                        (mfug_len / mrug_len).max(1)
                    } else {
                        (mfug_len / 2).max(1)
                    };
                    state.p = (state.p + delta).min(self.capacity);
                }
                EntryState::Mfug => {
                    let (mrug_len, mfug_len) = (state.mrug.len(), state.mfug.len());
                    let delta = if mfug_len > 0 {
                        (mrug_len / mfug_len).max(1)
                    } else {
                        (mrug_len / 2).max(1)
                    };
                    state.p = state.p.saturating_sub(delta);
                }
                _ => {}
            }
        }

        state.unlink(origin, entry, guts.size);

        let target = match target {
            None => return Ok(()),
            Some(t) => t,
        };

        match target {
            EntryState::Mrug | EntryState::Mfug => {
                if let Some(payload) = guts.payload.as_mut() {
                    self.store.evict(&entry.key, payload);
                }
                guts.payload = None;
                guts.is_async = false;
                guts.state = target;
                state.prepend(target, entry.clone(), guts.size);
                Ok(())
            }
            EntryState::Mru | EntryState::Mfu => {
                let needs_fetch = matches!(
                    origin,
                    EntryState::Mrug | EntryState::Mfug | EntryState::Unlinked
                );
                if !needs_fetch {
                    guts.state = target;
                    state.prepend(target, entry.clone(), guts.size);
                    self.needs_rebalance.store(true, Ordering::SeqCst);
                    return Ok(());
                }

                // Release the cache lock while the backing store is doing
                // (possibly slow) I/O; the entry lock stays held.
                drop(state);
                let result = {
                    let key = &entry.key;
                    let payload = guts.payload.get_or_insert_with(|| self.store.create(key));
                    self.store.fetch(key, payload)
                };
                let mut state = self.state.lock().unwrap();
                match result {
                    FetchResult::Ok(size) => {
                        guts.size = size;
                        if size >= self.capacity {
                            // Oversize: tracked as a transient holder, never
                            // linked into a list.
                            guts.state = EntryState::Unlinked;
                            self.num_items.fetch_add(1, Ordering::SeqCst);
                        } else {
                            guts.state = target;
                            state.prepend(target, entry.clone(), size);
                            self.needs_rebalance.store(true, Ordering::SeqCst);
                            self.num_items.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(())
                    }
                    FetchResult::DoNotCache => {
                        state.index.remove(&entry.key);
                        guts.state = EntryState::Unlinked;
                        guts.payload = None;
                        Err(ShardCacheError::Transient(
                            "backing store declined to cache this key".into(),
                        ))
                    }
                    FetchResult::Fatal => {
                        state.index.remove(&entry.key);
                        guts.state = EntryState::Unlinked;
                        guts.payload = None;
                        Err(ShardCacheError::Fatal("backing store fetch failed".into()))
                    }
                }
            }
            EntryState::Unlinked => unreachable!("move() never targets Unlinked directly"),
        }
    }

    /// Demotes `victim` from `from` to `to` (MRU/MFU -> matching ghost).
    ///
    /// Locks the entry's own guts first, matching `move_entry`'s
    /// entry-then-cache discipline, then the cache state only long enough
    /// to relink the list. `from` is re-checked once the entry lock is
    /// held since another thread may have already moved this entry (e.g.
    /// a concurrent `lookup` promoting it) between the victim being
    /// selected and this call acquiring the lock.
    fn demote(&self, victim: &Arc<Entry<K, V>>, from: EntryState, to: EntryState) {
        let mut guts = victim.guts.lock().unwrap();
        if guts.state != from {
            return;
        }
        if let Some(payload) = guts.payload.as_mut() {
            self.store.evict(&victim.key, payload);
        }
        let size = guts.size;
        guts.payload = None;
        guts.is_async = false;
        guts.state = to;
        drop(guts);

        let mut state = self.state.lock().unwrap();
        state.unlink(from, victim, size);
        state.prepend(to, victim.clone(), size);
        drop(state);
        self.num_items.fetch_sub(1, Ordering::SeqCst);
        trace!("demoted entry from {:?} to {:?}", from, to);
    }

    /// Permanently evicts a ghost entry, dropping it from the index.
    /// Same entry-then-cache locking discipline as `demote`.
    fn evict_ghost(&self, victim: &Arc<Entry<K, V>>, from: EntryState) {
        let mut guts = victim.guts.lock().unwrap();
        if guts.state != from {
            return;
        }
        let size = guts.size;
        guts.state = EntryState::Unlinked;
        drop(guts);

        let mut state = self.state.lock().unwrap();
        state.unlink(from, victim, size);
        state.index.remove(&victim.key);
    }

    /// Runs the two-phase balance pass described in §4.1.5, if and only
    /// if `needs_rebalance` is currently set. Collects each victim under a
    /// short-lived cache-state lock, then releases it before demoting or
    /// evicting that victim, so the cache lock and an entry's own guts
    /// lock are never held at the same time in this direction (matching
    /// `move_entry`'s entry-then-cache order rather than inverting it).
    pub fn balance(&self, size_hint: usize) {
        if !self.needs_rebalance.swap(false, Ordering::SeqCst) {
            return;
        }

        loop {
            let (over_budget, victim) = {
                let state = self.state.lock().unwrap();
                let over_budget = state.mru_size + state.mfu_size + size_hint > self.capacity;
                if !over_budget {
                    (false, None)
                } else if state.mru_size > state.p {
                    (true, state.mru.back().cloned().map(|e| (e, EntryState::Mru, EntryState::Mrug)))
                } else if !state.mfu.is_empty() {
                    (true, state.mfu.back().cloned().map(|e| (e, EntryState::Mfu, EntryState::Mfug)))
                } else {
                    (true, None)
                }
            };
            if !over_budget {
                break;
            }
            match victim {
                Some((entry, from, to)) => self.demote(&entry, from, to),
                None => break,
            }
        }

        loop {
            let (over_budget, victim) = {
                let state = self.state.lock().unwrap();
                let over_budget = state.mrug_size + state.mfug_size > self.capacity;
                if !over_budget {
                    (false, None)
                } else if state.mfug_size > state.p {
                    (true, state.mfug.back().cloned().map(|e| (e, EntryState::Mfug)))
                } else if !state.mrug.is_empty() {
                    (true, state.mrug.back().cloned().map(|e| (e, EntryState::Mrug)))
                } else {
                    (true, None)
                }
            };
            if !over_budget {
                break;
            }
            match victim {
                Some((entry, from)) => self.evict_ghost(&entry, from),
                None => break,
            }
        }
        debug!("balance complete, size={}", self.size());
    }
}

impl<K, V> Drop for ArcCache<K, V> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.index.clear();
        state.mru.clear();
        state.mfu.clear();
        state.mrug.clear();
        state.mfug.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MapBackingStore;

    fn cache(capacity: usize) -> (ArcCache<String, Vec<u8>>, Arc<MapBackingStore<String>>) {
        let store = Arc::new(MapBackingStore::new());
        (ArcCache::new(capacity, store.clone()), store)
    }

    #[test]
    fn miss_then_hit_promotes_to_mfu() {
        let (cache, store) = cache(1000);
        store.seed("a".to_string(), b"hello".to_vec(), 5);

        let (handle, value) = cache.lookup(&"a".to_string(), false).unwrap();
        assert_eq!(handle.state(), EntryState::Mru);
        assert_eq!(value, Some(b"hello".to_vec()));

        let (handle, _) = cache.lookup(&"a".to_string(), false).unwrap();
        assert_eq!(handle.state(), EntryState::Mfu);
        assert_eq!(cache.num_items(), 1);
    }

    #[test]
    fn num_items_matches_live_lists_at_quiescence() {
        let (cache, store) = cache(1000);
        for k in ["a", "b", "c"] {
            store.seed(k.to_string(), b"x".to_vec(), 1);
            cache.lookup(&k.to_string(), false).unwrap();
        }
        assert_eq!(cache.num_items(), 3);
        cache.remove(&"b".to_string());
        assert_eq!(cache.num_items(), 2);
    }

    #[test]
    fn ghost_entries_never_carry_a_payload() {
        let (cache, store) = cache(10);
        for k in ["a", "b", "c"] {
            store.seed(k.to_string(), vec![0u8; 4], 4);
            cache.lookup(&k.to_string(), false).unwrap();
        }
        let state = cache.state.lock().unwrap();
        for ghost in state.mrug.iter().chain(state.mfug.iter()) {
            assert!(ghost.value().is_none());
        }
    }

    #[test]
    fn size_after_balance_respects_capacity() {
        let (cache, store) = cache(10);
        for k in ["a", "b", "c"] {
            store.seed(k.to_string(), vec![0u8; 4], 4);
            cache.lookup(&k.to_string(), false).unwrap();
        }
        assert!(cache.size() <= 10);
    }

    #[test]
    fn ghost_hit_adjusts_p_and_promotes() {
        let (cache, store) = cache(100);
        for k in ["a", "b", "c"] {
            store.seed(k.to_string(), vec![0u8; 40], 40);
            cache.lookup(&k.to_string(), false).unwrap();
        }
        // a should now be a ghost (evicted to make room for b, c).
        let p_before = cache.p();
        let (handle, _) = cache.lookup(&"a".to_string(), false).unwrap();
        assert_eq!(handle.state(), EntryState::Mfu);
        assert!(cache.p() > p_before);
    }
}

