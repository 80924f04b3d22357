use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Outcome of a `fetch` call against the backing store.
///
/// `Ok(size)` reports the accounted size of the freshly fetched payload;
/// the cache decides on its own whether `size` is oversize relative to its
/// capacity. `DoNotCache` and `Fatal` both cause the entry to be dropped
/// from the index, the difference being purely informational to the
/// caller of `lookup`.
pub enum FetchResult {
    Ok(usize),
    DoNotCache,
    Fatal,
}

/// User-supplied backing store driving entry population and teardown.
///
/// Implementations are expected to be cheap to call repeatedly and safe to
/// call from arbitrary threads; the cache never holds its own lock while
/// calling `fetch`, but does hold the per-entry lock for the duration of
/// every callback.
pub trait BackingStore<K, V>: Send + Sync {
    /// Initialize a payload for a newly observed key. Called once per
    /// miss, before the entry is linked into any list.
    fn create(&self, key: &K) -> V;

    /// Populate (or repopulate) `payload` for `key`, returning the
    /// resulting accounted size on success.
    fn fetch(&self, key: &K, payload: &mut V) -> FetchResult;

    /// Release the resident contents of `payload`; the entry survives as
    /// a ghost and may be `fetch`ed again later.
    fn evict(&self, key: &K, payload: &mut V);

    /// Release `payload` for good; the entry will not be seen again.
    fn destroy(&self, key: &K, payload: V);
}

/// An in-memory backing store test double holding byte-string payloads,
/// with an explicit accounted size per key. `fetch` always succeeds,
/// returning whatever size was last `seed`ed; useful for exercising the
/// engine's own logic without a real storage layer behind it.
pub struct MapBackingStore<K> {
    values: Mutex<HashMap<K, (Vec<u8>, usize)>>,
}

impl<K> Default for MapBackingStore<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> MapBackingStore<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value with an explicit accounted size, as if it had already
    /// been written through the store.
    pub fn seed(&self, key: K, value: Vec<u8>, size: usize) {
        self.values.lock().unwrap().insert(key, (value, size));
    }
}

impl<K> BackingStore<K, Vec<u8>> for MapBackingStore<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn create(&self, _key: &K) -> Vec<u8> {
        Vec::new()
    }

    fn fetch(&self, key: &K, payload: &mut Vec<u8>) -> FetchResult {
        let values = self.values.lock().unwrap();
        match values.get(key) {
            Some((v, size)) => {
                *payload = v.clone();
                FetchResult::Ok(*size)
            }
            None => FetchResult::Ok(0),
        }
    }

    fn evict(&self, _key: &K, payload: &mut Vec<u8>) {
        payload.clear();
    }

    fn destroy(&self, _key: &K, _payload: Vec<u8>) {}
}
