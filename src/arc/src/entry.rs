use std::sync::{Arc, Mutex};

use crate::store::BackingStore;

/// Which of the four logical lists (if any) an entry currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Mru,
    Mfu,
    Mrug,
    Mfug,
    Unlinked,
}

pub(crate) struct EntryGuts<V> {
    pub(crate) state: EntryState,
    pub(crate) size: usize,
    pub(crate) payload: Option<V>,
    pub(crate) is_async: bool,
}

/// A single cached key, shared between the index, whichever list it
/// occupies, and any outstanding handles returned by `lookup`.
///
/// There is no explicit refcount field: entry lifetime is `Arc`'s strong
/// count, and the final drop runs `destroy` on any payload still present.
pub struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) guts: Mutex<EntryGuts<V>>,
    pub(crate) store: Arc<dyn BackingStore<K, V>>,
}

impl<K, V> Entry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Current accounted size, or 0 for an entry with no payload.
    pub fn size(&self) -> usize {
        self.guts.lock().unwrap().size
    }

    /// A clone of the current payload, if any is resident.
    pub fn value(&self) -> Option<V>
    where
        V: Clone,
    {
        self.guts.lock().unwrap().payload.clone()
    }

    pub fn state(&self) -> EntryState {
        self.guts.lock().unwrap().state
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        let mut guts = self.guts.lock().unwrap();
        if let Some(payload) = guts.payload.take() {
            self.store.destroy(&self.key, payload);
        }
    }
}
