pub mod cache;
pub mod entry;
pub mod store;

pub use cache::ArcCache;
pub use entry::{Entry, EntryState};
pub use store::{BackingStore, FetchResult, MapBackingStore};
