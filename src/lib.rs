//! Facade crate re-exporting the adaptive replacement cache and the
//! key-based egalitarian Paxos replication engine as a single dependency.

pub use shardcache_arc as arc;
pub use shardcache_common as common;
pub use shardcache_kepaxos as kepaxos;

pub use shardcache_arc::{ArcCache, BackingStore, Entry, EntryState, FetchResult};
pub use shardcache_common::{LogEntry, ReplicatedLog, Result, ShardCacheError};
pub use shardcache_kepaxos::{EngineCallbacks, KePaxosEngine};
