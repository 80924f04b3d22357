use std::collections::HashMap;
use std::sync::Mutex;

/// One row of the persisted per-key ballot/sequence log, as returned by
/// [`ReplicatedLog::diff_from_ballot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub ballot: u64,
    pub seq: u64,
}

/// The persisted mapping `key -> (ballot, seq)` that backs a KePaxos engine.
///
/// Durability is the implementor's responsibility; the engine assumes a
/// write is visible to subsequent reads as soon as the setter returns.
pub trait ReplicatedLog: Send + Sync {
    /// Last committed `(seq, ballot)` for `key`, or `(0, 0)` if unknown.
    fn last_seq_for_key(&self, key: &[u8]) -> (u64, u64);

    /// Record `(ballot, seq)` as the latest committed state for `key`.
    fn set_last_seq_for_key(&self, key: &[u8], ballot: u64, seq: u64);

    /// The highest ballot ever recorded across all keys.
    fn max_ballot(&self) -> u64;

    /// Every key whose recorded ballot exceeds `ballot`, used by recovery.
    fn diff_from_ballot(&self, ballot: u64) -> Vec<LogEntry>;
}

/// A reference `ReplicatedLog` backed by an in-process hash map.
///
/// Stands in for the durable log a real deployment would persist to disk;
/// loses its contents on process exit, which is fine for tests and for
/// embedding scenarios that supply their own durable implementation.
#[derive(Default)]
pub struct InMemoryLog {
    rows: Mutex<HashMap<Vec<u8>, (u64, u64)>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl ReplicatedLog for InMemoryLog {
    fn last_seq_for_key(&self, key: &[u8]) -> (u64, u64) {
        let rows = self.rows.lock().unwrap();
        match rows.get(key) {
            Some(&(ballot, seq)) => (seq, ballot),
            None => (0, 0),
        }
    }

    fn set_last_seq_for_key(&self, key: &[u8], ballot: u64, seq: u64) {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(key.to_vec(), (ballot, seq));
    }

    fn max_ballot(&self) -> u64 {
        let rows = self.rows.lock().unwrap();
        rows.values().map(|&(ballot, _)| ballot).max().unwrap_or(0)
    }

    fn diff_from_ballot(&self, ballot: u64) -> Vec<LogEntry> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .filter(|&(_, &(b, _))| b > ballot)
            .map(|(key, &(ballot, seq))| LogEntry {
                key: key.clone(),
                ballot,
                seq,
            })
            .collect()
    }
}
