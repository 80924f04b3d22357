use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::message::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    PreAccepted,
    Accepted,
    Committed,
    /// A later command for the same key took over this slot before this
    /// one committed. Callers blocked on it wake immediately instead of
    /// sleeping out the remainder of the timeout.
    Superseded,
}

#[derive(Debug, Clone)]
pub(crate) struct Vote {
    pub peer: String,
    pub seq: u64,
    pub ballot: u64,
    pub committed: bool,
}

/// Per-key in-flight state for a single command. Every field maps onto
/// the per-key bookkeeping a replica keeps while a mutation is still
/// working its way through PreAccept/Accept/Commit.
pub(crate) struct Command {
    pub ctype: u8,
    pub status: CommandStatus,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub seq: u64,
    pub ballot: u64,
    pub votes: Vec<Vote>,
    pub max_seq: u64,
    pub max_seq_committed: bool,
    pub timestamp: Instant,
    pub timeout: Duration,
}

impl Command {
    pub(crate) fn placeholder(msg: &WireMessage, timeout: Duration) -> Self {
        Command {
            ctype: msg.ctype,
            status: CommandStatus::PreAccepted,
            key: msg.key.clone(),
            data: msg.data.clone(),
            seq: msg.seq,
            ballot: msg.ballot,
            votes: Vec::new(),
            max_seq: msg.seq,
            max_seq_committed: false,
            timestamp: Instant::now(),
            timeout,
        }
    }
}

/// A command plus the condition variable waiters block on until it
/// reaches `Committed` or is superseded and dropped.
pub(crate) struct CommandSlot {
    pub command: Mutex<Command>,
    pub condvar: Condvar,
}
