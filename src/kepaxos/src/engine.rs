use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;

use shardcache_common::{LogEntry, ReplicatedLog, Result, ShardCacheError};

use crate::ballot::{ballot_replica, ballot_value, AtomicBallot};
use crate::callbacks::EngineCallbacks;
use crate::command::{Command, CommandSlot, CommandStatus, Vote};
use crate::message::{MessageType, WireMessage};

const EXPIRER_TICK: Duration = Duration::from_millis(50);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    peers: Vec<String>,
    my_index: u8,
    log: Arc<dyn ReplicatedLog>,
    callbacks: Arc<dyn EngineCallbacks>,
    ballot: AtomicBallot,
    commands: Mutex<HashMap<Vec<u8>, Arc<CommandSlot>>>,
    timeout: Duration,
    shutdown: AtomicBool,
}

impl Inner {
    fn num_peers(&self) -> usize {
        self.peers.len()
    }

    fn other_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .enumerate()
            .filter(|&(i, _)| i as u8 != self.my_index)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn update_ballot(&self, observed: u64) {
        self.ballot.update(observed, self.my_index);
    }

    fn remove_command(&self, key: &[u8], slot: &Arc<CommandSlot>) {
        let mut commands = self.commands.lock().unwrap();
        if let Some(existing) = commands.get(key) {
            if Arc::ptr_eq(existing, slot) {
                commands.remove(key);
            }
        }
    }

    fn run_command(&self, ctype: u8, key: &[u8], data: &[u8]) -> Result<()> {
        let (last_seq, _) = self.log.last_seq_for_key(key);
        let mut seq = last_seq + 1;

        let slot = {
            let mut commands = self.commands.lock().unwrap();
            if let Some(prev) = commands.get(key) {
                let mut prev_cmd = prev.command.lock().unwrap();
                if prev_cmd.seq >= seq {
                    seq = prev_cmd.seq + 1;
                }
                prev_cmd.status = CommandStatus::Superseded;
                drop(prev_cmd);
                prev.condvar.notify_all();
            }
            let slot = Arc::new(CommandSlot {
                command: Mutex::new(Command {
                    ctype,
                    status: CommandStatus::PreAccepted,
                    key: key.to_vec(),
                    data: data.to_vec(),
                    seq,
                    ballot: self.ballot.load(),
                    votes: Vec::new(),
                    max_seq: seq,
                    max_seq_committed: false,
                    timestamp: Instant::now(),
                    timeout: self.timeout,
                }),
                condvar: std::sync::Condvar::new(),
            });
            commands.insert(key.to_vec(), slot.clone());
            slot
        };

        let ballot = slot.command.lock().unwrap().ballot;
        let message = WireMessage {
            sender: self.peers[self.my_index as usize].clone(),
            ballot,
            seq,
            mtype: MessageType::PreAccept,
            ctype,
            committed: false,
            key: key.to_vec(),
            data: data.to_vec(),
        }
        .encode();
        let _ = self.callbacks.send(&self.other_peers(), &message);

        let cmd_guard = slot.command.lock().unwrap();
        let (final_guard, _timeout_result) = slot
            .condvar
            .wait_timeout_while(cmd_guard, self.timeout, |cmd| {
                cmd.status != CommandStatus::Committed && cmd.status != CommandStatus::Superseded
            })
            .unwrap();
        let superseded = final_guard.status == CommandStatus::Superseded;
        drop(final_guard);

        self.remove_command(key, &slot);

        if superseded {
            return Err(ShardCacheError::Conflict);
        }

        let (final_seq, _) = self.log.last_seq_for_key(key);
        if final_seq >= seq {
            Ok(())
        } else {
            Err(ShardCacheError::Timeout)
        }
    }

    fn received_command(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let msg = WireMessage::decode(bytes)
            .ok_or_else(|| ShardCacheError::Protocol("malformed command message".into()))?;
        self.update_ballot(msg.ballot);
        let response = match msg.mtype {
            MessageType::PreAccept => self.handle_preaccept(&msg),
            MessageType::Accept => self.handle_accept(&msg),
            MessageType::Commit => {
                self.handle_commit(&msg);
                None
            }
            MessageType::PreAcceptResponse | MessageType::AcceptResponse => None,
        };
        Ok(response.map(|m| m.encode()))
    }

    fn received_response(&self, bytes: &[u8]) -> Result<()> {
        let msg = WireMessage::decode(bytes)
            .ok_or_else(|| ShardCacheError::Protocol("malformed response message".into()))?;
        self.update_ballot(msg.ballot);
        match msg.mtype {
            MessageType::PreAcceptResponse => self.handle_preaccept_response(&msg),
            MessageType::AcceptResponse => self.handle_accept_response(&msg),
            _ => {}
        }
        Ok(())
    }

    fn handle_preaccept(&self, msg: &WireMessage) -> Option<WireMessage> {
        let key = &msg.key;
        let (local_seq, local_ballot) = self.log.last_seq_for_key(key);
        if local_seq == msg.seq && local_ballot == msg.ballot {
            return None;
        }

        let (existed, slot) = {
            let mut commands = self.commands.lock().unwrap();
            let existed = commands.contains_key(key);
            let slot = commands
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(CommandSlot {
                        command: Mutex::new(Command::placeholder(msg, self.timeout)),
                        condvar: std::sync::Condvar::new(),
                    })
                })
                .clone();
            (existed, slot)
        };

        let mut interfering: u64 = 0;
        let mut cmd = slot.command.lock().unwrap();
        if existed {
            if msg.ballot < cmd.ballot {
                return None;
            }
            cmd.ballot = cmd.ballot.max(msg.ballot);
            interfering = cmd.seq;
        }
        interfering = interfering.max(local_seq);
        let max_seq = msg.seq.max(interfering);

        if msg.seq >= interfering {
            if cmd.status == CommandStatus::Accepted {
                let owner = ballot_replica(cmd.ballot);
                if owner != self.my_index {
                    let peer = self.peers[owner as usize].clone();
                    let (k, s, b) = (cmd.key.clone(), cmd.seq, cmd.ballot);
                    drop(cmd);
                    if let Err(e) = self.callbacks.recover(&peer, &k, s, b) {
                        warn!("recover callback failed for key {:?}: {}", k, e);
                    }
                    cmd = slot.command.lock().unwrap();
                }
            }
            cmd.status = CommandStatus::PreAccepted;
            cmd.seq = interfering;
        }

        let committed = max_seq == local_seq;
        Some(WireMessage {
            sender: self.peers[self.my_index as usize].clone(),
            ballot: cmd.ballot,
            seq: max_seq,
            mtype: MessageType::PreAcceptResponse,
            ctype: cmd.ctype,
            committed,
            key: key.clone(),
            data: Vec::new(),
        })
    }

    fn handle_accept(&self, msg: &WireMessage) -> Option<WireMessage> {
        let key = &msg.key;
        let (local_seq, _local_ballot) = self.log.last_seq_for_key(key);

        let (existed, slot) = {
            let mut commands = self.commands.lock().unwrap();
            let existed = commands.contains_key(key);
            let slot = commands
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(CommandSlot {
                        command: Mutex::new(Command::placeholder(msg, self.timeout)),
                        condvar: std::sync::Condvar::new(),
                    })
                })
                .clone();
            (existed, slot)
        };

        let mut cmd = slot.command.lock().unwrap();
        if existed && msg.ballot < cmd.ballot {
            return None;
        }
        if msg.seq >= cmd.seq {
            cmd.ballot = msg.ballot;
            cmd.seq = msg.seq;
            cmd.status = CommandStatus::Accepted;
            cmd.timestamp = Instant::now();
        }

        let committed = cmd.seq == local_seq;
        Some(WireMessage {
            sender: self.peers[self.my_index as usize].clone(),
            ballot: cmd.ballot,
            seq: cmd.seq,
            mtype: MessageType::AcceptResponse,
            ctype: cmd.ctype,
            committed,
            key: key.clone(),
            data: Vec::new(),
        })
    }

    fn handle_commit(&self, msg: &WireMessage) {
        let key = &msg.key;
        let (local_seq, _) = self.log.last_seq_for_key(key);

        let slot = {
            let commands = self.commands.lock().unwrap();
            commands.get(key).cloned()
        };

        if let Some(slot) = &slot {
            let cmd = slot.command.lock().unwrap();
            if cmd.seq == msg.seq && cmd.ballot > msg.ballot {
                return;
            }
        }
        if msg.seq < local_seq {
            return;
        }

        if let Err(e) = self.callbacks.commit(msg.ctype, key, &msg.data, false) {
            warn!("commit callback failed for key {:?}: {}", key, e);
            return;
        }
        self.log.set_last_seq_for_key(key, msg.ballot, msg.seq);

        if let Some(slot) = slot {
            let should_remove = slot.command.lock().unwrap().seq <= msg.seq;
            if should_remove {
                self.remove_command(key, &slot);
                slot.condvar.notify_all();
            }
        }
    }

    fn send_accept(&self, cmd: &Command, key: &[u8]) {
        let message = WireMessage {
            sender: self.peers[self.my_index as usize].clone(),
            ballot: cmd.ballot,
            seq: cmd.seq,
            mtype: MessageType::Accept,
            ctype: cmd.ctype,
            committed: false,
            key: key.to_vec(),
            data: cmd.data.clone(),
        }
        .encode();
        let _ = self.callbacks.send(&self.other_peers(), &message);
    }

    fn handle_preaccept_response(&self, msg: &WireMessage) {
        let key = msg.key.clone();
        let slot = {
            let commands = self.commands.lock().unwrap();
            commands.get(&key).cloned()
        };
        let Some(slot) = slot else { return };

        let mut cmd = slot.command.lock().unwrap();
        if cmd.status != CommandStatus::PreAccepted || msg.ballot < cmd.ballot {
            return;
        }

        cmd.votes.push(Vote {
            peer: msg.sender.clone(),
            seq: msg.seq,
            ballot: msg.ballot,
            committed: msg.committed,
        });
        if msg.seq >= cmd.max_seq {
            cmd.max_seq = msg.seq;
            cmd.max_seq_committed = msg.committed;
        }

        if cmd.votes.len() < self.num_peers() / 2 {
            return;
        }

        let fast_path = cmd.seq > cmd.max_seq || (cmd.seq == cmd.max_seq && !cmd.max_seq_committed);
        if fast_path {
            drop(cmd);
            self.remove_command(&key, &slot);
            self.commit_as_leader(&slot, &key);
            return;
        }

        cmd.seq = cmd.max_seq + 1;
        cmd.votes.clear();
        cmd.ballot = self.ballot.load();
        cmd.status = CommandStatus::Accepted;
        self.send_accept(&cmd, &key);
    }

    fn handle_accept_response(&self, msg: &WireMessage) {
        let key = msg.key.clone();
        let slot = {
            let commands = self.commands.lock().unwrap();
            commands.get(&key).cloned()
        };
        let Some(slot) = slot else { return };

        let mut cmd = slot.command.lock().unwrap();
        if cmd.status != CommandStatus::Accepted {
            return;
        }

        if msg.committed && msg.seq == cmd.seq {
            cmd.seq += 1;
            cmd.ballot = self.ballot.load();
            cmd.votes.clear();
            self.send_accept(&cmd, &key);
            return;
        }

        cmd.votes.push(Vote {
            peer: msg.sender.clone(),
            seq: msg.seq,
            ballot: msg.ballot,
            committed: msg.committed,
        });

        let majority = self.num_peers() / 2 + 1;
        let matching = cmd
            .votes
            .iter()
            .filter(|v| v.seq == cmd.seq && v.ballot == cmd.ballot)
            .count();

        if matching >= majority {
            drop(cmd);
            self.remove_command(&key, &slot);
            self.commit_as_leader(&slot, &key);
            return;
        }

        if cmd.votes.len() >= majority {
            cmd.seq += 1;
            cmd.ballot = self.ballot.load();
            cmd.votes.clear();
            self.send_accept(&cmd, &key);
        }
    }

    fn commit_as_leader(&self, slot: &Arc<CommandSlot>, key: &[u8]) {
        let (ctype, data, ballot, seq) = {
            let cmd = slot.command.lock().unwrap();
            (cmd.ctype, cmd.data.clone(), cmd.ballot, cmd.seq)
        };
        if let Err(e) = self.callbacks.commit(ctype, key, &data, true) {
            warn!("leader commit callback failed for key {:?}: {}", key, e);
            return;
        }
        self.log.set_last_seq_for_key(key, ballot, seq);

        let message = WireMessage {
            sender: self.peers[self.my_index as usize].clone(),
            ballot,
            seq,
            mtype: MessageType::Commit,
            ctype,
            committed: true,
            key: key.to_vec(),
            data,
        }
        .encode();
        let _ = self.callbacks.send(&self.other_peers(), &message);

        slot.command.lock().unwrap().status = CommandStatus::Committed;
        slot.condvar.notify_all();
    }

    fn recovered(&self, key: &[u8], ballot: u64, seq: u64) {
        let (local_seq, local_ballot) = self.log.last_seq_for_key(key);
        if seq > local_seq || (seq == local_seq && ballot > local_ballot) {
            self.log.set_last_seq_for_key(key, ballot, seq);
        }

        let slot = {
            let commands = self.commands.lock().unwrap();
            commands.get(key).cloned()
        };
        if let Some(slot) = slot {
            let should_remove = slot.command.lock().unwrap().seq <= seq;
            if should_remove {
                self.remove_command(key, &slot);
                slot.condvar.notify_all();
            }
        }
    }

    fn expirer_tick(self: &Arc<Self>) {
        let now = Instant::now();
        let mut to_remove: Vec<Vec<u8>> = Vec::new();
        let mut to_recover: Vec<(String, Vec<u8>, u64, u64)> = Vec::new();

        {
            let commands = self.commands.lock().unwrap();
            for (key, slot) in commands.iter() {
                let cmd = slot.command.lock().unwrap();
                if now.duration_since(cmd.timestamp) < cmd.timeout {
                    continue;
                }
                if matches!(cmd.status, CommandStatus::PreAccepted | CommandStatus::Accepted) {
                    let owner = ballot_replica(cmd.ballot);
                    if owner != self.my_index {
                        to_recover.push((
                            self.peers[owner as usize].clone(),
                            key.clone(),
                            cmd.seq,
                            cmd.ballot,
                        ));
                    }
                }
                to_remove.push(key.clone());
            }
        }

        for (peer, key, seq, ballot) in &to_recover {
            if let Err(e) = self.callbacks.recover(peer, key, *seq, *ballot) {
                warn!("recover callback failed for key {:?}: {}", key, e);
            }
        }

        if !to_remove.is_empty() {
            let mut commands = self.commands.lock().unwrap();
            for key in to_remove {
                if let Some(slot) = commands.remove(&key) {
                    slot.condvar.notify_all();
                }
            }
        }
    }
}

/// A single-key-at-a-time consensus engine run by one replica among a
/// fixed peer set. Driven externally by a transport layer that feeds
/// [`KePaxosEngine::received_command`] and
/// [`KePaxosEngine::received_response`] with bytes off the wire.
pub struct KePaxosEngine {
    inner: Arc<Inner>,
    expirer: Mutex<Option<JoinHandle<()>>>,
}

impl KePaxosEngine {
    pub fn new(
        peers: Vec<String>,
        my_index: usize,
        log: Arc<dyn ReplicatedLog>,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> Self {
        Self::with_timeout(peers, my_index, log, callbacks, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        peers: Vec<String>,
        my_index: usize,
        log: Arc<dyn ReplicatedLog>,
        callbacks: Arc<dyn EngineCallbacks>,
        timeout: Duration,
    ) -> Self {
        let ballot = AtomicBallot::new(0);
        ballot.update(log.max_ballot(), my_index as u8);

        let inner = Arc::new(Inner {
            peers,
            my_index: my_index as u8,
            log,
            callbacks,
            ballot,
            commands: Mutex::new(HashMap::new()),
            timeout,
            shutdown: AtomicBool::new(false),
        });

        let expirer_inner = inner.clone();
        let expirer = thread::spawn(move || loop {
            thread::sleep(EXPIRER_TICK);
            if expirer_inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            expirer_inner.expirer_tick();
        });

        Self {
            inner,
            expirer: Mutex::new(Some(expirer)),
        }
    }

    /// Drives a mutation to commit as the leader replica for this call.
    /// Blocks until committed or the default timeout elapses.
    pub fn run_command(&self, ctype: u8, key: &[u8], data: &[u8]) -> Result<()> {
        self.inner.run_command(ctype, key, data)
    }

    /// Feeds an inbound PreAccept/Accept/Commit message to the engine,
    /// returning the response bytes to send back to the sender, if any.
    pub fn received_command(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.received_command(bytes)
    }

    /// Feeds an inbound PreAcceptResponse/AcceptResponse back to the
    /// leader's side of the state machine.
    pub fn received_response(&self, bytes: &[u8]) -> Result<()> {
        self.inner.received_response(bytes)
    }

    /// Reports the result of an out-of-band recovery query for `key`.
    pub fn recovered(&self, key: &[u8], ballot: u64, seq: u64) {
        self.inner.recovered(key, ballot, seq)
    }

    pub fn ballot(&self) -> u64 {
        self.inner.ballot.load()
    }

    pub fn seq(&self, key: &[u8]) -> u64 {
        self.inner.log.last_seq_for_key(key).0
    }

    /// Returns log entries committed at a higher ballot than `ballot`,
    /// or `None` if `ballot` is already current.
    pub fn diff_since(&self, ballot: u64) -> Option<Vec<LogEntry>> {
        if ballot_value(ballot) >= ballot_value(self.inner.log.max_ballot()) {
            return None;
        }
        Some(self.inner.log.diff_from_ballot(ballot))
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.expirer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KePaxosEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
