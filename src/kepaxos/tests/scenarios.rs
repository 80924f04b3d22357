use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use shardcache_common::{InMemoryLog, ReplicatedLog, Result};
use shardcache_kepaxos::{EngineCallbacks, KePaxosEngine, MessageType, WireMessage};

const NAMES: [&str; 5] = ["node1", "node2", "node3", "node4", "node5"];
const SHORT_TIMEOUT: Duration = Duration::from_millis(200);
const SETTLE: Duration = Duration::from_millis(400);

struct NodeCallbacks {
    peers_tx: HashMap<String, Sender<Vec<u8>>>,
    sent: Arc<AtomicUsize>,
    committed: Arc<AtomicUsize>,
    /// Filled in once every engine exists, so `recover` can reach straight
    /// into the named peer rather than round-tripping over the wire.
    engines: Arc<Mutex<HashMap<String, Arc<KePaxosEngine>>>>,
}

impl EngineCallbacks for NodeCallbacks {
    fn send(&self, recipients: &[String], message: &[u8]) -> Result<()> {
        use rand::seq::SliceRandom;
        let mut order: Vec<&String> = recipients.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        for recipient in order {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = self.peers_tx.get(recipient) {
                let _ = tx.send(message.to_vec());
            }
        }
        Ok(())
    }

    fn commit(&self, _ctype: u8, _key: &[u8], _data: &[u8], _leader: bool) -> Result<()> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recover(&self, peer: &str, key: &[u8], seq: u64, ballot: u64) -> Result<()> {
        if let Some(engine) = self.engines.lock().unwrap().get(peer) {
            engine.recovered(key, ballot, seq);
        }
        Ok(())
    }
}

/// A five-node loopback network wired the way `kepaxos_test.c`'s
/// `send_callback` wires its nodes: each node has an inbox, a live
/// dispatcher thread, and an online/offline switch that gates whether
/// its dispatcher processes what lands there.
struct Harness {
    engines: Vec<Arc<KePaxosEngine>>,
    logs: Vec<Arc<InMemoryLog>>,
    online: Vec<Arc<AtomicBool>>,
    callbacks: Vec<Arc<NodeCallbacks>>,
    sent: Arc<AtomicUsize>,
    committed: Arc<AtomicUsize>,
}

impl Harness {
    fn new(timeout: Duration) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for name in NAMES {
            let (tx, rx) = channel::<Vec<u8>>();
            senders.insert(name.to_string(), tx);
            receivers.push(rx);
        }

        let sent = Arc::new(AtomicUsize::new(0));
        let committed = Arc::new(AtomicUsize::new(0));
        let online: Vec<Arc<AtomicBool>> =
            (0..NAMES.len()).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let engine_registry: Arc<Mutex<HashMap<String, Arc<KePaxosEngine>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut engines = Vec::new();
        let mut logs = Vec::new();
        let mut callbacks_list = Vec::new();
        for index in 0..NAMES.len() {
            let log = Arc::new(InMemoryLog::new());
            let callbacks = Arc::new(NodeCallbacks {
                peers_tx: senders.clone(),
                sent: sent.clone(),
                committed: committed.clone(),
                engines: engine_registry.clone(),
            });
            let engine = Arc::new(KePaxosEngine::with_timeout(
                NAMES.iter().map(|s| s.to_string()).collect(),
                index,
                log.clone() as Arc<dyn ReplicatedLog>,
                callbacks.clone(),
                timeout,
            ));
            logs.push(log);
            callbacks_list.push(callbacks);
            engines.push(engine);
        }

        {
            let mut registry = engine_registry.lock().unwrap();
            for (name, engine) in NAMES.iter().zip(engines.iter()) {
                registry.insert(name.to_string(), engine.clone());
            }
        }

        for (index, rx) in receivers.into_iter().enumerate() {
            let engine = engines[index].clone();
            let my_online = online[index].clone();
            let peers_tx = senders.clone();
            thread::spawn(move || {
                for bytes in rx {
                    if !my_online.load(Ordering::SeqCst) {
                        continue;
                    }
                    let Some(parsed) = WireMessage::decode(&bytes) else {
                        continue;
                    };
                    match parsed.mtype {
                        MessageType::PreAcceptResponse | MessageType::AcceptResponse => {
                            let _ = engine.received_response(&bytes);
                        }
                        _ => {
                            if let Ok(Some(response)) = engine.received_command(&bytes) {
                                if let Some(tx) = peers_tx.get(&parsed.sender) {
                                    let _ = tx.send(response);
                                }
                            }
                        }
                    }
                }
            });
        }

        Self {
            engines,
            logs,
            online,
            callbacks: callbacks_list,
            sent,
            committed,
        }
    }

    fn set_online(&self, index: usize, is_online: bool) {
        self.online[index].store(is_online, Ordering::SeqCst);
    }

    fn all_online(&self) {
        for flag in &self.online {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn logs_agree(&self, indices: &[usize], key: &[u8]) -> bool {
        let first = self.logs[indices[0]].last_seq_for_key(key);
        indices
            .iter()
            .all(|&i| self.logs[i].last_seq_for_key(key) == first)
    }
}

#[test]
fn s1_single_replica_online_broadcasts_and_times_out() {
    let harness = Harness::new(SHORT_TIMEOUT);
    harness.set_online(0, true);

    let result = harness.engines[0].run_command(1, b"orphan-key", b"v1");

    assert!(result.is_err(), "no peer can respond, so the leader must time out");
    assert_eq!(
        harness.sent.load(Ordering::SeqCst),
        NAMES.len() - 1,
        "the leader still broadcasts PreAccept to every other replica"
    );
}

#[test]
fn s2_all_online_commits_and_converges() {
    let harness = Harness::new(SHORT_TIMEOUT);
    harness.all_online();

    let result = harness.engines[0].run_command(1, b"shared-key", b"v1");
    assert!(result.is_ok(), "a full quorum should always commit");
    thread::sleep(SETTLE);

    assert!(harness.logs_agree(&[0, 1, 2, 3, 4], b"shared-key"));
    assert_eq!(harness.logs[0].last_seq_for_key(b"shared-key").0, 1);
    assert!(harness.committed.load(Ordering::SeqCst) >= 1);
}

#[test]
fn s3_minority_offline_leader_still_commits() {
    let harness = Harness::new(SHORT_TIMEOUT);
    harness.all_online();
    harness.set_online(3, false);
    harness.set_online(4, false);

    let result = harness.engines[0].run_command(1, b"quorum-key", b"v1");
    assert!(result.is_ok(), "three online replicas out of five still form a majority");
    thread::sleep(SETTLE);

    assert!(harness.logs_agree(&[0, 1, 2], b"quorum-key"));
    assert_eq!(
        harness.logs[3].last_seq_for_key(b"quorum-key"),
        (0, 0),
        "an offline replica never observes the commit"
    );
}

#[test]
fn s4_majority_offline_blocks_progress() {
    let harness = Harness::new(SHORT_TIMEOUT);
    harness.set_online(0, true);
    harness.set_online(1, true);
    harness.set_online(2, false);
    harness.set_online(3, false);
    harness.set_online(4, false);

    let result = harness.engines[0].run_command(1, b"stuck-key", b"v1");
    assert!(result.is_err(), "two online replicas out of five cannot reach a majority");
    assert_eq!(
        harness.committed.load(Ordering::SeqCst),
        0,
        "a minority cannot commit anything"
    );
}

#[test]
fn s5_concurrent_commands_on_same_key_converge() {
    let harness = Harness::new(Duration::from_millis(500));
    harness.all_online();

    let engine = harness.engines[0].clone();
    let writer_a = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 0..5 {
                let _ = engine.run_command(1, b"hot-key", format!("a{i}").as_bytes());
            }
        })
    };
    let writer_b = thread::spawn(move || {
        for i in 0..5 {
            let _ = engine.run_command(1, b"hot-key", format!("b{i}").as_bytes());
        }
    });
    writer_a.join().unwrap();
    writer_b.join().unwrap();
    thread::sleep(SETTLE);

    assert!(harness.logs_agree(&[0, 1, 2, 3, 4], b"hot-key"));
    assert!(harness.logs[0].last_seq_for_key(b"hot-key").0 >= 5);
}

#[test]
fn s6_rejoining_replica_converges_via_recovery() {
    let harness = Harness::new(SHORT_TIMEOUT);
    harness.set_online(0, true);
    harness.set_online(1, true);
    harness.set_online(2, true);
    harness.set_online(3, false);
    harness.set_online(4, false);

    let result = harness.engines[0].run_command(1, b"laggard-key", b"v1");
    assert!(result.is_ok(), "three online replicas out of five still form a majority");
    thread::sleep(SETTLE);

    assert!(harness.logs_agree(&[0, 1, 2], b"laggard-key"));
    assert_eq!(
        harness.logs[3].last_seq_for_key(b"laggard-key"),
        (0, 0),
        "node4 missed the commit while offline"
    );

    // node4 rejoins, but it is still behind until something drives recovery
    // for the key it missed. The leader's recover callback is what a real
    // owner-mismatch or stalled-expirer path would invoke; exercise it
    // directly here the way those paths do, against the now-online laggard.
    harness.set_online(3, true);
    let (seq, ballot) = harness.logs[0].last_seq_for_key(b"laggard-key");
    harness.callbacks[0]
        .recover(NAMES[3], b"laggard-key", seq, ballot)
        .unwrap();

    assert_eq!(
        harness.logs[3].last_seq_for_key(b"laggard-key"),
        (seq, ballot),
        "the rejoined replica adopts the leader's seq/ballot once recovered() runs"
    );
}
