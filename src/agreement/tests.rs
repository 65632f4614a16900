//! End-to-end exercises of whole engines over the in-process network.
//!
//! Deterministic scenarios drive `run_once` by hand from the test thread;
//! scenarios involving fault rounds or recovery run each engine on its own
//! thread, the way production does, and observe progress through shared
//! applied-transaction logs.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::agreement::engine::{AgreementEngine, EngineConfig};
use crate::agreement::message::Message;
use crate::errors::FatalError;
use crate::mailbox::ClusterNetwork;
use crate::statemachine::directory::DirectoryOp;
use crate::statemachine::{DirectoryStore, RestoreError, StateMachine};
use crate::{NodeId, TxnId, UNSET_TXN_ID};

/// Directory store that additionally logs every applied txn id, so tests
/// can compare release order across nodes and watch progress from outside
/// an engine thread.
struct RecordingStore {
    dir: DirectoryStore,
    applied: Arc<Mutex<Vec<TxnId>>>,
}

impl RecordingStore {
    fn new() -> (Self, Arc<Mutex<Vec<TxnId>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                dir: DirectoryStore::new(),
                applied: Arc::clone(&applied),
            },
            applied,
        )
    }
}

impl StateMachine for RecordingStore {
    fn apply(&mut self, payload: &[u8], txn_id: TxnId) {
        self.applied.lock().unwrap().push(txn_id);
        self.dir.apply(payload, txn_id);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.dir.snapshot()
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), RestoreError> {
        self.dir.restore(bytes)
    }

    fn close_sessions(&mut self, owner: NodeId) {
        self.dir.close_sessions(owner);
    }
}

fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(site: NodeId, sites: &BTreeSet<NodeId>) -> EngineConfig {
    EngineConfig {
        site_id: site,
        sites: sites.clone(),
        failed: BTreeSet::new(),
        recovering: false,
        heartbeat_interval: Duration::from_millis(1),
        recv_timeout: Duration::from_millis(1),
    }
}

fn tid(seq: u64, initiator: NodeId) -> TxnId {
    (seq << 24) | u64::from(initiator)
}

fn dir_op(op: &DirectoryOp) -> Vec<u8> {
    bincode::serialize(op).unwrap()
}

fn step(engines: &mut [&mut AgreementEngine<RecordingStore>], iterations: usize) {
    for _ in 0..iterations {
        for engine in engines.iter_mut() {
            engine.run_once().unwrap();
        }
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn three_nodes_release_the_same_order() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);
    let build = |site| {
        let (store, applied) = RecordingStore::new();
        let engine = AgreementEngine::new(config(site, &sites), net.endpoint(site), store);
        (engine, applied)
    };
    let (mut e1, a1) = build(1);
    let (mut e2, a2) = build(2);
    let (mut e3, a3) = build(3);

    e1.submit(dir_op(&DirectoryOp::OpenSession { session: 1, owner: 1 }));
    e2.submit(dir_op(&DirectoryOp::CreateNode {
        path: "/config".into(),
        data: b"v1".to_vec(),
        ephemeral: None,
    }));
    e3.submit(dir_op(&DirectoryOp::CreateNode {
        path: "/members".into(),
        data: vec![],
        ephemeral: None,
    }));

    let mut spins = 0;
    while a1.lock().unwrap().len() < 3
        || a2.lock().unwrap().len() < 3
        || a3.lock().unwrap().len() < 3
    {
        step(&mut [&mut e1, &mut e2, &mut e3], 10);
        spins += 1;
        assert!(spins < 500, "cluster never converged");
    }

    let order1 = a1.lock().unwrap().clone();
    assert_eq!(order1.len(), 3);
    assert_eq!(order1, *a2.lock().unwrap());
    assert_eq!(order1, *a3.lock().unwrap());
    assert!(order1.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(e1.store().dir, e2.store().dir);
    assert_eq!(e1.store().dir, e3.store().dir);
}

#[test]
fn random_submission_bursts_still_converge() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);
    let build = |site| {
        let (store, applied) = RecordingStore::new();
        let engine = AgreementEngine::new(config(site, &sites), net.endpoint(site), store);
        (engine, applied)
    };
    let (mut e1, a1) = build(1);
    let (mut e2, a2) = build(2);
    let (mut e3, a3) = build(3);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let total = 12;
    for i in 0..total {
        let op = dir_op(&DirectoryOp::CreateNode {
            path: format!("/r{i}"),
            data: vec![rng.gen()],
            ephemeral: None,
        });
        match rng.gen_range(0..3) {
            0 => e1.submit(op),
            1 => e2.submit(op),
            _ => e3.submit(op),
        }
        // Interleave delivery with submission so bursts overlap in flight.
        step(&mut [&mut e1, &mut e2, &mut e3], rng.gen_range(0..3));
    }

    let mut spins = 0;
    while a1.lock().unwrap().len() < total
        || a2.lock().unwrap().len() < total
        || a3.lock().unwrap().len() < total
    {
        step(&mut [&mut e1, &mut e2, &mut e3], 10);
        spins += 1;
        assert!(spins < 500, "cluster never converged");
    }

    assert_eq!(*a1.lock().unwrap(), *a2.lock().unwrap());
    assert_eq!(*a1.lock().unwrap(), *a3.lock().unwrap());
    assert_eq!(e1.store().dir, e2.store().dir);
    assert_eq!(e1.store().dir, e3.store().dir);
}

#[test]
fn duplicate_transaction_is_applied_once() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2]);
    let net = ClusterNetwork::new(&sites);
    let (store, applied) = RecordingStore::new();
    let mut e1 = AgreementEngine::new(config(1, &sites), net.endpoint(1), store);
    let peer = net.endpoint(2);

    let t = tid(5, 2);
    let txn = Message::Transaction {
        initiator: 2,
        txn_id: t,
        last_safe_txn_id: UNSET_TXN_ID,
        payload: dir_op(&DirectoryOp::CreateNode {
            path: "/x".into(),
            data: vec![],
            ephemeral: None,
        }),
    };
    peer.send(1, &txn).unwrap();
    peer.send(
        1,
        &Message::Heartbeat {
            sender: 2,
            txn_id: tid(9, 2),
            last_safe_txn_id: t,
        },
    )
    .unwrap();
    step(&mut [&mut e1], 30);
    assert_eq!(*applied.lock().unwrap(), vec![t]);

    // The same transaction again, e.g. from a recovery replay.
    peer.send(1, &txn).unwrap();
    step(&mut [&mut e1], 10);
    assert_eq!(*applied.lock().unwrap(), vec![t]);
    assert_eq!(e1.store().dir.node_count(), 1);
}

#[test]
fn fault_round_discards_only_past_the_agreed_point() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);
    let (store, applied) = RecordingStore::new();
    let mut e1 = AgreementEngine::new(config(1, &sites), net.endpoint(1), store);
    let (fault_tx, fault_rx) = unbounded();
    e1.set_fault_events(fault_tx);
    let peer = net.endpoint(2);

    let t1 = tid(5, 3);
    let t2 = tid(7, 3);
    let t3 = tid(9, 3);

    // Site 3's stream as this node saw it before the failure: t1 known
    // safe, t3 received but not yet safe.
    peer.send(
        1,
        &Message::Heartbeat { sender: 3, txn_id: t1, last_safe_txn_id: t1 },
    )
    .unwrap();
    for &txn_id in &[t1, t3] {
        peer.send(
            1,
            &Message::Transaction {
                initiator: 3,
                txn_id,
                last_safe_txn_id: UNSET_TXN_ID,
                payload: dir_op(&DirectoryOp::CreateNode {
                    path: format!("/n{txn_id}"),
                    data: vec![],
                    ephemeral: None,
                }),
            },
        )
        .unwrap();
    }
    peer.send(
        1,
        &Message::Heartbeat { sender: 2, txn_id: tid(10, 2), last_safe_txn_id: UNSET_TXN_ID },
    )
    .unwrap();
    // Survivor 2 got further into site 3's stream than we did.
    peer.send(
        1,
        &Message::FailureSiteUpdate {
            source: 2,
            failed: BTreeSet::from([3]),
            subject: 3,
            safe_txn_id: t2,
        },
    )
    .unwrap();
    peer.send(
        1,
        &Message::FaultNotification { sites: BTreeSet::from([3]), cleared: false },
    )
    .unwrap();

    step(&mut [&mut e1], 40);

    let resolution = fault_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(resolution.sites, BTreeSet::from([3]));
    assert_eq!(resolution.safe_points[&3], t2);

    // t1 is within the agreed horizon and must have been released; t3 is
    // past it and must be gone.
    let released = applied.lock().unwrap().clone();
    assert!(released.contains(&t1));
    assert!(!released.contains(&t3));
    assert_eq!(e1.pending_transactions(), 0);
}

#[test]
fn snapshot_while_not_recovering_is_fatal() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2]);
    let net = ClusterNetwork::new(&sites);
    let (store, _applied) = RecordingStore::new();
    let mut e1 = AgreementEngine::new(config(1, &sites), net.endpoint(1), store);
    let peer = net.endpoint(2);

    peer.send(
        1,
        &Message::SnapshotPayload { watermark: tid(4, 2), blob: vec![] },
    )
    .unwrap();
    assert!(matches!(e1.run_once(), Err(FatalError::SnapshotOutOfOrder)));
}

#[test]
fn fault_during_recovery_is_fatal() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);
    let (store, _applied) = RecordingStore::new();
    let mut cfg = config(1, &sites);
    cfg.recovering = true;
    let mut e1 = AgreementEngine::new(cfg, net.endpoint(1), store);
    assert!(e1.is_recovering());

    e1.handle().deliver(Message::FaultNotification {
        sites: BTreeSet::from([2]),
        cleared: false,
    });
    assert!(matches!(
        e1.run_once(),
        Err(FatalError::FaultDuringRecovery { site: 2 })
    ));
}

#[test]
fn rejoin_completes_while_another_site_stays_down() {
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);

    // Survivor 1 runs alone: sites 2 and 3 are agreed failed, 2 stays
    // down for the whole scenario.
    let (store, a1) = RecordingStore::new();
    let mut cfg1 = config(1, &sites);
    cfg1.failed = BTreeSet::from([2, 3]);
    let mut e1 = AgreementEngine::new(cfg1, net.endpoint(1), store);

    e1.submit(dir_op(&DirectoryOp::CreateNode {
        path: "/stable".into(),
        data: b"kept".to_vec(),
        ephemeral: None,
    }));
    let mut spins = 0;
    while a1.lock().unwrap().is_empty() {
        step(&mut [&mut e1], 10);
        spins += 1;
        assert!(spins < 500, "lone survivor never released");
    }

    // Site 3 rejoins knowing 2 is down. It must only await survivor 1's
    // shipping; a dead site can never send a completion.
    let (store, a3) = RecordingStore::new();
    let mut cfg3 = config(3, &sites);
    cfg3.recovering = true;
    cfg3.failed = BTreeSet::from([2]);
    let mut e3 = AgreementEngine::new(cfg3, net.endpoint(3), store);
    // Old news about 2 repeated mid-recovery must not abort the rejoin.
    e3.handle().deliver_front(Message::FaultNotification {
        sites: BTreeSet::from([2]),
        cleared: false,
    });
    e1.handle().deliver(Message::FaultNotification {
        sites: BTreeSet::from([3]),
        cleared: true,
    });

    spins = 0;
    while e3.is_recovering() {
        step(&mut [&mut e1, &mut e3], 10);
        spins += 1;
        assert!(spins < 500, "rejoin never completed");
    }

    e1.submit(dir_op(&DirectoryOp::SetData {
        path: "/stable".into(),
        data: b"updated".to_vec(),
    }));
    spins = 0;
    while a1.lock().unwrap().len() < 2 || a3.lock().unwrap().is_empty() {
        step(&mut [&mut e1, &mut e3], 10);
        spins += 1;
        assert!(spins < 500, "post-rejoin work never released everywhere");
    }

    let post = a1.lock().unwrap()[1];
    assert_eq!(*a3.lock().unwrap(), vec![post]);
    assert_eq!(e1.store().dir, e3.store().dir);
    assert_eq!(e3.store().dir.data("/stable"), Some(&b"updated"[..]));
}

#[test]
fn rejoin_restores_snapshot_and_skips_watermarked_work() {
    logging();
    let sites: BTreeSet<NodeId> = BTreeSet::from([1, 2, 3]);
    let net = ClusterNetwork::new(&sites);
    let spawn_engine = |site: NodeId, recovering: bool| {
        let (store, applied) = RecordingStore::new();
        let mut cfg = config(site, &sites);
        cfg.recovering = recovering;
        let mut engine = AgreementEngine::new(cfg, net.endpoint(site), store);
        let handle = engine.handle();
        let stop = engine.stop_flag();
        let (fault_tx, fault_rx) = unbounded();
        engine.set_fault_events(fault_tx);
        let joiner = thread::spawn(move || {
            let result = engine.run();
            (engine, result)
        });
        (joiner, handle, stop, fault_rx, applied)
    };

    // Site 3 never comes up; 1 and 2 agree on its failure and keep going.
    let (j1, h1, stop1, f1, a1) = spawn_engine(1, false);
    let (j2, h2, stop2, f2, a2) = spawn_engine(2, false);
    let down = Message::FaultNotification { sites: BTreeSet::from([3]), cleared: false };
    h1.deliver(down.clone());
    h2.deliver(down);
    f1.recv_timeout(Duration::from_secs(5)).unwrap();
    f2.recv_timeout(Duration::from_secs(5)).unwrap();

    // Work applied while 3 is down ends up in the snapshot, not in 3's log.
    h1.deliver(Message::ClientRequest {
        payload: dir_op(&DirectoryOp::CreateNode {
            path: "/before-rejoin".into(),
            data: b"old".to_vec(),
            ephemeral: None,
        }),
    });
    wait_until("pre-rejoin work to apply at both survivors", || {
        a1.lock().unwrap().len() == 1 && a2.lock().unwrap().len() == 1
    });

    // Site 3 rejoins with empty state and must be rebuilt.
    let (j3, _h3, stop3, _f3, a3) = spawn_engine(3, true);
    let up = Message::FaultNotification { sites: BTreeSet::from([3]), cleared: true };
    h1.deliver(up.clone());
    h2.deliver(up);

    h2.deliver(Message::ClientRequest {
        payload: dir_op(&DirectoryOp::CreateNode {
            path: "/after-rejoin".into(),
            data: b"new".to_vec(),
            ephemeral: None,
        }),
    });
    wait_until("post-rejoin work to apply everywhere", || {
        a1.lock().unwrap().len() == 2
            && a2.lock().unwrap().len() == 2
            && a3.lock().unwrap().len() == 1
    });

    for stop in [&stop1, &stop2, &stop3] {
        stop.store(false, std::sync::atomic::Ordering::Release);
    }
    let (e1, r1) = j1.join().unwrap();
    let (e2, r2) = j2.join().unwrap();
    let (e3, r3) = j3.join().unwrap();
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    // The rejoiner applied only the post-rejoin transaction; the snapshot
    // carried the rest, and the stores converged byte for byte.
    assert_eq!(*a3.lock().unwrap(), vec![a1.lock().unwrap()[1]]);
    assert!(!e3.is_recovering());
    assert_eq!(e1.store().dir, e2.store().dir);
    assert_eq!(e1.store().dir, e3.store().dir);
    assert_eq!(e3.store().dir.data("/before-rejoin"), Some(&b"old"[..]));
    assert_eq!(e3.store().dir.data("/after-rejoin"), Some(&b"new"[..]));
}
