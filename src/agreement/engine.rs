//! The per-node agreement event loop.
//!
//! One engine per cluster node, one thread per engine. Each iteration
//! drains at most one inbound message, heartbeats when the interval is
//! due, and releases every transaction the ordering queue will let go.
//! All protocol state, the state machine included, is owned by this loop;
//! nothing is shared, everything arrives through the mailbox.
//!
//! `run_once` is public so tests can drive an engine deterministically
//! from a single thread instead of racing wall-clock timers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, info, trace, warn};

use crate::agreement::faults::{FaultArbiter, RoundOutcome};
use crate::agreement::message::Message;
use crate::agreement::queue::{OrderingQueue, QueueState};
use crate::agreement::recovery::{self, RecoveryState};
use crate::agreement::safety::SafetyTracker;
use crate::agreement::txn::TransactionRecord;
use crate::errors::FatalError;
use crate::ids::TxnIdSource;
use crate::mailbox::{MailboxHandle, NodeMailbox};
use crate::statemachine::StateMachine;
use crate::{NodeId, TxnId, UNSET_TXN_ID};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub site_id: NodeId,
    /// Full cluster membership, this node included.
    pub sites: BTreeSet<NodeId>,
    /// Sites already agreed failed when this engine starts. A rejoiner
    /// inherits this from the survivor that invited it back; recovery
    /// waits only on the remaining survivors.
    pub failed: BTreeSet<NodeId>,
    /// True when this node is rejoining an already-running cluster and
    /// must complete snapshot recovery before releasing anything.
    pub recovering: bool,
    pub heartbeat_interval: Duration,
    pub recv_timeout: Duration,
}

impl EngineConfig {
    pub fn new(site_id: NodeId, sites: BTreeSet<NodeId>) -> Self {
        Self {
            site_id,
            sites,
            failed: BTreeSet::new(),
            recovering: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

/// Emitted on the optional fault-event channel once a fault round's
/// resolution has been fully applied locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultResolution {
    pub sites: BTreeSet<NodeId>,
    pub safe_points: BTreeMap<NodeId, TxnId>,
}

pub struct AgreementEngine<S: StateMachine> {
    site_id: NodeId,
    heartbeat_interval: Duration,
    recv_timeout: Duration,
    mailbox: NodeMailbox,
    ids: TxnIdSource,
    queue: OrderingQueue,
    safety: SafetyTracker,
    arbiter: FaultArbiter,
    store: S,
    live_sites: BTreeSet<NodeId>,
    recovery: RecoveryState,
    /// Nothing at or below this id may ever be released here; it is
    /// already contained in the recovery snapshot.
    min_txn_after_recovery: TxnId,
    last_released: TxnId,
    last_heartbeat: Instant,
    running: Arc<AtomicBool>,
    fault_events: Option<Sender<FaultResolution>>,
}

impl<S: StateMachine> AgreementEngine<S> {
    pub fn new(config: EngineConfig, mailbox: NodeMailbox, store: S) -> Self {
        let survivors: BTreeSet<NodeId> = config
            .sites
            .difference(&config.failed)
            .copied()
            .collect();
        let recovery = if config.recovering {
            RecoveryState::recovering(&survivors, config.site_id)
        } else {
            RecoveryState::Normal
        };
        let mut queue = OrderingQueue::new(&config.sites);
        let safety = SafetyTracker::new(&survivors);
        let mut arbiter = FaultArbiter::new(config.site_id);
        for &site in &config.failed {
            queue.got_fault_for_initiator(site);
        }
        arbiter.record_failures(&config.failed);
        arbiter.mark_handled(&config.failed);
        Self {
            site_id: config.site_id,
            heartbeat_interval: config.heartbeat_interval,
            recv_timeout: config.recv_timeout,
            mailbox,
            ids: TxnIdSource::new(config.site_id),
            queue,
            safety,
            arbiter,
            store,
            live_sites: survivors,
            recovery,
            min_txn_after_recovery: UNSET_TXN_ID,
            last_released: UNSET_TXN_ID,
            last_heartbeat: Instant::now(),
            running: Arc::new(AtomicBool::new(true)),
            fault_events: None,
        }
    }

    pub fn handle(&self) -> MailboxHandle {
        self.mailbox.handle()
    }

    /// Clearing this flag makes `run` return after the current iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn set_fault_events(&mut self, events: Sender<FaultResolution>) {
        self.fault_events = Some(events);
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn last_released(&self) -> TxnId {
        self.last_released
    }

    pub fn pending_transactions(&self) -> usize {
        self.queue.len()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_recovering()
    }

    /// Submits a payload for cluster-wide ordered application. Local
    /// requests jump the inbound backlog so a busy node still stamps its
    /// own work promptly. Also works from other threads through a cloned
    /// [`MailboxHandle`].
    pub fn submit(&self, payload: Vec<u8>) {
        self.mailbox
            .handle()
            .deliver_front(Message::ClientRequest { payload });
    }

    pub fn run(&mut self) -> Result<(), FatalError> {
        info!(site = self.site_id, "agreement engine running");
        while self.running.load(Ordering::Acquire) {
            self.run_once()?;
        }
        info!(site = self.site_id, "agreement engine stopped");
        Ok(())
    }

    /// One loop iteration: at most one inbound message, a heartbeat if one
    /// is due, then every releasable transaction.
    pub fn run_once(&mut self) -> Result<(), FatalError> {
        if let Some(msg) = self.mailbox.recv_blocking(self.recv_timeout) {
            self.dispatch(msg)?;
        }
        if self.last_heartbeat.elapsed() >= self.heartbeat_interval {
            self.send_heartbeats()?;
        }
        if !self.recovery.is_recovering() {
            self.release_ready()?;
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), FatalError> {
        match msg {
            Message::Heartbeat {
                sender,
                txn_id,
                last_safe_txn_id,
            } => {
                let last_seen = self.queue.note_seen(sender, txn_id, last_safe_txn_id);
                let blocked = self.queue.queue_state() == QueueState::BlockedOnSafety;
                let response = Message::HeartbeatResponse {
                    sender: self.site_id,
                    last_seen_txn_id: last_seen,
                    blocked,
                };
                self.mailbox
                    .send(sender, &response)
                    .map_err(|source| FatalError::Send { target: sender, source })?;
            }
            Message::HeartbeatResponse {
                sender,
                last_seen_txn_id,
                blocked,
            } => {
                self.safety.update_last_seen(sender, last_seen_txn_id, blocked);
                if sender != self.site_id && self.safety.is_blocked(sender) {
                    // The peer's head is waiting on our safe horizon;
                    // refresh it now instead of waiting out the interval.
                    self.send_heartbeats()?;
                }
            }
            Message::ClientRequest { payload } => self.initiate(payload)?,
            Message::Transaction {
                initiator,
                txn_id,
                last_safe_txn_id,
                payload,
            } => self.on_transaction(initiator, txn_id, last_safe_txn_id, payload),
            Message::FaultNotification { sites, cleared } => {
                if cleared {
                    self.handle_rejoin(&sites)?;
                } else {
                    self.handle_fault(&sites)?;
                }
            }
            Message::FailureSiteUpdate {
                source,
                failed,
                subject,
                safe_txn_id,
            } => {
                // A claim arriving outside a round. If it names failures
                // we have not seen, it becomes the trigger of our own
                // round; otherwise it is a leftover of one already run.
                let unknown: BTreeSet<NodeId> = failed
                    .iter()
                    .copied()
                    .filter(|&site| !self.arbiter.is_known_failed(site))
                    .collect();
                if unknown.is_empty() {
                    debug!(site = self.site_id, from = source, "stale failure update, discarding");
                } else {
                    self.mailbox.handle().deliver_front(Message::FailureSiteUpdate {
                        source,
                        failed,
                        subject,
                        safe_txn_id,
                    });
                    self.handle_fault(&unknown)?;
                }
            }
            Message::SnapshotPayload { watermark, blob } => {
                self.handle_snapshot(watermark, &blob)?;
            }
            Message::ShippingComplete { sender } => {
                if self.recovery.note_shipping_complete(sender) {
                    self.maybe_finish_recovery();
                } else {
                    debug!(site = self.site_id, from = sender, "stale shipping completion");
                }
            }
        }
        Ok(())
    }

    /// Stamps a local payload with a fresh txn id and broadcasts it.
    fn initiate(&mut self, payload: Vec<u8>) -> Result<(), FatalError> {
        let txn_id = self.ids.next_id();
        let last_safe = self.safety.newest_safe_txn();
        let msg = Message::Transaction {
            initiator: self.site_id,
            txn_id,
            last_safe_txn_id: last_safe,
            payload: payload.clone(),
        };
        for &target in &self.live_sites {
            if target == self.site_id {
                continue;
            }
            self.mailbox
                .send(target, &msg)
                .map_err(|source| FatalError::Send { target, source })?;
        }
        self.on_transaction(self.site_id, txn_id, last_safe, payload);
        Ok(())
    }

    fn on_transaction(
        &mut self,
        initiator: NodeId,
        txn_id: TxnId,
        last_safe_txn_id: TxnId,
        payload: Vec<u8>,
    ) {
        self.queue.note_seen(initiator, txn_id, last_safe_txn_id);
        if txn_id <= self.min_txn_after_recovery {
            // Recovery replay of work the snapshot already contains.
            debug!(site = self.site_id, txn_id, "dropping transaction below recovery watermark");
            return;
        }
        if self.queue.contains(txn_id) || txn_id <= self.last_released {
            debug!(site = self.site_id, txn_id, "dropping duplicate transaction");
            return;
        }
        if !self.queue.add(TransactionRecord::new(txn_id, initiator, payload)) {
            info!(site = self.site_id, txn_id, initiator, "rejecting transaction from failed initiator");
        }
    }

    fn send_heartbeats(&mut self) -> Result<(), FatalError> {
        let msg = Message::Heartbeat {
            sender: self.site_id,
            txn_id: self.ids.next_id(),
            last_safe_txn_id: self.safety.newest_safe_txn(),
        };
        for &target in &self.live_sites {
            self.mailbox
                .send(target, &msg)
                .map_err(|source| FatalError::Send { target, source })?;
        }
        self.last_heartbeat = Instant::now();
        Ok(())
    }

    fn handle_fault(&mut self, sites: &BTreeSet<NodeId>) -> Result<(), FatalError> {
        let newly = self.arbiter.record_failures(sites);
        if newly.is_empty() {
            debug!(site = self.site_id, ?sites, "duplicate fault notification");
            return Ok(());
        }
        if self.recovery.is_recovering() {
            // Membership must hold still while this node recovers; halt
            // and rejoin from scratch rather than guess.
            let site = newly.iter().next().copied().unwrap_or(self.site_id);
            return Err(FatalError::FaultDuringRecovery { site });
        }
        warn!(site = self.site_id, failed = ?newly, "sites reported failed");
        for site in &newly {
            self.live_sites.remove(site);
        }
        match self
            .arbiter
            .run_round(&self.live_sites, &self.queue, &self.mailbox, self.recv_timeout)?
        {
            // The widening trigger is waiting at the mailbox front; the
            // next iteration restarts the round with the fuller view.
            RoundOutcome::Aborted => Ok(()),
            RoundOutcome::Resolved { safe_points } => self.apply_resolution(safe_points),
        }
    }

    fn apply_resolution(
        &mut self,
        safe_points: BTreeMap<NodeId, TxnId>,
    ) -> Result<(), FatalError> {
        let sites: BTreeSet<NodeId> = safe_points.keys().copied().collect();
        for &site in &sites {
            self.safety.remove_site(site);
            self.queue.got_fault_for_initiator(site);
            self.store.close_sessions(site);
        }
        // Pending work past a failed site's agreed horizon was, by
        // agreement, received by no survivor that released it; discard.
        let doomed: Vec<TxnId> = self
            .queue
            .records()
            .filter(|r| sites.contains(&r.initiator) && r.txn_id > safe_points[&r.initiator])
            .map(|r| r.txn_id)
            .collect();
        for txn_id in doomed {
            debug!(site = self.site_id, txn_id, "discarding transaction past agreed safe point");
            self.queue.fault_transaction(txn_id);
        }
        self.arbiter.mark_handled(&sites);
        if let Some(events) = &self.fault_events {
            let _ = events.send(FaultResolution {
                sites: sites.clone(),
                safe_points,
            });
        }
        info!(site = self.site_id, ?sites, "fault resolution applied");
        Ok(())
    }

    fn handle_rejoin(&mut self, sites: &BTreeSet<NodeId>) -> Result<(), FatalError> {
        if sites.contains(&self.site_id) {
            // Our own rejoin announcement reflected back at us.
            return Ok(());
        }
        for &rejoiner in sites {
            // Lowest-id survivor ships the snapshot; everyone replays
            // pending work. The shipper is chosen before the rejoiner is
            // re-admitted so every survivor picks the same one.
            let shipper = recovery::snapshot_shipper(&self.live_sites, rejoiner);
            self.arbiter.forget(rejoiner);
            self.queue.rejoin_initiator(rejoiner);
            self.safety.add_site(rejoiner);
            self.live_sites.insert(rejoiner);
            info!(site = self.site_id, rejoiner, "replaying pending state to rejoining site");

            if shipper == Some(self.site_id) {
                let packed = recovery::pack_snapshot(&self.store.snapshot())
                    .map_err(|e| FatalError::SnapshotCorrupt(e.to_string()))?;
                let snapshot = Message::SnapshotPayload {
                    watermark: self.last_released,
                    blob: packed,
                };
                self.mailbox
                    .send(rejoiner, &snapshot)
                    .map_err(|source| FatalError::Send { target: rejoiner, source })?;
            }
            for record in self.queue.records() {
                let replay = Message::Transaction {
                    initiator: record.initiator,
                    txn_id: record.txn_id,
                    // The original initiator's horizon is not ours to
                    // assert; live heartbeats re-establish it.
                    last_safe_txn_id: UNSET_TXN_ID,
                    payload: record.payload.clone(),
                };
                self.mailbox
                    .send(rejoiner, &replay)
                    .map_err(|source| FatalError::Send { target: rejoiner, source })?;
            }
            self.mailbox
                .send(rejoiner, &Message::ShippingComplete { sender: self.site_id })
                .map_err(|source| FatalError::Send { target: rejoiner, source })?;
        }
        Ok(())
    }

    fn handle_snapshot(&mut self, watermark: TxnId, blob: &[u8]) -> Result<(), FatalError> {
        if !self.recovery.is_recovering() {
            return Err(FatalError::SnapshotOutOfOrder);
        }
        if self.min_txn_after_recovery != UNSET_TXN_ID && watermark < self.min_txn_after_recovery {
            return Err(FatalError::WatermarkRegression {
                received: watermark,
                current: self.min_txn_after_recovery,
            });
        }
        self.min_txn_after_recovery = watermark;
        // Anything queued from replay that the snapshot already covers.
        let superseded: Vec<TxnId> = self
            .queue
            .records()
            .map(|r| r.txn_id)
            .filter(|&id| id <= watermark)
            .collect();
        for txn_id in superseded {
            self.queue.fault_transaction(txn_id);
        }
        let bytes = recovery::unpack_snapshot(blob)
            .map_err(|e| FatalError::SnapshotCorrupt(e.to_string()))?;
        self.store
            .restore(&bytes)
            .map_err(|e| FatalError::SnapshotCorrupt(e.to_string()))?;
        info!(site = self.site_id, watermark, "recovery snapshot restored");
        self.recovery.note_snapshot_loaded();
        self.maybe_finish_recovery();
        Ok(())
    }

    fn maybe_finish_recovery(&mut self) {
        if self.recovery.is_complete() {
            self.recovery = RecoveryState::Normal;
            info!(
                site = self.site_id,
                watermark = self.min_txn_after_recovery,
                "recovery complete, resuming release"
            );
        }
    }

    fn release_ready(&mut self) -> Result<(), FatalError> {
        while let Some(record) = self.queue.poll() {
            if record.txn_id <= self.min_txn_after_recovery {
                return Err(FatalError::ReleasedBelowWatermark {
                    txn_id: record.txn_id,
                    watermark: self.min_txn_after_recovery,
                });
            }
            trace!(site = self.site_id, txn_id = record.txn_id, "releasing transaction");
            self.last_released = record.txn_id;
            self.store.apply(&record.payload, record.txn_id);
        }
        Ok(())
    }
}
