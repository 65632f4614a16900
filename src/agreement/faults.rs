//! Quorum agreement on the safe horizon of failed sites.
//!
//! When sites fail, each survivor may hold a different suffix of the
//! failed sites' transaction streams. Survivors exchange one
//! `FailureSiteUpdate` per failed site, stating how far into that site's
//! stream they got; the agreed safe point is the MAXIMUM across survivors,
//! because a transaction any survivor holds could already be released
//! there and discarding it would fork history. Survivors missing
//! transactions below the maximum receive them through the ordering
//! queue's normal gating (those transactions are still pending everywhere,
//! by definition of the safety horizon).
//!
//! A round runs against a fixed view of the failed set. Evidence that the
//! view is stale (an update naming failures we have not seen, or a fresh
//! fault notification) aborts the round; the trigger is re-queued at the
//! front of the mailbox and the engine starts over with the wider view.
//! Per-(source, subject) claims survive the restart, so aborted rounds
//! waste no evidence.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info};

use crate::agreement::message::Message;
use crate::agreement::queue::OrderingQueue;
use crate::errors::FatalError;
use crate::mailbox::NodeMailbox;
use crate::{NodeId, TxnId, UNSET_TXN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    Broadcasting,
    CollectingQuorum,
    Resolved,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every survivor reported on every pending failed site; `safe_points`
    /// holds the agreed horizon per failed site.
    Resolved { safe_points: BTreeMap<NodeId, TxnId> },
    /// The failed-set view widened mid-round. The trigger message has been
    /// re-queued at the front of the mailbox; run a new round.
    Aborted,
}

pub struct FaultArbiter {
    site_id: NodeId,
    known_failed: BTreeSet<NodeId>,
    handled_failed: BTreeSet<NodeId>,
    /// Locally agreed safe point per site, surviving across rounds. Seeds
    /// this node's claim when a later round names a site it no longer has
    /// queue state for.
    ledger: BTreeMap<NodeId, TxnId>,
    /// (source, subject) -> claimed safe point. Survives round aborts.
    round_ledger: BTreeMap<(NodeId, NodeId), TxnId>,
    state: RoundState,
}

impl FaultArbiter {
    pub fn new(site_id: NodeId) -> Self {
        Self {
            site_id,
            known_failed: BTreeSet::new(),
            handled_failed: BTreeSet::new(),
            ledger: BTreeMap::new(),
            round_ledger: BTreeMap::new(),
            state: RoundState::Idle,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn is_known_failed(&self, site: NodeId) -> bool {
        self.known_failed.contains(&site)
    }

    /// Merges `sites` into the known-failed view, returning the ones not
    /// known before. An empty return means the notification was a
    /// duplicate and no round is needed.
    pub fn record_failures(&mut self, sites: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let newly: BTreeSet<NodeId> = sites.difference(&self.known_failed).copied().collect();
        self.known_failed.extend(newly.iter().copied());
        newly
    }

    /// Re-admits a recovered site: it is no longer failed, but its ledger
    /// entry stays as history of the old incarnation's horizon.
    pub fn forget(&mut self, site: NodeId) {
        self.known_failed.remove(&site);
        self.handled_failed.remove(&site);
        self.round_ledger.retain(|&(_, subject), _| subject != site);
    }

    /// Failed sites whose horizon has not been agreed yet.
    fn pending(&self) -> BTreeSet<NodeId> {
        self.known_failed
            .difference(&self.handled_failed)
            .copied()
            .collect()
    }

    fn claim_for(&self, queue: &OrderingQueue, subject: NodeId) -> TxnId {
        queue
            .newest_safe_transaction_for_initiator(subject)
            .or_else(|| self.ledger.get(&subject).copied())
            .unwrap_or(UNSET_TXN_ID)
    }

    fn broadcast_claims(
        &self,
        live: &BTreeSet<NodeId>,
        queue: &OrderingQueue,
        mailbox: &NodeMailbox,
    ) -> Result<(), FatalError> {
        for &subject in &self.pending() {
            let msg = Message::FailureSiteUpdate {
                source: self.site_id,
                failed: self.known_failed.clone(),
                subject,
                safe_txn_id: self.claim_for(queue, subject),
            };
            for &target in live {
                mailbox
                    .send(target, &msg)
                    .map_err(|source| FatalError::Send { target, source })?;
            }
        }
        Ok(())
    }

    fn have_all_claims(&self, live: &BTreeSet<NodeId>, pending: &BTreeSet<NodeId>) -> bool {
        live.iter().all(|&source| {
            pending
                .iter()
                .all(|&subject| self.round_ledger.contains_key(&(source, subject)))
        })
    }

    /// Runs one agreement round over the current pending failed set.
    /// `live` is the surviving membership, this site included. Blocks in
    /// bounded recv slices until every survivor's claim for every pending
    /// site has arrived; claims are re-broadcast on each timeout. Messages
    /// that do not belong to the round are re-queued, in arrival order,
    /// once the round ends.
    pub fn run_round(
        &mut self,
        live: &BTreeSet<NodeId>,
        queue: &OrderingQueue,
        mailbox: &NodeMailbox,
        recv_timeout: Duration,
    ) -> Result<RoundOutcome, FatalError> {
        let pending = self.pending();
        if pending.is_empty() {
            self.state = RoundState::Idle;
            return Ok(RoundOutcome::Resolved {
                safe_points: BTreeMap::new(),
            });
        }
        info!(
            site = self.site_id,
            ?pending,
            ?live,
            "starting fault agreement round"
        );
        self.state = RoundState::Broadcasting;
        self.broadcast_claims(live, queue, mailbox)?;
        self.state = RoundState::CollectingQuorum;

        let mut deferred: Vec<Message> = Vec::new();
        let outcome = loop {
            if self.have_all_claims(live, &pending) {
                break self.resolve(live, &pending)?;
            }
            let msg = match mailbox.recv_blocking(recv_timeout) {
                Some(msg) => msg,
                None => {
                    // A peer may have joined the round after our first
                    // broadcast; repeat the claims rather than stall.
                    self.broadcast_claims(live, queue, mailbox)?;
                    continue;
                }
            };
            match msg {
                Message::FailureSiteUpdate {
                    source,
                    ref failed,
                    subject,
                    safe_txn_id,
                } => {
                    if failed.difference(&self.known_failed).next().is_some() {
                        // The sender knows of failures we do not; our view
                        // is stale. Restart against the wider view.
                        debug!(site = self.site_id, from = source, "wider failed set, aborting round");
                        mailbox.handle().deliver_front(msg);
                        break RoundOutcome::Aborted;
                    }
                    if *failed != self.known_failed {
                        debug!(site = self.site_id, from = source, "stale failed set, discarding claim");
                        continue;
                    }
                    self.round_ledger.insert((source, subject), safe_txn_id);
                }
                Message::FaultNotification { ref sites, cleared } => {
                    if cleared {
                        // Rejoins wait until the round finishes.
                        deferred.push(msg);
                    } else if sites.difference(&self.known_failed).next().is_some() {
                        mailbox.handle().deliver_front(msg);
                        break RoundOutcome::Aborted;
                    }
                    // A duplicate notification of sites already in the
                    // round adds nothing.
                }
                other => deferred.push(other),
            }
        };

        // Everything set aside goes back ahead of normal traffic, in the
        // order it arrived. The abort trigger is already in front of it.
        for msg in deferred {
            mailbox.handle().deliver_front(msg);
        }
        self.state = match outcome {
            RoundOutcome::Resolved { .. } => RoundState::Resolved,
            RoundOutcome::Aborted => RoundState::Aborted,
        };
        Ok(outcome)
    }

    fn resolve(
        &mut self,
        live: &BTreeSet<NodeId>,
        pending: &BTreeSet<NodeId>,
    ) -> Result<RoundOutcome, FatalError> {
        let mut safe_points = BTreeMap::new();
        for &subject in pending {
            let agreed = live
                .iter()
                .filter_map(|&source| self.round_ledger.get(&(source, subject)).copied())
                .max()
                .ok_or(FatalError::MissingSafePoint { site: subject })?;
            safe_points.insert(subject, agreed);
            self.ledger.insert(subject, agreed);
        }
        info!(site = self.site_id, ?safe_points, "fault round resolved");
        self.round_ledger
            .retain(|&(_, subject), _| !pending.contains(&subject));
        Ok(RoundOutcome::Resolved { safe_points })
    }

    /// Marks sites whose resolution the engine has fully applied.
    pub fn mark_handled(&mut self, sites: &BTreeSet<NodeId>) {
        self.handled_failed.extend(sites.iter().copied());
    }
}
