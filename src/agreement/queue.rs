//! Total-order release queue.
//!
//! Transactions accumulate here until two independent conditions hold for
//! the head:
//!
//!  1. ORDERING: every live initiator has been heard from at a
//!     transaction id at or past the head, so nothing smaller can still
//!     arrive.
//!  2. SAFETY: the head's own initiator has acknowledged that every
//!     survivor holds it, so releasing it cannot diverge from a node that
//!     never received it. Transactions of failed initiators are exempt:
//!     the fault agreement round already decided their safe horizon and
//!     purged everything past it.
//!
//! The id layout makes the `BTreeMap` iteration order the cluster-wide
//! total order, initiator tie-break included, so this map doubles as the
//! pending-transaction index used for recovery replay.

use std::collections::{BTreeMap, BTreeSet};

use crate::agreement::txn::TransactionRecord;
use crate::{NodeId, TxnId, UNSET_TXN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing queued.
    Idle,
    /// The head transaction is releasable now.
    Active,
    /// Transactions are queued but the head is held back, either for
    /// ordering or for its initiator's safety acknowledgement.
    BlockedOnSafety,
}

#[derive(Debug, Default)]
struct InitiatorTrack {
    /// Highest txn id this initiator is known to have issued.
    last_seen: TxnId,
    /// Highest txn id this initiator has reported as safe at all survivors.
    last_safe: TxnId,
}

#[derive(Debug)]
pub struct OrderingQueue {
    ready: BTreeMap<TxnId, TransactionRecord>,
    initiators: BTreeMap<NodeId, InitiatorTrack>,
    failed: BTreeSet<NodeId>,
}

impl OrderingQueue {
    pub fn new(initiators: &BTreeSet<NodeId>) -> Self {
        Self {
            ready: BTreeMap::new(),
            initiators: initiators
                .iter()
                .map(|&id| (id, InitiatorTrack::default()))
                .collect(),
            failed: BTreeSet::new(),
        }
    }

    /// Records that `initiator` was heard from at `txn_id` with safe
    /// horizon `last_safe`, returning its updated last-seen id. Both
    /// fields only ever advance; stale messages are absorbed.
    pub fn note_seen(&mut self, initiator: NodeId, txn_id: TxnId, last_safe: TxnId) -> TxnId {
        if self.failed.contains(&initiator) {
            // Stale traffic from a site already agreed dead must not
            // resurrect its ordering track.
            return UNSET_TXN_ID;
        }
        let track = self.initiators.entry(initiator).or_default();
        track.last_seen = track.last_seen.max(txn_id);
        track.last_safe = track.last_safe.max(last_safe);
        track.last_seen
    }

    /// Enqueues a transaction. Returns false without enqueueing when the
    /// initiator has already been declared failed, when the initiator is
    /// unknown, or when the id is already present.
    pub fn add(&mut self, record: TransactionRecord) -> bool {
        if self.failed.contains(&record.initiator) || !self.initiators.contains_key(&record.initiator)
        {
            return false;
        }
        if self.ready.contains_key(&record.txn_id) {
            return false;
        }
        self.ready.insert(record.txn_id, record);
        true
    }

    /// Removes and returns the head transaction if it is releasable.
    pub fn poll(&mut self) -> Option<TransactionRecord> {
        let head = *self.ready.keys().next()?;
        if !self.head_releasable(head) {
            return None;
        }
        self.ready.remove(&head)
    }

    fn head_releasable(&self, head: TxnId) -> bool {
        if head > self.min_last_seen() {
            return false;
        }
        let record = &self.ready[&head];
        if self.failed.contains(&record.initiator) {
            return true;
        }
        self.initiators[&record.initiator].last_safe >= head
    }

    /// Smallest last-seen id across live initiators. With no live
    /// initiators nothing can still arrive, so the ordering hold vanishes.
    fn min_last_seen(&self) -> TxnId {
        self.initiators
            .values()
            .map(|t| t.last_seen)
            .min()
            .unwrap_or(TxnId::MAX)
    }

    /// Declares `site` failed: it stops gating ordering, and its queued
    /// transactions become releasable on ordering alone, pending the fault
    /// round purging those past the agreed safe point.
    pub fn got_fault_for_initiator(&mut self, site: NodeId) {
        self.initiators.remove(&site);
        self.failed.insert(site);
    }

    /// Re-admits a recovered `site` as a live initiator with a clean
    /// track. Its next message re-establishes last-seen from scratch.
    pub fn rejoin_initiator(&mut self, site: NodeId) {
        self.failed.remove(&site);
        self.initiators.insert(site, InitiatorTrack::default());
    }

    /// Drops the transaction with this exact id, if queued. Used when a
    /// fault round agrees a failed initiator's transaction never reached
    /// every survivor, and to discard work superseded by a snapshot.
    pub fn fault_transaction(&mut self, txn_id: TxnId) -> bool {
        self.ready.remove(&txn_id).is_some()
    }

    /// Highest id `initiator` has reported safe, or `None` when the
    /// initiator is unknown here or has never reported one.
    pub fn newest_safe_transaction_for_initiator(&self, initiator: NodeId) -> Option<TxnId> {
        let track = self.initiators.get(&initiator)?;
        (track.last_safe != UNSET_TXN_ID).then_some(track.last_safe)
    }

    pub fn queue_state(&self) -> QueueState {
        match self.ready.keys().next() {
            None => QueueState::Idle,
            Some(&head) if self.head_releasable(head) => QueueState::Active,
            Some(_) => QueueState::BlockedOnSafety,
        }
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.ready.contains_key(&txn_id)
    }

    /// Queued transactions in release order. Recovery replay walks this.
    pub fn records(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.ready.values()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ids with the production bit layout: sequence in the timestamp field,
    // initiator in the low bits.
    fn tid(seq: u64, initiator: NodeId) -> TxnId {
        (seq << 24) | u64::from(initiator)
    }

    fn rec(seq: u64, initiator: NodeId) -> TransactionRecord {
        TransactionRecord::new(tid(seq, initiator), initiator, vec![])
    }

    fn queue(sites: &[NodeId]) -> OrderingQueue {
        OrderingQueue::new(&sites.iter().copied().collect())
    }

    #[test]
    fn head_waits_for_every_live_initiator() {
        let mut q = queue(&[1, 2]);
        q.note_seen(1, tid(5, 1), tid(5, 1));
        assert!(q.add(rec(5, 1)));
        // Initiator 2 has not been heard from past the head yet.
        assert_eq!(q.poll(), None);
        assert_eq!(q.queue_state(), QueueState::BlockedOnSafety);

        q.note_seen(2, tid(6, 2), UNSET_TXN_ID);
        assert_eq!(q.queue_state(), QueueState::Active);
        assert_eq!(q.poll(), Some(rec(5, 1)));
        assert_eq!(q.queue_state(), QueueState::Idle);
    }

    #[test]
    fn head_waits_for_initiator_safety() {
        let mut q = queue(&[1, 2]);
        q.note_seen(1, tid(5, 1), UNSET_TXN_ID);
        q.note_seen(2, tid(9, 2), UNSET_TXN_ID);
        assert!(q.add(rec(5, 1)));
        // Ordered, but initiator 1 has not confirmed the survivors hold it.
        assert_eq!(q.poll(), None);

        q.note_seen(1, tid(5, 1), tid(5, 1));
        assert_eq!(q.poll(), Some(rec(5, 1)));
    }

    #[test]
    fn same_timestamp_orders_by_initiator() {
        let mut q = queue(&[1, 2]);
        q.note_seen(1, tid(4, 1), tid(4, 1));
        q.note_seen(2, tid(4, 2), tid(4, 2));
        assert!(q.add(rec(4, 2)));
        assert!(q.add(rec(4, 1)));
        assert_eq!(q.poll().unwrap().initiator, 1);
        assert_eq!(q.poll().unwrap().initiator, 2);
    }

    #[test]
    fn failed_initiator_stops_gating_and_needs_no_safety() {
        let mut q = queue(&[1, 2, 3]);
        q.note_seen(1, tid(8, 1), UNSET_TXN_ID);
        q.note_seen(2, tid(8, 2), UNSET_TXN_ID);
        // Initiator 3 silent; its row blocks ordering.
        assert!(q.add(rec(3, 3)));
        assert_eq!(q.poll(), None);

        q.got_fault_for_initiator(3);
        // No safety hold for a failed initiator's surviving transactions.
        assert_eq!(q.poll(), Some(rec(3, 3)));
    }

    #[test]
    fn add_rejects_failed_and_duplicate() {
        let mut q = queue(&[1, 2]);
        q.got_fault_for_initiator(2);
        assert!(!q.add(rec(4, 2)));
        assert!(q.add(rec(4, 1)));
        assert!(!q.add(rec(4, 1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn fault_transaction_removes_exact_id() {
        let mut q = queue(&[1]);
        assert!(q.add(rec(2, 1)));
        assert!(q.add(rec(3, 1)));
        assert!(q.fault_transaction(tid(3, 1)));
        assert!(!q.fault_transaction(tid(3, 1)));
        assert!(q.contains(tid(2, 1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn newest_safe_reflects_reports() {
        let mut q = queue(&[1, 2]);
        assert_eq!(q.newest_safe_transaction_for_initiator(1), None);
        assert_eq!(q.newest_safe_transaction_for_initiator(9), None);
        q.note_seen(1, tid(6, 1), tid(6, 1));
        assert_eq!(q.newest_safe_transaction_for_initiator(1), Some(tid(6, 1)));
        // Stale report never walks the horizon back.
        q.note_seen(1, tid(7, 1), tid(5, 1));
        assert_eq!(q.newest_safe_transaction_for_initiator(1), Some(tid(6, 1)));
    }

    #[test]
    fn rejoined_initiator_gates_ordering_again() {
        let mut q = queue(&[1, 2]);
        q.got_fault_for_initiator(2);
        q.note_seen(1, tid(5, 1), tid(5, 1));
        assert!(q.add(rec(5, 1)));
        assert_eq!(q.queue_state(), QueueState::Active);

        q.rejoin_initiator(2);
        // A fresh track means initiator 2 has been seen at nothing yet.
        assert_eq!(q.queue_state(), QueueState::BlockedOnSafety);
        q.note_seen(2, tid(6, 2), UNSET_TXN_ID);
        assert_eq!(q.poll(), Some(rec(5, 1)));
    }

    #[test]
    fn records_iterate_in_release_order() {
        let mut q = queue(&[1, 2]);
        assert!(q.add(rec(7, 2)));
        assert!(q.add(rec(6, 1)));
        assert!(q.add(rec(7, 1)));
        let order: Vec<TxnId> = q.records().map(|r| r.txn_id).collect();
        assert_eq!(order, vec![tid(6, 1), tid(7, 1), tid(7, 2)]);
    }
}
