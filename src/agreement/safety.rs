//! Tracks how far each survivor has acknowledged this node's stream.
//!
//! Every heartbeat response carries the responder's highest received txn
//! id. The safe horizon announced in outgoing heartbeats and transactions
//! is the minimum of those acknowledgements: everything at or below it is
//! replicated everywhere, so a peer may release it without risking
//! divergence after a failure.

use std::collections::{BTreeMap, BTreeSet};

use crate::{NodeId, TxnId, UNSET_TXN_ID};

#[derive(Debug, Default)]
struct SiteAck {
    last_acked: TxnId,
    blocked: bool,
}

#[derive(Debug)]
pub struct SafetyTracker {
    sites: BTreeMap<NodeId, SiteAck>,
}

impl SafetyTracker {
    /// `sites` is the full membership, this node included; a node
    /// acknowledges its own stream through the loopback heartbeat.
    pub fn new(sites: &BTreeSet<NodeId>) -> Self {
        Self {
            sites: sites.iter().map(|&id| (id, SiteAck::default())).collect(),
        }
    }

    /// Records an acknowledgement from `site`. The acked id only advances;
    /// the blocked flag reflects the latest report.
    pub fn update_last_seen(&mut self, site: NodeId, last_acked: TxnId, blocked: bool) {
        if let Some(ack) = self.sites.get_mut(&site) {
            ack.last_acked = ack.last_acked.max(last_acked);
            ack.blocked = blocked;
        }
    }

    /// Highest txn id every tracked site has acknowledged.
    pub fn newest_safe_txn(&self) -> TxnId {
        self.sites
            .values()
            .map(|ack| ack.last_acked)
            .min()
            .unwrap_or(UNSET_TXN_ID)
    }

    /// Whether `site` last reported a head blocked on safety.
    pub fn is_blocked(&self, site: NodeId) -> bool {
        self.sites.get(&site).is_some_and(|ack| ack.blocked)
    }

    pub fn add_site(&mut self, site: NodeId) {
        self.sites.entry(site).or_default();
    }

    /// Drops a failed site. The horizon can only move forward as a result:
    /// a dead site's stale acknowledgement no longer pins it down.
    pub fn remove_site(&mut self, site: NodeId) {
        self.sites.remove(&site);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(sites: &[NodeId]) -> SafetyTracker {
        SafetyTracker::new(&sites.iter().copied().collect())
    }

    #[test]
    fn horizon_is_minimum_over_sites() {
        let mut t = tracker(&[1, 2, 3]);
        assert_eq!(t.newest_safe_txn(), UNSET_TXN_ID);
        t.update_last_seen(1, 50, false);
        t.update_last_seen(2, 30, false);
        t.update_last_seen(3, 40, false);
        assert_eq!(t.newest_safe_txn(), 30);
    }

    #[test]
    fn stale_ack_never_regresses() {
        let mut t = tracker(&[1]);
        t.update_last_seen(1, 50, false);
        t.update_last_seen(1, 20, false);
        assert_eq!(t.newest_safe_txn(), 50);
    }

    #[test]
    fn removing_the_straggler_raises_the_horizon() {
        let mut t = tracker(&[1, 2]);
        t.update_last_seen(1, 50, false);
        t.update_last_seen(2, 10, false);
        assert_eq!(t.newest_safe_txn(), 10);
        t.remove_site(2);
        assert_eq!(t.newest_safe_txn(), 50);
    }

    #[test]
    fn rejoined_site_pins_the_horizon_again() {
        let mut t = tracker(&[1]);
        t.update_last_seen(1, 50, false);
        t.add_site(2);
        assert_eq!(t.newest_safe_txn(), UNSET_TXN_ID);
    }

    #[test]
    fn blocked_flag_follows_latest_report() {
        let mut t = tracker(&[1]);
        t.update_last_seen(1, 5, true);
        assert!(t.is_blocked(1));
        t.update_last_seen(1, 6, false);
        assert!(!t.is_blocked(1));
        assert!(!t.is_blocked(9));
    }
}
