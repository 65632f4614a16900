//! Message vocabulary of the agreement protocol.
//!
//! Every variant that crosses the network carries a one-byte wire tag so a
//! receiver can reject a frame whose tag and body disagree without trusting
//! the serialized discriminant alone. `ClientRequest` never leaves the
//! node: it is stamped with a transaction id locally and rebroadcast as
//! `Transaction`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{NodeId, TxnId};

pub const TAG_HEARTBEAT: u8 = 1;
pub const TAG_HEARTBEAT_RESPONSE: u8 = 2;
pub const TAG_TRANSACTION: u8 = 3;
pub const TAG_FAULT_NOTIFICATION: u8 = 4;
pub const TAG_FAILURE_SITE_UPDATE: u8 = 5;
pub const TAG_SNAPSHOT_PAYLOAD: u8 = 6;
pub const TAG_SHIPPING_COMPLETE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic liveness beacon. Carries a fresh transaction id so the
    /// ordering point of every initiator keeps advancing even when it has
    /// no real work, plus the sender's current safe horizon.
    Heartbeat {
        sender: NodeId,
        txn_id: TxnId,
        last_safe_txn_id: TxnId,
    },
    /// Acknowledges everything received from the peer up to
    /// `last_seen_txn_id`. `blocked` reports whether the responder's queue
    /// head is stalled waiting for safety, which prompts the receiver to
    /// heartbeat again immediately rather than wait out the interval.
    HeartbeatResponse {
        sender: NodeId,
        last_seen_txn_id: TxnId,
        blocked: bool,
    },
    /// An ordered transaction broadcast by its initiator.
    Transaction {
        initiator: NodeId,
        txn_id: TxnId,
        last_safe_txn_id: TxnId,
        payload: Vec<u8>,
    },
    /// Local-only: a payload submitted at this node, not yet stamped with
    /// a transaction id. Never serialized onto the wire.
    ClientRequest { payload: Vec<u8> },
    /// Membership change notice. `cleared: false` reports newly failed
    /// sites and triggers a fault agreement round; `cleared: true` reports
    /// sites rejoining after recovery.
    FaultNotification {
        sites: BTreeSet<NodeId>,
        cleared: bool,
    },
    /// One survivor's contribution to a fault agreement round: for the
    /// failed site `subject`, `source` has seen everything up to
    /// `safe_txn_id`. `failed` is the sender's full set of known failures
    /// so receivers can detect rounds running on divergent views.
    FailureSiteUpdate {
        source: NodeId,
        failed: BTreeSet<NodeId>,
        subject: NodeId,
        safe_txn_id: TxnId,
    },
    /// Compressed state machine snapshot shipped to a recovering node,
    /// together with the watermark transaction id it represents.
    SnapshotPayload { watermark: TxnId, blob: Vec<u8> },
    /// A survivor has finished replaying its pending transactions to the
    /// recovering node.
    ShippingComplete { sender: NodeId },
}

impl Message {
    /// Wire tag for this variant, or `None` for local-only messages.
    pub fn wire_tag(&self) -> Option<u8> {
        match self {
            Message::Heartbeat { .. } => Some(TAG_HEARTBEAT),
            Message::HeartbeatResponse { .. } => Some(TAG_HEARTBEAT_RESPONSE),
            Message::Transaction { .. } => Some(TAG_TRANSACTION),
            Message::ClientRequest { .. } => None,
            Message::FaultNotification { .. } => Some(TAG_FAULT_NOTIFICATION),
            Message::FailureSiteUpdate { .. } => Some(TAG_FAILURE_SITE_UPDATE),
            Message::SnapshotPayload { .. } => Some(TAG_SNAPSHOT_PAYLOAD),
            Message::ShippingComplete { .. } => Some(TAG_SHIPPING_COMPLETE),
        }
    }
}
