//! The unit of work flowing through the ordering queue.

use serde::{Deserialize, Serialize};

use crate::{NodeId, TxnId};

/// A single agreement transaction as held by the ordering queue.
///
/// The payload is opaque at this layer; only the state machine on the far
/// side of release interprets it. The initiator is redundant with the low
/// bits of the txn id but kept denormalized so queue bookkeeping never has
/// to re-derive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txn_id: TxnId,
    pub initiator: NodeId,
    pub payload: Vec<u8>,
}

impl TransactionRecord {
    pub fn new(txn_id: TxnId, initiator: NodeId, payload: Vec<u8>) -> Self {
        Self {
            txn_id,
            initiator,
            payload,
        }
    }
}
