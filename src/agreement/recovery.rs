//! Rejoin support: snapshot shipping and pending-stream replay.
//!
//! A node that rejoins after failing gets no durable log to replay.
//! Instead, the lowest-id survivor ships a compressed snapshot of the
//! state machine together with the watermark transaction id it embodies,
//! and EVERY survivor replays its pending (unreleased) transactions to the
//! rejoiner in ascending order, closing with `ShippingComplete`. Replaying
//! from all survivors is deliberately redundant: the union is exactly the
//! pending set, duplicates are cheap to drop, and no single survivor's
//! view has to be complete.
//!
//! Recovery is done when the snapshot has been restored and every survivor
//! has said it finished shipping. Until then the rejoiner queues but never
//! releases, and it permanently refuses to release anything at or below
//! the watermark.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::NodeId;

/// Which survivor ships the snapshot: the lowest-id live site that is not
/// the rejoiner itself. `None` only if the rejoiner would be alone, in
/// which case there is nothing to recover from.
pub fn snapshot_shipper(live: &BTreeSet<NodeId>, rejoining: NodeId) -> Option<NodeId> {
    live.iter().copied().find(|&site| site != rejoining)
}

pub fn pack_snapshot(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn unpack_snapshot(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Tracks a rejoiner's progress toward normal operation.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Normal,
    Recovering {
        /// Survivors that have not yet sent `ShippingComplete`.
        awaiting: BTreeSet<NodeId>,
        snapshot_loaded: bool,
    },
}

impl RecoveryState {
    /// Entry state for `self_id` rejoining a cluster whose surviving
    /// members are `survivors`. Only survivors can ship; a site that is
    /// itself down must never appear in the awaited set or completion
    /// would wait on it forever.
    pub fn recovering(survivors: &BTreeSet<NodeId>, self_id: NodeId) -> Self {
        RecoveryState::Recovering {
            awaiting: survivors.iter().copied().filter(|&s| s != self_id).collect(),
            snapshot_loaded: false,
        }
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, RecoveryState::Recovering { .. })
    }

    /// Records a survivor finishing its replay. False for a sender not in
    /// the awaited set (a stale or repeated completion).
    pub fn note_shipping_complete(&mut self, sender: NodeId) -> bool {
        match self {
            RecoveryState::Recovering { awaiting, .. } => awaiting.remove(&sender),
            RecoveryState::Normal => false,
        }
    }

    pub fn note_snapshot_loaded(&mut self) {
        if let RecoveryState::Recovering {
            snapshot_loaded, ..
        } = self
        {
            *snapshot_loaded = true;
        }
    }

    /// Whether both halves of recovery have arrived.
    pub fn is_complete(&self) -> bool {
        match self {
            RecoveryState::Normal => false,
            RecoveryState::Recovering {
                awaiting,
                snapshot_loaded,
            } => awaiting.is_empty() && *snapshot_loaded,
        }
    }
}
