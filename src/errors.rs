//! Error taxonomy for the agreement layer.
//!
//! Only protocol-fatal conditions are materialized as error values; they
//! propagate out of the engine loop as `Result<_, FatalError>` and the
//! process bootstrap is expected to abort on them, because partially-applied
//! agreement state cannot be trusted to resume. Everything else (duplicate
//! transaction ids during recovery replay, stale failure updates, an empty
//! poll) is absorbed locally with a log line and never becomes an `Err`.

use thiserror::Error;

use crate::mailbox::SendError;
use crate::{NodeId, TxnId};

/// Invariant violations that require an immediate halt of the whole node.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The ordering queue released a transaction from before this node's
    /// recovery completed. Applying it would duplicate an operation already
    /// contained in the recovery snapshot.
    #[error(
        "released transaction {txn_id:#x} at or below recovery watermark {watermark:#x}"
    )]
    ReleasedBelowWatermark { txn_id: TxnId, watermark: TxnId },

    /// A fault round completed without any survivor contributing a safe
    /// point for a failed site. The quorum data is unusable.
    #[error("fault round resolved no safe point for failed site {site}")]
    MissingSafePoint { site: NodeId },

    /// A heartbeat or fault broadcast could not be handed to the transport.
    /// Treated as evidence the local messaging layer is broken, not as a
    /// transient condition.
    #[error("send to site {target} failed")]
    Send {
        target: NodeId,
        #[source]
        source: SendError,
    },

    /// A recovery snapshot arrived while this node was not recovering.
    #[error("snapshot payload received while not recovering")]
    SnapshotOutOfOrder,

    /// The recovery snapshot could not be decompressed or loaded into the
    /// state machine.
    #[error("recovery snapshot could not be restored: {0}")]
    SnapshotCorrupt(String),

    /// A node failure was reported while this node was itself mid-recovery.
    /// An explicit simplification: recovery cannot proceed safely while
    /// membership is also changing, so the node halts and retries rejoin.
    #[error("fault reported for site {site} while this node was recovering")]
    FaultDuringRecovery { site: NodeId },

    /// A snapshot carried a watermark below one already accepted.
    #[error(
        "recovery watermark {received:#x} regressed below accepted {current:#x}"
    )]
    WatermarkRegression { received: TxnId, current: TxnId },
}
