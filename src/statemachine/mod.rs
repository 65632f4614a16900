//! What the agreement layer agrees on.
//!
//! The engine releases an identical transaction stream at every node;
//! feeding that stream into a deterministic [`StateMachine`] keeps every
//! replica's state byte-identical. Snapshots exist solely to bring a
//! recovering node up to a watermark without replaying history; they are
//! never durable.

pub mod directory;

use thiserror::Error;

pub use directory::DirectoryStore;

use crate::{NodeId, TxnId};

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("snapshot did not decode: {0}")]
    Decode(#[from] bincode::Error),
}

/// Deterministic replicated state machine.
///
/// `apply` must produce the same state at every replica given the same
/// payload stream; it has no error channel because a payload that cannot
/// be interpreted must be ignored identically everywhere, not rejected at
/// one node and accepted at another.
pub trait StateMachine {
    fn apply(&mut self, payload: &[u8], txn_id: TxnId);

    /// Serialized copy of the full state, for shipping to a recovering
    /// node.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the full state with a shipped snapshot.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), RestoreError>;

    /// Tears down any state owned by a failed node. Invoked at every
    /// survivor at the same point in the stream, so the teardown itself is
    /// deterministic.
    fn close_sessions(&mut self, owner: NodeId);
}
