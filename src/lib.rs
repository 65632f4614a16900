//! concord: the metadata/agreement layer of a distributed database cluster.
//!
//! Each cluster node runs one [`AgreementEngine`]: a single-threaded event
//! loop that stamps locally-originated requests with globally-ordered
//! transaction ids, broadcasts them to every live peer, and releases
//! transactions to an embedded [`StateMachine`] only once every surviving
//! node is guaranteed to release them in the same order. There is no leader;
//! ordering evidence flows through heartbeats, node failures are settled by
//! an explicit quorum round over each failed node's safe point, and a
//! rejoining node is brought back with a compressed snapshot plus a replay
//! of in-flight transactions.
//!
//! # Invariants
//!
//! 1. **Total order**: every surviving node applies the same transactions in
//!    the same order, consistent with transaction-id order.
//! 2. **Exactly once**: no transaction id is handed to the state machine
//!    twice, and nothing at or below a node's recovery watermark is ever
//!    released after that node recovers.
//! 3. **Quorum before discard**: an in-flight transaction from a failed node
//!    is discarded only after every survivor agrees no one needs it.

pub mod agreement;
pub mod errors;
pub mod ids;
pub mod mailbox;
pub mod statemachine;

/// Identifier of one agreement site (one per cluster node).
///
/// Must fit in the low bits of a transaction id; see [`ids`].
pub type NodeId = u32;

/// Globally unique, time-ordered transaction identifier. `0` is reserved as
/// the unset sentinel; no real transaction carries id 0.
pub type TxnId = u64;

/// Sentinel for "no transaction id known yet".
pub const UNSET_TXN_ID: TxnId = 0;

pub use agreement::engine::{AgreementEngine, EngineConfig, FaultResolution};
pub use agreement::message::Message;
pub use agreement::queue::{OrderingQueue, QueueState};
pub use agreement::safety::SafetyTracker;
pub use agreement::txn::TransactionRecord;
pub use errors::FatalError;
pub use ids::TxnIdSource;
pub use mailbox::{ClusterNetwork, MailboxHandle, NodeMailbox, SendError};
pub use statemachine::{DirectoryStore, StateMachine};
