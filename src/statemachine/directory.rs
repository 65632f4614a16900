//! Reference state machine: a small hierarchical directory of named nodes
//! with session-scoped ephemerals, the shape of metadata store the
//! agreement layer exists to replicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::statemachine::{RestoreError, StateMachine};
use crate::{NodeId, TxnId};

/// Operations accepted as transaction payloads, bincode-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryOp {
    OpenSession { session: u64, owner: NodeId },
    CloseSession { session: u64 },
    CreateNode {
        path: String,
        data: Vec<u8>,
        /// When set, the node dies with this session.
        ephemeral: Option<u64>,
    },
    SetData { path: String, data: Vec<u8> },
    DeleteNode { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct NodeEntry {
    data: Vec<u8>,
    ephemeral_session: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStore {
    nodes: BTreeMap<String, NodeEntry>,
    sessions: BTreeMap<u64, NodeId>,
    last_applied: TxnId,
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> TxnId {
        self.last_applied
    }

    pub fn data(&self, path: &str) -> Option<&[u8]> {
        self.nodes.get(path).map(|entry| entry.data.as_slice())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn apply_op(&mut self, op: DirectoryOp) {
        match op {
            DirectoryOp::OpenSession { session, owner } => {
                self.sessions.insert(session, owner);
            }
            DirectoryOp::CloseSession { session } => {
                self.sessions.remove(&session);
                self.drop_ephemerals_of(session);
            }
            DirectoryOp::CreateNode {
                path,
                data,
                ephemeral,
            } => {
                // An ephemeral with no live session would be unkillable.
                if let Some(session) = ephemeral {
                    if !self.sessions.contains_key(&session) {
                        return;
                    }
                }
                self.nodes.entry(path).or_insert(NodeEntry {
                    data,
                    ephemeral_session: ephemeral,
                });
            }
            DirectoryOp::SetData { path, data } => {
                if let Some(entry) = self.nodes.get_mut(&path) {
                    entry.data = data;
                }
            }
            DirectoryOp::DeleteNode { path } => {
                self.nodes.remove(&path);
            }
        }
    }

    fn drop_ephemerals_of(&mut self, session: u64) {
        self.nodes
            .retain(|_, entry| entry.ephemeral_session != Some(session));
    }
}

impl StateMachine for DirectoryStore {
    fn apply(&mut self, payload: &[u8], txn_id: TxnId) {
        self.last_applied = txn_id;
        match bincode::deserialize::<DirectoryOp>(payload) {
            Ok(op) => self.apply_op(op),
            // Every replica sees the same bytes, so every replica skips
            // the same malformed payload.
            Err(err) => warn!(txn_id, %err, "ignoring undecodable directory op"),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), RestoreError> {
        *self = bincode::deserialize(bytes)?;
        Ok(())
    }

    fn close_sessions(&mut self, owner: NodeId) {
        let dead: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, &o)| o == owner)
            .map(|(&s, _)| s)
            .collect();
        for session in dead {
            self.sessions.remove(&session);
            self.drop_ephemerals_of(session);
        }
    }
}
