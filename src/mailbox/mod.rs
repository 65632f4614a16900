//! In-process cluster transport.
//!
//! Every node owns a [`NodeMailbox`] with two inbound lanes: a front lane
//! for messages that must be consumed before anything else (re-queued
//! fault triggers, superset updates observed mid-round) and a normal lane
//! for everything arriving off the wire. Remote sends are framed through
//! [`wire`] so the test transport exercises the same encode/decode path a
//! socket transport would.
//!
//! [`ClusterNetwork`] wires the mailboxes together over crossbeam channels
//! and exposes per-link kill switches for partition tests. Endpoints clone
//! the underlying receivers, so a node that crashed and dropped its mailbox
//! can take a fresh endpoint for the same id when it rejoins.

pub mod wire;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::agreement::message::Message;
use crate::NodeId;
use wire::WireError;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no route to node {target}")]
    UnknownTarget { target: NodeId },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What actually travels on the channels. Loopback and locally re-queued
/// messages skip the wire codec; everything between distinct nodes is a
/// framed byte vector.
#[derive(Debug)]
enum Envelope {
    Wire(Vec<u8>),
    Local(Message),
}

/// Clonable producer half of a node's mailbox. Used for local submission
/// and for re-queueing messages the engine is not ready to consume.
#[derive(Clone)]
pub struct MailboxHandle {
    front_tx: Sender<Envelope>,
    normal_tx: Sender<Envelope>,
}

impl MailboxHandle {
    /// Appends to the back of the normal lane.
    pub fn deliver(&self, msg: Message) {
        let _ = self.normal_tx.send(Envelope::Local(msg));
    }

    /// Appends to the front lane, ahead of all normal traffic.
    pub fn deliver_front(&self, msg: Message) {
        let _ = self.front_tx.send(Envelope::Local(msg));
    }
}

/// A node's endpoint on the cluster network: two inbound lanes plus a
/// sender for every peer.
pub struct NodeMailbox {
    node_id: NodeId,
    front_rx: Receiver<Envelope>,
    normal_rx: Receiver<Envelope>,
    front_tx: Sender<Envelope>,
    normal_tx: Sender<Envelope>,
    peers: HashMap<NodeId, Sender<Envelope>>,
    links: HashMap<NodeId, Arc<AtomicBool>>,
}

impl NodeMailbox {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn handle(&self) -> MailboxHandle {
        MailboxHandle {
            front_tx: self.front_tx.clone(),
            normal_tx: self.normal_tx.clone(),
        }
    }

    /// Sends a message to `target`. Self-sends loop back through the
    /// normal lane without touching the codec. A severed link or a peer
    /// whose mailbox is gone swallows the message, mirroring a dropped
    /// datagram; only a target the network never knew is an error.
    pub fn send(&self, target: NodeId, msg: &Message) -> Result<(), SendError> {
        if target == self.node_id {
            let _ = self.normal_tx.send(Envelope::Local(msg.clone()));
            return Ok(());
        }
        let tx = self
            .peers
            .get(&target)
            .ok_or(SendError::UnknownTarget { target })?;
        let link = &self.links[&target];
        if !link.load(Ordering::Acquire) {
            debug!(from = self.node_id, to = target, "link down, dropping message");
            return Ok(());
        }
        let frame = wire::encode(msg)?;
        if tx.send(Envelope::Wire(frame)).is_err() {
            debug!(from = self.node_id, to = target, "peer mailbox gone, dropping message");
        }
        Ok(())
    }

    /// Receives the next message, draining the front lane first. Blocks up
    /// to `timeout` across both lanes. A frame that fails to decode is
    /// logged and skipped; the deadline still holds.
    pub fn recv_blocking(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let envelope = match self.front_rx.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    select! {
                        recv(self.front_rx) -> e => match e {
                            Ok(envelope) => envelope,
                            Err(_) => return None,
                        },
                        recv(self.normal_rx) -> e => match e {
                            Ok(envelope) => envelope,
                            Err(_) => return None,
                        },
                        default(remaining) => return None,
                    }
                }
            };
            match envelope {
                Envelope::Local(msg) => return Some(msg),
                Envelope::Wire(frame) => match wire::decode(&frame) {
                    Ok(msg) => return Some(msg),
                    Err(err) => {
                        warn!(node = self.node_id, %err, "discarding undecodable frame");
                    }
                },
            }
        }
    }
}

struct NodeChannels {
    front_tx: Sender<Envelope>,
    front_rx: Receiver<Envelope>,
    normal_tx: Sender<Envelope>,
    normal_rx: Receiver<Envelope>,
}

/// Full-mesh in-process network over crossbeam channels.
pub struct ClusterNetwork {
    nodes: BTreeMap<NodeId, NodeChannels>,
    links: HashMap<(NodeId, NodeId), Arc<AtomicBool>>,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl ClusterNetwork {
    pub fn new(sites: &BTreeSet<NodeId>) -> Self {
        let mut nodes = BTreeMap::new();
        for &id in sites {
            let (front_tx, front_rx) = unbounded();
            let (normal_tx, normal_rx) = unbounded();
            nodes.insert(
                id,
                NodeChannels {
                    front_tx,
                    front_rx,
                    normal_tx,
                    normal_rx,
                },
            );
        }
        let mut links = HashMap::new();
        for &a in sites {
            for &b in sites {
                if a < b {
                    links.insert((a, b), Arc::new(AtomicBool::new(true)));
                }
            }
        }
        Self { nodes, links }
    }

    /// Builds an endpoint for `node`. Receivers are clones of the shared
    /// channels, so taking a second endpoint for the same id after the
    /// first was dropped picks up where the old one left off.
    ///
    /// # Panics
    ///
    /// Panics if `node` was not in the site set at construction.
    pub fn endpoint(&self, node: NodeId) -> NodeMailbox {
        let own = self
            .nodes
            .get(&node)
            .unwrap_or_else(|| panic!("node {node} is not part of this network"));
        let mut peers = HashMap::new();
        let mut links = HashMap::new();
        for (&id, channels) in &self.nodes {
            if id == node {
                continue;
            }
            peers.insert(id, channels.normal_tx.clone());
            links.insert(id, Arc::clone(&self.links[&link_key(node, id)]));
        }
        NodeMailbox {
            node_id: node,
            front_rx: own.front_rx.clone(),
            normal_rx: own.normal_rx.clone(),
            front_tx: own.front_tx.clone(),
            normal_tx: own.normal_tx.clone(),
            peers,
            links,
        }
    }

    /// Severs the link between two nodes in both directions.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        if let Some(link) = self.links.get(&link_key(a, b)) {
            link.store(false, Ordering::Release);
        }
    }

    pub fn reconnect(&self, a: NodeId, b: NodeId) {
        if let Some(link) = self.links.get(&link_key(a, b)) {
            link.store(true, Ordering::Release);
        }
    }
}
