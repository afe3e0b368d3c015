//! Virtual network connecting the simulated nodes.
//!
//! The [`Network`] is an in-process registry: one entry per node, in
//! registration order, each owning the sending half of that node's mailbox
//! channel. Envelopes are encoded to single JSON lines before they enter a
//! mailbox, so everything that crosses between nodes goes through the wire
//! format.
//!
//! Engines never talk to the registry directly; they hold a per-node
//! [`Transport`] handle, a [`NodeLink`]. Tests substitute
//! their own `Transport` implementations to observe or sabotage traffic.
//!
//! Partition injection comes in two flavors, matching the two ways a real
//! network fails:
//!
//! - [`Network::sever`]: the node's links are down. Sends to or from it
//!   fail immediately with [`TransportError::Severed`].
//! - [`Network::blackhole`]: traffic to or from the node silently
//!   disappears. Sends report success and the message is dropped, which is
//!   what forces the timeout paths in the CP and CA engines.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::message::{Envelope, Protocol};

/// Best-effort messaging surface the engines are written against.
pub trait Transport: Send + Sync {
    /// Unicast to one named node. Failure is local and recoverable.
    fn send(&self, message: Protocol, target: &str) -> Result<(), TransportError>;

    /// Best-effort delivery to every other registered node. Individual
    /// unreachable targets are skipped; the call only fails when the sender
    /// itself cannot reach the network.
    fn broadcast(&self, message: Protocol) -> Result<(), TransportError>;

    /// Current membership size, read fresh on every quorum computation.
    fn node_count(&self) -> usize;

    /// Name of the first-registered node, the CA coordinator.
    fn first_node(&self) -> Option<String>;
}

struct NodeSlot {
    name: String,
    mailbox: Sender<String>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: Vec<NodeSlot>,
    severed: HashSet<String>,
    blackholed: HashSet<String>,
}

/// In-process message substrate shared by all nodes of one simulation.
#[derive(Default)]
pub struct Network {
    inner: Mutex<NetworkInner>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node and returns the receiving half of its mailbox.
    /// Re-registering a name replaces the previous mailbox.
    pub fn register(&self, name: &str) -> Receiver<String> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.nodes.iter_mut().find(|slot| slot.name == name) {
            warn!(node = name, "node re-registered, replacing mailbox");
            slot.mailbox = tx;
        } else {
            inner.nodes.push(NodeSlot {
                name: name.to_string(),
                mailbox: tx,
            });
        }
        rx
    }

    /// Removes a node from the membership. Dropping the mailbox sender ends
    /// the node's dispatch loop.
    pub fn deregister(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.retain(|slot| slot.name != name);
        inner.severed.remove(name);
        inner.blackholed.remove(name);
    }

    /// Cuts the node's links: sends to or from it fail immediately.
    pub fn sever(&self, name: &str) {
        self.inner.lock().unwrap().severed.insert(name.to_string());
    }

    /// Makes traffic to or from the node vanish without an error.
    pub fn blackhole(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .blackholed
            .insert(name.to_string());
    }

    /// Undoes [`Network::sever`] and [`Network::blackhole`] for the node.
    pub fn heal(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.severed.remove(name);
        inner.blackholed.remove(name);
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn first_node(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .first()
            .map(|slot| slot.name.clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }

    fn deliver(&self, from: &str, to: &str, payload: &Protocol) -> Result<(), TransportError> {
        let line = Envelope {
            sender: from.to_string(),
            payload: payload.clone(),
        }
        .encode()?;

        let inner = self.inner.lock().unwrap();
        if inner.severed.contains(from) {
            return Err(TransportError::Severed(from.to_string()));
        }
        if inner.severed.contains(to) {
            return Err(TransportError::Severed(to.to_string()));
        }
        if inner.blackholed.contains(from) || inner.blackholed.contains(to) {
            trace!(from, to, "message dropped by blackhole");
            return Ok(());
        }

        let slot = inner
            .nodes
            .iter()
            .find(|slot| slot.name == to)
            .ok_or_else(|| TransportError::UnknownNode(to.to_string()))?;
        slot.mailbox
            .send(line)
            .map_err(|_| TransportError::MailboxClosed(to.to_string()))
    }
}

/// A node's view of the network: stamps the sender on everything going out.
pub struct NodeLink {
    network: Arc<Network>,
    node: String,
}

impl NodeLink {
    pub fn new(network: Arc<Network>, node: &str) -> Self {
        Self {
            network,
            node: node.to_string(),
        }
    }
}

impl Transport for NodeLink {
    fn send(&self, message: Protocol, target: &str) -> Result<(), TransportError> {
        self.network.deliver(&self.node, target, &message)
    }

    fn broadcast(&self, message: Protocol) -> Result<(), TransportError> {
        if self
            .network
            .inner
            .lock()
            .unwrap()
            .severed
            .contains(&self.node)
        {
            return Err(TransportError::Severed(self.node.clone()));
        }

        for name in self.network.node_names() {
            if name == self.node {
                continue;
            }
            if let Err(err) = self.network.deliver(&self.node, &name, &message) {
                debug!(from = %self.node, to = %name, error = %err, "broadcast skipped target");
            }
        }
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.network.node_count()
    }

    fn first_node(&self) -> Option<String> {
        self.network.first_node()
    }
}
