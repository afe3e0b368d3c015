//! Availability + Partition tolerance: local-first, eventually consistent.
//!
//! Every node owns a full copy of the namespace. Writes land locally,
//! stamped by a per-node logical clock, and are then broadcast on a
//! best-effort basis; reads are always local. Conflicts resolve by
//! last-write-wins on the timestamp, so replicas that exchange all updates
//! for a key converge on the globally highest-stamped value. Nothing here
//! ever blocks on the network and nothing ever fails from the caller's
//! point of view. Staleness is the accepted price.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::message::Protocol;
use crate::net::Transport;

struct Stamped {
    value: String,
    timestamp: u64,
}

pub struct ApEngine {
    node: OnceLock<String>,
    transport: Arc<dyn Transport>,
    store: Mutex<BTreeMap<String, Stamped>>,
    // Logical clock for last-write-wins stamps. Never runs backwards,
    // including across absorbed remote stamps.
    clock: AtomicU64,
}

impl ApEngine {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            node: OnceLock::new(),
            transport,
            store: Mutex::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn initialize(&self, node_name: &str) {
        if self.node.set(node_name.to_string()).is_err() {
            warn!(node = node_name, "AP engine initialized twice, keeping first name");
            return;
        }
        info!(node = node_name, "AP engine initialized");
    }

    fn node(&self) -> Result<&str, EngineError> {
        self.node
            .get()
            .map(String::as_str)
            .ok_or(EngineError::NotInitialized)
    }

    /// Stores locally and replicates asynchronously. Never blocks on the
    /// network; a failed broadcast is logged and swallowed.
    pub fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let node = self.node()?;
        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.lock().unwrap().insert(
            key.to_string(),
            Stamped {
                value: value.to_string(),
                timestamp,
            },
        );
        debug!(node, key, value, timestamp, "AP local write");

        let update = Protocol::ApUpdate {
            key: key.to_string(),
            value: value.to_string(),
            timestamp,
        };
        if let Err(err) = self.transport.broadcast(update) {
            warn!(node, key, error = %err, "AP broadcast failed, continuing unreplicated");
        }
        Ok(())
    }

    /// Returns the local value, however stale it may be.
    pub fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        self.node()?;
        Ok(self
            .store
            .lock()
            .unwrap()
            .get(key)
            .map(|stamped| stamped.value.clone()))
    }

    pub fn shutdown(&self) {
        self.store.lock().unwrap().clear();
        info!(node = self.node.get().map(String::as_str).unwrap_or("?"), "AP engine shut down");
    }

    /// Applies a replicated update from a peer: last-write-wins on the
    /// timestamp, ties and older stamps discarded silently. On acceptance
    /// the local clock is advanced past the remote stamp so this node's
    /// future writes outbid everything it has witnessed.
    pub(crate) fn process_update(&self, sender: &str, key: &str, value: &str, timestamp: u64) {
        let node = self.node.get().map(String::as_str).unwrap_or("?");
        let mut store = self.store.lock().unwrap();
        if let Some(current) = store.get(key) {
            if timestamp <= current.timestamp {
                debug!(
                    node,
                    sender,
                    key,
                    local_timestamp = current.timestamp,
                    remote_timestamp = timestamp,
                    "discarded stale AP update"
                );
                return;
            }
        }
        store.insert(
            key.to_string(),
            Stamped {
                value: value.to_string(),
                timestamp,
            },
        );
        drop(store);

        self.clock.fetch_max(timestamp, Ordering::SeqCst);
        debug!(node, sender, key, value, timestamp, "accepted remote AP update");
    }

    #[cfg(test)]
    fn clock_value(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    /// Transport whose broadcasts always fail, to prove AP swallows them.
    struct DeadTransport;

    impl Transport for DeadTransport {
        fn send(&self, _message: Protocol, target: &str) -> Result<(), TransportError> {
            Err(TransportError::Severed(target.to_string()))
        }

        fn broadcast(&self, _message: Protocol) -> Result<(), TransportError> {
            Err(TransportError::Severed("everyone".into()))
        }

        fn node_count(&self) -> usize {
            1
        }

        fn first_node(&self) -> Option<String> {
            None
        }
    }

    fn engine() -> ApEngine {
        let engine = ApEngine::new(Arc::new(DeadTransport));
        engine.initialize("node_0");
        engine
    }

    #[test]
    fn write_succeeds_even_when_broadcast_fails() {
        let engine = engine();
        engine.write("x", "v1").expect("AP write never fails");
        assert_eq!(engine.read("x").unwrap().as_deref(), Some("v1"));
    }

    #[test]
    fn read_of_missing_key_is_absent() {
        let engine = engine();
        assert_eq!(engine.read("nope").unwrap(), None);
    }

    #[test]
    fn newer_remote_update_wins_older_is_discarded() {
        let engine = engine();
        engine.process_update("node_1", "x", "v1", 5);
        engine.process_update("node_2", "x", "v2", 7);
        assert_eq!(engine.read("x").unwrap().as_deref(), Some("v2"));

        // Equal and older stamps lose.
        engine.process_update("node_3", "x", "stale", 7);
        engine.process_update("node_3", "x", "staler", 3);
        assert_eq!(engine.read("x").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn clock_absorbs_remote_stamps_monotonically() {
        let engine = engine();
        engine.write("a", "1").unwrap();
        assert_eq!(engine.clock_value(), 1);

        engine.process_update("node_1", "x", "v", 41);
        assert_eq!(engine.clock_value(), 41);

        // A later, smaller remote stamp must not rewind the clock.
        engine.process_update("node_1", "y", "w", 12);
        assert_eq!(engine.clock_value(), 41);

        // The next local write outbids everything witnessed so far.
        engine.write("a", "2").unwrap();
        assert_eq!(engine.clock_value(), 42);
    }

    #[test]
    fn uninitialized_engine_reports_a_typed_error() {
        let engine = ApEngine::new(Arc::new(DeadTransport));
        assert!(matches!(
            engine.write("x", "v"),
            Err(EngineError::NotInitialized)
        ));
        assert!(matches!(engine.read("x"), Err(EngineError::NotInitialized)));
    }
}
