//! Consistency + Availability: a single authoritative coordinator.
//!
//! The first node in the registry owns the only authoritative store; every
//! other node is a thin client holding a cache. The coordinator serializes
//! all writes simply by being one mailbox: requests are applied in arrival
//! order on its dispatch thread. After acknowledging the requester it
//! refreshes the other caches from a fire-and-forget background thread, so
//! fan-out failures can never reach an already-resolved caller.
//!
//! The model's deliberate weakness is coordinator reachability: if the
//! request cannot even be handed over after the retry budget, or no answer
//! arrives in time, the call fails outright. There is no fallback to a
//! stale local answer; that is the partition intolerance the engine
//! exists to demonstrate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;
use crate::error::EngineError;
use crate::message::Protocol;
use crate::net::Transport;
use crate::pending::{PendingOp, PendingTable};

pub struct CaEngine {
    node: OnceLock<String>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    store: Mutex<BTreeMap<String, String>>,
    pending: PendingTable,
}

impl CaEngine {
    pub(crate) fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self {
            node: OnceLock::new(),
            transport,
            config,
            store: Mutex::new(BTreeMap::new()),
            pending: PendingTable::new(),
        }
    }

    pub fn initialize(&self, node_name: &str) {
        if self.node.set(node_name.to_string()).is_err() {
            warn!(node = node_name, "CA engine initialized twice, keeping first name");
            return;
        }
        info!(node = node_name, "CA engine initialized");
    }

    fn node(&self) -> Result<&str, EngineError> {
        self.node
            .get()
            .map(String::as_str)
            .ok_or(EngineError::NotInitialized)
    }

    fn coordinator(&self) -> Result<String, EngineError> {
        self.transport
            .first_node()
            .ok_or_else(|| EngineError::Transport("no nodes registered".into()))
    }

    fn is_coordinator(&self) -> bool {
        match (self.node.get(), self.transport.first_node()) {
            (Some(node), Some(first)) => *node == first,
            _ => false,
        }
    }

    pub fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let node = self.node()?;
        let coordinator = self.coordinator()?;

        if node == coordinator {
            self.store
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            debug!(node, key, value, "coordinator wrote to the authoritative store");

            let refresh = Protocol::CaUpdate {
                key: key.to_string(),
                value: value.to_string(),
                operation_id: None,
            };
            if let Err(err) = self.transport.broadcast(refresh) {
                warn!(node, key, error = %err, "cache refresh broadcast failed");
            }
            return Ok(());
        }

        let (operation_id, op, gate) = self.pending.register(node, "write", 1);
        debug!(node, key, value, %operation_id, "sending write to coordinator");

        let request = Protocol::CaWriteRequest {
            operation_id: operation_id.clone(),
            key: key.to_string(),
            value: value.to_string(),
        };
        if let Err(err) = self.send_to_coordinator(request, &coordinator) {
            self.pending.remove(&operation_id);
            return Err(err);
        }

        let outcome = self.await_coordinator(&operation_id, &op, &gate);
        // Mirror into the cache only after the coordinator acknowledged;
        // a failed write leaves the cache untouched.
        if outcome.is_ok() {
            self.store
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
        outcome.map(|_| ())
    }

    pub fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        let node = self.node()?;
        let coordinator = self.coordinator()?;

        if node == coordinator {
            return Ok(self.store.lock().unwrap().get(key).cloned());
        }

        if let Some(cached) = self.store.lock().unwrap().get(key) {
            debug!(node, key, value = %cached, "CA read served from cache");
            return Ok(Some(cached.clone()));
        }

        let (operation_id, op, gate) = self.pending.register(node, "read", 1);
        debug!(node, key, %operation_id, "sending read to coordinator");

        let request = Protocol::CaReadRequest {
            operation_id: operation_id.clone(),
            key: key.to_string(),
        };
        if let Err(err) = self.send_to_coordinator(request, &coordinator) {
            self.pending.remove(&operation_id);
            return Err(err);
        }

        let value = self.await_coordinator(&operation_id, &op, &gate)?;
        if let Some(value) = &value {
            self.store
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    pub fn shutdown(&self) {
        self.store.lock().unwrap().clear();
        self.pending.clear();
        info!(node = self.node.get().map(String::as_str).unwrap_or("?"), "CA engine shut down");
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn read_cache_len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    /// Hands a request to the coordinator, retrying a bounded number of
    /// times. Exhaustion means the coordinator is unreachable and the call
    /// fails without consulting the stale cache.
    fn send_to_coordinator(
        &self,
        message: Protocol,
        coordinator: &str,
    ) -> Result<(), EngineError> {
        for attempt in 1..=self.config.send_attempts {
            match self.transport.send(message.clone(), coordinator) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, coordinator, error = %err, "send to coordinator failed");
                    if attempt < self.config.send_attempts {
                        thread::sleep(self.config.send_retry_delay);
                    }
                }
            }
        }
        Err(EngineError::CoordinatorUnreachable {
            attempts: self.config.send_attempts,
        })
    }

    fn await_coordinator(
        &self,
        operation_id: &str,
        op: &PendingOp,
        gate: &Receiver<()>,
    ) -> Result<Option<String>, EngineError> {
        let started = Instant::now();
        let opened = gate.recv_timeout(self.config.coordinator_wait);
        self.pending.remove(operation_id);

        if opened.is_err() {
            return Err(EngineError::CoordinatorTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        if let Some(error) = op.error() {
            return Err(EngineError::CoordinatorReported(error));
        }
        Ok(op.take_value())
    }

    /// Coordinator side of a client write: apply, acknowledge the requester
    /// directly, then refresh everyone else's cache in the background.
    pub(crate) fn process_write_request(
        &self,
        sender: &str,
        operation_id: &str,
        key: &str,
        value: &str,
    ) {
        if !self.is_coordinator() {
            warn!(sender, operation_id, "non-coordinator received a CA write request, ignoring");
            return;
        }
        let node = match self.node() {
            Ok(node) => node,
            Err(err) => {
                self.reply_error(sender, operation_id, &err.to_string());
                return;
            }
        };

        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        debug!(node, sender, operation_id, key, value, "coordinator applied client write");

        // Direct acknowledgment first, so the requester unblocks with the
        // lowest possible latency.
        let ack = Protocol::CaUpdate {
            key: key.to_string(),
            value: value.to_string(),
            operation_id: Some(operation_id.to_string()),
        };
        if let Err(err) = self.transport.send(ack, sender) {
            warn!(sender, operation_id, error = %err, "failed to acknowledge write, requester will time out");
        }

        // Fire-and-forget cache refresh for the rest of the cluster. The
        // requester is already resolved, so failures here stay here.
        let transport = Arc::clone(&self.transport);
        let refresh = Protocol::CaUpdate {
            key: key.to_string(),
            value: value.to_string(),
            operation_id: None,
        };
        thread::spawn(move || {
            if let Err(err) = transport.broadcast(refresh) {
                warn!(error = %err, "background cache refresh failed");
            }
        });
    }

    /// Coordinator side of a client read: answer from the authoritative
    /// store, absent values included.
    pub(crate) fn process_read_request(&self, sender: &str, operation_id: &str, key: &str) {
        if !self.is_coordinator() {
            warn!(sender, operation_id, "non-coordinator received a CA read request, ignoring");
            return;
        }
        let node = match self.node() {
            Ok(node) => node,
            Err(err) => {
                self.reply_error(sender, operation_id, &err.to_string());
                return;
            }
        };

        let value = self.store.lock().unwrap().get(key).cloned();
        debug!(node, sender, operation_id, key, ?value, "coordinator answering read");

        let reply = Protocol::CaReadResponse {
            operation_id: operation_id.to_string(),
            key: key.to_string(),
            value,
        };
        if let Err(err) = self.transport.send(reply, sender) {
            warn!(sender, operation_id, error = %err, "failed to answer CA read request");
        }
    }

    /// Client side of an update from the coordinator: refresh the cache,
    /// and resolve the matching pending write if this is its ack.
    pub(crate) fn process_update(
        &self,
        sender: &str,
        key: &str,
        value: &str,
        operation_id: Option<&str>,
    ) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        debug!(sender, key, value, ?operation_id, "cache refreshed from coordinator");

        if let Some(operation_id) = operation_id {
            if let Some(op) = self.pending.get(operation_id) {
                op.complete(Some(value.to_string()));
            }
        }
    }

    pub(crate) fn process_read_response(
        &self,
        sender: &str,
        operation_id: &str,
        value: Option<&str>,
    ) {
        match self.pending.get(operation_id) {
            Some(op) => {
                debug!(sender, operation_id, ?value, "CA read response");
                op.complete(value.map(str::to_string));
            }
            None => debug!(sender, operation_id, "late CA read response dropped"),
        }
    }

    pub(crate) fn process_error(&self, sender: &str, operation_id: &str, error: &str) {
        if let Some(op) = self.pending.get(operation_id) {
            warn!(sender, operation_id, error, "coordinator reported an error");
            op.fail(error);
        }
    }

    fn reply_error(&self, sender: &str, operation_id: &str, error: &str) {
        let reply = Protocol::CaError {
            operation_id: operation_id.to_string(),
            error: error.to_string(),
        };
        if let Err(err) = self.transport.send(reply, sender) {
            warn!(sender, operation_id, error = %err, "failed to send CA error reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingTransport {
        first: &'static str,
        sent: StdMutex<Vec<(Protocol, String)>>,
        broadcasts: StdMutex<Vec<Protocol>>,
        fail_sends: bool,
    }

    impl RecordingTransport {
        fn new(first: &'static str) -> Arc<Self> {
            Arc::new(Self {
                first,
                sent: StdMutex::new(Vec::new()),
                broadcasts: StdMutex::new(Vec::new()),
                fail_sends: false,
            })
        }

        fn unreachable(first: &'static str) -> Arc<Self> {
            Arc::new(Self {
                first,
                sent: StdMutex::new(Vec::new()),
                broadcasts: StdMutex::new(Vec::new()),
                fail_sends: true,
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, message: Protocol, target: &str) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Severed(target.to_string()));
            }
            self.sent.lock().unwrap().push((message, target.to_string()));
            Ok(())
        }

        fn broadcast(&self, message: Protocol) -> Result<(), TransportError> {
            self.broadcasts.lock().unwrap().push(message);
            Ok(())
        }

        fn node_count(&self) -> usize {
            3
        }

        fn first_node(&self) -> Option<String> {
            Some(self.first.to_string())
        }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            coordinator_wait: Duration::from_millis(80),
            send_retry_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn coordinator_serves_without_round_trips() {
        let transport = RecordingTransport::new("node_0");
        let engine = CaEngine::new(transport.clone(), quick_config());
        engine.initialize("node_0");

        engine.write("a", "1").expect("coordinator write is local");
        assert_eq!(engine.read("a").unwrap().as_deref(), Some("1"));

        // The write still refreshes the other caches.
        let broadcasts = transport.broadcasts.lock().unwrap();
        assert!(matches!(
            &broadcasts[0],
            Protocol::CaUpdate { operation_id: None, .. }
        ));
    }

    #[test]
    fn client_write_mirrors_cache_only_after_ack() {
        let transport = RecordingTransport::new("node_0");
        let engine = Arc::new(CaEngine::new(transport.clone(), quick_config()));
        engine.initialize("node_1");

        let responder = {
            let engine = Arc::clone(&engine);
            let transport = Arc::clone(&transport);
            thread::spawn(move || loop {
                let request = transport.sent.lock().unwrap().first().cloned();
                if let Some((Protocol::CaWriteRequest { operation_id, key, value }, target)) =
                    request
                {
                    assert_eq!(target, "node_0");
                    engine.process_update("node_0", &key, &value, Some(&operation_id));
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        engine.write("a", "1").expect("acknowledged by coordinator");
        responder.join().unwrap();

        assert_eq!(engine.read("a").unwrap().as_deref(), Some("1"));
        assert_eq!(engine.pending_ops(), 0);
    }

    #[test]
    fn client_write_times_out_and_leaves_cache_unchanged() {
        let transport = RecordingTransport::new("node_0");
        let engine = CaEngine::new(transport, quick_config());
        engine.initialize("node_1");

        let err = engine.write("a", "1").unwrap_err();
        assert!(matches!(err, EngineError::CoordinatorTimeout { .. }));
        // No answer means no mirror: the cache must not contain the value.
        assert_eq!(engine.read_cache_len(), 0);
        assert_eq!(engine.pending_ops(), 0);
    }

    #[test]
    fn unreachable_coordinator_fails_after_retry_budget() {
        let transport = RecordingTransport::unreachable("node_0");
        let engine = CaEngine::new(transport, quick_config());
        engine.initialize("node_1");

        let err = engine.write("a", "1").unwrap_err();
        assert!(matches!(
            err,
            EngineError::CoordinatorUnreachable { attempts: 3 }
        ));
        assert_eq!(engine.pending_ops(), 0);
    }

    #[test]
    fn client_read_round_trips_and_caches() {
        let transport = RecordingTransport::new("node_0");
        let engine = Arc::new(CaEngine::new(transport.clone(), quick_config()));
        engine.initialize("node_1");

        let responder = {
            let engine = Arc::clone(&engine);
            let transport = Arc::clone(&transport);
            thread::spawn(move || loop {
                let request = transport.sent.lock().unwrap().first().cloned();
                if let Some((Protocol::CaReadRequest { operation_id, .. }, _)) = request {
                    engine.process_read_response("node_0", &operation_id, Some("fresh"));
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        assert_eq!(engine.read("a").unwrap().as_deref(), Some("fresh"));
        responder.join().unwrap();

        // The second read is a cache hit: no further request goes out.
        let requests_before = transport.sent.lock().unwrap().len();
        assert_eq!(engine.read("a").unwrap().as_deref(), Some("fresh"));
        assert_eq!(transport.sent.lock().unwrap().len(), requests_before);
    }

    #[test]
    fn coordinator_error_reply_surfaces_as_typed_error() {
        let transport = RecordingTransport::new("node_0");
        let engine = Arc::new(CaEngine::new(transport.clone(), quick_config()));
        engine.initialize("node_1");

        let responder = {
            let engine = Arc::clone(&engine);
            let transport = Arc::clone(&transport);
            thread::spawn(move || loop {
                let request = transport.sent.lock().unwrap().first().cloned();
                if let Some((Protocol::CaWriteRequest { operation_id, .. }, _)) = request {
                    engine.process_error("node_0", &operation_id, "store unavailable");
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        let err = engine.write("a", "1").unwrap_err();
        responder.join().unwrap();
        assert!(matches!(
            err,
            EngineError::CoordinatorReported(reason) if reason == "store unavailable"
        ));
    }

    #[test]
    fn non_coordinator_ignores_coordinator_requests() {
        let transport = RecordingTransport::new("node_0");
        let engine = CaEngine::new(transport.clone(), quick_config());
        engine.initialize("node_1");

        engine.process_write_request("node_2", "node_2-write-1", "a", "1");
        engine.process_read_request("node_2", "node_2-read-1", "a");

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(engine.read_cache_len(), 0);
    }
}
