//! Consistency + Partition tolerance: majority-quorum reads and writes.
//!
//! Every accepted operation needs proof that a majority of the *current*
//! membership participated. Two majorities cannot exist on opposite sides
//! of a partition, so operations on the minority side fail instead of
//! diverging. Consistency is bought with availability.
//!
//! The caller's thread blocks on a pending-operation gate while acks or
//! read responses accumulate on the dispatch thread. The local node votes
//! too: its store is applied (or read) immediately and counted as the
//! first response. A single nack from any peer resolves the operation
//! with an error right away rather than waiting out the timeout.
//!
//! Read responses are not compared by version; the first non-null value
//! observed is the result. That is a deliberate, documented simplification
//! of the model.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;
use crate::error::EngineError;
use crate::message::Protocol;
use crate::net::Transport;
use crate::pending::{PendingOp, PendingTable};

/// Majority quorum over the current membership.
pub(crate) fn quorum(node_count: usize) -> usize {
    node_count / 2 + 1
}

pub struct CpEngine {
    node: OnceLock<String>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    store: Mutex<BTreeMap<String, String>>,
    pending: PendingTable,
}

impl CpEngine {
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
            warn!(node = node_name, "CP engine initialized twice, keeping first name");
            return;
        }
        info!(node = node_name, "CP engine initialized");
    }

    fn node(&self) -> Result<&str, EngineError> {
        self.node
            .get()
            .map(String::as_str)
            .ok_or(EngineError::NotInitialized)
    }

    /// Writes under majority quorum. The local store is updated first and
    /// counts as one vote; the rest must ack before the budget runs out.
    pub fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let node = self.node()?;
        let required = quorum(self.transport.node_count());
        let (request_id, op, gate) = self.pending.register(node, "write", required);
        debug!(node, key, value, %request_id, required, "CP write starting");

        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        op.acknowledge();

        let request = Protocol::CpWriteRequest {
            request_id: request_id.clone(),
            key: key.to_string(),
            value: value.to_string(),
        };
        if let Err(err) = self.broadcast_with_retry(request) {
            self.pending.remove(&request_id);
            return Err(err);
        }

        self.await_quorum(&request_id, &op, &gate).map(|_| ())
    }

    /// Reads under majority quorum: every reachable peer reports its copy,
    /// and the first non-null value observed is returned.
    pub fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        let node = self.node()?;
        let required = quorum(self.transport.node_count());
        let (request_id, op, gate) = self.pending.register(node, "read", required);
        debug!(node, key, %request_id, required, "CP read starting");

        if let Some(local) = self.store.lock().unwrap().get(key) {
            op.offer_value(local);
        }
        op.acknowledge();

        let request = Protocol::CpReadRequest {
            request_id: request_id.clone(),
            key: key.to_string(),
        };
        if let Err(err) = self.broadcast_with_retry(request) {
            self.pending.remove(&request_id);
            return Err(err);
        }

        self.await_quorum(&request_id, &op, &gate)
    }

    pub fn shutdown(&self) {
        self.store.lock().unwrap().clear();
        self.pending.clear();
        info!(node = self.node.get().map(String::as_str).unwrap_or("?"), "CP engine shut down");
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Blocks on the gate for the main budget, then once more for the
    /// shorter grace period, then gives up. The pending entry is removed on
    /// every exit path; a response arriving later misses the lookup.
    fn await_quorum(
        &self,
        request_id: &str,
        op: &PendingOp,
        gate: &Receiver<()>,
    ) -> Result<Option<String>, EngineError> {
        let opened = gate
            .recv_timeout(self.config.quorum_wait)
            .or_else(|_| gate.recv_timeout(self.config.quorum_grace));
        self.pending.remove(request_id);

        if opened.is_err() {
            return Err(EngineError::QuorumNotReached {
                received: op.responses(),
                required: op.required(),
            });
        }
        if let Some(error) = op.error() {
            return Err(EngineError::PeerReported(error));
        }
        Ok(op.take_value())
    }

    fn broadcast_with_retry(&self, message: Protocol) -> Result<(), EngineError> {
        let mut last_error = None;
        let attempts = self.config.send_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.broadcast(message.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "CP broadcast attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.config.send_retry_delay);
                    }
                }
            }
        }
        Err(EngineError::Transport(
            last_error.expect("at least one attempt").to_string(),
        ))
    }

    /// Peer side of the write phase: apply locally and ack, or nack with
    /// the reason.
    pub(crate) fn process_write_request(
        &self,
        sender: &str,
        request_id: &str,
        key: &str,
        value: &str,
    ) {
        let reply = match self.node() {
            Ok(node) => {
                self.store
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
                debug!(node, sender, request_id, key, value, "applied CP write request");
                Protocol::CpWriteAck {
                    request_id: request_id.to_string(),
                }
            }
            Err(err) => Protocol::CpWriteNack {
                request_id: request_id.to_string(),
                error: err.to_string(),
            },
        };
        if let Err(err) = self.transport.send(reply, sender) {
            warn!(sender, request_id, error = %err, "failed to answer CP write request");
        }
    }

    pub(crate) fn process_write_ack(&self, sender: &str, request_id: &str) {
        match self.pending.get(request_id) {
            Some(op) => {
                debug!(sender, request_id, "CP write ack");
                op.acknowledge();
            }
            None => debug!(sender, request_id, "late CP write ack dropped"),
        }
    }

    pub(crate) fn process_write_nack(&self, sender: &str, request_id: &str, error: &str) {
        if let Some(op) = self.pending.get(request_id) {
            warn!(sender, request_id, error, "CP write nack, failing fast");
            op.fail(error);
        }
    }

    /// Peer side of the read phase: report the local copy, absent or not.
    pub(crate) fn process_read_request(&self, sender: &str, request_id: &str, key: &str) {
        let reply = match self.node() {
            Ok(node) => {
                let value = self.store.lock().unwrap().get(key).cloned();
                debug!(node, sender, request_id, key, ?value, "answering CP read request");
                Protocol::CpReadResponse {
                    request_id: request_id.to_string(),
                    key: key.to_string(),
                    value,
                }
            }
            Err(err) => Protocol::CpReadError {
                request_id: request_id.to_string(),
                error: err.to_string(),
            },
        };
        if let Err(err) = self.transport.send(reply, sender) {
            warn!(sender, request_id, error = %err, "failed to answer CP read request");
        }
    }

    pub(crate) fn process_read_response(
        &self,
        sender: &str,
        request_id: &str,
        value: Option<&str>,
    ) {
        match self.pending.get(request_id) {
            Some(op) => {
                debug!(sender, request_id, ?value, "CP read response");
                if let Some(value) = value {
                    op.offer_value(value);
                }
                op.acknowledge();
            }
            None => debug!(sender, request_id, "late CP read response dropped"),
        }
    }

    pub(crate) fn process_read_error(&self, sender: &str, request_id: &str, error: &str) {
        if let Some(op) = self.pending.get(request_id) {
            warn!(sender, request_id, error, "CP read error, failing fast");
            op.fail(error);
        }
    }
}
