//! The uniform engine contract and the tag-to-constructor factory.
//!
//! The three consistency engines form a closed set, so they live behind a
//! tagged [`Engine`] enum instead of a trait object: one variant per CAP
//! corner, delegation for the shared surface (`initialize`, `write`,
//! `read`, `shutdown`), and a [`create`] factory that is nothing more than
//! a match on the tag.

use std::sync::Arc;
use std::time::Duration;

use crate::ap::ApEngine;
use crate::ca::CaEngine;
use crate::cp::CpEngine;
use crate::error::EngineError;
use crate::message::{Envelope, Protocol};
use crate::net::Transport;

/// The consistency model a node asks for, one per CAP corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyModel {
    /// Availability + Partition tolerance: last-write-wins replication.
    Ap,
    /// Consistency + Partition tolerance: majority quorum.
    Cp,
    /// Consistency + Availability: single coordinator.
    Ca,
}

impl ConsistencyModel {
    pub const ALL: [ConsistencyModel; 3] =
        [ConsistencyModel::Ap, ConsistencyModel::Cp, ConsistencyModel::Ca];
}

impl std::fmt::Display for ConsistencyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyModel::Ap => write!(f, "AP"),
            ConsistencyModel::Cp => write!(f, "CP"),
            ConsistencyModel::Ca => write!(f, "CA"),
        }
    }
}

/// Timing and retry knobs shared by the blocking engines.
///
/// Defaults: a one second quorum budget with a short second wait after a
/// timeout, a five second coordinator budget, and three send attempts
/// spaced fifty milliseconds apart. Tests shrink these to keep the suite
/// fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a CP caller waits for quorum before the grace retry.
    pub quorum_wait: Duration,
    /// One additional, shorter wait after the main quorum budget expires.
    pub quorum_grace: Duration,
    /// How long a CA client waits for the coordinator's answer.
    pub coordinator_wait: Duration,
    /// Attempts to hand a message to the transport before giving up.
    pub send_attempts: usize,
    /// Pause between send attempts.
    pub send_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quorum_wait: Duration::from_millis(1000),
            quorum_grace: Duration::from_millis(250),
            coordinator_wait: Duration::from_millis(5000),
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(50),
        }
    }
}

/// One consistency engine, bound to a single node's transport handle.
pub enum Engine {
    Ap(ApEngine),
    Cp(CpEngine),
    Ca(CaEngine),
}

/// Builds a fresh, uninitialized engine for the requested model.
///
/// The factory never caches; one engine per (node, model) pair is the
/// caller's responsibility (`SimNode` does exactly that for simulated
/// nodes). Call [`Engine::initialize`] exactly once before use.
pub fn create(
    model: ConsistencyModel,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
) -> Engine {
    match model {
        ConsistencyModel::Ap => Engine::Ap(ApEngine::new(transport)),
        ConsistencyModel::Cp => Engine::Cp(CpEngine::new(transport, config)),
        ConsistencyModel::Ca => Engine::Ca(CaEngine::new(transport, config)),
    }
}

impl Engine {
    pub fn model(&self) -> ConsistencyModel {
        match self {
            Engine::Ap(_) => ConsistencyModel::Ap,
            Engine::Cp(_) => ConsistencyModel::Cp,
            Engine::Ca(_) => ConsistencyModel::Ca,
        }
    }

    /// Binds the engine to its node name. Must happen exactly once before
    /// any operation; operations before it fail with `NotInitialized`.
    pub fn initialize(&self, node_name: &str) {
        match self {
            Engine::Ap(engine) => engine.initialize(node_name),
            Engine::Cp(engine) => engine.initialize(node_name),
            Engine::Ca(engine) => engine.initialize(node_name),
        }
    }

    pub fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        match self {
            Engine::Ap(engine) => engine.write(key, value),
            Engine::Cp(engine) => engine.write(key, value),
            Engine::Ca(engine) => engine.write(key, value),
        }
    }

    pub fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        match self {
            Engine::Ap(engine) => engine.read(key),
            Engine::Cp(engine) => engine.read(key),
            Engine::Ca(engine) => engine.read(key),
        }
    }

    /// Clears all local state. Safe to call repeatedly.
    pub fn shutdown(&self) {
        match self {
            Engine::Ap(engine) => engine.shutdown(),
            Engine::Cp(engine) => engine.shutdown(),
            Engine::Ca(engine) => engine.shutdown(),
        }
    }

    /// Number of operations currently awaiting coordination. Always zero
    /// for AP, and zero for CP/CA whenever no call is blocked.
    pub fn pending_ops(&self) -> usize {
        match self {
            Engine::Ap(_) => 0,
            Engine::Cp(engine) => engine.pending_ops(),
            Engine::Ca(engine) => engine.pending_ops(),
        }
    }

    /// Routes an inbound protocol message into the engine. Called on the
    /// receiving node's dispatch thread, never the sender's. Messages for
    /// another model are ignored.
    pub(crate) fn deliver(&self, envelope: &Envelope) {
        let sender = envelope.sender.as_str();
        match (self, &envelope.payload) {
            (Engine::Ap(engine), Protocol::ApUpdate { key, value, timestamp }) => {
                engine.process_update(sender, key, value, *timestamp);
            }

            (Engine::Cp(engine), Protocol::CpWriteRequest { request_id, key, value }) => {
                engine.process_write_request(sender, request_id, key, value);
            }
            (Engine::Cp(engine), Protocol::CpWriteAck { request_id }) => {
                engine.process_write_ack(sender, request_id);
            }
            (Engine::Cp(engine), Protocol::CpWriteNack { request_id, error }) => {
                engine.process_write_nack(sender, request_id, error);
            }
            (Engine::Cp(engine), Protocol::CpReadRequest { request_id, key }) => {
                engine.process_read_request(sender, request_id, key);
            }
            (Engine::Cp(engine), Protocol::CpReadResponse { request_id, value, .. }) => {
                engine.process_read_response(sender, request_id, value.as_deref());
            }
            (Engine::Cp(engine), Protocol::CpReadError { request_id, error }) => {
                engine.process_read_error(sender, request_id, error);
            }

            (Engine::Ca(engine), Protocol::CaWriteRequest { operation_id, key, value }) => {
                engine.process_write_request(sender, operation_id, key, value);
            }
            (Engine::Ca(engine), Protocol::CaUpdate { key, value, operation_id }) => {
                engine.process_update(sender, key, value, operation_id.as_deref());
            }
            (Engine::Ca(engine), Protocol::CaReadRequest { operation_id, key }) => {
                engine.process_read_request(sender, operation_id, key);
            }
            (Engine::Ca(engine), Protocol::CaReadResponse { operation_id, value, .. }) => {
                engine.process_read_response(sender, operation_id, value.as_deref());
            }
            (Engine::Ca(engine), Protocol::CaError { operation_id, error }) => {
                engine.process_error(sender, operation_id, error);
            }

            _ => {}
        }
    }
}
