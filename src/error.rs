//! Typed failure kinds for shared-memory operations.
//!
//! Every engine reports coordination failures through [`EngineError`] so
//! callers can match on the kind instead of parsing message strings. The
//! AP engine never surfaces any of these from `write`/`read`; the CP and
//! CA engines surface exactly the variants documented on each method.

use thiserror::Error;

/// Errors surfaced by `write` and `read` on a consistency engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was used before `initialize` bound it to a node name.
    #[error("engine used before initialize")]
    NotInitialized,

    /// A send or broadcast could not even be handed to the transport,
    /// after the configured number of attempts.
    #[error("local transport failure: {0}")]
    Transport(String),

    /// A CP operation timed out before a majority of the current
    /// membership responded. Carries how far the operation got.
    #[error("quorum not reached: {received} of {required} responses")]
    QuorumNotReached { received: usize, required: usize },

    /// A CP peer explicitly rejected the operation.
    #[error("peer rejected operation: {0}")]
    PeerReported(String),

    /// The CA coordinator could not be handed the request at all.
    #[error("coordinator unreachable after {attempts} send attempts")]
    CoordinatorUnreachable { attempts: usize },

    /// The CA coordinator accepted the request but never answered.
    #[error("coordinator did not respond within {waited_ms} ms")]
    CoordinatorTimeout { waited_ms: u64 },

    /// The CA coordinator explicitly rejected the operation.
    #[error("coordinator rejected operation: {0}")]
    CoordinatorReported(String),
}

/// Errors raised by the transport layer when a message cannot be delivered.
///
/// These stay local to the sending node; engines either swallow them (AP),
/// or retry and convert them into an [`EngineError`] kind (CP, CA).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target name is not registered with the network.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// A severed link: the node cannot reach the network at all.
    #[error("link to {0} is severed")]
    Severed(String),

    /// The target deregistered while the message was in flight.
    #[error("mailbox for {0} is closed")]
    MailboxClosed(String),

    /// The envelope could not be put on the wire.
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
