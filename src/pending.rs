//! Tracking for in-flight coordinated operations.
//!
//! A blocking `write`/`read` on the CP or CA engine registers a
//! [`PendingOp`] here, then parks on the returned gate receiver. Responses
//! arrive on the node's dispatch thread, find the entry by request id, and
//! update it; when the entry has seen enough responses (or an explicit
//! failure) the gate fires and the caller resumes. The table is the only
//! rendezvous point between the two threads.
//!
//! The gate is the request/response channel pair idiom: the entry holds the
//! sender, the blocked caller holds the receiver and waits with
//! `recv_timeout`. An atomic flag makes sure the gate fires at most once no
//! matter how many responses race in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Coordination state for one in-flight operation.
pub struct PendingOp {
    required: usize,
    responses: AtomicUsize,
    opened: AtomicBool,
    gate: Sender<()>,
    value: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
}

impl PendingOp {
    fn new(required: usize, gate: Sender<()>) -> Self {
        Self {
            required,
            responses: AtomicUsize::new(0),
            opened: AtomicBool::new(false),
            gate,
            value: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    /// Counts one positive response; opens the gate once the count reaches
    /// the required quorum.
    pub fn acknowledge(&self) {
        let seen = self.responses.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= self.required {
            self.open();
        }
    }

    /// Records a value if none has been recorded yet. The first non-null
    /// value observed wins; later ones are ignored.
    pub fn offer_value(&self, value: &str) {
        let mut slot = self.value.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    /// Resolves the operation with a (possibly absent) result and opens the
    /// gate, regardless of the response count.
    pub fn complete(&self, value: Option<String>) {
        if let Some(value) = value {
            self.offer_value(&value);
        }
        self.open();
    }

    /// Resolves the operation with an error and opens the gate immediately,
    /// bypassing any remaining quorum wait.
    pub fn fail(&self, error: &str) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
        drop(slot);
        self.open();
    }

    fn open(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            let _ = self.gate.send(());
        }
    }

    pub fn responses(&self) -> usize {
        self.responses.load(Ordering::SeqCst)
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn take_value(&self) -> Option<String> {
        self.value.lock().unwrap().take()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }
}

/// Per-engine map from request id to in-flight coordination state.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Arc<PendingOp>>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and tracks a fresh operation. The id is globally unique
    /// while the operation is pending: node names are unique per network
    /// and the counter never repeats within an engine.
    pub fn register(
        &self,
        node: &str,
        kind: &str,
        required: usize,
    ) -> (String, Arc<PendingOp>, Receiver<()>) {
        let id = format!("{node}-{kind}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (gate_tx, gate_rx) = unbounded();
        let op = Arc::new(PendingOp::new(required, gate_tx));
        self.entries.lock().unwrap().insert(id.clone(), op.clone());
        (id, op, gate_rx)
    }

    /// Looks up a live entry. Responses that arrive after the caller gave
    /// up and removed the entry get `None` and are dropped harmlessly.
    pub fn get(&self, id: &str) -> Option<Arc<PendingOp>> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn gate_opens_once_quorum_is_reached() {
        let table = PendingTable::new();
        let (_, op, gate) = table.register("node_0", "write", 3);

        op.acknowledge();
        op.acknowledge();
        assert!(gate.recv_timeout(Duration::from_millis(20)).is_err());

        op.acknowledge();
        assert!(gate.recv_timeout(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn gate_fires_at_most_once() {
        let table = PendingTable::new();
        let (_, op, gate) = table.register("node_0", "write", 1);

        op.acknowledge();
        op.acknowledge();
        op.fail("late failure");

        assert!(gate.recv_timeout(Duration::from_millis(20)).is_ok());
        // A second receive must find the channel empty.
        assert!(gate.recv_timeout(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn failure_opens_the_gate_without_quorum() {
        let table = PendingTable::new();
        let (_, op, gate) = table.register("node_0", "write", 5);

        op.fail("peer rejected");

        assert!(gate.recv_timeout(Duration::from_millis(20)).is_ok());
        assert_eq!(op.error().as_deref(), Some("peer rejected"));
    }

    #[test]
    fn first_offered_value_wins() {
        let table = PendingTable::new();
        let (_, op, _gate) = table.register("node_0", "read", 2);

        op.offer_value("first");
        op.offer_value("second");

        assert_eq!(op.take_value().as_deref(), Some("first"));
    }

    #[test]
    fn ids_are_distinct_and_removal_makes_lookups_miss() {
        let table = PendingTable::new();
        let (id_a, _op_a, _gate_a) = table.register("node_0", "write", 1);
        let (id_b, _op_b, _gate_b) = table.register("node_0", "write", 1);
        assert_ne!(id_a, id_b);

        table.remove(&id_a);
        assert!(table.get(&id_a).is_none());
        assert!(table.get(&id_b).is_some());
        assert_eq!(table.len(), 1);
    }
}
