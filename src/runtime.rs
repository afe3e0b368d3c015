//! Simulated node runtime: one dispatch thread per node.
//!
//! A [`SimNode`] registers a mailbox with the [`Network`] and spawns a
//! thread that drains it for the node's lifetime. Every inbound envelope
//! is decoded and handed to the engine owning that protocol family, on
//! the receiver's thread, never the sender's. Application code (a demo
//! scenario, a test) calls `write`/`read` on the engines from its own
//! thread; the dispatch thread is what eventually opens the gates those
//! calls block on.
//!
//! Engines are created lazily, one per (node, model) pair, and cached
//! here; the factory itself never caches.

use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::engine::{self, ConsistencyModel, Engine, EngineConfig};
use crate::message::Envelope;
use crate::net::{Network, NodeLink};

pub struct SimNode {
    name: String,
    network: Arc<Network>,
    config: EngineConfig,
    ap: OnceLock<Arc<Engine>>,
    cp: OnceLock<Arc<Engine>>,
    ca: OnceLock<Arc<Engine>>,
}

impl SimNode {
    /// Registers the node and starts its dispatch thread.
    pub fn spawn(name: &str, network: &Arc<Network>) -> Arc<SimNode> {
        Self::spawn_with_config(name, network, EngineConfig::default())
    }

    /// Same as [`SimNode::spawn`] with explicit engine timing, which tests
    /// use to keep timeout scenarios fast.
    pub fn spawn_with_config(
        name: &str,
        network: &Arc<Network>,
        config: EngineConfig,
    ) -> Arc<SimNode> {
        let mailbox = network.register(name);
        let node = Arc::new(SimNode {
            name: name.to_string(),
            network: Arc::clone(network),
            config,
            ap: OnceLock::new(),
            cp: OnceLock::new(),
            ca: OnceLock::new(),
        });

        let worker = Arc::clone(&node);
        thread::Builder::new()
            .name(format!("dsm-{name}"))
            .spawn(move || worker.dispatch_loop(mailbox))
            .expect("failed to spawn node dispatch thread");

        info!(node = name, "simulated node started");
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine for one consistency model, created and initialized on
    /// first use and cached for the node's lifetime.
    pub fn engine(&self, model: ConsistencyModel) -> Arc<Engine> {
        self.slot(model)
            .get_or_init(|| {
                let transport = Arc::new(NodeLink::new(Arc::clone(&self.network), &self.name));
                let engine = engine::create(model, transport, self.config.clone());
                engine.initialize(&self.name);
                Arc::new(engine)
            })
            .clone()
    }

    /// Leaves the network and clears every engine. The mailbox sender drops
    /// with the registration, which ends the dispatch thread.
    pub fn shutdown(&self) {
        self.network.deregister(&self.name);
        for model in ConsistencyModel::ALL {
            if let Some(engine) = self.slot(model).get() {
                engine.shutdown();
            }
        }
        info!(node = %self.name, "simulated node shut down");
    }

    fn slot(&self, model: ConsistencyModel) -> &OnceLock<Arc<Engine>> {
        match model {
            ConsistencyModel::Ap => &self.ap,
            ConsistencyModel::Cp => &self.cp,
            ConsistencyModel::Ca => &self.ca,
        }
    }

    fn dispatch_loop(&self, mailbox: Receiver<String>) {
        for line in mailbox.iter() {
            let envelope = match Envelope::decode(&line) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(node = %self.name, error = %err, "dropping undecodable message");
                    continue;
                }
            };

            match self.slot(envelope.payload.model()).get() {
                Some(engine) => engine.deliver(&envelope),
                None => debug!(
                    node = %self.name,
                    model = %envelope.payload.model(),
                    sender = %envelope.sender,
                    "no engine for model yet, message dropped"
                ),
            }
        }
        debug!(node = %self.name, "mailbox closed, dispatch loop ending");
    }
}
