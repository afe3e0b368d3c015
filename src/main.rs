use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use cap_mesh::cli::{Cli, Command, ContendArgs, DemoArgs, PartitionArgs};
use cap_mesh::engine::ConsistencyModel;
use cap_mesh::net::Network;
use cap_mesh::runtime::SimNode;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo(args) => run_demo(args),
        Command::Contend(args) => run_contend(args),
        Command::Partition(args) => run_partition(args),
    }
}

/// Spawns a cluster and warms the chosen engine on every node, so each one
/// participates in the protocol from the first message.
fn spawn_cluster(
    count: usize,
    model: ConsistencyModel,
    network: &Arc<Network>,
) -> Vec<Arc<SimNode>> {
    let nodes: Vec<_> = (0..count)
        .map(|i| SimNode::spawn(&format!("node_{i}"), network))
        .collect();
    for node in &nodes {
        node.engine(model);
    }
    nodes
}

fn shutdown_cluster(nodes: &[Arc<SimNode>]) {
    for node in nodes {
        node.shutdown();
    }
}

/// Every node writes one key it owns, waits for the dust to settle, then
/// reads its own key and node_0's key back.
fn run_demo(args: DemoArgs) -> Result<()> {
    let model: ConsistencyModel = args.model.into();
    info!(%model, nodes = args.nodes, "starting demo");

    let network = Network::new();
    let nodes = spawn_cluster(args.nodes, model, &network);
    let failures = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                let engine = node.engine(model);
                let key = format!("key_{}", node.name());
                let value = format!("value from {}", node.name());

                if let Err(err) = engine.write(&key, &value) {
                    warn!(node = node.name(), %key, error = %err, "write failed");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                thread::sleep(Duration::from_millis(200));

                match engine.read(&key) {
                    Ok(read_back) => {
                        info!(node = node.name(), %key, value = ?read_back, "read own key")
                    }
                    Err(err) => {
                        warn!(node = node.name(), %key, error = %err, "read failed");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if node.name() != "node_0" {
                    match engine.read("key_node_0") {
                        Ok(other) => {
                            info!(node = node.name(), value = ?other, "read node_0's key")
                        }
                        Err(err) => {
                            warn!(node = node.name(), error = %err, "cross-node read failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }

    info!(
        %model,
        failures = failures.load(Ordering::Relaxed),
        "demo finished"
    );
    shutdown_cluster(&nodes);
    Ok(())
}

/// All nodes hammer the same few keys concurrently, then every node reads
/// the final state so diverging replicas become visible.
fn run_contend(args: ContendArgs) -> Result<()> {
    let model: ConsistencyModel = args.model.into();
    info!(%model, nodes = args.nodes, keys = args.keys, rounds = args.rounds, "starting contention run");

    let network = Network::new();
    let nodes = spawn_cluster(args.nodes, model, &network);
    let write_failures = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let write_failures = Arc::clone(&write_failures);
            let keys = args.keys;
            let rounds = args.rounds;
            thread::spawn(move || {
                let engine = node.engine(model);
                let mut rng = rand::thread_rng();
                for round in 0..rounds {
                    let key = format!("counter_{}", round % keys);
                    let value = format!("{}:r{}", node.name(), round);
                    if let Err(err) = engine.write(&key, &value) {
                        warn!(node = node.name(), %key, error = %err, "contended write failed");
                        write_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(Duration::from_millis(rng.gen_range(1..20)));
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }

    // Let in-flight replication land before comparing replicas.
    thread::sleep(Duration::from_millis(300));

    let mut divergent_keys = 0;
    for k in 0..args.keys {
        let key = format!("counter_{k}");
        let mut values = Vec::new();
        for node in &nodes {
            if let Ok(value) = node.engine(model).read(&key) {
                values.push(value);
            }
        }
        values.sort();
        values.dedup();
        if values.len() > 1 {
            divergent_keys += 1;
            warn!(%key, ?values, "replicas disagree");
        } else {
            info!(%key, value = ?values.first(), "replicas agree");
        }
    }

    info!(
        %model,
        write_failures = write_failures.load(Ordering::Relaxed),
        divergent_keys,
        "contention run finished"
    );
    shutdown_cluster(&nodes);
    Ok(())
}

/// Cuts the minority half of the cluster off mid-run. AP keeps serving on
/// both sides, CP fails on the minority side, CA fails wherever the
/// coordinator is out of reach.
fn run_partition(args: PartitionArgs) -> Result<()> {
    let model: ConsistencyModel = args.model.into();
    info!(%model, nodes = args.nodes, "starting partition run");

    let network = Network::new();
    let nodes = spawn_cluster(args.nodes, model, &network);
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let ok = Arc::clone(&ok);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                let engine = node.engine(model);
                for round in 0..12 {
                    let key = format!("k_{}", node.name());
                    match engine.write(&key, &format!("r{round}")) {
                        Ok(()) => {
                            ok.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            warn!(node = node.name(), round, error = %err, "write lost to the partition");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    thread::sleep(Duration::from_millis(250));
                }
            })
        })
        .collect();

    // Let the cluster run healthy for a moment, then cut off a minority of
    // nodes, then heal them again.
    thread::sleep(Duration::from_millis(750));
    let cut: Vec<String> = nodes
        .iter()
        .skip(args.nodes / 2 + 1)
        .map(|node| node.name().to_string())
        .collect();
    info!(?cut, "partition begins");
    for name in &cut {
        network.blackhole(name);
    }
    thread::sleep(Duration::from_millis(1250));
    info!("partition heals");
    for name in &cut {
        network.heal(name);
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!(
        %model,
        succeeded = ok.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        "partition run finished"
    );
    match model {
        ConsistencyModel::Ap => {
            info!("AP keeps accepting writes on both sides and reconciles by timestamp later")
        }
        ConsistencyModel::Cp => {
            info!("CP rejects writes on whichever side cannot assemble a majority")
        }
        ConsistencyModel::Ca => {
            info!("CA fails every operation that cannot reach the coordinator")
        }
    }
    shutdown_cluster(&nodes);
    Ok(())
}
