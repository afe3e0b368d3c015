//! Integration tests for the last-write-wins (AP) engine.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use cap_mesh::engine::ConsistencyModel;
use cap_mesh::net::Network;
use cap_mesh::runtime::SimNode;

struct TestCluster {
    network: Arc<Network>,
    nodes: Vec<Arc<SimNode>>,
}

impl TestCluster {
    fn spawn(n: usize) -> Self {
        let network = Network::new();
        let nodes: Vec<_> = (0..n)
            .map(|i| SimNode::spawn(&format!("node_{i}"), &network))
            .collect();
        for node in &nodes {
            node.engine(ConsistencyModel::Ap);
        }
        Self { network, nodes }
    }

    fn node(&self, i: usize) -> &Arc<SimNode> {
        &self.nodes[i]
    }

    /// Lets in-flight replication land.
    fn settle(&self) {
        thread::sleep(Duration::from_millis(100));
    }

    fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

#[test]
fn later_write_wins_on_every_replica() -> Result<()> {
    let cluster = TestCluster::spawn(4);

    // node_0 writes first; once node_1 has absorbed that update its own
    // clock is past node_0's stamp, so its write carries a higher one.
    cluster
        .node(0)
        .engine(ConsistencyModel::Ap)
        .write("x", "v1")?;
    cluster.settle();

    cluster
        .node(1)
        .engine(ConsistencyModel::Ap)
        .write("x", "v2")?;
    cluster.settle();

    for node in &cluster.nodes {
        assert_eq!(
            node.engine(ConsistencyModel::Ap).read("x")?.as_deref(),
            Some("v2"),
            "{} holds a stale value",
            node.name()
        );
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn concurrent_writers_converge_on_a_single_value() -> Result<()> {
    let cluster = TestCluster::spawn(4);

    let writers: Vec<_> = [0, 1, 2]
        .into_iter()
        .map(|i| {
            let node = Arc::clone(cluster.node(i));
            thread::spawn(move || {
                let engine = node.engine(ConsistencyModel::Ap);
                for round in 0..5 {
                    engine
                        .write("shared", &format!("{}:{round}", node.name()))
                        .expect("AP writes cannot fail");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    cluster.settle();

    // node_3 only watched, but its clock has absorbed every stamp that
    // reached it, so its closing write outbids the whole battle above.
    cluster
        .node(3)
        .engine(ConsistencyModel::Ap)
        .write("shared", "final")?;
    cluster.settle();

    for node in &cluster.nodes {
        assert_eq!(
            node.engine(ConsistencyModel::Ap).read("shared")?.as_deref(),
            Some("final"),
            "{} holds a stale value",
            node.name()
        );
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn writes_keep_succeeding_inside_a_partition() -> Result<()> {
    let cluster = TestCluster::spawn(4);

    cluster.network.blackhole("node_3");
    let isolated = cluster.node(3).engine(ConsistencyModel::Ap);

    // Availability: the isolated node accepts the write and serves it back.
    isolated.write("island", "still here")?;
    assert_eq!(isolated.read("island")?.as_deref(), Some("still here"));
    cluster.settle();

    // The update was broadcast into the void; nobody else ever sees it.
    // Eventual convergence is only promised to reachable peers.
    assert_eq!(
        cluster.node(0).engine(ConsistencyModel::Ap).read("island")?,
        None
    );

    cluster.shutdown();
    Ok(())
}

#[test]
fn a_replica_that_missed_an_update_still_converges() -> Result<()> {
    let cluster = TestCluster::spawn(3);

    // node_1 misses the first write entirely.
    cluster.network.blackhole("node_1");
    cluster
        .node(0)
        .engine(ConsistencyModel::Ap)
        .write("x", "old")?;
    cluster.settle();
    cluster.network.heal("node_1");

    cluster
        .node(2)
        .engine(ConsistencyModel::Ap)
        .write("x", "new")?;
    cluster.settle();

    // node_1 only ever saw the newer write; node_0 saw both in order and
    // must have kept the newer one.
    assert_eq!(
        cluster.node(1).engine(ConsistencyModel::Ap).read("x")?.as_deref(),
        Some("new")
    );
    assert_eq!(
        cluster.node(0).engine(ConsistencyModel::Ap).read("x")?.as_deref(),
        Some("new")
    );

    cluster.shutdown();
    Ok(())
}
