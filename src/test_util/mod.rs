//! Utilities for testing against running nodes on loopback. They are used by this crate's own
//!  tests, and exported for testing applications built on top of it.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::messaging::envelope::Envelope;
use crate::node::directories::NodeState;
use crate::node::node::Node;
use crate::node::node_config::NodeConfig;

/// A node running on an ephemeral loopback port
pub struct TestNode {
    pub addr: SocketAddr,
    pub state: Arc<NodeState>,
    task: JoinHandle<anyhow::Result<()>>,
}
impl TestNode {
    pub async fn start(candidate_ports: &[u16]) -> anyhow::Result<TestNode> {
        let mut config = NodeConfig::new(0);
        config.bind_ip = Ipv4Addr::LOCALHOST.into();
        config.candidate_ports = candidate_ports.to_vec();
        config.connect_timeout = Some(Duration::from_secs(2));
        config.io_timeout = Some(Duration::from_secs(2));
        config.status_report_interval = None;
        Self::start_with_config(config).await
    }

    pub async fn start_with_config(config: NodeConfig) -> anyhow::Result<TestNode> {
        let node = Node::bind(config).await?;
        let addr = node.local_addr();
        let state = node.state();
        let task = tokio::spawn(node.run());

        let test_node = TestNode { addr, state, task };
        let port = test_node.port();
        let state = test_node.state.clone();
        eventually("node to register itself", || {
            let state = state.clone();
            async move { state.servers.contains(port).await }
        }).await;
        Ok(test_node)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn known_ports(&self) -> Vec<u16> {
        self.state.servers.entries().await
            .into_iter()
            .map(|(port, _)| port)
            .collect()
    }
}
impl Drop for TestNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A raw connection to a node, speaking the wire protocol directly
pub struct TestConnection {
    pub stream: TcpStream,
}
impl TestConnection {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<TestConnection> {
        Ok(TestConnection {
            stream: TcpStream::connect(addr).await?,
        })
    }

    pub async fn send(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        envelope.write_to(&mut self.stream).await
    }

    pub async fn receive(&mut self) -> anyhow::Result<Option<Envelope>> {
        Envelope::read_from(&mut self.stream).await
    }

    /// reads exactly `expected_len` bytes of unframed text, as written for delivered messages
    pub async fn receive_text(&mut self, expected_len: usize) -> anyhow::Result<String> {
        let mut buf = vec![0u8; expected_len];
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut buf)).await??;
        Ok(String::from_utf8(buf)?)
    }

    /// Round trips an echo, so that everything sent before has been processed by the node
    pub async fn sync(&mut self) -> anyhow::Result<()> {
        self.send(Envelope::echo()).await?;
        match self.receive().await? {
            Some(reply) if reply == Envelope::echo() => Ok(()),
            other => anyhow::bail!("expected an echo reply, got {:?}", other),
        }
    }
}

/// Polls `condition` until it holds, panicking after five seconds
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
