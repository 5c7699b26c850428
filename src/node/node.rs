use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::node::announcer::{AnnounceJob, AnnounceWorker, MeshAnnouncer};
use crate::node::directories::{ConnectionHandle, NodeState};
use crate::node::dispatcher::ConnectionDispatcher;
use crate::node::node_config::NodeConfig;
use crate::node::peer_sender::{PeerSender, TcpPeerSender};
use crate::node::router::MessageRouter;

/// A relay node: owns its directories and dedup set, accepts connections from clients and
///  other nodes, and takes part in mesh discovery.
pub struct Node {
    config: Arc<NodeConfig>,
    listener: TcpListener,
    self_addr: SocketAddr,
    state: Arc<NodeState>,
    peer_sender: Arc<dyn PeerSender>,
}

impl Node {
    pub async fn bind(config: NodeConfig) -> anyhow::Result<Node> {
        config.validate()?;

        let listener = TcpListener::bind(SocketAddr::new(config.bind_ip, config.port)).await
            .with_context(|| format!("binding port {}", config.port))?;
        let self_addr = listener.local_addr()?;
        let peer_sender = Arc::new(TcpPeerSender::new(config.connect_timeout, config.io_timeout));

        Ok(Node {
            config: Arc::new(config),
            listener,
            self_addr,
            state: Default::default(),
            peer_sender,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn port(&self) -> u16 {
        self.self_addr.port()
    }

    pub fn state(&self) -> Arc<NodeState> {
        self.state.clone()
    }

    #[instrument(name="Node", skip_all, fields(port = self.port()))]
    pub async fn run(self) -> anyhow::Result<()> {
        let port = self.port();
        self.state.servers.register(port, self.config.advertised_ip).await;
        info!("listening on {}", self.self_addr);

        let (announcer, jobs) = MeshAnnouncer::new(self.config.announce_queue_capacity);
        let worker = AnnounceWorker::new(port, self.state.clone(), self.peer_sender.clone(), jobs);
        let router = Arc::new(MessageRouter::new(port, self.state.clone(), self.peer_sender.clone()));

        select! {
            _ = worker.run().instrument(Span::current()) => Ok(()),
            _ = report_status_loop(self.config.status_report_interval, self.state.clone()) => Ok(()),
            r = self.accept_loop(router, announcer) => r,
        }
    }

    async fn accept_loop(&self, router: Arc<MessageRouter>, announcer: MeshAnnouncer) -> anyhow::Result<()> {
        for &candidate in &self.config.candidate_ports {
            if candidate != self.port() {
                announcer.submit(AnnounceJob::AnnounceSelf { to: SocketAddr::new(self.config.candidate_host, candidate) }).await;
            }
        }

        let connection_limit = self.config.max_connections
            .map(|n| Arc::new(Semaphore::new(n)));

        loop {
            let permit = match &connection_limit {
                Some(limit) => Some(limit.clone().acquire_owned().await?),
                None => None,
            };

            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accepting a connection failed: {}", e);
                    continue;
                }
            };

            let io_timeout = self.config.io_timeout;
            let state = self.state.clone();
            let router = router.clone();
            let announcer = announcer.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(addr, stream, io_timeout, state, router, announcer).await {
                    warn!("connection from {} broke with an error: {}", addr, e);
                }
            }.instrument(Span::current()));
        }
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = %addr))]
async fn handle_connection(
    addr: SocketAddr,
    stream: TcpStream,
    io_timeout: Option<Duration>,
    state: Arc<NodeState>,
    router: Arc<MessageRouter>,
    announcer: MeshAnnouncer,
) -> anyhow::Result<()> {
    debug!("accepted connection");
    let (reader, writer) = stream.into_split();
    let handle = ConnectionHandle::new(addr, writer, io_timeout);
    ConnectionDispatcher::new(handle, state, router, announcer)
        .run(reader)
        .await?;
    debug!("connection closed");
    Ok(())
}

async fn report_status_loop(interval: Option<Duration>, state: Arc<NodeState>) {
    let Some(interval) = interval else {
        return std::future::pending().await;
    };

    loop {
        sleep(interval).await;
        let servers = state.servers.entries().await;
        let users = state.clients.usernames().await;
        info!(?servers, ?users, "known servers and attached users");
    }
}
