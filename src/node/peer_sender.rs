use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use crate::messaging::envelope::Envelope;
use crate::util::timeout::with_timeout;

/// Node-to-node traffic is fire-and-forget: a fresh, short-lived connection per interaction
///  that carries one or more envelopes and is closed afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerSender: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, envelopes: Vec<Envelope>) -> anyhow::Result<()>;
}

pub struct TcpPeerSender {
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
}
impl TcpPeerSender {
    pub fn new(connect_timeout: Option<Duration>, io_timeout: Option<Duration>) -> TcpPeerSender {
        TcpPeerSender {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl PeerSender for TcpPeerSender {
    async fn send(&self, to: SocketAddr, envelopes: Vec<Envelope>) -> anyhow::Result<()> {
        let mut stream = with_timeout(self.connect_timeout, "connect", async {
            Ok::<_, anyhow::Error>(TcpStream::connect(to).await?)
        }).await?;

        with_timeout(self.io_timeout, "send to peer", async {
            for envelope in &envelopes {
                trace!(?to, ?envelope, "sending to peer");
                envelope.write_to(&mut stream).await?;
            }
            stream.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        }).await
    }
}
