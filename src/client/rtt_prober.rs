use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use ordered_float::OrderedFloat;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::messaging::envelope::{Envelope, MessageType};
use crate::util::timeout::with_timeout;

/// round trip time in seconds
pub type Latency = OrderedFloat<f64>;

/// the latency of a node that could not be measured
pub const UNREACHABLE: Latency = OrderedFloat(f64::INFINITY);

/// Measures the echo round trip to a node on a fresh connection. Failures yield [UNREACHABLE]
///  instead of an error.
pub async fn measure_rtt(addr: SocketAddr, timeout: Option<Duration>) -> Latency {
    match try_measure_rtt(addr, timeout).await {
        Ok(latency) => latency,
        Err(e) => {
            warn!("measuring RTT to {} failed: {}", addr, e);
            UNREACHABLE
        }
    }
}

async fn try_measure_rtt(addr: SocketAddr, timeout: Option<Duration>) -> anyhow::Result<Latency> {
    let mut stream = with_timeout(timeout, "connect", async {
        Ok::<_, anyhow::Error>(TcpStream::connect(addr).await?)
    }).await?;

    let start = Instant::now();
    with_timeout(timeout, "echo", async {
        Envelope::echo().write_to(&mut stream).await?;
        match Envelope::read_from(&mut stream).await? {
            Some(reply) if reply.kind() == Some(MessageType::Echo) => Ok::<_, anyhow::Error>(()),
            Some(reply) => bail!("unexpected reply to echo: {:?}", reply),
            None => bail!("connection closed before the echo reply"),
        }
    }).await?;

    Ok(OrderedFloat(start.elapsed().as_secs_f64()))
}

/// Probes the candidates one after the other, in order
pub async fn probe_all(candidates: &[SocketAddr], timeout: Option<Duration>) -> Vec<(SocketAddr, Latency)> {
    let mut result = Vec::with_capacity(candidates.len());
    for &candidate in candidates {
        let latency = measure_rtt(candidate, timeout).await;
        info!("RTT to {}: {:.6}s", candidate, latency.0);
        result.push((candidate, latency));
    }
    result
}

/// Picks the node with strictly minimal latency; among equal latencies the first one wins.
///  Unreachable nodes are only picked if no node is reachable.
pub fn select_fastest(measurements: &[(SocketAddr, Latency)]) -> Option<SocketAddr> {
    let mut best: Option<(SocketAddr, Latency)> = None;
    for &(addr, latency) in measurements {
        match best {
            Some((_, best_latency)) if latency >= best_latency => {}
            _ => best = Some((addr, latency)),
        }
    }
    best.map(|(addr, _)| addr)
}
