use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::bail;

/// The candidate ports shared by all nodes of a mesh. Nodes announce themselves to every
///  other port in this list on startup.
pub const DEFAULT_CANDIDATE_PORTS: [u16; 5] = [5001, 5002, 5003, 5004, 5005];

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// listening port, 0 for an ephemeral port
    pub port: u16,
    pub bind_ip: IpAddr,
    /// the address this node registers for itself in its server directory
    pub advertised_ip: IpAddr,

    /// host on which the candidate ports are contacted
    pub candidate_host: IpAddr,
    pub candidate_ports: Vec<u16>,

    /// `None` blocks for as long as the OS lets a connection attempt take
    pub connect_timeout: Option<Duration>,
    /// applies to writes only - an idle connection is not a reason to close it
    pub io_timeout: Option<Duration>,

    pub announce_queue_capacity: usize,
    /// upper bound on concurrently handled connections, `None` for one task per connection
    ///  without limit
    pub max_connections: Option<usize>,
    /// interval for logging known servers and attached users, `None` to disable
    pub status_report_interval: Option<Duration>,
}

impl NodeConfig {
    pub fn new(port: u16) -> NodeConfig {
        NodeConfig {
            port,
            bind_ip: Ipv4Addr::UNSPECIFIED.into(),
            advertised_ip: Ipv4Addr::LOCALHOST.into(),
            candidate_host: Ipv4Addr::LOCALHOST.into(),
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
            connect_timeout: None,
            io_timeout: None,
            announce_queue_capacity: 64,
            max_connections: None,
            status_report_interval: Some(Duration::from_secs(5)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.announce_queue_capacity == 0 {
            bail!("announce queue capacity must be positive");
        }
        if self.max_connections == Some(0) {
            bail!("max connections must be positive");
        }
        if self.status_report_interval == Some(Duration::ZERO) {
            bail!("status report interval must be positive");
        }
        Ok(())
    }
}
