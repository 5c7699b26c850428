use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

use meshchat::node::node::Node;
use meshchat::node::node_config::{NodeConfig, DEFAULT_CANDIDATE_PORTS};

#[derive(Parser)]
struct Args {
    /// port to listen on
    port: u16,

    /// ports of the other nodes in the mesh, defaults to the shared candidate list
    #[arg(long)]
    candidate_port: Vec<u16>,

    #[arg(long)]
    advertised_ip: Option<IpAddr>,

    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    #[arg(long)]
    io_timeout_ms: Option<u64>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// 0 disables the periodic status report
    #[arg(long, default_value_t = 5)]
    status_interval_secs: u64,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[arg(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .try_init()
        .ok();

    let mut config = NodeConfig::new(args.port);
    config.candidate_ports = if args.candidate_port.is_empty() {
        DEFAULT_CANDIDATE_PORTS.to_vec()
    }
    else {
        args.candidate_port
    };
    if let Some(ip) = args.advertised_ip {
        config.advertised_ip = ip;
    }
    config.connect_timeout = args.connect_timeout_ms.map(Duration::from_millis);
    config.io_timeout = args.io_timeout_ms.map(Duration::from_millis);
    config.max_connections = args.max_connections;
    config.status_report_interval = match args.status_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Node::bind(config).await?
        .run().await
}
