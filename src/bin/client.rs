use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tokio::select;
use tracing::Level;

use meshchat::client::chat_session::ChatSession;
use meshchat::client::client_config::ClientConfig;

#[derive(Parser)]
struct Args {
    /// any node of the mesh, e.g. 127.0.0.1:5001
    #[arg(long)]
    bootstrap: SocketAddr,

    #[arg(long)]
    username: String,

    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let mut config = ClientConfig::new(args.bootstrap, &args.username);
    config.connect_timeout = args.connect_timeout_ms.map(Duration::from_millis);
    config.probe_timeout = args.probe_timeout_ms.map(Duration::from_millis);

    let (mut session, mut inbound) = ChatSession::connect(config).await?;
    let print_inbound = async move {
        while let Some(text) = inbound.recv().await {
            println!("Received: {}", text);
        }
    };

    select! {
        r = session.run_send_loop(BufReader::new(tokio::io::stdin())) => r,
        _ = print_inbound => Ok(()),
    }
}
