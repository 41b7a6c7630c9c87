use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::error;

use meshvpn::comm::entropy::ThreadRngEntropy;
use meshvpn::comm::secure::TcpDialer;
use meshvpn::config::MeshConfig;
use meshvpn::driver::{run_listener, run_node};
use meshvpn::node::Node;


/// A mesh overlay node: listens for peers, dials configured ones, and
///  forwards frames between them.
#[derive(Parser)]
#[command(name = "meshnode")]
struct Args {
    /// address to accept peer connections on, e.g. 0.0.0.0:4791
    #[arg(long)]
    listen: Option<String>,

    /// peer address to keep a connection to; may be repeated
    #[arg(long = "connect")]
    connect: Vec<String>,

    /// tunable in KEY=VALUE form, e.g. -o multipath=true; may be repeated
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// shared secret enabling the encrypted record layer
    #[arg(long)]
    secret: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut config = MeshConfig::new();
    for option in &args.options {
        let (key, value) = option.split_once('=')
            .ok_or_else(|| anyhow!("option must be KEY=VALUE, got '{}'", option))?;
        config.apply_option(key, value)?;
    }
    config.shared_secret = args.secret.map(String::into_bytes);
    config.log_summary();
    let config = Arc::new(config);

    let dialer = Arc::new(TcpDialer::new(config.shared_secret.clone()));
    let (mut node, events_rx) = Node::<ThreadRngEntropy>::new(config.clone(), dialer);
    let events_tx = node.event_sender();

    let now = Instant::now();
    for peer in &args.connect {
        node.add_peer(peer, now);
    }

    if let Some(listen_addr) = args.listen {
        let secret = config.shared_secret.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(listen_addr, secret, events_tx).await {
                error!("listener failed: {:#}", e);
            }
        });
    }

    run_node(Arc::new(Mutex::new(node)), events_rx).await;
    Ok(())
}
