use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use keyspace::{Id, Node};

#[derive(Parser, Debug)]
#[command(name = "keyspace")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Peers to join the network through.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Store KEY=VALUE after joining.
    #[arg(long, value_name = "KEY=VALUE")]
    put: Vec<String>,

    /// Fetch and print the value stored under KEY.
    #[arg(long, value_name = "KEY")]
    get: Vec<String>,

    /// Exit after running the one-shot puts and gets instead of serving.
    #[arg(long)]
    oneshot: bool,

    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(&args.bind.to_string()).await?;
    info!("node id: {}", node.id());
    info!("listening on {}", node.local_addr());

    for peer in &args.bootstrap {
        info!("joining via {peer}");
        match node.join(*peer).await {
            Ok(()) => {
                info!("join complete, {} contacts known", node.table_size().await);
            }
            Err(e) => {
                warn!(error = %e, "join failed");
            }
        }
    }

    for pair in &args.put {
        let (key, value) = pair
            .split_once('=')
            .context("--put expects KEY=VALUE")?;
        let id = node.put(key.as_bytes(), value.as_bytes().to_vec()).await?;
        println!("{key} -> {id}");
    }

    for key in &args.get {
        let id = Id::hash(key.as_bytes());
        let (_, value) = node.get(&id).await?;
        match value {
            Some(value) => println!("{key} = {}", String::from_utf8_lossy(&value)),
            None => println!("{key}: not found"),
        }
    }

    if args.oneshot {
        node.shutdown().await;
        return Ok(());
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = interval.tick() => {
                info!(contacts = node.table_size().await, "routing table");
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
