use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use watercooler::node::link_policy::BlockedLinks;
use watercooler::{Node, NodeConfig, NodeEvent, NodeId};

#[derive(Parser)]
struct Args {
    port: u32,

    /// address of a cluster member to join, as host:port
    #[clap(long)]
    join: Option<String>,

    #[clap(long)]
    id: Option<String>,

    /// gossip rounds per minute
    #[clap(long, default_value_t = 12)]
    rate: u32,

    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// ids of nodes this node never gossips with directly
    #[clap(long)]
    no_gossip_with: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = match args.id {
        Some(id) => NodeConfig::with_id(id),
        None => NodeConfig::new(),
    };
    config.gossip_rate = args.rate;
    config.host = args.host;

    let mut blocked = BlockedLinks::new();
    for other in args.no_gossip_with {
        blocked = blocked.block(config.id.clone(), NodeId::from(other));
    }
    config.link_policy = Arc::new(blocked);

    let node = Node::new(config)?;
    let mut events = node.subscribe();
    let local_info = node.listen(args.port).await?;
    info!("started node {} on [{}]:{}", local_info.id, local_info.host, local_info.port);

    if let Some(join) = args.join {
        let (host, port) = join.rsplit_once(':')
            .ok_or_else(|| anyhow!("join address must be host:port, was {}", join))?;
        let attempts = node.join(host, port.parse()?).await?;
        info!("joined through {} after {} attempt(s)", join, attempts);
    }

    loop {
        select! {
            evt = events.recv() => {
                match evt {
                    Ok(NodeEvent::Join(peer)) => info!("join: {} on [{}]:{}", peer.id, peer.host, peer.port),
                    Ok(NodeEvent::Down(peer)) => info!("down: {}", peer.id),
                    Ok(NodeEvent::Alive(peer)) => info!("alive: {}", peer.id),
                    Ok(NodeEvent::AppUpdate { key, value }) => info!("update: {} = {}", key, value),
                    Err(RecvError::Lagged(n)) => warn!("missed {} events", n),
                    Err(RecvError::Closed) => return Ok(()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
