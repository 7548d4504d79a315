//! pomo: share your pomodoro status with peers on the local network.

mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use pomo_core::{logging, paths};
use pomo_network::identity::NodeIdentity;
use pomo_network::{DiscoveryEvent, MemberState, NetworkConfig, PeerId, PomoNode};

use crate::status::{Countdown, render_members};

/// pomo: LAN presence for pomodoro sessions
#[derive(Parser, Debug)]
#[command(name = "pomo", version)]
#[command(about = "Join a room and share your pomodoro status with peers on the LAN")]
struct Args {
    /// Display name shown to other members (defaults to the login name)
    #[arg(short, long)]
    name: Option<String>,

    /// Room to join
    #[arg(short, long, default_value = "lobby")]
    room: String,

    /// Private key file (defaults to ~/.pomo/node_priv.key)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Network config file (defaults to ~/.pomo/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept peer connections on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Disable LAN discovery
    #[arg(long)]
    no_discovery: bool,

    /// Peer address to dial on startup (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Initial state: idle, work or rest
    #[arg(short, long, default_value = "work")]
    state: MemberState,

    /// Task being worked on
    #[arg(short, long, default_value = "")]
    task: String,

    /// Length of the phase in minutes
    #[arg(short, long, default_value_t = 25)]
    minutes: u32,

    /// Seconds between status broadcasts
    #[arg(long, default_value_t = 5)]
    tick: u64,
}

fn default_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "pomo".to_string())
}

fn load_config(args: &Args) -> Result<NetworkConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = NetworkConfig::load_or_default(&path);

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.no_discovery {
        config.discovery_enabled = false;
    }
    config.known_peers.extend(args.peers.iter().cloned());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = match logging::init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {e}");
            None
        }
    };

    let name = args.name.clone().unwrap_or_else(default_name);
    let config = load_config(&args)?;
    let key_path = match &args.key {
        Some(path) => path.clone(),
        None => paths::key_path()?,
    };

    let identity = NodeIdentity::load_or_create(&key_path, name.as_str())
        .with_context(|| format!("Failed to load identity from {}", key_path.display()))?;
    let node = PomoNode::new(identity, config)
        .await
        .context("Failed to start network host")?;
    node.start().await.context("Failed to start node")?;

    let self_id = node.peer_id().as_str().to_string();
    println!(
        "pomo {} as {name} ({self_id}) listening on {}",
        env!("CARGO_PKG_VERSION"),
        node.listen_addr()
    );
    info!("pomo started as {name} ({self_id})");

    let mut events = node.discovery_events();
    match node.join_room(&args.room).await {
        Ok(()) => println!("Joined room '{}'", args.room),
        Err(e) => println!("Could not join room '{}': {e}", args.room),
    }

    let tick = args.tick.max(1);
    let mut countdown = Countdown::new(args.state, args.minutes.saturating_mul(60), args.task.as_str());
    let mut ticker = tokio::time::interval(Duration::from_secs(tick));
    // The first tick fires immediately; don't count it as elapsed time.
    let mut first_tick = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !first_tick {
                    countdown.advance(u32::try_from(tick).unwrap_or(u32::MAX));
                }
                first_tick = false;

                if let Err(e) = node.broadcast_state(countdown.member(&self_id, &name)).await {
                    println!("Status not sent: {e}");
                }

                if let Some(members) = node.members() {
                    for member in members.values().filter(|m| m.id != self_id) {
                        node.discovery()
                            .update_peer_state(&PeerId::from_string(member.id.as_str()), member.state);
                    }
                    println!("-- room '{}' ({} members)", args.room, members.len());
                    for line in render_members(&members, &self_id) {
                        println!("{line}");
                    }
                }
            }
            event = events.recv() => match event {
                Ok(DiscoveryEvent::PeerFound(id)) => println!("+ peer found: {id}"),
                Ok(DiscoveryEvent::PeerLost(id)) => println!("- peer lost: {id}"),
                Err(RecvError::Lagged(missed)) => warn!("Missed {missed} discovery events"),
                Err(RecvError::Closed) => {
                    warn!("Discovery event channel closed");
                    events = node.discovery_events();
                }
            },
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
        }
    }

    println!("Leaving room '{}'", args.room);
    if let Err(e) = node.leave_room().await {
        println!("Leave not announced: {e}");
    }
    node.close().await;
    info!("pomo stopped");
    Ok(())
}
