//! Mesh Chat peer
//!
//! Finds other peers on the local network, connects to each of them and
//! relays chat lines typed on stdin.

mod config;
mod console;

use clap::Parser;
use mesp_mesh::{MeshEngine, DEFAULT_SERVICE};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

use crate::config::PeerConfig;
use crate::console::{Command, ConsoleDelegate};

#[derive(Parser)]
#[command(name = "mesp-peer")]
#[command(about = "Chat with every peer on the local network")]
struct Args {
    /// Instance number appended to the hostname (random when omitted)
    instance: Option<String>,

    /// Host name to present instead of the system hostname
    #[arg(long)]
    name: Option<String>,

    /// Port for incoming invites (0 picks a free one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Service name; only peers using the same one are discovered
    #[arg(long, default_value = DEFAULT_SERVICE)]
    service: String,

    /// Multicast group for beacons
    #[arg(long)]
    multicast: Option<SocketAddrV4>,

    /// Do not advertise or browse
    #[arg(long)]
    no_discovery: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let config = PeerConfig::new(
        args.instance,
        args.name,
        args.port,
        args.service,
        args.multicast,
        !args.no_discovery,
    );
    let identity = config.identity.clone();

    println!("You are {}. Welcome to Mesh Chat!", identity.display_name());
    info!("Peer id: {}", identity.id());

    let engine = Arc::new(
        MeshEngine::new(identity, config.mesh, Arc::new(ConsoleDelegate::new())).await?,
    );

    let report = engine.start().await?;
    if let Some(e) = &report.advertiser {
        warn!("Not advertising, other peers cannot find us: {}", e);
    }
    if let Some(e) = &report.browser {
        warn!("Not browsing, peers must find us: {}", e);
    }
    info!("Accepting invites on {}", report.session_addr);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(command) = Command::parse(&line) else { continue };
                if !run_command(&engine, command).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    engine.shutdown().await;
    println!("Bye!");
    Ok(())
}

/// Returns false once the user asked to quit.
async fn run_command(engine: &MeshEngine, command: Command) -> bool {
    match command {
        Command::Peers => {
            let records = engine.current_peers().await;
            if records.is_empty() {
                println!("[i] No peers known yet");
            }
            for record in records {
                println!(
                    "    {} ({}) {}",
                    record.identity.display_name(),
                    record.identity.id(),
                    record.state
                );
            }
        }
        Command::Msg { peer_id, text } => {
            if let Err(e) = engine.send_to(&peer_id, &text).await {
                println!("[x] {}", e);
            }
        }
        Command::Broadcast(text) => {
            let reached = engine.broadcast(&text).await;
            if reached.is_empty() {
                println!("[i] Nobody connected yet");
            } else {
                info!("[<] SEND: {} to {} peer(s)", text, reached.len());
            }
        }
        Command::Invalid(hint) => println!("[x] {}", hint),
        Command::Quit => return false,
    }
    true
}
