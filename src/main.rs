//! flick - serverless LAN file transfer.
//!
//! `flick listen` advertises this device and receives files, `flick send`
//! delivers one file to a peer, `flick discover` prints the peers heard
//! on the discovery port.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flick::discovery::DiscoveryListener;
use flick::protocol::DEFAULT_PORT;
use flick::{Event, PeerDescriptor, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "flick", version, about = "Serverless LAN file transfer")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Wait for a peer, advertise over the LAN, and receive files
    Listen {
        /// TCP port to listen on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Device name shown to peers (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
        /// Directory received files are written into
        #[arg(long, default_value = "received")]
        save_dir: PathBuf,
        /// Skip TLS and accept plain connections only
        #[arg(long)]
        insecure: bool,
    },
    /// Print peers heard on the discovery port
    Discover {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
    /// Send one file to a peer
    Send {
        /// File to send
        file: PathBuf,
        /// Peer descriptor (flick://host:port|name) or host:port|name
        target: String,
        /// Device name shown to the peer (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
        /// Skip the TLS attempt and connect plain
        #[arg(long)]
        insecure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Listen {
            port,
            name,
            save_dir,
            insecure,
        } => listen(port, name, save_dir, !insecure).await,
        Cmd::Discover { timeout } => discover(Duration::from_secs(timeout)).await,
        Cmd::Send {
            file,
            target,
            name,
            insecure,
        } => send(file, target, name, !insecure).await,
    }
}

async fn listen(
    port: u16,
    name: Option<String>,
    save_dir: PathBuf,
    prefer_secure: bool,
) -> Result<()> {
    let mut config = SessionConfig {
        port,
        save_dir,
        prefer_secure,
        ..SessionConfig::default()
    };
    if let Some(name) = name {
        config.device_name = name;
    }
    let (session, mut events) = Session::new(config);
    session.start_listening().await?;
    let _advertiser = session.announce();
    println!("share this descriptor: {}", session.descriptor());

    while let Some(event) = events.recv().await {
        match event {
            Event::Connected { peer } => println!("connected: {peer}"),
            Event::FileOffered(d) => {
                println!("incoming: {} ({} bytes)", d.meta.name, d.meta.size)
            }
            Event::Progress { received_bytes, .. } => {
                info!(received_bytes, "receiving")
            }
            Event::TransferComplete { descriptor, path } => {
                let path = path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unsaved>".into());
                println!("received {} -> {path}", descriptor.meta.name);
            }
            Event::Disconnected => println!("peer disconnected, waiting for the next one"),
            Event::Error { kind, message } => eprintln!("error ({kind:?}): {message}"),
        }
    }
    Ok(())
}

async fn discover(window: Duration) -> Result<()> {
    let mut listener = DiscoveryListener::bind().await?;
    println!("listening for peers for {}s...", window.as_secs());
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let peer = tokio::select! {
            p = listener.next() => p,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match peer {
            Some(p) => println!("{}  (from {})", p.descriptor, p.from),
            None => break,
        }
    }
    let peers = listener.peers();
    if peers.is_empty() {
        println!("no peers heard");
    }
    Ok(())
}

async fn send(
    file: PathBuf,
    target: String,
    name: Option<String>,
    prefer_secure: bool,
) -> Result<()> {
    let descriptor = PeerDescriptor::parse(&target)?;
    let mut config = SessionConfig {
        prefer_secure,
        ..SessionConfig::default()
    };
    if let Some(name) = name {
        config.device_name = name;
    }
    let (session, mut events) = Session::new(config);
    session.connect(&descriptor.host, descriptor.port, &descriptor.name).await?;
    println!(
        "connected to {} ({})",
        descriptor.name,
        if session.is_secured() { "tls" } else { "plain" }
    );
    session.offer_file(&file).await?;

    while let Some(event) = events.recv().await {
        match event {
            Event::Progress { sent_bytes, .. } => info!(sent_bytes, "sending"),
            Event::TransferComplete { descriptor, .. } => {
                println!("sent {}", descriptor.meta.name);
                break;
            }
            Event::Disconnected => {
                anyhow::bail!("peer disconnected before the transfer finished");
            }
            Event::Error { kind, message } => eprintln!("error ({kind:?}): {message}"),
            _ => {}
        }
    }
    session.disconnect();
    Ok(())
}
