use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pulsemesh::{topic_hash, ChatScope, Engine, EngineConfig, Keypair, PowProof};

/// Fixed overlay topic every node joins.
const GLOBAL_TOPIC: &str = "pulsemesh:global-presence:v1";

#[derive(Parser, Debug)]
#[command(name = "pulsemesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address for peer sockets. Falls back to the PORT environment
    /// variable, then an ephemeral port.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Peers to dial at startup (IP:PORT, repeatable).
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Print every engine event as one JSON line on stdout.
    #[arg(long)]
    events: bool,

    /// Load (or create) the node keypair at this path instead of using an
    /// ephemeral identity.
    #[arg(long, value_name = "PATH")]
    key_file: Option<PathBuf>,
}

fn bind_addr(args: &Args) -> SocketAddr {
    if let Some(addr) = args.bind {
        return addr;
    }
    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(0);
    format!("0.0.0.0:{}", port)
        .parse()
        .expect("static bind address is valid")
}

/// Load a keypair from `path`, or generate one and persist it (secret key
/// as hex). The PoW nonce is re-solved at startup either way.
fn load_or_create_keypair(path: &PathBuf) -> Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("key file is not valid hex")?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("key file must hold a 32-byte secret key"))?;
        return Ok(Keypair::from_secret_key_bytes(&secret));
    }
    let keypair = Keypair::generate();
    std::fs::write(path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    info!(path = %path.display(), "generated new node keypair");
    Ok(keypair)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env();

    // Identity comes up before any network activity: load or mint the
    // keypair, then solve the admission proof-of-work.
    let (keypair, pow) = match &args.key_file {
        Some(path) => {
            let keypair = load_or_create_keypair(path)?;
            let pow = PowProof::compute_for(&keypair.node_id(), config.pow_difficulty);
            (keypair, pow)
        }
        None => {
            let (keypair, pow) = Keypair::generate_with_pow_difficulty(config.pow_difficulty)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            (keypair, pow)
        }
    };

    let listener = TcpListener::bind(bind_addr(&args))
        .await
        .context("failed to bind listen address")?;
    let local_addr = listener.local_addr()?;

    let engine = Engine::spawn(keypair, pow, config);
    info!(
        id = %engine.local_id(),
        addr = %local_addr,
        topic = %hex::encode(topic_hash(GLOBAL_TOPIC)),
        "node up"
    );

    if args.events {
        let mut rx = engine.subscribe().await?;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{}", line);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    for addr in &args.bootstrap {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let ip = stream.peer_addr().ok().map(|a| a.ip());
                engine.add_connection(stream, ip).await?;
                info!(peer = %addr, "bootstrap connection established");
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "bootstrap connection failed");
            }
        }
    }

    // Stdin lines become GLOBAL chat submissions.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = engine.submit_chat(&line, ChatScope::Global, None).await {
                    warn!(error = %e, "chat rejected");
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, broadcasting LEAVE");
                engine.shutdown().await;
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        engine.add_connection(stream, Some(peer_addr.ip())).await?;
                        info!(peer = %peer_addr, "peer socket accepted");
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    Ok(())
}
