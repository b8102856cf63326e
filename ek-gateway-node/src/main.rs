//! EK Gateway Node - CLI for the OCPP networking node
//!
//! Connects to a CSMS, registers with BootNotification, keeps heartbeats
//! going and relays CALLs between the CSMS and downstream stations.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! ek-gateway-node --name EK-NN-001
//!
//! # Connect to specific CSMS
//! ek-gateway-node --name EK-NN-001 \
//!     --ocpp-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Accept stations and reach CS100 through child node NN2
//! ek-gateway-node --name EK-NN-001 --listen 0.0.0.0:9000 --route CS100=NN2
//!
//! # Sign requests and trust the CSMS key
//! ek-gateway-node --name EK-NN-001 --signing-seed <64 hex chars> \
//!     --trust csms=<64 hex chars> --strict-verification
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ek_ocpp_gateway::transport::UplinkEvent;
use ek_ocpp_gateway::{BootReason, Gateway, GatewayConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 2.0.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier (also the station id in the CSMS URL)
    #[arg(short, long)]
    name: String,

    /// OCPP CSMS WebSocket URL
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    ocpp_url: String,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Serial number
    #[arg(long)]
    serial: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Fail requests whose response signature does not verify
    #[arg(long)]
    strict_verification: bool,

    /// Hex-encoded Ed25519 seed used to sign requests
    #[arg(long)]
    signing_seed: Option<String>,

    /// Trusted verifying key as KEY_ID=HEX (can be repeated)
    #[arg(long)]
    trust: Vec<String>,

    /// Accept downstream WebSocket connections on this address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Static route as TARGET=VIA (can be repeated)
    #[arg(long)]
    route: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             EK Gateway Node - OCPP Networking Node           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  OCPP URL: {:<50} ║", truncate(&args.ocpp_url, 50));
    println!("║  Listen:   {:<50} ║", args.listen.map(|a| a.to_string()).unwrap_or_else(|| "-".into()));
    println!("║  Signing:  {:<50} ║", if args.signing_seed.is_some() { "Ed25519" } else { "off" });
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = GatewayConfig::new(args.name.as_str(), &args.ocpp_url)
        .with_vendor(&args.vendor, &args.model)
        .with_request_timeout(Duration::from_secs(args.request_timeout));

    if let Some(serial) = &args.serial {
        config = config.with_serial(serial);
    }
    if args.strict_verification {
        config = config.with_strict_verification();
    }
    if let Some(seed) = &args.signing_seed {
        config = config.with_signing_seed(seed);
    }
    for entry in &args.trust {
        match split_pair(entry) {
            Some((key_id, key_hex)) => config = config.with_trusted_key(key_id, key_hex),
            None => eprintln!("Invalid trusted key (expected KEY_ID=HEX): {}", entry),
        }
    }
    for entry in &args.route {
        match split_pair(entry) {
            Some((target, via)) => {
                info!("Added static route: {} via {}", target, via);
                config = config.with_route(target, via);
            }
            None => eprintln!("Invalid route (expected TARGET=VIA): {}", entry),
        }
    }
    if let Some(addr) = args.listen {
        config = config.with_listen_addr(addr);
    }

    info!("Starting gateway node...");

    let (gateway, mut incoming) = Gateway::new(config)?;
    let gateway = Arc::new(gateway);

    // Uplink to the CSMS
    let (uplink_tx, mut uplink_events) = mpsc::channel(8);
    tokio::spawn(gateway.uplink_connector().run(uplink_tx));

    // Downstream stations and child nodes
    if let Some(addr) = gateway.config().relay.listen_addr {
        let listener = TcpListener::bind(addr).await?;
        let gw = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gw.serve_downstream(listener).await {
                error!("Downstream listener stopped: {}", e);
            }
        });
    }

    // Inbound CALLs from every channel
    let gw = gateway.clone();
    tokio::spawn(async move {
        while let Some(request) = incoming.recv().await {
            let gw = gw.clone();
            tokio::spawn(async move { gw.handle_incoming(request).await });
        }
    });

    // Heartbeats follow the negotiated state
    let gw = gateway.clone();
    tokio::spawn(async move { gw.run_heartbeats().await });

    let mut registration: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        tokio::select! {
            event = uplink_events.recv() => {
                match event {
                    Some(UplinkEvent::Connected) => {
                        let gw = gateway.clone();
                        if let Some(task) = registration.replace(tokio::spawn(async move {
                            let state = gw.register(BootReason::PowerUp).await;
                            info!("Registration finished: {:?}", state);
                        })) {
                            task.abort();
                        }
                    }
                    Some(UplinkEvent::Disconnected) => {
                        if let Some(task) = registration.take() {
                            task.abort();
                        }
                        gateway.state().mark_disconnected();
                        warn!("Uplink lost, heartbeats paused");
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Split "A=B" into its halves
fn split_pair(s: &str) -> Option<(&str, &str)> {
    let (left, right) = s.split_once('=')?;
    if left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left, right))
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
