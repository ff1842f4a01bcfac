//! tapgate: TCP connection forwarder for a virtual-network gateway
//!
//! This is the main entry point for the gateway.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tapgate
//!
//! # Run with custom configuration
//! sudo ./tapgate -c /path/to/config.json
//!
//! # Run with environment overrides
//! TAPGATE_LOG_LEVEL=debug sudo ./tapgate
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tapgate::config::{load_config_with_env, Config};
use tapgate::connection::{
    run_accept_loop, AttemptContext, ConnectionManager, ConnectionStats, InboundOverlayListener,
};
use tapgate::ipc::{IpcHandler, IpcServer};
use tapgate::outbound::{DirectOutbound, OverlayOutbound};
use tapgate::overlay::{OverlayTransport, PeerRegistry, StaticPeerRegistry, TcpOverlay};
use tapgate::route::{NatTable, ReservedRanges, Router};
use tapgate::stack::VirtualStack;
use tapgate::tproxy::{has_net_admin_capability, is_root, TproxyListener, TproxyStack};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tapgate/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tapgate v{}", tapgate::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tapgate v{}

TCP connection forwarder for a virtual-network gateway.

USAGE:
    tapgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tapgate/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TAPGATE_LISTEN_ADDR      Override TPROXY listen address
    TAPGATE_TAP_IP           Override tap-facing address
    TAPGATE_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    TAPGATE_MAX_CONNECTIONS  Override maximum connections
    TAPGATE_IPC_SOCKET       Override IPC socket path

REQUIREMENTS:
    - Linux kernel with TPROXY support
    - CAP_NET_ADMIN capability (or root)
    - iptables TPROXY rule on the tap interface

EXAMPLE:
    iptables -t mangle -A PREROUTING -i tap0 -p tcp -j TPROXY \
        --on-ip 127.0.0.1 --on-port 7894 --tproxy-mark 0x1
    ip rule add fwmark 0x1 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100

    sudo tapgate -c /etc/tapgate/config.json
"#,
        tapgate::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("TPROXY requires CAP_NET_ADMIN capability");
        // Socket creation reports the precise failure
    }
}

/// Build the NAT table and peer registry from the initial entries in `config`
fn build_state(config: &Config) -> (Arc<NatTable>, Arc<StaticPeerRegistry>) {
    let nat = Arc::new(NatTable::with_entries(
        config.nat.iter().map(|e| (e.address, e.translated)),
    ));
    let registry = Arc::new(StaticPeerRegistry::with_claims(
        config.claims.iter().map(|c| (c.address, c.peer_id.clone())),
    ));

    info!(
        "Loaded {} NAT entries and {} peer claims",
        nat.len(),
        registry.len()
    );
    (nat, registry)
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        tapgate::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tapgate v{}", tapgate::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    check_prerequisites();

    let (nat, registry) = build_state(&config);
    let stats = Arc::new(ConnectionStats::new());
    let (overlay_shutdown, _) = broadcast::channel::<()>(1);

    // Guest-facing stack
    let listener = TproxyListener::bind(&config.tap).context("Failed to create TPROXY listener")?;
    let stack: Arc<dyn VirtualStack> = Arc::new(TproxyStack::new(listener));

    // Overlay transport, serving the forwarder protocol for remote peers
    let overlay = Arc::new(TcpOverlay::new(
        config.overlay.peer_id.clone(),
        config
            .overlay
            .peers
            .iter()
            .map(|p| (p.peer_id.clone(), p.address)),
        config.overlay.connect_timeout(),
    ));
    let inbound =
        InboundOverlayListener::from_config(&config, Arc::clone(&stack), Arc::clone(&stats));
    info!("Inbound overlay streams dial {} inside the stack", inbound.tap_ip());
    overlay.register_handler(&config.forwarder.protocol_id, Arc::new(inbound));

    let overlay_listener = TcpOverlay::bind(config.overlay.listen)
        .await
        .context("Failed to bind overlay listener")?;
    let overlay_handle = {
        let overlay = Arc::clone(&overlay);
        let shutdown_rx = overlay_shutdown.subscribe();
        tokio::spawn(async move { overlay.serve(overlay_listener, shutdown_rx).await })
    };

    // Outbound legs and routing policy
    let router = Arc::new(Router::new(
        ReservedRanges::new(config.forwarder.reserved_subnets.clone()),
        Arc::clone(&nat),
        Arc::clone(&registry) as Arc<dyn PeerRegistry>,
    ));
    let ctx = AttemptContext::from_config(
        &config,
        router,
        OverlayOutbound::new(
            Arc::clone(&overlay) as Arc<dyn OverlayTransport>,
            config.forwarder.protocol_id.clone(),
            config.forwarder.overlay_open_timeout(),
        ),
        Arc::new(DirectOutbound::default()),
    );
    let connection_manager = Arc::new(ConnectionManager::new(
        &config.connection,
        ctx,
        Arc::clone(&stats),
    ));

    // IPC control plane
    let ipc_handler = Arc::new(IpcHandler::new(
        Arc::clone(&connection_manager),
        Arc::clone(&nat),
        Arc::clone(&registry),
        Arc::clone(&stack),
        config.overlay.peer_id.clone(),
        config.forwarder.protocol_id.clone(),
    ));
    let mut ipc_shutdown_requested = ipc_handler.subscribe_shutdown();
    let ipc_server = IpcServer::new(config.ipc.clone(), Arc::clone(&ipc_handler));
    let ipc_shutdown = ipc_server.shutdown_sender();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server error: {}", e);
        }
    });

    info!(
        "tapgate ready: guests on {}, overlay {} on {} as {}",
        config.tap.listen,
        config.forwarder.protocol_id,
        config.overlay.listen,
        config.overlay.peer_id
    );
    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let accept_result = tokio::select! {
        result = run_accept_loop(Arc::clone(&stack), Arc::clone(&connection_manager)) => {
            result
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
        _ = ipc_shutdown_requested.recv() => {
            info!("Shutdown requested over IPC, initiating shutdown...");
            Ok(())
        }
    };

    info!("Shutting down...");

    connection_manager.shutdown().await;

    let _ = overlay_shutdown.send(());
    let _ = ipc_shutdown.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = tokio::join!(overlay_handle, ipc_handle);
    })
    .await;

    let stats = connection_manager.stats_snapshot();
    info!(
        "Final stats: {} accepted, {} bridged, {} failed, {} rejected (policy), {} rejected (limit)",
        stats.accepted, stats.bridged, stats.failed, stats.rejected_policy, stats.rejected_limit
    );
    info!(
        "Routes: {} overlay, {} direct; inbound streams: {} ({} failed)",
        stats.overlay, stats.direct, stats.inbound_streams, stats.inbound_failed
    );
    info!(
        "Transferred: {} bytes rx, {} bytes tx",
        stats.bytes_rx, stats.bytes_tx
    );

    info!("Shutdown complete");

    accept_result.context("Accept loop error")
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
