use clap::{Parser, Subcommand};
use natgate::capture::AfPacketSocket;
use natgate::config;
use natgate::dataplane::{FrameBatch, Router, MAINTENANCE_INTERVAL};
use natgate::telemetry::{init_logging, MetricsRegistry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "natgate")]
#[command(about = "A software IPv4 router with an integrated NAPT gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate config.toml without running
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Validate { config }) => cmd_validate(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(Path::new("config.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(path: &Path) -> Result<(), String> {
    let cfg = config::load(path).map_err(|e| e.to_string())?;
    config::validate(&cfg).map_err(|e| e.to_string())?;
    println!("[INFO] configuration is valid");
    Ok(())
}

fn cmd_run(path: &Path) -> Result<(), String> {
    let cfg = config::load(path).map_err(|e| e.to_string())?;
    config::validate(&cfg).map_err(|e| e.to_string())?;
    init_logging(Some(&cfg.log));

    let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;

    rt.block_on(async move {
        let metrics = Arc::new(MetricsRegistry::new());
        let router = Router::from_config(&cfg, metrics).map_err(|e| e.to_string())?;

        // One socket per interface; each gets a reader/writer task with
        // its own egress queue, so the packet pipeline itself stays
        // single-threaded.
        let (ingress_tx, mut ingress_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        let mut egress: HashMap<String, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

        for name in router.interface_names() {
            let mut socket = AfPacketSocket::bind(&name).map_err(|e| {
                format!("failed to bind {}: {} (root privileges required)", name, e)
            })?;

            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            egress.insert(name.clone(), tx);

            let ingress_tx = ingress_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let mut outbound: Option<Vec<u8>> = None;
                    tokio::select! {
                        received = socket.recv(&mut buf) => match received {
                            Ok(len) => {
                                if ingress_tx.send((name.clone(), buf[..len].to_vec())).is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!("receive error on {}: {}", name, e),
                        },
                        frame = rx.recv() => match frame {
                            Some(frame) => outbound = Some(frame),
                            None => break,
                        },
                    }
                    if let Some(frame) = outbound {
                        if let Err(e) = socket.send(&frame).await {
                            warn!("send error on {}: {}", name, e);
                        }
                    }
                }
            });
        }
        drop(ingress_tx);

        info!(
            "natgate started: {} interfaces, NAT {}",
            egress.len(),
            if router.is_nat_enabled() { "on" } else { "off" }
        );

        let dispatch = |frames: FrameBatch| {
            for (iface, frame) in frames {
                if let Some(tx) = egress.get(&iface) {
                    let _ = tx.send(frame);
                }
            }
        };

        let mut arp_timer = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut nat_timer = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
                _ = arp_timer.tick() => dispatch(router.arp_tick()),
                _ = nat_timer.tick() => dispatch(router.nat_tick()),
                received = ingress_rx.recv() => match received {
                    Some((iface, frame)) => dispatch(router.handle_packet(&frame, &iface)),
                    None => break,
                },
            }
        }

        Ok(())
    })
}
