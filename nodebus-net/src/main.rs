// nodebus daemon: brings up the configured networks and drives both transports on a fixed tick.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use nodebus_core::{BusHost, Message, NetId, NodeId, Timing, TransportRegistry};
use nodebus_net::{config, DatagramTransport, Node, StreamTransport};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bus side of the daemon: traffic and peer changes go to the log.
struct LogHost;

impl BusHost for LogHost {
    fn deliver(&mut self, net: NetId, msg: Message) {
        info!(%net, sender = %msg.sender, msg_type = %msg.msg_type, len = msg.payload.len(), "message");
    }

    fn peer_connected(&mut self, net: NetId, node: NodeId) {
        info!(%net, %node, "bus: peer up");
    }

    fn peer_disconnected(&mut self, net: NetId, node: NodeId) {
        info!(%net, %node, "bus: peer down");
    }
}

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nodebus {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let local = NodeId(cfg.node_id);
    let timing = Timing::from(cfg.timing);
    let registry = TransportRegistry::new()
        .with(Box::new(StreamTransport::new(local, timing)))
        .with(Box::new(DatagramTransport::new(local, timing)));
    let mut node = Node::new(local, registry);

    let report = node.load(&cfg.entries);
    for (net, e) in &report.failed {
        warn!(%net, error = %e, "network failed to start");
    }
    info!(
        node = %local,
        up = report.up.len(),
        rejected = report.rejected.len(),
        failed = report.failed.len(),
        "nodebus {} started",
        VERSION
    );
    if report.up.is_empty() {
        warn!("no networks are up");
    }

    let status_every = Duration::from_secs(cfg.status_secs);
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(node, cfg.tick(), status_every))
}

async fn run(mut node: Node, tick: Duration, status_every: Duration) -> anyhow::Result<()> {
    let mut host = LogHost;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut last_status = Instant::now();

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = interval.tick() => {
                let report = node.tick(&mut host);
                if report.errors > 0 {
                    warn!(errors = report.errors, delivered = report.delivered, "tick had errors");
                }
                if !status_every.is_zero() && last_status.elapsed() >= status_every {
                    log_status(&node);
                    last_status = Instant::now();
                }
            }
        }
    }

    info!("shutting down");
    node.shutdown(&mut host);
    Ok(())
}

fn log_status(node: &Node) {
    for (net, s) in node.status() {
        info!(
            %net,
            node = %s.node,
            connected = s.connected,
            dial_attempts = s.dial_attempts,
            "peer status"
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl+C")?;
    }
    Ok(())
}
