//! Development stand-in for the background service: owns the endpoint,
//! simulates the lifecycle and relays `open` to every connected app.

mod simulator;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "warden-stub", about = "Simulated warden service for local development")]
struct Args {
    /// Socket path to serve
    #[arg(long, default_value = "")]
    endpoint: String,
    /// Delay before a starting/stopping transition completes
    #[arg(long, default_value_t = 300)]
    settle_ms: u64,
    /// Make every start attempt fail with this error
    #[arg(long)]
    fail_with: Option<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("warden-stub needs unix domain sockets")
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<()> {
    use std::time::Duration;
    use tokio::sync::watch;
    use tracing::info;
    use warden_core::server::{ControlServer, ServerConfig};
    use warden_core::Endpoint;

    let args = Args::parse();
    init_logging(args.debug);

    let endpoint = if args.endpoint.trim().is_empty() {
        match std::env::var("WARDEN_ENDPOINT") {
            Ok(value) if !value.trim().is_empty() => Endpoint::new(value),
            _ => Endpoint::platform_default("warden"),
        }
    } else {
        Endpoint::new(&args.endpoint)
    };

    let (server, events) = ControlServer::bind(ServerConfig::new(endpoint.path()))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "stub_interrupted");
        let _ = shutdown_tx.send(true);
    });

    serve::serve(
        server,
        events,
        simulator::Simulator::new(args.fail_with),
        Duration::from_millis(args.settle_ms),
        shutdown_rx,
    )
    .await
}

#[cfg(unix)]
fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(unix)]
mod serve {
    use anyhow::{Context, Result};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tracing::{debug, info};
    use warden_core::server::{ControlServer, ServerEvent, ServerHandle};

    use crate::simulator::{Simulator, Step};

    pub async fn serve(
        server: ControlServer,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut simulator: Simulator,
        settle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let handle = server.handle();
        info!(event = "stub_start", socket = %server.socket_path().display());
        let server_task = tokio::spawn(server.run(shutdown.clone()));
        let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<u64>();

        loop {
            let steps = tokio::select! {
                event = events.recv() => match event {
                    Some(ServerEvent::Received(conn_id, event)) => {
                        debug!(event = "stub_received", conn_id = %conn_id, name = %event.name);
                        simulator.handle(&event)
                    }
                    Some(ServerEvent::Connected(_) | ServerEvent::Disconnected(_)) => continue,
                    None => break,
                },
                Some(generation) = settle_rx.recv() => simulator.settle(generation),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            dispatch(&handle, steps, settle, &settle_tx).await;
        }

        server_task
            .await
            .context("control server task")?
            .context("control server")?;
        info!(event = "stub_stop", state = %simulator.state());
        Ok(())
    }

    async fn dispatch(
        handle: &ServerHandle,
        steps: Vec<Step>,
        settle: Duration,
        settle_tx: &mpsc::UnboundedSender<u64>,
    ) {
        for step in steps {
            match step {
                Step::Broadcast(event) => {
                    handle.broadcast(&event).await;
                }
                Step::Settle(generation) => {
                    let settle_tx = settle_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(settle).await;
                        let _ = settle_tx.send(generation);
                    });
                }
            }
        }
    }

}
