mod console;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use warden_core::transport::runtime_dir;
use warden_core::{
    acquire_or_signal, ClientOptions, Endpoint, GuardOutcome, JsonSettingsStore, SessionClient,
    SessionController,
};

use crate::console::ConsolePresenter;

const APP_NAME: &str = "warden";

#[derive(Clone, Debug)]
struct Config {
    endpoint: Endpoint,
    settings_path: PathBuf,
    lock_path: PathBuf,
    log_dir: String,
    connect_timeout: Duration,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Desktop companion for the warden DNS filter service")]
struct Args {
    /// Service endpoint (socket path or named pipe)
    #[arg(long, default_value = "")]
    endpoint: String,
    /// Settings file
    #[arg(long, default_value = "")]
    settings: String,
    /// Single-instance lock file
    #[arg(long, default_value = "")]
    lock: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();
    let _log_guard = logging::init_logging(config.debug, &config.log_dir, APP_NAME);

    let options = ClientOptions {
        connect_timeout: config.connect_timeout,
        ..ClientOptions::default()
    };

    let lock = match acquire_or_signal(
        &config.lock_path,
        &config.endpoint,
        options.one_shot_timeout,
    )
    .await
    .context("instance guard")?
    {
        GuardOutcome::Primary(lock) => lock,
        GuardOutcome::Secondary { delivered } => {
            if !delivered {
                warn!(event = "already_running_unreachable", endpoint = %config.endpoint);
            }
            info!(event = "already_running", delivered = delivered);
            return Ok(());
        }
    };

    info!(
        event = "app_start",
        endpoint = %config.endpoint,
        settings = %config.settings_path.display(),
        lock = %lock.path().display()
    );

    let store = Arc::new(JsonSettingsStore::open(&config.settings_path));
    let presenter = Arc::new(ConsolePresenter::stdout());
    let client = SessionClient::new(config.endpoint.clone(), options);
    let controller = SessionController::new(client, store, presenter.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = controller.clone();
    let run_task = tokio::spawn(async move { runner.run(shutdown_rx).await });

    presenter.banner(&controller.status());
    tokio::select! {
        _ = console::run(controller.clone(), presenter.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!(event = "interrupted");
        }
    }

    let _ = shutdown_tx.send(true);
    run_task.await.context("controller task")?;
    lock.release();
    info!(event = "app_stop");
    Ok(())
}

fn load_config() -> Config {
    let args = Args::parse();
    let endpoint = resolve_setting(&args.endpoint, "WARDEN_ENDPOINT")
        .map(Endpoint::new)
        .unwrap_or_else(|| Endpoint::platform_default(APP_NAME));
    let settings_path = resolve_setting(&args.settings, "WARDEN_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let lock_path = resolve_setting(&args.lock, "WARDEN_LOCK")
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir().join(APP_NAME).join(format!("{APP_NAME}.lock")));
    let log_dir = resolve_setting(&args.log_dir, "WARDEN_LOG_DIR").unwrap_or_default();
    let debug = args.debug || logging::env_true("WARDEN_DEBUG");
    Config {
        endpoint,
        settings_path,
        lock_path,
        log_dir,
        connect_timeout: Duration::from_millis(args.connect_timeout_ms.max(1)),
        debug,
    }
}

/// Flag value if set, else the environment variable if set.
fn resolve_setting(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn default_settings_path() -> PathBuf {
    config_dir().join(APP_NAME).join("settings.json")
}

fn config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(std::env::temp_dir)
}
