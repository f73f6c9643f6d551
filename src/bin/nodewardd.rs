//! nodewardd - node-resident daemon hosting capability plugins.
//!
//! Loads plugins from the plugin directory at startup, runs the scheduler
//! and serves the command and SDK sockets until SIGTERM/SIGINT or a
//! SHUTDOWN request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeward::config::{self, DaemonConfig};
use nodeward::loader::PluginRegistry;
use nodeward::payload::default_registry;
use nodeward::scheduler::{Scheduler, SchedulerHandle, PUSH_QUEUE_DEPTH};
use nodeward::server::{ServerConfig, WardServer};

#[derive(Parser)]
#[command(name = "nodewardd", about = "Capability plugin host daemon", version)]
struct Args {
    /// Config file path (default: ~/.config/nodeward/nodewardd.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter override (also $NODEWARD_LOG, e.g. "debug,nodeward=trace").
    #[arg(long)]
    log: Option<String>,
}

fn init_tracing(args: &Args, config: &DaemonConfig) {
    let directives = args
        .log
        .clone()
        .or_else(|| std::env::var(config::ENV_LOG).ok())
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load every shared object in the plugin directory. A plugin that fails
/// to load is skipped; the daemon still comes up.
async fn scan_plugin_dir(registry: &mut PluginRegistry, scheduler: &SchedulerHandle, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "plugin directory not readable");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("so") {
            continue;
        }
        let (name, instances) = match registry.load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping plugin");
                continue;
            }
        };
        match scheduler.add_instances(name.clone(), instances).await {
            Ok(accepted) => {
                info!(plugin = %name, instances = ?accepted, "plugin loaded at startup");
                registry.commit(&name, accepted);
            }
            Err(e) => {
                warn!(plugin = %name, error = %e, "plugin rejected");
                registry.discard(&name);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(DaemonConfig::default_path);
    let config = DaemonConfig::load(&config_path)?;
    init_tracing(&args, &config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "nodewardd starting"
    );

    let codecs = Arc::new(default_registry());
    let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
    let (scheduler, scheduler_task) = Scheduler::new(
        Arc::clone(&codecs),
        Duration::from_millis(config.tick_ms),
        push_tx,
    );
    tokio::spawn(scheduler_task.run());

    let mut registry = PluginRegistry::new();
    scan_plugin_dir(&mut registry, &scheduler, &config.plugin_dir()).await;
    let plugins = Arc::new(Mutex::new(registry));

    for entry in &config.enable_list {
        let (name, param) = DaemonConfig::parse_enable_entry(entry);
        if name.is_empty() {
            continue;
        }
        match scheduler.enable(name.to_string(), param.to_string()).await {
            Ok(()) => info!(instance = %name, "auto-enabled"),
            Err(e) => warn!(instance = %name, error = %e, "auto-enable failed"),
        }
    }

    let server = WardServer::new(
        ServerConfig {
            command_socket: config.command_socket(),
            sdk_socket: config.sdk_socket(),
            sdk_group: config.sdk_group.clone(),
        },
        scheduler,
        plugins,
        codecs,
        push_rx,
    );
    server.run().await?;

    info!("nodewardd stopped");
    Ok(())
}
