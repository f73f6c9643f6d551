//! nodeward - management CLI for the nodewardd daemon.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use nodeward::client::WardClient;

#[derive(Parser)]
#[command(name = "nodeward")]
#[command(version)]
#[command(about = "Manage capability plugins on the local node", long_about = None)]
struct Cli {
    /// Command socket path (also $NODEWARD_SOCKET).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a plugin from a shared object file
    Load {
        /// Path to the .so file
        path: PathBuf,
    },

    /// Unload a plugin and all of its instances
    Remove {
        /// Plugin name
        plugin: String,
    },

    /// Enable an instance
    Enable {
        /// Instance name
        instance: String,

        /// Instance-specific parameter string
        #[arg(default_value = "")]
        param: String,
    },

    /// Disable an instance
    Disable {
        /// Instance name
        instance: String,

        /// Also drop the instance's own subscriptions
        #[arg(long)]
        force: bool,
    },

    /// Show the state of one instance, or all instances
    Query {
        /// Instance name (all instances if omitted)
        instance: Option<String>,
    },

    /// Show subscription edges, optionally filtered by producer
    Subgraph {
        /// Producer instance name (all edges if omitted)
        producer: Option<String>,
    },

    /// List loaded plugins
    List,

    /// Show daemon version, uptime and socket paths
    Info,

    /// Print the daemon-side path of a plugin's shared object
    Download {
        /// Plugin name
        plugin: String,
    },

    /// Stop the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let client = match &cli.socket {
        Some(path) => WardClient::with_socket(path.clone()),
        None => WardClient::new(),
    };

    if !client.socket_exists() {
        bail!(
            "daemon socket not found at {} (is nodewardd running?)",
            client.socket_path().display()
        );
    }

    match cli.command {
        Commands::Load { path } => {
            let abs = std::fs::canonicalize(&path)
                .with_context(|| format!("cannot resolve {}", path.display()))?;
            let name = client.load(&abs.display().to_string()).await?;
            println!("loaded plugin '{name}'");
        }
        Commands::Remove { plugin } => {
            client.remove(&plugin).await?;
            println!("removed plugin '{plugin}'");
        }
        Commands::Enable { instance, param } => {
            client.enable(&instance, &param).await?;
            println!("enabled '{instance}'");
        }
        Commands::Disable { instance, force } => {
            client.disable(&instance, force).await?;
            println!("disabled '{instance}'");
        }
        Commands::Query { instance } => {
            let snaps = match instance {
                Some(name) => client.query(&name).await?,
                None => client.query_all().await?,
            };
            if snaps.is_empty() {
                println!("no instances");
            }
            for s in snaps {
                println!(
                    "{:<24} {:<10} {:<9} plugin={} period={} priority={} topics=[{}]",
                    s.name,
                    s.kind,
                    s.state,
                    s.plugin,
                    s.period,
                    s.priority,
                    s.supported_topics.join(", ")
                );
            }
        }
        Commands::Subgraph { producer } => {
            let edges = match producer {
                Some(name) => client.sub_graph(&name).await?,
                None => client.sub_graph_all().await?,
            };
            if edges.is_empty() {
                println!("no subscriptions");
            }
            for e in edges {
                println!("{} -> {}", e.topic, e.subscriber);
            }
        }
        Commands::List => {
            let plugins = client.list().await?;
            if plugins.is_empty() {
                println!("no plugins loaded");
            }
            for p in plugins {
                println!(
                    "{:<24} instances=[{}] {}",
                    p.name,
                    p.instances.join(", "),
                    p.path.as_deref().unwrap_or("(built-in)")
                );
            }
        }
        Commands::Info => {
            let info = client.info().await?;
            println!("version:        {}", info.version);
            println!("uptime:         {}s", info.uptime_secs);
            println!("command socket: {}", info.command_socket);
            println!("sdk socket:     {}", info.sdk_socket);
            println!("plugins:        {}", info.plugins);
        }
        Commands::Download { plugin } => {
            let path = client.download(&plugin).await?;
            println!("{}", path.display());
        }
        Commands::Shutdown => {
            client.shutdown().await?;
            println!("daemon shutting down");
        }
    }

    Ok(())
}
