use clap::{Parser, Subcommand};
use netfs_cluster::config::{AdminArgs, NamingConfig, StorageConfig};
use netfs_cluster::membership::types::NodeSummary;
use netfs_cluster::naming;
use netfs_cluster::naming::namespace::NamespaceStats;
use netfs_cluster::naming::protocol::EvictResponse;
use netfs_cluster::storage;

#[derive(Parser, Debug)]
#[command(name = "netfs", about = "Distributed network file system")]
struct Cli {
    /// Log at DEBUG instead of INFO
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the naming server
    Naming(NamingConfig),
    /// Run a storage node exporting a local directory
    Storage(StorageConfig),
    /// Talk to a running naming server's admin API
    Admin {
        #[command(flatten)]
        args: AdminArgs,
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
enum AdminAction {
    /// List registered storage nodes
    Nodes,
    /// Show namespace counters
    Stats,
    /// Remove a node from the registry for good
    Evict { id: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match cli.role {
        Role::Naming(config) => {
            tracing::info!("Starting naming server on {}", config.bind);
            tracing::info!("Press Ctrl+C to shutdown");
            naming::server::run(config).await
        }
        Role::Storage(config) => {
            tracing::info!(
                "Starting storage node on {} (naming server {})",
                config.bind,
                config.naming
            );
            storage::server::run(config).await
        }
        Role::Admin { args, action } => admin(args, action).await,
    }
}

async fn admin(args: AdminArgs, action: AdminAction) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/');

    match action {
        AdminAction::Nodes => {
            let nodes: Vec<NodeSummary> = client
                .get(format!("{}/admin/nodes", base))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            for node in nodes {
                println!(
                    "{}  {}  {:?}  paths={}  backups={:?}",
                    node.id, node.addr, node.state, node.path_count, node.backups
                );
            }
        }
        AdminAction::Stats => {
            let stats: NamespaceStats = client
                .get(format!("{}/admin/stats", base))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        AdminAction::Evict { id } => {
            let response: EvictResponse = client
                .post(format!("{}/admin/evict/{}", base, id))
                .send()
                .await?
                .json()
                .await?;
            match response.node {
                Some(node) if response.evicted => println!("Evicted {} ({})", node.id, node.addr),
                _ => println!("No node-{} registered", id),
            }
        }
    }
    Ok(())
}
