use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use rods_catalog::config::{CollectionOptions, ConnectionOptions, Environment};
use rods_catalog::services::catalog::memory::{CatalogSnapshot, MemoryCatalog};
use rods_catalog::services::tracing_setup;
use rods_catalog::tree::{CollectionTree, NodeId, ReadWindow};
use rods_catalog::Connection;
use std::path::PathBuf;
use std::sync::Arc;

/// Browse a catalog snapshot the way a catalog client sees it
#[derive(Parser, Debug)]
#[command(name = "rods-ls")]
#[command(about = "List collections of a catalog snapshot", long_about = None)]
#[command(version)]
struct Args {
    /// Collection to list
    #[arg(value_name = "PATH")]
    path: String,

    /// JSON catalog snapshot to serve
    #[arg(long, value_name = "PATH")]
    catalog: PathBuf,

    /// Path to connection configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Skip this many entries (sub-collections first, then data objects)
    #[arg(long)]
    offset: Option<usize>,

    /// Show at most this many entries
    #[arg(long)]
    limit: Option<usize>,

    /// Read the whole subtree
    #[arg(long)]
    recursive: bool,

    /// List one row per replica
    #[arg(long)]
    replicas: bool,

    /// Print the access control list of the collection
    #[arg(long)]
    acl: bool,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn load_options(args: &Args, zone: &str) -> AnyhowResult<ConnectionOptions> {
    let mut options = match &args.config {
        Some(path) => ConnectionOptions::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConnectionOptions::new("rods", zone),
    };
    // The snapshot defines the zone; the environment file cannot point elsewhere.
    options.environment = Environment::UserDefined;
    if options.zone.is_empty() {
        options.zone = zone.to_string();
    }
    Ok(options)
}

async fn print_tree(tree: &mut CollectionTree, id: NodeId, recursive: bool) -> AnyhowResult<()> {
    let mut pending = vec![id];
    while let Some(current) = pending.pop() {
        print!("{}", tree.listing(current).await?);
        if recursive {
            let children = tree.collections(current).await?;
            pending.extend(children.into_iter().rev());
        }
    }
    Ok(())
}

async fn run(args: Args) -> AnyhowResult<()> {
    let contents = std::fs::read_to_string(&args.catalog)
        .with_context(|| format!("Failed to read catalog {}", args.catalog.display()))?;
    let snapshot: CatalogSnapshot =
        serde_json::from_str(&contents).context("Failed to parse catalog snapshot")?;
    let catalog = MemoryCatalog::from_snapshot(&snapshot)
        .map_err(|e| anyhow::anyhow!("Invalid catalog snapshot: {e}"))?;

    let options = load_options(&args, &snapshot.zone)?;
    let conn = Connection::connect(options, Arc::new(catalog)).await?;

    let mut tree = conn
        .collection(
            CollectionOptions::new(&args.path)
                .recursive(args.recursive)
                .fetch_replicas(args.replicas),
        )
        .await?;
    let root = tree.root_id();

    if args.offset.is_some() || args.limit.is_some() {
        let window = ReadWindow {
            offset: args.offset.unwrap_or(0),
            limit: args.limit,
        };
        let info = tree.read_page(root, window).await?;
        print!("{}", tree.listing(root).await?);
        println!("{info}");
    } else {
        print_tree(&mut tree, root, args.recursive).await?;
    }

    if args.acl {
        for entry in tree.acl(root).await? {
            println!("{entry}");
        }
    }

    tree.close(root).await?;
    conn.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let args = Args::parse();

    tracing_setup::init_global(args.log_file.as_deref(), tracing::Level::WARN);

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "rods-ls failed");
        return Err(e);
    }
    Ok(())
}
