//! azkeep CLI - Command line access to table and blob storage.
//!
//! Credentials come from AZURE_STORAGE_ACCOUNT / AZURE_STORAGE_ACCESS_KEY,
//! falling back to the deployment config given with `--config`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use azkeep_common::Entity;
use azkeep_storage::{
    create_default_registry, CredentialSource, DeploymentConfig, Query, StorageFacade,
};

#[derive(Parser)]
#[command(name = "azkeep")]
#[command(about = "azkeep - Table and blob storage access")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Deployment config file ({"azurestorage": {"account", "key"}}).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend: "azure" or "memory".
    #[arg(short, long, global = true, default_value = "azure")]
    backend: String,

    /// Backend settings as JSON (e.g. {"table_endpoint": "..."}).
    #[arg(long, global = true)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query entities from a table.
    Query {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// OData filter expression.
        #[arg(short, long)]
        filter: Option<String>,

        /// Comma-separated properties to return.
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        /// Maximum number of entities.
        #[arg(long)]
        top: Option<u32>,
    },

    /// Insert a new entity.
    Insert {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Entity JSON with PartitionKey and RowKey.
        #[arg(short, long)]
        entity: String,
    },

    /// Insert or merge an entity.
    Upsert {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Entity JSON with PartitionKey and RowKey.
        #[arg(short, long)]
        entity: String,
    },

    /// Delete an entity by its keys.
    Delete {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Entity JSON with PartitionKey and RowKey.
        #[arg(short, long)]
        entity: String,
    },

    /// Upload a file as a blob.
    Upload {
        /// Container name.
        #[arg(long)]
        container: String,

        /// Blob name (default: file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Source file.
        #[arg(long)]
        file: PathBuf,
    },

    /// Download a blob.
    Download {
        /// Container name.
        #[arg(long)]
        container: String,

        /// Blob name.
        #[arg(short, long)]
        name: String,

        /// Destination file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Read anonymously, as a public client would.
        #[arg(long)]
        public: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let facade = open_facade(&cli)?;

    match cli.command {
        Commands::Query {
            table,
            filter,
            select,
            top,
        } => cmd_query(&facade, &table, filter, select, top).await,

        Commands::Insert { table, entity } => cmd_insert(&facade, &table, &entity).await,

        Commands::Upsert { table, entity } => cmd_upsert(&facade, &table, &entity).await,

        Commands::Delete { table, entity } => cmd_delete(&facade, &table, &entity).await,

        Commands::Upload {
            container,
            name,
            file,
        } => cmd_upload(&facade, &container, name, &file).await,

        Commands::Download {
            container,
            name,
            output,
            public,
        } => cmd_download(&facade, &container, &name, output.as_deref(), public).await,
    }
}

/// Build the facade for the selected backend.
fn open_facade(cli: &Cli) -> Result<StorageFacade> {
    let deployment = match &cli.config {
        Some(path) => DeploymentConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DeploymentConfig::default(),
    };
    let source = CredentialSource::from_process(deployment);

    let settings = match &cli.settings {
        Some(json) => serde_json::from_str(json).context("Invalid --settings JSON")?,
        None => serde_json::Value::Null,
    };

    let registry = create_default_registry()?;
    registry
        .resolve(&cli.backend, source, settings)
        .with_context(|| format!("Failed to open {} backend", cli.backend))
}

fn parse_entity(json: &str) -> Result<Entity> {
    let value: serde_json::Value = serde_json::from_str(json).context("Entity is not valid JSON")?;
    let Some(map) = value.as_object() else {
        bail!("Entity must be a JSON object");
    };
    Ok(Entity::from_json(map)?)
}

/// Query entities and print one JSON object per line.
async fn cmd_query(
    facade: &StorageFacade,
    table: &str,
    filter: Option<String>,
    select: Vec<String>,
    top: Option<u32>,
) -> Result<()> {
    let mut query = match filter {
        Some(expr) => Query::filter(expr),
        None => Query::all(),
    };
    if !select.is_empty() {
        query = query.select(select);
    }
    if let Some(n) = top {
        query = query.top(n);
    }

    let page = facade
        .get_table_page(table, &query)
        .await
        .context("Failed to query table")?;

    for entity in &page.entities {
        println!("{}", serde_json::to_string(entity)?);
    }
    if page.continuation.is_some() {
        info!("More results available; narrow the query or raise --top");
    }

    Ok(())
}

async fn cmd_insert(facade: &StorageFacade, table: &str, entity: &str) -> Result<()> {
    let entity = parse_entity(entity)?;
    let status = facade
        .insert_entity(table, &entity)
        .await
        .context("Failed to insert entity")?;

    println!("Inserted ({}, {}): {}", entity.partition_key(), entity.row_key(), status);
    Ok(())
}

async fn cmd_upsert(facade: &StorageFacade, table: &str, entity: &str) -> Result<()> {
    let entity = parse_entity(entity)?;
    let status = facade
        .update_entity(table, &entity)
        .await
        .context("Failed to upsert entity")?;

    println!("Upserted ({}, {}): {}", entity.partition_key(), entity.row_key(), status);
    Ok(())
}

async fn cmd_delete(facade: &StorageFacade, table: &str, entity: &str) -> Result<()> {
    let entity = parse_entity(entity)?;
    facade
        .delete_entity(table, &entity)
        .await
        .context("Failed to delete entity")?;

    println!("Deleted ({}, {})", entity.partition_key(), entity.row_key());
    Ok(())
}

async fn cmd_upload(
    facade: &StorageFacade,
    container: &str,
    name: Option<String>,
    file: &Path,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Cannot derive blob name from file; pass --name")?,
    };

    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = content.len();

    let status = facade
        .upload_blob(container, &name, content)
        .await
        .context("Failed to upload blob")?;

    println!("Uploaded {}/{} ({} bytes): {}", container, name, size, status);
    Ok(())
}

async fn cmd_download(
    facade: &StorageFacade,
    container: &str,
    name: &str,
    output: Option<&Path>,
    public: bool,
) -> Result<()> {
    let content = if public {
        facade.download_public_blob(container, name).await
    } else {
        facade.download_blob(container, name).await
    }
    .context("Failed to download blob")?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} bytes to {}", content.len(), path.display());
        }
        None => std::io::stdout()
            .write_all(&content)
            .context("Failed to write to stdout")?,
    }

    Ok(())
}
