//! CLI for the vectorlake engine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vectorlake::engine::EngineMeta;
use vectorlake::record::parse_vector;
use vectorlake::storage::open_store;
use vectorlake::{DistanceMetric, Engine, EngineConfig, StorageBackend, StorageConfig};

#[derive(Parser)]
#[command(name = "vectorlake")]
#[command(about = "Vector search over immutable files in a storage directory", long_about = None)]
struct Cli {
    /// Storage directory holding data, index and metadata files
    #[arg(long, default_value = "./vectorlake-data")]
    data_dir: PathBuf,

    /// Vector dimension. Read from the directory when omitted.
    #[arg(long)]
    dim: Option<usize>,

    /// Distance metric: l2, dot or cosine
    #[arg(long)]
    metric: Option<DistanceMetric>,

    /// JSON config file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: local, fs, memory or s3. S3 settings come from the
    /// config file's `storage` section.
    #[arg(long)]
    storage: Option<StorageBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert or replace a vector
    Insert {
        /// Vector ID
        id: u64,
        /// Vector data as comma-separated values (e.g., "1.0,2.0,3.0")
        #[arg(short, long)]
        vector: String,
        /// Optional payload stored with the vector
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Search for similar vectors
    Search {
        /// Query vector as comma-separated values (e.g., "1.0,2.0,3.0")
        query: String,
        /// Number of results to return
        #[arg(short, long, default_value = "10")]
        k: u32,
        /// Candidate list size for graph search
        #[arg(long)]
        ef: Option<u32>,
    },
    /// Print a stored vector
    Get { id: u64 },
    /// Delete a vector
    Delete { id: u64 },
    /// Write buffered operations to storage
    Flush,
    /// Merge small files now
    Compact,
    /// Show version and storage statistics
    Info,
    /// Start the HTTP API server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: String,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(backend) = cli.storage {
        config.storage.backend = backend;
    }

    let stored = if cli.dim.is_none() || cli.metric.is_none() {
        stored_meta(&cli.data_dir, &config.storage)?
    } else {
        None
    };
    if let Some(dim) = cli.dim {
        config.dimension = dim;
    } else if let Some(meta) = &stored {
        config.dimension = meta.dimension;
    }
    if let Some(metric) = cli.metric {
        config.metric = metric;
    } else if let Some(meta) = &stored {
        config.metric = meta.metric;
    }
    if config.dimension == 0 {
        anyhow::bail!(
            "{} is not initialized; pass --dim (and --metric) to create it",
            cli.data_dir.display()
        );
    }
    Ok(config)
}

fn stored_meta(data_dir: &Path, storage: &StorageConfig) -> Result<Option<EngineMeta>> {
    let local = matches!(storage.backend, StorageBackend::Local | StorageBackend::Fs);
    if local && !data_dir.exists() {
        return Ok(None);
    }
    let store = open_store(storage, data_dir)?;
    Ok(EngineMeta::read(store.as_ref())?)
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Insert {
            id,
            vector,
            payload,
        } => {
            let v = parse_vector(&vector)?;
            engine.insert_with_payload(id, v, payload.map(String::into_bytes).unwrap_or_default())?;
            println!("Inserted vector with ID: {}", id);
        }
        Commands::Search { query, k, ef } => {
            let q = parse_vector(&query)?;
            let results = engine.search(&q, k, ef)?;

            if results.is_empty() {
                println!("No results found (store is empty)");
            } else {
                println!("Top {} results:", results.len());
                let label = if engine.metric().higher_is_better() {
                    "similarity"
                } else {
                    "distance"
                };
                for (i, hit) in results.iter().enumerate() {
                    println!("{}. {} ({}: {:.4})", i + 1, hit.id, label, hit.score);
                }
            }
        }
        Commands::Get { id } => match engine.get(id)? {
            Some(record) => {
                println!("{}: {:?}", record.id, record.vector);
                if !record.payload.is_empty() {
                    println!("payload: {}", String::from_utf8_lossy(&record.payload));
                }
            }
            None => println!("No vector with ID: {}", id),
        },
        Commands::Delete { id } => {
            engine.delete(id)?;
            println!("Deleted vector with ID: {}", id);
        }
        Commands::Flush => {
            engine.flush()?;
            println!("Flushed; current version {}", engine.current_version().version_id);
        }
        Commands::Compact => {
            let report = engine.compact()?;
            match report.version_id {
                Some(version) => println!(
                    "Merged {} files into {} ({} rows); version {}",
                    report.input_files, report.output_files, report.rows, version
                ),
                None => println!("Nothing to compact"),
            }
        }
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        Commands::Serve { .. } => unreachable!("serve handled separately"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // Storage backends block on their own runtime; keep them off this one.
    let (cli, engine) = tokio::task::spawn_blocking(move || -> Result<_> {
        let config = load_config(&cli)?;
        let engine = Engine::open_local(&cli.data_dir, config)
            .with_context(|| format!("cannot open {}", cli.data_dir.display()))?;
        Ok((cli, engine))
    })
    .await??;

    if let Commands::Serve { addr } = &cli.command {
        return vectorlake::server::start(addr, Arc::new(engine)).await;
    }

    tokio::task::spawn_blocking(move || {
        let result = run(&engine, cli.command);
        engine.shutdown()?;
        result
    })
    .await?
}
