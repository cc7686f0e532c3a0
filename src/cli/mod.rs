//! CLI implementation for cinder

mod signal;

pub(crate) use signal::{check_interrupted, setup_signal_handler};

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngExt;

use cinder::{
    Chunk, Config, EmbedOptions, EmbeddingCache, EmbeddingService, MonitorHandle, MonitorState,
};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(about = "Adaptive embedding compute plane for semantic code indexing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug info (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or verify) the shared embedding cache file
    Init {
        /// Backing file path (default from config)
        #[arg(long)]
        cache_file: Option<PathBuf>,
        /// Destroy and recreate an incompatible cache file
        #[arg(long)]
        force: bool,
    },
    /// Print cache statistics as JSON
    Stats {
        /// Backing file path (default from config)
        #[arg(long)]
        cache_file: Option<PathBuf>,
    },
    /// Embed synthetic chunks through the full plane and report throughput
    Bench {
        /// Number of chunks to embed
        #[arg(short = 'n', long, default_value = "2000")]
        count: usize,
        /// Worker pool size
        #[arg(long)]
        workers: Option<usize>,
        /// Embedding backend (hash, onnx)
        #[arg(long)]
        backend: Option<String>,
    },
    /// Worker-process entrypoint (spawned by the pool, not for direct use)
    #[command(hide = true)]
    Worker,
}

pub fn run_with(cli: Cli) -> Result<()> {
    let settings = Config::load(&std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
        .resolve();

    match cli.command {
        Commands::Worker => {
            let code = cinder::worker::run(std::io::stdin().lock(), std::io::stdout().lock());
            std::process::exit(code);
        }
        Commands::Init { cache_file, force } => cmd_init(settings, cache_file, force),
        Commands::Stats { cache_file } => cmd_stats(settings, cache_file),
        Commands::Bench {
            count,
            workers,
            backend,
        } => cmd_bench(settings, count, workers, backend),
    }
}

fn cmd_init(
    mut settings: cinder::Settings,
    cache_file: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if let Some(path) = cache_file {
        settings.cache_file_path = path;
    }

    let open = || {
        EmbeddingCache::open(
            &settings.cache_file_path,
            settings.cache_capacity,
            settings.embedding_dim,
        )
    };

    let cache = match open() {
        Ok(cache) => cache,
        Err(e) if force => {
            eprintln!("Recreating cache: {}", e);
            EmbeddingCache::wipe(&settings.cache_file_path)
                .context("Failed to remove old cache file")?;
            open().context("Failed to recreate cache")?
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context("Cache exists with an incompatible layout (use --force to recreate)"));
        }
    };

    println!(
        "Cache ready: {} ({} slots × {} dims, {} used)",
        settings.cache_file_path.display(),
        cache.capacity(),
        cache.dim(),
        cache.stats().slots_used,
    );
    Ok(())
}

fn cmd_stats(mut settings: cinder::Settings, cache_file: Option<PathBuf>) -> Result<()> {
    if let Some(path) = cache_file {
        settings.cache_file_path = path;
    }
    let cache = EmbeddingCache::open(
        &settings.cache_file_path,
        settings.cache_capacity,
        settings.embedding_dim,
    )
    .context("Failed to open cache")?;

    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
    Ok(())
}

fn cmd_bench(
    mut settings: cinder::Settings,
    count: usize,
    workers: Option<usize>,
    backend: Option<String>,
) -> Result<()> {
    if let Some(n) = workers {
        settings.worker_min = n.max(1);
        settings.worker_max = n.max(1);
    }
    if let Some(backend) = backend {
        settings.backend = backend;
    }

    setup_signal_handler();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        // The bench pins the monitor to Ok: it measures the plane, not the
        // host's current load.
        let (monitor, _monitor_tx) = MonitorHandle::fixed(MonitorState::Ok);
        let service = EmbeddingService::start_with_monitor(settings, monitor);

        // Salt the contents so repeated bench runs measure embedding, not
        // cache hits from the previous run.
        let salt: u32 = rand::rng().random();
        let chunks: Vec<Chunk> = (0..count)
            .map(|i| {
                Chunk::new(
                    format!("bench-{}", i),
                    format!("fn bench_{}_{:08x}() {{ let x = {}; }}", i, salt, i),
                )
            })
            .collect();

        let started = Instant::now();
        let results = service
            .embed(chunks, EmbedOptions { flush: true })
            .await;
        let elapsed = started.elapsed();

        if check_interrupted() {
            service.drain("interrupted").await;
            anyhow::bail!("interrupted");
        }

        let embedded = results.iter().filter(|r| r.embedding.is_some()).count();
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        let stats = service.stats().await;

        println!(
            "{}",
            serde_json::json!({
                "chunks": count,
                "embedded": embedded,
                "failed": failed,
                "elapsed_ms": elapsed.as_millis() as u64,
                "chunks_per_sec": (embedded as f64 / elapsed.as_secs_f64()).round(),
                "stats": stats,
            })
        );

        service.drain("bench complete").await;
        Ok(())
    })
}
