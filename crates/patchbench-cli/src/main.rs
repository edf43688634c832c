//! Patchbench CLI
//!
//! The `patchbench` command evaluates data-point patches in layered,
//! sandboxed environments.
//!
//! ## Commands
//!
//! - `validate`: evaluate data points and print a run summary
//! - `predictions`: write a predictions JSONL file for data points
//! - `cache list` / `cache evict`: inspect and trim the layer cache

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use patchbench_core::cache::{CachePolicy, LayerCache};
use patchbench_core::config::PatchbenchConfig;
use patchbench_core::dataset::{DataPointLoader, PredictionFormatter, DEFAULT_DATA_POINTS_DIR, DEFAULT_MODEL_NAME};
use patchbench_core::telemetry::init_tracing;
use patchbench_core::{Orchestrator, RunSummary, Verdict, METRICS};

#[derive(Parser)]
#[command(name = "patchbench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate patches against repository test suites in layered sandboxes", long_about = None)]
struct Cli {
    /// Config file (default: patchbench.toml when present)
    #[arg(short, long, global = true, env = "PATCHBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate data points and print a summary
    ///
    /// Exits 0 only when every data point passes.
    Validate {
        /// Directory with data point JSON files
        #[arg(long, default_value = DEFAULT_DATA_POINTS_DIR)]
        data_points_dir: PathBuf,

        /// Data point file names (without .json); all files when omitted
        #[arg(long, num_args = 1..)]
        instance_ids: Option<Vec<String>>,

        /// Evaluate the golden patch even when a candidate is present
        #[arg(long)]
        golden: bool,

        /// Test command timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Concurrent evaluations
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Run id used for the log directory (default: timestamp + random suffix)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Write data points as a predictions JSONL file
    Predictions {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Value of `model_name_or_path`
        #[arg(long, default_value = DEFAULT_MODEL_NAME)]
        model_name: String,

        /// Directory with data point JSON files
        #[arg(long, default_value = DEFAULT_DATA_POINTS_DIR)]
        data_points_dir: PathBuf,

        /// Data point file names (without .json); all files when omitted
        #[arg(long, num_args = 1..)]
        instance_ids: Option<Vec<String>>,
    },

    /// Inspect or trim the layer cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List stored layers, in-flight builds and remembered failures
    List,
    /// Apply the configured eviction policy
    Evict,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = PatchbenchConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    let code = match cli.command {
        Commands::Validate {
            data_points_dir,
            instance_ids,
            golden,
            timeout,
            jobs,
            run_id,
        } => {
            let mut config = config;
            config.run.golden |= golden;
            if let Some(timeout) = timeout {
                config.run.timeout_secs = timeout;
            }
            if let Some(jobs) = jobs {
                config.run.jobs = jobs.max(1);
            }
            cmd_validate(config, &data_points_dir, instance_ids.as_deref(), run_id, cli.json).await?
        }
        Commands::Predictions {
            out,
            model_name,
            data_points_dir,
            instance_ids,
        } => {
            cmd_predictions(&out, &model_name, &data_points_dir, instance_ids.as_deref())?;
            0
        }
        Commands::Cache { action } => {
            match action {
                CacheAction::List => cmd_cache_list(&config, cli.json)?,
                CacheAction::Evict => cmd_cache_evict(&config).await?,
            }
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn open_cache(config: &PatchbenchConfig) -> Result<Arc<LayerCache>> {
    LayerCache::open(&config.cache.root, CachePolicy::from(&config.cache))
        .with_context(|| format!("Failed to open layer cache at {:?}", config.cache.root))
}

fn default_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

async fn cmd_validate(
    config: PatchbenchConfig,
    data_points_dir: &Path,
    instance_ids: Option<&[String]>,
    run_id: Option<String>,
    json: bool,
) -> Result<i32> {
    let data_points = DataPointLoader::new().load_by_files(data_points_dir, instance_ids);
    if data_points.is_empty() {
        println!("No data points to validate in {}", data_points_dir.display());
        return Ok(1);
    }

    let cache = open_cache(&config)?;
    let run_id = run_id.unwrap_or_else(default_run_id);
    let orchestrator = Orchestrator::new(&config, Arc::clone(&cache), run_id.clone());
    info!(
        "Validating {} data point(s) as run {} with {} job(s)",
        data_points.len(),
        run_id,
        config.run.jobs
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling in-flight evaluations");
                cancel.cancel();
                cache.shutdown();
            }
        });
    }

    let verdicts: Vec<Verdict> = stream::iter(data_points.iter())
        .map(|dp| orchestrator.evaluate(dp, &cancel))
        .buffered(config.run.jobs)
        .collect()
        .await;

    match cache.evict().await {
        Ok(evicted) if !evicted.is_empty() => info!("Evicted {} layer(s)", evicted.len()),
        Ok(_) => {}
        Err(e) => warn!("Cache eviction failed: {}", e),
    }
    METRICS.flush();

    let summary = RunSummary::from_verdicts(&verdicts);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(summary.exit_code())
}

fn cmd_predictions(
    out: &Path,
    model_name: &str,
    data_points_dir: &Path,
    instance_ids: Option<&[String]>,
) -> Result<()> {
    let data_points = DataPointLoader::new().load_by_files(data_points_dir, instance_ids);
    let formatter = PredictionFormatter::new(model_name);
    let predictions = formatter.convert(&data_points);
    formatter
        .write_jsonl(&predictions, out)
        .with_context(|| format!("Failed to write predictions to {:?}", out))?;
    println!("Wrote {} prediction(s) to {}", predictions.len(), out.display());
    Ok(())
}

fn cmd_cache_list(config: &PatchbenchConfig, json: bool) -> Result<()> {
    let cache = open_cache(config)?;
    let layers = cache.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&layers)?);
        return Ok(());
    }
    if layers.is_empty() {
        println!("Cache at {} is empty", cache.root().display());
        return Ok(());
    }
    for layer in &layers {
        let parent = layer
            .parent
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<8} parent={:<28} built={} {}",
            layer.key.to_string(),
            format!("{:?}", layer.status),
            parent,
            layer.built_at.format("%Y-%m-%d %H:%M:%S"),
            layer.path.display()
        );
    }
    Ok(())
}

async fn cmd_cache_evict(config: &PatchbenchConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let evicted = cache.evict().await.context("Cache eviction failed")?;
    for key in &evicted {
        println!("evicted {key}");
    }
    println!("{} layer(s) evicted, {} remaining", evicted.len(), cache.len());
    Ok(())
}
