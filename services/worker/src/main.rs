//! Sentinel-2 compositing worker.
//!
//! Registers scenes from the public L1C bucket, ingests them into tiled
//! layers and builds cloud-free composites with their tile pyramids.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sentinel_common::Geometry;
use storage::{NewComposite, Task, TaskSource, TileStore};
use worker::{TaskRunner, WorkerConfig, WorkerContext, WorkerPool};

/// How long an in-process queue stays empty before a one-shot command exits.
const DRAIN_IDLE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "sentinel-worker")]
#[command(about = "Sentinel-2 scene ingestion and cloud-free compositing")]
struct Args {
    /// Configuration file path (environment variables are used when unset)
    #[arg(short, long, env = "WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register new scenes of one UTM zone
    Sync { zone: String },
    /// Register new scenes of all 60 UTM zones
    Drive,
    /// Register the scenes referenced by a new-product notification file
    Notify { message: PathBuf },
    /// Ingest one scene
    Ingest { scene_id: i64 },
    /// Build one composite tile and its pyramid
    CompositeTile { composite_tile_id: i64 },
    /// Take the next step of a composite build
    Advance {
        build_id: i64,
        /// Select scenes and tiles from the region of interest again
        #[arg(long)]
        initiate: bool,
        /// Build finished and failed tiles again
        #[arg(long)]
        rebuild: bool,
    },
    /// Create a composite over a date window
    CreateComposite {
        name: String,
        min_date: NaiveDate,
        max_date: NaiveDate,
        #[arg(long, default_value_t = 100.0)]
        max_cloudiness: f64,
        /// Restrict the composite to these scenes
        #[arg(long, value_delimiter = ',')]
        scene_ids: Option<Vec<i64>>,
    },
    /// Create a build of a composite over a GeoJSON region of interest
    CreateBuild {
        composite_id: i64,
        aoi: PathBuf,
        /// Scorer name, e.g. `rules:v7` or a loaded classifier
        #[arg(long)]
        scorer: Option<String>,
    },
    /// Delete a composite with its tiles
    DeleteComposite { composite_id: i64 },
    /// Delete a scene with its tiles
    DeleteScene { scene_id: i64 },
    /// Run the worker pool until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => WorkerConfig::from_yaml(path)?,
        None => WorkerConfig::from_env()?,
    };

    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(addr = %addr, "Prometheus metrics exporter listening");
    }

    let (ctx, mut source) = WorkerContext::connect(config).await?;
    let ctx = Arc::new(ctx);
    let runner = TaskRunner::new(ctx.clone());
    let pool = WorkerPool::new(runner.clone(), ctx.config.concurrency);

    match args.command {
        Command::Serve => {
            info!(concurrency = ctx.config.concurrency, "Starting worker");
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                shutdown_tx.send(()).ok();
            });
            pool.run(source.as_mut(), shutdown_rx).await?;
            return Ok(());
        }
        Command::Sync { zone } => runner.run(&Task::Sync { zone }).await?,
        Command::Drive => runner.run(&Task::Drive).await?,
        Command::Notify { message } => {
            let content = tokio::fs::read_to_string(&message)
                .await
                .with_context(|| format!("Failed to read {}", message.display()))?;
            let ids = ctx.registry.process_new_product_message(&content).await?;
            info!(registered = ids.len(), "Processed new-product notification");
        }
        Command::Ingest { scene_id } => {
            runner
                .run(&Task::Ingest {
                    scene_id,
                    build_id: None,
                })
                .await?
        }
        Command::CompositeTile { composite_tile_id } => {
            runner
                .run(&Task::BuildCompositeTile {
                    composite_tile_id,
                    build_id: None,
                })
                .await?
        }
        Command::Advance {
            build_id,
            initiate,
            rebuild,
        } => {
            let advance = ctx.controller.advance(build_id, initiate, rebuild).await?;
            info!(
                build = build_id,
                status = advance.status.as_str(),
                submitted = advance.submitted,
                "Advanced build"
            );
        }
        Command::CreateComposite {
            name,
            min_date,
            max_date,
            max_cloudiness,
            scene_ids,
        } => {
            let composite = ctx
                .catalog
                .create_composite(&NewComposite {
                    name,
                    min_date,
                    max_date,
                    max_cloudiness,
                    scene_ids,
                })
                .await?;
            info!(composite = composite.id, "Created composite");
            println!("{}", composite.id);
        }
        Command::CreateBuild {
            composite_id,
            aoi,
            scorer,
        } => {
            let content = tokio::fs::read_to_string(&aoi)
                .await
                .with_context(|| format!("Failed to read {}", aoi.display()))?;
            let geometry = Geometry::from_geojson_str(&content)?;
            let build = ctx
                .catalog
                .create_build(composite_id, &geometry, scorer.as_deref())
                .await?;
            info!(build = build.id, composite = composite_id, "Created build");
            println!("{}", build.id);
        }
        Command::DeleteComposite { composite_id } => {
            let layers = ctx.catalog.delete_composite(composite_id).await?;
            delete_layers(&ctx, &layers).await?;
        }
        Command::DeleteScene { scene_id } => {
            let layers = ctx.catalog.delete_scene(scene_id).await?;
            delete_layers(&ctx, &layers).await?;
        }
    }

    if ctx.is_in_process() {
        drain(&pool, source.as_mut()).await?;
    }
    Ok(())
}

/// Run the tasks a one-shot command submitted to the in-process queue.
async fn drain(pool: &WorkerPool, source: &mut dyn TaskSource) -> Result<()> {
    let stats = pool.drain(source, DRAIN_IDLE).await?;
    if stats.failed > 0 || stats.panicked > 0 || stats.queue_errors > 0 || stats.ack_errors > 0 {
        warn!(?stats, "Some follow-up tasks failed");
    } else if stats.succeeded > 0 {
        info!(?stats, "Follow-up tasks complete");
    }
    Ok(())
}

async fn delete_layers(ctx: &WorkerContext, layers: &[i64]) -> Result<()> {
    let mut removed = 0;
    for layer in layers {
        removed += ctx.tiles.delete_layer(*layer).await?;
    }
    info!(layers = layers.len(), tiles = removed, "Deleted tiles");
    Ok(())
}
