use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use face_engine::embedder::{Embedder, Frame, MockEmbedder, MockEmbedderConfig};
use face_engine::grouping::{GroupInput, GroupingMethod};
use face_engine::state::group_inputs;
use face_engine::{EngineConfig, FaceEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "facegroup", version = common::VERSION)]
#[command(about = "Incremental face clustering and recognition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group a JSON array of {id, embedding} records and print the groups
    Group {
        #[arg(short, long)]
        input: PathBuf,

        /// hierarchical or dbscan
        #[arg(short, long, default_value = "hierarchical")]
        method: GroupingMethod,

        /// Minimum similarity to share a group (DBSCAN uses 1 - threshold as eps)
        #[arg(short, long, env = "FACE_CLUSTERING_THRESHOLD")]
        threshold: Option<f32>,

        #[arg(long, env = "FACE_DBSCAN_MIN_POINTS")]
        min_points: Option<usize>,
    },
    /// Print the effective configuration
    Config,
    /// Stream mock frames through one camera session
    Demo {
        #[arg(long, default_value = "demo-cam")]
        camera: String,

        #[arg(long, default_value_t = 30)]
        frames: u64,

        #[arg(long, default_value_t = 3)]
        people: usize,

        /// Also print the Prometheus exposition gathered during the run
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = telemetry::init_with_service("facegroup");

    match cli.command {
        Commands::Group {
            input,
            method,
            threshold,
            min_points,
        } => {
            let mut config = EngineConfig::from_env()?;
            if let Some(t) = threshold {
                config.clustering_threshold = t;
            }
            if let Some(m) = min_points {
                config.dbscan_min_points = m;
            }
            config.validate()?;

            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let inputs: Vec<GroupInput> =
                serde_json::from_str(&raw).context("input must be a JSON array of {id, embedding}")?;

            let groups = group_inputs(&inputs, method, &config)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Commands::Config => {
            let config = EngineConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Demo {
            camera,
            frames,
            people,
            metrics,
        } => run_demo(&camera, frames, people, metrics).await?,
    }

    Ok(())
}

async fn run_demo(camera: &str, frames: u64, people: usize, metrics: bool) -> Result<()> {
    let embedder = MockEmbedder::new(MockEmbedderConfig {
        people,
        ..Default::default()
    });
    let config = EngineConfig {
        embedding_dim: embedder.embedding_dim(),
        ..EngineConfig::from_env()?
    };
    let engine = FaceEngine::in_memory(config)?;
    let session = engine.start_session(camera).await?;

    let (tx, rx) = mpsc::channel(16);
    let handle = session.spawn(Arc::new(embedder), rx);
    for sequence in 0..frames {
        let mut frame = Frame::new(camera, sequence);
        // spread frames a minute apart so cooldowns expire during the run
        frame.timestamp += chrono::Duration::minutes(sequence as i64);
        if tx.send(frame).await.is_err() {
            break;
        }
    }
    drop(tx);

    let stats = handle.await.context("session task panicked")?;
    session.stop().await;
    let merged = engine.merge_similar_clusters().await?;

    info!(
        frames = stats.frames,
        processed = stats.processed,
        cached = stats.cached,
        merged = merged.merged_count(),
        "demo complete"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{}", serde_json::to_string_pretty(&engine.cluster_stats().await?)?);
    if metrics {
        print!("{}", render_metrics()?);
    }
    Ok(())
}

fn render_metrics() -> Result<String> {
    telemetry::metrics::encode_metrics().context("failed to encode metrics")
}
