//! BinSight CLI
//!
//! Classifies waste images from disk with a single shared inference engine and prints
//! one JSON record per image.

use anyhow::{Context, Result};
use binsight_classifiers::InferenceEngine;
use binsight_core::InferenceOptions;
use clap::Parser;
use futures::stream::{self, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

mod config;
mod output;

use output::{PredictionRecord, Record};

#[derive(Parser, Debug)]
#[command(name = "binsight")]
#[command(about = "Classify waste images into recycling categories", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "binsight.yaml", env = "BINSIGHT_CONFIG")]
    config: PathBuf,

    /// Model artifact (overrides the configured model)
    #[arg(short, long, env = "BINSIGHT_MODEL")]
    model: Option<PathBuf>,

    /// Average predictions over five crops
    #[arg(short, long)]
    augment: bool,

    /// Minimum top-class probability; lower confidence reports Unknown/Mixed
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Number of classes to print
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Print the full distribution instead of the top classes
    #[arg(long)]
    full: bool,

    /// Images classified concurrently (defaults to the number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    metrics: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Image files to classify
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);
    let metrics_handle = init_metrics()?;

    let config = config::load(&cli.config, &cli)?;
    let options = config.defaults;

    info!("Initializing inference engine...");
    let engine = Arc::new(InferenceEngine::from_config(&config)?);
    match engine.model() {
        Some(model) => info!(
            architecture = model.architecture(),
            identity = model.identity(),
            "Engine ready"
        ),
        None => warn!("Engine running without a model; every image will report an error"),
    }

    let jobs = cli.jobs.unwrap_or_else(num_cpus::get).max(1);
    let full = cli.full;
    debug!(jobs, full, ?options, "Classifying {} images", cli.images.len());

    let mut records = stream::iter(cli.images.clone())
        .map(|path| classify_file(engine.clone(), path, options, full))
        .buffered(jobs);

    let mut failures = 0usize;
    while let Some(record) = records.next().await {
        if record.is_error() {
            failures += 1;
        }
        println!("{}", record.to_line());
    }

    let stats = engine.cache().stats();
    info!(
        images = cli.images.len(),
        failures,
        forward_passes = engine.forward_passes(),
        cache_hits = stats.hits,
        "Done"
    );

    if cli.metrics {
        eprintln!("{}", metrics_handle.render());
    }

    Ok(())
}

/// Decode and classify one file; failures become error records
async fn classify_file(
    engine: Arc<InferenceEngine>,
    path: PathBuf,
    options: InferenceOptions,
    full: bool,
) -> Record {
    let display_path = path.display().to_string();

    let image = match decode(path).await {
        Ok(image) => image,
        Err(e) => {
            warn!(path = %display_path, error = %e, "Failed to decode image");
            metrics::counter!("binsight_cli_errors_total", "kind" => "decode").increment(1);
            return Record::error(display_path, format!("{:#}", e));
        }
    };
    let (width, height) = image.dimensions();

    let start = Instant::now();
    let result = if full {
        engine.classify_async(Some(image), options).await
    } else {
        engine.top_labels_async(Some(image), options).await
    };
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(predictions) => Record::Prediction(PredictionRecord {
            path: display_path,
            predictions,
            inference_time_s: elapsed,
            width,
            height,
        }),
        Err(e) => {
            warn!(path = %display_path, error = %e, "Classification failed");
            metrics::counter!("binsight_cli_errors_total", "kind" => "inference").increment(1);
            Record::error(display_path, e)
        }
    }
}

/// Decode an image file to RGB8 on the blocking pool
async fn decode(path: PathBuf) -> Result<image::RgbImage> {
    tokio::task::spawn_blocking(move || {
        image::open(&path)
            .map(|img| img.to_rgb8())
            .with_context(|| format!("Failed to read image {}", path.display()))
    })
    .await
    .context("Image decoding task failed")?
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("binsight=debug,binsight_classifiers=debug,binsight_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("binsight=info,binsight_classifiers=info"))
    };

    // Logs go to stderr; stdout carries the JSON records
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize metrics recorder and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "binsight_inference_total",
        "Total number of classification calls by outcome"
    );
    metrics::describe_counter!("binsight_cache_hits_total", "Prediction cache hits");
    metrics::describe_counter!("binsight_cache_misses_total", "Prediction cache misses");
    metrics::describe_counter!(
        "binsight_cache_evictions_total",
        "Predictions evicted from a full cache"
    );
    metrics::describe_histogram!(
        "binsight_forward_latency_us",
        metrics::Unit::Microseconds,
        "Model forward pass latency in microseconds"
    );
    metrics::describe_counter!("binsight_cli_errors_total", "Images that produced an error record");

    Ok(handle)
}
