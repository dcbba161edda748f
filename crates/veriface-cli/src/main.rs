mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use veriface_core::detector::ScrfdDetector;
use veriface_core::enroll::scan_identities;
use veriface_core::live::{DirectoryFrameSink, DirectoryFrameSource};
use veriface_core::recognizer::ArcFaceRecognizer;
use veriface_core::{
    evaluate, Dataset, EnrollmentPipeline, EuclideanMatcher, FeatureExtractor, LiveConfig,
    LiveRecognizer, Matcher, OnnxExtractor, StoreError,
};

#[derive(Parser)]
#[command(name = "veriface", about = "Face embedding verification CLI")]
struct Cli {
    /// TOML configuration file (overrides VERIFACE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the embedding store from the known-faces directory
    Enroll {
        /// Enrollment root; one subdirectory of images per identity
        #[arg(long)]
        faces_dir: Option<PathBuf>,
    },
    /// Classify one image against the enrolled identities
    Identify {
        image: PathBuf,
        /// Override the configured match threshold
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Run genuine/imposter trials over a labeled dataset
    Evaluate {
        /// Dataset root; one subdirectory of images per identity
        dataset: PathBuf,
        /// Seed for reproducible trial sampling
        #[arg(long)]
        seed: Option<u64>,
        /// Output directory for the JSON results
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Recognize faces in a directory of frames, writing annotated copies
    Live {
        #[arg(long)]
        frames: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Show store contents and backups
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { faces_dir } => enroll(&config, faces_dir),
        Commands::Identify { image, threshold } => identify(&config, &image, threshold),
        Commands::Evaluate {
            dataset,
            seed,
            output,
        } => run_evaluation(&config, &dataset, seed, output),
        Commands::Live { frames, output } => live(config, frames, output).await,
        Commands::Status => status(&config),
    }
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let path = config.scrfd_model_path();
    ScrfdDetector::load(&path, config.detector_confidence)
        .with_context(|| format!("loading detector from {}", path.display()))
}

fn load_extractor(config: &Config) -> Result<OnnxExtractor> {
    let path = config.arcface_model_path();
    let recognizer = ArcFaceRecognizer::load(&path)
        .with_context(|| format!("loading recognizer from {}", path.display()))?;
    Ok(OnnxExtractor::new(load_detector(config)?, recognizer))
}

fn enroll(config: &Config, faces_dir: Option<PathBuf>) -> Result<()> {
    let faces_dir = faces_dir.unwrap_or_else(|| config.faces_dir.clone());
    let identities = scan_identities(&faces_dir)?;
    let mut extractor = load_extractor(config)?;
    let store = config.store();

    println!(
        "Enrolling {} identities from {}",
        identities.len(),
        faces_dir.display()
    );
    let report = EnrollmentPipeline::new(&mut extractor, &store)
        .enroll(&identities)
        .context("enrollment failed")?;

    for identity in &report.identities {
        println!(
            "  {}: {}/{} images embedded",
            identity.label, identity.embeddings, identity.images
        );
        for skipped in &identity.skipped {
            println!("    skipped {}: {}", skipped.path.display(), skipped.reason);
        }
    }
    println!(
        "Wrote {} embeddings to {}",
        report.embeddings_written,
        store.path().display()
    );
    if let Some(backup) = &report.backup {
        println!("Previous store backed up to {}", backup.display());
    }
    Ok(())
}

fn identify(config: &Config, image_path: &Path, threshold: Option<f32>) -> Result<()> {
    let state = config.store().load_or_empty()?;
    let image = image::open(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?
        .to_rgb8();
    let mut extractor = load_extractor(config)?;

    let Some(embedding) = extractor.extract(&image)? else {
        println!("No face detected in {}", image_path.display());
        return Ok(());
    };

    let threshold = threshold.unwrap_or(config.match_threshold);
    let result = EuclideanMatcher.compare(&embedding, &state, threshold);
    println!("{} (distance {:.4})", result.label, result.distance);
    Ok(())
}

fn run_evaluation(
    config: &Config,
    dataset_dir: &Path,
    seed: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut extractor = load_extractor(config)?;
    let dataset = Dataset::extract_from_dir(dataset_dir, &mut extractor, config.min_images)?;

    let mut rng = match seed.or(config.seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let report = evaluate(&dataset, &config.trial_config(), config.match_threshold, &mut rng)?;

    let output = output.unwrap_or_else(|| config.results_dir.clone());
    std::fs::create_dir_all(&output)
        .with_context(|| format!("creating {}", output.display()))?;
    write_json(&output.join("roc_curve.json"), &report.roc)?;
    write_json(&output.join("score_distribution.json"), &report.distribution)?;
    write_json(&output.join("evaluation_report.json"), &report)?;

    println!(
        "{} genuine / {} imposter scores over {} trials",
        report.genuine_count,
        report.imposter_count,
        report.trials.len()
    );
    if report.dropped_scores > 0 {
        println!("{} non-finite scores excluded", report.dropped_scores);
    }
    println!("AUC: {:.4}", report.roc.auc);
    if let Some(eer) = report.equal_error_rate {
        println!("EER: {:.4} at distance {:.4}", eer.rate, eer.threshold);
    }
    println!(
        "At threshold {:.2}: TPR {:.4}, FPR {:.4}",
        report.match_threshold.threshold, report.match_threshold.tpr, report.match_threshold.fpr
    );
    println!("Results written to {}", output.display());
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

async fn live(config: Config, frames: PathBuf, output: PathBuf) -> Result<()> {
    let state = config.store().load_or_empty()?;
    if state.is_empty() {
        tracing::warn!("store is empty; every face will be reported unknown");
    }
    let mut detector = load_detector(&config)?;
    let mut extractor = load_extractor(&config)?;
    let mut source = DirectoryFrameSource::open(&frames)?;
    let mut sink = DirectoryFrameSink::create(&output)?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            signal_stop.store(true, Ordering::Relaxed);
        }
    });

    let live_config = LiveConfig {
        threshold: config.match_threshold,
        process_every: config.process_every_n_frames,
    };
    let summary = tokio::task::spawn_blocking(move || {
        LiveRecognizer::new(&mut detector, &mut extractor, &state, live_config).run(
            &mut source,
            &mut sink,
            &stop,
        )
    })
    .await
    .context("recognition loop panicked")?;

    println!(
        "{} frames ({} processed): {} matched, {} unknown, {} errors",
        summary.frames, summary.processed, summary.matched, summary.unknown, summary.frame_errors
    );
    println!("Annotated frames written to {}", output.display());
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = config.store();
    println!("store: {}", store.path().display());

    match store.load() {
        Ok(state) if state.is_empty() => println!("  no identities enrolled"),
        Ok(state) => {
            let counts = state.label_counts();
            println!(
                "  {} embeddings, {} identities, dimension {}",
                state.len(),
                counts.len(),
                state.dimension().unwrap_or(0)
            );
            for (label, count) in &counts {
                println!("    {label}: {count}");
            }
        }
        Err(err @ StoreError::Corrupt { .. }) => println!("  unreadable: {err}"),
        Err(err) => return Err(err.into()),
    }

    let backups = store.backups()?;
    println!(
        "backups: {} in {}",
        backups.len(),
        store.backup_dir().display()
    );
    if let Some(latest) = backups.last() {
        println!("  latest: {}", latest.display());
    }
    println!("models: {}", config.model_dir.display());
    Ok(())
}
