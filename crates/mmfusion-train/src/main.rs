//! CLI entry point for the multimodal fusion pipeline.
//!
//! Subcommands:
//!   train            -- Fuse two pretrained classifiers and train the joint head
//!   retrain          -- Freeze an existing fused model and train a fresh head
//!   predict          -- Class probabilities for one image/audio pair
//!   init-classifier  -- Write a randomly initialized single-modality classifier

use clap::{Parser, Subcommand};
use mmfusion_core::{load_config, Result, NUM_CLASSES};
use mmfusion_model::select_device;
use mmfusion_train::{init_classifier, pipeline, run_retraining, run_training, TrainOutcome};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train-fusion", about = "Multimodal image + audio fusion pipeline")]
struct Cli {
    /// Run on the CPU even when an accelerator is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fuse the image and audio classifiers and train the joint head.
    Train {
        /// Pipeline configuration (YAML).
        #[arg(long)]
        config: PathBuf,
    },

    /// Freeze the fused model at `base_model_paths.fusion` and train a new head.
    Retrain {
        /// Pipeline configuration (YAML).
        #[arg(long)]
        config: PathBuf,
    },

    /// Predict class probabilities for one image/audio pair.
    Predict {
        /// Pipeline configuration (YAML); selects the audio policy.
        #[arg(long)]
        config: PathBuf,

        /// Fusion model artifact. Defaults to the configured output path.
        #[arg(long)]
        model: Option<PathBuf>,

        /// Image file.
        #[arg(long)]
        image: PathBuf,

        /// Audio file as it would appear in the mapping table.
        #[arg(long)]
        audio: String,
    },

    /// Write a randomly initialized classifier with the default CNN layout.
    InitClassifier {
        /// Architecture name stored in the artifact.
        #[arg(long, default_value = "classifier")]
        name: String,

        /// Output path for the classifier artifact.
        #[arg(long)]
        output: PathBuf,
    },
}

fn report(outcome: &TrainOutcome) {
    if let Some(last) = outcome.history.last() {
        println!("\nFinal epoch {}: {}", last.epoch, last.val_metrics);
    }
    println!(
        "Best val loss: {:.4} (train={}, val={}, early_stop={})",
        outcome.best_val_loss, outcome.train_size, outcome.val_size, outcome.stopped_early
    );
}

fn run(cli: Cli) -> Result<()> {
    let device = select_device(cli.cpu);

    match cli.command {
        Command::Train { config } => {
            let config = load_config(&config)?;
            let outcome = run_training(&config, &device)?;
            report(&outcome);
            println!("Model saved to: {}", config.model_output_path.display());
        }
        Command::Retrain { config } => {
            let config = load_config(&config)?;
            let outcome = run_retraining(&config, &device)?;
            report(&outcome);
            println!("Model saved to: {}", config.model_output_path.display());
        }
        Command::Predict {
            config,
            model,
            image,
            audio,
        } => {
            let config = load_config(&config)?;
            let model = model.unwrap_or_else(|| config.model_output_path.clone());
            let probs = pipeline::predict(&model, &image, &audio, &config, &device)?;
            let best = probs
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            for (class, p) in probs.iter().enumerate().take(NUM_CLASSES) {
                println!("class {class}: {p:.4}");
            }
            println!("predicted: {best}");
        }
        Command::InitClassifier { name, output } => {
            init_classifier(&name, &output, &device)?;
            println!("Classifier written to: {}", output.display());
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
