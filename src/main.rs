//! Main CLI application for DDPM image generation.

use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use diffusion_image::{
    data::{DataLoader, ImageDataset},
    training::Trainer,
    utils::{Checkpoint, Config, Experiment},
};

#[derive(Parser)]
#[command(name = "diffusion-image")]
#[command(about = "Denoising diffusion models for image generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "config.json")]
        output: String,
    },

    /// Train the diffusion model
    Train {
        /// Configuration file (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Directory where run artifacts are written
        #[arg(short, long, default_value = "runs")]
        runs_dir: String,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },

    /// Generate images from a trained checkpoint
    Sample {
        /// Path to checkpoint metadata (checkpoint.json)
        #[arg(short, long)]
        checkpoint: String,

        /// Number of images to generate (defaults to the run's setting)
        #[arg(short, long)]
        num_samples: Option<i64>,

        /// Directory where generated images are written
        #[arg(short, long, default_value = "samples")]
        output: String,

        /// Use GPU if available
        #[arg(long)]
        gpu: bool,
    },
}

fn select_device(gpu: bool) -> tch::Device {
    if gpu && tch::Cuda::is_available() {
        info!("Using CUDA GPU");
        tch::Device::Cuda(0)
    } else {
        info!("Using CPU");
        tch::Device::Cpu
    }
}

fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            info!("Creating default configuration...");
            let config = Config::default();
            config.to_file(&output)?;
            info!("Configuration saved to: {}", output);
        }

        Commands::Train {
            config,
            runs_dir,
            gpu,
        } => {
            let cfg = if let Some(config_path) = config {
                Config::from_file(config_path)?
            } else {
                Config::default()
            };
            cfg.validate()?;

            let device = select_device(gpu);

            info!("Loading dataset from: {}", cfg.data.data_dir);
            let dataset = ImageDataset::cifar10(&cfg.data.data_dir)?;
            ensure!(
                dataset.channels() == cfg.data.image_channels
                    && dataset.image_size() == cfg.data.image_size,
                "dataset images are {}x{}x{} but the configuration expects {}x{}x{}",
                dataset.channels(),
                dataset.image_size(),
                dataset.image_size(),
                cfg.data.image_channels,
                cfg.data.image_size,
                cfg.data.image_size
            );
            info!("Loaded {} images", dataset.len());

            let mut loader = DataLoader::new(dataset, cfg.data.batch_size, true);
            info!("Created dataloader with {} batches", loader.num_batches());

            let experiment = Experiment::create(&runs_dir, "ddpm")?;
            info!("Run directory: {}", experiment.run_dir().display());
            cfg.to_file(experiment.run_dir().join("config.json"))?;

            let mut trainer = Trainer::new(cfg.clone(), device)?;
            info!(
                "Created DDPM with {} diffusion steps, {} base channels",
                cfg.diffusion.n_steps, cfg.model.n_channels
            );

            info!("Training for {} epochs...", cfg.training.epochs);
            let losses = trainer.train(&mut loader, &experiment)?;

            info!("Training complete!");
            info!("Final loss: {:.6}", losses.last().unwrap_or(&0.0));
            info!(
                "Best loss: {:.6}",
                losses.iter().cloned().fold(f64::INFINITY, f64::min)
            );
        }

        Commands::Sample {
            checkpoint,
            num_samples,
            output,
            gpu,
        } => {
            info!("Loading checkpoint from: {}", checkpoint);
            let metadata = Checkpoint::load(&checkpoint)?;

            let mut cfg = metadata.config.clone();
            if let Some(n) = num_samples {
                cfg.sampling.n_samples = n;
            }
            cfg.validate()?;

            let device = select_device(gpu);

            let mut trainer = Trainer::new(cfg.clone(), device)?;
            trainer.load_weights(&metadata.model_path)?;

            info!(
                "Generating {} images over {} denoising steps...",
                cfg.sampling.n_samples, cfg.diffusion.n_steps
            );
            let images = trainer.sample_images()?;

            let experiment = Experiment::create(&output, "sample")?;
            let saved = experiment.save_samples(metadata.epoch, &images);
            info!(
                "Saved {} images to: {}",
                saved,
                experiment.run_dir().display()
            );
        }
    }

    Ok(())
}
