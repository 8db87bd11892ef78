//! # Diffusion Models for Image Generation
//!
//! This library implements Denoising Diffusion Probabilistic Models (DDPM)
//! for unconditional image generation on CIFAR-10.
//!
//! ## Features
//!
//! - Noise schedules (linear, cosine, sigmoid) with precomputed coefficients
//! - Forward corruption, simplified training objective, and ancestral
//!   reverse sampling decoupled from the network through a trait
//! - UNet noise predictor with configurable widths and attention
//! - Training pipeline with per-epoch sampling and checkpointing
//! - Per-run experiment context for metrics and generated images
//!
//! ## Example
//!
//! ```rust,no_run
//! use diffusion_image::{training::Trainer, utils::Config};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let trainer = Trainer::new(config, tch::Device::Cpu)?;
//!
//!     // Generate images from randomly initialized weights
//!     let images = trainer.sample_images()?;
//!     println!("{:?}", images.size());
//!
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{DataLoader, ImageDataset};
pub use model::{DenoiseDiffusion, NoisePredictor, NoiseSchedule, UNet};
pub use training::Trainer;
pub use utils::{Checkpoint, Config, Experiment};
