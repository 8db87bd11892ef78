//! Configuration handling.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Result};

use crate::model::NoiseSchedule;

/// Main configuration.
///
/// The single authoritative source of run settings; fixed at run start and
/// immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub diffusion: DiffusionConfig,
    pub training: TrainingConfig,
    pub sampling: SamplingConfig,
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the CIFAR-10 binary batches
    pub data_dir: String,
    /// Channels per image (3 for RGB)
    pub image_channels: i64,
    /// Image height/width
    pub image_size: i64,
    /// Batch size
    pub batch_size: usize,
}

/// Noise-prediction network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Channels in the initial feature map
    pub n_channels: i64,
    /// Per-resolution channel multipliers
    pub channel_multipliers: Vec<i64>,
    /// Per-resolution attention flags
    pub is_attention: Vec<bool>,
    /// Residual blocks per resolution
    pub n_blocks: usize,
}

/// Diffusion process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of diffusion steps T
    pub n_steps: usize,
    /// Variance at the start of the schedule
    pub beta_start: f64,
    /// Variance at the end of the schedule
    pub beta_end: f64,
    /// Schedule family (linear, cosine, sigmoid)
    pub schedule: String,
}

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Gradient clipping
    pub grad_clip: f64,
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of images generated per sampling pass
    pub n_samples: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                data_dir: "data/cifar-10-batches-bin".to_string(),
                image_channels: 3,
                image_size: 32,
                batch_size: 64,
            },
            model: ModelConfig {
                n_channels: 64,
                channel_multipliers: vec![1, 2, 2, 4],
                is_attention: vec![false, false, false, true],
                n_blocks: 2,
            },
            diffusion: DiffusionConfig {
                n_steps: 1000,
                beta_start: 0.0001,
                beta_end: 0.02,
                schedule: "linear".to_string(),
            },
            training: TrainingConfig {
                epochs: 100,
                learning_rate: 2e-5,
                grad_clip: 1.0,
            },
            sampling: SamplingConfig { n_samples: 16 },
        }
    }
}

impl Config {
    /// Load configuration from file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Fail fast on settings the model or schedule cannot honor.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.model.channel_multipliers.is_empty(),
            "channel_multipliers must not be empty"
        );
        ensure!(
            self.model.channel_multipliers.len() == self.model.is_attention.len(),
            "channel_multipliers ({}) and is_attention ({}) must have the same length",
            self.model.channel_multipliers.len(),
            self.model.is_attention.len()
        );
        ensure!(self.model.n_blocks > 0, "n_blocks must be positive");
        ensure!(
            self.model.n_channels % 8 == 0,
            "n_channels must be divisible by the group-norm group count (8)"
        );

        // Each resolution below the first halves the spatial size
        let down_factor = 1i64 << (self.model.channel_multipliers.len() - 1);
        ensure!(
            self.data.image_size % down_factor == 0 && self.data.image_size >= down_factor * 2,
            "image_size {} cannot be downsampled {} times",
            self.data.image_size,
            self.model.channel_multipliers.len() - 1
        );

        ensure!(self.diffusion.n_steps >= 2, "n_steps must be at least 2");
        ensure!(
            self.diffusion.beta_start > 0.0
                && self.diffusion.beta_end < 1.0
                && self.diffusion.beta_start < self.diffusion.beta_end,
            "beta range must satisfy 0 < beta_start < beta_end < 1"
        );
        match self.diffusion.schedule.as_str() {
            "linear" | "cosine" | "sigmoid" => {}
            other => bail!("unknown schedule '{}'", other),
        }

        ensure!(self.data.batch_size > 0, "batch_size must be positive");
        ensure!(self.training.epochs > 0, "epochs must be positive");
        ensure!(
            self.training.learning_rate > 0.0,
            "learning_rate must be positive"
        );
        ensure!(self.sampling.n_samples > 0, "n_samples must be positive");

        Ok(())
    }
}

impl DiffusionConfig {
    /// Construct the noise schedule this configuration describes.
    pub fn build_schedule(&self) -> Result<NoiseSchedule> {
        let schedule = match self.schedule.as_str() {
            "linear" => {
                NoiseSchedule::linear_with_params(self.n_steps, self.beta_start, self.beta_end)
            }
            "cosine" => NoiseSchedule::cosine(self.n_steps),
            "sigmoid" => {
                NoiseSchedule::sigmoid_with_params(self.n_steps, self.beta_start, self.beta_end)
            }
            other => bail!("unknown schedule '{}'", other),
        };

        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.diffusion.n_steps, config.diffusion.n_steps);
        assert_eq!(parsed.training.epochs, config.training.epochs);
        assert_eq!(
            parsed.model.channel_multipliers,
            config.model.channel_multipliers
        );
    }

    #[test]
    fn test_mismatched_attention_flags_rejected() {
        let mut config = Config::default();
        config.model.is_attention = vec![true];

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_schedule_rejected() {
        let mut config = Config::default();
        config.diffusion.schedule = "quadratic".to_string();

        assert!(config.validate().is_err());
        assert!(config.diffusion.build_schedule().is_err());
    }
}
