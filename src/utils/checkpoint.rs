//! Model checkpointing.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use anyhow::Result;

/// Checkpoint metadata, saved as a JSON sidecar next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Path to the serialized VarStore weights
    pub model_path: String,
    /// Training epoch the weights were written at
    pub epoch: usize,
    /// Best epoch-average loss so far
    pub best_loss: f64,
    /// Configuration used for the run
    pub config: super::Config,
    /// Epoch-average loss history
    pub losses: Vec<f64>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(
        model_path: String,
        epoch: usize,
        best_loss: f64,
        config: super::Config,
        losses: Vec<f64>,
    ) -> Self {
        Self {
            model_path,
            epoch,
            best_loss,
            config,
            losses,
        }
    }

    /// Save checkpoint metadata.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load checkpoint metadata.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let dir = std::env::temp_dir().join("diffusion-image-checkpoint-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("checkpoint.json");

        let checkpoint = Checkpoint::new(
            "weights.pt".to_string(),
            7,
            0.125,
            crate::utils::Config::default(),
            vec![0.5, 0.25, 0.125],
        );
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.losses.len(), 3);
        assert_eq!(loaded.model_path, "weights.pt");

        fs::remove_dir_all(&dir).ok();
    }
}
