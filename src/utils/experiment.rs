//! Per-run experiment context.
//!
//! One `Experiment` is created per run and passed explicitly to whatever
//! needs to persist artifacts; dropping it ends the run. It owns a
//! timestamped run directory with `images/` and `checkpoints/`
//! subdirectories and an append-only JSONL metrics file.
//!
//! Telemetry is non-fatal by policy: failed metric appends and failed image
//! writes are logged as warnings and skipped, so a full disk or broken
//! telemetry path never aborts training. Checkpoint persistence is handled
//! by the trainer and stays fatal.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::json;
use tch::{vision::image, Device, Kind, Tensor};
use tracing::{debug, warn};

pub struct Experiment {
    run_dir: PathBuf,
    images_dir: PathBuf,
    checkpoints_dir: PathBuf,
    metrics_path: PathBuf,
}

impl Experiment {
    /// Create a timestamped run directory under `root`.
    pub fn create<P: AsRef<Path>>(root: P, name: &str) -> Result<Self> {
        let timestamp = Local::now().format("%Y%m%d%H%M%S");
        let run_dir = root.as_ref().join(format!("{}_{}", name, timestamp));
        let images_dir = run_dir.join("images");
        let checkpoints_dir = run_dir.join("checkpoints");

        fs::create_dir_all(&images_dir)
            .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
        fs::create_dir_all(&checkpoints_dir)?;

        let metrics_path = run_dir.join("metrics.jsonl");
        debug!("created run directory {}", run_dir.display());

        Ok(Self {
            run_dir,
            images_dir,
            checkpoints_dir,
            metrics_path,
        })
    }

    /// Root directory of this run.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path for a checkpoint artifact.
    pub fn checkpoint_path(&self, file_name: &str) -> PathBuf {
        self.checkpoints_dir.join(file_name)
    }

    /// Append a scalar metric as one JSON line. Non-fatal on failure.
    pub fn log_scalar(&self, name: &str, step: usize, value: f64) {
        let line = json!({ "name": name, "step": step, "value": value }).to_string();

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.metrics_path)
            .and_then(|mut file| writeln!(file, "{}", line));

        if let Err(e) = result {
            warn!("failed to record metric '{}': {}", name, e);
        }
    }

    /// Persist a sample batch as one PNG per image, de-normalizing from the
    /// diffusion range [-1, 1] to display bytes. Non-fatal per image;
    /// returns how many were written.
    pub fn save_samples(&self, epoch: usize, samples: &Tensor) -> usize {
        let dir = self.images_dir.join(format!("epoch_{:04}", epoch));
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("failed to create sample directory {}: {}", dir.display(), e);
            return 0;
        }

        let bytes = ((samples.to_device(Device::Cpu) + 1.0) * 127.5)
            .clamp(0.0, 255.0)
            .to_kind(Kind::Uint8);

        let n = bytes.size()[0];
        let mut saved = 0;
        for i in 0..n {
            let path = dir.join(format!("image_{}.png", i));
            match image::save(&bytes.get(i), &path) {
                Ok(()) => saved += 1,
                Err(e) => warn!("failed to save sample {}: {}", path.display(), e),
            }
        }

        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_lays_out_run_directory() {
        let root = std::env::temp_dir().join("diffusion-image-experiment-test");

        let experiment = Experiment::create(&root, "test").unwrap();
        assert!(experiment.run_dir().join("images").is_dir());
        assert!(experiment.run_dir().join("checkpoints").is_dir());
        assert!(experiment
            .checkpoint_path("final.pt")
            .starts_with(experiment.run_dir()));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_log_scalar_appends_lines() {
        let root = std::env::temp_dir().join("diffusion-image-metrics-test");

        let experiment = Experiment::create(&root, "test").unwrap();
        experiment.log_scalar("loss", 0, 1.5);
        experiment.log_scalar("loss", 1, 0.75);

        let content = fs::read_to_string(experiment.run_dir().join("metrics.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"loss\""));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_save_samples_writes_one_file_per_image() {
        let root = std::env::temp_dir().join("diffusion-image-samples-test");

        let experiment = Experiment::create(&root, "test").unwrap();
        let samples = Tensor::zeros(&[2, 3, 4, 4], (Kind::Float, Device::Cpu));

        let saved = experiment.save_samples(1, &samples);
        assert_eq!(saved, 2);
        assert!(experiment
            .run_dir()
            .join("images/epoch_0001/image_0.png")
            .is_file());

        fs::remove_dir_all(&root).ok();
    }
}
