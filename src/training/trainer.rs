//! Training loop for the image DDPM.

use anyhow::{ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tch::{nn, nn::OptimizerConfig, Device, Tensor};
use tracing::{debug, info};

use crate::data::DataLoader;
use crate::model::{DenoiseDiffusion, UNet};
use crate::utils::{Checkpoint, Config, Experiment};

/// Trainer for the image DDPM.
///
/// Owns the eps-model's parameters (VarStore) and the Adam optimizer; the
/// diffusion core borrows the model per call and never touches parameters
/// itself. Batches are processed strictly sequentially: loss, backward,
/// clip, step, next batch.
pub struct Trainer {
    vs: nn::VarStore,
    model: UNet,
    diffusion: DenoiseDiffusion,
    optimizer: nn::Optimizer,
    config: Config,
    device: Device,
    best_loss: f64,
}

impl Trainer {
    /// Build the model, diffusion process, and optimizer from a validated
    /// configuration.
    pub fn new(config: Config, device: Device) -> Result<Self> {
        config.validate()?;

        let vs = nn::VarStore::new(device);
        let model = UNet::new(
            &vs.root(),
            config.data.image_channels,
            config.model.n_channels,
            &config.model.channel_multipliers,
            &config.model.is_attention,
            config.model.n_blocks,
        );

        let schedule = config.diffusion.build_schedule()?;
        let diffusion = DenoiseDiffusion::new(schedule, device);

        let optimizer = nn::Adam::default()
            .build(&vs, config.training.learning_rate)
            .context("failed to create optimizer")?;

        Ok(Self {
            vs,
            model,
            diffusion,
            optimizer,
            config,
            device,
            best_loss: f64::INFINITY,
        })
    }

    /// Get reference to the eps-model.
    pub fn model(&self) -> &UNet {
        &self.model
    }

    /// Get reference to the diffusion process.
    pub fn diffusion(&self) -> &DenoiseDiffusion {
        &self.diffusion
    }

    /// Load previously saved weights into the model.
    pub fn load_weights(&mut self, path: &str) -> Result<()> {
        self.vs
            .load(path)
            .with_context(|| format!("failed to load weights from {}", path))
    }

    /// Run one full reverse-sampling pass with the current weights.
    pub fn sample_images(&self) -> Result<Tensor> {
        self.diffusion.sample(
            &self.model,
            self.config.sampling.n_samples,
            self.config.data.image_channels,
            self.config.data.image_size,
        )
    }

    /// Train the model.
    ///
    /// Per epoch: every batch in the loader, then one sampling pass and a
    /// checkpoint, both persisted through the experiment context. A failing
    /// batch or checkpoint write aborts the run; there is no partial-epoch
    /// recovery.
    pub fn train(&mut self, loader: &mut DataLoader, experiment: &Experiment) -> Result<Vec<f64>> {
        ensure!(!loader.dataset().is_empty(), "training dataset is empty");

        let epochs = self.config.training.epochs;
        let mut losses = Vec::new();
        let mut global_step = 0usize;

        let pb = ProgressBar::new(epochs as u64);
        pb.set_style(ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"));

        for epoch in 0..epochs {
            loader.reset();

            let mut epoch_losses = Vec::new();

            for (images, _labels) in loader.by_ref() {
                let images = images.to_device(self.device);

                let loss = self.diffusion.loss(&self.model, &images)?;

                self.optimizer.zero_grad();
                loss.backward();

                // Gradient clipping
                let clip = self.config.training.grad_clip;
                self.vs.variables().iter().for_each(|(_, var)| {
                    let _ = var.grad().clamp_(-clip, clip);
                });

                self.optimizer.step();

                let loss_val: f64 = loss.double_value(&[]);
                experiment.log_scalar("loss", global_step, loss_val);
                global_step += 1;
                epoch_losses.push(loss_val);
            }

            let avg_loss = epoch_losses.iter().sum::<f64>() / epoch_losses.len() as f64;
            losses.push(avg_loss);

            if avg_loss < self.best_loss {
                self.best_loss = avg_loss;
            }

            info!(
                "Epoch {:>4}/{} | Loss: {:.6} | Best: {:.6}",
                epoch + 1,
                epochs,
                avg_loss,
                self.best_loss
            );

            // Sample with the current weights and persist the images
            let samples = self.sample_images()?;
            let saved = experiment.save_samples(epoch + 1, &samples);
            debug!("saved {} sample images for epoch {}", saved, epoch + 1);
            experiment.log_scalar("epoch_loss", epoch + 1, avg_loss);

            // Checkpoint: weights plus metadata sidecar. Losing persistence
            // invalidates the run, so failures propagate.
            let weights_path = experiment.checkpoint_path(&format!("ddpm_epoch_{}.pt", epoch + 1));
            self.vs
                .save(&weights_path)
                .with_context(|| format!("failed to save weights to {}", weights_path.display()))?;

            Checkpoint::new(
                weights_path.display().to_string(),
                epoch + 1,
                self.best_loss,
                self.config.clone(),
                losses.clone(),
            )
            .save(experiment.checkpoint_path("checkpoint.json"))?;

            pb.set_message(format!("Loss: {:.6}", avg_loss));
            pb.inc(1);
        }

        pb.finish_with_message(format!("Training complete! Best loss: {:.6}", self.best_loss));

        // Final weights under a stable name
        let final_path = experiment.checkpoint_path("ddpm_final.pt");
        self.vs
            .save(&final_path)
            .with_context(|| format!("failed to save weights to {}", final_path.display()))?;
        info!("Model saved to: {}", final_path.display());

        Ok(losses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageDataset;
    use tch::Kind;

    fn tiny_config() -> Config {
        let mut config = Config::default();
        config.data.image_channels = 1;
        config.data.image_size = 8;
        config.data.batch_size = 2;
        config.model.n_channels = 8;
        config.model.channel_multipliers = vec![1, 2];
        config.model.is_attention = vec![false, false];
        config.model.n_blocks = 1;
        config.diffusion.n_steps = 5;
        config.training.epochs = 1;
        config.training.learning_rate = 1e-3;
        config.sampling.n_samples = 1;
        config
    }

    fn tiny_loader(n: i64) -> DataLoader {
        let images = Tensor::randn(&[n, 1, 8, 8], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros(&[n], (Kind::Int64, Device::Cpu));
        let dataset = ImageDataset::new(images, labels).unwrap();
        DataLoader::new(dataset, 2, false)
    }

    #[test]
    fn test_one_epoch_end_to_end() {
        let root = std::env::temp_dir().join("diffusion-image-trainer-test");
        let experiment = Experiment::create(&root, "test").unwrap();

        let mut trainer = Trainer::new(tiny_config(), Device::Cpu).unwrap();
        let mut loader = tiny_loader(4);

        let losses = trainer.train(&mut loader, &experiment).unwrap();
        assert_eq!(losses.len(), 1);
        assert!(losses[0] >= 0.0);

        // Per-epoch artifacts: weights, metadata, sample image
        assert!(experiment.checkpoint_path("ddpm_epoch_1.pt").is_file());
        assert!(experiment.checkpoint_path("checkpoint.json").is_file());
        assert!(experiment.checkpoint_path("ddpm_final.pt").is_file());
        assert!(experiment
            .run_dir()
            .join("images/epoch_0001/image_0.png")
            .is_file());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        let root = std::env::temp_dir().join("diffusion-image-trainer-empty-test");
        let experiment = Experiment::create(&root, "test").unwrap();

        let mut trainer = Trainer::new(tiny_config(), Device::Cpu).unwrap();
        let mut loader = tiny_loader(0);

        assert!(trainer.train(&mut loader, &experiment).is_err());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = tiny_config();
        config.model.is_attention = vec![true];

        assert!(Trainer::new(config, Device::Cpu).is_err());
    }
}
