//! Image dataset loading and batching.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use tch::{vision::cifar, Tensor};

/// A fixed-size image dataset held as one tensor.
///
/// Images are `(N, C, H, W)` float, normalized to [-1, 1] to match the
/// diffusion process's working range; labels ride along but the training
/// loop only consumes the images. Tensors stay on the CPU; the trainer
/// moves each batch to its device.
pub struct ImageDataset {
    images: Tensor,
    labels: Tensor,
}

impl ImageDataset {
    /// Create a dataset from tensors already normalized to [-1, 1].
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let size = images.size();
        ensure!(
            size.len() == 4,
            "expected images of shape (N, C, H, W), got {:?}",
            size
        );
        ensure!(
            labels.size() == vec![size[0]],
            "label batch {:?} does not match image batch dimension {}",
            labels.size(),
            size[0]
        );

        Ok(Self { images, labels })
    }

    /// Load the CIFAR-10 training split from a directory holding the binary
    /// batches, rescaling pixels from [0, 1] to [-1, 1].
    pub fn cifar10<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let dataset = cifar::load_dir(dir)
            .with_context(|| format!("failed to load CIFAR-10 from {}", dir.display()))?;

        let images = dataset.train_images * 2.0 - 1.0;
        let labels = dataset.train_labels;

        Self::new(images, labels)
    }

    /// Number of images.
    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel count per image.
    pub fn channels(&self) -> i64 {
        self.images.size()[1]
    }

    /// Image height/width (images are square).
    pub fn image_size(&self) -> i64 {
        self.images.size()[2]
    }

    /// Get a batch of (images, labels) by index.
    pub fn get_batch(&self, indices: &[i64]) -> (Tensor, Tensor) {
        let idx = Tensor::from_slice(indices);
        (
            self.images.index_select(0, &idx),
            self.labels.index_select(0, &idx),
        )
    }
}

/// Data loader yielding shuffled (image, label) batches.
///
/// Finite and restartable: `reset` starts a new epoch, reshuffling when
/// enabled.
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<i64>,
    current_idx: usize,
}

impl DataLoader {
    /// Create a new data loader.
    pub fn new(dataset: ImageDataset, batch_size: usize, shuffle: bool) -> Self {
        let n = dataset.len();
        let indices: Vec<i64> = (0..n).collect();

        Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            current_idx: 0,
        }
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    /// Reset the loader for a new epoch.
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }
}

impl Iterator for DataLoader {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.indices.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices: Vec<i64> = self.indices[self.current_idx..end_idx].to_vec();

        self.current_idx = end_idx;

        Some(self.dataset.get_batch(&batch_indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn synthetic_dataset(n: i64) -> ImageDataset {
        let images = Tensor::randn(&[n, 3, 4, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros(&[n], (Kind::Int64, Device::Cpu));
        ImageDataset::new(images, labels).unwrap()
    }

    #[test]
    fn test_dataset_rejects_mismatched_labels() {
        let images = Tensor::zeros(&[4, 3, 4, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros(&[5], (Kind::Int64, Device::Cpu));

        assert!(ImageDataset::new(images, labels).is_err());
    }

    #[test]
    fn test_dataset_shape_accessors() {
        let dataset = synthetic_dataset(8);

        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.channels(), 3);
        assert_eq!(dataset.image_size(), 4);
    }

    #[test]
    fn test_loader_covers_all_samples() {
        let mut loader = DataLoader::new(synthetic_dataset(8), 3, false);
        loader.reset();

        let sizes: Vec<i64> = loader.by_ref().map(|(images, _)| images.size()[0]).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn test_loader_restarts_after_reset() {
        let mut loader = DataLoader::new(synthetic_dataset(4), 2, false);

        loader.reset();
        assert_eq!(loader.by_ref().count(), 2);
        assert!(loader.next().is_none());

        loader.reset();
        assert_eq!(loader.by_ref().count(), 2);
    }
}
