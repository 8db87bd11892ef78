//! Dataset loading and batching module.

mod dataset;

pub use dataset::{DataLoader, ImageDataset};
