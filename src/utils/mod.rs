//! Configuration, checkpointing, and run-context utilities.

mod checkpoint;
mod config;
mod experiment;

pub use checkpoint::Checkpoint;
pub use config::{
    Config, DataConfig, DiffusionConfig, ModelConfig, SamplingConfig, TrainingConfig,
};
pub use experiment::Experiment;
