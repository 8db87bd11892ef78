//! Training module.

mod trainer;

pub use trainer::Trainer;
