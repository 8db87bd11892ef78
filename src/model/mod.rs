//! Diffusion model module.

mod ddpm;
mod schedule;
mod unet;

pub use ddpm::{DenoiseDiffusion, NoisePredictor};
pub use schedule::{NoiseSchedule, ScheduleType};
pub use unet::UNet;
