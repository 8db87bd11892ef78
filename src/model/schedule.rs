//! Noise schedules for the diffusion process.

use std::f64::consts::PI;

use tch::{Device, Kind, Tensor};

/// Noise schedule types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Linear,
    Cosine,
    Sigmoid,
}

/// Precomputed per-timestep coefficients of the variance schedule.
///
/// All vectors have length `num_steps` and are indexed by timestep.
/// Immutable after construction; shared read-only by the forward and
/// reverse code paths.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Number of diffusion steps T
    pub num_steps: usize,
    /// Noise variances β_t
    pub betas: Vec<f64>,
    /// α_t = 1 - β_t
    pub alphas: Vec<f64>,
    /// Cumulative products ᾱ_t
    pub alphas_cumprod: Vec<f64>,
    /// √ᾱ_t
    pub sqrt_alphas_cumprod: Vec<f64>,
    /// √(1 - ᾱ_t)
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    /// Reverse-step variances β̃_t = β_t (1-ᾱ_{t-1}) / (1-ᾱ_t), with β̃_0 = β_0
    pub posterior_variance: Vec<f64>,
    /// Schedule type
    pub schedule_type: ScheduleType,
}

impl NoiseSchedule {
    /// Create a linear noise schedule.
    ///
    /// β increases linearly from 1e-4 to 0.02, the DDPM paper's range.
    pub fn linear(num_steps: usize) -> Self {
        Self::linear_with_params(num_steps, 0.0001, 0.02)
    }

    /// Create a linear noise schedule with custom bounds.
    pub fn linear_with_params(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = (0..num_steps)
            .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (num_steps - 1) as f64)
            .collect();

        Self::from_betas(betas, ScheduleType::Linear)
    }

    /// Create a cosine noise schedule.
    pub fn cosine(num_steps: usize) -> Self {
        Self::cosine_with_params(num_steps, 0.008)
    }

    /// Create a cosine noise schedule with custom offset.
    pub fn cosine_with_params(num_steps: usize, s: f64) -> Self {
        let steps = num_steps + 1;
        let t: Vec<f64> = (0..steps).map(|i| i as f64 / num_steps as f64).collect();

        let alphas_cumprod: Vec<f64> = t
            .iter()
            .map(|&ti| ((ti + s) / (1.0 + s) * PI / 2.0).cos().powi(2))
            .collect();

        // Normalize so the schedule starts at ᾱ = 1
        let alpha_0 = alphas_cumprod[0];
        let alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|&a| a / alpha_0).collect();

        let betas: Vec<f64> = (1..steps)
            .map(|i| {
                let beta = 1.0 - alphas_cumprod[i] / alphas_cumprod[i - 1];
                beta.clamp(0.0001, 0.9999)
            })
            .collect();

        Self::from_betas(betas, ScheduleType::Cosine)
    }

    /// Create a sigmoid noise schedule.
    pub fn sigmoid(num_steps: usize) -> Self {
        Self::sigmoid_with_params(num_steps, 0.0001, 0.02)
    }

    /// Create a sigmoid noise schedule with custom bounds.
    pub fn sigmoid_with_params(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = (0..num_steps)
            .map(|i| {
                let t = -6.0 + 12.0 * i as f64 / (num_steps - 1) as f64;
                let sigmoid = 1.0 / (1.0 + (-t).exp());
                sigmoid * (beta_end - beta_start) + beta_start
            })
            .collect();

        Self::from_betas(betas, ScheduleType::Sigmoid)
    }

    /// Derive every cached quantity from the beta sequence.
    fn from_betas(betas: Vec<f64>, schedule_type: ScheduleType) -> Self {
        let num_steps = betas.len();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        let mut prod = 1.0;
        for &alpha in &alphas {
            prod *= alpha;
            alphas_cumprod.push(prod);
        }

        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        // t = 0 has no previous step; the variance degenerates to β_0
        let posterior_variance: Vec<f64> = (0..num_steps)
            .map(|t| {
                if t == 0 {
                    betas[0]
                } else {
                    betas[t] * (1.0 - alphas_cumprod[t - 1]) / (1.0 - alphas_cumprod[t])
                }
            })
            .collect();

        Self {
            num_steps,
            betas,
            alphas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            posterior_variance,
            schedule_type,
        }
    }

    /// Get tensors for the schedule on a specific device.
    pub fn to_tensors(&self, device: Device) -> ScheduleTensors {
        let to_device = |v: &[f64]| Tensor::from_slice(v).to_kind(Kind::Float).to(device);

        ScheduleTensors {
            betas: to_device(&self.betas),
            alphas: to_device(&self.alphas),
            alphas_cumprod: to_device(&self.alphas_cumprod),
            sqrt_alphas_cumprod: to_device(&self.sqrt_alphas_cumprod),
            sqrt_one_minus_alphas_cumprod: to_device(&self.sqrt_one_minus_alphas_cumprod),
            posterior_variance: to_device(&self.posterior_variance),
        }
    }

    /// Signal-to-noise ratio at each timestep.
    pub fn snr(&self) -> Vec<f64> {
        self.alphas_cumprod
            .iter()
            .map(|a| a / (1.0 - a + 1e-10))
            .collect()
    }
}

/// Tensor versions of the schedule parameters, cached on one device.
pub struct ScheduleTensors {
    pub betas: Tensor,
    pub alphas: Tensor,
    pub alphas_cumprod: Tensor,
    pub sqrt_alphas_cumprod: Tensor,
    pub sqrt_one_minus_alphas_cumprod: Tensor,
    pub posterior_variance: Tensor,
}

impl ScheduleTensors {
    /// Gather per-sample coefficients for an image batch: select by timestep
    /// and reshape to (N, 1, 1, 1) so they broadcast over channel/height/width.
    pub fn gather(coefficients: &Tensor, t: &Tensor) -> Tensor {
        coefficients.index_select(0, t).view([-1, 1, 1, 1])
    }

    /// Corrupt clean data to timestep t: √ᾱ_t x₀ + √(1-ᾱ_t) ε.
    pub fn add_noise(&self, x_0: &Tensor, t: &Tensor, noise: &Tensor) -> Tensor {
        let sqrt_alpha = Self::gather(&self.sqrt_alphas_cumprod, t);
        let sqrt_one_minus_alpha = Self::gather(&self.sqrt_one_minus_alphas_cumprod, t);

        sqrt_alpha * x_0 + sqrt_one_minus_alpha * noise
    }
}
