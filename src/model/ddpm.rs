//! DDPM (Denoising Diffusion Probabilistic Model) core.
//!
//! Implements the forward corruption process, the simplified training
//! objective, and ancestral reverse sampling. The noise-prediction network
//! is an external collaborator reached through [`NoisePredictor`]; the core
//! holds no trainable parameters of its own.

use anyhow::{ensure, Result};
use tch::{Device, Kind, Tensor};

use super::schedule::{NoiseSchedule, ScheduleTensors};

/// Contract for the noise-prediction network.
///
/// Maps a noisy batch `(N, C, H, W)` and per-sample timesteps `(N,)` to
/// predicted noise of the same shape as the input. Training invokes it with
/// `train = true` inside a gradient-tracking context; sampling invokes it
/// with `train = false` under `no_grad`.
pub trait NoisePredictor {
    fn predict(&self, x: &Tensor, t: &Tensor, train: bool) -> Tensor;
}

/// The diffusion process: forward noising, training loss, reverse sampling.
///
/// Owns the noise schedule (precomputed at construction, immutable after)
/// and a device handle. The eps-model is borrowed per call.
pub struct DenoiseDiffusion {
    schedule: NoiseSchedule,
    tensors: ScheduleTensors,
    device: Device,
}

impl DenoiseDiffusion {
    /// Create the diffusion process from a schedule.
    pub fn new(schedule: NoiseSchedule, device: Device) -> Self {
        let tensors = schedule.to_tensors(device);

        Self {
            schedule,
            tensors,
            device,
        }
    }

    /// Number of diffusion steps T.
    pub fn n_steps(&self) -> usize {
        self.schedule.num_steps
    }

    /// The underlying schedule.
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Forward corruption q(x_t | x_0): xₜ = √ᾱ_t x₀ + √(1-ᾱ_t) ε.
    ///
    /// `x_0` is `(N, C, H, W)`, `t` is `(N,)` int64, `noise` matches `x_0`.
    /// Per-sample coefficients broadcast over channel/height/width. Shape
    /// mismatches are contract violations and fail fast.
    pub fn q_sample(&self, x_0: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let x_size = x_0.size();
        ensure!(
            x_size.len() == 4,
            "expected a 4-d image batch (N, C, H, W), got shape {:?}",
            x_size
        );
        ensure!(
            t.size() == vec![x_size[0]],
            "timestep batch {:?} does not match sample batch dimension {}",
            t.size(),
            x_size[0]
        );
        ensure!(
            noise.size() == x_size,
            "noise shape {:?} does not match sample shape {:?}",
            noise.size(),
            x_size
        );
        let t_max = t.max().int64_value(&[]);
        ensure!(
            t_max < self.schedule.num_steps as i64,
            "timestep {} out of range for schedule of {} steps",
            t_max,
            self.schedule.num_steps
        );

        Ok(self.tensors.add_noise(x_0, t, noise))
    }

    /// Simplified DDPM training objective.
    ///
    /// Draws a uniform timestep and fresh Gaussian noise per sample, corrupts
    /// the batch, and returns the scalar MSE between the injected and the
    /// predicted noise. This is the only trainable objective.
    pub fn loss<M: NoisePredictor>(&self, model: &M, x_0: &Tensor) -> Result<Tensor> {
        let x_size = x_0.size();
        ensure!(
            x_size.len() == 4,
            "expected a 4-d image batch (N, C, H, W), got shape {:?}",
            x_size
        );
        let batch_size = x_size[0];

        let t = Tensor::randint(
            self.schedule.num_steps as i64,
            &[batch_size],
            (Kind::Int64, self.device),
        );
        let noise = Tensor::randn_like(x_0);

        let x_noisy = self.q_sample(x_0, &t, &noise)?;
        let noise_pred = model.predict(&x_noisy, &t, true);

        Ok((&noise_pred - &noise).pow_tensor_scalar(2).mean(Kind::Float))
    }

    /// Reverse-transition mean: μ_t = (1/√α_t) (x - (β_t/√(1-ᾱ_t)) ε̂).
    pub fn posterior_mean(&self, x: &Tensor, eps_hat: &Tensor, t: usize) -> Tensor {
        let coef1 = 1.0 / self.schedule.alphas[t].sqrt();
        let coef2 = self.schedule.betas[t] / self.schedule.sqrt_one_minus_alphas_cumprod[t];

        coef1 * (x - coef2 * eps_hat)
    }

    /// One reverse step p(x_{t-1} | x_t).
    ///
    /// During sampling a single scalar timestep is shared by the whole batch;
    /// every sample must sit at the same reverse-chain position for the step
    /// to be a valid transition. For t > 0 fresh noise scaled by √β̃_t is
    /// added; the terminal step t = 0 returns the mean unchanged.
    pub fn p_sample<M: NoisePredictor>(&self, model: &M, x: &Tensor, t: usize) -> Result<Tensor> {
        ensure!(
            t < self.schedule.num_steps,
            "timestep {} out of range for schedule of {} steps",
            t,
            self.schedule.num_steps
        );

        let batch_size = x.size()[0];
        let t_tensor = Tensor::full(&[batch_size], t as i64, (Kind::Int64, self.device));

        let eps_hat = model.predict(x, &t_tensor, false);
        let mean = self.posterior_mean(x, &eps_hat, t);

        if t > 0 {
            let sigma = self.schedule.posterior_variance[t].sqrt();
            let noise = Tensor::randn_like(x);
            Ok(mean + sigma * noise)
        } else {
            Ok(mean)
        }
    }

    /// Full ancestral sampling loop.
    ///
    /// Starts from x_T ~ N(0, I) of shape `(n_samples, channels, size, size)`
    /// and walks every timestep T-1 down to 0, one predictor call each, with
    /// no skipping. Runs without gradient tracking. The result stays in the
    /// training normalization range [-1, 1]; de-normalization is up to the
    /// caller.
    pub fn sample<M: NoisePredictor>(
        &self,
        model: &M,
        n_samples: i64,
        channels: i64,
        size: i64,
    ) -> Result<Tensor> {
        tch::no_grad(|| {
            let mut x = Tensor::randn(
                &[n_samples, channels, size, size],
                (Kind::Float, self.device),
            );

            for t in (0..self.schedule.num_steps).rev() {
                x = self.p_sample(model, &x, t)?;
            }

            Ok(x)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Predictor that always returns zero noise.
    struct ZeroPredictor;

    impl NoisePredictor for ZeroPredictor {
        fn predict(&self, x: &Tensor, _t: &Tensor, _train: bool) -> Tensor {
            Tensor::zeros_like(x)
        }
    }

    /// Predictor that records every timestep it is called with.
    struct CountingPredictor {
        seen: RefCell<Vec<i64>>,
    }

    impl CountingPredictor {
        fn new() -> Self {
            Self {
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl NoisePredictor for CountingPredictor {
        fn predict(&self, x: &Tensor, t: &Tensor, _train: bool) -> Tensor {
            self.seen.borrow_mut().push(t.int64_value(&[0]));
            Tensor::zeros_like(x)
        }
    }

    fn diffusion(n_steps: usize) -> DenoiseDiffusion {
        DenoiseDiffusion::new(NoiseSchedule::linear(n_steps), Device::Cpu)
    }

    #[test]
    fn test_q_sample_of_zero_input_is_scaled_noise() {
        let d = diffusion(10);

        let x_0 = Tensor::zeros(&[2, 1, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 0]);
        let noise = Tensor::ones(&[2, 1, 2, 2], (Kind::Float, Device::Cpu));

        let x_t = d.q_sample(&x_0, &t, &noise).unwrap();

        let expected = (1.0 - d.schedule().alphas_cumprod[0]).sqrt();
        let got = x_t.double_value(&[0, 0, 0, 0]);
        assert!((got - expected).abs() < 1e-5);
    }

    #[test]
    fn test_q_sample_rejects_mismatched_timestep_batch() {
        let d = diffusion(10);

        let x_0 = Tensor::zeros(&[2, 1, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 1, 2]);
        let noise = Tensor::zeros(&[2, 1, 2, 2], (Kind::Float, Device::Cpu));

        assert!(d.q_sample(&x_0, &t, &noise).is_err());
    }

    #[test]
    fn test_q_sample_rejects_out_of_range_timestep() {
        let d = diffusion(10);

        let x_0 = Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[10i64]);
        let noise = Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));

        assert!(d.q_sample(&x_0, &t, &noise).is_err());
    }

    #[test]
    fn test_loss_is_nonnegative_scalar() {
        let d = diffusion(10);

        let x_0 = Tensor::randn(&[4, 1, 2, 2], (Kind::Float, Device::Cpu));
        let loss = d.loss(&ZeroPredictor, &x_0).unwrap();

        assert!(loss.size().is_empty());
        assert!(loss.double_value(&[]) >= 0.0);
    }

    #[test]
    fn test_terminal_step_is_deterministic() {
        let d = diffusion(10);
        let x = Tensor::randn(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));

        let a = d.p_sample(&ZeroPredictor, &x, 0).unwrap();
        let b = d.p_sample(&ZeroPredictor, &x, 0).unwrap();

        assert!((a - b).abs().max().double_value(&[]) == 0.0);
    }

    #[test]
    fn test_intermediate_step_is_stochastic() {
        let d = diffusion(10);
        let x = Tensor::randn(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));

        let a = d.p_sample(&ZeroPredictor, &x, 5).unwrap();
        let b = d.p_sample(&ZeroPredictor, &x, 5).unwrap();

        assert!((a - b).abs().max().double_value(&[]) > 0.0);
    }

    #[test]
    fn test_sample_visits_every_timestep_descending() {
        let d = diffusion(10);
        let model = CountingPredictor::new();

        let out = d.sample(&model, 1, 1, 2).unwrap();
        assert_eq!(out.size(), vec![1, 1, 2, 2]);

        let seen = model.seen.borrow();
        let expected: Vec<i64> = (0..10).rev().collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn test_zero_state_is_fixed_point_of_noise_free_recursion() {
        let d = diffusion(10);
        let zeros = Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let eps = Tensor::zeros(&[1, 1, 2, 2], (Kind::Float, Device::Cpu));

        // μ_t of a zero state with zero predicted noise is zero at every t;
        // the noise-free terminal step keeps it exactly zero.
        for t in 0..d.n_steps() {
            let mean = d.posterior_mean(&zeros, &eps, t);
            assert!(mean.abs().max().double_value(&[]) == 0.0);
        }

        let terminal = d.p_sample(&ZeroPredictor, &zeros, 0).unwrap();
        assert!(terminal.abs().max().double_value(&[]) == 0.0);
    }

    #[test]
    fn test_sample_output_shape_matches_request() {
        let d = diffusion(5);

        let out = d.sample(&ZeroPredictor, 3, 2, 4).unwrap();
        assert_eq!(out.size(), vec![3, 2, 4, 4]);
    }
}
