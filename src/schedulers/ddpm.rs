//! # Denoising Diffusion Probabilistic Models
//!
//! Ancestral sampling: starting from pure Gaussian noise, every training
//! timestep is visited in reverse order and the posterior mean is computed
//! from the noise predicted by the denoiser, adding fresh noise on all but
//! the last step.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use super::{NoiseGenerator, NoiseSchedule};
use crate::error::{Error, Result};
use crate::models::{check_input, Condition, Denoiser};

/// The variance used for the noise added at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DDPMVarianceType {
    /// The posterior variance `beta_t * (1 - alpha_bar_{t-1}) / (1 - alpha_bar_t)`.
    FixedSmall,
    /// `beta_t`.
    #[default]
    FixedLarge,
}

/// Additional configuration for the [`DDPMSampler`].
#[derive(Debug, Clone, Copy)]
pub struct DDPMSamplerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    pub variance_type: DDPMVarianceType,
    /// Classifier-free guidance strength, 0 disables guidance.
    pub guidance_weight: f64,
    /// Seed of the initial and per-step noise, `None` for a random seed.
    pub seed: Option<u64>,
    /// Interval at which intermediate samples are recorded by
    /// [`DDPMSampler::sample_with_trajectory`].
    pub trajectory_every: usize,
}

impl Default for DDPMSamplerConfig {
    fn default() -> Self {
        Self {
            beta_start: 1e-4,
            beta_end: 0.02,
            train_timesteps: 500,
            variance_type: DDPMVarianceType::FixedLarge,
            guidance_weight: 0.,
            seed: None,
            trajectory_every: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DDPMSampler {
    schedule: NoiseSchedule,
    pub config: DDPMSamplerConfig,
}

impl DDPMSampler {
    pub fn new(config: DDPMSamplerConfig) -> Result<Self> {
        if !(config.guidance_weight >= 0.) {
            return Err(Error::InvalidScheduleParameter(format!(
                "guidance weight must be non-negative, got {}",
                config.guidance_weight
            )));
        }
        let schedule =
            NoiseSchedule::linear(config.train_timesteps, config.beta_start, config.beta_end)?;
        Ok(Self { schedule, config })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// All the training timesteps, from the noisiest to the cleanest.
    pub fn timesteps(&self) -> impl Iterator<Item = usize> {
        (0..self.schedule.train_timesteps()).rev()
    }

    fn get_variance(&self, timestep: usize) -> f64 {
        match self.config.variance_type {
            DDPMVarianceType::FixedSmall => self.schedule.posterior_variance(timestep).max(1e-20),
            DDPMVarianceType::FixedLarge => self.schedule.betas()[timestep],
        }
    }

    /// Performs a backward step: computes the posterior mean from the
    /// predicted noise and, except for the last timestep, adds noise.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        if timestep >= self.schedule.train_timesteps() {
            return Err(Error::InvalidScheduleParameter(format!(
                "timestep {timestep} is out of range for {} training timesteps",
                self.schedule.train_timesteps()
            )));
        }
        let alpha_t = self.schedule.alphas()[timestep];
        let beta_t = self.schedule.betas()[timestep];
        let alpha_prod_t = self.schedule.alphas_cumprod()[timestep];

        // mean = 1/sqrt(alpha_t) * (x_t - beta_t / sqrt(1 - alpha_bar_t) * eps)
        let eps_coeff = beta_t / (1. - alpha_prod_t).sqrt();
        let pred_prev_sample = (sample - eps_coeff * model_output) / alpha_t.sqrt();

        if timestep > 0 {
            let variance_noise = noise_gen.randn_like(sample);
            Ok(pred_prev_sample + self.get_variance(timestep).sqrt() * variance_noise)
        } else {
            Ok(pred_prev_sample)
        }
    }

    /// Noise prediction, mixed with the unconditional prediction when
    /// guidance is enabled.
    fn predict<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        sample: &Tensor,
        timestep: usize,
        condition: &Condition,
    ) -> Tensor {
        let noise_pred = denoiser.predict_noise(sample, timestep, condition);
        let guidance = self.config.guidance_weight;
        if guidance > 0. && condition.is_conditional() {
            let noise_pred_uncond =
                denoiser.predict_noise(sample, timestep, &Condition::Unconditional);
            (1. + guidance) * noise_pred - guidance * noise_pred_uncond
        } else {
            noise_pred
        }
    }

    /// Generates `n_samples` samples starting from seeded Gaussian noise.
    pub fn sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        n_samples: i64,
        condition: &Condition,
    ) -> Result<Tensor> {
        let mut noise_gen = NoiseGenerator::new(self.config.seed);
        let noise = self.initial_noise(denoiser, n_samples, &mut noise_gen)?;
        self.denoise(denoiser, noise, condition, &mut noise_gen, None)
    }

    /// Same as [`DDPMSampler::sample`], also returning the intermediate
    /// samples on the CPU: the first step, every `trajectory_every` steps
    /// and the last steps of the chain.
    pub fn sample_with_trajectory<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        n_samples: i64,
        condition: &Condition,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut noise_gen = NoiseGenerator::new(self.config.seed);
        let noise = self.initial_noise(denoiser, n_samples, &mut noise_gen)?;
        let mut trajectory = vec![];
        let sample =
            self.denoise(denoiser, noise, condition, &mut noise_gen, Some(&mut trajectory))?;
        Ok((sample, trajectory))
    }

    /// Runs the full reverse chain from a given noise tensor.
    pub fn sample_from<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        noise: Tensor,
        condition: &Condition,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        self.denoise(denoiser, noise, condition, noise_gen, None)
    }

    fn initial_noise<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        n_samples: i64,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        if n_samples < 0 {
            return Err(Error::InvalidScheduleParameter(format!(
                "the number of samples must be non-negative, got {n_samples}"
            )));
        }
        let mut size = vec![n_samples];
        size.extend(denoiser.input_shape());
        Ok(noise_gen.randn(&size, (Kind::Float, denoiser.device())))
    }

    fn keep_in_trajectory(&self, timestep: usize) -> bool {
        // Counted from 1 so that the rule reads as in the training logs.
        let step = timestep + 1;
        let every = self.config.trajectory_every.max(1);
        step % every == 0 || step == self.schedule.train_timesteps() || step < 8
    }

    fn denoise<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        noise: Tensor,
        condition: &Condition,
        noise_gen: &mut NoiseGenerator,
        mut trajectory: Option<&mut Vec<Tensor>>,
    ) -> Result<Tensor> {
        let batch = check_input(denoiser, &noise)?;
        condition.check_batch(batch)?;
        info!(
            batch,
            train_timesteps = self.schedule.train_timesteps(),
            guidance = self.config.guidance_weight,
            "ddpm sampling"
        );
        let _no_grad = tch::no_grad_guard();
        let mut sample = noise;
        for timestep in self.timesteps() {
            debug!(timestep, "ddpm step");
            let noise_pred = self.predict(denoiser, &sample, timestep, condition);
            sample = self.step(&noise_pred, timestep, &sample, noise_gen)?;
            if let Some(trajectory) = trajectory.as_mut() {
                if self.keep_in_trajectory(timestep) {
                    trajectory.push(sample.to_device(Device::Cpu));
                }
            }
        }
        Ok(sample)
    }
}
