//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) is a simple sampler
//! similar to Denoising Diffusion Probabilistic Models (DDPM). The DDPM
//! generative process is the reverse of a Markovian process, DDIM generalizes
//! this to non-Markovian guidance. It can skip timesteps and, with `eta = 0`,
//! maps each initial noise to an image deterministically.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use tch::{Device, Tensor};
use tracing::{debug, info};

use super::{NoiseGenerator, NoiseSchedule};
use crate::error::{check_unit_interval, Error, Result};
use crate::models::{check_input, Condition, Denoiser};

/// The configuration for the DDIM sampler.
#[derive(Debug, Clone, Copy)]
pub struct DDIMSamplerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// The amount of noise to be added at each step, between 0 and 1.
    pub eta: f64,
    /// Adjust the indexes of the inference schedule by this value.
    pub steps_offset: usize,
    /// Clamp the predicted original sample to `[-1, 1]`.
    pub clip_sample: bool,
    /// Use an alpha product of 1 after the last timestep rather than the
    /// first entry of the schedule.
    pub set_alpha_to_one: bool,
    /// Seed of the noise added when `eta > 0`.
    pub seed: Option<u64>,
}

impl Default for DDIMSamplerConfig {
    fn default() -> Self {
        Self {
            beta_start: 1e-4,
            beta_end: 0.02,
            train_timesteps: 1000,
            eta: 0.,
            steps_offset: 1,
            clip_sample: true,
            set_alpha_to_one: true,
            seed: None,
        }
    }
}

/// Result of a single DDIM step.
#[derive(Debug)]
pub struct DDIMStepOutput {
    /// The sample at the previous (less noisy) timestep.
    pub prev_sample: Tensor,
    /// The current estimate of the clean sample.
    pub pred_original_sample: Tensor,
}

/// The DDIM sampler.
#[derive(Debug, Clone)]
pub struct DDIMSampler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    final_alpha_cumprod: f64,
    pub config: DDIMSamplerConfig,
}

impl DDIMSampler {
    /// Creates a new DDIM sampler given the number of steps to be used for
    /// inference, the timesteps being strided through the training ones.
    pub fn new(inference_steps: usize, config: DDIMSamplerConfig) -> Result<Self> {
        check_unit_interval("eta", config.eta)?;
        let schedule =
            NoiseSchedule::linear(config.train_timesteps, config.beta_start, config.beta_end)?;
        if inference_steps == 0 || inference_steps > config.train_timesteps {
            return Err(Error::InvalidScheduleParameter(format!(
                "the number of inference steps must be in [1, {}], got {inference_steps}",
                config.train_timesteps
            )));
        }
        let step_ratio = config.train_timesteps / inference_steps;
        let timesteps: Vec<usize> = (0..inference_steps)
            .map(|s| s * step_ratio + config.steps_offset)
            .rev()
            .collect();
        if timesteps[0] >= config.train_timesteps {
            return Err(Error::InvalidScheduleParameter(format!(
                "steps offset {} moves timestep {} past the {} training timesteps",
                config.steps_offset, timesteps[0], config.train_timesteps
            )));
        }
        let final_alpha_cumprod =
            if config.set_alpha_to_one { 1.0 } else { schedule.alphas_cumprod()[0] };
        Ok(Self { schedule, timesteps, final_alpha_cumprod, config })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// The strictly decreasing timesteps visited during sampling.
    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    /// Performs a backward step from `timestep` to the next timestep of the
    /// inference schedule. `timestep` has to be one of [`DDIMSampler::timesteps`].
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<DDIMStepOutput> {
        let index = self.timesteps.iter().position(|&t| t == timestep).ok_or_else(|| {
            Error::InvalidScheduleParameter(format!(
                "timestep {timestep} is not part of the inference schedule"
            ))
        })?;
        let alpha_prod_t = self.schedule.alphas_cumprod()[timestep];
        let alpha_prod_t_prev = match self.timesteps.get(index + 1) {
            Some(&prev_timestep) => self.schedule.alphas_cumprod()[prev_timestep],
            None => self.final_alpha_cumprod,
        };
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        // x0 = (x_t - sqrt(1 - alpha_bar_t) * eps) / sqrt(alpha_bar_t), formula (12)
        let pred_original_sample =
            (sample - beta_prod_t.sqrt() * model_output) / alpha_prod_t.sqrt();
        let pred_original_sample = if self.config.clip_sample {
            pred_original_sample.clamp(-1., 1.)
        } else {
            pred_original_sample
        };

        // sigma_t, formula (16)
        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.).sqrt() * model_output;
        let prev_sample = alpha_prod_t_prev.sqrt() * &pred_original_sample + pred_sample_direction;
        let prev_sample = if self.config.eta > 0. {
            let noise = noise_gen.randn_like(&prev_sample);
            prev_sample + noise * std_dev_t
        } else {
            prev_sample
        };
        Ok(DDIMStepOutput { prev_sample, pred_original_sample })
    }

    /// Maps the initial `noise` to a sample, going through all the inference timesteps.
    pub fn sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        noise: &Tensor,
        condition: &Condition,
    ) -> Result<Tensor> {
        self.denoise(denoiser, noise, condition, None)
    }

    /// Same as [`DDIMSampler::sample`], also returning the predicted
    /// original sample of each step, on the CPU.
    pub fn sample_with_trajectory<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        noise: &Tensor,
        condition: &Condition,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut pred_original_samples = Vec::with_capacity(self.timesteps.len());
        let sample = self.denoise(denoiser, noise, condition, Some(&mut pred_original_samples))?;
        Ok((sample, pred_original_samples))
    }

    fn denoise<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        noise: &Tensor,
        condition: &Condition,
        mut trajectory: Option<&mut Vec<Tensor>>,
    ) -> Result<Tensor> {
        let batch = check_input(denoiser, noise)?;
        condition.check_batch(batch)?;
        info!(batch, steps = self.timesteps.len(), eta = self.config.eta, "ddim sampling");
        let _no_grad = tch::no_grad_guard();
        let mut noise_gen = NoiseGenerator::new(self.config.seed);
        let mut sample = noise.to_device(denoiser.device());
        for (timestep_index, &timestep) in self.timesteps.iter().enumerate() {
            debug!(timestep_index, timestep, "ddim step");
            let noise_pred = denoiser.predict_noise(&sample, timestep, condition);
            let output = self.step(&noise_pred, timestep, &sample, &mut noise_gen)?;
            if let Some(trajectory) = trajectory.as_mut() {
                trajectory.push(output.pred_original_sample.to_device(Device::Cpu));
            }
            sample = output.prev_sample;
        }
        Ok(sample)
    }
}
