//! # Noise schedules and samplers
//!
//! The noise schedule is shared between the forward (noising) process used
//! during training and the reverse samplers. Samplers set the trade-off
//! between inference speed and quality: DDPM walks through every training
//! timestep while DDIM uses a strided subset of them.
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tch::{Device, Kind, Tensor};

use crate::error::{check_shape, check_unit_interval, Error, Result};

pub mod ddim;
pub mod ddpm;

/// Per-timestep diffusion coefficients for a linear beta schedule.
///
/// All three sequences have one entry per training timestep and are never
/// modified after construction.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Creates a schedule where beta is linearly spaced between `beta_start`
    /// and `beta_end` (both included) over `train_timesteps` steps.
    ///
    /// `beta_start` has to be strictly positive, the posterior variance at the
    /// first timestep being undefined otherwise.
    pub fn linear(train_timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        if train_timesteps == 0 {
            return Err(Error::InvalidScheduleParameter(
                "the number of timesteps must be positive".to_string(),
            ));
        }
        if !(0. < beta_start && beta_start < beta_end && beta_end < 1.) {
            return Err(Error::InvalidScheduleParameter(format!(
                "expected 0 < beta_start < beta_end < 1, got ({beta_start}, {beta_end})"
            )));
        }
        let betas = Tensor::linspace(
            beta_start,
            beta_end,
            train_timesteps as i64,
            (Kind::Double, Device::Cpu),
        );
        // &betas to avoid moving it
        let alphas: Tensor = 1. - &betas;
        let alphas_cumprod = Vec::<f64>::try_from(&alphas.cumprod(0, Kind::Double))?;
        Ok(Self {
            betas: Vec::<f64>::try_from(&betas)?,
            alphas: Vec::<f64>::try_from(&alphas)?,
            alphas_cumprod,
        })
    }

    pub fn train_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        self.betas.as_slice()
    }

    pub fn alphas(&self) -> &[f64] {
        self.alphas.as_slice()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        self.alphas_cumprod.as_slice()
    }

    /// The cumulative product of alphas up to the previous timestep, 1 before the first one.
    pub fn alpha_cumprod_prev(&self, timestep: usize) -> f64 {
        if timestep > 0 {
            self.alphas_cumprod[timestep - 1]
        } else {
            1.0
        }
    }

    /// Variance of the true posterior q(x_{t-1} | x_t, x_0).
    pub fn posterior_variance(&self, timestep: usize) -> f64 {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = self.alpha_cumprod_prev(timestep);
        (1. - alpha_prod_t_prev) / (1. - alpha_prod_t) * self.betas[timestep]
    }

    /// Noises a batch of clean samples, `timesteps` holding one timestep per
    /// batch element: `sqrt(alpha_bar) * x0 + sqrt(1 - alpha_bar) * noise`.
    pub fn add_noise(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timesteps: &[usize],
    ) -> Result<Tensor> {
        let size = original.size();
        check_shape(&size, &noise.size())?;
        if size.first().copied() != Some(timesteps.len() as i64) {
            return Err(Error::ShapeMismatch {
                expected: vec![timesteps.len() as i64],
                actual: size.first().map(|&b| vec![b]).unwrap_or_default(),
            });
        }
        if let Some(&t) = timesteps.iter().find(|&&t| t >= self.train_timesteps()) {
            return Err(Error::InvalidScheduleParameter(format!(
                "timestep {t} is out of range for {} training timesteps",
                self.train_timesteps()
            )));
        }
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod): (Vec<f64>, Vec<f64>) = timesteps
            .iter()
            .map(|&t| (self.alphas_cumprod[t].sqrt(), (1. - self.alphas_cumprod[t]).sqrt()))
            .unzip();
        // Broadcast the per-sample coefficients over the non-batch dimensions.
        let coeff_shape: Vec<i64> =
            std::iter::once(-1).chain(std::iter::repeat(1).take(size.len() - 1)).collect();
        let to_coeff = |values: &[f64]| {
            Tensor::from_slice(values)
                .to_kind(original.kind())
                .to_device(original.device())
                .view(coeff_shape.as_slice())
        };
        Ok(to_coeff(&sqrt_alpha_prod) * original + to_coeff(&sqrt_one_minus_alpha_prod) * noise)
    }
}

/// A seeded source of random numbers for the samplers.
///
/// Each sampling run owns its generator so that runs with the same seed
/// produce the same noise regardless of what else happened in the process.
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: ChaCha8Rng,
}

impl NoiseGenerator {
    /// Uses `seed` when provided, fresh entropy otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng }
    }

    /// Standard normal tensor of the given size.
    pub fn randn(&mut self, size: &[i64], (kind, device): (Kind, Device)) -> Tensor {
        let numel: i64 = size.iter().product();
        let values: Vec<f32> =
            (0..numel).map(|_| self.rng.sample::<f32, _>(StandardNormal)).collect();
        Tensor::from_slice(&values).view(size).to_kind(kind).to_device(device)
    }

    pub fn randn_like(&mut self, like: &Tensor) -> Tensor {
        self.randn(&like.size(), (like.kind(), like.device()))
    }

    /// `n` timesteps drawn uniformly from `[0, upper)`.
    pub fn timesteps(&mut self, n: usize, upper: usize) -> Vec<usize> {
        (0..n).map(|_| self.rng.gen_range(0..upper)).collect()
    }

    /// `n` values that are 1 with probability `p` and 0 otherwise.
    pub fn bernoulli(&mut self, n: usize, p: f64, device: Device) -> Result<Tensor> {
        check_unit_interval("p", p)?;
        let values: Vec<f32> =
            (0..n).map(|_| if self.rng.gen_bool(p) { 1. } else { 0. }).collect();
        Ok(Tensor::from_slice(&values).to_device(device))
    }
}
