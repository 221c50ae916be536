use std::cell::RefCell;

use digit_diffusion::interpolation::{self, Interpolation, InterpolationMode};
use digit_diffusion::models::context_unet::{ContextUnet, ContextUnetConfig};
use digit_diffusion::models::{Condition, Denoiser};
use digit_diffusion::schedulers::ddim::{DDIMSampler, DDIMSamplerConfig};
use digit_diffusion::schedulers::ddpm::{DDPMSampler, DDPMSamplerConfig};
use digit_diffusion::schedulers::NoiseGenerator;
use digit_diffusion::Error;
use tch::{nn, Device, Kind, Tensor};

/// Records the timesteps it is queried at.
struct RecordingDenoiser {
    timesteps: RefCell<Vec<usize>>,
}

impl RecordingDenoiser {
    fn new() -> Self {
        Self { timesteps: RefCell::new(vec![]) }
    }
}

impl Denoiser for RecordingDenoiser {
    fn predict_noise(&self, sample: &Tensor, timestep: usize, _: &Condition) -> Tensor {
        self.timesteps.borrow_mut().push(timestep);
        sample * 0.2
    }

    fn input_shape(&self) -> Vec<i64> {
        vec![1, 6, 6]
    }
}

fn small_unet(vs: &nn::VarStore, train_timesteps: usize) -> ContextUnet {
    let config = ContextUnetConfig {
        in_channels: 3,
        n_feat: 8,
        n_classes: 10,
        image_size: 8,
        train_timesteps,
    };
    ContextUnet::new(vs.root(), config).unwrap()
}

fn ddim_sampler(inference_steps: usize) -> DDIMSampler {
    let config = DDIMSamplerConfig { train_timesteps: 100, ..Default::default() };
    DDIMSampler::new(inference_steps, config).unwrap()
}

#[test]
fn ddpm_visits_every_timestep_once() {
    let config = DDPMSamplerConfig { train_timesteps: 40, seed: Some(3), ..Default::default() };
    let sampler = DDPMSampler::new(config).unwrap();
    let denoiser = RecordingDenoiser::new();
    let images = sampler.sample(&denoiser, 3, &Condition::Unconditional).unwrap();
    assert_eq!(images.size(), vec![3, 1, 6, 6]);
    let visited = denoiser.timesteps.into_inner();
    assert_eq!(visited, (0..40).rev().collect::<Vec<_>>());
}

#[test]
fn ddpm_from_given_noise_keeps_shape() {
    let sampler = DDPMSampler::new(DDPMSamplerConfig { train_timesteps: 15, ..Default::default() })
        .unwrap();
    let denoiser = RecordingDenoiser::new();
    let noise = Tensor::randn([5, 1, 6, 6], (Kind::Float, Device::Cpu));
    let mut noise_gen = NoiseGenerator::new(Some(11));
    let out = sampler
        .sample_from(&denoiser, noise.shallow_clone(), &Condition::Unconditional, &mut noise_gen)
        .unwrap();
    assert_eq!(out.size(), noise.size());
    assert_eq!(denoiser.timesteps.borrow().len(), 15);
}

#[test]
fn ddpm_guidance_queries_unconditional_branch() {
    let config = DDPMSamplerConfig {
        train_timesteps: 10,
        guidance_weight: 2.,
        seed: Some(0),
        ..Default::default()
    };
    let sampler = DDPMSampler::new(config).unwrap();
    let denoiser = RecordingDenoiser::new();
    let condition = Condition::labels(&[4, 2], Device::Cpu);
    sampler.sample(&denoiser, 2, &condition).unwrap();
    assert_eq!(denoiser.timesteps.borrow().len(), 20);

    // Without labels there is nothing to guide.
    let denoiser = RecordingDenoiser::new();
    sampler.sample(&denoiser, 2, &Condition::Unconditional).unwrap();
    assert_eq!(denoiser.timesteps.borrow().len(), 10);
}

/// Predicts a constant noise that depends only on the kind of condition.
struct ConstantDenoiser {
    conditional: f64,
    unconditional: f64,
}

impl Denoiser for ConstantDenoiser {
    fn predict_noise(&self, sample: &Tensor, _: usize, condition: &Condition) -> Tensor {
        let value = match condition {
            Condition::Labels(_) => self.conditional,
            Condition::Unconditional => self.unconditional,
        };
        sample.full_like(value)
    }

    fn input_shape(&self) -> Vec<i64> {
        vec![1, 6, 6]
    }
}

#[test]
fn ddpm_guidance_mixes_predictions() {
    // A single timestep: the output is the posterior mean, no noise is added.
    let config = DDPMSamplerConfig {
        beta_start: 0.1,
        beta_end: 0.2,
        train_timesteps: 1,
        guidance_weight: 2.,
        seed: Some(0),
        ..Default::default()
    };
    let sampler = DDPMSampler::new(config).unwrap();
    let denoiser = ConstantDenoiser { conditional: 1., unconditional: -1. };
    let noise = Tensor::full([2, 1, 6, 6], 0.5, (Kind::Float, Device::Cpu));
    let condition = Condition::labels(&[3, 7], Device::Cpu);
    let mut noise_gen = NoiseGenerator::new(Some(0));
    let out = sampler.sample_from(&denoiser, noise, &condition, &mut noise_gen).unwrap();

    let schedule = sampler.schedule();
    let (alpha, beta, alpha_bar) =
        (schedule.alphas()[0], schedule.betas()[0], schedule.alphas_cumprod()[0]);
    let (w, c, u) = (2., 1., -1.);
    let eps = (1. + w) * c - w * u;
    let expected = (0.5 - beta / (1. - alpha_bar).sqrt() * eps) / alpha.sqrt();
    let expected = Tensor::full([2, 1, 6, 6], expected, (Kind::Float, Device::Cpu));
    assert!(out.allclose(&expected, 1e-5, 1e-5, false));

    // Without guidance only the conditional prediction is used.
    let sampler = DDPMSampler::new(DDPMSamplerConfig { guidance_weight: 0., ..config }).unwrap();
    let noise = Tensor::full([2, 1, 6, 6], 0.5, (Kind::Float, Device::Cpu));
    let out = sampler.sample_from(&denoiser, noise, &condition, &mut noise_gen).unwrap();
    let expected = (0.5 - beta / (1. - alpha_bar).sqrt()) / alpha.sqrt();
    assert!((out.double_value(&[1, 0, 3, 3]) - expected).abs() < 1e-5);
}

#[test]
fn ddpm_with_context_unet() {
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = small_unet(&vs, 20);
    let config = DDPMSamplerConfig {
        train_timesteps: 20,
        guidance_weight: 0.5,
        seed: Some(5),
        ..Default::default()
    };
    let sampler = DDPMSampler::new(config).unwrap();
    let condition = Condition::cycling(4, 10, Device::Cpu);
    let (images, trajectory) = sampler.sample_with_trajectory(&unet, 4, &condition).unwrap();
    assert_eq!(images.size(), vec![4, 3, 8, 8]);
    assert!(!trajectory.is_empty());
    assert!(trajectory.iter().all(|x| x.size() == vec![4, 3, 8, 8]));
    let again = sampler.sample(&unet, 4, &condition).unwrap();
    assert!(images.equal(&again));
}

#[test]
fn ddim_is_deterministic_with_context_unet() {
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = small_unet(&vs, 100);
    let sampler = ddim_sampler(10);
    let noise = NoiseGenerator::new(Some(9)).randn(&[2, 3, 8, 8], (Kind::Float, Device::Cpu));
    let a = sampler.sample(&unet, &noise, &Condition::Unconditional).unwrap();
    let b = sampler.sample(&unet, &noise, &Condition::Unconditional).unwrap();
    assert_eq!(a.size(), vec![2, 3, 8, 8]);
    assert!(a.equal(&b));
}

#[test]
fn ddim_queries_only_strided_timesteps() {
    let config = DDIMSamplerConfig { train_timesteps: 100, steps_offset: 0, ..Default::default() };
    let sampler = DDIMSampler::new(20, config).unwrap();
    let denoiser = RecordingDenoiser::new();
    let noise = Tensor::randn([1, 1, 6, 6], (Kind::Float, Device::Cpu));
    sampler.sample(&denoiser, &noise, &Condition::Unconditional).unwrap();
    let visited = denoiser.timesteps.into_inner();
    assert_eq!(visited, (0..20).rev().map(|s| s * 5).collect::<Vec<_>>());
}

#[test]
fn ddim_shape_mismatch() {
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = small_unet(&vs, 100);
    let sampler = ddim_sampler(10);
    let noise = Tensor::randn([1, 1, 8, 8], (Kind::Float, Device::Cpu));
    match sampler.sample(&unet, &noise, &Condition::Unconditional) {
        Err(Error::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, vec![1, 3, 8, 8]);
            assert_eq!(actual, vec![1, 1, 8, 8]);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn interpolated_noises_decode_smoothly() {
    let sampler = ddim_sampler(10);
    let denoiser = RecordingDenoiser::new();
    let mut noise_gen = NoiseGenerator::new(Some(21));
    let a = noise_gen.randn(&[1, 1, 6, 6], (Kind::Float, Device::Cpu));
    let b = noise_gen.randn(&[1, 1, 6, 6], (Kind::Float, Device::Cpu));
    for mode in [InterpolationMode::Linear, InterpolationMode::Spherical] {
        let path = Interpolation::new(a.shallow_clone(), b.shallow_clone(), mode, 6).unwrap();
        let images: Vec<Tensor> = path
            .iter()
            .map(|noise| sampler.sample(&denoiser, &noise, &Condition::Unconditional).unwrap())
            .collect();
        assert_eq!(images.len(), 6);
        let endpoint = sampler.sample(&denoiser, &a, &Condition::Unconditional).unwrap();
        assert!(images[0].allclose(&endpoint, 1e-5, 1e-5, false));
    }
    let mid = interpolation::interpolate(&a, &b, 0.5, InterpolationMode::Spherical).unwrap();
    assert_eq!(mid.size(), a.size());
}
