//! # Models
//!
//! The denoising network used in the diffusion loop. Samplers only rely on
//! the [`Denoiser`] trait; [`context_unet::ContextUnet`] is the concrete
//! class-conditioned UNet.
use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

pub mod context_unet;
pub mod embeddings;
pub mod resnet;

/// Conditioning signal passed to the denoiser alongside the noisy sample.
#[derive(Debug)]
pub enum Condition {
    /// Context is masked out.
    Unconditional,
    /// One int64 class label per batch element.
    Labels(Tensor),
}

impl Condition {
    pub fn labels(labels: &[i64], device: Device) -> Self {
        Self::Labels(Tensor::from_slice(labels).to_device(device))
    }

    /// Labels `0, 1, .., n_classes - 1, 0, 1, ..` for `n_samples` samples.
    pub fn cycling(n_samples: i64, n_classes: i64, device: Device) -> Self {
        let labels = Tensor::arange(n_samples, (Kind::Int64, device)).remainder(n_classes);
        Self::Labels(labels)
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Labels(_))
    }

    pub(crate) fn check_batch(&self, batch: i64) -> Result<()> {
        match self {
            Self::Unconditional => Ok(()),
            Self::Labels(labels) => {
                let size = labels.size();
                if size == [batch] {
                    Ok(())
                } else {
                    Err(Error::ShapeMismatch { expected: vec![batch], actual: size })
                }
            }
        }
    }
}

/// A network predicting the noise that was added to a sample.
pub trait Denoiser {
    /// Predicts the noise residual of `sample` at the given schedule
    /// timestep, the result has the same shape as `sample`.
    fn predict_noise(&self, sample: &Tensor, timestep: usize, condition: &Condition) -> Tensor;

    /// The expected shape of a single sample, without the batch dimension.
    fn input_shape(&self) -> Vec<i64>;

    fn device(&self) -> Device {
        Device::Cpu
    }
}

impl<D: Denoiser + ?Sized> Denoiser for &D {
    fn predict_noise(&self, sample: &Tensor, timestep: usize, condition: &Condition) -> Tensor {
        (**self).predict_noise(sample, timestep, condition)
    }

    fn input_shape(&self) -> Vec<i64> {
        (**self).input_shape()
    }

    fn device(&self) -> Device {
        (**self).device()
    }
}

/// Checks that `sample` is a batch of samples with the denoiser's input shape.
pub(crate) fn check_input<D: Denoiser + ?Sized>(denoiser: &D, sample: &Tensor) -> Result<i64> {
    let size = sample.size();
    let expected = denoiser.input_shape();
    match size.split_first() {
        Some((&batch, rest)) if rest == expected.as_slice() => Ok(batch),
        _ => {
            let mut expected_with_batch = vec![size.first().copied().unwrap_or(1)];
            expected_with_batch.extend(expected);
            Err(Error::ShapeMismatch { expected: expected_with_batch, actual: size })
        }
    }
}
