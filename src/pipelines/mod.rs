//! # Pipelines
//!
//! Wire a denoiser, a sampler and image output together for the two
//! generation tasks: class-conditioned digits with DDPM and faces from
//! fixed noise with DDIM.

pub mod digits;
pub mod faces;

use std::path::Path;

use crate::models::context_unet::{ContextUnet, ContextUnetConfig};
use crate::Result;

/// Builds a [`ContextUnet`] and loads its weights from a `VarStore` file.
pub fn build_context_unet<P: AsRef<Path>>(
    unet_weights: P,
    config: ContextUnetConfig,
    device: tch::Device,
) -> Result<ContextUnet> {
    let unet_weights = crate::utils::ensure_exists(unet_weights)?;
    let mut vs = tch::nn::VarStore::new(device);
    let unet = ContextUnet::new(vs.root(), config)?;
    vs.load(unet_weights)?;
    Ok(unet)
}
