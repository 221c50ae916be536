use std::path::{Path, PathBuf};

use tch::{Device, Tensor};
use tracing::info;

use crate::interpolation::{Interpolation, InterpolationMode};
use crate::models::context_unet::{ContextUnet, ContextUnetConfig};
use crate::models::{Condition, Denoiser};
use crate::schedulers::ddim::{DDIMSampler, DDIMSamplerConfig};
use crate::utils::{self, NoiseFile, PixelRange};
use crate::Result;

#[derive(Clone, Debug)]
pub struct FaceDiffusionConfig {
    pub unet: ContextUnetConfig,
    pub sampler: DDIMSamplerConfig,
    pub n_steps: usize,
    /// Range of the generated pixels when writing images.
    pub pixel_range: PixelRange,
}

impl Default for FaceDiffusionConfig {
    fn default() -> Self {
        let sampler = DDIMSamplerConfig::default();
        // Faces are only conditioned on their initial noise.
        let unet = ContextUnetConfig {
            in_channels: 3,
            n_feat: 128,
            n_classes: 1,
            image_size: 64,
            train_timesteps: sampler.train_timesteps,
        };
        Self { unet, sampler, n_steps: 50, pixel_range: PixelRange::MinMax }
    }
}

impl FaceDiffusionConfig {
    pub fn build_unet<P: AsRef<Path>>(
        &self,
        unet_weights: P,
        device: Device,
    ) -> Result<ContextUnet> {
        super::build_context_unet(unet_weights, self.unet, device)
    }

    pub fn build_sampler(&self) -> Result<DDIMSampler> {
        DDIMSampler::new(self.n_steps, self.sampler)
    }

    /// Decodes each noise tensor and writes the result to
    /// `{output_dir}/{noise name}.png`.
    pub fn generate_to_dir<D: Denoiser + ?Sized, P: AsRef<Path>>(
        &self,
        denoiser: &D,
        sampler: &DDIMSampler,
        noises: &[NoiseFile],
        output_dir: P,
    ) -> Result<Vec<PathBuf>> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)?;
        let mut paths = Vec::with_capacity(noises.len());
        for noise in noises.iter() {
            let images = sampler.sample(denoiser, &noise.tensor, &Condition::Unconditional)?;
            for index in 0..images.size()[0] {
                let name = if index == 0 {
                    format!("{}.png", noise.name)
                } else {
                    format!("{}_{index}.png", noise.name)
                };
                let path = output_dir.join(name);
                utils::save_image(&images.get(index), self.pixel_range, &path)?;
                paths.push(path);
            }
        }
        info!(count = paths.len(), dir = ?output_dir, "saved face images");
        Ok(paths)
    }

    /// Decodes `n_points` noises interpolated between `a` and `b`, returning
    /// the `[n_points, C, H, W]` images. Sampling uses `eta = 0` so that the
    /// images only depend on the interpolated noise.
    pub fn interpolate<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        a: &Tensor,
        b: &Tensor,
        mode: InterpolationMode,
        n_points: usize,
    ) -> Result<Tensor> {
        let sampler =
            DDIMSampler::new(self.n_steps, DDIMSamplerConfig { eta: 0., ..self.sampler })?;
        let interpolation =
            Interpolation::new(a.shallow_clone(), b.shallow_clone(), mode, n_points)?;
        let images = interpolation
            .iter()
            .map(|noise| sampler.sample(denoiser, &noise, &Condition::Unconditional))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&images, 0))
    }

    /// Same as [`FaceDiffusionConfig::interpolate`], writing the images as a single row.
    pub fn interpolate_to_file<D: Denoiser + ?Sized, P: AsRef<Path>>(
        &self,
        denoiser: &D,
        a: &Tensor,
        b: &Tensor,
        mode: InterpolationMode,
        n_points: usize,
        output_image: P,
    ) -> Result<Tensor> {
        let images = self.interpolate(denoiser, a, b, mode, n_points)?;
        let images = utils::to_pixels(&images, self.pixel_range);
        let grid = utils::make_grid(&images, n_points as i64, 2)?;
        tch::vision::image::save(&grid, output_image.as_ref())?;
        info!(n_points, ?mode, path = ?output_image.as_ref(), "saved interpolation");
        Ok(images)
    }
}
