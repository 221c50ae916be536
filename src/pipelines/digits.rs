use std::path::{Path, PathBuf};

use tch::{Device, Tensor};
use tracing::info;

use crate::models::context_unet::{ContextUnet, ContextUnetConfig};
use crate::models::{Condition, Denoiser};
use crate::schedulers::ddpm::{DDPMSampler, DDPMSamplerConfig};
use crate::schedulers::NoiseGenerator;
use crate::utils::{self, PixelRange};
use crate::Result;

#[derive(Clone, Debug)]
pub struct DigitDiffusionConfig {
    pub unet: ContextUnetConfig,
    pub sampler: DDPMSamplerConfig,
    /// Number of images generated for each class.
    pub samples_per_class: i64,
    /// Probability of dropping the class context during training.
    pub drop_prob: f64,
}

impl Default for DigitDiffusionConfig {
    fn default() -> Self {
        let sampler = DDPMSamplerConfig::default();
        let unet = ContextUnetConfig {
            in_channels: 3,
            n_feat: 256,
            n_classes: 10,
            image_size: 28,
            train_timesteps: sampler.train_timesteps,
        };
        Self { unet, sampler, samples_per_class: 100, drop_prob: 0.2 }
    }
}

impl DigitDiffusionConfig {
    pub fn build_unet<P: AsRef<Path>>(
        &self,
        unet_weights: P,
        device: Device,
    ) -> Result<ContextUnet> {
        super::build_context_unet(unet_weights, self.unet, device)
    }

    pub fn build_sampler(&self) -> Result<DDPMSampler> {
        DDPMSampler::new(self.sampler)
    }

    /// Noise-prediction loss of `unet` on a batch of labelled digits, using
    /// the sampler's schedule and dropping the context with `drop_prob`.
    pub fn training_loss(
        &self,
        unet: &ContextUnet,
        sampler: &DDPMSampler,
        images: &Tensor,
        labels: &Tensor,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        unet.training_loss(sampler.schedule(), images, labels, self.drop_prob, noise_gen)
    }

    /// Generates `samples_per_class` images for every class in a single
    /// batch, the result is ordered as `0, 1, .., 9, 0, 1, ..`.
    pub fn generate<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        sampler: &DDPMSampler,
    ) -> Result<(Tensor, Condition)> {
        let n_samples = self.samples_per_class * self.unet.n_classes;
        let condition = Condition::cycling(n_samples, self.unet.n_classes, denoiser.device());
        let images = sampler.sample(denoiser, n_samples, &condition)?;
        Ok((images, condition))
    }

    /// Generates the digits and writes one `{label}_{index:03}.png` file per
    /// image to `output_dir`, returning the written paths.
    pub fn generate_to_dir<D: Denoiser + ?Sized, P: AsRef<Path>>(
        &self,
        denoiser: &D,
        sampler: &DDPMSampler,
        output_dir: P,
    ) -> Result<Vec<PathBuf>> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)?;
        let (images, condition) = self.generate(denoiser, sampler)?;
        let labels = match &condition {
            Condition::Labels(labels) => Vec::<i64>::try_from(&labels.to_device(Device::Cpu))?,
            Condition::Unconditional => vec![],
        };
        let mut paths = Vec::with_capacity(labels.len());
        for (index, label) in labels.iter().enumerate() {
            let per_class_index = index as i64 / self.unet.n_classes + 1;
            let path = output_dir.join(format!("{label}_{per_class_index:03}.png"));
            utils::save_image(&images.get(index as i64), PixelRange::Unit, &path)?;
            paths.push(path);
        }
        info!(count = paths.len(), dir = ?output_dir, "saved digit images");
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Kind};

    struct HalfDenoiser;

    impl Denoiser for HalfDenoiser {
        fn predict_noise(&self, sample: &Tensor, _: usize, _: &Condition) -> Tensor {
            sample * 0.1
        }

        fn input_shape(&self) -> Vec<i64> {
            vec![3, 8, 8]
        }
    }

    fn small_config() -> DigitDiffusionConfig {
        let sampler = DDPMSamplerConfig { train_timesteps: 5, seed: Some(1), ..Default::default() };
        let unet = ContextUnetConfig { image_size: 8, n_classes: 3, ..Default::default() };
        DigitDiffusionConfig { unet, sampler, samples_per_class: 2, drop_prob: 0.2 }
    }

    #[test]
    fn one_file_per_sample() {
        let config = small_config();
        let sampler = config.build_sampler().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = config.generate_to_dir(&HalfDenoiser, &sampler, dir.path()).unwrap();
        assert_eq!(paths.len(), 6);
        let mut names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["0_001.png", "0_002.png", "1_001.png", "1_002.png", "2_001.png", "2_002.png"]
        );
        let image = tch::vision::image::load(&paths[0]).unwrap();
        assert_eq!(image.size(), vec![3, 8, 8]);
        assert_eq!(image.kind(), Kind::Uint8);
    }

    #[test]
    fn training_loss_uses_drop_prob() {
        let mut config = small_config();
        config.unet.n_feat = 8;
        config.unet.train_timesteps = config.sampler.train_timesteps;
        let sampler = config.build_sampler().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = ContextUnet::new(vs.root(), config.unet).unwrap();
        let images = Tensor::rand([4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 1, 2, 1]);
        let mut noise_gen = NoiseGenerator::new(Some(4));

        let loss = config.training_loss(&unet, &sampler, &images, &labels, &mut noise_gen).unwrap();
        assert_eq!(loss.size(), Vec::<i64>::new());
        assert!(loss.double_value(&[]).is_finite());

        config.drop_prob = 1.5;
        assert!(matches!(
            config.training_loss(&unet, &sampler, &images, &labels, &mut noise_gen),
            Err(crate::Error::InvalidScheduleParameter(_))
        ));
    }

    #[test]
    fn missing_weights() {
        let config = small_config();
        let err = config.build_unet("/nonexistent/model.ot", Device::Cpu).unwrap_err();
        assert!(matches!(err, crate::Error::FileNotFound(_)));
    }
}
