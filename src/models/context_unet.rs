//! Context-conditioned UNet
//!
//! A small UNet taking as input a noisy image, a class label, the normalized
//! diffusion timestep and a context mask, and predicting the noise that was
//! added to the image. The time and context embeddings modulate the
//! upsampling path as `cemb * h + temb`.
use tch::{nn, nn::Module, nn::ModuleT, Device, Kind, Reduction, Tensor};

use super::embeddings::EmbedFC;
use super::resnet::{ResidualConvBlock, UnetDown, UnetUp};
use super::{check_input, Condition, Denoiser};
use crate::error::{Error, Result};
use crate::schedulers::{NoiseGenerator, NoiseSchedule};

#[derive(Debug, Clone, Copy)]
pub struct ContextUnetConfig {
    pub in_channels: i64,
    /// Number of feature maps of the first layers, must be a multiple of 8.
    pub n_feat: i64,
    pub n_classes: i64,
    /// Height and width of the square images, must be a multiple of 4.
    pub image_size: i64,
    /// Number of timesteps of the schedule the model was trained with.
    pub train_timesteps: usize,
}

impl Default for ContextUnetConfig {
    fn default() -> Self {
        Self { in_channels: 3, n_feat: 256, n_classes: 10, image_size: 28, train_timesteps: 500 }
    }
}

#[derive(Debug)]
pub struct ContextUnet {
    init_conv: ResidualConvBlock,
    down1: UnetDown,
    down2: UnetDown,
    time_embed1: EmbedFC,
    time_embed2: EmbedFC,
    context_embed1: EmbedFC,
    context_embed2: EmbedFC,
    up0_conv: nn::ConvTranspose2D,
    up0_norm: nn::GroupNorm,
    up1: UnetUp,
    up2: UnetUp,
    out_conv1: nn::Conv2D,
    out_norm: nn::GroupNorm,
    out_conv2: nn::Conv2D,
    device: Device,
    pub config: ContextUnetConfig,
}

impl ContextUnet {
    pub fn new(vs: nn::Path, config: ContextUnetConfig) -> Result<Self> {
        let ContextUnetConfig { in_channels, n_feat, n_classes, image_size, train_timesteps } =
            config;
        if image_size <= 0 || image_size % 4 != 0 {
            return Err(Error::InvalidModelConfig(format!(
                "image size must be a positive multiple of 4, got {image_size}"
            )));
        }
        if n_feat <= 0 || n_feat % 8 != 0 || n_classes <= 0 || train_timesteps == 0 {
            return Err(Error::InvalidModelConfig(format!(
                "invalid unet dimensions: n_feat {n_feat}, n_classes {n_classes}, \
                 timesteps {train_timesteps}"
            )));
        }
        let init_conv = ResidualConvBlock::new(&vs / "init_conv", in_channels, n_feat, true);
        let down1 = UnetDown::new(&vs / "down1", n_feat, n_feat);
        let down2 = UnetDown::new(&vs / "down2", n_feat, 2 * n_feat);

        let time_embed1 = EmbedFC::new(&vs / "timeembed1", 1, 2 * n_feat);
        let time_embed2 = EmbedFC::new(&vs / "timeembed2", 1, n_feat);
        let context_embed1 = EmbedFC::new(&vs / "contextembed1", n_classes, 2 * n_feat);
        let context_embed2 = EmbedFC::new(&vs / "contextembed2", n_classes, n_feat);

        // The bottleneck is pooled down to a single pixel and expanded back
        // to a quarter of the image size.
        let bottleneck = image_size / 4;
        let vs_up0 = &vs / "up0";
        let up0_cfg = nn::ConvTransposeConfig { stride: bottleneck, ..Default::default() };
        let up0_conv =
            nn::conv_transpose2d(&vs_up0 / 0, 2 * n_feat, 2 * n_feat, bottleneck, up0_cfg);
        let up0_norm = nn::group_norm(&vs_up0 / 1, 8, 2 * n_feat, Default::default());

        let up1 = UnetUp::new(&vs / "up1", 4 * n_feat, n_feat);
        let up2 = UnetUp::new(&vs / "up2", 2 * n_feat, n_feat);

        let vs_out = &vs / "out";
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let out_conv1 = nn::conv2d(&vs_out / 0, 2 * n_feat, n_feat, 3, conv_cfg);
        let out_norm = nn::group_norm(&vs_out / 1, 8, n_feat, Default::default());
        let out_conv2 = nn::conv2d(&vs_out / 3, n_feat, in_channels, 3, conv_cfg);
        Ok(Self {
            init_conv,
            down1,
            down2,
            time_embed1,
            time_embed2,
            context_embed1,
            context_embed2,
            up0_conv,
            up0_norm,
            up1,
            up2,
            out_conv1,
            out_norm,
            out_conv2,
            device: vs.device(),
            config,
        })
    }

    /// Runs the network.
    ///
    /// `labels` holds int64 class labels, `timesteps` the timesteps
    /// normalized to `(0, 1]` and `context_mask` is 1 for the samples whose
    /// context should be ignored.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        labels: &Tensor,
        timesteps: &Tensor,
        context_mask: &Tensor,
        train: bool,
    ) -> Tensor {
        let n_feat = self.config.n_feat;
        let n_classes = self.config.n_classes;
        let xs = self.init_conv.forward_t(xs, train);
        let down1 = self.down1.forward_t(&xs, train);
        let down2 = self.down2.forward_t(&down1, train);
        let hidden = down2.avg_pool2d_default(self.config.image_size / 4).gelu("none");

        // Unmasked contexts enter the embedding as a negated one-hot vector,
        // masked ones as zeros.
        let context_mask = context_mask.to_kind(Kind::Float).view([-1, 1]).repeat([1, n_classes]);
        let context = labels.one_hot(n_classes).to_kind(Kind::Float) * (context_mask - 1.);
        let timesteps = timesteps.to_kind(Kind::Float);

        let cemb1 = self.context_embed1.forward(&context).view([-1, 2 * n_feat, 1, 1]);
        let temb1 = self.time_embed1.forward(&timesteps).view([-1, 2 * n_feat, 1, 1]);
        let cemb2 = self.context_embed2.forward(&context).view([-1, n_feat, 1, 1]);
        let temb2 = self.time_embed2.forward(&timesteps).view([-1, n_feat, 1, 1]);

        let up1 = hidden.apply(&self.up0_conv).apply(&self.up0_norm).relu();
        let up2 = self.up1.forward_t(&(cemb1 * up1 + temb1), &down2, train);
        let up3 = self.up2.forward_t(&(cemb2 * up2 + temb2), &down1, train);
        Tensor::cat(&[up3, xs], 1)
            .apply(&self.out_conv1)
            .apply(&self.out_norm)
            .relu()
            .apply(&self.out_conv2)
    }

    /// Normalized network time for a schedule timestep index.
    pub fn normalized_timestep(&self, timestep: usize) -> f64 {
        (timestep + 1) as f64 / self.config.train_timesteps as f64
    }

    /// Noise-prediction loss for a batch of clean images.
    ///
    /// A timestep is drawn uniformly per image, the image is noised with the
    /// forward process and the context is dropped with probability
    /// `drop_prob`. Returns the mean squared error between the added and the
    /// predicted noise.
    pub fn training_loss(
        &self,
        schedule: &NoiseSchedule,
        images: &Tensor,
        labels: &Tensor,
        drop_prob: f64,
        noise_gen: &mut NoiseGenerator,
    ) -> Result<Tensor> {
        crate::error::check_unit_interval("drop_prob", drop_prob)?;
        let batch = check_input(self, images)?;
        Condition::Labels(labels.shallow_clone()).check_batch(batch)?;
        let timesteps = noise_gen.timesteps(batch as usize, schedule.train_timesteps());
        let noise = noise_gen.randn_like(images);
        let noisy = schedule.add_noise(images, &noise, &timesteps)?;
        let normalized: Vec<f32> =
            timesteps.iter().map(|&t| self.normalized_timestep(t) as f32).collect();
        let normalized = Tensor::from_slice(&normalized).to_device(images.device());
        let context_mask = noise_gen.bernoulli(batch as usize, drop_prob, images.device())?;
        let predicted = self.forward_t(&noisy, labels, &normalized, &context_mask, true);
        Ok(predicted.mse_loss(&noise, Reduction::Mean))
    }
}

impl Denoiser for ContextUnet {
    fn predict_noise(&self, sample: &Tensor, timestep: usize, condition: &Condition) -> Tensor {
        let bsize = sample.size()[0];
        let device = sample.device();
        let timesteps =
            Tensor::full([bsize, 1], self.normalized_timestep(timestep), (Kind::Float, device));
        let (labels, context_mask) = match condition {
            Condition::Labels(labels) => {
                (labels.to_device(device), Tensor::zeros([bsize], (Kind::Float, device)))
            }
            Condition::Unconditional => (
                Tensor::zeros([bsize], (Kind::Int64, device)),
                Tensor::ones([bsize], (Kind::Float, device)),
            ),
        };
        self.forward_t(sample, &labels, &timesteps, &context_mask, false)
    }

    fn input_shape(&self) -> Vec<i64> {
        let ContextUnetConfig { in_channels, image_size, .. } = self.config;
        vec![in_channels, image_size, image_size]
    }

    fn device(&self) -> Device {
        self.device
    }
}
