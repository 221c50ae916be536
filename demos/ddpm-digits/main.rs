// Class-conditioned digit generation with DDPM.
//
// The weights are expected as a tch VarStore file. When starting from a
// PyTorch checkpoint, extract the state dict to a .npz file:
//
//   import numpy as np
//   import torch
//   model = torch.load("./model_99.pth")
//   weights = {k[9:]: v.numpy() for k, v in model.items() if k.startswith("nn_model.")}
//   np.savez("./unet.npz", **weights)
//
// and convert it with tensor-tools from the tch-rs repo:
//   cargo run --release --example tensor-tools cp ./unet.npz ./data/ddpm_unet.ot
use clap::Parser;
use digit_diffusion::pipelines::digits::DigitDiffusionConfig;
use digit_diffusion::schedulers::ddpm::DDPMVarianceType;
use digit_diffusion::utils;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory receiving one image per generated digit.
    #[arg(long, value_name = "DIR", default_value = "output_digits")]
    output_image_dir: String,

    /// The UNet weight file, in .ot format.
    #[arg(long, value_name = "FILE", default_value = "data/ddpm_unet.ot")]
    model_path: String,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Seed of the sampling noise.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Classifier-free guidance strength.
    #[arg(long, default_value_t = 0.)]
    guidance: f64,

    /// Number of images per class.
    #[arg(long, default_value_t = 100)]
    samples_per_class: i64,

    /// Use the posterior variance instead of beta for the added noise.
    #[arg(long)]
    small_variance: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let device = utils::device(args.cpu);
    info!(?device, "selected device");

    let mut config = DigitDiffusionConfig::default();
    config.samples_per_class = args.samples_per_class;
    config.sampler.seed = Some(args.seed);
    config.sampler.guidance_weight = args.guidance;
    if args.small_variance {
        config.sampler.variance_type = DDPMVarianceType::FixedSmall;
    }

    info!("Building the unet.");
    let unet = config.build_unet(&args.model_path, device)?;
    let sampler = config.build_sampler()?;
    let paths = config.generate_to_dir(&unet, &sampler, &args.output_image_dir)?;
    info!(count = paths.len(), dir = %args.output_image_dir, "done");
    Ok(())
}
