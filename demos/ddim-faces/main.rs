// Face generation with DDIM from a folder of fixed noise tensors.
//
// Each noise file (.pt/.ot saved with tch, or .npy) produces one image
// named after it, e.g. noise/00.pt -> output/00.png. With the default
// eta of 0 the same noise always gives the same face.
use clap::Parser;
use digit_diffusion::pipelines::faces::FaceDiffusionConfig;
use digit_diffusion::utils;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the noise tensors.
    #[arg(long, value_name = "DIR")]
    noise_folder: String,

    /// Directory receiving the generated faces.
    #[arg(long, value_name = "DIR")]
    output_folder: String,

    /// The UNet weight file, in .ot format.
    #[arg(long, value_name = "FILE")]
    unet_model_path: String,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 50)]
    n_steps: usize,

    /// Amount of noise added at each step, 0 is deterministic.
    #[arg(long, default_value_t = 0.)]
    eta: f64,

    /// Seed of the noise added when eta is positive.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let device = utils::device(args.cpu);

    let mut config = FaceDiffusionConfig::default();
    config.n_steps = args.n_steps;
    config.sampler.eta = args.eta;
    config.sampler.seed = args.seed;

    let noises = utils::load_noise_folder(&args.noise_folder)?;
    info!(count = noises.len(), "loaded noise tensors");
    info!("Building the unet.");
    let unet = config.build_unet(&args.unet_model_path, device)?;
    let sampler = config.build_sampler()?;
    config.generate_to_dir(&unet, &sampler, &noises, &args.output_folder)?;
    Ok(())
}
