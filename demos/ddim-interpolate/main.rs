// Interpolation in noise space: the first two noise tensors of the folder
// are interpolated and every intermediate noise is decoded with DDIM
// (eta = 0). The images are written side by side in a single file.
use clap::Parser;
use digit_diffusion::interpolation::InterpolationMode;
use digit_diffusion::pipelines::faces::FaceDiffusionConfig;
use digit_diffusion::utils;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the noise tensors, the first two are used.
    #[arg(long, value_name = "DIR")]
    noise_folder: String,

    /// The UNet weight file, in .ot format.
    #[arg(long, value_name = "FILE")]
    unet_model_path: String,

    /// The name of the image holding the interpolation.
    #[arg(long, value_name = "FILE", default_value = "interpolation.png")]
    output_image: String,

    /// Interpolate linearly instead of spherically.
    #[arg(long)]
    lerp: bool,

    /// Number of interpolated images, endpoints included.
    #[arg(long, default_value_t = 11)]
    n_points: usize,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 50)]
    n_steps: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let device = utils::device(args.cpu);

    let mut config = FaceDiffusionConfig::default();
    config.n_steps = args.n_steps;
    let noises = utils::load_noise_folder(&args.noise_folder)?;
    let (a, b) = match noises.as_slice() {
        [a, b, ..] => (a, b),
        _ => anyhow::bail!("{} needs at least two noise tensors", args.noise_folder),
    };
    let mode = if args.lerp { InterpolationMode::Linear } else { InterpolationMode::Spherical };

    let unet = config.build_unet(&args.unet_model_path, device)?;
    let n_points = args.n_points;
    config.interpolate_to_file(&unet, &a.tensor, &b.tensor, mode, n_points, &args.output_image)?;
    Ok(())
}
