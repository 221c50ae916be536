use std::path::{Path, PathBuf};

use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

/// Returns the path if it points to an existing file or directory, `FileNotFound` otherwise.
pub fn ensure_exists<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::FileNotFound(path.to_path_buf()))
    }
}

/// The accelerator if one is available and `cpu` is not set.
pub fn device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Range of the pixel values produced by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRange {
    /// Values in `[0, 1]`.
    Unit,
    /// Values in `[-1, 1]`.
    Symmetric,
    /// Each image is rescaled from its own minimum and maximum.
    MinMax,
}

/// Converts a `[C, H, W]` or `[N, C, H, W]` float tensor to uint8 pixels on the CPU.
pub fn to_pixels(images: &Tensor, range: PixelRange) -> Tensor {
    let images = images.to_device(Device::Cpu).to_kind(Kind::Float);
    let images = match range {
        PixelRange::Unit => images,
        PixelRange::Symmetric => images / 2 + 0.5,
        PixelRange::MinMax => {
            let batched = images.dim() == 4;
            let flat =
                if batched { images.flatten(1, -1) } else { images.flatten(0, -1).unsqueeze(0) };
            let min = flat.amin([1], true);
            let max = flat.amax([1], true);
            let scaled = (&flat - &min) / (max - &min).clamp_min(1e-8);
            scaled.view_as(&images)
        }
    };
    (images.clamp(0., 1.) * 255.).to_kind(Kind::Uint8)
}

/// Tiles a `[N, C, H, W]` batch into a single `[C, H', W']` image with
/// `nrow` images per row, separated by `padding` pixels.
pub fn make_grid(images: &Tensor, nrow: i64, padding: i64) -> Result<Tensor> {
    let (n, c, h, w) = images.size4()?;
    let ncol = nrow.clamp(1, n.max(1));
    let nrows = (n + ncol - 1) / ncol;
    let (cell_h, cell_w) = (h + padding, w + padding);
    let grid = Tensor::zeros(
        [c, nrows * cell_h + padding, ncol * cell_w + padding],
        (images.kind(), images.device()),
    );
    for index in 0..n {
        let (row, col) = (index / ncol, index % ncol);
        grid.narrow(1, row * cell_h + padding, h)
            .narrow(2, col * cell_w + padding, w)
            .copy_(&images.get(index));
    }
    Ok(grid)
}

/// Saves a `[C, H, W]` image, the format being deduced from the file extension.
pub fn save_image<P: AsRef<Path>>(image: &Tensor, range: PixelRange, path: P) -> Result<()> {
    tch::vision::image::save(&to_pixels(image, range), path)?;
    Ok(())
}

/// A noise tensor loaded from disk, batched as `[1, C, H, W]` when stored without batch dimension.
#[derive(Debug)]
pub struct NoiseFile {
    /// File name without extension, used to name the generated image.
    pub name: String,
    pub tensor: Tensor,
}

const NOISE_EXTENSIONS: [&str; 3] = ["pt", "ot", "npy"];

/// Loads all the noise tensors of a directory, sorted by file name. `.npy`
/// files are read as numpy arrays, `.pt` and `.ot` ones as tch serialized tensors.
pub fn load_noise_folder<P: AsRef<Path>>(dir: P) -> Result<Vec<NoiseFile>> {
    let dir = ensure_exists(dir)?;
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| NOISE_EXTENSIONS.contains(&ext))
        })
        .collect();
    if paths.is_empty() {
        return Err(Error::EmptyNoiseFolder(dir));
    }
    paths.sort();
    paths.iter().map(load_noise).collect()
}

pub fn load_noise<P: AsRef<Path>>(path: P) -> Result<NoiseFile> {
    let path = ensure_exists(path)?;
    let tensor = match path.extension().and_then(|ext| ext.to_str()) {
        Some("npy") => Tensor::read_npy(&path)?,
        _ => Tensor::load(&path)?,
    };
    let tensor = if tensor.dim() == 3 { tensor.unsqueeze(0) } else { tensor };
    let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    Ok(NoiseFile { name, tensor: tensor.to_kind(Kind::Float) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout() {
        let images = Tensor::ones([5, 3, 4, 4], (Kind::Float, Device::Cpu));
        let grid = make_grid(&images, 2, 1).unwrap();
        // 3 rows of 2 images, 4 pixels each plus padding.
        assert_eq!(grid.size(), vec![3, 3 * 5 + 1, 2 * 5 + 1]);
        assert_eq!(grid.double_value(&[0, 0, 0]), 0.);
        assert_eq!(grid.double_value(&[0, 1, 1]), 1.);
        assert_eq!(grid.sum(Kind::Double).double_value(&[]), 5. * 3. * 16.);
    }

    #[test]
    fn pixel_ranges() {
        let image = Tensor::from_slice(&[-1f32, 0., 1., 2.]).view([1, 1, 2, 2]);
        let unit =
            Vec::<u8>::try_from(&to_pixels(&image, PixelRange::Unit).flatten(0, -1)).unwrap();
        assert_eq!(unit, vec![0, 0, 255, 255]);
        let sym =
            Vec::<u8>::try_from(&to_pixels(&image, PixelRange::Symmetric).flatten(0, -1)).unwrap();
        assert_eq!(sym, vec![0, 127, 255, 255]);
        let minmax =
            Vec::<u8>::try_from(&to_pixels(&image, PixelRange::MinMax).flatten(0, -1)).unwrap();
        assert_eq!(minmax, vec![0, 85, 170, 255]);
    }

    #[test]
    fn noise_folder_is_sorted_and_batched() {
        let dir = tempfile::tempdir().unwrap();
        let a = Tensor::randn([3, 4, 4], (Kind::Float, Device::Cpu));
        let b = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        b.save(dir.path().join("01.pt")).unwrap();
        a.save(dir.path().join("00.pt")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let noises = load_noise_folder(dir.path()).unwrap();
        assert_eq!(noises.len(), 2);
        assert_eq!(noises[0].name, "00");
        assert_eq!(noises[0].tensor.size(), vec![1, 3, 4, 4]);
        assert!(noises[0].tensor.squeeze_dim(0).equal(&a));
        assert!(noises[1].tensor.equal(&b));
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_noise_folder(dir.path()), Err(Error::EmptyNoiseFolder(_))));
        let missing = dir.path().join("missing");
        assert!(matches!(load_noise_folder(&missing), Err(Error::FileNotFound(_))));
        assert!(matches!(load_noise(missing.join("00.pt")), Err(Error::FileNotFound(_))));
    }
}
