use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },
    #[error("invalid schedule parameter: {0}")]
    InvalidScheduleParameter(String),
    #[error("invalid model configuration: {0}")]
    InvalidModelConfig(String),
    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("no noise tensors found in {0:?}")]
    EmptyNoiseFolder(PathBuf),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("torch error")]
    Torch(#[from] tch::TchError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Checks that `actual` has the `expected` size, returning a `ShapeMismatch` otherwise.
pub(crate) fn check_shape(expected: &[i64], actual: &[i64]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ShapeMismatch { expected: expected.to_vec(), actual: actual.to_vec() })
    }
}

pub(crate) fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0. ..=1.).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidScheduleParameter(format!("{name} must be in [0, 1], got {value}")))
    }
}
