//! # Noise interpolation
//!
//! Linear and spherical interpolation between two noise tensors. Since DDIM
//! with `eta = 0` is a deterministic mapping from noise to image, decoding
//! the interpolated noises shows a smooth transition between two samples.
use tch::{Kind, Tensor};

use crate::error::{check_shape, check_unit_interval, Error, Result};

/// Below this value of `sin(theta)` spherical interpolation falls back to
/// linear interpolation.
pub const SLERP_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMode {
    Linear,
    Spherical,
}

fn lerp_unchecked(a: &Tensor, b: &Tensor, lambda: f64) -> Tensor {
    (1. - lambda) * a + lambda * b
}

fn slerp_unchecked(a: &Tensor, b: &Tensor, lambda: f64) -> Tensor {
    // Accumulated in double precision so that (anti-)parallel float inputs are detected.
    let (a64, b64) = (a.to_kind(Kind::Double), b.to_kind(Kind::Double));
    let dot = (&a64 * &b64).sum(Kind::Double).double_value(&[]);
    let norms = a64.norm().double_value(&[]) * b64.norm().double_value(&[]);
    if norms == 0. {
        return lerp_unchecked(a, b, lambda);
    }
    let theta = (dot / norms).clamp(-1., 1.).acos();
    let sin_theta = theta.sin();
    if sin_theta.abs() < SLERP_EPSILON {
        return lerp_unchecked(a, b, lambda);
    }
    let s0 = ((1. - lambda) * theta).sin() / sin_theta;
    let s1 = (lambda * theta).sin() / sin_theta;
    s0 * a + s1 * b
}

fn check_endpoints(a: &Tensor, b: &Tensor) -> Result<()> {
    check_shape(&a.size(), &b.size())
}

/// `(1 - lambda) * a + lambda * b`.
pub fn lerp(a: &Tensor, b: &Tensor, lambda: f64) -> Result<Tensor> {
    check_unit_interval("lambda", lambda)?;
    check_endpoints(a, b)?;
    Ok(lerp_unchecked(a, b, lambda))
}

/// Interpolation along the great circle going through `a` and `b`, treating
/// both tensors as single vectors.
pub fn slerp(a: &Tensor, b: &Tensor, lambda: f64) -> Result<Tensor> {
    check_unit_interval("lambda", lambda)?;
    check_endpoints(a, b)?;
    Ok(slerp_unchecked(a, b, lambda))
}

pub fn interpolate(a: &Tensor, b: &Tensor, lambda: f64, mode: InterpolationMode) -> Result<Tensor> {
    match mode {
        InterpolationMode::Linear => lerp(a, b, lambda),
        InterpolationMode::Spherical => slerp(a, b, lambda),
    }
}

/// A restartable sequence of `n_points` noises evenly spaced from `a` (first)
/// to `b` (last). Tensors are only computed when iterated over.
#[derive(Debug)]
pub struct Interpolation {
    a: Tensor,
    b: Tensor,
    mode: InterpolationMode,
    n_points: usize,
}

impl Interpolation {
    pub fn new(a: Tensor, b: Tensor, mode: InterpolationMode, n_points: usize) -> Result<Self> {
        check_endpoints(&a, &b)?;
        if n_points < 2 {
            return Err(Error::InvalidScheduleParameter(format!(
                "an interpolation needs at least two points, got {n_points}"
            )));
        }
        Ok(Self { a, b, mode, n_points })
    }

    /// Number of noises in the sequence, endpoints included. Always at least 2.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn mode(&self) -> InterpolationMode {
        self.mode
    }

    /// The interpolation fractions, from 0 to 1 included.
    pub fn lambdas(&self) -> impl Iterator<Item = f64> {
        let last = (self.n_points - 1) as f64;
        (0..self.n_points).map(move |i| i as f64 / last)
    }

    pub fn iter(&self) -> impl Iterator<Item = Tensor> + '_ {
        self.lambdas().map(move |lambda| match self.mode {
            InterpolationMode::Linear => lerp_unchecked(&self.a, &self.b, lambda),
            InterpolationMode::Spherical => slerp_unchecked(&self.a, &self.b, lambda),
        })
    }
}
