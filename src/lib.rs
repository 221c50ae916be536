//! # Conditional diffusion sampling
//!
//! DDPM and DDIM samplers for small image diffusion models using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A linear noise schedule shared by the forward (noising) process and both samplers.
//! - Ancestral DDPM sampling with class conditioning and classifier-free guidance.
//! - DDIM sampling from explicit noise tensors with a configurable amount of stochasticity.
//! - Linear and spherical interpolation between noise tensors.
//! - A context-conditioned UNet able to load weights trained with the Python
//!   implementation.

pub mod error;
pub mod interpolation;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{Error, Result};
