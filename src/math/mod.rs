//! Mathematical primitives for qora-defense.
//!
//! Provides shared math utilities used by the defenses:
//!
//! - [`norms`] - L2 norms, distances and clip factors
//! - [`stats`] - coordinate-wise median, trimmed mean and sign
//! - [`payload`] - element-wise arithmetic over named tensors

pub mod norms;
pub mod payload;
pub mod stats;

pub use norms::{clip_factor, distance, payload_l2_norm, squared_distance};
pub use stats::{coordinate_median, coordinate_trimmed_mean, sign};
