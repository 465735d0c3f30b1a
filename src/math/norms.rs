//! Norm computations for vectors and payloads.
//!
//! Provides L2 (Euclidean) norm and distance functions used by the
//! clipping, Krum and geometric-median defenses. Sums accumulate in `f64`
//! so large models do not lose precision.

use ndarray::{Array1, ArrayView1};

use crate::contribution::Payload;

/// L2 norm over every tensor of a payload, as if flattened.
pub fn payload_l2_norm(payload: &Payload) -> f32 {
    payload
        .values()
        .flat_map(|t| t.iter())
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as f32
}

/// Squared Euclidean distance between two vectors of equal length.
pub fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum()
}

/// Euclidean distance between two vectors of equal length.
pub fn distance(a: &Array1<f32>, b: &Array1<f32>) -> f64 {
    squared_distance(a.view(), b.view()).sqrt()
}

/// Factor that brings a vector of norm `norm` within `bound`.
///
/// Returns 1.0 for vectors already inside the bound (including the zero
/// vector); never scales up.
pub fn clip_factor(norm: f32, bound: f32) -> f32 {
    if norm > bound && norm > 0.0 {
        bound / norm
    } else {
        1.0
    }
}
