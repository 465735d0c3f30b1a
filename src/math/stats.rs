//! Coordinate-wise robust statistics over flattened vectors.
//!
//! Each coordinate is handled independently (and in parallel), so an
//! attacker cannot corrupt the estimate by poisoning individual parameters.

use std::cmp::Ordering;

use ndarray::Array1;
use rayon::prelude::*;

/// Sign with `sign(0) == 0`.
///
/// `f32::signum` maps `0.0` to `1.0`, which would count zero coordinates as
/// agreeing with the positive direction.
pub fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn column(points: &[Array1<f32>], idx: usize) -> Vec<f32> {
    let mut values: Vec<f32> = points.iter().map(|p| p[idx]).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    values
}

/// Coordinate-wise median of equally long vectors.
///
/// Even counts average the two middle values. `points` must be non-empty.
pub fn coordinate_median(points: &[Array1<f32>]) -> Array1<f32> {
    let dim = points.first().map_or(0, |p| p.len());
    let result: Vec<f32> = (0..dim)
        .into_par_iter()
        .map(|idx| {
            let values = column(points, idx);
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        })
        .collect();
    Array1::from(result)
}

/// Coordinate-wise trimmed mean, dropping `n_trim` values from each end.
///
/// The caller guarantees `points.len() > 2 * n_trim`.
pub fn coordinate_trimmed_mean(points: &[Array1<f32>], n_trim: usize) -> Array1<f32> {
    let n = points.len();
    let dim = points.first().map_or(0, |p| p.len());
    let result: Vec<f32> = (0..dim)
        .into_par_iter()
        .map(|idx| {
            let values = column(points, idx);
            let trimmed = &values[n_trim..n - n_trim];
            trimmed.iter().sum::<f32>() / trimmed.len() as f32
        })
        .collect();
    Array1::from(result)
}
