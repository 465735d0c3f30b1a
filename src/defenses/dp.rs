//! Differential-privacy defenses.
//!
//! Both defenses bound each contribution's influence by clipping, then mask
//! what remains with random noise. [`WeakDp`] adds a fixed Gaussian noise
//! level; [`DifferentialPrivacy`] calibrates the noise to an (ε, δ) budget.
//!
//! Noise is drawn from a seeded [`ChaCha20Rng`] so runs can be replayed.

use std::sync::{Mutex, MutexGuard};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::settings::{DefenseSettings, DpMode, NoiseMechanism};

use super::norm_diff_clipping::{check_norm_bound, clip_batch};
use super::{required, DefenseStrategy, DefenseType};

/// Standard deviation of the Gaussian mechanism for (ε, δ)-DP:
/// `sqrt(2 ln(1.25 / δ)) * sensitivity / ε`.
///
/// This classic calibration only proves (ε, δ)-DP for `ε < 1`; larger
/// budgets still get noise of this scale but without the formal guarantee.
pub fn gaussian_sigma(epsilon: f64, delta: f64, sensitivity: f64) -> f64 {
    (2.0 * (1.25 / delta).ln()).sqrt() * sensitivity / epsilon
}

/// Scale of the Laplace mechanism for ε-DP: `sensitivity / ε`.
pub fn laplace_scale(epsilon: f64, sensitivity: f64) -> f64 {
    sensitivity / epsilon
}

fn seeded_rng(seed: Option<u64>) -> ChaCha20Rng {
    match seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    }
}

// A panic while holding the lock leaves the rng in a valid state.
fn lock(rng: &Mutex<ChaCha20Rng>) -> MutexGuard<'_, ChaCha20Rng> {
    rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Add N(0, sigma²) noise to every coordinate.
fn add_gaussian_noise(
    payload: &Payload,
    sigma: f64,
    rng: &mut ChaCha20Rng,
) -> Result<Payload, DefenseError> {
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| DefenseError::config(format!("invalid noise level {}: {}", sigma, e)))?;
    Ok(payload
        .iter()
        .map(|(name, tensor)| {
            let noisy = tensor.mapv(|x| x + normal.sample(&mut *rng) as f32);
            (name.clone(), noisy)
        })
        .collect())
}

/// Add Laplace(0, scale) noise to every coordinate, sampled by inverting
/// the CDF of a uniform draw.
fn add_laplace_noise(payload: &Payload, scale: f64, rng: &mut ChaCha20Rng) -> Payload {
    payload
        .iter()
        .map(|(name, tensor)| {
            let noisy = tensor.mapv(|x| {
                let u: f64 = rng.gen::<f64>() - 0.5;
                let tail = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
                x + (-scale * u.signum() * tail.ln()) as f32
            });
            (name.clone(), noisy)
        })
        .collect()
}

/// Clipping followed by Gaussian noise of a fixed standard deviation on the
/// aggregate.
#[derive(Debug)]
pub struct WeakDp {
    norm_bound: f32,
    stddev: f32,
    rng: Mutex<ChaCha20Rng>,
}

impl WeakDp {
    /// Create the defense drawing noise from `rng`.
    pub fn new(norm_bound: f32, stddev: f32, rng: ChaCha20Rng) -> Result<Self, DefenseError> {
        check_norm_bound(norm_bound, DefenseType::WeakDp)?;
        if !(stddev.is_finite() && stddev >= 0.0) {
            return Err(DefenseError::config(format!(
                "`weak_dp` needs a non-negative `stddev`, got {}",
                stddev
            )));
        }
        Ok(Self {
            norm_bound,
            stddev,
            rng: Mutex::new(rng),
        })
    }

    /// Build from `norm_bound`, `stddev` and the optional `seed`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(
            required(settings.norm_bound, "norm_bound", DefenseType::WeakDp)?,
            required(settings.stddev, "stddev", DefenseType::WeakDp)?,
            seeded_rng(settings.seed),
        )
    }
}

impl DefenseStrategy for WeakDp {
    fn defense_type(&self) -> DefenseType {
        DefenseType::WeakDp
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let layout = PayloadLayout::of_batch(batch)?;
        let global = aux.global_model();
        if let Some(global) = global {
            layout.check(global)?;
        }

        let clipped = clip_batch(batch, global, self.norm_bound)?;
        let averaged = base.aggregate(&clipped)?;
        if self.stddev == 0.0 {
            return Ok(averaged);
        }

        debug!(n_clients = batch.len(), stddev = self.stddev, "adding weak-dp noise");
        add_gaussian_noise(&averaged, f64::from(self.stddev), &mut lock(&self.rng))
    }
}

/// Clipping with noise calibrated to a privacy budget.
#[derive(Debug)]
pub struct DifferentialPrivacy {
    epsilon: f64,
    delta: Option<f64>,
    norm_bound: f32,
    mechanism: NoiseMechanism,
    dp_type: DpMode,
    rng: Mutex<ChaCha20Rng>,
}

impl DifferentialPrivacy {
    /// Create the defense.
    ///
    /// `norm_bound` is both the clipping bound and the L2 sensitivity of a
    /// single contribution. The Gaussian mechanism needs `delta` in `(0, 1)`
    /// and only carries its formal guarantee for `epsilon < 1` (see
    /// [`gaussian_sigma`]); larger budgets are accepted with a warning.
    pub fn new(
        epsilon: f64,
        delta: Option<f64>,
        norm_bound: f32,
        mechanism: NoiseMechanism,
        dp_type: DpMode,
        rng: ChaCha20Rng,
    ) -> Result<Self, DefenseError> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(DefenseError::config(format!(
                "`dp` needs a positive `epsilon`, got {}",
                epsilon
            )));
        }
        check_norm_bound(norm_bound, DefenseType::Dp)?;
        match (mechanism, delta) {
            (NoiseMechanism::Gaussian, None) => {
                return Err(DefenseError::config(
                    "the gaussian mechanism requires the `delta` setting",
                ));
            }
            (_, Some(d)) if !(d > 0.0 && d < 1.0) => {
                return Err(DefenseError::config(format!(
                    "`delta` must be in (0, 1), got {}",
                    d
                )));
            }
            _ => {}
        }
        if mechanism == NoiseMechanism::Gaussian && epsilon >= 1.0 {
            warn!(
                epsilon,
                "gaussian calibration is only proven for epsilon < 1, the privacy guarantee does not hold"
            );
        }
        Ok(Self {
            epsilon,
            delta,
            norm_bound,
            mechanism,
            dp_type,
            rng: Mutex::new(rng),
        })
    }

    /// Build from `epsilon`, `norm_bound` and the optional `delta`,
    /// `mechanism`, `dp_type` and `seed`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(
            required(settings.epsilon, "epsilon", DefenseType::Dp)?,
            settings.delta,
            required(settings.norm_bound, "norm_bound", DefenseType::Dp)?,
            settings.mechanism.unwrap_or(NoiseMechanism::Gaussian),
            settings.dp_type.unwrap_or(DpMode::Central),
            seeded_rng(settings.seed),
        )
    }

    /// Whether the configured budget lies where the noise calibration
    /// carries a formal guarantee: always for Laplace, `epsilon < 1` for
    /// Gaussian.
    pub fn guarantee_holds(&self) -> bool {
        match self.mechanism {
            NoiseMechanism::Gaussian => self.epsilon < 1.0,
            NoiseMechanism::Laplace => true,
        }
    }

    /// Noise scale for the configured mechanism: σ for Gaussian, b for Laplace.
    pub fn noise_scale(&self) -> f64 {
        let sensitivity = f64::from(self.norm_bound);
        match (self.mechanism, self.delta) {
            (NoiseMechanism::Gaussian, Some(delta)) => {
                gaussian_sigma(self.epsilon, delta, sensitivity)
            }
            // Laplace ignores delta
            _ => laplace_scale(self.epsilon, sensitivity),
        }
    }

    fn add_noise(&self, payload: &Payload, rng: &mut ChaCha20Rng) -> Result<Payload, DefenseError> {
        let scale = self.noise_scale();
        match self.mechanism {
            NoiseMechanism::Gaussian => add_gaussian_noise(payload, scale, rng),
            NoiseMechanism::Laplace => Ok(add_laplace_noise(payload, scale, rng)),
        }
    }
}

impl DefenseStrategy for DifferentialPrivacy {
    fn defense_type(&self) -> DefenseType {
        DefenseType::Dp
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let layout = PayloadLayout::of_batch(batch)?;
        let global = aux.global_model();
        if let Some(global) = global {
            layout.check(global)?;
        }
        let clipped = clip_batch(batch, global, self.norm_bound)?;

        debug!(
            n_clients = batch.len(),
            mechanism = ?self.mechanism,
            dp_type = ?self.dp_type,
            scale = self.noise_scale(),
            "applying differential privacy"
        );
        match self.dp_type {
            DpMode::Central => {
                let averaged = base.aggregate(&clipped)?;
                self.add_noise(&averaged, &mut lock(&self.rng))
            }
            DpMode::Local => {
                let noisy = {
                    let mut rng = lock(&self.rng);
                    clipped
                        .iter()
                        .map(|c| Ok(c.with_payload(self.add_noise(&c.payload, &mut rng)?)))
                        .collect::<Result<Vec<_>, DefenseError>>()?
                };
                base.aggregate(&noisy)
            }
        }
    }
}
