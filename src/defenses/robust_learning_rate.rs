//! Robust learning rate (Ozdayi et al., 2021).
//!
//! Per coordinate, counts how strongly the contributions agree on the sign
//! of the update. Coordinates with at least `robust_threshold` net votes keep
//! the server learning rate; the others get it negated, which undoes the
//! direction a magnitude-heavy minority tried to push.

use tracing::debug;

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::sign;
use crate::settings::DefenseSettings;

use super::{required, DefenseStrategy, DefenseType};

/// Sign-agreement learning rate applied to the base aggregate.
#[derive(Clone, Debug)]
pub struct RobustLearningRate {
    robust_threshold: usize,
    server_learning_rate: f32,
}

impl RobustLearningRate {
    /// Create the defense.
    ///
    /// `server_learning_rate` must be positive and finite.
    pub fn new(robust_threshold: usize, server_learning_rate: f32) -> Result<Self, DefenseError> {
        if !(server_learning_rate.is_finite() && server_learning_rate > 0.0) {
            return Err(DefenseError::config(format!(
                "`robust_learning_rate` needs a positive `server_learning_rate`, got {}",
                server_learning_rate
            )));
        }
        Ok(Self {
            robust_threshold,
            server_learning_rate,
        })
    }

    /// Build from `robust_threshold` and the optional `server_learning_rate`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        let threshold = required(
            settings.robust_threshold,
            "robust_threshold",
            DefenseType::RobustLearningRate,
        )?;
        Self::new(threshold, settings.server_learning_rate.unwrap_or(1.0))
    }
}

impl DefenseStrategy for RobustLearningRate {
    fn defense_type(&self) -> DefenseType {
        DefenseType::RobustLearningRate
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        _aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        PayloadLayout::of_batch(batch)?;
        if self.robust_threshold > batch.len() {
            return Err(DefenseError::config(format!(
                "`robust_threshold` {} exceeds the batch size {}",
                self.robust_threshold,
                batch.len()
            )));
        }

        let mut averaged = base.aggregate(batch)?;
        let threshold = self.robust_threshold as f32;
        let lr = self.server_learning_rate;
        let mut flipped = 0usize;

        for (name, avg) in averaged.iter_mut() {
            let mut votes = avg.mapv(|_| 0.0f32);
            for contribution in batch {
                if let Some(tensor) = contribution.payload.get(name) {
                    votes.zip_mut_with(tensor, |v, &x| *v += sign(x));
                }
            }
            avg.zip_mut_with(&votes, |a, &v| {
                if v.abs() >= threshold {
                    *a *= lr;
                } else {
                    *a *= -lr;
                    flipped += 1;
                }
            });
        }

        debug!(
            n_clients = batch.len(),
            flipped_coordinates = flipped,
            "applied robust learning rate"
        );
        Ok(averaged)
    }
}
