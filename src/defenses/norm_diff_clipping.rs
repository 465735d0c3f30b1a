//! Norm-difference clipping.
//!
//! Bounds how far any single contribution may pull the model away from the
//! previous global model, regardless of its weight, by clipping the L2 norm
//! of its difference to `norm_bound`.

use tracing::debug;

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::{clip_factor, payload, payload_l2_norm};
use crate::settings::DefenseSettings;

use super::{required, DefenseStrategy, DefenseType};

/// Clip each contribution's difference to the global model, then aggregate.
#[derive(Clone, Debug)]
pub struct NormDiffClipping {
    norm_bound: f32,
}

impl NormDiffClipping {
    /// Create the defense with clipping bound `norm_bound` (must be > 0).
    pub fn new(norm_bound: f32) -> Result<Self, DefenseError> {
        check_norm_bound(norm_bound, DefenseType::NormDiffClipping)?;
        Ok(Self { norm_bound })
    }

    /// Build from the `norm_bound` setting.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        Self::new(required(
            settings.norm_bound,
            "norm_bound",
            DefenseType::NormDiffClipping,
        )?)
    }

    /// The configured clipping bound.
    pub fn norm_bound(&self) -> f32 {
        self.norm_bound
    }
}

/// Validate a clipping bound.
pub(crate) fn check_norm_bound(bound: f32, defense: DefenseType) -> Result<(), DefenseError> {
    if bound.is_finite() && bound > 0.0 {
        Ok(())
    } else {
        Err(DefenseError::config(format!(
            "`{}` needs a positive `norm_bound`, got {}",
            defense, bound
        )))
    }
}

/// Clip `update - reference` to `bound` and return `reference + clipped`.
///
/// Differences already within the bound are returned unchanged; larger
/// ones are scaled down to exactly `bound`.
pub fn clip_towards(
    update: &Payload,
    reference: &Payload,
    bound: f32,
) -> Result<Payload, DefenseError> {
    let diff = payload::sub(update, reference)?;
    let factor = clip_factor(payload_l2_norm(&diff), bound);
    if factor == 1.0 {
        return Ok(update.clone());
    }
    payload::add(reference, &payload::scale(&diff, factor))
}

/// Clip the norm of `update` itself to `bound`.
pub fn clip_norm(update: &Payload, bound: f32) -> Payload {
    let factor = clip_factor(payload_l2_norm(update), bound);
    if factor == 1.0 {
        update.clone()
    } else {
        payload::scale(update, factor)
    }
}

/// Clip every contribution against `reference`, or by its own norm when
/// no reference is available.
pub(crate) fn clip_batch(
    batch: &[Contribution],
    reference: Option<&Payload>,
    bound: f32,
) -> Result<Vec<Contribution>, DefenseError> {
    batch
        .iter()
        .map(|c| {
            let clipped = match reference {
                Some(global) => clip_towards(&c.payload, global, bound)?,
                None => clip_norm(&c.payload, bound),
            };
            Ok(c.with_payload(clipped))
        })
        .collect()
}

impl DefenseStrategy for NormDiffClipping {
    fn defense_type(&self) -> DefenseType {
        DefenseType::NormDiffClipping
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let global = aux.require_global_model(DefenseType::NormDiffClipping.as_str())?;
        let layout = PayloadLayout::of_batch(batch)?;
        layout.check(global)?;

        let clipped = clip_batch(batch, Some(global), self.norm_bound)?;
        debug!(
            n_clients = batch.len(),
            norm_bound = self.norm_bound,
            "clipped contributions towards global model"
        );
        base.aggregate(&clipped)
    }
}
