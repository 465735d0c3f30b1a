//! Byzantine-robust defenses for federated learning aggregation.
//!
//! Each defense intercepts the batch of contributions on its way to the base
//! aggregator and filters, reweights or replaces the naive average:
//!
//! | Identifier | Defense | Needs global model |
//! |------------|---------|--------------------|
//! | `norm_diff_clipping` | [`NormDiffClipping`] | yes |
//! | `robust_learning_rate` | [`RobustLearningRate`] | no |
//! | `krum` | [`Krum`] (and Multi-Krum) | no |
//! | `slsgd` | [`Slsgd`] | when `alpha < 1` |
//! | `geometric_median` | [`GeometricMedian`] | no |
//! | `cclip` | [`CClip`] | optional reference |
//! | `weak_dp` | [`WeakDp`] | optional reference |
//! | `dp` | [`DifferentialPrivacy`] | optional reference |
//!
//! Parameters are validated when a defense is built, so a misconfigured round
//! fails before any client data is touched.

pub mod cclip;
pub mod dp;
pub mod geometric_median;
pub mod krum;
pub mod norm_diff_clipping;
pub mod robust_learning_rate;
pub mod slsgd;

pub use cclip::CClip;
pub use dp::{DifferentialPrivacy, WeakDp};
pub use geometric_median::GeometricMedian;
pub use krum::Krum;
pub use norm_diff_clipping::NormDiffClipping;
pub use robust_learning_rate::RobustLearningRate;
pub use slsgd::Slsgd;

use std::fmt;
use std::str::FromStr;

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload};
use crate::error::DefenseError;
use crate::settings::DefenseSettings;

/// One robust-aggregation algorithm over a batch of contributions.
pub trait DefenseStrategy: Send + Sync {
    /// Registry identifier of the defense.
    fn defense_type(&self) -> DefenseType;

    /// Combine `batch` into one update, possibly calling `base` on a
    /// filtered or reweighted subset.
    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError>;
}

/// Registry of defense identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DefenseType {
    /// `norm_diff_clipping`
    NormDiffClipping,
    /// `robust_learning_rate`
    RobustLearningRate,
    /// `krum`
    Krum,
    /// `slsgd`
    Slsgd,
    /// `geometric_median`
    GeometricMedian,
    /// `cclip`
    CClip,
    /// `weak_dp`
    WeakDp,
    /// `dp`
    Dp,
}

impl DefenseType {
    /// Every registered identifier.
    pub const ALL: [DefenseType; 8] = [
        DefenseType::NormDiffClipping,
        DefenseType::RobustLearningRate,
        DefenseType::Krum,
        DefenseType::Slsgd,
        DefenseType::GeometricMedian,
        DefenseType::CClip,
        DefenseType::WeakDp,
        DefenseType::Dp,
    ];

    /// The identifier used in settings.
    pub fn as_str(self) -> &'static str {
        match self {
            DefenseType::NormDiffClipping => "norm_diff_clipping",
            DefenseType::RobustLearningRate => "robust_learning_rate",
            DefenseType::Krum => "krum",
            DefenseType::Slsgd => "slsgd",
            DefenseType::GeometricMedian => "geometric_median",
            DefenseType::CClip => "cclip",
            DefenseType::WeakDp => "weak_dp",
            DefenseType::Dp => "dp",
        }
    }
}

impl fmt::Display for DefenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefenseType {
    type Err = DefenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        DefenseType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DefenseError::config(format!("unknown defense type `{}`", s)))
    }
}

/// A configured defense, resolved once from settings.
#[derive(Debug)]
pub enum Strategy {
    /// See [`NormDiffClipping`]
    NormDiffClipping(NormDiffClipping),
    /// See [`RobustLearningRate`]
    RobustLearningRate(RobustLearningRate),
    /// See [`Krum`]
    Krum(Krum),
    /// See [`Slsgd`]
    Slsgd(Slsgd),
    /// See [`GeometricMedian`]
    GeometricMedian(GeometricMedian),
    /// See [`CClip`]
    CClip(CClip),
    /// See [`WeakDp`]
    WeakDp(WeakDp),
    /// See [`DifferentialPrivacy`]
    Dp(DifferentialPrivacy),
}

impl Strategy {
    /// Build the defense named by `defense_type` from `settings`.
    pub fn from_settings(
        defense_type: DefenseType,
        settings: &DefenseSettings,
    ) -> Result<Self, DefenseError> {
        Ok(match defense_type {
            DefenseType::NormDiffClipping => {
                Strategy::NormDiffClipping(NormDiffClipping::from_settings(settings)?)
            }
            DefenseType::RobustLearningRate => {
                Strategy::RobustLearningRate(RobustLearningRate::from_settings(settings)?)
            }
            DefenseType::Krum => Strategy::Krum(Krum::from_settings(settings)?),
            DefenseType::Slsgd => Strategy::Slsgd(Slsgd::from_settings(settings)?),
            DefenseType::GeometricMedian => {
                Strategy::GeometricMedian(GeometricMedian::from_settings(settings)?)
            }
            DefenseType::CClip => Strategy::CClip(CClip::from_settings(settings)?),
            DefenseType::WeakDp => Strategy::WeakDp(WeakDp::from_settings(settings)?),
            DefenseType::Dp => Strategy::Dp(DifferentialPrivacy::from_settings(settings)?),
        })
    }

    fn inner(&self) -> &dyn DefenseStrategy {
        match self {
            Strategy::NormDiffClipping(s) => s,
            Strategy::RobustLearningRate(s) => s,
            Strategy::Krum(s) => s,
            Strategy::Slsgd(s) => s,
            Strategy::GeometricMedian(s) => s,
            Strategy::CClip(s) => s,
            Strategy::WeakDp(s) => s,
            Strategy::Dp(s) => s,
        }
    }
}

impl DefenseStrategy for Strategy {
    fn defense_type(&self) -> DefenseType {
        self.inner().defense_type()
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        self.inner().run(batch, base, aux)
    }
}

/// Read a parameter the defense cannot run without.
pub(crate) fn required<T>(
    value: Option<T>,
    field: &str,
    defense: DefenseType,
) -> Result<T, DefenseError> {
    value.ok_or_else(|| {
        DefenseError::config(format!("`{}` requires the `{}` setting", defense, field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_roundtrip() {
        for t in DefenseType::ALL {
            assert_eq!(t.as_str().parse::<DefenseType>().unwrap(), t);
        }
        assert_eq!(" cclip ".parse::<DefenseType>().unwrap(), DefenseType::CClip);
    }

    #[test]
    fn test_unknown_identifier() {
        let err = "fedavg".parse::<DefenseType>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_required_setting() {
        let settings = DefenseSettings::enabled("cclip");
        let err = Strategy::from_settings(DefenseType::CClip, &settings).unwrap_err();
        assert!(err.to_string().contains("`tau`"));
    }

    #[test]
    fn test_strategy_reports_its_type() {
        let settings = DefenseSettings {
            byzantine_client_num: Some(1),
            ..DefenseSettings::enabled("krum")
        };
        let strategy = Strategy::from_settings(DefenseType::Krum, &settings).unwrap();
        assert_eq!(strategy.defense_type(), DefenseType::Krum);
    }
}
