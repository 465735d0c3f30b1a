//! # Qora-Defense: Byzantine-robust defenses for federated aggregation
//!
//! A federated-learning server collects one [`Contribution`] per client each
//! round and reduces them to a single update. Plain averaging lets a single
//! malicious client move the result arbitrarily far; this crate sits in front
//! of the server's [`BaseAggregator`] and applies a configured defense first.
//!
//! ## Defenses
//!
//! - [`NormDiffClipping`] - Clip each update's distance to the global model
//! - [`RobustLearningRate`] - Negate the learning rate where clients disagree on sign
//! - [`Krum`] - Krum selection and Multi-Krum averaging (n >= 2f+3)
//! - [`Slsgd`] - Trimmed mean with optional blending into the global model
//! - [`GeometricMedian`] - Weiszfeld geometric median (~50% Byzantine tolerance)
//! - [`CClip`] - Bucketing followed by centered clipping
//! - [`WeakDp`], [`DifferentialPrivacy`] - Clipping plus calibrated noise
//!
//! ## High-Level API
//!
//! Use [`Defender`] to select a defense from [`DefenseSettings`], typically
//! loaded with [`Settings::new`].

#![deny(missing_docs)]

pub mod aggregation;
pub mod contribution;
pub mod defender;
pub mod defenses;
pub mod error;
pub mod logging;
pub mod math;
pub mod settings;

// Re-exports
pub use aggregation::{BaseAggregator, WeightedMean};
pub use contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
pub use defender::Defender;
pub use defenses::{
    CClip, DefenseStrategy, DefenseType, DifferentialPrivacy, GeometricMedian, Krum,
    NormDiffClipping, RobustLearningRate, Slsgd, Strategy, WeakDp,
};
pub use error::DefenseError;
pub use settings::{DefenseSettings, DpMode, NoiseMechanism, Settings, TrimPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
