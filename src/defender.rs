//! Defense dispatcher.
//!
//! The [`Defender`] is built once from [`DefenseSettings`] and sits between
//! the collected client contributions and the base aggregator. When disabled
//! it passes every batch straight through; when enabled it hands the batch to
//! the configured [`Strategy`].
//!
//! # Example
//!
//! ```rust
//! use qora_defense::{AuxiliaryInfo, Contribution, Defender, DefenseSettings, Payload, WeightedMean};
//! use ndarray::array;
//!
//! let settings = DefenseSettings {
//!     byzantine_client_num: Some(1),
//!     ..DefenseSettings::enabled("krum")
//! };
//! let defender = Defender::new(&settings).unwrap();
//!
//! let batch: Vec<Contribution> = [1.0, 1.1, 0.9, 1.0, 100.0]
//!     .iter()
//!     .map(|&v| {
//!         let mut payload = Payload::new();
//!         payload.insert("w".to_string(), array![v].into_dyn());
//!         Contribution::new(1.0, payload)
//!     })
//!     .collect();
//!
//! let result = defender.defend(&batch, &WeightedMean, &AuxiliaryInfo::none()).unwrap();
//! assert!(result["w"][[0]] < 2.0);
//! ```

use tracing::{debug, info};

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload};
use crate::defenses::{DefenseStrategy, DefenseType, Strategy};
use crate::error::DefenseError;
use crate::settings::DefenseSettings;

/// Dispatches aggregation through the configured defense, if any.
#[derive(Debug, Default)]
pub struct Defender {
    enabled: bool,
    defense_type: Option<DefenseType>,
    strategy: Option<Strategy>,
}

impl Defender {
    /// Build a defender from `settings`.
    pub fn new(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        let mut defender = Self::disabled();
        defender.init(settings)?;
        Ok(defender)
    }

    /// A defender that always passes batches through to the base aggregator.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reconfigure from `settings`, replacing all prior state.
    ///
    /// If the settings enable a defense that cannot be built, the defender
    /// stays enabled without a strategy and every [`defend`](Self::defend)
    /// call fails until a successful `init`.
    pub fn init(&mut self, settings: &DefenseSettings) -> Result<(), DefenseError> {
        self.enabled = settings.enabled;
        self.defense_type = None;
        self.strategy = None;

        if !settings.enabled {
            info!("defense disabled, aggregating without protection");
            return Ok(());
        }

        let defense_type: DefenseType = settings
            .defense_type
            .as_deref()
            .ok_or_else(|| {
                DefenseError::config("defense is enabled but `defense_type` is not set")
            })?
            .parse()?;
        self.defense_type = Some(defense_type);
        self.strategy = Some(Strategy::from_settings(defense_type, settings)?);

        info!(defense_type = %defense_type, "defense initialized");
        Ok(())
    }

    /// Whether batches are routed through a defense.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Identifier requested by the last `init`, even if building it failed.
    pub fn defense_type(&self) -> Option<DefenseType> {
        self.defense_type
    }

    /// Identifier of the bound defense, if one is bound.
    pub fn active_strategy_name(&self) -> Option<&str> {
        self.strategy.as_ref().map(|s| s.defense_type().as_str())
    }

    /// Aggregate `batch` through the configured defense.
    ///
    /// Disabled defenders return `base.aggregate(batch)` unchanged.
    pub fn defend(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        if !self.enabled {
            return base.aggregate(batch);
        }
        let strategy = self.strategy.as_ref().ok_or(DefenseError::Uninitialized)?;
        debug!(
            defense_type = %strategy.defense_type(),
            n_clients = batch.len(),
            round = ?aux.round(),
            "running defense"
        );
        strategy.run(batch, base, aux)
    }
}
