//! Loading of defense settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables prefixed with `QORA` and separated by `__`, e.g.
//! `QORA_DEFENSE__DEFENSE_TYPE=krum`. A sample lives in `configs/defense.toml`.

use std::path::Path;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::error::DefenseError;

/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named field.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    /// `[defense]` section
    #[serde(default)]
    pub defense: DefenseSettings,
    /// `[log]` section
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads the settings from a configuration file and the environment.
    ///
    /// # Errors
    /// Fails when the file cannot be read or a value has the wrong type.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DefenseError> {
        Ok(Self::load(path)?)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("qora").separator("__"))?;
        config.try_into()
    }
}

/// How SLSGD ranks values before trimming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Trim the extreme values of each coordinate independently
    Coordinate,
    /// Trim whole contributions ranked by the sum of their coordinates
    VectorSum,
}

/// Noise distribution used by the `dp` defense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMechanism {
    /// Gaussian mechanism, (ε, δ)-DP
    Gaussian,
    /// Laplace mechanism, ε-DP
    Laplace,
}

/// Where the `dp` defense injects noise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DpMode {
    /// Noise the aggregated result
    Central,
    /// Noise each contribution before aggregation
    Local,
}

/// The `[defense]` section.
///
/// Only `enabled` and `defense_type` are read by the dispatcher; every other
/// field is read by the defenses that declare it, and ignored otherwise.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [defense]
/// enabled = true
/// defense_type = "krum"
/// byzantine_client_num = 2
/// ```
///
/// **Environment variable**
/// ```text
/// QORA_DEFENSE__BYZANTINE_CLIENT_NUM=2
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DefenseSettings {
    /// Whether a defense runs at all
    pub enabled: bool,
    /// Registry identifier, e.g. `"krum"` or `"cclip"`
    pub defense_type: Option<String>,

    /// Clipping bound τ for `norm_diff_clipping`, `weak_dp` and `dp`
    pub norm_bound: Option<f32>,

    /// Sign-agreement threshold for `robust_learning_rate`
    pub robust_threshold: Option<usize>,
    /// Server learning rate for `robust_learning_rate` (default 1.0)
    pub server_learning_rate: Option<f32>,

    /// Assumed number of Byzantine clients `f` for `krum`
    pub byzantine_client_num: Option<usize>,
    /// Number of contributions Multi-Krum averages (default 1, plain Krum)
    pub krum_param_m: Option<usize>,
    /// Expected batch size, validated against `f` at construction
    pub client_num_per_round: Option<usize>,

    /// Centered-clipping radius for `cclip`
    pub tau: Option<f32>,
    /// Contributions per bucket for `cclip`
    pub bucket_size: Option<usize>,

    /// Number of groups reduced before the geometric median (default: none)
    pub batch_num: Option<usize>,
    /// Weiszfeld iteration cap (default 100)
    pub max_iterations: Option<usize>,
    /// Weiszfeld movement tolerance (default 1e-5)
    pub tolerance: Option<f32>,

    /// Fraction trimmed from each end by `slsgd`, in `[0, 0.5)`
    pub trim_fraction: Option<f32>,
    /// Ranking used by `slsgd` (default `coordinate`)
    pub trim_policy: Option<TrimPolicy>,
    /// Blend factor with the global model for `slsgd` (default 1.0)
    pub alpha: Option<f32>,

    /// Noise standard deviation for `weak_dp`
    pub stddev: Option<f32>,
    /// Privacy budget ε for `dp`
    pub epsilon: Option<f64>,
    /// Privacy budget δ for `dp` (Gaussian mechanism)
    pub delta: Option<f64>,
    /// Noise mechanism for `dp` (default `gaussian`)
    pub mechanism: Option<NoiseMechanism>,
    /// Central or local noise for `dp` (default `central`)
    pub dp_type: Option<DpMode>,
    /// Seed for the noise source; entropy when absent
    pub seed: Option<u64>,
}

impl DefenseSettings {
    /// Settings for an enabled defense of the given type, all parameters unset.
    pub fn enabled(defense_type: &str) -> Self {
        Self {
            enabled: true,
            defense_type: Some(defense_type.to_string()),
            ..Self::default()
        }
    }
}

/// The `[log]` section.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingSettings {
    /// A comma-separated list of `tracing` filter directives
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "qora_defense=debug"
    /// ```
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_new() {
        let settings = Settings::new("configs/defense.toml").unwrap();
        assert!(settings.defense.enabled);
        assert_eq!(settings.defense.defense_type.as_deref(), Some("krum"));
        assert_eq!(settings.defense.byzantine_client_num, Some(2));
        assert_eq!(settings.log.filter, "info");
    }

    #[test]
    fn test_settings_missing_file() {
        assert!(Settings::new("configs/does-not-exist.toml").is_err());
    }

    #[test]
    fn test_defense_settings_deserialize() {
        let json = r#"{
            "enabled": true,
            "defense_type": "slsgd",
            "trim_fraction": 0.2,
            "trim_policy": "vector_sum",
            "mechanism": "laplace",
            "dp_type": "local"
        }"#;
        let settings: DefenseSettings = serde_json::from_str(json).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.trim_policy, Some(TrimPolicy::VectorSum));
        assert_eq!(settings.mechanism, Some(NoiseMechanism::Laplace));
        assert_eq!(settings.dp_type, Some(DpMode::Local));
        assert_eq!(settings.tau, None);
    }

    #[test]
    fn test_defaults_are_disabled() {
        let settings: DefenseSettings = serde_json::from_str("{}").unwrap();
        assert!(!settings.enabled);
        assert!(settings.defense_type.is_none());
        assert_eq!(LoggingSettings::default().filter, "info");
    }
}
