//! Installation of a `tracing` subscriber for binaries embedding the defender.
//!
//! The library itself only emits events; nothing is printed until the host
//! process calls [`configure`] (or installs its own subscriber).

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::DefenseError;
use crate::settings::LoggingSettings;

/// Install a global fmt subscriber filtered by `settings.filter`.
///
/// # Errors
/// Fails when the filter directives do not parse or a global subscriber is
/// already installed.
pub fn configure(settings: &LoggingSettings) -> Result<(), DefenseError> {
    let filter = EnvFilter::try_new(&settings.filter)
        .map_err(|e| DefenseError::Logging(format!("invalid filter `{}`: {}", settings.filter, e)))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| DefenseError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let settings = LoggingSettings {
            filter: "qora_defense=notalevel".to_string(),
        };
        assert!(matches!(
            configure(&settings),
            Err(DefenseError::Logging(_))
        ));
    }
}
