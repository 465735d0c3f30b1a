//! Error types for qora-defense

use thiserror::Error;

/// All possible errors raised while configuring or running a defense.
#[derive(Error, Debug)]
pub enum DefenseError {
    /// Unknown defense identifier, or a parameter outside its valid domain
    #[error("Configuration error: {0}")]
    Config(String),

    /// `defend` was called while enabled but no strategy is bound
    #[error("Defense is enabled but no strategy is bound")]
    Uninitialized,

    /// A tensor disagrees in shape with its peers in the same batch
    #[error("Shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape of the reference payload
        expected: Vec<usize>,
        /// Shape found in the offending payload
        actual: Vec<usize>,
    },

    /// Payloads in a batch carry different parameter names
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    /// No contributions were provided
    #[error("Empty batch provided")]
    EmptyBatch,

    /// A contribution weight is negative or not finite
    #[error("Invalid weight {weight} for contribution {index}")]
    InvalidWeight {
        /// Position in the batch
        index: usize,
        /// Offending weight
        weight: f32,
    },

    /// A tensor holds NaN or an infinity
    #[error("Non-finite value in `{name}` of contribution {index}")]
    NonFiniteValue {
        /// Position in the batch
        index: usize,
        /// Parameter name
        name: String,
    },

    /// All contribution weights are zero
    #[error("Total contribution weight is zero")]
    ZeroTotalWeight,

    /// Array shape error
    #[error("Array shape error: {0}")]
    Shape(String),

    /// Settings could not be loaded
    #[error("Settings loading failed: {0}")]
    Settings(#[from] config::ConfigError),

    /// The tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl DefenseError {
    /// Whether this error stems from configuration rather than client data.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DefenseError::Config(_) | DefenseError::Settings(_))
    }

    /// Whether this error signals inconsistent tensor shapes in a batch.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(
            self,
            DefenseError::ShapeMismatch { .. }
                | DefenseError::LayoutMismatch(_)
                | DefenseError::Shape(_)
        )
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DefenseError::Config(msg.into())
    }
}

impl From<ndarray::ShapeError> for DefenseError {
    fn from(e: ndarray::ShapeError) -> Self {
        DefenseError::Shape(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DefenseError::config("bad").is_configuration());
        assert!(!DefenseError::Uninitialized.is_configuration());
        assert!(DefenseError::LayoutMismatch("x".into()).is_shape_mismatch());
        assert!(DefenseError::ShapeMismatch {
            name: "w".into(),
            expected: vec![2],
            actual: vec![3],
        }
        .is_shape_mismatch());
        let nan = DefenseError::NonFiniteValue {
            index: 0,
            name: "w".into(),
        };
        assert!(!nan.is_configuration() && !nan.is_shape_mismatch());
    }

    #[test]
    fn test_display() {
        let err = DefenseError::ShapeMismatch {
            name: "fc.weight".into(),
            expected: vec![2, 2],
            actual: vec![2, 3],
        };
        assert_eq!(
            err.to_string(),
            "Shape mismatch for `fc.weight`: expected [2, 2], got [2, 3]"
        );
        assert_eq!(
            DefenseError::config("unknown defense `foo`").to_string(),
            "Configuration error: unknown defense `foo`"
        );
    }
}
