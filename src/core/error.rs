use thiserror::Error;

/// Errors raised by the coupled NMF engine
///
/// All errors are local to a single factorisation call. None of them are
/// retried internally.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NmfError {
    /// Matrices disagree on a dimension they must share.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// The support filter removed every feature of a domain.
    #[error("Feature filter removed all features of domain '{domain}'")]
    EmptyFeatureSet { domain: String },

    /// The balance parameter could not be formed from the warm-start bases.
    #[error("Degenerate basis: balance ratio {numerator} / {denominator} is undefined")]
    DegenerateBasis { numerator: f64, denominator: f64 },

    /// A factor matrix picked up a non-finite entry during the updates.
    #[error("Non-finite values in {factor} after iteration {iteration}")]
    NumericalInstability { iteration: usize, factor: String },

    /// Input data violates the non-negative, finite requirement.
    #[error("Invalid input in {context}: {reason}")]
    InvalidInput { context: String, reason: String },

    /// A parameter is outside of its valid range.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The configuration could not be parsed.
    #[error("Could not parse configuration: {0}")]
    Config(String),
}

impl NmfError {
    /// Shortcut for `InvalidParameter`
    pub fn invalid_param(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Shortcut for `InvalidInput`
    pub fn invalid_input(context: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for NmfError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = NmfError::NumericalInstability {
            iteration: 3,
            factor: "H".to_string(),
        };
        assert_eq!(err.to_string(), "Non-finite values in H after iteration 3");

        let err = NmfError::ShapeMismatch {
            context: "observations".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(err.to_string().contains("expected 3, got 4"));
    }
}
