//! Crate error type.
//!
//! Errors carry a process exit code so the binary can map them directly, and
//! a recoverability flag: only an unusable dataset is something the
//! composition layer handles by dropping the dataset and continuing.

use thiserror::Error;

use crate::domain::Reasons;

pub type ScaleResult<T> = Result<T, ScaleError>;

#[derive(Debug, Clone, Error)]
pub enum ScaleError {
    #[error("No reflection tables provided as input.")]
    NoReflectionTables,

    #[error("Unable to use this dataset for scaling.\n{reasons}")]
    DatasetUnusable { reasons: Reasons },

    #[error("No datasets remain usable for scaling after filtering.")]
    NoUsableDatasets,

    #[error("Experiment identifier mismatch: expected '{expected}', reflection table has [{found}].")]
    IdentifierMismatch { expected: String, found: String },

    #[error(
        "Inconsistent dataset bookkeeping: {experiments} experiments, {reflections} reflection tables, {scalers} scalers."
    )]
    CountMismatch {
        experiments: usize,
        reflections: usize,
        scalers: usize,
    },

    #[error("No admissible observations remain for scaling.")]
    NoAdmissibleObservations,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl ScaleError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NoReflectionTables | Self::InvalidInput(_) => 2,
            Self::DatasetUnusable { .. }
            | Self::NoUsableDatasets
            | Self::NoAdmissibleObservations => 3,
            Self::Io(_) | Self::Json(_) => 4,
            Self::IdentifierMismatch { .. } | Self::CountMismatch { .. } => 5,
        }
    }

    /// True only for failures the factory absorbs by removing the dataset.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DatasetUnusable { .. })
    }
}

impl From<std::io::Error> for ScaleError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for ScaleError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unusable_datasets_are_recoverable() {
        let unusable = ScaleError::DatasetUnusable {
            reasons: Reasons::default(),
        };
        assert!(unusable.is_recoverable());
        assert!(!ScaleError::NoUsableDatasets.is_recoverable());
        assert!(
            !ScaleError::CountMismatch {
                experiments: 2,
                reflections: 2,
                scalers: 1,
            }
            .is_recoverable()
        );
    }

    #[test]
    fn fatal_consistency_errors_share_internal_exit_code() {
        let mismatch = ScaleError::IdentifierMismatch {
            expected: "a".into(),
            found: "b".into(),
        };
        assert_eq!(mismatch.exit_code(), 5);
        assert_eq!(ScaleError::invalid("bad").exit_code(), 2);
    }
}
