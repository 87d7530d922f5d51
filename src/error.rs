use thiserror::Error;

/// Crate-wide result alias.
pub type TgvResult<T> = Result<T, TgvError>;

/// Precondition failures raised by the field operators and the solver.
///
/// None of these are recoverable: the algorithm is deterministic, so a
/// failing call fails the same way every time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TgvError {
    /// Fields of inconsistent spatial extent, repeat count or channel count.
    #[error("{operation}: shape mismatch (expected {expected:?}, found {found:?})")]
    ShapeMismatch {
        operation: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Projection radius must be strictly positive wherever it is evaluated.
    #[error("projection weight must be positive and finite, got {weight}")]
    DegenerateWeight { weight: f64 },

    /// A configuration value outside its admissible range.
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Input that carries no usable samples.
    #[error("empty input: {reason}")]
    EmptyInput { reason: &'static str },

    /// An NPZ entry that is present but unreadable, or a required entry
    /// that is absent.
    #[error("cannot read `{key}` from archive: {reason}")]
    Archive { key: &'static str, reason: String },
}

/// Fail with [`TgvError::ShapeMismatch`] unless both shapes are identical.
pub(crate) fn ensure_same_shape(
    operation: &'static str,
    expected: &[usize],
    found: &[usize],
) -> TgvResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(TgvError::ShapeMismatch {
            operation,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}
