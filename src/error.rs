//! Error types for multilora-rs.

use candle_core::DType;
use thiserror::Error;

/// Result type alias for multilora-rs operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors that can occur in multilora-rs operations.
///
/// Every error is raised before the call commits a mutation it can detect as
/// invalid up front. Under [`Validation::Unchecked`](crate::Validation) the
/// index checks are skipped and a bad index panics instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KernelError {
    /// Input tensors are not in a precision the kernel supports.
    #[error("unsupported dtype for {op}: expected {expected}, got {actual:?}")]
    UnsupportedDtype {
        /// Operation that rejected the tensor
        op: &'static str,
        /// Human readable description of the accepted dtypes
        expected: &'static str,
        /// Dtype that was supplied
        actual: DType,
    },

    /// A slot, position, layer or adapter index outside buffer bounds.
    #[error("{what} index {index} out of range (bound {bound})")]
    OutOfRange {
        /// Which index was out of range
        what: &'static str,
        /// Offending value
        index: i64,
        /// Exclusive upper bound
        bound: usize,
    },

    /// Tensor shape disagrees with the documented layout.
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Name of the offending tensor
        name: &'static str,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch between two related tensors or buffers.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Two requests of one decode call address the same cache slot.
    #[error("cache slot {slot} is addressed by more than one request in the same call")]
    SlotConflict {
        /// Slot named twice
        slot: usize,
    },

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing weights or configuration failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl KernelError {
    /// Build an [`KernelError::OutOfRange`] from an unsigned index.
    #[must_use]
    pub fn out_of_range(what: &'static str, index: usize, bound: usize) -> Self {
        Self::OutOfRange {
            what,
            index: i64::try_from(index).unwrap_or(i64::MAX),
            bound,
        }
    }
}
