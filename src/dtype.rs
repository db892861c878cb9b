//! Storage element types and tensor boundary helpers.
//!
//! All kernels store 16-bit floats and accumulate in `f32`. Index tensors
//! arrive as candle tensors of any integral dtype and are widened to `usize`
//! once per call.

use candle_core::{DType, Tensor, WithDType};
use half::{bf16, f16};

use crate::error::{KernelError, Result};

/// A 16-bit storage element with an `f32` accumulator.
pub trait HalfFloat: WithDType {
    /// Widen to the accumulator type.
    fn to_accum(self) -> f32;

    /// Round an accumulator value into storage precision.
    fn from_accum(value: f32) -> Self;
}

impl HalfFloat for f16 {
    #[inline]
    fn to_accum(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_accum(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl HalfFloat for bf16 {
    #[inline]
    fn to_accum(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_accum(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

/// Whether `dtype` is one of the 16-bit float storage types.
#[must_use]
pub fn is_half(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16)
}

/// Check that `tensor` has exactly `rank` dimensions and return them.
///
/// # Errors
///
/// Returns [`KernelError::DimensionMismatch`] on a rank mismatch.
pub fn expect_rank<'a>(tensor: &'a Tensor, rank: usize, name: &str) -> Result<&'a [usize]> {
    let dims = tensor.dims();
    if dims.len() != rank {
        return Err(KernelError::DimensionMismatch {
            message: format!("{name} must be a {rank}D tensor, got shape {dims:?}"),
        });
    }
    Ok(dims)
}

/// Check that `tensor` has exactly the shape `expected`.
///
/// # Errors
///
/// Returns [`KernelError::ShapeMismatch`] otherwise.
pub fn expect_shape(tensor: &Tensor, expected: &[usize], name: &'static str) -> Result<()> {
    if tensor.dims() != expected {
        return Err(KernelError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(())
}

/// Widen a rank-1 integral index tensor into `usize` indices.
///
/// # Errors
///
/// - [`KernelError::DimensionMismatch`] if the tensor is not rank 1
/// - [`KernelError::UnsupportedDtype`] for float dtypes
/// - [`KernelError::OutOfRange`] for negative `I64` entries
pub fn index_vec(tensor: &Tensor, name: &'static str) -> Result<Vec<usize>> {
    expect_rank(tensor, 1, name)?;
    let indices = match tensor.dtype() {
        DType::U8 => tensor
            .to_vec1::<u8>()?
            .into_iter()
            .map(usize::from)
            .collect(),
        DType::U32 => tensor
            .to_vec1::<u32>()?
            .into_iter()
            .map(|v| v as usize)
            .collect(),
        DType::I64 => tensor
            .to_vec1::<i64>()?
            .into_iter()
            .map(|v| {
                usize::try_from(v).map_err(|_| KernelError::OutOfRange {
                    what: name,
                    index: v,
                    bound: usize::MAX,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(KernelError::UnsupportedDtype {
                op: name,
                expected: "an integral dtype (u8, u32, i64)",
                actual: other,
            })
        }
    };
    Ok(indices)
}

/// Flatten a tensor into its storage elements.
pub(crate) fn host_vec<T: HalfFloat>(tensor: &Tensor) -> Result<Vec<T>> {
    Ok(tensor.flatten_all()?.to_vec1::<T>()?)
}
