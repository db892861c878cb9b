//! Batched gather matrix-vector multiply (bgmv).
//!
//! `y[i] += scale · (x[i] · W[indices[i], layer]ᵗ)` for every batch row, with
//! each row free to pick a different adapter. One call serves a batch mixing
//! any number of adapters without regrouping rows by adapter.

use candle_core::{DType, Tensor};
use half::{bf16, f16};

use crate::adapter_weights::{AdapterWeights, WeightStorage};
use crate::config::Validation;
use crate::dtype::{expect_rank, expect_shape, host_vec, index_vec, is_half, HalfFloat};
use crate::error::{KernelError, Result};
use crate::kernels::{gather_multiply, GatherProblem};
use crate::traits::LayeredBuffer;

pub use crate::kernels::OutputMode;

/// Front end of the gather-multiply kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchedGatherMultiply {
    validation: Validation,
}

impl BatchedGatherMultiply {
    /// Create a front end with the given bounds-checking policy.
    #[must_use]
    pub fn new(validation: Validation) -> Self {
        Self { validation }
    }

    /// Bounds-checking policy.
    #[must_use]
    pub fn validation(&self) -> Validation {
        self.validation
    }

    /// Apply `y (+)= scale · x · W[indices, layer]ᵗ` in place.
    ///
    /// `y` is `[B, H2]`, `x` is `[B, H1]`, `weights` is `[A, L, H2, H1]` and
    /// `indices` is `[B]`. `y` is replaced by a tensor with the same shape,
    /// dtype and device holding the updated values.
    ///
    /// # Arguments
    /// * `y` - Output rows, `[B, H2]`
    /// * `x` - Input rows, `[B, H1]`
    /// * `weights` - Stacked adapter matrices, `[A, L, H2, H1]`
    /// * `indices` - Adapter of each row, `[B]` (U8, U32 or I64)
    /// * `layer` - Layer addressed in `weights`
    /// * `scale` - Multiplier on the product
    /// * `mode` - Add into `y` or replace it
    ///
    /// # Errors
    /// - [`KernelError::UnsupportedDtype`] unless `x`, `y` and `weights`
    ///   share one of F16 / BF16
    /// - [`KernelError::ShapeMismatch`] / [`KernelError::DimensionMismatch`]
    ///   for inconsistent shapes
    /// - [`KernelError::OutOfRange`] for a bad layer, or (checked mode) a
    ///   bad adapter index
    ///
    /// Nothing is written to `y` when an error is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        y: &mut Tensor,
        x: &Tensor,
        weights: &AdapterWeights,
        indices: &Tensor,
        layer: usize,
        scale: f32,
        mode: OutputMode,
    ) -> Result<()> {
        check_dtypes("bgmv", y, x, weights.dtype())?;
        let batch = check_rows(y, x, weights.in_features(), weights.out_features())?;
        let indices = self.checked_indices(indices, batch, layer, weights)?;

        log::debug!(
            "bgmv: batch={batch} in={} out={} layer={layer} mode={mode:?}",
            weights.in_features(),
            weights.out_features()
        );

        let updated = match weights.storage() {
            WeightStorage::F16(w) => {
                let mut out = host_vec::<f16>(y)?;
                let x = host_vec::<f16>(x)?;
                gather_multiply(&mut out, &problem(&x, w, weights, &indices, layer, scale, mode));
                Tensor::from_vec(out, y.dims(), y.device())?
            }
            WeightStorage::BF16(w) => {
                let mut out = host_vec::<bf16>(y)?;
                let x = host_vec::<bf16>(x)?;
                gather_multiply(&mut out, &problem(&x, w, weights, &indices, layer, scale, mode));
                Tensor::from_vec(out, y.dims(), y.device())?
            }
        };
        *y = updated;
        Ok(())
    }

    /// Widen `indices` and, in checked mode, bounds-check them against
    /// `weights`. The layer is always checked.
    pub(crate) fn checked_indices(
        &self,
        indices: &Tensor,
        batch: usize,
        layer: usize,
        weights: &AdapterWeights,
    ) -> Result<Vec<usize>> {
        let indices = index_vec(indices, "indices")?;
        if indices.len() != batch {
            return Err(KernelError::ShapeMismatch {
                name: "indices",
                expected: vec![batch],
                actual: vec![indices.len()],
            });
        }
        weights.check_layer(layer)?;
        if self.validation.is_checked() {
            for &index in &indices {
                weights.check_adapter(index)?;
            }
        }
        Ok(indices)
    }
}

/// Build the kernel problem for one weight buffer.
pub(crate) fn problem<'a, T: HalfFloat>(
    x: &'a [T],
    w: &'a [T],
    weights: &AdapterWeights,
    indices: &'a [usize],
    layer: usize,
    scale: f32,
    mode: OutputMode,
) -> GatherProblem<'a, T> {
    GatherProblem {
        x,
        weights: w,
        indices,
        layer,
        num_layers: weights.num_layers(),
        in_features: weights.in_features(),
        out_features: weights.out_features(),
        scale,
        mode,
    }
}

/// `x`, `y` and the weight buffer must share one 16-bit dtype.
pub(crate) fn check_dtypes(op: &'static str, y: &Tensor, x: &Tensor, weights: DType) -> Result<()> {
    for dtype in [x.dtype(), y.dtype()] {
        if !is_half(dtype) {
            return Err(KernelError::UnsupportedDtype {
                op,
                expected: "f16 or bf16",
                actual: dtype,
            });
        }
        if dtype != weights {
            return Err(KernelError::UnsupportedDtype {
                op,
                expected: if weights == DType::F16 { "f16" } else { "bf16" },
                actual: dtype,
            });
        }
    }
    Ok(())
}

/// Check `x: [B, in]` and `y: [B, out]`, returning `B`.
pub(crate) fn check_rows(y: &Tensor, x: &Tensor, in_features: usize, out_features: usize) -> Result<usize> {
    let batch = expect_rank(x, 2, "x")?[0];
    expect_shape(x, &[batch, in_features], "x")?;
    expect_shape(y, &[batch, out_features], "y")?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn weights(device: &Device) -> anyhow::Result<AdapterWeights> {
        // 3 adapters, 2 layers, out=2, in=3; adapter a layer l is filled with a + 10*l.
        let data: Vec<f32> = (0..3)
            .flat_map(|a| (0..2).flat_map(move |l| std::iter::repeat((a + 10 * l) as f32).take(6)))
            .collect();
        let t = Tensor::from_vec(data, (3, 2, 2, 3), device)?.to_dtype(DType::F16)?;
        Ok(AdapterWeights::from_tensor(&t)?)
    }

    fn rows(t: &Tensor) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(t.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    #[test]
    fn test_heterogeneous_batch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = weights(&device)?;
        let x = Tensor::ones((3, 3), DType::F16, &device)?;
        let mut y = Tensor::zeros((3, 2), DType::F16, &device)?;
        let idx = Tensor::new(&[2u32, 0, 2], &device)?;

        BatchedGatherMultiply::default().apply(&mut y, &x, &w, &idx, 1, 0.5, OutputMode::Accumulate)?;

        // row sums: 3 * (a + 10) * 0.5
        assert_eq!(rows(&y)?, vec![vec![18.0, 18.0], vec![15.0, 15.0], vec![18.0, 18.0]]);
        assert_eq!(y.dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn test_bf16_batch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = weights(&device)?.to_tensor(&device)?.to_dtype(DType::BF16)?;
        let w = AdapterWeights::from_tensor(&w)?;
        assert!(matches!(w.storage(), WeightStorage::BF16(_)));

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0], [0.5, 0.5, 1.0]], &device)?.to_dtype(DType::BF16)?;
        let mut y = Tensor::ones((2, 2), DType::BF16, &device)?;
        let idx = Tensor::new(&[2u8, 1], &device)?;

        BatchedGatherMultiply::default().apply(&mut y, &x, &w, &idx, 1, 0.5, OutputMode::Accumulate)?;

        // 1 + 0.5 * (a + 10) * sum(x)
        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(rows(&y)?, vec![vec![37.0, 37.0], vec![12.0, 12.0]]);
        Ok(())
    }

    #[test]
    fn test_accumulates_into_existing_y() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = weights(&device)?;
        let x = Tensor::ones((1, 3), DType::F16, &device)?;
        let mut y = Tensor::ones((1, 2), DType::F16, &device)?;
        let idx = Tensor::new(&[1i64], &device)?;
        let bgmv = BatchedGatherMultiply::default();

        bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Accumulate)?;
        assert_eq!(rows(&y)?, vec![vec![4.0, 4.0]]);

        bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Overwrite)?;
        assert_eq!(rows(&y)?, vec![vec![3.0, 3.0]]);
        Ok(())
    }

    #[test]
    fn test_out_of_range_index_leaves_y_untouched() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = weights(&device)?;
        let x = Tensor::ones((2, 3), DType::F16, &device)?;
        let mut y = Tensor::ones((2, 2), DType::F16, &device)?;
        let bgmv = BatchedGatherMultiply::default();

        let idx = Tensor::new(&[0u32, 3], &device)?;
        assert!(matches!(
            bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Accumulate),
            Err(KernelError::OutOfRange { what: "adapter", index: 3, bound: 3 })
        ));
        let idx = Tensor::new(&[0u32, 1], &device)?;
        assert!(matches!(
            bgmv.apply(&mut y, &x, &w, &idx, 2, 1.0, OutputMode::Accumulate),
            Err(KernelError::OutOfRange { what: "layer", .. })
        ));
        assert_eq!(rows(&y)?, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_dtype_and_shape_mismatch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let w = weights(&device)?;
        let idx = Tensor::new(&[0u32], &device)?;
        let bgmv = BatchedGatherMultiply::default();

        let x = Tensor::ones((1, 3), DType::BF16, &device)?;
        let mut y = Tensor::zeros((1, 2), DType::BF16, &device)?;
        assert!(matches!(
            bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Accumulate),
            Err(KernelError::UnsupportedDtype { .. })
        ));

        let x = Tensor::ones((1, 4), DType::F16, &device)?;
        let mut y = Tensor::zeros((1, 2), DType::F16, &device)?;
        assert!(matches!(
            bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Accumulate),
            Err(KernelError::ShapeMismatch { name: "x", .. })
        ));

        let x = Tensor::ones((2, 3), DType::F16, &device)?;
        let mut y = Tensor::zeros((2, 2), DType::F16, &device)?;
        assert!(matches!(
            bgmv.apply(&mut y, &x, &w, &idx, 0, 1.0, OutputMode::Accumulate),
            Err(KernelError::ShapeMismatch { name: "indices", .. })
        ));
        Ok(())
    }

    #[test]
    #[should_panic]
    fn test_unchecked_bad_index_panics() {
        let device = Device::Cpu;
        let w = weights(&device).unwrap();
        let x = Tensor::ones((1, 3), DType::F16, &device).unwrap();
        let mut y = Tensor::zeros((1, 2), DType::F16, &device).unwrap();
        let idx = Tensor::new(&[7u32], &device).unwrap();
        let _ = BatchedGatherMultiply::new(Validation::Unchecked).apply(
            &mut y,
            &x,
            &w,
            &idx,
            0,
            1.0,
            OutputMode::Accumulate,
        );
    }
}
