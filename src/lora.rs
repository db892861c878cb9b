//! Multi-adapter LoRA application through two gather-multiplies.
//!
//! A LoRA pair decomposes a weight update into `ΔW = up · down` where
//! `down ∈ R^{R×H1}` and `up ∈ R^{H2×R}`. For a batch where row `i` uses
//! adapter `indices[i]`:
//!
//! ```text
//! tmp[i] = x[i] · down[indices[i], layer]ᵗ            (overwrite, scale 1)
//! y[i]  += scale · tmp[i] · up[indices[i], layer]ᵗ    (accumulate)
//! ```
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::adapter_weights::{AdapterWeights, WeightStorage};
use crate::bgmv::{check_dtypes, check_rows, problem, BatchedGatherMultiply, OutputMode};
use crate::config::Validation;
use crate::dtype::{expect_shape, host_vec, HalfFloat};
use crate::error::{KernelError, Result};
use crate::kernels::gather_multiply;
use crate::traits::LayeredBuffer;

/// Down/up projection buffers of a set of same-rank LoRA adapters.
///
/// `down` is `[A, L, R, H1]` and `up` is `[A, L, H2, R]`. Every adapter in
/// the set shares the rank `R`; adapters of a different rank need their own
/// pair of buffers and their own call.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraWeights {
    down: AdapterWeights,
    up: AdapterWeights,
}

impl LoraWeights {
    /// Pair a down and an up buffer.
    ///
    /// # Errors
    /// Returns [`KernelError::DimensionMismatch`] if adapter count, layer
    /// count or rank disagree, and [`KernelError::UnsupportedDtype`] if the
    /// buffers have different dtypes.
    pub fn new(down: AdapterWeights, up: AdapterWeights) -> Result<Self> {
        if down.dtype() != up.dtype() {
            return Err(KernelError::UnsupportedDtype {
                op: "lora_weights",
                expected: "matching down/up dtypes",
                actual: up.dtype(),
            });
        }
        if down.num_adapters() != up.num_adapters()
            || down.num_layers() != up.num_layers()
            || down.out_features() != up.in_features()
        {
            return Err(KernelError::DimensionMismatch {
                message: format!(
                    "lora down {:?} and up {:?} must agree on adapters, layers and rank",
                    down.dims(),
                    up.dims()
                ),
            });
        }
        Ok(Self { down, up })
    }

    /// Down projection buffer `[A, L, R, H1]`.
    #[must_use]
    pub fn down(&self) -> &AdapterWeights {
        &self.down
    }

    /// Up projection buffer `[A, L, H2, R]`.
    #[must_use]
    pub fn up(&self) -> &AdapterWeights {
        &self.up
    }

    /// Shared rank `R`, read from the up buffer.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.up.in_features()
    }

    /// Input width `H1`.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.down.in_features()
    }

    /// Output width `H2`.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.up.out_features()
    }

    /// Conventional LoRA scale `alpha / R`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self, alpha: f32) -> f32 {
        alpha / self.rank() as f32
    }

    /// Materialize `ΔW = scale · up[adapter, layer] · down[adapter, layer]`.
    ///
    /// Returns an F32 `[H2, H1]` tensor on `device`.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] for a bad adapter or layer.
    pub fn delta_weight(&self, adapter: usize, layer: usize, scale: f32, device: &Device) -> Result<Tensor> {
        let up = Tensor::from_vec(
            self.up.matrix_f32(adapter, layer)?,
            (self.out_features(), self.rank()),
            device,
        )?;
        let down = Tensor::from_vec(
            self.down.matrix_f32(adapter, layer)?,
            (self.rank(), self.in_features()),
            device,
        )?;
        Ok((up.matmul(&down)? * f64::from(scale))?)
    }

    /// Add `ΔW` of one adapter and layer to a `[H2, H1]` base weight.
    ///
    /// The result keeps `base`'s dtype.
    ///
    /// # Errors
    /// Returns an error if `base` is not `[H2, H1]` or the address is out of
    /// range.
    pub fn merge_into(&self, base: &Tensor, adapter: usize, layer: usize, scale: f32) -> Result<Tensor> {
        expect_shape(base, &[self.out_features(), self.in_features()], "base")?;
        let delta = self.delta_weight(adapter, layer, scale, base.device())?;
        Ok(base.to_dtype(DType::F32)?.add(&delta)?.to_dtype(base.dtype())?)
    }
}

/// Applies per-row LoRA updates to a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoraAdapterApplier {
    gather: BatchedGatherMultiply,
}

impl LoraAdapterApplier {
    /// Create an applier with the given bounds-checking policy.
    #[must_use]
    pub fn new(validation: Validation) -> Self {
        Self {
            gather: BatchedGatherMultiply::new(validation),
        }
    }

    /// `y[i] += scale · x[i] · down[indices[i], layer]ᵗ · up[indices[i], layer]ᵗ`.
    ///
    /// `y` is `[B, H2]`, `x` is `[B, H1]`, `indices` is `[B]`. The rank-`R`
    /// intermediate is a private scratch buffer in the storage dtype, so it
    /// never aliases `x` or `y`.
    ///
    /// # Arguments
    /// * `y` - Output rows, `[B, H2]`
    /// * `x` - Input rows, `[B, H1]`
    /// * `weights` - Down/up pair, `[A, L, R, H1]` and `[A, L, H2, R]`
    /// * `indices` - Adapter of each row, `[B]`
    /// * `layer` - Layer addressed in both buffers
    /// * `scale` - Multiplier on the low-rank update
    ///
    /// # Errors
    /// Same conditions as [`BatchedGatherMultiply::apply`]; nothing is written
    /// to `y` when an error is returned.
    pub fn apply(
        &self,
        y: &mut Tensor,
        x: &Tensor,
        weights: &LoraWeights,
        indices: &Tensor,
        layer: usize,
        scale: f32,
    ) -> Result<()> {
        check_dtypes("add_lora", y, x, weights.down.dtype())?;
        let batch = check_rows(y, x, weights.in_features(), weights.out_features())?;
        let indices = self.gather.checked_indices(indices, batch, layer, &weights.down)?;

        log::debug!(
            "add_lora: batch={batch} in={} rank={} out={} layer={layer}",
            weights.in_features(),
            weights.rank(),
            weights.out_features()
        );

        let updated = match (weights.down.storage(), weights.up.storage()) {
            (WeightStorage::F16(down), WeightStorage::F16(up)) => {
                let mut out = host_vec::<f16>(y)?;
                let x = host_vec::<f16>(x)?;
                two_stage(&mut out, &x, down, up, weights, &indices, layer, scale);
                Tensor::from_vec(out, y.dims(), y.device())?
            }
            (WeightStorage::BF16(down), WeightStorage::BF16(up)) => {
                let mut out = host_vec::<bf16>(y)?;
                let x = host_vec::<bf16>(x)?;
                two_stage(&mut out, &x, down, up, weights, &indices, layer, scale);
                Tensor::from_vec(out, y.dims(), y.device())?
            }
            _ => {
                return Err(KernelError::UnsupportedDtype {
                    op: "add_lora",
                    expected: "matching down/up dtypes",
                    actual: weights.up.dtype(),
                })
            }
        };
        *y = updated;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn two_stage<T: HalfFloat>(
    y: &mut [T],
    x: &[T],
    down: &[T],
    up: &[T],
    weights: &LoraWeights,
    indices: &[usize],
    layer: usize,
    scale: f32,
) {
    let mut tmp = vec![T::from_accum(0.0); indices.len() * weights.rank()];
    gather_multiply(
        &mut tmp,
        &problem(x, down, &weights.down, indices, layer, 1.0, OutputMode::Overwrite),
    );
    gather_multiply(
        y,
        &problem(&tmp, up, &weights.up, indices, layer, scale, OutputMode::Accumulate),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(data: &[f32], dims: (usize, usize, usize, usize)) -> anyhow::Result<AdapterWeights> {
        typed_buffer(data, dims, DType::F16)
    }

    fn typed_buffer(
        data: &[f32],
        dims: (usize, usize, usize, usize),
        dtype: DType,
    ) -> anyhow::Result<AdapterWeights> {
        let t = Tensor::from_vec(data.to_vec(), dims, &Device::Cpu)?.to_dtype(dtype)?;
        Ok(AdapterWeights::from_tensor(&t)?)
    }

    #[test]
    fn test_two_stage_scalar_example() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let down = buffer(&[2.0, 0.0], (1, 1, 1, 2))?;
        let up = buffer(&[3.0], (1, 1, 1, 1))?;
        let lora = LoraWeights::new(down, up)?;

        let x = Tensor::new(&[[1.0f32, 0.0]], &device)?.to_dtype(DType::F16)?;
        let mut y = Tensor::zeros((1, 1), DType::F16, &device)?;
        let idx = Tensor::new(&[0u32], &device)?;
        LoraAdapterApplier::default().apply(&mut y, &x, &lora, &idx, 0, 1.0)?;

        assert_eq!(y.to_dtype(DType::F32)?.to_vec2::<f32>()?, vec![vec![6.0]]);
        Ok(())
    }

    #[test]
    fn test_two_stage_scalar_example_bf16() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let down = typed_buffer(&[2.0, 0.0], (1, 1, 1, 2), DType::BF16)?;
        let up = typed_buffer(&[3.0], (1, 1, 1, 1), DType::BF16)?;
        let lora = LoraWeights::new(down, up)?;

        let x = Tensor::new(&[[1.0f32, 0.0]], &device)?.to_dtype(DType::BF16)?;
        let mut y = Tensor::zeros((1, 1), DType::BF16, &device)?;
        let idx = Tensor::new(&[0u32], &device)?;
        LoraAdapterApplier::default().apply(&mut y, &x, &lora, &idx, 0, 1.0)?;

        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(y.to_dtype(DType::F32)?.to_vec2::<f32>()?, vec![vec![6.0]]);

        let x = x.to_dtype(DType::F16)?;
        assert!(matches!(
            LoraAdapterApplier::default().apply(&mut y, &x, &lora, &idx, 0, 1.0),
            Err(KernelError::UnsupportedDtype { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_rank_mismatch_rejected() -> anyhow::Result<()> {
        let down = buffer(&[0.0; 4], (1, 1, 2, 2))?;
        let up = buffer(&[0.0; 3], (1, 1, 1, 3))?;
        assert!(matches!(
            LoraWeights::new(down, up),
            Err(KernelError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_scaling_and_accessors() -> anyhow::Result<()> {
        let down = buffer(&[0.0; 24], (2, 1, 4, 3))?;
        let up = buffer(&[0.0; 40], (2, 1, 5, 4))?;
        let lora = LoraWeights::new(down, up)?;
        assert_eq!(lora.rank(), 4);
        assert_eq!(lora.in_features(), 3);
        assert_eq!(lora.out_features(), 5);
        assert!((lora.scaling(16.0) - 4.0).abs() < f32::EPSILON);
        Ok(())
    }

    #[test]
    fn test_delta_weight_matches_applier() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // A=2, L=1, H1=3, R=2, H2=2
        let down = buffer(&[1.0, 0.0, -1.0, 0.5, 2.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0], (2, 1, 2, 3))?;
        let up = buffer(&[1.0, 2.0, 0.0, -1.0, 0.5, 0.5, 1.0, 0.0], (2, 1, 2, 2))?;
        let lora = LoraWeights::new(down, up)?;

        let xs = [[1.0f32, 2.0, 3.0], [-1.0, 0.5, 2.0]];
        let x = Tensor::new(&xs, &device)?.to_dtype(DType::F16)?;
        let mut y = Tensor::zeros((2, 2), DType::F16, &device)?;
        let idx = Tensor::new(&[1u32, 0], &device)?;
        LoraAdapterApplier::default().apply(&mut y, &x, &lora, &idx, 0, 0.5)?;
        let got = y.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        for (row, adapter) in [(0usize, 1usize), (1, 0)] {
            let delta = lora.delta_weight(adapter, 0, 0.5, &device)?;
            let xr = Tensor::new(&xs[row], &device)?.unsqueeze(1)?;
            let expected = delta.matmul(&xr)?.flatten_all()?.to_vec1::<f32>()?;
            for (g, e) in got[row].iter().zip(&expected) {
                assert!((g - e).abs() < 1e-2, "row {row}: {g} vs {e}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_merge_into_keeps_dtype() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let down = buffer(&[1.0, 1.0], (1, 1, 1, 2))?;
        let up = buffer(&[2.0, 3.0], (1, 1, 2, 1))?;
        let lora = LoraWeights::new(down, up)?;

        let base = Tensor::ones((2, 2), DType::F16, &device)?;
        let merged = lora.merge_into(&base, 0, 0, 1.0)?;
        assert_eq!(merged.dtype(), DType::F16);
        assert_eq!(
            merged.to_dtype(DType::F32)?.to_vec2::<f32>()?,
            vec![vec![3.0, 3.0], vec![4.0, 4.0]]
        );
        assert!(lora.merge_into(&base, 1, 0, 1.0).is_err());
        Ok(())
    }
}
