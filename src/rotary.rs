//! Rotary position encoding (interleaved-pair layout).
//!
//! Consecutive coordinates `(x[2i], x[2i+1])` of a head vector are treated as
//! a 2-D point and rotated by `θ(p, i) = p · theta^(-2i/D)`. The same rotation
//! is applied to queries and keys, so attention scores depend only on the
//! relative distance between positions.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Tensor};
use half::f16;

use crate::error::{KernelError, Result};

/// Stateless rotary encoder for one head dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEncoder {
    head_dim: usize,
    inv_freq: Vec<f32>,
}

impl RotaryEncoder {
    /// Create an encoder for vectors of dimension `head_dim`.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidConfig`] if `head_dim` is zero or odd,
    /// or `theta` is not positive and finite.
    pub fn new(head_dim: usize, theta: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(KernelError::InvalidConfig(format!(
                "rotary head_dim must be even and > 0, got {head_dim}"
            )));
        }
        if !theta.is_finite() || theta <= 0.0 {
            return Err(KernelError::InvalidConfig(format!(
                "rotary theta must be positive and finite, got {theta}"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let inv_freq = (0..head_dim / 2)
            .map(|i| theta.powf(-((2 * i) as f32) / head_dim as f32))
            .collect();

        Ok(Self { head_dim, inv_freq })
    }

    /// Head dimension `D`.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotation angle for coordinate pair `pair` at `position`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn angle(&self, position: usize, pair: usize) -> f32 {
        position as f32 * self.inv_freq[pair]
    }

    /// Rotate one head vector in place.
    ///
    /// # Arguments
    /// * `x` - Head vector of length `head_dim`
    /// * `position` - Token position `p`
    ///
    /// # Errors
    /// Returns [`KernelError::DimensionMismatch`] if `x.len() != head_dim`.
    pub fn rotate_in_place(&self, x: &mut [f32], position: usize) -> Result<()> {
        if x.len() != self.head_dim {
            return Err(KernelError::DimensionMismatch {
                message: format!(
                    "rotary input length must be {}, got {}",
                    self.head_dim,
                    x.len()
                ),
            });
        }
        self.rotate_pairs(x, position);
        Ok(())
    }

    /// Rotate one head vector, returning a new vector.
    ///
    /// # Errors
    /// Returns [`KernelError::DimensionMismatch`] if `x.len() != head_dim`.
    pub fn rotate(&self, x: &[f32], position: usize) -> Result<Vec<f32>> {
        let mut out = x.to_vec();
        self.rotate_in_place(&mut out, position)?;
        Ok(out)
    }

    /// Rotate every `head_dim` chunk of a `[heads, head_dim]` row in place.
    ///
    /// # Errors
    /// Returns [`KernelError::DimensionMismatch`] if `x.len()` is not a
    /// multiple of `head_dim`.
    pub fn rotate_heads(&self, x: &mut [f32], position: usize) -> Result<()> {
        if x.len() % self.head_dim != 0 {
            return Err(KernelError::DimensionMismatch {
                message: format!(
                    "row of {} elements is not a whole number of {}-wide heads",
                    x.len(),
                    self.head_dim
                ),
            });
        }
        for head in x.chunks_exact_mut(self.head_dim) {
            self.rotate_pairs(head, position);
        }
        Ok(())
    }

    /// Rotate a `[heads, head_dim]` row of f16 values, rounding once.
    ///
    /// This is exactly the encoding stored in the KV cache.
    ///
    /// # Errors
    /// Same as [`RotaryEncoder::rotate_heads`].
    pub fn rotate_f16(&self, x: &[f16], position: usize) -> Result<Vec<f16>> {
        let mut wide: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
        self.rotate_heads(&mut wide, position)?;
        Ok(wide.into_iter().map(f16::from_f32).collect())
    }

    fn rotate_pairs(&self, x: &mut [f32], position: usize) {
        for (pair, xy) in x.chunks_exact_mut(2).enumerate() {
            let (sin, cos) = self.angle(position, pair).sin_cos();
            let (x0, x1) = (xy[0], xy[1]);
            xy[0] = x0 * cos - x1 * sin;
            xy[1] = x0 * sin + x1 * cos;
        }
    }

    /// Rotate a `[.., head_dim]` tensor at a single position.
    ///
    /// The result keeps the input dtype and device.
    ///
    /// # Errors
    /// Returns an error if the last dimension is not `head_dim`.
    pub fn rotate_tensor(&self, x: &Tensor, position: usize) -> Result<Tensor> {
        let dims = x.dims();
        if dims.last() != Some(&self.head_dim) {
            return Err(KernelError::DimensionMismatch {
                message: format!(
                    "rotary input last dim must be {}, got shape {dims:?}",
                    self.head_dim
                ),
            });
        }
        let mut data = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        self.rotate_heads(&mut data, position)?;

        Ok(Tensor::from_vec(data, dims, x.device())?.to_dtype(x.dtype())?)
    }
}
