//! Persistent per-adapter, per-layer weight matrices.

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::dtype::{expect_rank, host_vec, HalfFloat};
use crate::error::{KernelError, Result};
use crate::traits::LayeredBuffer;

/// Host storage of an [`AdapterWeights`] buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightStorage {
    /// IEEE half precision.
    F16(Vec<f16>),
    /// bfloat16.
    BF16(Vec<bf16>),
}

impl WeightStorage {
    fn dtype(&self) -> DType {
        match self {
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
        }
    }
}

/// Read-only weight buffer shaped `[adapters, L, out_features, in_features]`.
///
/// Loaded once when adapters are registered and shared by reference across
/// every gather-multiply call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterWeights {
    storage: WeightStorage,
    dims: [usize; 4],
}

impl AdapterWeights {
    /// Import a 4-D F16 or BF16 tensor.
    ///
    /// # Errors
    /// - [`KernelError::UnsupportedDtype`] for any other dtype
    /// - [`KernelError::DimensionMismatch`] if the tensor is not 4-D or has a
    ///   zero-sized dimension
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = expect_rank(tensor, 4, "weights")?;
        let dims = [dims[0], dims[1], dims[2], dims[3]];
        if dims.contains(&0) {
            return Err(KernelError::DimensionMismatch {
                message: format!("adapter weight dims must all be > 0, got {dims:?}"),
            });
        }
        let storage = match tensor.dtype() {
            DType::F16 => WeightStorage::F16(host_vec(tensor)?),
            DType::BF16 => WeightStorage::BF16(host_vec(tensor)?),
            other => {
                return Err(KernelError::UnsupportedDtype {
                    op: "adapter_weights",
                    expected: "f16 or bf16",
                    actual: other,
                })
            }
        };
        log::info!(
            "adapter weights loaded: adapters={} layers={} out={} in={} dtype={:?}",
            dims[0],
            dims[1],
            dims[2],
            dims[3],
            storage.dtype()
        );
        Ok(Self { storage, dims })
    }

    /// Zero-filled buffer of the given dtype.
    ///
    /// # Errors
    /// Returns an error for a non-16-bit dtype or a zero-sized dimension.
    pub fn zeros(dims: [usize; 4], dtype: DType, device: &Device) -> Result<Self> {
        Self::from_tensor(&Tensor::zeros(&dims[..], dtype, device)?)
    }

    /// Export as a `[adapters, L, out, in]` tensor.
    ///
    /// # Errors
    /// Returns an error if the tensor cannot be created on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let shape = &self.dims[..];
        let tensor = match &self.storage {
            WeightStorage::F16(data) => Tensor::from_slice(data, shape, device)?,
            WeightStorage::BF16(data) => Tensor::from_slice(data, shape, device)?,
        };
        Ok(tensor)
    }

    /// Backing storage.
    #[must_use]
    pub fn storage(&self) -> &WeightStorage {
        &self.storage
    }

    /// Number of adapters.
    #[must_use]
    pub fn num_adapters(&self) -> usize {
        self.dims[0]
    }

    /// Output width of each matrix (rows).
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.dims[2]
    }

    /// Input width of each matrix (columns).
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.dims[3]
    }

    /// Check that `adapter` addresses the adapter dimension.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] if `adapter >= adapters`.
    pub fn check_adapter(&self, adapter: usize) -> Result<()> {
        if adapter >= self.num_adapters() {
            return Err(KernelError::out_of_range(
                "adapter",
                adapter,
                self.num_adapters(),
            ));
        }
        Ok(())
    }

    /// One `[out, in]` matrix widened to `f32`.
    ///
    /// # Errors
    /// Returns [`KernelError::OutOfRange`] for a bad adapter or layer.
    pub fn matrix_f32(&self, adapter: usize, layer: usize) -> Result<Vec<f32>> {
        self.check_adapter(adapter)?;
        self.check_layer(layer)?;
        let size = self.out_features() * self.in_features();
        let start = (adapter * self.num_layers() + layer) * size;
        Ok(match &self.storage {
            WeightStorage::F16(data) => widen(&data[start..start + size]),
            WeightStorage::BF16(data) => widen(&data[start..start + size]),
        })
    }
}

fn widen<T: HalfFloat>(values: &[T]) -> Vec<f32> {
    values.iter().map(|v| v.to_accum()).collect()
}

impl LayeredBuffer for AdapterWeights {
    fn dims(&self) -> Vec<usize> {
        self.dims.to_vec()
    }

    fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    fn num_layers(&self) -> usize {
        self.dims[1]
    }
}
