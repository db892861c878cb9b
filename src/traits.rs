//! Core traits shared by configurations and persistent buffers.

use candle_core::DType;

use crate::error::{KernelError, Result};

/// Configuration trait for kernel and buffer parameters.
pub trait ValidateConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// A persistent, layer-indexed buffer owned by the serving process.
///
/// Implemented by the KV cache and the adapter weight store. Both are
/// allocated once, never resized, and addressed by an external layer index.
pub trait LayeredBuffer: Send + Sync {
    /// Logical shape of the buffer.
    fn dims(&self) -> Vec<usize>;

    /// Storage dtype.
    fn dtype(&self) -> DType;

    /// Size of the layer dimension `L`.
    fn num_layers(&self) -> usize;

    /// Bytes of backing storage.
    fn size_in_bytes(&self) -> usize {
        self.dims().iter().product::<usize>() * self.dtype().size_in_bytes()
    }

    /// Check that `layer` addresses the `L` dimension.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::OutOfRange`] if `layer >= L`.
    fn check_layer(&self, layer: usize) -> Result<()> {
        let bound = self.num_layers();
        if layer >= bound {
            return Err(KernelError::out_of_range("layer", layer, bound));
        }
        Ok(())
    }
}
