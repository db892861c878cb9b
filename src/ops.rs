//! The three call families of the serving loop behind one handle.

use candle_core::Tensor;

use crate::adapter_weights::AdapterWeights;
use crate::attention::{AttentionDecodeEngine, DecodeBatch};
use crate::bgmv::{BatchedGatherMultiply, OutputMode};
use crate::config::KernelConfig;
use crate::error::Result;
use crate::kv_cache::KvCache;
use crate::lora::{LoraAdapterApplier, LoraWeights};

/// Validated configuration plus one front end per call family.
///
/// Every call is synchronous: it returns once the whole batch is done.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use multilora_rs::{AdapterWeights, KernelConfig, Kernels};
///
/// let device = Device::Cpu;
/// let kernels = Kernels::new(KernelConfig::default())?;
/// let weights = AdapterWeights::zeros([4, 2, 8, 16], DType::F16, &device)?;
///
/// let x = Tensor::ones((3, 16), DType::F16, &device)?;
/// let mut y = Tensor::zeros((3, 8), DType::F16, &device)?;
/// let indices = Tensor::new(&[0u32, 3, 0], &device)?;
/// kernels.bgmv(&mut y, &x, &weights, &indices, 1, 1.0)?;
/// # Ok::<(), multilora_rs::KernelError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Kernels {
    attention: AttentionDecodeEngine,
    gather: BatchedGatherMultiply,
    lora: LoraAdapterApplier,
}

impl Kernels {
    /// Build the front ends for `config`.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid.
    pub fn new(config: KernelConfig) -> Result<Self> {
        let validation = config.validation;
        Ok(Self {
            attention: AttentionDecodeEngine::new(config)?,
            gather: BatchedGatherMultiply::new(validation),
            lora: LoraAdapterApplier::new(validation),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        self.attention.config()
    }

    /// Rotary decode attention; see [`AttentionDecodeEngine::decode`].
    ///
    /// # Errors
    /// See [`AttentionDecodeEngine::decode`].
    pub fn rotary_mha_decode(
        &self,
        batch: &DecodeBatch<'_>,
        cache: &mut KvCache,
        layer: usize,
    ) -> Result<Tensor> {
        self.attention.decode(batch, cache, layer)
    }

    /// `y += scale · x · W[indices, layer]ᵗ`; see
    /// [`BatchedGatherMultiply::apply`].
    ///
    /// # Errors
    /// See [`BatchedGatherMultiply::apply`].
    pub fn bgmv(
        &self,
        y: &mut Tensor,
        x: &Tensor,
        weights: &AdapterWeights,
        indices: &Tensor,
        layer: usize,
        scale: f32,
    ) -> Result<()> {
        self.gather
            .apply(y, x, weights, indices, layer, scale, OutputMode::Accumulate)
    }

    /// Per-row LoRA update; see [`LoraAdapterApplier::apply`].
    ///
    /// # Errors
    /// See [`LoraAdapterApplier::apply`].
    pub fn add_lora(
        &self,
        y: &mut Tensor,
        x: &Tensor,
        weights: &LoraWeights,
        indices: &Tensor,
        layer: usize,
        scale: f32,
    ) -> Result<()> {
        self.lora.apply(y, x, weights, indices, layer, scale)
    }
}
