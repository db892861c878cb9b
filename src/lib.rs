//! # multilora-rs
//!
//! Batched compute kernels for a multi-LoRA LLM decode server.
//!
//! Many concurrent requests, each possibly using a different low-rank adapter
//! on top of a shared base model, share one set of batched kernels:
//! - **Rotary decode attention**: one new token per request, rotary-encoded,
//!   appended to an externally indexed KV cache and attended against that
//!   request's own history with a tiled streaming softmax
//! - **Gather-multiply (bgmv)**: every batch row selects its own weight
//!   matrix by index, so a mixed-adapter batch runs as one call
//! - **LoRA application**: two gather-multiplies (down to rank `R`, then up)
//!   apply a per-request low-rank update
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use multilora_rs::{
//!     AdapterWeights, DecodeBatch, KernelConfig, Kernels, KvCache, KvCacheShape, LoraWeights,
//! };
//!
//! let device = Device::Cpu;
//! let kernels = Kernels::new(KernelConfig::default())?;
//!
//! // Attention: 2 requests, 4 heads of dim 64, one layer.
//! let mut cache = KvCache::new(KvCacheShape {
//!     slots: 8,
//!     layers: 1,
//!     max_len: 128,
//!     heads: 4,
//!     head_dim: 64,
//! })?;
//! let q = Tensor::zeros((2, 4, 64), DType::F16, &device)?;
//! let past_lens = Tensor::new(&[0u32, 5], &device)?;
//! let kv_idx = Tensor::new(&[3u32, 1], &device)?;
//! let batch = DecodeBatch { q: &q, k: &q, v: &q, past_lens: &past_lens, kv_idx: &kv_idx };
//! let out = kernels.rotary_mha_decode(&batch, &mut cache, 0)?;
//! assert_eq!(out.dims(), &[2, 4, 64]);
//!
//! // LoRA: 3 adapters of rank 8 mapping 256 -> 256.
//! let lora = LoraWeights::new(
//!     AdapterWeights::zeros([3, 1, 8, 256], DType::F16, &device)?,
//!     AdapterWeights::zeros([3, 1, 256, 8], DType::F16, &device)?,
//! )?;
//! let x = Tensor::ones((2, 256), DType::F16, &device)?;
//! let mut y = Tensor::zeros((2, 256), DType::F16, &device)?;
//! let adapters = Tensor::new(&[2u32, 0], &device)?;
//! kernels.add_lora(&mut y, &x, &lora, &adapters, 0, lora.scaling(16.0))?;
//! # Ok::<(), multilora_rs::KernelError>(())
//! ```
//!
//! ## Buffers
//!
//! [`KvCache`] and [`AdapterWeights`] are long-lived buffers owned by the
//! serving process. The cache is mutated only through `&mut`, so two calls
//! can never write it concurrently; weight buffers are read-only once built.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter_weights;
pub mod attention;
pub mod bgmv;
pub mod config;
pub mod dtype;
pub mod error;
pub mod io;
pub mod kernels;
pub mod kv_cache;
pub mod lora;
pub mod ops;
pub mod rotary;
pub mod traits;

pub use adapter_weights::{AdapterWeights, WeightStorage};
pub use attention::{AttentionDecodeEngine, DecodeBatch};
pub use bgmv::{BatchedGatherMultiply, OutputMode};
pub use config::{KernelConfig, Validation};
pub use error::{KernelError, Result};
pub use io::{load_adapter_weights, load_config, save_adapter_weights, save_config, SaveLoad};
pub use kernels::DecodeKernel;
pub use kv_cache::{KvCache, KvCacheShape, KvHistory};
pub use lora::{LoraAdapterApplier, LoraWeights};
pub use ops::Kernels;
pub use rotary::RotaryEncoder;
pub use traits::{LayeredBuffer, ValidateConfig};
