//! Single-token decode attention with rotary encoding over an indexed cache.
//!
//! One call serves a batch of decode requests. For request `i`:
//! 1. rotary-encode `q[i]` and `k[i]` at position `past_lens[i]`
//! 2. store the encoded key and raw `v[i]` at
//!    `(kv_idx[i], layer, past_lens[i])`
//! 3. attend `q[i]` over positions `0..=past_lens[i]` of its own slot with a
//!    tiled streaming softmax, scale `1/√D`
//!
//! Every request's cache write happens before any attention read. Requests
//! never read each other's slots, so the result for one request depends only
//! on its own history.

use std::collections::HashSet;

use candle_core::{DType, Tensor};
use half::f16;

use crate::config::KernelConfig;
use crate::dtype::{expect_rank, expect_shape, host_vec, index_vec};
use crate::error::{KernelError, Result};
use crate::kernels::{DecodeKernel, DecodeProblem};
use crate::kv_cache::KvCache;
use crate::rotary::RotaryEncoder;
use crate::traits::{LayeredBuffer, ValidateConfig};

/// Per-call inputs of [`AttentionDecodeEngine::decode`].
#[derive(Debug, Clone, Copy)]
pub struct DecodeBatch<'a> {
    /// Query projections `[B, N, D]`, F16.
    pub q: &'a Tensor,
    /// Key projections `[B, N, D]`, F16.
    pub k: &'a Tensor,
    /// Value projections `[B, N, D]`, F16.
    pub v: &'a Tensor,
    /// Tokens already cached per request, `[B]`, integral.
    pub past_lens: &'a Tensor,
    /// Cache slot per request, `[B]`, integral.
    pub kv_idx: &'a Tensor,
}

/// Decode attention front end.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionDecodeEngine {
    config: KernelConfig,
}

impl AttentionDecodeEngine {
    /// Create an engine.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid.
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run one decode step for every request in `batch`.
    ///
    /// Returns the `[B, N, D]` F16 attention output on the device of `q`.
    /// The cache is written at one position per request.
    ///
    /// # Arguments
    /// * `batch` - Projections and per-request cache addresses
    /// * `cache` - Cache receiving this step's keys and values
    /// * `layer` - Layer addressed in `cache`
    ///
    /// # Errors
    /// - [`KernelError::UnsupportedDtype`] if `q`, `k` or `v` is not F16
    /// - [`KernelError::ShapeMismatch`] / [`KernelError::DimensionMismatch`]
    ///   if the batch disagrees with itself or with the cache geometry
    /// - [`KernelError::OutOfRange`] for a bad layer, or (checked mode) a bad
    ///   slot or `past_lens[i] >= MAXLEN`
    /// - [`KernelError::SlotConflict`] (checked mode) if two requests name
    ///   the same slot
    ///
    /// All of these are raised before the cache is touched.
    pub fn decode(&self, batch: &DecodeBatch<'_>, cache: &mut KvCache, layer: usize) -> Result<Tensor> {
        for (name, t) in [("q", batch.q), ("k", batch.k), ("v", batch.v)] {
            if t.dtype() != DType::F16 {
                log::debug!("rotary_mha_decode: rejecting {name} with dtype {:?}", t.dtype());
                return Err(KernelError::UnsupportedDtype {
                    op: "rotary_mha_decode",
                    expected: "f16",
                    actual: t.dtype(),
                });
            }
        }

        let dims = expect_rank(batch.q, 3, "q")?;
        let (b, n, d) = (dims[0], dims[1], dims[2]);
        expect_shape(batch.k, dims, "k")?;
        expect_shape(batch.v, dims, "v")?;
        let shape = *cache.shape();
        if shape.heads != n || shape.head_dim != d {
            return Err(KernelError::ShapeMismatch {
                name: "kv_cache",
                expected: vec![n, d],
                actual: vec![shape.heads, shape.head_dim],
            });
        }
        let kernel = DecodeKernel::select(batch.q.dtype(), d)?;

        let past_lens = index_vec(batch.past_lens, "past_lens")?;
        let slots = index_vec(batch.kv_idx, "kv_idx")?;
        for (name, len) in [("past_lens", past_lens.len()), ("kv_idx", slots.len())] {
            if len != b {
                return Err(KernelError::ShapeMismatch {
                    name,
                    expected: vec![b],
                    actual: vec![len],
                });
            }
        }
        cache.check_layer(layer)?;
        if self.config.validation.is_checked() {
            check_requests(cache, &slots, &past_lens, layer)?;
        }

        log::debug!(
            "rotary_mha_decode: kernel={kernel:?} batch={b} heads={n} layer={layer} block={}",
            self.config.kv_block_size
        );

        let rope = RotaryEncoder::new(d, self.config.rope_theta)?;
        let row_len = n * d;
        let q = host_vec::<f16>(batch.q)?;
        let k = host_vec::<f16>(batch.k)?;
        let v = host_vec::<f16>(batch.v)?;

        let mut queries: Vec<f32> = q.iter().map(|x| x.to_f32()).collect();
        for (i, row) in queries.chunks_exact_mut(row_len).enumerate() {
            rope.rotate_heads(row, past_lens[i])?;
        }

        for i in 0..b {
            let rows = i * row_len..(i + 1) * row_len;
            let key = rope.rotate_f16(&k[rows.clone()], past_lens[i])?;
            cache.write_unchecked(slots[i], layer, past_lens[i], &key, &v[rows]);
        }

        let history_lens: Vec<usize> = past_lens.iter().map(|p| p + 1).collect();
        let problem = DecodeProblem {
            queries: &queries,
            cache,
            slots: &slots,
            history_lens: &history_lens,
            layer,
            heads: n,
            head_dim: d,
            block_size: self.config.kv_block_size,
        };
        let mut out = vec![f16::ZERO; b * row_len];
        kernel.run(&problem, &mut out);

        Ok(Tensor::from_vec(out, (b, n, d), batch.q.device())?)
    }
}

/// Bounds-check every request and reject slots named twice.
fn check_requests(cache: &KvCache, slots: &[usize], past_lens: &[usize], layer: usize) -> Result<()> {
    let mut seen = HashSet::with_capacity(slots.len());
    for (&slot, &past) in slots.iter().zip(past_lens) {
        cache.check_address(slot, layer, past)?;
        if !seen.insert(slot) {
            return Err(KernelError::SlotConflict { slot });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Validation;
    use crate::kv_cache::KvCacheShape;
    use candle_core::Device;

    fn cache(slots: usize, max_len: usize, heads: usize, head_dim: usize) -> anyhow::Result<KvCache> {
        Ok(KvCache::new(KvCacheShape {
            slots,
            layers: 2,
            max_len,
            heads,
            head_dim,
        })?)
    }

    fn f16_tensor(data: &[f32], dims: (usize, usize, usize)) -> anyhow::Result<Tensor> {
        Ok(Tensor::from_vec(data.to_vec(), dims, &Device::Cpu)?.to_dtype(DType::F16)?)
    }

    fn engine() -> anyhow::Result<AttentionDecodeEngine> {
        Ok(AttentionDecodeEngine::new(KernelConfig::default())?)
    }

    #[test]
    fn test_first_token_returns_value() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(2, 8, 2, 4)?;
        let q = f16_tensor(&[0.5; 8], (1, 2, 4))?;
        let k = f16_tensor(&[1.0; 8], (1, 2, 4))?;
        let v_data: Vec<f32> = (0..8).map(|i| i as f32 * 0.5 - 1.0).collect();
        let v = f16_tensor(&v_data, (1, 2, 4))?;
        let past = Tensor::new(&[0u32], &device)?;
        let idx = Tensor::new(&[1u32], &device)?;

        let out = engine()?.decode(
            &DecodeBatch { q: &q, k: &k, v: &v, past_lens: &past, kv_idx: &idx },
            &mut kv,
            1,
        )?;
        assert_eq!(out.dims(), &[1, 2, 4]);
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?, v_data);

        // Position 0 is unrotated, so the stored key is the raw key.
        let (key, value) = kv.entry(1, 1, 0)?;
        assert!(key.iter().all(|x| *x == f16::ONE));
        assert_eq!(value, host_vec::<f16>(&v)?.as_slice());
        Ok(())
    }

    #[test]
    fn test_attends_over_full_history() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(1, 4, 1, 2)?;
        let eng = engine()?;
        let values = [[1.0f32, 0.0], [0.0, 1.0]];

        for (pos, value) in values.iter().enumerate() {
            let q = f16_tensor(&[0.0, 0.0], (1, 1, 2))?;
            let k = f16_tensor(&[0.0, 0.0], (1, 1, 2))?;
            let v = f16_tensor(value, (1, 1, 2))?;
            let past = Tensor::new(&[pos as u32], &device)?;
            let idx = Tensor::new(&[0u32], &device)?;
            let out = eng.decode(
                &DecodeBatch { q: &q, k: &k, v: &v, past_lens: &past, kv_idx: &idx },
                &mut kv,
                0,
            )?;
            if pos == 1 {
                // Zero query: uniform weights over both positions.
                let got = out.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                assert_eq!(got, vec![0.5, 0.5]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_f32_without_mutation() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(1, 4, 1, 2)?;
        let q = Tensor::ones((1, 1, 2), DType::F32, &device)?;
        let past = Tensor::new(&[0u32], &device)?;
        let idx = Tensor::new(&[0u32], &device)?;
        let err = engine()?.decode(
            &DecodeBatch { q: &q, k: &q, v: &q, past_lens: &past, kv_idx: &idx },
            &mut kv,
            0,
        );
        assert!(matches!(err, Err(KernelError::UnsupportedDtype { .. })));
        assert!(kv.entry(0, 0, 0)?.1.iter().all(|x| *x == f16::ZERO));
        Ok(())
    }

    #[test]
    fn test_position_bound_and_slot_conflict() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(2, 4, 1, 2)?;
        let eng = engine()?;
        let x = f16_tensor(&[1.0; 4], (2, 1, 2))?;

        let past = Tensor::new(&[3u32, 4], &device)?;
        let idx = Tensor::new(&[0u32, 1], &device)?;
        let batch = DecodeBatch { q: &x, k: &x, v: &x, past_lens: &past, kv_idx: &idx };
        assert!(matches!(
            eng.decode(&batch, &mut kv, 0),
            Err(KernelError::OutOfRange { what: "position", index: 4, bound: 4 })
        ));
        // Request 0 was valid but nothing was written.
        assert!(kv.entry(0, 0, 3)?.0.iter().all(|x| *x == f16::ZERO));

        let past = Tensor::new(&[0u32, 1], &device)?;
        let idx = Tensor::new(&[1u32, 1], &device)?;
        let batch = DecodeBatch { q: &x, k: &x, v: &x, past_lens: &past, kv_idx: &idx };
        assert!(matches!(
            eng.decode(&batch, &mut kv, 0),
            Err(KernelError::SlotConflict { slot: 1 })
        ));
        Ok(())
    }

    #[test]
    fn test_unchecked_duplicate_slots_last_writer_wins() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(1, 4, 1, 2)?;
        let eng = AttentionDecodeEngine::new(KernelConfig {
            validation: Validation::Unchecked,
            ..KernelConfig::default()
        })?;
        let x = f16_tensor(&[0.0; 4], (2, 1, 2))?;
        let v = f16_tensor(&[1.0, 1.0, 2.0, 2.0], (2, 1, 2))?;
        let past = Tensor::new(&[0u32, 0], &device)?;
        let idx = Tensor::new(&[0u32, 0], &device)?;
        eng.decode(
            &DecodeBatch { q: &x, k: &x, v: &v, past_lens: &past, kv_idx: &idx },
            &mut kv,
            0,
        )?;
        assert_eq!(kv.entry(0, 0, 0)?.1, &[f16::from_f32(2.0); 2]);
        Ok(())
    }

    #[test]
    fn test_unchecked_position_at_max_len_spills_into_value_plane() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(1, 4, 1, 2)?;
        let eng = AttentionDecodeEngine::new(KernelConfig {
            validation: Validation::Unchecked,
            ..KernelConfig::default()
        })?;
        let q = f16_tensor(&[0.0, 0.0], (1, 1, 2))?;
        let k = f16_tensor(&[1.0, 0.0], (1, 1, 2))?;
        let v = f16_tensor(&[3.0, 5.0], (1, 1, 2))?;
        let past = Tensor::new(&[4u32], &device)?;
        let idx = Tensor::new(&[0u32], &device)?;

        let out = eng.decode(
            &DecodeBatch { q: &q, k: &k, v: &v, past_lens: &past, kv_idx: &idx },
            &mut kv,
            0,
        )?;
        assert_eq!(out.dims(), &[1, 1, 2]);

        // Position MAXLEN of the K plane is position 0 of the V plane, and
        // the V row lands on the next layer's K plane.
        let rotated = RotaryEncoder::new(2, 10_000.0)?.rotate_f16(&[f16::ONE, f16::ZERO], 4)?;
        assert_eq!(kv.entry(0, 0, 0)?.1, rotated.as_slice());
        assert_eq!(kv.entry(0, 1, 0)?.0, &[f16::from_f32(3.0), f16::from_f32(5.0)]);
        assert!(kv.entry(0, 0, 0)?.0.iter().all(|x| *x == f16::ZERO));
        Ok(())
    }

    #[test]
    fn test_cache_geometry_mismatch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut kv = cache(1, 4, 2, 2)?;
        let x = f16_tensor(&[1.0; 4], (1, 1, 4))?;
        let past = Tensor::new(&[0u32], &device)?;
        let idx = Tensor::new(&[0u32], &device)?;
        assert!(matches!(
            engine()?.decode(
                &DecodeBatch { q: &x, k: &x, v: &x, past_lens: &past, kv_idx: &idx },
                &mut kv,
                0,
            ),
            Err(KernelError::ShapeMismatch { name: "kv_cache", .. })
        ));
        Ok(())
    }
}
