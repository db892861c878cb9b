//! Streaming-softmax decode attention.
//!
//! Each query row attends to its own cache history in tiles of `block_size`
//! positions. A running max and running denominator are carried across
//! tiles and the weighted value sum is rescaled whenever the max moves, so
//! only one tile of scores is ever live:
//!
//! ```text
//! m' = max(m, max_t s_t)
//! l' = l · e^(m - m') + Σ_t e^(s_t - m')
//! o' = o · e^(m - m') + Σ_t e^(s_t - m') · v_t
//! ```
//!
//! Reference: <https://arxiv.org/abs/2205.14135>

#![allow(clippy::similar_names)]

use candle_core::DType;
use half::f16;
use rayon::prelude::*;

use crate::error::{KernelError, Result};
use crate::kv_cache::KvCache;

/// Inputs of one batched decode step, already validated.
#[derive(Debug, Clone, Copy)]
pub struct DecodeProblem<'a> {
    /// Rotary-encoded queries, `[B, N, D]` in `f32`.
    pub queries: &'a [f32],
    /// Cache holding every request's history, including this step's entry.
    pub cache: &'a KvCache,
    /// Cache slot of each request, `[B]`.
    pub slots: &'a [usize],
    /// History length of each request (`past_len + 1`), `[B]`.
    pub history_lens: &'a [usize],
    /// Layer addressed in the cache.
    pub layer: usize,
    /// Heads `N`.
    pub heads: usize,
    /// Head dimension `D`.
    pub head_dim: usize,
    /// Cache positions per tile.
    pub block_size: usize,
}

impl DecodeProblem<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn softmax_scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Attend output row `row = b * N + h` and round it into `out`.
    fn attend_row(&self, row: usize, acc: &mut [f32], scores: &mut [f32], out: &mut [f16]) {
        let b = row / self.heads;
        let h = row % self.heads;
        let history = self
            .cache
            .history_unchecked(self.slots[b], self.layer, self.history_lens[b]);
        let q = &self.queries[row * self.head_dim..(row + 1) * self.head_dim];

        attend_tiles(
            q,
            history.keys(),
            history.values(),
            self.heads * self.head_dim,
            h * self.head_dim,
            self.softmax_scale(),
            acc,
            scores,
        );

        for (o, a) in out.iter_mut().zip(acc.iter()) {
            *o = f16::from_f32(*a);
        }
    }
}

/// Streaming-softmax attention of one query head against one history.
///
/// `keys`/`values` are `[len, stride]` rows; the head's `q.len()` elements
/// start at `head_offset` inside each row. The tile length is
/// `scores.len()`. On return `acc` holds the normalized output.
///
/// # Arguments
/// * `q` - Rotary-encoded query head, `[D]`
/// * `keys`, `values` - History rows, `[len, stride]`
/// * `stride` - Elements per history row (all heads)
/// * `head_offset` - Start of this head inside a row
/// * `sm_scale` - Score multiplier, usually `1/√D`
/// * `acc` - Output accumulator, `[D]`
/// * `scores` - Scratch tile, its length is the block size
///
/// # Errors
/// Returns [`KernelError::DimensionMismatch`] if `scores` is empty, `acc`
/// and `q` differ in length, the head does not fit inside a row, or the
/// history is not a whole number of rows.
#[allow(clippy::too_many_arguments)]
pub fn flash_attend(
    q: &[f32],
    keys: &[f16],
    values: &[f16],
    stride: usize,
    head_offset: usize,
    sm_scale: f32,
    acc: &mut [f32],
    scores: &mut [f32],
) -> Result<()> {
    let problem = if scores.is_empty() {
        Some("score tile is empty".to_string())
    } else if acc.len() != q.len() {
        Some(format!("accumulator has {} elements, query has {}", acc.len(), q.len()))
    } else if stride == 0 || head_offset + q.len() > stride {
        Some(format!(
            "head [{head_offset}, {}) does not fit a row of {stride}",
            head_offset + q.len()
        ))
    } else if keys.len() != values.len() || keys.len() % stride != 0 {
        Some(format!(
            "keys ({}) and values ({}) must be equal whole rows of {stride}",
            keys.len(),
            values.len()
        ))
    } else {
        None
    };
    if let Some(message) = problem {
        return Err(KernelError::DimensionMismatch { message });
    }
    attend_tiles(q, keys, values, stride, head_offset, sm_scale, acc, scores);
    Ok(())
}

/// One head's `head_dim` elements of history row `t`.
fn head_row(rows: &[f16], t: usize, stride: usize, head_offset: usize, head_dim: usize) -> &[f16] {
    let start = t * stride + head_offset;
    &rows[start..start + head_dim]
}

#[allow(clippy::too_many_arguments)]
fn attend_tiles(
    q: &[f32],
    keys: &[f16],
    values: &[f16],
    stride: usize,
    head_offset: usize,
    sm_scale: f32,
    acc: &mut [f32],
    scores: &mut [f32],
) {
    let head_dim = q.len();
    let block_size = scores.len();
    let len = keys.len() / stride;

    let mut running_max = f32::NEG_INFINITY;
    let mut running_sum = 0.0f32;
    acc.fill(0.0);

    for block_start in (0..len).step_by(block_size) {
        let block_end = (block_start + block_size).min(len);
        let tile = &mut scores[..block_end - block_start];

        for (score, t) in tile.iter_mut().zip(block_start..block_end) {
            let k = head_row(keys, t, stride, head_offset, head_dim);
            let dot: f32 = q.iter().zip(k).map(|(a, b)| a * b.to_f32()).sum();
            *score = dot * sm_scale;
        }

        let block_max = tile.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let new_max = running_max.max(block_max);
        let correction = (running_max - new_max).exp();
        running_sum *= correction;
        for a in acc.iter_mut() {
            *a *= correction;
        }

        for (score, t) in tile.iter().zip(block_start..block_end) {
            let weight = (score - new_max).exp();
            running_sum += weight;
            for (a, v) in acc.iter_mut().zip(head_row(values, t, stride, head_offset, head_dim)) {
                *a += weight * v.to_f32();
            }
        }
        running_max = new_max;
    }

    if running_sum > 0.0 {
        let inv_sum = 1.0 / running_sum;
        for a in acc.iter_mut() {
            *a *= inv_sum;
        }
    }
}

/// Decode kernel variant, resolved once per call from `(dtype, head_dim)`.
///
/// Common head dimensions get a const-generic variant whose per-row
/// accumulator lives on the stack; any other even head dimension falls back
/// to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKernel {
    /// f16, D = 64
    HeadDim64,
    /// f16, D = 80
    HeadDim80,
    /// f16, D = 96
    HeadDim96,
    /// f16, D = 128
    HeadDim128,
    /// f16, D = 256
    HeadDim256,
    /// f16, any other even D
    Generic {
        /// Head dimension
        head_dim: usize,
    },
}

impl DecodeKernel {
    /// Pick the kernel for `(dtype, head_dim)`.
    ///
    /// # Errors
    /// - [`KernelError::UnsupportedDtype`] unless `dtype` is F16
    /// - [`KernelError::DimensionMismatch`] for a zero or odd head dim
    pub fn select(dtype: DType, head_dim: usize) -> Result<Self> {
        if dtype != DType::F16 {
            return Err(KernelError::UnsupportedDtype {
                op: "rotary_mha_decode",
                expected: "f16",
                actual: dtype,
            });
        }
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(KernelError::DimensionMismatch {
                message: format!("head_dim must be even and > 0, got {head_dim}"),
            });
        }
        Ok(match head_dim {
            64 => Self::HeadDim64,
            80 => Self::HeadDim80,
            96 => Self::HeadDim96,
            128 => Self::HeadDim128,
            256 => Self::HeadDim256,
            head_dim => Self::Generic { head_dim },
        })
    }

    /// Head dimension served by this variant.
    #[must_use]
    pub fn head_dim(self) -> usize {
        match self {
            Self::HeadDim64 => 64,
            Self::HeadDim80 => 80,
            Self::HeadDim96 => 96,
            Self::HeadDim128 => 128,
            Self::HeadDim256 => 256,
            Self::Generic { head_dim } => head_dim,
        }
    }

    /// Run the batch, writing `[B, N, D]` outputs into `out`.
    ///
    /// # Panics
    /// Panics if `problem.head_dim` differs from this variant's head dim.
    pub fn run(self, problem: &DecodeProblem<'_>, out: &mut [f16]) {
        assert_eq!(problem.head_dim, self.head_dim(), "kernel/head_dim mismatch");
        match self {
            Self::HeadDim64 => run_fixed::<64>(problem, out),
            Self::HeadDim80 => run_fixed::<80>(problem, out),
            Self::HeadDim96 => run_fixed::<96>(problem, out),
            Self::HeadDim128 => run_fixed::<128>(problem, out),
            Self::HeadDim256 => run_fixed::<256>(problem, out),
            Self::Generic { .. } => run_dynamic(problem, out),
        }
    }
}

fn run_fixed<const D: usize>(problem: &DecodeProblem<'_>, out: &mut [f16]) {
    out.par_chunks_mut(D).enumerate().for_each_init(
        || ([0.0f32; D], vec![0.0f32; problem.block_size]),
        |(acc, scores), (row, o)| problem.attend_row(row, acc, scores, o),
    );
}

fn run_dynamic(problem: &DecodeProblem<'_>, out: &mut [f16]) {
    out.par_chunks_mut(problem.head_dim).enumerate().for_each_init(
        || {
            (
                vec![0.0f32; problem.head_dim],
                vec![0.0f32; problem.block_size],
            )
        },
        |(acc, scores), (row, o)| problem.attend_row(row, acc, scores, o),
    );
}
