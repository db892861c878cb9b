//! Batched gather matrix-vector multiply.
//!
//! Row `i` of the batch selects its own `[out, in]` weight matrix by index
//! and computes `y[i] (+)= scale · W[indices[i], layer] · x[i]`. Rows are
//! independent and run in parallel; repeated or unsorted indices are fine.

use rayon::prelude::*;

use crate::dtype::HalfFloat;

/// Whether the gathered product is added to or replaces the output row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// `y[i] += scale · W x[i]`
    #[default]
    Accumulate,
    /// `y[i] = scale · W x[i]`
    Overwrite,
}

/// Inputs of one gather-multiply, already validated.
#[derive(Debug, Clone, Copy)]
pub struct GatherProblem<'a, T> {
    /// Input rows, `[B, in_features]`.
    pub x: &'a [T],
    /// Weight buffer, `[adapters, num_layers, out_features, in_features]`.
    pub weights: &'a [T],
    /// Weight matrix selected by each row, `[B]`.
    pub indices: &'a [usize],
    /// Layer addressed in the weight buffer.
    pub layer: usize,
    /// Size of the weight buffer's layer dimension.
    pub num_layers: usize,
    /// Input width `H1`.
    pub in_features: usize,
    /// Output width `H2`.
    pub out_features: usize,
    /// Multiplier applied to the product before it reaches `y`.
    pub scale: f32,
    /// Accumulate or overwrite.
    pub mode: OutputMode,
}

impl<T: HalfFloat> GatherProblem<'_, T> {
    fn matrix(&self, index: usize) -> &[T] {
        let size = self.out_features * self.in_features;
        let start = (index * self.num_layers + self.layer) * size;
        &self.weights[start..start + size]
    }
}

/// Run the gather-multiply, updating `y` (`[B, out_features]`) in place.
///
/// Products are accumulated in `f32`; each output element is rounded to `T`
/// exactly once.
///
/// # Panics
/// Panics if an index addresses past the end of the weight buffer.
pub fn gather_multiply<T: HalfFloat>(y: &mut [T], problem: &GatherProblem<'_, T>) {
    let in_features = problem.in_features;
    let out_features = problem.out_features;
    if in_features == 0 || out_features == 0 {
        return;
    }

    y.par_chunks_mut(out_features)
        .zip(problem.x.par_chunks(in_features))
        .zip(problem.indices.par_iter())
        .for_each(|((y_row, x_row), &index)| {
            let x_wide: Vec<f32> = x_row.iter().map(|v| v.to_accum()).collect();
            let w = problem.matrix(index);
            for (out, w_row) in y_row.iter_mut().zip(w.chunks_exact(in_features)) {
                let dot: f32 = w_row
                    .iter()
                    .zip(&x_wide)
                    .map(|(w, x)| w.to_accum() * x)
                    .sum();
                let value = problem.scale * dot;
                *out = match problem.mode {
                    OutputMode::Accumulate => T::from_accum(out.to_accum() + value),
                    OutputMode::Overwrite => T::from_accum(value),
                };
            }
        });
}
