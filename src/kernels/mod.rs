//! Host kernel bodies for the decode and gather-multiply families.
//!
//! These implement the data-layout contract every accelerator kernel must
//! satisfy:
//! - `flash_decode`: tiled, streaming-softmax attention of one query row
//!   against its own cache history, never materializing the full score row
//! - `gather`: per-row weight selection followed by a matrix-vector product
//!
//! Both are embarrassingly data-parallel across batch rows (and, for decode,
//! across heads) and use `rayon` for that parallelism. Storage is 16-bit;
//! every reduction accumulates in `f32` and rounds once on the way out.
//!
//! Callers are the validating front ends in [`crate::attention`],
//! [`crate::bgmv`] and [`crate::lora`]; the kernels themselves trust their
//! inputs.

pub mod flash_decode;
pub mod gather;

pub use flash_decode::{flash_attend, DecodeKernel, DecodeProblem};
pub use gather::{gather_multiply, GatherProblem, OutputMode};
