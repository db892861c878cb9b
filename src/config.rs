//! Configuration types for the decode and adapter kernels.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::traits::ValidateConfig;

/// Environment variable overriding [`KernelConfig::validation`].
pub const VALIDATION_ENV: &str = "MULTILORA_VALIDATION";

/// Environment variable overriding [`KernelConfig::kv_block_size`].
pub const KV_BLOCK_SIZE_ENV: &str = "MULTILORA_KV_BLOCK_SIZE";

/// Bounds-checking policy for index parameters.
///
/// The reference kernels trust the caller: an out-of-bounds slot, position,
/// layer or adapter index is undefined behaviour there. `Checked` upgrades
/// that to a fail-fast [`KernelError::OutOfRange`] raised before any
/// mutation. `Unchecked` skips the per-element checks. Memory safety is
/// kept: an index past the whole buffer panics on slice indexing, while an
/// index that still lands inside the buffer silently addresses another
/// plane (a cache position of `MAXLEN` reaches the V plane of the same
/// slot and layer, for example).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    /// Validate every index before mutating anything.
    #[default]
    Checked,
    /// Trust the caller for peak throughput.
    Unchecked,
}

impl Validation {
    /// Whether index checks run.
    #[must_use]
    pub fn is_checked(self) -> bool {
        matches!(self, Self::Checked)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "checked" => Some(Self::Checked),
            "unchecked" => Some(Self::Unchecked),
            _ => None,
        }
    }
}

/// Run-time knobs shared by every kernel family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Base of the rotary angle schedule, `θ(p, i) = p · theta^(-2i/D)`.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    /// Number of cache positions processed per streaming-softmax tile.
    #[serde(default = "default_kv_block_size")]
    pub kv_block_size: usize,

    /// Bounds-checking policy.
    #[serde(default)]
    pub validation: Validation,
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_kv_block_size() -> usize {
    32
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            rope_theta: default_rope_theta(),
            kv_block_size: default_kv_block_size(),
            validation: Validation::Checked,
        }
    }
}

impl KernelConfig {
    /// Apply `MULTILORA_VALIDATION` and `MULTILORA_KV_BLOCK_SIZE` overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(VALIDATION_ENV) {
            match Validation::parse(&raw) {
                Some(mode) => self.validation = mode,
                None => log::warn!("ignoring {VALIDATION_ENV}={raw:?}: expected checked|unchecked"),
            }
        }
        if let Ok(raw) = std::env::var(KV_BLOCK_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.kv_block_size = size,
                _ => log::warn!("ignoring {KV_BLOCK_SIZE_ENV}={raw:?}: expected a positive integer"),
            }
        }
    }
}

impl ValidateConfig for KernelConfig {
    fn validate(&self) -> Result<()> {
        if !self.rope_theta.is_finite() || self.rope_theta <= 0.0 {
            return Err(KernelError::InvalidConfig(format!(
                "rope_theta must be positive and finite, got {}",
                self.rope_theta
            )));
        }
        if self.kv_block_size == 0 {
            return Err(KernelError::InvalidConfig(
                "kv_block_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}
