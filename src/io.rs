//! Saving and loading adapter weight buffers and kernel configurations.
//!
//! This module provides functionality for:
//! - Saving adapter weight buffers to safetensors format
//! - Loading adapter weight buffers from safetensors format
//! - Saving and loading [`KernelConfig`](crate::KernelConfig) as JSON

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};

use crate::adapter_weights::AdapterWeights;
use crate::error::{KernelError, Result};
use crate::lora::LoraWeights;

/// Tensor name of a single weight buffer.
pub const WEIGHT_KEY: &str = "weight";

/// Tensor name of a LoRA down buffer.
pub const LORA_DOWN_KEY: &str = "lora_down";

/// Tensor name of a LoRA up buffer.
pub const LORA_UP_KEY: &str = "lora_up";

/// Weight buffers that can be stored as named tensors.
pub trait SaveLoad: Sized {
    /// All buffers as a map of name -> tensor on `device`.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be created.
    fn state_dict(&self, device: &Device) -> Result<HashMap<String, Tensor>>;

    /// Rebuild the buffers from a state dict.
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or malformed.
    fn from_state_dict(state_dict: &HashMap<String, Tensor>) -> Result<Self>;
}

fn take<'a>(state_dict: &'a HashMap<String, Tensor>, key: &str) -> Result<&'a Tensor> {
    state_dict
        .get(key)
        .ok_or_else(|| KernelError::Io(format!("missing tensor {key:?}")))
}

impl SaveLoad for AdapterWeights {
    fn state_dict(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(WEIGHT_KEY.to_string(), self.to_tensor(device)?)]))
    }

    fn from_state_dict(state_dict: &HashMap<String, Tensor>) -> Result<Self> {
        Self::from_tensor(take(state_dict, WEIGHT_KEY)?)
    }
}

impl SaveLoad for LoraWeights {
    fn state_dict(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([
            (LORA_DOWN_KEY.to_string(), self.down().to_tensor(device)?),
            (LORA_UP_KEY.to_string(), self.up().to_tensor(device)?),
        ]))
    }

    fn from_state_dict(state_dict: &HashMap<String, Tensor>) -> Result<Self> {
        Self::new(
            AdapterWeights::from_tensor(take(state_dict, LORA_DOWN_KEY)?)?,
            AdapterWeights::from_tensor(take(state_dict, LORA_UP_KEY)?)?,
        )
    }
}

/// Save weight buffers to a safetensors file.
///
/// # Errors
/// Returns an error if the tensors cannot be serialized or written.
pub fn save_adapter_weights<W: SaveLoad, P: AsRef<Path>>(weights: &W, path: P) -> Result<()> {
    let state_dict = weights.state_dict(&Device::Cpu)?;
    let tensors: Vec<(&str, &Tensor)> = state_dict
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();

    safetensors::tensor::serialize_to_file(tensors, &None, path.as_ref())
        .map_err(|e| KernelError::Io(format!("Failed to save safetensors: {e}")))?;

    log::info!("saved adapter weights to {}", path.as_ref().display());
    Ok(())
}

/// Load weight buffers from a safetensors file.
///
/// Buffers must be rank 4 and F16 or BF16.
///
/// # Errors
/// Returns an error if the file cannot be read or a tensor is missing or
/// malformed.
pub fn load_adapter_weights<W: SaveLoad, P: AsRef<Path>>(path: P) -> Result<W> {
    let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
    W::from_state_dict(&tensors)
}

/// Save a configuration to a JSON file.
///
/// # Errors
/// Returns an error if serialization or file writing fails.
pub fn save_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| KernelError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json)
        .map_err(|e| KernelError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load a configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading or deserialization fails.
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| KernelError::Io(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&json)
        .map_err(|e| KernelError::Io(format!("Failed to parse config: {e}")))?;

    Ok(config)
}
