//! Save and load adapter weights example.
//!
//! This example demonstrates:
//! - Building a LoRA weight pair for several same-rank adapters
//! - Saving the pair and a kernel configuration to disk
//! - Loading both back
//! - Checking that the loaded adapters produce the same update

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use multilora_rs::{
    load_adapter_weights, load_config, save_adapter_weights, save_config, AdapterWeights,
    KernelConfig, Kernels, LoraWeights, Validation,
};
use tempfile::TempDir;

fn main() -> Result<()> {
    println!("=== Save and Load Adapter Weights Example ===\n");

    let device = Device::Cpu;
    let (adapters, layers, hidden, rank) = (4, 2, 64, 8);

    let down = Tensor::randn(0f32, 0.1, (adapters, layers, rank, hidden), &device)?
        .to_dtype(DType::F16)?;
    let up = Tensor::randn(0f32, 0.1, (adapters, layers, hidden, rank), &device)?
        .to_dtype(DType::F16)?;
    let lora = LoraWeights::new(
        AdapterWeights::from_tensor(&down)?,
        AdapterWeights::from_tensor(&up)?,
    )?;
    println!("Created {adapters} adapters of rank {} over {layers} layers", lora.rank());

    let temp_dir = TempDir::new()?;
    let weights_path = temp_dir.path().join("lora.safetensors");
    let config_path = temp_dir.path().join("kernels.json");

    let config = KernelConfig {
        validation: Validation::Checked,
        kv_block_size: 64,
        ..KernelConfig::default()
    };
    save_adapter_weights(&lora, &weights_path)?;
    save_config(&config, &config_path)?;
    println!("Saved weights to {}", weights_path.display());
    println!("Saved config to {}\n", config_path.display());

    let loaded: LoraWeights = load_adapter_weights(&weights_path)?;
    let loaded_config: KernelConfig = load_config(&config_path)?;
    println!("Loaded config: {loaded_config:?}");

    let kernels = Kernels::new(loaded_config)?;
    let x = Tensor::randn(0f32, 1.0, (3, hidden), &device)?.to_dtype(DType::F16)?;
    let idx = Tensor::new(&[3u32, 0, 3], &device)?;

    let mut y_original = Tensor::zeros((3, hidden), DType::F16, &device)?;
    let mut y_loaded = y_original.clone();
    kernels.add_lora(&mut y_original, &x, &lora, &idx, 1, lora.scaling(16.0))?;
    kernels.add_lora(&mut y_loaded, &x, &loaded, &idx, 1, loaded.scaling(16.0))?;

    let diff = (y_original.to_dtype(DType::F32)? - y_loaded.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    println!("Max difference between original and loaded output: {diff}");
    assert!(diff == 0.0, "loaded adapters should match exactly");

    println!("\n=== Example Complete ===");
    Ok(())
}
