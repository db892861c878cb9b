//! Multi-adapter decode loop example.
//!
//! This example demonstrates:
//! - Allocating a KV cache for several resident sequences
//! - Running a few decode steps for a batch whose requests use different
//!   cache slots and different LoRA adapters
//! - Applying the per-request LoRA update to a projection output

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use multilora_rs::{
    AdapterWeights, DecodeBatch, KernelConfig, Kernels, KvCache, KvCacheShape, LoraWeights,
};

fn main() -> Result<()> {
    println!("=== Multi-Adapter Decode Example ===\n");

    let device = Device::Cpu;
    let (heads, head_dim) = (4, 64);
    let hidden = heads * head_dim;
    let (adapters, rank) = (3, 8);

    let mut config = KernelConfig::default();
    config.apply_env_overrides();
    let kernels = Kernels::new(config)?;
    println!("Config: {:?}\n", kernels.config());

    let mut cache = KvCache::new(KvCacheShape {
        slots: 8,
        layers: 1,
        max_len: 32,
        heads,
        head_dim,
    })?;

    let lora = LoraWeights::new(
        AdapterWeights::from_tensor(
            &Tensor::randn(0f32, 0.05, (adapters, 1, rank, hidden), &device)?.to_dtype(DType::F16)?,
        )?,
        AdapterWeights::from_tensor(
            &Tensor::randn(0f32, 0.05, (adapters, 1, hidden, rank), &device)?.to_dtype(DType::F16)?,
        )?,
    )?;

    // Three requests in slots 5, 0, 2 using adapters 2, 0, 2.
    let slots = Tensor::new(&[5u32, 0, 2], &device)?;
    let adapter_idx = Tensor::new(&[2u32, 0, 2], &device)?;
    let batch = 3;

    for step in 0u32..4 {
        let x = Tensor::randn(0f32, 1.0, (batch, hidden), &device)?.to_dtype(DType::F16)?;

        // q/k/v projections: a shared base output plus each request's adapter delta.
        let mut q = x.clone();
        kernels.add_lora(&mut q, &x, &lora, &adapter_idx, 0, lora.scaling(16.0))?;
        let q = q.reshape((batch, heads, head_dim))?;
        let k = x.reshape((batch, heads, head_dim))?;

        let past_lens = Tensor::new(&[step, step, step], &device)?;
        let out = kernels.rotary_mha_decode(
            &DecodeBatch {
                q: &q,
                k: &k,
                v: &k,
                past_lens: &past_lens,
                kv_idx: &slots,
            },
            &mut cache,
            0,
        )?;
        let norm = out.to_dtype(DType::F32)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        println!("step {step}: output {:?}, norm {norm:.4}", out.dims());
    }

    let history = cache.read_range(5, 0, 3)?;
    println!("\nSlot 5 now holds {} positions", history.len());

    println!("\n=== Example Complete ===");
    Ok(())
}
