//! LoRA adapter loading and permanent fusion into base weights
//!
//! Fusing applies `W' = W + scale * (alpha / rank) * (up @ down)` to every
//! parameter the adapter targets. Linear and conv layers share one path: both
//! factors are flattened to matrices and the product is reshaped back to the
//! parameter's shape.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::base_model::{lora_module_name, BaseModel};

/// One low-rank update
#[derive(Debug, Clone)]
pub struct LoraWeight {
    /// `[rank, in, ...]`
    pub down: Tensor,
    /// `[out, rank, ...]`
    pub up: Tensor,
    /// Defaults to the rank when absent
    pub alpha: Option<f32>,
}

impl LoraWeight {
    pub fn rank(&self) -> Result<usize> {
        Ok(self.down.dim(0)?)
    }

    /// Weight update reshaped to `shape`, in f32
    pub fn delta(&self, shape: &[usize], scale: f32) -> Result<Tensor> {
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        let rank = self.rank()?;
        let alpha = self.alpha.unwrap_or(rank as f32);
        let multiplier = scale * alpha / rank as f32;

        let delta = up.matmul(&down)?.affine(multiplier as f64, 0.0)?;
        Ok(delta.reshape(shape)?)
    }
}

/// LoRA weights keyed by kohya-style module name
#[derive(Debug)]
pub struct LoraAdapter {
    pub weights: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    /// Load kohya (`lora_down`/`lora_up`/`alpha`) or peft (`lora_A`/`lora_B`) weights
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load LoRA file: {}", path.display()))?;
        let adapter = Self::from_tensors(tensors)?;
        info!(
            "Loaded LoRA adapter {} ({} layers)",
            path.display(),
            adapter.weights.len()
        );
        Ok(adapter)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();

        for (key, tensor) in tensors {
            if let Some(base) = key.strip_suffix(".alpha") {
                let alpha = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .copied()
                    .with_context(|| format!("Empty alpha tensor: {}", key))?;
                alphas.insert(normalize_lora_key(base), alpha);
            } else if key.contains(".lora_down.") || key.contains(".lora_A.") {
                downs.insert(normalize_lora_key(&extract_lora_base_name(&key)), tensor);
            } else if key.contains(".lora_up.") || key.contains(".lora_B.") {
                ups.insert(normalize_lora_key(&extract_lora_base_name(&key)), tensor);
            } else {
                debug!("Ignoring non-LoRA tensor {}", key);
            }
        }

        let mut weights = HashMap::new();
        for (name, down) in downs {
            match ups.remove(&name) {
                Some(up) => {
                    let alpha = alphas.get(&name).copied();
                    weights.insert(name, LoraWeight { down, up, alpha });
                }
                None => warn!("LoRA down tensor without matching up tensor: {}", name),
            }
        }
        for name in ups.keys() {
            warn!("LoRA up tensor without matching down tensor: {}", name);
        }

        if weights.is_empty() {
            anyhow::bail!("No LoRA weight pairs found");
        }
        Ok(Self { weights })
    }
}

/// Strip the `.lora_down.weight` style suffix from a key
fn extract_lora_base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for marker in [".lora_down", ".lora_up", ".lora_A", ".lora_B"] {
        if let Some(pos) = key.rfind(marker) {
            return key[..pos].to_string();
        }
    }
    key.to_string()
}

/// Map any supported LoRA naming onto kohya module names
pub fn normalize_lora_key(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("lora_te_") {
        return format!("lora_te1_{}", rest);
    }
    if base.starts_with("lora_unet_") || base.starts_with("lora_te1_") || base.starts_with("lora_te2_") {
        return base.to_string();
    }

    let (prefix, path) = if let Some(rest) = base.strip_prefix("unet.") {
        ("lora_unet_", rest)
    } else if let Some(rest) = base.strip_prefix("text_encoder_2.") {
        ("lora_te2_", rest)
    } else if let Some(rest) = base.strip_prefix("text_encoder.") {
        ("lora_te1_", rest)
    } else {
        ("lora_unet_", base)
    };
    format!("{}{}", prefix, path.replace('.', "_"))
}

/// Summary of a fusion pass
#[derive(Debug, Default)]
pub struct FuseReport {
    pub fused_layers: usize,
    /// Adapter layers with no matching base parameter
    pub unmatched: Vec<String>,
}

/// Permanently merge `adapter` into the model's parameters
pub fn fuse_lora(model: &mut BaseModel, adapter: &LoraAdapter, scale: f32) -> Result<FuseReport> {
    let mut fused = HashSet::new();

    for (key, weight) in model.tensors.iter_mut() {
        let Some(name) = lora_module_name(key) else {
            continue;
        };
        let Some(lora) = adapter.weights.get(&name) else {
            continue;
        };

        let dtype = weight.dtype();
        let delta = lora
            .delta(weight.dims(), scale)
            .with_context(|| format!("LoRA shape mismatch for {}", key))?;
        *weight = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?;
        fused.insert(name);
    }

    if fused.is_empty() {
        anyhow::bail!("LoRA adapter matched no parameters of the base model");
    }

    let mut unmatched: Vec<String> = adapter
        .weights
        .keys()
        .filter(|name| !fused.contains(*name))
        .cloned()
        .collect();
    unmatched.sort();
    for name in &unmatched {
        warn!("LoRA layer has no matching base parameter: {}", name);
    }

    info!("Fused {} LoRA layers", fused.len());
    Ok(FuseReport {
        fused_layers: fused.len(),
        unmatched,
    })
}
