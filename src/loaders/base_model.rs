//! Base model weights held in memory for conversion

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::checkpoint_keys::{checkpoint_module, is_checkpoint_format, CheckpointModule};
use super::save::save_safetensors;
use super::ModelConfig;

/// Diffusers pipeline components with safetensors weights
const COMPONENTS: &[&str] = &["unet", "text_encoder", "text_encoder_2", "vae"];
const WEIGHT_FILES: &[&str] = &["diffusion_pytorch_model.safetensors", "model.safetensors"];

/// All parameters of a model, keyed by tensor name
pub struct BaseModel {
    pub config: ModelConfig,
    pub tensors: HashMap<String, Tensor>,
}

impl BaseModel {
    /// Load a single safetensors file, or a diffusers directory with
    /// component-prefixed keys (`unet.`, `text_encoder.`, ...).
    pub fn load(config: ModelConfig, device: &Device) -> Result<Self> {
        let path = config.name_or_path.clone();
        let raw = if path.is_dir() {
            load_diffusers_dir(&path, device)?
        } else {
            info!("Loading single-file checkpoint {}", path.display());
            let raw = candle_core::safetensors::load(&path, device)
                .with_context(|| format!("Failed to load model: {}", path.display()))?;
            if is_checkpoint_format(raw.keys()) {
                info!("Detected latent-diffusion key layout, matching LoRA layers by diffusers names");
            }
            raw
        };

        let mut tensors = HashMap::with_capacity(raw.len());
        for (name, tensor) in raw {
            let tensor = if tensor.dtype().is_float() && tensor.dtype() != config.dtype {
                tensor.to_dtype(config.dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }

        info!("Loaded {} tensors from {}", tensors.len(), path.display());
        Ok(Self { config, tensors })
    }

    pub fn from_tensors(config: ModelConfig, tensors: HashMap<String, Tensor>) -> Self {
        Self { config, tensors }
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn save(&self, output_path: &Path, metadata: HashMap<String, String>) -> Result<()> {
        save_safetensors(&self.tensors, metadata, output_path)
            .with_context(|| format!("Failed to save model: {}", output_path.display()))
    }
}

fn component_weights(dir: &Path, component: &str) -> Option<PathBuf> {
    WEIGHT_FILES
        .iter()
        .map(|file| dir.join(component).join(file))
        .find(|path| path.exists())
}

fn load_diffusers_dir(dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if component_weights(dir, "unet").is_none() {
        anyhow::bail!("No unet weights found in {}", dir.display());
    }

    let mut tensors = HashMap::new();
    for component in COMPONENTS {
        let Some(file) = component_weights(dir, component) else {
            continue;
        };
        info!("Loading {} from {}", component, file.display());
        let weights = candle_core::safetensors::load(&file, device)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        for (name, tensor) in weights {
            tensors.insert(format!("{}.{}", component, name), tensor);
        }
    }
    Ok(tensors)
}

/// Kohya-style LoRA module name for a parameter, if it can carry a LoRA.
///
/// `unet.down_blocks.0.proj_in.weight` becomes `lora_unet_down_blocks_0_proj_in`.
/// Keys without a component prefix come from a single-file checkpoint and are
/// mapped through the checkpoint layout first.
pub fn lora_module_name(key: &str) -> Option<String> {
    let module = key.strip_suffix(".weight")?;

    let (prefix, path) = if let Some(rest) = module.strip_prefix("unet.") {
        ("lora_unet_", rest.to_string())
    } else if let Some(rest) = module.strip_prefix("text_encoder_2.") {
        ("lora_te2_", rest.to_string())
    } else if let Some(rest) = module.strip_prefix("text_encoder.") {
        ("lora_te1_", rest.to_string())
    } else if module.starts_with("vae.") {
        return None;
    } else {
        match checkpoint_module(module)? {
            CheckpointModule::Unet(path) => ("lora_unet_", path),
            CheckpointModule::TextEncoder(path) => ("lora_te1_", path),
        }
    };

    Some(format!("{}{}", prefix, path.replace('.', "_")))
}
