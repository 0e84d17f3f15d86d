//! LCM adapter selection and download

use anyhow::{Context, Result};
use log::info;
use std::path::{Path, PathBuf};

/// File holding the LoRA weights inside each adapter repository
pub const ADAPTER_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

/// Model-family flags given on the command line. Not mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterFlags {
    pub sdxl: bool,
    pub refiner: bool,
    pub ssd: bool,
    pub sd2: bool,
}

/// Published LCM LoRA adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcmAdapter {
    Sdxl,
    Ssd1b,
    Sdv15,
}

impl LcmAdapter {
    /// Pick the adapter for a model. Checked in order: sdxl, refiner, ssd, default.
    pub fn select(flags: &AdapterFlags) -> Self {
        if flags.sdxl || flags.refiner {
            LcmAdapter::Sdxl
        } else if flags.ssd {
            LcmAdapter::Ssd1b
        } else {
            LcmAdapter::Sdv15
        }
    }

    pub fn repo_id(&self) -> &'static str {
        match self {
            LcmAdapter::Sdxl => "latent-consistency/lcm-lora-sdxl",
            LcmAdapter::Ssd1b => "latent-consistency/lcm-lora-ssd-1b",
            LcmAdapter::Sdv15 => "latent-consistency/lcm-lora-sdv1-5",
        }
    }
}

/// Local path of the adapter weights, downloading from the hub unless overridden
pub fn resolve_adapter_weights(adapter: LcmAdapter, override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        if !path.exists() {
            anyhow::bail!("Adapter weights not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    info!("Fetching {} from the Hugging Face Hub", adapter.repo_id());
    let api = hf_hub::api::sync::Api::new().context("Failed to create Hugging Face API client")?;
    let path = api
        .model(adapter.repo_id().to_string())
        .get(ADAPTER_WEIGHTS_FILE)
        .with_context(|| format!("Failed to download {}", adapter.repo_id()))?;
    Ok(path)
}
