//! Model weight loading, LCM adapter fusion and saving

pub mod adapter;
pub mod base_model;
pub mod checkpoint_keys;
pub mod lora;
pub mod save;

pub use adapter::{resolve_adapter_weights, AdapterFlags, LcmAdapter};
pub use base_model::BaseModel;
pub use lora::{fuse_lora, FuseReport, LoraAdapter, LoraWeight};
pub use save::save_safetensors;

use candle_core::DType;
use std::path::PathBuf;

/// Description of the base model being converted
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name_or_path: PathBuf,
    pub is_xl: bool,
    pub is_v2: bool,
    pub is_ssd: bool,
    pub is_refiner: bool,
    pub dtype: DType,
}

impl ModelConfig {
    pub fn from_flags(name_or_path: impl Into<PathBuf>, flags: &AdapterFlags, dtype: DType) -> Self {
        Self {
            name_or_path: name_or_path.into(),
            is_xl: flags.sdxl,
            is_v2: flags.sd2,
            is_ssd: flags.ssd,
            is_refiner: flags.refiner,
            dtype,
        }
    }
}
