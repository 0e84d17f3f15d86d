//! Dataset loading and batch assembly for diffusion fine-tuning
//!
//! A dataset folder is scanned into [`FileItem`]s, each carrying its image
//! geometry, caption and optional conditioning tensors. Items are then
//! grouped and collated into a [`DataLoaderBatch`] for one training step.

pub mod batch;
pub mod caption;
pub mod collate;
pub mod conditioning;
pub mod dataset;
pub mod file_item;
pub mod image_processing;
pub mod image_size;
pub mod latent;
pub mod load_context;

pub use batch::{BatchError, DataLoaderBatch};
pub use caption::CaptionState;
pub use conditioning::{
    AugmentationState, ClipImageEmbeds, ClipImageState, ControlState, MaskState,
    UnconditionalState,
};
pub use dataset::FileItemDataset;
pub use file_item::{FileItem, FileItemOverrides};
pub use image_processing::ImageTransform;
pub use image_size::{ImageCrateProbe, ImageSizeProbe, ProbeError};
pub use latent::LatentState;
pub use load_context::{LoadContext, SizeCache, WarningLog};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub folder_path: PathBuf,
    #[serde(default = "default_caption_ext")]
    pub caption_ext: String,
    /// Scale factor applied to the raw image size before cropping
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub augments: Vec<String>,
    #[serde(default = "default_one")]
    pub loss_multiplier: f32,
    #[serde(default = "default_one")]
    pub network_weight: f32,
    #[serde(default)]
    pub is_reg: bool,
    #[serde(default)]
    pub cache_latents_to_disk: bool,
    /// Folders holding conditioning images that share the training image's file stem
    pub control_path: Option<PathBuf>,
    pub mask_path: Option<PathBuf>,
    pub clip_image_path: Option<PathBuf>,
    pub unconditional_path: Option<PathBuf>,
}

fn default_caption_ext() -> String {
    "txt".to_string()
}

fn default_scale() -> f64 {
    1.0
}

fn default_one() -> f32 {
    1.0
}

impl DatasetConfig {
    /// Config with every optional key at its default
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            folder_path: folder_path.into(),
            caption_ext: default_caption_ext(),
            scale: 1.0,
            augments: Vec::new(),
            loss_multiplier: 1.0,
            network_weight: 1.0,
            is_reg: false,
            cache_latents_to_disk: false,
            control_path: None,
            mask_path: None,
            clip_image_path: None,
            unconditional_path: None,
        }
    }

    /// Directory holding on-disk latents for this dataset
    pub fn latent_cache_dir(&self) -> PathBuf {
        self.folder_path.join("_latent_cache")
    }

    /// JSON file the size cache is persisted to
    pub fn size_cache_file(&self) -> PathBuf {
        self.folder_path.join(".size_cache.json")
    }
}

pub fn load_dataset_config(path: &Path) -> Result<DatasetConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset config: {}", path.display()))?;

    let config: DatasetConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML dataset config")?;

    Ok(config)
}
