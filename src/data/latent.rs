//! Latent caching for a single training item

use candle_core::{Device, Result, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Key the latent is stored under inside its safetensors file
pub const LATENT_KEY: &str = "latent";

/// Latent capability of a file item
#[derive(Debug, Clone, Default)]
pub struct LatentState {
    pub latent_path: Option<PathBuf>,
    pub is_latent_cached: bool,
    latent: Option<Tensor>,
}

impl LatentState {
    /// State pointing at an on-disk latent, if one exists
    pub fn from_disk(path: PathBuf) -> Self {
        let is_latent_cached = path.exists();
        Self {
            latent_path: Some(path),
            is_latent_cached,
            latent: None,
        }
    }

    /// Keep an encoded latent in memory
    pub fn set_latent(&mut self, latent: Tensor) {
        self.latent = Some(latent);
        self.is_latent_cached = true;
    }

    pub fn has_latent_in_memory(&self) -> bool {
        self.latent.is_some()
    }

    /// The in-memory latent, or the one on disk loaded onto `device`
    pub fn get_latent(&self, device: &Device) -> Result<Tensor> {
        if let Some(latent) = &self.latent {
            return Ok(latent.clone());
        }
        if !self.is_latent_cached {
            candle_core::bail!("latent is not cached");
        }
        let Some(path) = &self.latent_path else {
            candle_core::bail!("latent is marked cached but has no path");
        };
        let mut tensors = candle_core::safetensors::load(path, device)?;
        tensors.remove(LATENT_KEY).ok_or_else(|| {
            candle_core::Error::Msg(format!("no '{}' tensor in {}", LATENT_KEY, path.display()))
        })
    }

    /// Write the in-memory latent to `path` and remember it
    pub fn save_latent(&mut self, path: &Path) -> Result<()> {
        let Some(latent) = &self.latent else {
            candle_core::bail!("no latent in memory to save");
        };
        let mut tensors = HashMap::new();
        tensors.insert(LATENT_KEY.to_string(), latent.clone());
        candle_core::safetensors::save(&tensors, path)?;
        self.latent_path = Some(path.to_path_buf());
        self.is_latent_cached = true;
        Ok(())
    }

    /// Drop the in-memory copy. A latent on disk stays cached.
    pub fn cleanup(&mut self) {
        self.latent = None;
        if self.latent_path.is_none() {
            self.is_latent_cached = false;
        }
    }
}

/// Location of the cached latent for an image at a given training size
pub fn latent_cache_path(cache_dir: &Path, image_path: &Path, width: u32, height: u32) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    cache_dir.join(format!("{}_{}x{}.safetensors", stem, width, height))
}
