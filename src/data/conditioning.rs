//! Optional conditioning carried by a training item
//!
//! Each capability owns the tensor(s) it contributes to a batch and knows how
//! to release them. Paths point at sidecar images sharing the item's file stem.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::image_processing::{load_mask_tensor, load_rgb_tensor, ImageTransform};

/// Image extensions recognised for training and sidecar images
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif"];

/// Named tensors produced by an image encoder for one item
pub type ClipImageEmbeds = HashMap<String, Tensor>;

/// Find `<folder>/<stem>.<ext>` for any known image extension
pub fn find_sidecar(folder: &Path, image_path: &Path) -> Option<PathBuf> {
    let stem = image_path.file_stem()?.to_string_lossy();
    IMAGE_EXTENSIONS.iter().find_map(|ext| {
        let candidate = folder.join(format!("{}.{}", stem, ext));
        candidate.exists().then_some(candidate)
    })
}

#[derive(Debug, Clone, Default)]
pub struct ControlState {
    pub control_path: Option<PathBuf>,
    pub control_tensor: Option<Tensor>,
}

impl ControlState {
    pub fn load(&mut self, transform: &ImageTransform, device: &Device) -> Result<()> {
        if let Some(path) = &self.control_path {
            self.control_tensor = Some(load_rgb_tensor(path, transform, device)?);
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.control_tensor = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClipImageState {
    pub clip_image_path: Option<PathBuf>,
    pub clip_image_tensor: Option<Tensor>,
    pub clip_image_embeds: Option<ClipImageEmbeds>,
    pub clip_image_embeds_unconditional: Option<ClipImageEmbeds>,
}

impl ClipImageState {
    pub fn load(&mut self, transform: &ImageTransform, device: &Device) -> Result<()> {
        if let Some(path) = &self.clip_image_path {
            self.clip_image_tensor = Some(load_rgb_tensor(path, transform, device)?);
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.clip_image_tensor = None;
        self.clip_image_embeds = None;
        self.clip_image_embeds_unconditional = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaskState {
    pub mask_path: Option<PathBuf>,
    pub mask_tensor: Option<Tensor>,
}

impl MaskState {
    pub fn load(&mut self, transform: &ImageTransform, device: &Device) -> Result<()> {
        if let Some(path) = &self.mask_path {
            self.mask_tensor = Some(load_mask_tensor(path, transform, device)?);
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.mask_tensor = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnconditionalState {
    pub unconditional_path: Option<PathBuf>,
    pub unconditional_tensor: Option<Tensor>,
}

impl UnconditionalState {
    pub fn load(&mut self, transform: &ImageTransform, device: &Device) -> Result<()> {
        if let Some(path) = &self.unconditional_path {
            self.unconditional_tensor = Some(load_rgb_tensor(path, transform, device)?);
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.unconditional_tensor = None;
    }
}

/// Holds the image tensor as it was before augmentation
#[derive(Debug, Clone, Default)]
pub struct AugmentationState {
    pub unaugmented_tensor: Option<Tensor>,
}

impl AugmentationState {
    pub fn cleanup(&mut self) {
        self.unaugmented_tensor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_find_sidecar_matches_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dog.png"), b"").unwrap();

        let found = find_sidecar(dir.path(), Path::new("/train/dog.jpg"));
        assert_eq!(found, Some(dir.path().join("dog.png")));
        assert_eq!(find_sidecar(dir.path(), Path::new("/train/cat.jpg")), None);
    }

    #[test]
    fn test_control_load_uses_transform() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrl.png");
        RgbImage::new(32, 16).save(&path)?;

        let transform = ImageTransform {
            scale_to_width: 16,
            scale_to_height: 8,
            crop_x: 0,
            crop_y: 0,
            crop_width: 8,
            crop_height: 8,
            flip_x: false,
            flip_y: false,
        };
        let mut control = ControlState {
            control_path: Some(path),
            control_tensor: None,
        };
        control.load(&transform, &Device::Cpu)?;
        assert_eq!(control.control_tensor.as_ref().map(|t| t.dims().to_vec()), Some(vec![3, 8, 8]));

        control.cleanup();
        assert!(control.control_tensor.is_none());
        assert!(control.control_path.is_some());
        Ok(())
    }
}
