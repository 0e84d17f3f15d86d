//! A single training example
//!
//! Per-item behaviour is split into capability structs (caption, latent,
//! control, clip image, mask, unconditional, augmentation) that the item
//! drives by delegation.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::path::PathBuf;

use super::caption::CaptionState;
use super::conditioning::{
    AugmentationState, ClipImageState, ControlState, MaskState, UnconditionalState,
};
use super::image_processing::{load_rgb_tensor, ImageTransform};
use super::image_size::{resolve_image_size, ImageSizeProbe};
use super::latent::LatentState;
use super::load_context::LoadContext;
use super::DatasetConfig;

/// Per-item values that replace the ones derived from the dataset config
#[derive(Debug, Clone, Default)]
pub struct FileItemOverrides {
    pub raw_caption: Option<String>,
    pub scale_to_width: Option<u32>,
    pub scale_to_height: Option<u32>,
    pub crop_x: Option<u32>,
    pub crop_y: Option<u32>,
    pub crop_width: Option<u32>,
    pub crop_height: Option<u32>,
    pub flip_x: Option<bool>,
    pub flip_y: Option<bool>,
    pub extra_values: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    /// Raw image size
    pub width: u32,
    pub height: u32,
    // we scale first, then crop
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    // crop values are from scaled size
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    pub flip_x: bool,
    pub flip_y: bool,
    pub augments: Vec<String>,
    pub loss_multiplier: f32,
    pub network_weight: f32,
    pub is_reg: bool,
    pub tensor: Option<Tensor>,
    pub extra_values: Vec<f32>,

    pub caption: CaptionState,
    pub latent: LatentState,
    pub control: ControlState,
    pub clip_image: ClipImageState,
    pub mask: MaskState,
    pub unconditional: UnconditionalState,
    pub augmentation: AugmentationState,
}

impl FileItem {
    /// Build an item, resolving its raw size through the load context.
    ///
    /// Capabilities start empty; [`FileItemDataset`](super::FileItemDataset)
    /// fills in caption and sidecar paths.
    pub fn new(
        path: impl Into<PathBuf>,
        config: &DatasetConfig,
        overrides: FileItemOverrides,
        ctx: &mut LoadContext,
        probe: &dyn ImageSizeProbe,
    ) -> Result<Self> {
        let path = path.into();
        let (width, height) = resolve_image_size(&path, probe, ctx)?;

        let scale_to_width = overrides
            .scale_to_width
            .unwrap_or_else(|| scaled(width, config.scale));
        let scale_to_height = overrides
            .scale_to_height
            .unwrap_or_else(|| scaled(height, config.scale));

        Ok(Self {
            path,
            width,
            height,
            scale_to_width,
            scale_to_height,
            crop_x: overrides.crop_x.unwrap_or(0),
            crop_y: overrides.crop_y.unwrap_or(0),
            crop_width: overrides.crop_width.unwrap_or(scale_to_width),
            crop_height: overrides.crop_height.unwrap_or(scale_to_height),
            flip_x: overrides.flip_x.unwrap_or(false),
            flip_y: overrides.flip_y.unwrap_or(false),
            augments: config.augments.clone(),
            loss_multiplier: config.loss_multiplier,
            network_weight: config.network_weight,
            is_reg: config.is_reg,
            tensor: None,
            extra_values: overrides.extra_values,
            caption: CaptionState::from_raw(overrides.raw_caption),
            latent: LatentState::default(),
            control: ControlState::default(),
            clip_image: ClipImageState::default(),
            mask: MaskState::default(),
            unconditional: UnconditionalState::default(),
            augmentation: AugmentationState::default(),
        })
    }

    pub fn transform(&self) -> ImageTransform {
        ImageTransform {
            scale_to_width: self.scale_to_width,
            scale_to_height: self.scale_to_height,
            crop_x: self.crop_x,
            crop_y: self.crop_y,
            crop_width: self.crop_width,
            crop_height: self.crop_height,
            flip_x: self.flip_x,
            flip_y: self.flip_y,
        }
    }

    pub fn is_latent_cached(&self) -> bool {
        self.latent.is_latent_cached
    }

    pub fn get_latent(&self, device: &Device) -> candle_core::Result<Tensor> {
        self.latent.get_latent(device)
    }

    /// Load the image tensor and every configured conditioning image.
    ///
    /// The image itself is skipped when its latent is already cached.
    pub fn load_tensors(&mut self, device: &Device) -> Result<()> {
        let transform = self.transform();
        if !self.is_latent_cached() {
            self.tensor = Some(load_rgb_tensor(&self.path, &transform, device)?);
        }
        self.control.load(&transform, device)?;
        self.clip_image.load(&transform, device)?;
        self.mask.load(&transform, device)?;
        self.unconditional.load(&transform, device)?;
        Ok(())
    }

    /// Replace the image tensor with `augment(tensor)`, keeping the original.
    ///
    /// No-op when the dataset declares no augments or no tensor is loaded.
    pub fn apply_augmentation<F>(&mut self, augment: F) -> Result<()>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        if self.augments.is_empty() {
            return Ok(());
        }
        if let Some(tensor) = self.tensor.take() {
            let augmented = augment(&tensor)?;
            self.augmentation.unaugmented_tensor = Some(tensor);
            self.tensor = Some(augmented);
        }
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.tensor = None;
        self.latent.cleanup();
        self.control.cleanup();
        self.clip_image.cleanup();
        self.mask.cleanup();
        self.unconditional.cleanup();
        self.augmentation.cleanup();
    }
}

/// `floor(dim * scale)`, snapping products that land a rounding error below
/// a whole number (`1000 * 0.29`) back onto it
fn scaled(dim: u32, scale: f64) -> u32 {
    let value = dim as f64 * scale;
    let nearest = value.round();
    if (value - nearest).abs() < 1e-6 {
        nearest as u32
    } else {
        value.floor() as u32
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::image_size::tests::FixedProbe;
    use candle_core::DType;

    pub(crate) fn item_with_size(name: &str, size: (u32, u32)) -> FileItem {
        let config = DatasetConfig::new("/data");
        let mut ctx = LoadContext::new();
        FileItem::new(
            format!("/data/{}", name),
            &config,
            FileItemOverrides::default(),
            &mut ctx,
            &FixedProbe::fast(size),
        )
        .unwrap()
    }

    #[test]
    fn test_scale_and_default_crop() {
        let mut config = DatasetConfig::new("/data");
        config.scale = 0.5;
        config.loss_multiplier = 2.0;
        config.network_weight = 0.7;
        config.is_reg = true;
        let mut ctx = LoadContext::new();

        let item = FileItem::new(
            "/data/a.png",
            &config,
            FileItemOverrides::default(),
            &mut ctx,
            &FixedProbe::fast((1001, 640)),
        )
        .unwrap();

        assert_eq!((item.width, item.height), (1001, 640));
        assert_eq!((item.scale_to_width, item.scale_to_height), (500, 320));
        assert_eq!(
            (item.crop_x, item.crop_y, item.crop_width, item.crop_height),
            (0, 0, 500, 320)
        );
        assert!(!item.flip_x && !item.flip_y);
        assert_eq!(item.loss_multiplier, 2.0);
        assert_eq!(item.network_weight, 0.7);
        assert!(item.is_reg);
        assert_eq!(ctx.size_cache.get("a.png"), Some((1001, 640)));
    }

    #[test]
    fn test_scale_matches_configured_decimal() {
        let config: DatasetConfig =
            serde_yaml::from_str("folder_path: /data\nscale: 0.7\n").unwrap();
        let mut ctx = LoadContext::new();
        let item = FileItem::new(
            "/data/a.png",
            &config,
            FileItemOverrides::default(),
            &mut ctx,
            &FixedProbe::fast((1000, 1000)),
        )
        .unwrap();
        assert_eq!((item.scale_to_width, item.scale_to_height), (700, 700));

        assert_eq!(scaled(1000, 0.9), 900);
        assert_eq!(scaled(100, 0.29), 29);
        assert_eq!(scaled(1001, 0.5), 500);
    }

    #[test]
    fn test_overrides_win() {
        let config = DatasetConfig::new("/data");
        let mut ctx = LoadContext::new();
        let overrides = FileItemOverrides {
            raw_caption: Some("a red fox".to_string()),
            scale_to_width: Some(256),
            scale_to_height: Some(128),
            crop_x: Some(10),
            crop_width: Some(64),
            flip_y: Some(true),
            ..Default::default()
        };

        let item = FileItem::new(
            "/data/fox.png",
            &config,
            overrides,
            &mut ctx,
            &FixedProbe::fast((512, 512)),
        )
        .unwrap();

        assert_eq!((item.scale_to_width, item.scale_to_height), (256, 128));
        assert_eq!((item.crop_x, item.crop_y), (10, 0));
        assert_eq!((item.crop_width, item.crop_height), (64, 128));
        assert!(!item.flip_x);
        assert!(item.flip_y);
        assert_eq!(item.caption.caption, "a red fox");
    }

    #[test]
    fn test_cleanup_clears_all_tensors() -> candle_core::Result<()> {
        let mut item = item_with_size("x.png", (8, 8));
        let t = Tensor::ones((3, 8, 8), DType::F32, &Device::Cpu)?;
        item.tensor = Some(t.clone());
        item.latent.set_latent(t.clone());
        item.control.control_tensor = Some(t.clone());
        item.clip_image.clip_image_tensor = Some(t.clone());
        item.clip_image.clip_image_embeds = Some(Default::default());
        item.mask.mask_tensor = Some(t.clone());
        item.unconditional.unconditional_tensor = Some(t.clone());
        item.augmentation.unaugmented_tensor = Some(t);

        item.cleanup();

        assert!(item.tensor.is_none());
        assert!(!item.latent.has_latent_in_memory());
        assert!(item.control.control_tensor.is_none());
        assert!(item.clip_image.clip_image_tensor.is_none());
        assert!(item.clip_image.clip_image_embeds.is_none());
        assert!(item.mask.mask_tensor.is_none());
        assert!(item.unconditional.unconditional_tensor.is_none());
        assert!(item.augmentation.unaugmented_tensor.is_none());
        Ok(())
    }

    #[test]
    fn test_apply_augmentation_keeps_original() -> Result<()> {
        let mut item = item_with_size("x.png", (4, 4));
        item.augments = vec!["invert".to_string()];
        item.tensor = Some(Tensor::ones((3, 4, 4), DType::F32, &Device::Cpu)?);

        item.apply_augmentation(|t| Ok(t.neg()?))?;

        let augmented = item.tensor.as_ref().unwrap().sum_all()?.to_scalar::<f32>()?;
        let original = item
            .augmentation
            .unaugmented_tensor
            .as_ref()
            .unwrap()
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(augmented, -48.0);
        assert_eq!(original, 48.0);
        Ok(())
    }

    #[test]
    fn test_load_tensors_skips_image_when_latent_cached() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("img.png");
        image::RgbImage::new(16, 16).save(&path)?;

        let config = DatasetConfig::new(dir.path());
        let mut ctx = LoadContext::new();
        let mut item = FileItem::new(
            &path,
            &config,
            FileItemOverrides::default(),
            &mut ctx,
            &crate::data::ImageCrateProbe,
        )?;

        item.load_tensors(&Device::Cpu)?;
        assert_eq!(item.tensor.as_ref().map(|t| t.dims().to_vec()), Some(vec![3, 16, 16]));

        item.cleanup();
        item.latent.set_latent(Tensor::zeros((4, 2, 2), DType::F32, &Device::Cpu)?);
        item.load_tensors(&Device::Cpu)?;
        assert!(item.tensor.is_none());
        Ok(())
    }
}
