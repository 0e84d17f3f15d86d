//! Dataset folder scanning
//!
//! Handles building file items from a dataset folder with:
//! - Size probing through one shared load context, persisted between runs
//! - Caption file loading (.txt or .json)
//! - Sidecar control / mask / clip image / unconditional images
//! - Detection of latents cached on disk

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::caption::CaptionState;
use super::conditioning::{find_sidecar, IMAGE_EXTENSIONS};
use super::file_item::{FileItem, FileItemOverrides};
use super::image_size::ImageSizeProbe;
use super::latent::{latent_cache_path, LatentState};
use super::load_context::{LoadContext, SizeCache};
use super::DatasetConfig;

/// All file items of one dataset folder, in path order
pub struct FileItemDataset {
    config: DatasetConfig,
    items: Vec<FileItem>,
}

impl FileItemDataset {
    pub fn load(config: &DatasetConfig, probe: &dyn ImageSizeProbe) -> Result<Self> {
        let image_paths = scan_images(&config.folder_path)?;
        if image_paths.is_empty() {
            anyhow::bail!("No images found in dataset: {}", config.folder_path.display());
        }

        let size_cache_file = config.size_cache_file();
        let mut ctx = LoadContext::with_size_cache(SizeCache::load(&size_cache_file)?);
        let cached_sizes = ctx.size_cache.len();

        let progress = ScanProgress::new(image_paths.len());
        let mut items = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            items.push(build_item(path, config, &mut ctx, probe)?);
            progress.inc();
        }
        progress.finish();

        if ctx.size_cache.len() != cached_sizes {
            if let Err(e) = ctx.size_cache.save(&size_cache_file) {
                warn!("Could not persist size cache: {:#}", e);
            }
        }

        let cached_latents = items.iter().filter(|x| x.is_latent_cached()).count();
        info!(
            "Dataset loaded: {} ({} items, {} cached latents)",
            config.folder_path.display(),
            items.len(),
            cached_latents
        );

        Ok(Self {
            config: config.clone(),
            items,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[FileItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [FileItem] {
        &mut self.items
    }

    /// Split into consecutive groups of `batch_size`; the last may be shorter.
    /// A batch size of zero is an error.
    pub fn into_batches(self, batch_size: usize) -> Result<Vec<Vec<FileItem>>> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }
        let mut batches = Vec::with_capacity(self.items.len().div_ceil(batch_size));
        let mut items = self.items.into_iter().peekable();
        while items.peek().is_some() {
            batches.push(items.by_ref().take(batch_size).collect());
        }
        Ok(batches)
    }
}

fn scan_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(folder)
        .with_context(|| format!("Failed to read dataset directory: {}", folder.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn build_item(
    path: PathBuf,
    config: &DatasetConfig,
    ctx: &mut LoadContext,
    probe: &dyn ImageSizeProbe,
) -> Result<FileItem> {
    let caption = CaptionState::load(&path, &config.caption_ext)?;
    let mut item = FileItem::new(path, config, FileItemOverrides::default(), ctx, probe)?;
    item.caption = caption;

    let sidecar = |folder: &Option<PathBuf>| {
        folder
            .as_deref()
            .and_then(|folder| find_sidecar(folder, &item.path))
    };
    let control_path = sidecar(&config.control_path);
    let mask_path = sidecar(&config.mask_path);
    let clip_image_path = sidecar(&config.clip_image_path);
    let unconditional_path = sidecar(&config.unconditional_path);

    item.control.control_path = control_path;
    item.mask.mask_path = mask_path;
    item.clip_image.clip_image_path = clip_image_path;
    item.unconditional.unconditional_path = unconditional_path;

    if config.cache_latents_to_disk {
        let cache_path = latent_cache_path(
            &config.latent_cache_dir(),
            &item.path,
            item.crop_width,
            item.crop_height,
        );
        item.latent = LatentState::from_disk(cache_path);
    }

    Ok(item)
}

#[cfg(feature = "progress-bar")]
struct ScanProgress(indicatif::ProgressBar);

#[cfg(feature = "progress-bar")]
impl ScanProgress {
    fn new(len: usize) -> Self {
        let bar = indicatif::ProgressBar::new(len as u64);
        if let Ok(style) =
            indicatif::ProgressStyle::with_template("Scanning dataset [{bar:40}] {pos}/{len}")
        {
            bar.set_style(style);
        }
        Self(bar)
    }

    fn inc(&self) {
        self.0.inc(1);
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

#[cfg(not(feature = "progress-bar"))]
struct ScanProgress;

#[cfg(not(feature = "progress-bar"))]
impl ScanProgress {
    fn new(_len: usize) -> Self {
        Self
    }

    fn inc(&self) {}

    fn finish(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::image_size::tests::FixedProbe;
    use crate::data::DataLoaderBatch;
    use candle_core::{DType, Device, Tensor};
    use image::{GrayImage, RgbImage};
    use std::collections::HashMap;

    fn write_dataset(dir: &Path) {
        RgbImage::new(32, 16).save(dir.join("a.png")).unwrap();
        RgbImage::new(16, 16).save(dir.join("b.png")).unwrap();
        RgbImage::new(8, 8).save(dir.join("c.jpg")).unwrap();
        fs::write(dir.join("a.txt"), "first image").unwrap();
        fs::write(dir.join("notes.md"), "ignored").unwrap();
    }

    #[test]
    fn test_load_scans_sorted_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path());
        let config = DatasetConfig::new(dir.path());

        let dataset = FileItemDataset::load(&config, &crate::data::ImageCrateProbe)?;
        let names: Vec<_> = dataset
            .items()
            .iter()
            .map(|x| x.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.jpg"]);
        assert_eq!((dataset.items()[0].width, dataset.items()[0].height), (32, 16));
        assert_eq!(dataset.items()[0].caption.caption, "first image");
        assert!(dataset.items()[1].caption.caption.is_empty());

        // Sizes were persisted for the next load
        let cache = SizeCache::load(&config.size_cache_file())?;
        assert_eq!(cache.get("c.jpg"), Some((8, 8)));
        Ok(())
    }

    #[test]
    fn test_persisted_sizes_skip_probing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path());
        let config = DatasetConfig::new(dir.path());

        let mut cache = SizeCache::new();
        for name in ["a.png", "b.png", "c.jpg"] {
            cache.insert(name, (100, 50));
        }
        cache.save(&config.size_cache_file())?;

        let probe = FixedProbe::fast((1, 1));
        let dataset = FileItemDataset::load(&config, &probe)?;
        assert_eq!(probe.fast_calls.get(), 0);
        assert!(dataset.items().iter().all(|x| (x.width, x.height) == (100, 50)));
        Ok(())
    }

    #[test]
    fn test_empty_folder_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasetConfig::new(dir.path());
        assert!(FileItemDataset::load(&config, &FixedProbe::fast((1, 1))).is_err());
    }

    #[test]
    fn test_sidecars_and_cached_latents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path());
        let masks = dir.path().join("masks");
        fs::create_dir(&masks)?;
        GrayImage::new(16, 16).save(masks.join("b.png"))?;

        let mut config = DatasetConfig::new(dir.path());
        config.mask_path = Some(masks.clone());
        config.cache_latents_to_disk = true;
        fs::create_dir(config.latent_cache_dir())?;
        let mut latents = HashMap::new();
        latents.insert("latent".to_string(), Tensor::ones((4, 1, 1), DType::F32, &Device::Cpu)?);
        candle_core::safetensors::save(&latents, config.latent_cache_dir().join("c_8x8.safetensors"))?;

        let dataset = FileItemDataset::load(&config, &crate::data::ImageCrateProbe)?;
        let items = dataset.items();
        assert!(items[0].mask.mask_path.is_none());
        assert_eq!(items[1].mask.mask_path, Some(masks.join("b.png")));
        assert!(!items[0].is_latent_cached());
        assert!(items[2].is_latent_cached());
        Ok(())
    }

    #[test]
    fn test_into_batches_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path());
        let mut config = DatasetConfig::new(dir.path());
        config.scale = 0.5;

        let mut dataset = FileItemDataset::load(&config, &crate::data::ImageCrateProbe)?;
        for item in dataset.items_mut() {
            // Square crops so every image in a batch has the same shape
            item.crop_width = 4;
            item.crop_height = 4;
            item.load_tensors(&Device::Cpu)?;
        }

        let batches = dataset.into_batches(2)?;
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);

        for items in batches {
            let n = items.len();
            let batch = DataLoaderBatch::new(items)?;
            assert_eq!(batch.tensor.as_ref().unwrap().dims(), &[n, 3, 4, 4]);
        }
        Ok(())
    }

    #[test]
    fn test_into_batches_rejects_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path());
        let dataset = FileItemDataset::load(&DatasetConfig::new(dir.path()), &crate::data::ImageCrateProbe)?;
        assert!(dataset.into_batches(0).is_err());
        Ok(())
    }
}
