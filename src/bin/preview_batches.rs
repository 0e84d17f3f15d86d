//! Load a dataset and report the shape of every batch it produces
//!
//! Usage: cargo run --bin preview_batches -- /path/to/dataset.yaml --batch-size 4

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use difftune::{load_dataset_config, DataLoaderBatch, FileItemDataset, ImageCrateProbe};

#[derive(Parser, Debug)]
#[command(author, version, about = "Preview collated training batches")]
struct Args {
    /// Path to the dataset configuration YAML file
    config: PathBuf,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    batch_size: u64,

    /// Trigger word substituted into captions
    #[arg(long)]
    trigger: Option<String>,
}

fn describe(name: &str, tensor: &Option<Tensor>) {
    if let Some(tensor) = tensor {
        info!("  {}: {:?}", name, tensor.dims());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    difftune::logging::init_logger();

    let config = load_dataset_config(&args.config)?;
    let mut dataset = FileItemDataset::load(&config, &ImageCrateProbe)?;

    let device = Device::Cpu;
    for item in dataset.items_mut() {
        item.load_tensors(&device)
            .with_context(|| format!("Failed to load tensors for {}", item.path.display()))?;
    }

    for (idx, items) in dataset.into_batches(args.batch_size as usize)?.into_iter().enumerate() {
        let mut batch = DataLoaderBatch::new(items)?;
        info!("Batch {} ({} items)", idx, batch.batch_size());
        describe("tensor", &batch.tensor);
        describe("latents", &batch.latents);
        describe("control_tensor", &batch.control_tensor);
        describe("clip_image_tensor", &batch.clip_image_tensor);
        describe("mask_tensor", &batch.mask_tensor);
        describe("unconditional_tensor", &batch.unconditional_tensor);
        for caption in batch.get_caption_list(args.trigger.as_deref(), &[], true) {
            info!("  caption: {}", caption);
        }
        batch.cleanup();
    }

    Ok(())
}
