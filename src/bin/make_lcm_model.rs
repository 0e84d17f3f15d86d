//! Fuse an LCM LoRA into a base model and save the result
//!
//! Usage: cargo run --bin make_lcm_model -- /path/to/model /path/to/output.safetensors --sdxl

use anyhow::Result;
use candle_core::{DType, Device};
use clap::Parser;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;

use difftune::loaders::{fuse_lora, resolve_adapter_weights};
use difftune::{AdapterFlags, BaseModel, LcmAdapter, LoraAdapter, ModelConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fuse an LCM LoRA into a Stable Diffusion model")]
struct Args {
    /// Path to base model (safetensors file or diffusers directory)
    input_path: PathBuf,

    /// Output path
    output_path: PathBuf,

    /// Is SDXL model
    #[arg(long)]
    sdxl: bool,

    /// Is refiner model
    #[arg(long)]
    refiner: bool,

    /// Is SSD model
    #[arg(long)]
    ssd: bool,

    /// Is SD 2 model
    #[arg(long)]
    sd2: bool,

    /// Use local adapter weights instead of downloading them
    #[arg(long)]
    adapter_path: Option<PathBuf>,

    /// Strength of the fused adapter
    #[arg(long, default_value_t = 1.0)]
    lora_scale: f32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    difftune::logging::init_logger();

    let device = Device::Cpu;
    let dtype = DType::F32;
    let flags = AdapterFlags {
        sdxl: args.sdxl,
        refiner: args.refiner,
        ssd: args.ssd,
        sd2: args.sd2,
    };

    info!("Loading model from {}", args.input_path.display());

    let adapter = LcmAdapter::select(&flags);
    let adapter_file = resolve_adapter_weights(adapter, args.adapter_path.as_deref())?;

    let config = ModelConfig::from_flags(&args.input_path, &flags, dtype);
    let mut model = BaseModel::load(config, &device)?;

    info!("Loaded model from {}", args.input_path.display());

    let lora = LoraAdapter::load(&adapter_file, &device)?;
    fuse_lora(&mut model, &lora, args.lora_scale)?;

    model.save(&args.output_path, HashMap::new())?;

    info!("Saved to {}", args.output_path.display());
    Ok(())
}
