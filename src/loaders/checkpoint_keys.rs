//! Single-file checkpoint parameter names mapped to diffusers module paths
//!
//! Full SD/SDXL checkpoints keep the latent-diffusion UNet layout
//! (`model.diffusion_model.input_blocks.*`, `middle_block`, `output_blocks`).
//! LoRA module names follow the diffusers layout, so matching goes through
//! this mapping while the stored keys stay untouched.

const UNET_PREFIXES: &[&str] = &["model.diffusion_model.", "diffusion_model."];
const TEXT_ENCODER_PREFIXES: &[&str] = &[
    "cond_stage_model.transformer.",
    "conditioner.embedders.0.transformer.",
];
// VAE and OpenCLIP encoders never carry an LCM LoRA
const IGNORED_PREFIXES: &[&str] = &[
    "first_stage_model.",
    "cond_stage_model.model.",
    "conditioner.embedders.1.",
];

/// Resnets per UNet level for SD 1.x/2.x, SDXL, the refiner and SSD-1B
const LAYERS_PER_BLOCK: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointModule {
    Unet(String),
    TextEncoder(String),
}

/// True when any key uses the single-file UNet prefix
pub fn is_checkpoint_format<'a>(mut keys: impl Iterator<Item = &'a String>) -> bool {
    keys.any(|key| UNET_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
}

fn strip_any<'a>(module: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| module.strip_prefix(prefix))
}

/// Component and diffusers module path of an un-prefixed checkpoint module.
///
/// Names that are already in diffusers form come back unchanged as UNet paths.
pub fn checkpoint_module(module: &str) -> Option<CheckpointModule> {
    if IGNORED_PREFIXES.iter().any(|prefix| module.starts_with(prefix)) {
        return None;
    }
    if let Some(rest) = strip_any(module, TEXT_ENCODER_PREFIXES) {
        return Some(CheckpointModule::TextEncoder(rest.to_string()));
    }
    let unet = strip_any(module, UNET_PREFIXES).unwrap_or(module);
    Some(CheckpointModule::Unet(
        ldm_unet_path(unet).unwrap_or_else(|| unet.to_string()),
    ))
}

fn join(base: String, tail: &[&str]) -> String {
    if tail.is_empty() {
        base
    } else {
        format!("{}.{}", base, tail.join("."))
    }
}

fn resnet(base: String, rest: &[&str]) -> Option<String> {
    let (name, tail) = match rest {
        ["in_layers", "0", tail @ ..] => ("norm1", tail),
        ["in_layers", "2", tail @ ..] => ("conv1", tail),
        ["emb_layers", "1", tail @ ..] => ("time_emb_proj", tail),
        ["out_layers", "0", tail @ ..] => ("norm2", tail),
        ["out_layers", "3", tail @ ..] => ("conv2", tail),
        ["skip_connection", tail @ ..] => ("conv_shortcut", tail),
        _ => return None,
    };
    Some(join(format!("{}.{}", base, name), tail))
}

fn down_block(idx: usize, sub: &str, rest: &[&str]) -> Option<String> {
    let k = idx.checked_sub(1)?;
    let block = k / (LAYERS_PER_BLOCK + 1);
    let layer = k % (LAYERS_PER_BLOCK + 1);

    if layer == LAYERS_PER_BLOCK {
        return match (sub, rest) {
            ("0", ["op", tail @ ..]) => Some(join(
                format!("down_blocks.{}.downsamplers.0.conv", block),
                tail,
            )),
            _ => None,
        };
    }
    match sub {
        "0" => resnet(format!("down_blocks.{}.resnets.{}", block, layer), rest),
        "1" => Some(join(format!("down_blocks.{}.attentions.{}", block, layer), rest)),
        _ => None,
    }
}

fn up_block(idx: usize, sub: &str, rest: &[&str]) -> Option<String> {
    let block = idx / (LAYERS_PER_BLOCK + 1);
    let layer = idx % (LAYERS_PER_BLOCK + 1);
    let upsampler = format!("up_blocks.{}.upsamplers.0", block);

    match (sub, rest) {
        ("0", _) => resnet(format!("up_blocks.{}.resnets.{}", block, layer), rest),
        ("1" | "2", ["conv", tail @ ..]) => Some(join(format!("{}.conv", upsampler), tail)),
        ("1", _) => Some(join(format!("up_blocks.{}.attentions.{}", block, layer), rest)),
        _ => None,
    }
}

fn ldm_unet_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('.').collect();
    let mapped = match parts.as_slice() {
        ["input_blocks", "0", "0", tail @ ..] => join("conv_in".to_string(), tail),
        ["time_embed", "0", tail @ ..] => join("time_embedding.linear_1".to_string(), tail),
        ["time_embed", "2", tail @ ..] => join("time_embedding.linear_2".to_string(), tail),
        ["label_emb", "0", "0", tail @ ..] => join("add_embedding.linear_1".to_string(), tail),
        ["label_emb", "0", "2", tail @ ..] => join("add_embedding.linear_2".to_string(), tail),
        ["out", "0", tail @ ..] => join("conv_norm_out".to_string(), tail),
        ["out", "2", tail @ ..] => join("conv_out".to_string(), tail),
        ["input_blocks", idx, sub, rest @ ..] => down_block(idx.parse().ok()?, sub, rest)?,
        ["output_blocks", idx, sub, rest @ ..] => up_block(idx.parse().ok()?, sub, rest)?,
        ["middle_block", "0", rest @ ..] => resnet("mid_block.resnets.0".to_string(), rest)?,
        ["middle_block", "1", rest @ ..] => join("mid_block.attentions.0".to_string(), rest),
        ["middle_block", "2", rest @ ..] => resnet("mid_block.resnets.1".to_string(), rest)?,
        _ => return None,
    };
    Some(mapped)
}
