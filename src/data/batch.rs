//! Batch assembly from file items
//!
//! Optional per-item tensors are collated into dense batch tensors. When only
//! some items carry a tensor field, the rest are padded with zeros shaped like
//! the first item that has it. Clip embeddings have no such fallback: they must
//! be present on every item or on none.

use candle_core::{Device, Tensor};
use log::error;

use super::collate::{collect_all_or_none, stack_with_zero_fill, AllOrNone};
use super::conditioning::ClipImageEmbeds;
use super::file_item::FileItem;

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("Cannot build a batch from zero file items")]
    Empty,
    #[error("No image tensor loaded for {0} and its latent is not cached")]
    MissingImageTensor(String),
    #[error("{field} is None for some file items (first missing: {path})")]
    InconsistentEmbeddings { field: &'static str, path: String },
    #[error("Expected {expected} extra values for {path}, found {found}")]
    ExtraValuesLength {
        path: String,
        expected: usize,
        found: usize,
    },
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// One training step worth of items and their collated tensors
#[derive(Debug)]
pub struct DataLoaderBatch {
    pub file_items: Vec<FileItem>,
    /// Image tensors, only when not every latent is cached
    pub tensor: Option<Tensor>,
    /// Cached latents, only when every latent is cached
    pub latents: Option<Tensor>,
    pub control_tensor: Option<Tensor>,
    pub clip_image_tensor: Option<Tensor>,
    pub mask_tensor: Option<Tensor>,
    pub unaugmented_tensor: Option<Tensor>,
    pub unconditional_tensor: Option<Tensor>,
    pub clip_image_embeds: Option<Vec<ClipImageEmbeds>>,
    pub clip_image_embeds_unconditional: Option<Vec<ClipImageEmbeds>>,
    /// Filled in by the training loop
    pub sigmas: Option<Tensor>,
    pub extra_values: Option<Tensor>,
    pub loss_multiplier_list: Vec<f32>,
}

impl DataLoaderBatch {
    /// Collate `file_items` into a batch. Latents stored on disk are loaded to CPU.
    ///
    /// Errors are logged before being returned; no partial batch is produced.
    pub fn new(file_items: Vec<FileItem>) -> Result<Self, BatchError> {
        Self::assemble(file_items).map_err(|e| {
            error!("{}", e);
            e
        })
    }

    fn assemble(file_items: Vec<FileItem>) -> Result<Self, BatchError> {
        if file_items.is_empty() {
            return Err(BatchError::Empty);
        }
        let device = Device::Cpu;

        let is_latents_cached = file_items.iter().all(|x| x.is_latent_cached());

        let (tensor, latents) = if is_latents_cached {
            let latents = file_items
                .iter()
                .map(|x| x.get_latent(&device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            (None, Some(Tensor::stack(&latents, 0)?))
        } else {
            // only return a tensor if latents are not cached
            let tensors = file_items
                .iter()
                .map(|x| {
                    x.tensor
                        .clone()
                        .ok_or_else(|| BatchError::MissingImageTensor(x.path.display().to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            (Some(Tensor::stack(&tensors, 0)?), None)
        };

        let control_tensor = stack_with_zero_fill(
            &file_items.iter().map(|x| x.control.control_tensor.as_ref()).collect::<Vec<_>>(),
        )?;
        let clip_image_tensor = stack_with_zero_fill(
            &file_items
                .iter()
                .map(|x| x.clip_image.clip_image_tensor.as_ref())
                .collect::<Vec<_>>(),
        )?;
        let mask_tensor = stack_with_zero_fill(
            &file_items.iter().map(|x| x.mask.mask_tensor.as_ref()).collect::<Vec<_>>(),
        )?;
        let unaugmented_tensor = stack_with_zero_fill(
            &file_items
                .iter()
                .map(|x| x.augmentation.unaugmented_tensor.as_ref())
                .collect::<Vec<_>>(),
        )?;
        let unconditional_tensor = stack_with_zero_fill(
            &file_items
                .iter()
                .map(|x| x.unconditional.unconditional_tensor.as_ref())
                .collect::<Vec<_>>(),
        )?;

        let clip_image_embeds = all_or_none_embeds(&file_items, "clip_image_embeds", |x| {
            x.clip_image.clip_image_embeds.as_ref()
        })?;
        let clip_image_embeds_unconditional =
            all_or_none_embeds(&file_items, "clip_image_embeds_unconditional", |x| {
                x.clip_image.clip_image_embeds_unconditional.as_ref()
            })?;

        let extra_values = stack_extra_values(&file_items, &device)?;
        let loss_multiplier_list = file_items.iter().map(|x| x.loss_multiplier).collect();

        Ok(Self {
            file_items,
            tensor,
            latents,
            control_tensor,
            clip_image_tensor,
            mask_tensor,
            unaugmented_tensor,
            unconditional_tensor,
            clip_image_embeds,
            clip_image_embeds_unconditional,
            sigmas: None,
            extra_values,
            loss_multiplier_list,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.file_items.len()
    }

    pub fn get_is_reg_list(&self) -> Vec<bool> {
        self.file_items.iter().map(|x| x.is_reg).collect()
    }

    pub fn get_network_weight_list(&self) -> Vec<f32> {
        self.file_items.iter().map(|x| x.network_weight).collect()
    }

    pub fn get_caption_list(
        &self,
        trigger: Option<&str>,
        to_replace_list: &[String],
        add_if_not_present: bool,
    ) -> Vec<String> {
        self.file_items
            .iter()
            .map(|x| x.caption.get_caption(trigger, to_replace_list, add_if_not_present))
            .collect()
    }

    pub fn get_caption_short_list(
        &self,
        trigger: Option<&str>,
        to_replace_list: &[String],
        add_if_not_present: bool,
    ) -> Vec<String> {
        self.file_items
            .iter()
            .map(|x| x.caption.get_caption_short(trigger, to_replace_list, add_if_not_present))
            .collect()
    }

    /// Release the batch tensors and clean up every member item
    pub fn cleanup(&mut self) {
        self.latents = None;
        self.tensor = None;
        self.control_tensor = None;
        self.clip_image_tensor = None;
        self.mask_tensor = None;
        self.unaugmented_tensor = None;
        self.unconditional_tensor = None;
        self.clip_image_embeds = None;
        self.clip_image_embeds_unconditional = None;
        self.sigmas = None;
        self.extra_values = None;
        for file_item in &mut self.file_items {
            file_item.cleanup();
        }
    }
}

fn all_or_none_embeds<'a>(
    file_items: &'a [FileItem],
    field: &'static str,
    get: impl Fn(&'a FileItem) -> Option<&'a ClipImageEmbeds>,
) -> Result<Option<Vec<ClipImageEmbeds>>, BatchError> {
    let values = file_items.iter().map(get).collect::<Vec<_>>();
    match collect_all_or_none(&values) {
        AllOrNone::None => Ok(None),
        AllOrNone::All(embeds) => Ok(Some(embeds)),
        AllOrNone::Partial(idx) => Err(BatchError::InconsistentEmbeddings {
            field,
            path: file_items[idx].path.display().to_string(),
        }),
    }
}

/// `(N, K)` tensor of extra values, when the first item declares any
fn stack_extra_values(file_items: &[FileItem], device: &Device) -> Result<Option<Tensor>, BatchError> {
    let expected = file_items[0].extra_values.len();
    if expected == 0 {
        return Ok(None);
    }

    let mut flat = Vec::with_capacity(expected * file_items.len());
    for item in file_items {
        if item.extra_values.len() != expected {
            return Err(BatchError::ExtraValuesLength {
                path: item.path.display().to_string(),
                expected,
                found: item.extra_values.len(),
            });
        }
        flat.extend_from_slice(&item.extra_values);
    }

    Ok(Some(Tensor::from_vec(flat, (file_items.len(), expected), device)?))
}
