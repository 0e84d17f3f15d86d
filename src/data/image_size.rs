//! Image size probing
//!
//! The fast path reads only the header of formats with cheap dimension
//! parsing. Everything else goes through a decoder that also honours the
//! EXIF orientation.

use image::{ImageDecoder, ImageFormat, ImageReader};
use image::metadata::Orientation;
use std::path::Path;

use super::load_context::LoadContext;

pub const SLOW_READ_WARNING: &str =
    "Warning: Some images in the dataset cannot be fast read. This process is faster for png, jpeg";

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("Unknown image format: {0}")]
    UnknownFormat(String),
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Source of image dimensions, swappable in tests
pub trait ImageSizeProbe {
    /// Header-only read. Must return `ProbeError::UnknownFormat` for formats it cannot handle.
    fn fast_size(&self, path: &Path) -> Result<(u32, u32), ProbeError>;

    /// Full decode with orientation normalisation
    fn decoded_size(&self, path: &Path) -> Result<(u32, u32), ProbeError>;
}

/// Probe backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateProbe;

impl ImageCrateProbe {
    fn open(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>, ProbeError> {
        let io_err = |source| ProbeError::Io {
            path: path.display().to_string(),
            source,
        };
        ImageReader::open(path)
            .map_err(io_err)?
            .with_guessed_format()
            .map_err(io_err)
    }
}

impl ImageSizeProbe for ImageCrateProbe {
    fn fast_size(&self, path: &Path) -> Result<(u32, u32), ProbeError> {
        let reader = Self::open(path)?;
        match reader.format() {
            Some(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif | ImageFormat::Bmp) => {}
            _ => return Err(ProbeError::UnknownFormat(path.display().to_string())),
        }
        reader.into_dimensions().map_err(|source| ProbeError::Decode {
            path: path.display().to_string(),
            source,
        })
    }

    fn decoded_size(&self, path: &Path) -> Result<(u32, u32), ProbeError> {
        let decode_err = |source| ProbeError::Decode {
            path: path.display().to_string(),
            source,
        };
        let mut decoder = Self::open(path)?.into_decoder().map_err(decode_err)?;
        let orientation = decoder.orientation().map_err(decode_err)?;
        let (width, height) = decoder.dimensions();
        Ok(oriented_size(width, height, orientation))
    }
}

/// Size after applying an EXIF orientation
pub fn oriented_size(width: u32, height: u32, orientation: Orientation) -> (u32, u32) {
    match orientation {
        Orientation::Rotate90
        | Orientation::Rotate270
        | Orientation::Rotate90FlipH
        | Orientation::Rotate270FlipH => (height, width),
        _ => (width, height),
    }
}

/// Resolve an image's raw size: cache, then fast probe, then full decode.
///
/// Falling back to the decoder logs a one-time warning through the context.
/// Sizes resolved on a cache miss are stored back into the cache.
pub fn resolve_image_size(
    path: &Path,
    probe: &dyn ImageSizeProbe,
    ctx: &mut LoadContext,
) -> Result<(u32, u32), ProbeError> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(size) = ctx.size_cache.get(&filename) {
        return Ok(size);
    }

    let size = match probe.fast_size(path) {
        Ok(size) => size,
        Err(ProbeError::UnknownFormat(_)) => {
            ctx.warnings.warn_once(SLOW_READ_WARNING);
            probe.decoded_size(path)?
        }
        Err(e) => return Err(e),
    };

    ctx.size_cache.insert(filename, size);
    Ok(size)
}
