//! Image to tensor conversion for training items
//!
//! Images are scaled first, then cropped (crop values are relative to the
//! scaled size), then flipped.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

/// Geometry applied to an item's image and all of its conditioning images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl ImageTransform {
    pub fn apply(&self, img: DynamicImage) -> DynamicImage {
        let img = if img.width() != self.scale_to_width || img.height() != self.scale_to_height {
            img.resize_exact(self.scale_to_width, self.scale_to_height, FilterType::Lanczos3)
        } else {
            img
        };

        let img = img.crop_imm(self.crop_x, self.crop_y, self.crop_width, self.crop_height);
        let img = if self.flip_x { img.fliph() } else { img };
        if self.flip_y {
            img.flipv()
        } else {
            img
        }
    }
}

/// RGB image as a `(3, H, W)` f32 tensor in `[-1, 1]`
pub fn rgb_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?;
    Ok(tensor)
}

/// Grayscale image as a `(1, H, W)` f32 tensor in `[0, 1]`
pub fn mask_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let tensor = Tensor::from_vec(luma.into_raw(), (1, height as usize, width as usize), device)?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    Ok(tensor)
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("Failed to load image: {}", path.display()))
}

pub fn load_rgb_tensor(path: &Path, transform: &ImageTransform, device: &Device) -> Result<Tensor> {
    let img = transform.apply(open(path)?);
    rgb_to_tensor(&img, device)
}

pub fn load_mask_tensor(path: &Path, transform: &ImageTransform, device: &Device) -> Result<Tensor> {
    let img = transform.apply(open(path)?);
    mask_to_tensor(&img, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn transform(scale: (u32, u32), crop: (u32, u32, u32, u32)) -> ImageTransform {
        ImageTransform {
            scale_to_width: scale.0,
            scale_to_height: scale.1,
            crop_x: crop.0,
            crop_y: crop.1,
            crop_width: crop.2,
            crop_height: crop.3,
            flip_x: false,
            flip_y: false,
        }
    }

    #[test]
    fn test_scale_then_crop() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let out = transform((50, 25), (5, 5, 20, 10)).apply(img);
        assert_eq!((out.width(), out.height()), (20, 10));
    }

    #[test]
    fn test_flip_x_mirrors_columns() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        let mut t = transform((2, 1), (0, 0, 2, 1));
        t.flip_x = true;

        let out = t.apply(DynamicImage::ImageRgb8(img)).to_rgb8();
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_rgb_tensor_range() -> Result<()> {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        let tensor = rgb_to_tensor(&DynamicImage::ImageRgb8(img), &Device::Cpu)?;

        assert_eq!(tensor.dims(), &[3, 3, 4]);
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.abs() <= 1.0 + 1e-5));
        let white = tensor.get(0)?.get(0)?.get(0)?.to_scalar::<f32>()?;
        let black = tensor.get(0)?.get(0)?.get(1)?.to_scalar::<f32>()?;
        assert!((white - 1.0).abs() < 1e-5);
        assert!((black + 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_mask_tensor_shape() -> Result<()> {
        let mut img = GrayImage::new(5, 2);
        img.put_pixel(4, 1, Luma([255]));
        let tensor = mask_to_tensor(&DynamicImage::ImageLuma8(img), &Device::Cpu)?;

        assert_eq!(tensor.dims(), &[1, 2, 5]);
        let sum = tensor.sum_all()?.to_scalar::<f32>()?;
        assert!((sum - 1.0).abs() < 1e-5);
        Ok(())
    }
}
