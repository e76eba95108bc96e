//! Image → fixed-size signed 8-bit payload.
//!
//! Each pixel goes grayscale → `p / 255` → `round(x * 128)`. Pure white would
//! land on 128, one past `i8::MAX`, so values saturate at 127.
//!
//! Grayscale uses the ITU-R 601 weights (0.299, 0.587, 0.114) in 16-bit fixed
//! point, the conversion the device's training images went through.

use crate::domain::model::{ImagePayload, DEFAULT_IMAGE_SIDE};
use crate::utils::error::{DeviceError, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageReader, Luma};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    side: u32,
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_SIDE)
    }
}

impl Quantizer {
    pub fn new(side: u32) -> Self {
        Self { side }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    /// 載入圖片並轉成裝置需要的 payload
    pub fn quantize<P: AsRef<Path>>(&self, path: P) -> Result<ImagePayload> {
        let path = path.as_ref();
        let image = load_image(path).map_err(|source| DeviceError::ImageLoadFailed {
            path: path.display().to_string(),
            source,
        })?;

        let payload = self.quantize_image(&image);
        tracing::debug!(
            "Quantized {} ({}x{}) into {} values",
            path.display(),
            image.width(),
            image.height(),
            payload.len()
        );
        Ok(payload)
    }

    pub fn quantize_image(&self, image: &DynamicImage) -> ImagePayload {
        let gray = luma_601(image);
        let resized = imageops::resize(&gray, self.side, self.side, FilterType::Nearest);

        let values = resized
            .pixels()
            .map(|pixel| quantize_intensity(pixel[0]))
            .collect();

        ImagePayload::new(self.side, values)
    }
}

/// Maps a 0..=255 intensity onto 0..=127.
pub fn quantize_intensity(intensity: u8) -> i8 {
    let scaled = (f32::from(intensity) / 255.0 * 128.0).round();
    scaled.min(f32::from(i8::MAX)) as i8
}

/// `image` weighs channels with Rec. 709; the model expects 601 luma.
fn luma_601(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let weighted = 19_595 * u32::from(r) + 38_470 * u32::from(g) + 7_471 * u32::from(b);
        // weights sum to 65536, so gray input maps onto itself
        Luma([((weighted + 0x8000) >> 16) as u8])
    })
}

fn load_image(path: &Path) -> image::ImageResult<DynamicImage> {
    // 依內容判斷格式，副檔名錯誤也能解碼
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    reader.decode()
}
