//! Merges a computed alpha mask into a decoded source image.
//!
//! The merge runs on a blocking worker with the pixel buffers moved in,
//! never copied. The surface is processed in fixed-height horizontal
//! stripes to bound the peak working set, and the same stripe pass runs
//! synchronously on the calling thread when the worker path fails.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use log::{debug, warn};

use crate::config::RemovalConfig;
use crate::error::RemovalError;

/// Encoded composite artifacts at full and preview resolution.
#[derive(Debug)]
pub struct CompositeResult {
    /// Lossless PNG; alpha must survive round trips.
    pub full_image: Vec<u8>,
    /// Downscaled JPEG for quick feedback.
    pub preview_image: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy)]
struct EncodeParams {
    stripe_rows: u32,
    preview_max: u32,
    jpeg_quality: u8,
}

/// A failed worker run hands the moved-in buffers back so the fallback can
/// re-run the identical pass without copies.
struct GiveBack {
    error: String,
    surface: RgbaImage,
    alpha: Vec<u8>,
}

/// Compositing engine: validation, offload, fallback.
pub struct Compositor {
    params: EncodeParams,
    #[cfg(test)]
    fail_offload: std::sync::atomic::AtomicBool,
}

impl Compositor {
    pub fn new(config: &RemovalConfig) -> Self {
        Self {
            params: EncodeParams {
                stripe_rows: config.stripe_rows.max(1),
                preview_max: config.preview_max.max(1),
                jpeg_quality: config.jpeg_quality,
            },
            #[cfg(test)]
            fail_offload: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Merge `alpha` into `bitmap` and encode both artifacts.
    ///
    /// `bitmap` and `alpha` are consumed; the caller must not hold copies.
    /// Malformed input is rejected before any pixel work. The merge runs
    /// on a blocking worker; if that path fails, the identical pass runs
    /// synchronously here and only a failure of that fallback surfaces.
    pub async fn composite(
        &self,
        bitmap: RgbaImage,
        alpha: Vec<u8>,
    ) -> Result<CompositeResult, RemovalError> {
        validate(&bitmap, &alpha)?;
        let params = self.params;

        #[cfg(test)]
        let inject_failure = self
            .fail_offload
            .load(std::sync::atomic::Ordering::SeqCst);
        #[cfg(not(test))]
        let inject_failure = false;

        let attempt = tokio::task::spawn_blocking(move || {
            if inject_failure {
                return Err(GiveBack {
                    error: "offload failure injected".to_string(),
                    surface: bitmap,
                    alpha,
                });
            }
            composite_blocking(bitmap, alpha, params)
        })
        .await;

        match attempt {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(back)) => {
                warn!(
                    "offload compositing failed ({}); falling back to the calling thread",
                    back.error
                );
                composite_blocking(back.surface, back.alpha, params)
                    .map_err(|back| RemovalError::Compositing(back.error))
            }
            // The worker panicked or was torn down; the transferred buffers
            // are gone, so there is nothing left to fall back with.
            Err(e) => Err(RemovalError::Compositing(format!(
                "compositing worker terminated: {}",
                e
            ))),
        }
    }

    #[cfg(test)]
    fn with_forced_offload_failure(config: &RemovalConfig) -> Self {
        let compositor = Self::new(config);
        compositor
            .fail_offload
            .store(true, std::sync::atomic::Ordering::SeqCst);
        compositor
    }
}

fn validate(bitmap: &RgbaImage, alpha: &[u8]) -> Result<(), RemovalError> {
    let (width, height) = bitmap.dimensions();
    if width == 0 || height == 0 {
        return Err(RemovalError::Input(format!(
            "cannot composite a {}x{} bitmap",
            width, height
        )));
    }
    let expected = width as usize * height as usize;
    if alpha.len() != expected {
        return Err(RemovalError::MaskMismatch {
            expected,
            actual: alpha.len(),
        });
    }
    Ok(())
}

/// The whole pipeline on the current thread: stripe merge, then encode.
/// Used both inside the worker and as the fallback. On encode failure the
/// surface comes back untouched by the error, and since the merge writes
/// the same alpha bytes every time, re-running it is byte-stable.
fn composite_blocking(
    mut surface: RgbaImage,
    alpha: Vec<u8>,
    params: EncodeParams,
) -> Result<CompositeResult, GiveBack> {
    merge_mask(&mut surface, &alpha, params.stripe_rows);
    let (width, height) = surface.dimensions();
    match encode_outputs(&surface, params) {
        Ok((full_image, preview_image)) => {
            // Explicitly release the transferred source surface.
            drop(surface);
            Ok(CompositeResult {
                full_image,
                preview_image,
                width,
                height,
            })
        }
        Err(error) => Err(GiveBack {
            error,
            surface,
            alpha,
        }),
    }
}

/// Overwrite the alpha byte of every pixel from the row-major mask,
/// one fixed-height stripe at a time. No smoothing, no interpolation.
fn merge_mask(surface: &mut RgbaImage, alpha: &[u8], stripe_rows: u32) {
    let width = surface.width() as usize;
    let stripe_pixels = stripe_rows as usize * width;
    let buffer: &mut [u8] = &mut *surface;

    for (stripe, mask_stripe) in buffer
        .chunks_mut(stripe_pixels * 4)
        .zip(alpha.chunks(stripe_pixels))
    {
        for (pixel, &a) in stripe.chunks_exact_mut(4).zip(mask_stripe.iter()) {
            pixel[3] = a;
        }
    }
}

/// Preview dimensions: longer side bound, both sides rounded and floored
/// at one pixel.
fn preview_dimensions(width: u32, height: u32, preview_max: u32) -> (u32, u32) {
    let scale = (preview_max as f64 / width.max(height) as f64).min(1.0);
    let preview_width = ((width as f64 * scale).round() as u32).max(1);
    let preview_height = ((height as f64 * scale).round() as u32).max(1);
    (preview_width, preview_height)
}

fn encode_outputs(
    surface: &RgbaImage,
    params: EncodeParams,
) -> Result<(Vec<u8>, Vec<u8>), String> {
    let (width, height) = surface.dimensions();

    let mut full = Vec::new();
    PngEncoder::new(Cursor::new(&mut full))
        .write_image(surface.as_raw(), width, height, ExtendedColorType::Rgba8)
        .map_err(|e| format!("png encode failed: {}", e))?;

    let (preview_width, preview_height) = preview_dimensions(width, height, params.preview_max);
    debug!(
        "encoding {}x{} composite with {}x{} preview",
        width, height, preview_width, preview_height
    );
    let preview = image::imageops::resize(surface, preview_width, preview_height, FilterType::Triangle);
    let preview_rgb = image::DynamicImage::ImageRgba8(preview).to_rgb8();

    let mut preview_jpg = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut preview_jpg), params.jpeg_quality)
        .write_image(
            preview_rgb.as_raw(),
            preview_width,
            preview_height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| format!("jpeg encode failed: {}", e))?;

    Ok((full, preview_jpg))
}
