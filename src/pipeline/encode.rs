//! Image encoding: rendered page → PNG bytes → base64 `ImageData`.
//!
//! PNG is lossless, which matters more than size for Devanagari: JPEG
//! ringing around the headline stroke (shirorekha) merges matras into the
//! consonant below and both engines misread the conjunct. The same PNG file
//! is handed to Tesseract on disk and to the vision model as a data URI.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page → {} PNG bytes",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// Wrap PNG bytes for a multimodal request. `detail` is the provider's
/// image-resolution hint (`low`, `auto` or `high`).
pub fn to_image_data(png: &[u8], detail: &str) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded image → {} bytes base64 (detail={})", b64.len(), detail);
    ImageData::new(b64, "image/png").with_detail(detail)
}
