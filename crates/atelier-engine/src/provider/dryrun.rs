use std::io::Cursor;

use atelier_contracts::request::AspectRatio;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{CallConfig, ImageProvider, PromptPart};
use crate::error::ProviderError;

/// Offline provider: answers every call with a flat PNG whose color is
/// derived from the prompt text, in the same shape Gemini responds with.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn invoke(&self, parts: &[PromptPart], config: &CallConfig) -> Result<Value, ProviderError> {
        let (width, height) = dims_for(config.aspect_ratio);
        let digest = prompt_digest(parts);
        let png = render_png(width, height, [digest[0], digest[1], digest[2], 255])?;
        Ok(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "inlineData": {
                            "mimeType": "image/png",
                            "data": BASE64.encode(png),
                        }
                    }]
                },
                "finishReason": "STOP",
            }],
            "modelVersion": format!("dryrun-{}", hex::encode(&digest[..4])),
        }))
    }
}

fn dims_for(aspect_ratio: Option<AspectRatio>) -> (u32, u32) {
    match aspect_ratio {
        Some(AspectRatio::Portrait) => (144, 256),
        Some(AspectRatio::Landscape) => (256, 144),
        Some(AspectRatio::Classic) => (256, 192),
        Some(AspectRatio::Square) | None => (192, 192),
    }
}

fn prompt_digest(parts: &[PromptPart]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        match part {
            PromptPart::Text(text) => hasher.update(text.as_bytes()),
            PromptPart::Image(image) => hasher.update(&image.bytes),
        }
    }
    hasher.finalize().into()
}

fn render_png(width: u32, height: u32, color: [u8; 4]) -> Result<Vec<u8>, ProviderError> {
    let mut canvas = RgbaImage::new(width, height);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgba(color);
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| ProviderError::Decode {
            provider: "dryrun".to_string(),
            message: format!("png encode failed: {err}"),
        })?;
    Ok(out.into_inner())
}
