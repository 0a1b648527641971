//! Image decoding and normalization.
//!
//! Stored report images arrive in whatever format a clinic scanned or
//! photographed them in: paletted PNGs, transparent screenshots, grayscale
//! TIFFs. The extraction model gets exactly one representation: opaque
//! 8-bit RGB, alpha composited onto a white page, re-encoded as PNG.
//! Already-opaque RGB input passes through pixel-for-pixel.

use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;

/// A decoded, normalized image ready for the extraction client.
pub struct NormalizedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode raw bytes and normalize to opaque RGB PNG.
///
/// Returns a human-readable reason when the bytes do not decode as any
/// supported image format or re-encoding fails.
pub fn decode_and_normalize(bytes: &[u8]) -> Result<NormalizedImage, String> {
    let decoded = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let rgb = flatten_to_rgb(decoded);
    let (width, height) = rgb.dimensions();

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| e.to_string())?;

    Ok(NormalizedImage { png, width, height })
}

/// Flatten any decoded image to opaque RGB.
///
/// Alpha-bearing images (the decoder also expands paletted images into
/// RGBA) are composited onto a white background; everything else is a
/// plain channel conversion. Dimensions are preserved.
pub fn flatten_to_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        DynamicImage::ImageRgba8(rgba) => composite_on_white(&rgba),
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
            composite_on_white(&img.to_rgba8())
        }
        other => {
            if other.color().has_alpha() {
                composite_on_white(&other.to_rgba8())
            } else {
                other.to_rgb8()
            }
        }
    }
}

/// Composite RGBA pixels onto a white background with integer alpha
/// blending, rounding to nearest.
fn composite_on_white(rgba: &image::RgbaImage) -> RgbImage {
    let (w, h) = rgba.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let a = a as u32;
        let blend = |c: u8| -> u8 { ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8 };
        out.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}
