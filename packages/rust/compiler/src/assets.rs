//! Asset resolution and image preparation.
//!
//! Every referenced asset is resolved before any decoding starts, so a missing
//! file fails the compile without wasted work. Images larger than the current
//! `max_image_dimension_px` are downscaled and re-encoded as PNG, in parallel.

use std::collections::BTreeMap;
use std::io::Cursor;

use base64::Engine as _;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use rayon::prelude::*;
use tracing::debug;

use folio_shared::ContentModel;

use crate::CompileError;

/// An image ready to be inlined into the markup.
#[derive(Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
    pub reencoded: bool,
}

impl PreparedImage {
    /// Self-contained `data:` URI for this image.
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

impl std::fmt::Debug for PreparedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedImage")
            .field("mime", &self.mime)
            .field("bytes", &self.bytes.len())
            .field("width_px", &self.width_px)
            .field("height_px", &self.height_px)
            .field("reencoded", &self.reencoded)
            .finish()
    }
}

/// Resolve and prepare every referenced image.
///
/// `references` maps asset name to a human-readable location of its first use.
pub(crate) fn prepare_images(
    model: &ContentModel,
    references: &BTreeMap<String, String>,
    max_dimension_px: u32,
) -> Result<BTreeMap<String, PreparedImage>, CompileError> {
    let mut resolved = Vec::with_capacity(references.len());
    for (name, referenced_by) in references {
        let asset = model
            .assets
            .get(name)
            .ok_or_else(|| CompileError::MissingAsset {
                name: name.clone(),
                referenced_by: referenced_by.clone(),
            })?;
        resolved.push((name.as_str(), asset.bytes.as_slice()));
    }

    resolved
        .par_iter()
        .map(|(name, bytes)| {
            prepare_one(name, bytes, max_dimension_px).map(|image| (name.to_string(), image))
        })
        .collect()
}

fn prepare_one(
    name: &str,
    bytes: &[u8],
    max_dimension_px: u32,
) -> Result<PreparedImage, CompileError> {
    let invalid = |reason: String| CompileError::InvalidAsset {
        name: name.to_string(),
        reason,
    };

    let format = image::guess_format(bytes).map_err(|e| invalid(e.to_string()))?;
    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        other => return Err(invalid(format!("unsupported image format {other:?}"))),
    };

    let decoded =
        image::load_from_memory_with_format(bytes, format).map_err(|e| invalid(e.to_string()))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(invalid(format!("zero-sized image {width}x{height}")));
    }

    let limit = max_dimension_px.max(1);
    if width.max(height) <= limit {
        return Ok(PreparedImage {
            mime,
            bytes: bytes.to_vec(),
            width_px: width,
            height_px: height,
            reencoded: false,
        });
    }

    let resized = decoded.resize(limit, limit, FilterType::Triangle);
    let mut out = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| invalid(format!("re-encode failed: {e}")))?;
    let (new_width, new_height) = resized.dimensions();

    debug!(
        asset = name,
        from = %format!("{width}x{height}"),
        to = %format!("{new_width}x{new_height}"),
        "downscaled image"
    );

    Ok(PreparedImage {
        mime: "image/png",
        bytes: out,
        width_px: new_width,
        height_px: new_height,
        reencoded: true,
    })
}

/// Encode a solid-color PNG of the given size.
#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_shared::{Asset, BookMetadata};

    fn model_with(assets: &[(&str, Vec<u8>)]) -> ContentModel {
        ContentModel {
            metadata: BookMetadata {
                title: "T".into(),
                author: String::new(),
                subtitle: None,
                cover: None,
                trim: None,
                margins: None,
            },
            chapters: Vec::new(),
            assets: assets
                .iter()
                .map(|(name, bytes)| (name.to_string(), Asset { bytes: bytes.clone() }))
                .collect(),
        }
    }

    fn refs(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), "chapter 1".to_string()))
            .collect()
    }

    #[test]
    fn small_images_are_passed_through_untouched() {
        let bytes = png_bytes(40, 20);
        let model = model_with(&[("a.png", bytes.clone())]);

        let prepared = prepare_images(&model, &refs(&["a.png"]), 100).unwrap();
        let img = &prepared["a.png"];
        assert_eq!((img.width_px, img.height_px), (40, 20));
        assert_eq!(img.bytes, bytes);
        assert!(!img.reencoded);
    }

    #[test]
    fn large_images_are_downscaled_preserving_aspect() {
        let model = model_with(&[("big.png", png_bytes(400, 200))]);

        let prepared = prepare_images(&model, &refs(&["big.png"]), 100).unwrap();
        let img = &prepared["big.png"];
        assert_eq!((img.width_px, img.height_px), (100, 50));
        assert!(img.reencoded);
        assert_eq!(img.mime, "image/png");
    }

    #[test]
    fn missing_asset_names_the_reference() {
        let model = model_with(&[]);
        let mut references = BTreeMap::new();
        references.insert("cover.png".to_string(), "metadata.cover".to_string());

        let err = prepare_images(&model, &references, 100).unwrap_err();
        match err {
            CompileError::MissingAsset { name, referenced_by } => {
                assert_eq!(name, "cover.png");
                assert_eq!(referenced_by, "metadata.cover");
            }
            other => panic!("expected MissingAsset, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_bytes_are_invalid() {
        let model = model_with(&[("junk.png", b"definitely not an image".to_vec())]);
        let err = prepare_images(&model, &refs(&["junk.png"]), 100).unwrap_err();
        assert!(matches!(err, CompileError::InvalidAsset { .. }));
    }

    #[test]
    fn data_uri_is_base64_with_mime() {
        let img = PreparedImage {
            mime: "image/png",
            bytes: b"abc".to_vec(),
            width_px: 1,
            height_px: 1,
            reencoded: false,
        };
        assert_eq!(img.data_uri(), "data:image/png;base64,YWJj");
    }
}
