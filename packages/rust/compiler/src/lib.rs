//! Content Compiler: turns a [`ContentModel`] plus an attempt's
//! [`BuildConfig`] into self-contained, page-sized HTML.
//!
//! The pipeline is resolve assets, build IR, apply thresholds, serialize.
//! Remediation only ever happens by changing the `BuildConfig` the next
//! compile receives.

pub mod assets;
mod blocks;
mod html;
pub mod ir;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use folio_shared::{BuildConfig, ContentModel, FolioError, PageSpec};

pub use assets::PreparedImage;
pub use ir::{Document, PageRole, TRUNCATION_MARKER, apply_thresholds};

/// File name the compiled markup is written under inside an attempt workspace.
pub const MARKUP_FILE_NAME: &str = "book.html";

/// Fatal compilation failures. None of these can be fixed by retrying.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("missing asset '{name}' (referenced by {referenced_by})")]
    MissingAsset { name: String, referenced_by: String },

    #[error("asset '{name}' is not a usable image: {reason}")]
    InvalidAsset { name: String, reason: String },

    #[error("invalid page geometry: {0}")]
    Geometry(String),
}

/// Descriptors present on one compiled page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageManifest {
    pub index: usize,
    pub role: PageRole,
    pub descriptors: Vec<String>,
}

/// Output of a single compile.
#[derive(Debug, Clone)]
pub struct CompiledBook {
    pub markup: String,
    pub pages: Vec<PageManifest>,
    /// Descriptors of every image element, in document order.
    pub image_descriptors: Vec<String>,
    /// Generation of the config this was compiled with.
    pub generation: u32,
}

impl CompiledBook {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Write the markup to `dir/book.html` and return the path.
    pub fn write_markup(&self, dir: &Path) -> folio_shared::Result<PathBuf> {
        let path = dir.join(MARKUP_FILE_NAME);
        std::fs::write(&path, &self.markup).map_err(|e| FolioError::io(&path, e))?;
        Ok(path)
    }
}

/// Compile `model` under `config` for pages described by `spec`.
#[instrument(skip_all, fields(generation = config.generation))]
pub fn compile(
    model: &ContentModel,
    config: &BuildConfig,
    spec: &PageSpec,
) -> Result<CompiledBook, CompileError> {
    spec.validate().map_err(CompileError::Geometry)?;

    let chapters: Vec<_> = model
        .chapters
        .iter()
        .map(|chapter| (chapter, blocks::segment(&chapter.body)))
        .collect();

    let references = collect_references(model, &chapters);
    let images = assets::prepare_images(model, &references, config.max_image_dimension_px)?;

    let mut doc = Document::build(model, &chapters, &images, spec);
    apply_thresholds(&mut doc, config, spec);
    let markup = html::serialize(&doc, &images, spec, config.generation);

    let pages: Vec<PageManifest> = doc
        .pages
        .iter()
        .map(|page| PageManifest {
            index: page.index,
            role: page.role,
            descriptors: page.blocks.iter().map(|b| b.descriptor.clone()).collect(),
        })
        .collect();
    let image_descriptors = doc
        .pages
        .iter()
        .flat_map(|page| page.blocks.iter())
        .filter(|b| matches!(b.content, ir::BlockContent::Image { .. }))
        .map(|b| b.descriptor.clone())
        .collect();

    info!(
        pages = pages.len(),
        images = images.len(),
        reencoded = images.values().filter(|i| i.reencoded).count(),
        bytes = markup.len(),
        "compiled markup"
    );

    Ok(CompiledBook {
        markup,
        pages,
        image_descriptors,
        generation: config.generation,
    })
}

/// Every asset the book references, mapped to where it is first used.
fn collect_references(
    model: &ContentModel,
    chapters: &[(&folio_shared::Chapter, Vec<blocks::RawBlock>)],
) -> BTreeMap<String, String> {
    let mut refs = BTreeMap::new();
    if let Some(cover) = &model.metadata.cover {
        refs.insert(cover.clone(), "metadata.cover".to_string());
    }
    for (chapter, raw_blocks) in chapters {
        for block in raw_blocks {
            if let blocks::RawBlock::Image { asset, .. } = block {
                refs.entry(asset.clone())
                    .or_insert_with(|| format!("chapter {}", chapter.number));
            }
        }
    }
    refs
}
