//! Loading the content model produced by the upstream content source.
//!
//! Two layouts are accepted:
//! - a single JSON file with assets inlined as base64;
//! - a directory holding `book.json` and an optional `assets/` directory whose
//!   files are merged into the model by file name.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, instrument};

use crate::error::{FolioError, Result};
use crate::types::{Asset, ContentModel};

/// Manifest file name inside a content directory.
const BOOK_FILE_NAME: &str = "book.json";

/// Asset directory name inside a content directory.
const ASSETS_DIR_NAME: &str = "assets";

/// Load and sanity-check a content model from `path`.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_content(path: &Path) -> Result<ContentModel> {
    let mut model = if path.is_dir() {
        load_directory(path)?
    } else {
        read_model(path)?
    };

    model.chapters.sort_by_key(|c| c.number);
    check_model(&model)?;

    info!(
        title = %model.metadata.title,
        chapters = model.chapters.len(),
        assets = model.assets.len(),
        "content model loaded"
    );

    Ok(model)
}

fn read_model(path: &Path) -> Result<ContentModel> {
    let raw = std::fs::read_to_string(path).map_err(|e| FolioError::io(path, e))?;
    serde_json::from_str(&raw)
        .map_err(|e| FolioError::content(format!("invalid {}: {e}", path.display())))
}

fn load_directory(dir: &Path) -> Result<ContentModel> {
    let mut model = read_model(&dir.join(BOOK_FILE_NAME))?;

    let assets_dir = dir.join(ASSETS_DIR_NAME);
    if !assets_dir.is_dir() {
        return Ok(model);
    }

    let entries = std::fs::read_dir(&assets_dir).map_err(|e| FolioError::io(&assets_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FolioError::io(&assets_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let bytes = std::fs::read(&path).map_err(|e| FolioError::io(&path, e))?;
        debug!(asset = %name, size = bytes.len(), "loaded asset file");
        model.assets.insert(name, Asset { bytes });
    }

    Ok(model)
}

/// Input-level checks. Asset resolution is the compiler's job.
fn check_model(model: &ContentModel) -> Result<()> {
    if model.metadata.title.trim().is_empty() {
        return Err(FolioError::content("metadata.title must not be empty"));
    }
    if model.chapters.is_empty() {
        return Err(FolioError::content("content has no chapters"));
    }

    let mut seen = BTreeSet::new();
    for chapter in &model.chapters {
        if !seen.insert(chapter.number) {
            return Err(FolioError::content(format!(
                "chapter number {} appears more than once",
                chapter.number
            )));
        }
    }

    Ok(())
}
