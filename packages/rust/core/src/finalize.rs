//! Persisting the winning artifact: hash, atomic copy, sidecars.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use folio_shared::{AttemptRecord, FinalArtifact, FolioError, Result};

/// `<artifact><suffix>`, e.g. `book.pdf.sha256`.
pub fn sidecar_path(artifact: &Path, suffix: &str) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `bytes` to a dot-prefixed temp file next to `target`, then rename.
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| FolioError::io(parent, e))?;

    let file_name = target
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| FolioError::validation(format!("invalid output path: {}", target.display())))?;
    let temp = parent.join(format!(".{file_name}.tmp"));

    std::fs::write(&temp, bytes).map_err(|e| FolioError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| FolioError::io(target, e))
}

/// Copy `source` to `output` atomically and write `<output>.sha256`.
#[instrument(skip_all, fields(output = %output.display()))]
pub fn finalize_artifact(source: &Path, output: &Path, page_count: usize) -> Result<FinalArtifact> {
    let bytes = std::fs::read(source).map_err(|e| FolioError::io(source, e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = format!("{:x}", hasher.finalize());

    write_atomic(output, &bytes)?;

    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    write_atomic(
        &sidecar_path(output, ".sha256"),
        format!("{sha256}  {file_name}\n").as_bytes(),
    )?;

    info!(%sha256, size = bytes.len(), "artifact written");
    Ok(FinalArtifact {
        path: output.to_path_buf(),
        sha256,
        size_bytes: bytes.len() as u64,
        page_count,
    })
}

#[derive(Serialize)]
struct AttemptHistory<'a> {
    run_id: String,
    outcome: &'a str,
    attempts: &'a [AttemptRecord],
}

/// Write `<output>.attempts.json` with the full attempt history.
pub fn write_attempt_history(
    output: &Path,
    run_id: &str,
    outcome: &str,
    attempts: &[AttemptRecord],
) -> Result<PathBuf> {
    let path = sidecar_path(output, ".attempts.json");
    let history = AttemptHistory {
        run_id: run_id.to_string(),
        outcome,
        attempts,
    };
    let json = serde_json::to_vec_pretty(&history)
        .map_err(|e| FolioError::validation(format!("failed to serialize attempt history: {e}")))?;
    write_atomic(&path, &json)?;
    Ok(path)
}
