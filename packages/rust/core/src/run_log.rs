//! Per-run attempt log, one tab-separated line per attempt.
//!
//! Each run starts the file afresh; within a run it is append-only.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use folio_shared::{AttemptRecord, FolioError, Result};

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Create the log at `path`, discarding lines from any earlier run.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FolioError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| FolioError::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AttemptRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| FolioError::io(&self.path, e))?;
        writeln!(file, "{}", format_line(record)).map_err(|e| FolioError::io(&self.path, e))
    }
}

/// `<rfc3339>\tattempt=<n>\tstage=<stage>\toutcome=<outcome>\tissues=<summary>`
pub fn format_line(record: &AttemptRecord) -> String {
    format!(
        "{}\tattempt={}\tstage={}\toutcome={}\tissues={}",
        record.started_at.to_rfc3339(),
        record.attempt_number,
        record.stage.as_str(),
        record.outcome.as_str(),
        record.validation.summary(),
    )
}
