use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument};

use folio_engine::{EngineError, ExportRequest, RenderEngine};
use folio_shared::{PageSpec, StageTimeouts};

/// Every failure here is transient: the next attempt gets a fresh engine.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("assets still loading at capture time ({complete}/{total} complete)")]
    AssetsIncomplete { total: usize, complete: usize },

    #[error("engine produced an unusable file at {}: {reason}", path.display())]
    InvalidOutput { path: PathBuf, reason: String },
}

impl RenderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_timeout())
    }
}

/// A captured, not yet normalized, artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    spec: PageSpec,
    load_timeout: Duration,
    render_timeout: Duration,
    settle: Duration,
}

impl Renderer {
    pub fn new(spec: PageSpec, timeouts: &StageTimeouts) -> Self {
        Self {
            spec,
            load_timeout: timeouts.load,
            render_timeout: timeouts.render,
            settle: timeouts.settle,
        }
    }

    /// Load `markup`, wait for assets, settle, and export to `output`.
    #[instrument(skip_all, fields(engine = engine.name(), output = %output.display()))]
    pub async fn render(
        &self,
        engine: &mut dyn RenderEngine,
        markup: &Path,
        output: &Path,
    ) -> Result<RenderedArtifact, RenderError> {
        engine.load(markup, self.load_timeout).await?;

        let assets = engine.await_assets(self.load_timeout).await?;
        if !assets.all_complete() {
            return Err(RenderError::AssetsIncomplete {
                total: assets.total,
                complete: assets.complete,
            });
        }

        if !self.settle.is_zero() {
            debug!(settle_ms = self.settle.as_millis() as u64, "settling before capture");
            tokio::time::sleep(self.settle).await;
        }

        let request = ExportRequest {
            output: output.to_path_buf(),
            width_in: self.spec.trim.width_in,
            height_in: self.spec.trim.height_in,
            print_background: true,
        };
        let receipt = engine.export(&request, self.render_timeout).await?;

        let bytes = check_pdf_header(output).map_err(|reason| RenderError::InvalidOutput {
            path: output.to_path_buf(),
            reason,
        })?;

        info!(bytes, pages = receipt.pages, "artifact captured");
        Ok(RenderedArtifact {
            path: output.to_path_buf(),
            bytes,
            pages: receipt.pages,
        })
    }
}

/// Confirm `path` is a non-empty file that starts like a PDF; returns its size.
pub fn check_pdf_header(path: &Path) -> Result<u64, String> {
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let size = file.metadata().map_err(|e| e.to_string())?.len();
    if size == 0 {
        return Err("file is empty".into());
    }
    let mut head = [0u8; 5];
    file.read_exact(&mut head).map_err(|e| e.to_string())?;
    if &head != b"%PDF-" {
        return Err("missing %PDF- header".into());
    }
    Ok(size)
}
