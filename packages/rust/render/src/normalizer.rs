use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use folio_shared::{Issue, IssueKind, ToolCommand, ToolError, ToolsConfig, run_tool_checked};

use crate::renderer::check_pdf_header;

/// Rewrites a raw capture into a portable PDF (embedded fonts, pinned version).
#[async_trait]
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;

    /// Write the normalized form of `input` to `output`.
    async fn normalize(&self, input: &Path, output: &Path) -> Result<(), ToolError>;
}

/// Ghostscript `pdfwrite` pass.
#[derive(Debug, Clone)]
pub struct GhostscriptNormalizer {
    command: ToolCommand,
    compatibility_level: String,
    timeout: Duration,
}

impl GhostscriptNormalizer {
    pub fn new(command: ToolCommand, compatibility_level: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command,
            compatibility_level: compatibility_level.into(),
            timeout,
        }
    }

    pub fn from_config(tools: &ToolsConfig, timeout: Duration) -> Self {
        Self::new(
            tools.normalizer.clone(),
            tools.compatibility_level.clone(),
            timeout,
        )
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut out_flag = OsString::from("-sOutputFile=");
        out_flag.push(output);
        vec![
            "-q".into(),
            "-dNOPAUSE".into(),
            "-dBATCH".into(),
            "-dSAFER".into(),
            "-sDEVICE=pdfwrite".into(),
            format!("-dCompatibilityLevel={}", self.compatibility_level).into(),
            "-dEmbedAllFonts=true".into(),
            "-dSubsetFonts=true".into(),
            "-dPDFSETTINGS=/prepress".into(),
            out_flag,
            input.as_os_str().to_owned(),
        ]
    }
}

#[async_trait]
impl Normalizer for GhostscriptNormalizer {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn normalize(&self, input: &Path, output: &Path) -> Result<(), ToolError> {
        run_tool_checked(&self.command, &self.args(input, output), self.timeout).await?;
        check_pdf_header(output).map_err(|message| ToolError::Output {
            program: self.command.program.clone(),
            message,
        })?;
        Ok(())
    }
}

/// Which file the rest of the attempt should use.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArtifact {
    pub path: PathBuf,
    /// Set when the normalizer failed and `path` is the raw capture.
    pub degraded: Option<Issue>,
}

/// Normalize `raw` into `output`, falling back to `raw` on any failure.
///
/// Normalization is best-effort: a failure is reported as a
/// [`IssueKind::NormalizationDegraded`] issue, never as an attempt failure.
#[instrument(skip_all, fields(normalizer = normalizer.name()))]
pub async fn normalize_or_degrade(
    normalizer: &dyn Normalizer,
    raw: &Path,
    output: &Path,
) -> NormalizedArtifact {
    match normalizer.normalize(raw, output).await {
        Ok(()) => NormalizedArtifact {
            path: output.to_path_buf(),
            degraded: None,
        },
        Err(e) => {
            warn!(error = %e, "normalization failed, keeping raw capture");
            // A partial output must not be mistaken for the real one later.
            let _ = std::fs::remove_file(output);
            NormalizedArtifact {
                path: raw.to_path_buf(),
                degraded: Some(Issue::new(IssueKind::NormalizationDegraded, e.to_string())),
            }
        }
    }
}
