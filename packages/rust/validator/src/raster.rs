use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use folio_shared::{ToolCommand, ToolError, run_tool_checked};

/// Renders one page to a raster file and reports its size in bytes.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    fn name(&self) -> &str;

    /// `page` is 1-based. Output goes somewhere under `scratch`.
    async fn rasterize(
        &self,
        pdf: &Path,
        page: usize,
        dpi: u32,
        scratch: &Path,
    ) -> Result<u64, ToolError>;
}

/// `pdftoppm -png -singlefile` for a single page.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    command: ToolCommand,
    timeout: Duration,
}

impl PdftoppmRasterizer {
    pub fn new(command: ToolCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn rasterize(
        &self,
        pdf: &Path,
        page: usize,
        dpi: u32,
        scratch: &Path,
    ) -> Result<u64, ToolError> {
        let prefix = scratch.join(format!("page-{page}"));
        let page = page.to_string();
        let args: Vec<OsString> = vec![
            "-png".into(),
            "-r".into(),
            dpi.to_string().into(),
            "-f".into(),
            page.clone().into(),
            "-l".into(),
            page.into(),
            "-singlefile".into(),
            pdf.as_os_str().to_owned(),
            prefix.as_os_str().to_owned(),
        ];
        run_tool_checked(&self.command, &args, self.timeout).await?;

        let png = prefix.with_extension("png");
        std::fs::metadata(&png)
            .map(|m| m.len())
            .map_err(|e| ToolError::Output {
                program: self.command.program.clone(),
                message: format!("no raster at {}: {e}", png.display()),
            })
    }
}

/// Page 1 plus up to `interior` evenly spaced later pages, 1-based and ascending.
pub fn sample_pages(page_count: usize, interior: usize) -> Vec<usize> {
    if page_count == 0 {
        return Vec::new();
    }
    let mut pages = vec![1];
    let candidates = page_count - 1;
    let k = interior.min(candidates);
    for i in 0..k {
        pages.push(2 + ((2 * i + 1) * candidates) / (2 * k));
    }
    pages
}
