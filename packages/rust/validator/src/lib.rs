//! Structural validation of a finished artifact.
//!
//! Three independent checks, all run every time:
//! - in-process parse plus page geometry against the trim ([`geometry`])
//! - an external integrity checker ([`IntegrityChecker`])
//! - a blank-page raster probe of page 1 and a sample of later pages ([`Rasterizer`])

pub mod geometry;
pub mod integrity;
pub mod raster;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use folio_shared::{
    GEOMETRY_EPSILON_PT, Issue, IssueKind, PageSpec, ToolsConfig, ValidationConfig,
    ValidationResult,
};

pub use geometry::{PageSize, page_sizes};
pub use integrity::{IntegrityChecker, IntegrityVerdict, QpdfChecker};
pub use raster::{PdftoppmRasterizer, Rasterizer, sample_pages};

pub struct StructuralValidator {
    checker: Arc<dyn IntegrityChecker>,
    rasterizer: Arc<dyn Rasterizer>,
    config: ValidationConfig,
}

impl StructuralValidator {
    pub fn new(
        checker: Arc<dyn IntegrityChecker>,
        rasterizer: Arc<dyn Rasterizer>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            checker,
            rasterizer,
            config,
        }
    }

    /// `qpdf` and `pdftoppm` as configured in `[tools]`.
    pub fn from_config(tools: &ToolsConfig, config: &ValidationConfig, timeout: Duration) -> Self {
        Self::new(
            Arc::new(QpdfChecker::new(tools.integrity_checker.clone(), timeout)),
            Arc::new(PdftoppmRasterizer::new(tools.rasterizer.clone(), timeout)),
            config.clone(),
        )
    }

    /// Validate `pdf` against the trim in `spec` and the compiled page count.
    #[instrument(skip_all, fields(pdf = %pdf.display(), expected_pages = expected_pages))]
    pub async fn validate(&self, pdf: &Path, spec: &PageSpec, expected_pages: usize) -> ValidationResult {
        let mut result = ValidationResult::default();

        let page_count = self.check_geometry(pdf, spec, expected_pages, &mut result);
        self.check_integrity(pdf, &mut result).await;
        self.check_rasters(pdf, page_count.unwrap_or(1), &mut result).await;

        if result.passed() {
            info!("artifact passed structural validation");
        } else {
            warn!(issues = %result.summary(), "artifact failed structural validation");
        }
        result
    }

    /// Returns the parsed page count, if the file parsed.
    fn check_geometry(
        &self,
        pdf: &Path,
        spec: &PageSpec,
        expected_pages: usize,
        result: &mut ValidationResult,
    ) -> Option<usize> {
        let sizes = match page_sizes(pdf) {
            Ok(sizes) => sizes,
            Err(e) => {
                result.structure_ok = false;
                result.dimensions_ok = false;
                result
                    .issues
                    .push(Issue::new(IssueKind::StructuralValidation, e));
                return None;
            }
        };

        if sizes.len() != expected_pages {
            result.structure_ok = false;
            result.issues.push(Issue::new(
                IssueKind::StructuralValidation,
                format!(
                    "artifact has {} pages, expected {expected_pages}",
                    sizes.len()
                ),
            ));
        }

        let (width, height) = (spec.width_pt(), spec.height_pt());
        for size in &sizes {
            let dw = (size.width_pt - width).abs();
            let dh = (size.height_pt - height).abs();
            if dw > GEOMETRY_EPSILON_PT || dh > GEOMETRY_EPSILON_PT {
                result.dimensions_ok = false;
                result.issues.push(Issue::on_page(
                    IssueKind::StructuralValidation,
                    size.index,
                    format!(
                        "page is {:.2}x{:.2} pt, trim is {width:.2}x{height:.2} pt",
                        size.width_pt, size.height_pt
                    ),
                ));
            }
        }
        Some(sizes.len())
    }

    async fn check_integrity(&self, pdf: &Path, result: &mut ValidationResult) {
        match self.checker.check(pdf).await {
            Ok(IntegrityVerdict::Clean) => {}
            Ok(IntegrityVerdict::Warnings(detail)) => {
                debug!(checker = self.checker.name(), %detail, "integrity warnings");
            }
            Ok(IntegrityVerdict::Broken(detail)) => {
                result.structure_ok = false;
                result.issues.push(Issue::new(
                    IssueKind::StructuralValidation,
                    format!("{}: {detail}", self.checker.name()),
                ));
            }
            Err(e) => {
                result.structure_ok = false;
                result
                    .issues
                    .push(Issue::new(IssueKind::StructuralValidation, e.to_string()));
            }
        }
    }

    async fn check_rasters(&self, pdf: &Path, page_count: usize, result: &mut ValidationResult) {
        let scratch = match tempfile::Builder::new().prefix("folio-raster-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                result.structure_ok = false;
                result.issues.push(Issue::new(
                    IssueKind::StructuralValidation,
                    format!("raster scratch directory: {e}"),
                ));
                return;
            }
        };

        for page in sample_pages(page_count, self.config.raster_sample_pages) {
            match self
                .rasterizer
                .rasterize(pdf, page, self.config.raster_dpi, scratch.path())
                .await
            {
                Ok(bytes) if bytes < self.config.min_raster_bytes => {
                    result.structure_ok = false;
                    result.issues.push(Issue::on_page(
                        IssueKind::StructuralValidation,
                        page - 1,
                        format!(
                            "raster is {bytes} bytes (< {}), page looks blank",
                            self.config.min_raster_bytes
                        ),
                    ));
                }
                Ok(bytes) => debug!(page, bytes, "raster probe ok"),
                Err(e) => {
                    result.structure_ok = false;
                    result.issues.push(Issue::on_page(
                        IssueKind::StructuralValidation,
                        page - 1,
                        e.to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use folio_engine::testing::write_test_pdf;
    use folio_shared::{Margins, ToolError, TrimSize};

    struct FixedChecker(IntegrityVerdict);

    #[async_trait]
    impl IntegrityChecker for FixedChecker {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn check(&self, _pdf: &Path) -> Result<IntegrityVerdict, ToolError> {
            Ok(self.0.clone())
        }
    }

    /// Returns a configured size per page (default 4096) and records calls.
    #[derive(Default)]
    struct FakeRasterizer {
        sizes: BTreeMap<usize, u64>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Rasterizer for FakeRasterizer {
        fn name(&self) -> &str {
            "fake"
        }

        async fn rasterize(
            &self,
            _pdf: &Path,
            page: usize,
            _dpi: u32,
            _scratch: &Path,
        ) -> Result<u64, ToolError> {
            self.calls.lock().unwrap().push(page);
            Ok(self.sizes.get(&page).copied().unwrap_or(4096))
        }
    }

    fn spec() -> PageSpec {
        PageSpec::new(
            TrimSize {
                width_in: 6.0,
                height_in: 9.0,
            },
            Margins::uniform(0.75),
        )
    }

    fn validator(verdict: IntegrityVerdict, rasterizer: Arc<FakeRasterizer>) -> StructuralValidator {
        StructuralValidator::new(
            Arc::new(FixedChecker(verdict)),
            rasterizer,
            ValidationConfig::default(),
        )
    }

    fn trade_pdf(dir: &Path, pages: &[(f64, f64)]) -> std::path::PathBuf {
        let pdf = dir.join("book.pdf");
        write_test_pdf(&pdf, pages).unwrap();
        pdf
    }

    #[tokio::test]
    async fn exact_trim_passes() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0); 5]);
        let rasterizer = Arc::new(FakeRasterizer::default());

        let result = validator(IntegrityVerdict::Clean, rasterizer.clone())
            .validate(&pdf, &spec(), 5)
            .await;

        assert!(result.passed(), "{result:?}");
        assert!(result.issues.is_empty());
        assert_eq!(*rasterizer.calls.lock().unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn wrong_page_size_fails_dimensions_only() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0), (612.0, 792.0), (432.5, 647.5)]);

        let result = validator(IntegrityVerdict::Clean, Arc::default())
            .validate(&pdf, &spec(), 3)
            .await;

        assert!(!result.dimensions_ok);
        assert!(result.structure_ok);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].page_index, Some(1));
    }

    #[tokio::test]
    async fn page_count_mismatch_fails_structure() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0); 2]);

        let result = validator(IntegrityVerdict::Clean, Arc::default())
            .validate(&pdf, &spec(), 4)
            .await;
        assert!(!result.structure_ok);
        assert!(result.issues[0].detail.contains("expected 4"));
    }

    #[tokio::test]
    async fn broken_verdict_fails_structure_but_warnings_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0)]);

        let broken = validator(IntegrityVerdict::Broken("bad xref".into()), Arc::default())
            .validate(&pdf, &spec(), 1)
            .await;
        assert!(!broken.structure_ok);
        assert!(broken.has_issue(IssueKind::StructuralValidation));

        let warned = validator(IntegrityVerdict::Warnings("repaired".into()), Arc::default())
            .validate(&pdf, &spec(), 1)
            .await;
        assert!(warned.passed());
    }

    #[tokio::test]
    async fn small_raster_is_a_blank_page() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0); 3]);
        let rasterizer = Arc::new(FakeRasterizer {
            sizes: BTreeMap::from([(3, 200)]),
            ..FakeRasterizer::default()
        });

        let result = validator(IntegrityVerdict::Clean, rasterizer)
            .validate(&pdf, &spec(), 3)
            .await;
        assert!(!result.structure_ok);
        assert_eq!(result.issues[0].page_index, Some(2));
        assert!(result.issues[0].detail.contains("blank"));
    }

    #[tokio::test]
    async fn unparsable_file_fails_structure_and_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("book.pdf");
        std::fs::write(&pdf, b"not a pdf").unwrap();
        let rasterizer = Arc::new(FakeRasterizer::default());

        let result = validator(IntegrityVerdict::Clean, rasterizer.clone())
            .validate(&pdf, &spec(), 3)
            .await;
        assert!(!result.structure_ok);
        assert!(!result.dimensions_ok);
        assert_eq!(*rasterizer.calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn missing_checker_binary_fails_structure() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = trade_pdf(dir.path(), &[(432.0, 648.0)]);
        let validator = StructuralValidator::new(
            Arc::new(QpdfChecker::new(
                folio_shared::ToolCommand::new("folio-no-such-checker"),
                Duration::from_secs(1),
            )),
            Arc::new(FakeRasterizer::default()),
            ValidationConfig::default(),
        );
        let result = validator.validate(&pdf, &spec(), 1).await;
        assert!(!result.structure_ok);
        assert!(result.issues[0].detail.contains("folio-no-such-checker"));
    }
}
