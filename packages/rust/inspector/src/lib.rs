//! Visual QA Inspector.
//!
//! Loads compiled markup into a live engine, measures every element, and
//! reports elements that extend past their page's content box along with
//! images that failed to load. Each inspection runs two passes; passes that
//! disagree mean the engine itself is unstable, not the content.

mod preflight;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use folio_engine::{EngineError, PageGeometry, RenderEngine};
use folio_shared::{
    ElementOverflow, Issue, IssueKind, OverflowReport, PageOverflow, PageSpec, Rect,
    StageTimeouts,
};

pub use preflight::{Preflight, preflight};

/// Float noise from the px/pt round trip. Anything larger is a violation.
pub const OVERFLOW_EPSILON_PT: f64 = 1e-6;

/// Maximum geometry drift between passes still considered identical.
pub const PASS_TOLERANCE_PT: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    /// The markup itself is unusable. Not retryable.
    #[error("markup preflight failed: {0}")]
    Preflight(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("engine measured {measured} pages, markup has {expected}")]
    PageCount { expected: usize, measured: usize },
}

impl InspectError {
    /// Engine-side failures may succeed with a fresh engine.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Preflight(_))
    }
}

/// Result of a single measured pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub overflow: OverflowReport,
    /// One `MissingImageLoad` issue per image that did not load.
    pub image_issues: Vec<Issue>,
    pub pages: usize,
}

impl Inspection {
    pub fn images_ok(&self) -> bool {
        self.image_issues.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.overflow.is_clean() && self.images_ok()
    }

    /// Every issue of this pass, overflow first.
    pub fn issues(&self) -> Vec<Issue> {
        let mut issues = self.overflow.to_issues();
        issues.extend(self.image_issues.iter().cloned());
        issues
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InspectionOutcome {
    Clean(Inspection),
    Violations(Inspection),
    /// The two passes disagreed; the detail names the first difference.
    Nondeterministic(String),
}

#[derive(Debug, Clone)]
pub struct Inspector {
    spec: PageSpec,
    load_timeout: Duration,
    inspect_timeout: Duration,
}

impl Inspector {
    pub fn new(spec: PageSpec, timeouts: &StageTimeouts) -> Self {
        Self {
            spec,
            load_timeout: timeouts.load,
            inspect_timeout: timeouts.inspect,
        }
    }

    /// Inspect `markup_path` with two passes on `engine`.
    #[instrument(skip_all, fields(engine = engine.name()))]
    pub async fn inspect(
        &self,
        engine: &mut dyn RenderEngine,
        markup_path: &Path,
    ) -> Result<InspectionOutcome, InspectError> {
        let markup = std::fs::read_to_string(markup_path).map_err(|e| {
            InspectError::Preflight(format!("cannot read {}: {e}", markup_path.display()))
        })?;
        let expected = preflight(&markup).map_err(InspectError::Preflight)?;
        debug!(
            pages = expected.page_count,
            images = expected.images.len(),
            "preflight passed"
        );

        let first = self.run_pass(engine, markup_path, &expected).await?;
        let second = self.run_pass(engine, markup_path, &expected).await?;

        if let Some(detail) = first_difference(&first, &second, self.spec.px_to_pt()) {
            warn!(%detail, "inspection passes disagree");
            return Ok(InspectionOutcome::Nondeterministic(detail));
        }

        let inspection = analyze(&second, &self.spec, &expected);
        info!(
            pages = inspection.pages,
            overflow = inspection.overflow.violation_count(),
            images_ok = inspection.images_ok(),
            "inspection complete"
        );

        Ok(if inspection.is_clean() {
            InspectionOutcome::Clean(inspection)
        } else {
            InspectionOutcome::Violations(inspection)
        })
    }

    async fn run_pass(
        &self,
        engine: &mut dyn RenderEngine,
        markup_path: &Path,
        expected: &Preflight,
    ) -> Result<Vec<PageGeometry>, InspectError> {
        engine.load(markup_path, self.load_timeout).await?;
        let assets = engine.await_assets(self.load_timeout).await?;
        if !assets.all_complete() {
            debug!(
                total = assets.total,
                complete = assets.complete,
                "asset loading settled incomplete"
            );
        }

        let pages = engine.measure(self.inspect_timeout).await?;
        if pages.len() != expected.page_count {
            return Err(InspectError::PageCount {
                expected: expected.page_count,
                measured: pages.len(),
            });
        }
        Ok(pages)
    }
}

/// Element rectangle relative to its page origin, in points.
fn page_relative(rect: &Rect, page: &PageGeometry, px_to_pt: f64) -> Rect {
    Rect::new(
        rect.x - page.rect.x,
        rect.y - page.rect.y,
        rect.width,
        rect.height,
    )
    .scaled(px_to_pt)
}

/// Compute overflow and image health for one pass.
pub fn analyze(pages: &[PageGeometry], spec: &PageSpec, expected: &Preflight) -> Inspection {
    let content = spec.content_box();
    let px_to_pt = spec.px_to_pt();
    let mut overflow = OverflowReport::default();
    let mut image_issues = Vec::new();

    for page in pages {
        let mut elements = Vec::new();
        for element in &page.elements {
            let rect = page_relative(&element.rect, page, px_to_pt);
            let right = rect.right() - content.right();
            let bottom = rect.bottom() - content.bottom();
            if right > OVERFLOW_EPSILON_PT || bottom > OVERFLOW_EPSILON_PT {
                elements.push(ElementOverflow {
                    descriptor: element.descriptor.clone(),
                    kind: element.kind,
                    exceeds_right_by_pt: right.max(0.0),
                    exceeds_bottom_by_pt: bottom.max(0.0),
                });
            }
        }
        if !elements.is_empty() {
            overflow.pages.push(PageOverflow {
                page_index: page.index,
                elements,
            });
        }
    }

    for descriptor in &expected.images {
        let probe = pages.iter().find_map(|page| {
            page.images
                .iter()
                .find(|p| &p.descriptor == descriptor)
                .map(|p| (page.index, p))
        });
        match probe {
            Some((_, probe)) if probe.is_loaded() => {}
            Some((page_index, probe)) => image_issues.push(Issue::on_page(
                IssueKind::MissingImageLoad,
                page_index,
                format!(
                    "{descriptor} not loaded (complete={}, natural {}x{})",
                    probe.complete, probe.natural_width, probe.natural_height
                ),
            )),
            None => image_issues.push(Issue::new(
                IssueKind::MissingImageLoad,
                format!("{descriptor} was not reported by the engine"),
            )),
        }
    }

    Inspection {
        overflow,
        image_issues,
        pages: pages.len(),
    }
}

/// Describe the first difference between two passes, if any.
fn first_difference(a: &[PageGeometry], b: &[PageGeometry], px_to_pt: f64) -> Option<String> {
    if a.len() != b.len() {
        return Some(format!("page count {} vs {}", a.len(), b.len()));
    }
    for (pa, pb) in a.iter().zip(b) {
        if pa.elements.len() != pb.elements.len() {
            return Some(format!(
                "page {}: {} vs {} elements",
                pa.index,
                pa.elements.len(),
                pb.elements.len()
            ));
        }
        for (ea, eb) in pa.elements.iter().zip(&pb.elements) {
            if ea.descriptor != eb.descriptor {
                return Some(format!(
                    "page {}: element order differs ({} vs {})",
                    pa.index, ea.descriptor, eb.descriptor
                ));
            }
            let ra = page_relative(&ea.rect, pa, px_to_pt);
            let rb = page_relative(&eb.rect, pb, px_to_pt);
            let drift = [
                ra.x - rb.x,
                ra.y - rb.y,
                ra.width - rb.width,
                ra.height - rb.height,
            ]
            .into_iter()
            .fold(0.0_f64, |acc, d| acc.max(d.abs()));
            if drift > PASS_TOLERANCE_PT {
                return Some(format!(
                    "{} moved by {drift:.2}pt between passes",
                    ea.descriptor
                ));
            }
        }
        if pa.images.len() != pb.images.len() {
            return Some(format!(
                "page {}: {} vs {} images",
                pa.index,
                pa.images.len(),
                pb.images.len()
            ));
        }
        for (ia, ib) in pa.images.iter().zip(&pb.images) {
            if ia.is_loaded() != ib.is_loaded() {
                return Some(format!("{} load state changed between passes", ia.descriptor));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use folio_compiler::compile;
    use folio_engine::testing::{Faults, PinnedOverflow, SimulatedLauncher};
    use folio_engine::{ElementGeometry, EngineLauncher, ImageProbe};
    use folio_shared::{
        Asset, BookMetadata, BuildConfig, Chapter, ContentModel, ElementKind, Margins, TimeoutsConfig,
        TrimSize,
    };

    fn spec() -> PageSpec {
        PageSpec::new(
            TrimSize {
                width_in: 6.0,
                height_in: 9.0,
            },
            Margins::uniform(0.75),
        )
    }

    fn timeouts() -> StageTimeouts {
        StageTimeouts::from(&TimeoutsConfig::default())
    }

    fn config(code_height: f64) -> BuildConfig {
        BuildConfig {
            generation: 0,
            max_paragraph_chars: 2400,
            max_code_block_height_pt: code_height,
            body_font_size_pt: 11.0,
            max_image_dimension_px: 1800,
        }
    }

    fn model(body: &str, assets: BTreeMap<String, Asset>, cover: Option<&str>) -> ContentModel {
        ContentModel {
            metadata: BookMetadata {
                title: "Field Notes".into(),
                author: "A. Writer".into(),
                subtitle: None,
                cover: cover.map(String::from),
                trim: None,
                margins: None,
            },
            chapters: vec![Chapter {
                number: 1,
                title: "One".into(),
                body: body.into(),
                frontmatter: BTreeMap::new(),
            }],
            assets,
        }
    }

    fn write(dir: &Path, model: &ContentModel, config: &BuildConfig) -> std::path::PathBuf {
        compile(model, config, &spec())
            .unwrap()
            .write_markup(dir)
            .unwrap()
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 10, 10]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn tall_code(lines: usize) -> String {
        let body: Vec<String> = (0..lines).map(|i| format!("let x{i} = {i};")).collect();
        format!("Intro.\n\n```rust\n{}\n```", body.join("\n"))
    }

    #[tokio::test]
    async fn clean_markup_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &model("Hello.", BTreeMap::new(), None), &config(324.0));

        let launcher = SimulatedLauncher::new();
        let mut engine = launcher.launch().await.unwrap();
        let outcome = Inspector::new(spec(), &timeouts())
            .inspect(engine.as_mut(), &path)
            .await
            .unwrap();
        assert!(matches!(outcome, InspectionOutcome::Clean(ref i) if i.pages == 3));
    }

    #[tokio::test]
    async fn oversized_code_block_overflows_its_page() {
        let dir = tempfile::tempdir().unwrap();
        // No effective height limit: 60 lines of 9.35pt code exceed the 540pt content box.
        let path = write(
            dir.path(),
            &model(&tall_code(60), BTreeMap::new(), None),
            &config(2000.0),
        );

        let launcher = SimulatedLauncher::new();
        let mut engine = launcher.launch().await.unwrap();
        let outcome = Inspector::new(spec(), &timeouts())
            .inspect(engine.as_mut(), &path)
            .await
            .unwrap();

        let InspectionOutcome::Violations(inspection) = outcome else {
            panic!("expected violations, got {outcome:?}");
        };
        assert_eq!(inspection.overflow.pages.len(), 1);
        assert_eq!(inspection.overflow.pages[0].page_index, 1);
        assert!(inspection.overflow.kinds().contains(&ElementKind::Code));
        assert!(inspection.images_ok());
    }

    #[tokio::test]
    async fn jitter_between_passes_is_nondeterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &model("Hello.", BTreeMap::new(), None), &config(324.0));

        let launcher = SimulatedLauncher::with_faults(Faults {
            jittered_measures: 1,
            ..Faults::default()
        });
        let mut engine = launcher.launch().await.unwrap();
        let outcome = Inspector::new(spec(), &timeouts())
            .inspect(engine.as_mut(), &path)
            .await
            .unwrap();
        assert!(matches!(outcome, InspectionOutcome::Nondeterministic(_)));
    }

    #[tokio::test]
    async fn unloaded_image_is_reported_on_its_page() {
        let dir = tempfile::tempdir().unwrap();
        let assets = [("cover.png".to_string(), Asset { bytes: png() })].into();
        let path = write(
            dir.path(),
            &model("Hello.", assets, Some("cover.png")),
            &config(324.0),
        );

        let launcher = SimulatedLauncher::with_faults(Faults {
            unloaded_images: ["p0-image-1".to_string()].into(),
            ..Faults::default()
        });
        let mut engine = launcher.launch().await.unwrap();
        let outcome = Inspector::new(spec(), &timeouts())
            .inspect(engine.as_mut(), &path)
            .await
            .unwrap();

        let InspectionOutcome::Violations(inspection) = outcome else {
            panic!("expected violations, got {outcome:?}");
        };
        assert!(inspection.overflow.is_clean());
        assert_eq!(inspection.image_issues.len(), 1);
        assert_eq!(inspection.image_issues[0].page_index, Some(0));
    }

    #[tokio::test]
    async fn pinned_overflow_is_measured_in_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &model("Hello.", BTreeMap::new(), None), &config(324.0));

        let launcher = SimulatedLauncher::with_faults(Faults {
            pinned_overflow: Some(PinnedOverflow {
                descriptor: "p1-paragraph-1".into(),
                exceeds_right_pt: 30.0,
                exceeds_bottom_pt: 0.0,
            }),
            ..Faults::default()
        });
        let mut engine = launcher.launch().await.unwrap();
        let outcome = Inspector::new(spec(), &timeouts())
            .inspect(engine.as_mut(), &path)
            .await
            .unwrap();

        let InspectionOutcome::Violations(inspection) = outcome else {
            panic!("expected violations, got {outcome:?}");
        };
        let element = &inspection.overflow.pages[0].elements[0];
        assert_eq!(element.descriptor, "p1-paragraph-1");
        assert!((element.exceeds_right_by_pt - 30.0).abs() < 1e-6);
        assert_eq!(element.exceeds_bottom_by_pt, 0.0);
    }

    /// One trade page holding a single paragraph `extra_pt` wider than the content box.
    fn page_with_paragraph(extra_pt: f64) -> PageGeometry {
        let spec = spec();
        let content = spec.content_box();
        let to_px = 1.0 / spec.px_to_pt();
        PageGeometry {
            index: 0,
            rect: Rect::new(0.0, 0.0, 432.0 * to_px, 648.0 * to_px),
            elements: vec![ElementGeometry {
                descriptor: "p0-paragraph-1".into(),
                kind: ElementKind::Paragraph,
                rect: Rect::new(
                    content.x,
                    content.y,
                    content.width + extra_pt,
                    content.height,
                )
                .scaled(to_px),
            }],
            images: vec![ImageProbe {
                descriptor: "p0-image-1".into(),
                complete: true,
                natural_width: 10,
                natural_height: 10,
            }],
        }
    }

    fn one_image() -> Preflight {
        Preflight {
            page_count: 1,
            images: ["p0-image-1".to_string()].into(),
        }
    }

    #[test]
    fn analyze_accepts_an_element_flush_with_the_content_box() {
        let inspection = analyze(&[page_with_paragraph(0.0)], &spec(), &one_image());
        assert!(inspection.is_clean());
    }

    #[test]
    fn analyze_flags_a_quarter_point_overflow() {
        let inspection = analyze(&[page_with_paragraph(0.25)], &spec(), &one_image());
        assert!(!inspection.is_clean());
        let element = &inspection.overflow.pages[0].elements[0];
        assert_eq!(element.descriptor, "p0-paragraph-1");
        assert!((element.exceeds_right_by_pt - 0.25).abs() < 1e-6);
    }

    #[test]
    fn passes_reporting_different_image_counts_differ() {
        let first = page_with_paragraph(0.0);
        let mut second = first.clone();
        second.images.push(ImageProbe {
            descriptor: "p0-image-2".into(),
            complete: true,
            natural_width: 10,
            natural_height: 10,
        });

        let px_to_pt = spec().px_to_pt();
        assert_eq!(first_difference(&[first.clone()], &[first.clone()], px_to_pt), None);
        let diff = first_difference(&[first], &[second], px_to_pt).unwrap();
        assert!(diff.contains("1 vs 2 images"), "{diff}");
    }

    #[test]
    fn preflight_errors_are_not_transient() {
        assert!(!InspectError::Preflight("x".into()).is_transient());
        assert!(
            InspectError::PageCount {
                expected: 3,
                measured: 2
            }
            .is_transient()
        );
    }
}
