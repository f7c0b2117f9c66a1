//! Core domain types for the Folio build loop.
//!
//! All geometry is expressed in PDF points (1/72 in) unless a field name says
//! otherwise. User-facing sizes (trim, margins) are stored in inches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Points per inch.
pub const POINTS_PER_INCH: f64 = 72.0;

/// CSS reference pixels per inch, the engine's default DPI assumption.
pub const CSS_PX_PER_INCH: f64 = 96.0;

/// Tolerance used by every geometry comparison against the trim size.
pub const GEOMETRY_EPSILON_PT: f64 = 1.0;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Physical page dimensions of the finished book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimSize {
    pub width_in: f64,
    pub height_in: f64,
}

impl TrimSize {
    pub fn width_pt(&self) -> f64 {
        self.width_in * POINTS_PER_INCH
    }

    pub fn height_pt(&self) -> f64 {
        self.height_in * POINTS_PER_INCH
    }
}

/// Page margins in inches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top_in: f64,
    pub right_in: f64,
    pub bottom_in: f64,
    pub left_in: f64,
}

impl Margins {
    /// Same margin on all four sides.
    pub fn uniform(inches: f64) -> Self {
        Self {
            top_in: inches,
            right_in: inches,
            bottom_in: inches,
            left_in: inches,
        }
    }
}

/// An axis-aligned rectangle, origin at the top-left of its page.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Scale every coordinate by `factor` (used for px → pt conversion).
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }
}

/// Physical page specification, fixed for a whole build.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSpec {
    pub trim: TrimSize,
    pub margins: Margins,
    /// Engine pixels per inch; converts reported geometry to points.
    pub dpi: f64,
}

impl PageSpec {
    pub fn new(trim: TrimSize, margins: Margins) -> Self {
        Self {
            trim,
            margins,
            dpi: CSS_PX_PER_INCH,
        }
    }

    pub fn width_pt(&self) -> f64 {
        self.trim.width_pt()
    }

    pub fn height_pt(&self) -> f64 {
        self.trim.height_pt()
    }

    /// The page box, in points, relative to the page origin.
    pub fn page_box(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width_pt(), self.height_pt())
    }

    /// `pageBox - margins`, in points.
    pub fn content_box(&self) -> Rect {
        let m = &self.margins;
        Rect::new(
            m.left_in * POINTS_PER_INCH,
            m.top_in * POINTS_PER_INCH,
            self.width_pt() - (m.left_in + m.right_in) * POINTS_PER_INCH,
            self.height_pt() - (m.top_in + m.bottom_in) * POINTS_PER_INCH,
        )
    }

    /// Conversion factor from engine pixels to points.
    pub fn px_to_pt(&self) -> f64 {
        POINTS_PER_INCH / self.dpi
    }

    /// Reject geometry that cannot hold any content.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.trim.width_in <= 0.0 || self.trim.height_in <= 0.0 {
            return Err(format!(
                "trim size must be positive, got {}x{} in",
                self.trim.width_in, self.trim.height_in
            ));
        }
        if self.dpi <= 0.0 {
            return Err(format!("dpi must be positive, got {}", self.dpi));
        }
        let content = self.content_box();
        if content.width <= 0.0 || content.height <= 0.0 {
            return Err("margins leave no room for content".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Content model
// ---------------------------------------------------------------------------

/// Book-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// Asset name of the cover image shown on the title page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    /// Overrides the preset's trim size when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimSize>,
    /// Overrides the preset's margins when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margins: Option<Margins>,
}

/// A single chapter as produced by the upstream content source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub frontmatter: BTreeMap<String, serde_json::Value>,
}

/// Raw bytes of an embedded asset. Serialized as standard base64.
#[derive(Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Asset({} bytes)", self.bytes.len())
    }
}

impl Serialize for Asset {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.bytes))
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map(|bytes| Asset { bytes })
            .map_err(serde::de::Error::custom)
    }
}

/// The complete, read-only input of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentModel {
    pub metadata: BookMetadata,
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

// ---------------------------------------------------------------------------
// BuildConfig
// ---------------------------------------------------------------------------

/// Attempt-scoped remediation thresholds.
///
/// A fresh value is derived for every attempt; values are never edited in
/// place. Every threshold is non-increasing across a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// How many times this config has been derived from a predecessor.
    pub generation: u32,
    pub max_paragraph_chars: usize,
    pub max_code_block_height_pt: f64,
    pub body_font_size_pt: f64,
    pub max_image_dimension_px: u32,
}

impl BuildConfig {
    /// True when no threshold of `self` is looser than the same threshold of `previous`.
    pub fn is_no_looser_than(&self, previous: &BuildConfig) -> bool {
        self.max_paragraph_chars <= previous.max_paragraph_chars
            && self.max_code_block_height_pt <= previous.max_code_block_height_pt
            && self.body_font_size_pt <= previous.body_font_size_pt
            && self.max_image_dimension_px <= previous.max_image_dimension_px
    }
}

// ---------------------------------------------------------------------------
// Inspection results
// ---------------------------------------------------------------------------

/// Coarse classification of a rendered element, used to pick a remediation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Heading,
    Paragraph,
    Code,
    Image,
    Epigraph,
    #[serde(other)]
    Other,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heading => "heading",
            Self::Paragraph => "paragraph",
            Self::Code => "code",
            Self::Image => "image",
            Self::Epigraph => "epigraph",
            Self::Other => "other",
        }
    }
}

/// One element extending past its page's content box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementOverflow {
    pub descriptor: String,
    pub kind: ElementKind,
    /// Points past the content box's right edge (0 when contained).
    pub exceeds_right_by_pt: f64,
    /// Points past the content box's bottom edge (0 when contained).
    pub exceeds_bottom_by_pt: f64,
}

/// All overflowing elements on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOverflow {
    pub page_index: usize,
    pub elements: Vec<ElementOverflow>,
}

/// Overflow findings for one inspection pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OverflowReport {
    pub pages: Vec<PageOverflow>,
}

impl OverflowReport {
    pub fn is_clean(&self) -> bool {
        self.pages.iter().all(|p| p.elements.is_empty())
    }

    pub fn violation_count(&self) -> usize {
        self.pages.iter().map(|p| p.elements.len()).sum()
    }

    /// Distinct element kinds that overflowed.
    pub fn kinds(&self) -> BTreeSet<ElementKind> {
        self.pages
            .iter()
            .flat_map(|p| p.elements.iter().map(|e| e.kind))
            .collect()
    }

    /// Flatten into one `Overflow` issue per element.
    pub fn to_issues(&self) -> Vec<Issue> {
        self.pages
            .iter()
            .flat_map(|page| {
                page.elements.iter().map(move |el| Issue {
                    kind: IssueKind::Overflow,
                    page_index: Some(page.page_index),
                    detail: format!(
                        "{} ({}) exceeds right by {:.1}pt, bottom by {:.1}pt",
                        el.descriptor,
                        el.kind.as_str(),
                        el.exceeds_right_by_pt,
                        el.exceeds_bottom_by_pt
                    ),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Issues & validation
// ---------------------------------------------------------------------------

/// Classification of everything that can go wrong in an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Compile,
    Overflow,
    MissingImageLoad,
    Nondeterministic,
    TransientRender,
    NormalizationDegraded,
    StructuralValidation,
    BudgetExhausted,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Overflow => "overflow",
            Self::MissingImageLoad => "missing_image_load",
            Self::Nondeterministic => "nondeterministic",
            Self::TransientRender => "transient_render",
            Self::NormalizationDegraded => "normalization_degraded",
            Self::StructuralValidation => "structural_validation",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// A single finding attached to a validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_index: Option<usize>,
    pub detail: String,
}

impl Issue {
    pub fn new(kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            page_index: None,
            detail: detail.into(),
        }
    }

    pub fn on_page(kind: IssueKind, page_index: usize, detail: impl Into<String>) -> Self {
        Self {
            kind,
            page_index: Some(page_index),
            detail: detail.into(),
        }
    }
}

/// Combined verdict of an attempt's checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub dimensions_ok: bool,
    pub structure_ok: bool,
    pub images_ok: bool,
    pub issues: Vec<Issue>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            dimensions_ok: true,
            structure_ok: true,
            images_ok: true,
            issues: Vec::new(),
        }
    }
}

impl ValidationResult {
    /// All three gates hold. Non-fatal issues (e.g. degraded normalization) may remain.
    pub fn passed(&self) -> bool {
        self.dimensions_ok && self.structure_ok && self.images_ok
    }

    /// Result carrying a single issue, with all flags left untouched.
    pub fn with_issue(issue: Issue) -> Self {
        Self {
            issues: vec![issue],
            ..Self::default()
        }
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    /// Compact `kind×count` summary for log lines, e.g. `overflow×2,normalization_degraded×1`.
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<IssueKind, usize> = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.kind).or_default() += 1;
        }
        if counts.is_empty() {
            return "none".into();
        }
        counts
            .iter()
            .map(|(kind, n)| format!("{}×{n}", kind.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ---------------------------------------------------------------------------
// Attempt history
// ---------------------------------------------------------------------------

/// Stage an attempt was in when it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Compiling,
    Inspecting,
    Rendering,
    Normalizing,
    Validating,
    Finalizing,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::Inspecting => "inspecting",
            Self::Rendering => "rendering",
            Self::Normalizing => "normalizing",
            Self::Validating => "validating",
            Self::Finalizing => "finalizing",
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    Fatal,
    VisualViolation,
    Transient,
    StructuralFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Fatal => "fatal",
            Self::VisualViolation => "visual_violation",
            Self::Transient => "transient",
            Self::StructuralFailure => "structural_failure",
        }
    }
}

/// Which budget an attempt was charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCharge {
    Main,
    Transient,
}

/// One entry of the append-only attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub stage: BuildStage,
    pub outcome: AttemptOutcome,
    pub budget: BudgetCharge,
    pub config: BuildConfig,
    pub validation: ValidationResult,
    pub duration_ms: u64,
}

/// The single persisted output of a successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub page_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_spec() -> PageSpec {
        PageSpec::new(
            TrimSize {
                width_in: 6.0,
                height_in: 9.0,
            },
            Margins::uniform(0.75),
        )
    }

    #[test]
    fn content_box_subtracts_margins() {
        let spec = trade_spec();
        let content = spec.content_box();
        assert_eq!(spec.width_pt(), 432.0);
        assert_eq!(spec.height_pt(), 648.0);
        assert_eq!(content.x, 54.0);
        assert_eq!(content.right(), 378.0);
        assert_eq!(content.bottom(), 594.0);
    }

    #[test]
    fn page_spec_rejects_oversized_margins() {
        let spec = PageSpec::new(
            TrimSize {
                width_in: 2.0,
                height_in: 3.0,
            },
            Margins::uniform(1.0),
        );
        assert!(spec.validate().is_err());
        assert!(trade_spec().validate().is_ok());
    }

    #[test]
    fn px_to_pt_uses_css_reference_pixel() {
        let spec = trade_spec();
        let rect = Rect::new(96.0, 0.0, 96.0, 48.0).scaled(spec.px_to_pt());
        assert_eq!(rect.x, 72.0);
        assert_eq!(rect.height, 36.0);
    }

    #[test]
    fn asset_deserializes_from_base64() {
        let json = r#"{"metadata":{"title":"T"},"chapters":[],"assets":{"a.png":"aGVsbG8="}}"#;
        let model: ContentModel = serde_json::from_str(json).expect("deserialize");
        assert_eq!(model.assets["a.png"].bytes, b"hello");

        let back = serde_json::to_string(&model).expect("serialize");
        assert!(back.contains("aGVsbG8="));
    }

    #[test]
    fn invalid_base64_asset_is_rejected() {
        let json = r#"{"metadata":{"title":"T"},"chapters":[],"assets":{"a.png":"***"}}"#;
        assert!(serde_json::from_str::<ContentModel>(json).is_err());
    }

    #[test]
    fn overflow_report_flattens_to_issues() {
        let report = OverflowReport {
            pages: vec![PageOverflow {
                page_index: 5,
                elements: vec![ElementOverflow {
                    descriptor: "p5-code-1".into(),
                    kind: ElementKind::Code,
                    exceeds_right_by_pt: 0.0,
                    exceeds_bottom_by_pt: 120.5,
                }],
            }],
        };
        assert!(!report.is_clean());
        assert_eq!(report.violation_count(), 1);
        assert!(report.kinds().contains(&ElementKind::Code));

        let issues = report.to_issues();
        assert_eq!(issues[0].kind, IssueKind::Overflow);
        assert_eq!(issues[0].page_index, Some(5));
        assert!(issues[0].detail.contains("120.5pt"));
    }

    #[test]
    fn unknown_element_kind_maps_to_other() {
        let kind: ElementKind = serde_json::from_str(r#""table""#).expect("deserialize");
        assert_eq!(kind, ElementKind::Other);
    }

    #[test]
    fn validation_summary_counts_kinds() {
        let mut result = ValidationResult::default();
        assert_eq!(result.summary(), "none");
        result.issues.push(Issue::new(IssueKind::Overflow, "a"));
        result.issues.push(Issue::new(IssueKind::Overflow, "b"));
        result
            .issues
            .push(Issue::new(IssueKind::NormalizationDegraded, "gs missing"));
        assert_eq!(result.summary(), "overflow×2,normalization_degraded×1");
        assert!(result.passed());
    }

    #[test]
    fn build_config_looseness_comparison() {
        let base = BuildConfig {
            generation: 0,
            max_paragraph_chars: 2000,
            max_code_block_height_pt: 400.0,
            body_font_size_pt: 11.0,
            max_image_dimension_px: 1600,
        };
        let tighter = BuildConfig {
            generation: 1,
            max_code_block_height_pt: 300.0,
            ..base.clone()
        };
        assert!(tighter.is_no_looser_than(&base));
        assert!(!base.is_no_looser_than(&tighter));
    }
}
