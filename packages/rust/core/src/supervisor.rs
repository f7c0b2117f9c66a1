//! Convergence Supervisor: the attempt loop and its budgets.
//!
//! Each attempt runs `Compiling → Inspecting → Rendering → Normalizing →
//! Validating` in a fresh workspace with a fresh engine. Only this module
//! interprets stage results: visual violations tighten the config, transient
//! failures retry it unchanged, compile errors stop the build.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tempfile::TempDir;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use folio_compiler::compile;
use folio_engine::{BridgeLauncher, EngineLauncher, EngineLease, RenderEngine};
use folio_inspector::{InspectionOutcome, Inspector};
use folio_render::{GhostscriptNormalizer, Normalizer, RenderError, Renderer, normalize_or_degrade};
use folio_shared::{
    AppConfig, AttemptOutcome, AttemptRecord, BudgetCharge, BuildConfig, BuildSettings,
    BuildStage, ContentModel, FinalArtifact, FolioError, Issue, IssueKind, OverflowReport,
    PageSpec, Result, ValidationResult,
};
use folio_validator::StructuralValidator;

use crate::finalize::{finalize_artifact, sidecar_path, write_attempt_history};
use crate::progress::BuildProgress;
use crate::remediation;
use crate::run_log::RunLog;

const RAW_FILE_NAME: &str = "raw.pdf";
const NORMALIZED_FILE_NAME: &str = "normalized.pdf";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Compiling,
    Inspecting,
    Rendering,
    Normalizing,
    Validating,
    Remediating,
    Success,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::Inspecting => "inspecting",
            Self::Rendering => "rendering",
            Self::Normalizing => "normalizing",
            Self::Validating => "validating",
            Self::Remediating => "remediating",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Everything one build needs besides the collaborators.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub model: &'a ContentModel,
    pub spec: PageSpec,
    pub initial_config: BuildConfig,
    pub output: PathBuf,
    /// Defaults to `<output>.build.log`.
    pub run_log: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Success {
        artifact: FinalArtifact,
        attempts: Vec<AttemptRecord>,
    },
    /// A budget ran out before any attempt passed.
    Exhausted {
        reason: String,
        last_validation: ValidationResult,
        attempts: Vec<AttemptRecord>,
    },
    /// A non-retryable failure (bad content, missing asset).
    Fatal {
        error: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl BuildOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success { .. } => 0,
            Self::Exhausted { .. } => 1,
            Self::Fatal { .. } => 2,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Success { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => attempts,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Exhausted { .. } => "exhausted",
            Self::Fatal { .. } => "fatal",
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt results (internal)
// ---------------------------------------------------------------------------

enum Verdict {
    Passed { artifact: PathBuf, page_count: usize },
    Fatal(String),
    Violation(OverflowReport),
    Transient,
    Structural,
}

struct AttemptReport {
    stage: BuildStage,
    verdict: Verdict,
    validation: ValidationResult,
    /// Keeps the attempt's files alive until the report is consumed.
    _workspace: TempDir,
}

impl AttemptReport {
    fn new(
        stage: BuildStage,
        verdict: Verdict,
        validation: ValidationResult,
        workspace: TempDir,
    ) -> Self {
        Self {
            stage,
            verdict,
            validation,
            _workspace: workspace,
        }
    }
}

struct Budgets {
    max_attempts: u32,
    transient_retries: u32,
    main_used: u32,
    transient_used: u32,
}

impl Budgets {
    fn exhausted(&self) -> bool {
        self.main_used >= self.max_attempts
    }

    fn charge(&mut self, transient: bool) -> BudgetCharge {
        if transient && self.transient_used < self.transient_retries {
            self.transient_used += 1;
            BudgetCharge::Transient
        } else {
            self.main_used += 1;
            BudgetCharge::Main
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    launcher: Arc<dyn EngineLauncher>,
    normalizer: Arc<dyn Normalizer>,
    validator: StructuralValidator,
    settings: BuildSettings,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        normalizer: Arc<dyn Normalizer>,
        validator: StructuralValidator,
        settings: BuildSettings,
    ) -> Self {
        Self {
            launcher,
            normalizer,
            validator,
            settings,
        }
    }

    /// Real collaborators: the engine bridge and the `[tools]` commands.
    pub fn from_config(config: &AppConfig, settings: BuildSettings) -> Self {
        let tool_timeout = settings.timeouts.tool;
        Self::new(
            Arc::new(BridgeLauncher::from(&config.engine)),
            Arc::new(GhostscriptNormalizer::from_config(&config.tools, tool_timeout)),
            StructuralValidator::from_config(&config.tools, &settings.validation, tool_timeout),
            settings,
        )
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Run attempts until one passes, a budget runs out, or a fatal error.
    ///
    /// `Err` is reserved for failures of the supervisor's own bookkeeping
    /// (run log, finalization I/O); build failures are `Ok(BuildOutcome)`.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, output = %request.output.display()))]
    pub async fn build(
        &self,
        request: &BuildRequest<'_>,
        progress: &dyn BuildProgress,
    ) -> Result<BuildOutcome> {
        let run_id = Uuid::now_v7().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let log_path = request
            .run_log
            .clone()
            .unwrap_or_else(|| sidecar_path(&request.output, ".build.log"));
        let run_log = RunLog::create(&log_path)?;

        info!(
            chapters = request.model.chapters.len(),
            max_attempts = self.settings.max_attempts,
            transient_retries = self.settings.transient_retries,
            log = %log_path.display(),
            "starting build"
        );

        let started = Instant::now();
        let mut budgets = Budgets {
            max_attempts: self.settings.max_attempts.max(1),
            transient_retries: self.settings.transient_retries,
            main_used: 0,
            transient_used: 0,
        };
        let mut config = request.initial_config.clone();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut last_validation = ValidationResult::default();
        let mut attempt_number = 0u32;

        let outcome = loop {
            if budgets.exhausted() {
                break self.exhausted(
                    format!("attempt budget of {} exhausted", budgets.max_attempts),
                    &last_validation,
                    &mut history,
                );
            }
            if let Some(limit) = self.settings.wall_clock_budget {
                if attempt_number > 0 && started.elapsed() >= limit {
                    break self.exhausted(
                        format!("wall-clock budget of {}s exhausted", limit.as_secs()),
                        &last_validation,
                        &mut history,
                    );
                }
            }

            attempt_number += 1;
            progress.attempt_started(attempt_number, &config);
            let started_at = Utc::now();
            let attempt_clock = Instant::now();

            let span = info_span!("attempt", attempt = attempt_number, generation = config.generation);
            let report = self
                .run_attempt(request, &config, attempt_number, progress)
                .instrument(span)
                .await?;

            let (outcome, transient) = match &report.verdict {
                Verdict::Passed { .. } => (AttemptOutcome::Passed, false),
                Verdict::Fatal(_) => (AttemptOutcome::Fatal, false),
                Verdict::Violation(_) => (AttemptOutcome::VisualViolation, false),
                Verdict::Transient => (AttemptOutcome::Transient, true),
                Verdict::Structural => (AttemptOutcome::StructuralFailure, true),
            };
            let budget = budgets.charge(transient);

            let mut stage = report.stage;
            let mut finalized = None;
            if let Verdict::Passed {
                artifact,
                page_count,
            } = &report.verdict
            {
                progress.state(attempt_number, BuildState::Success);
                stage = BuildStage::Finalizing;
                finalized = Some(finalize_artifact(artifact, &request.output, *page_count)?);
            }

            let record = AttemptRecord {
                attempt_number,
                started_at,
                stage,
                outcome,
                budget,
                config: config.clone(),
                validation: report.validation.clone(),
                duration_ms: attempt_clock.elapsed().as_millis() as u64,
            };
            run_log.append(&record)?;
            progress.attempt_finished(&record);
            info!(
                attempt = attempt_number,
                stage = stage.as_str(),
                outcome = outcome.as_str(),
                budget = ?budget,
                issues = %record.validation.summary(),
                "attempt finished"
            );
            history.push(record);
            last_validation = report.validation;

            if let Some(artifact) = finalized {
                break BuildOutcome::Success {
                    artifact,
                    attempts: std::mem::take(&mut history),
                };
            }
            match report.verdict {
                Verdict::Fatal(error) => {
                    progress.state(attempt_number, BuildState::Failed);
                    break BuildOutcome::Fatal {
                        error,
                        attempts: std::mem::take(&mut history),
                    };
                }
                Verdict::Violation(overflow) => {
                    progress.state(attempt_number, BuildState::Remediating);
                    let current = compile(request.model, &config, &request.spec)
                        .ok()
                        .map(|compiled| compiled.markup);
                    let generation = config.generation;
                    config = remediation::tighten_effective(&config, &overflow, |candidate| {
                        compiles_differently(request, current.as_deref(), candidate, generation)
                    });
                }
                Verdict::Passed { .. } | Verdict::Transient | Verdict::Structural => {
                    progress.state(attempt_number, BuildState::Remediating);
                    debug!(
                        transient_used = budgets.transient_used,
                        main_used = budgets.main_used,
                        "retrying with unchanged config"
                    );
                }
            }
        };

        write_attempt_history(&request.output, &run_id, outcome.label(), outcome.attempts())?;
        progress.done(&outcome);
        Ok(outcome)
    }

    fn exhausted(
        &self,
        reason: String,
        last_validation: &ValidationResult,
        history: &mut Vec<AttemptRecord>,
    ) -> BuildOutcome {
        warn!(%reason, attempts = history.len(), "build failed");
        let mut last_validation = last_validation.clone();
        last_validation
            .issues
            .push(Issue::new(IssueKind::BudgetExhausted, reason.clone()));
        BuildOutcome::Exhausted {
            reason,
            last_validation,
            attempts: std::mem::take(history),
        }
    }

    async fn run_attempt(
        &self,
        request: &BuildRequest<'_>,
        config: &BuildConfig,
        attempt: u32,
        progress: &dyn BuildProgress,
    ) -> Result<AttemptReport> {
        let workspace = tempfile::Builder::new()
            .prefix("folio-attempt-")
            .tempdir_in(&self.settings.run_root)
            .map_err(|e| FolioError::io(&self.settings.run_root, e))?;
        // --- Compiling ---
        progress.state(attempt, BuildState::Compiling);
        let compiled = match compile(request.model, config, &request.spec) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(error = %e, "compilation failed");
                return Ok(AttemptReport::new(
                    BuildStage::Compiling,
                    Verdict::Fatal(e.to_string()),
                    ValidationResult::with_issue(Issue::new(IssueKind::Compile, e.to_string())),
                    workspace,
                ));
            }
        };
        let page_count = compiled.page_count();
        let markup = compiled.write_markup(workspace.path())?;

        // --- Inspecting + Rendering, on one leased engine ---
        progress.state(attempt, BuildState::Inspecting);
        let mut lease = match EngineLease::acquire(self.launcher.as_ref()).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "engine launch failed");
                return Ok(AttemptReport::new(
                    BuildStage::Inspecting,
                    Verdict::Transient,
                    ValidationResult::with_issue(Issue::new(
                        IssueKind::TransientRender,
                        e.to_string(),
                    )),
                    workspace,
                ));
            }
        };
        let raw = workspace.path().join(RAW_FILE_NAME);
        let engine_result = self
            .engine_stages(lease.engine(), &request.spec, &markup, &raw, attempt, progress)
            .await;
        lease.release().await;

        let (stage, verdict, validation) = match engine_result {
            Ok(images_ok) => {
                // --- Normalizing ---
                progress.state(attempt, BuildState::Normalizing);
                let normalized = normalize_or_degrade(
                    self.normalizer.as_ref(),
                    &raw,
                    &workspace.path().join(NORMALIZED_FILE_NAME),
                )
                .await;

                // --- Validating ---
                progress.state(attempt, BuildState::Validating);
                let mut validation = self
                    .validator
                    .validate(&normalized.path, &request.spec, page_count)
                    .await;
                validation.images_ok = images_ok;
                if let Some(issue) = normalized.degraded {
                    validation.issues.insert(0, issue);
                }

                if validation.passed() {
                    let verdict = Verdict::Passed {
                        artifact: normalized.path,
                        page_count,
                    };
                    (BuildStage::Validating, verdict, validation)
                } else {
                    (BuildStage::Validating, Verdict::Structural, validation)
                }
            }
            Err(failure) => failure,
        };

        Ok(AttemptReport::new(stage, verdict, validation, workspace))
    }

    /// Inspect, then render. `Ok(images_ok)` when a raw artifact was captured.
    async fn engine_stages(
        &self,
        engine: &mut dyn RenderEngine,
        spec: &PageSpec,
        markup: &Path,
        raw: &Path,
        attempt: u32,
        progress: &dyn BuildProgress,
    ) -> std::result::Result<bool, (BuildStage, Verdict, ValidationResult)> {
        let inspector = Inspector::new(spec.clone(), &self.settings.timeouts);
        let inspection = match inspector.inspect(engine, markup).await {
            Ok(InspectionOutcome::Clean(inspection)) => inspection,
            Ok(InspectionOutcome::Violations(inspection)) => {
                let validation = ValidationResult {
                    images_ok: inspection.images_ok(),
                    issues: inspection.issues(),
                    ..ValidationResult::default()
                };
                // Every image in compiled markup was resolved from a present
                // asset, so a load failure alone is the engine's fault.
                let verdict = if inspection.overflow.is_clean() {
                    Verdict::Transient
                } else {
                    Verdict::Violation(inspection.overflow)
                };
                return Err((BuildStage::Inspecting, verdict, validation));
            }
            Ok(InspectionOutcome::Nondeterministic(detail)) => {
                return Err((
                    BuildStage::Inspecting,
                    Verdict::Transient,
                    ValidationResult::with_issue(Issue::new(IssueKind::Nondeterministic, detail)),
                ));
            }
            Err(e) if e.is_transient() => {
                return Err((
                    BuildStage::Inspecting,
                    Verdict::Transient,
                    ValidationResult::with_issue(Issue::new(
                        IssueKind::TransientRender,
                        e.to_string(),
                    )),
                ));
            }
            Err(e) => {
                return Err((
                    BuildStage::Inspecting,
                    Verdict::Fatal(e.to_string()),
                    ValidationResult::with_issue(Issue::new(IssueKind::Compile, e.to_string())),
                ));
            }
        };

        progress.state(attempt, BuildState::Rendering);
        let renderer = Renderer::new(spec.clone(), &self.settings.timeouts);
        match renderer.render(engine, markup, raw).await {
            Ok(artifact) => {
                debug!(bytes = artifact.bytes, pages = artifact.pages, "raw artifact ready");
                Ok(inspection.images_ok())
            }
            Err(e) => Err(render_failure(&e)),
        }
    }
}

/// Whether `candidate` compiles to markup other than `current`, ignoring the
/// generation stamp. Anything that fails to compile counts as a change.
fn compiles_differently(
    request: &BuildRequest<'_>,
    current: Option<&str>,
    candidate: &BuildConfig,
    generation: u32,
) -> bool {
    let Some(current) = current else {
        return true;
    };
    let restamped = BuildConfig {
        generation,
        ..candidate.clone()
    };
    match compile(request.model, &restamped, &request.spec) {
        Ok(compiled) => compiled.markup != current,
        Err(_) => true,
    }
}

fn render_failure(e: &RenderError) -> (BuildStage, Verdict, ValidationResult) {
    warn!(error = %e, timeout = e.is_timeout(), "render failed");
    (
        BuildStage::Rendering,
        Verdict::Transient,
        ValidationResult::with_issue(Issue::new(IssueKind::TransientRender, e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use folio_engine::testing::{EngineStats, Faults, PinnedOverflow, SimulatedLauncher};
    use folio_shared::{
        Asset, BookMetadata, Chapter, PresetConfig, StageTimeouts, TimeoutsConfig, ToolError,
        ValidationConfig, builtin_presets,
    };
    use folio_validator::{IntegrityChecker, IntegrityVerdict, Rasterizer};

    use crate::progress::SilentProgress;

    // --- fakes for the external tools ---

    struct CopyNormalizer;

    #[async_trait]
    impl Normalizer for CopyNormalizer {
        fn name(&self) -> &str {
            "copy"
        }

        async fn normalize(&self, input: &Path, output: &Path) -> std::result::Result<(), ToolError> {
            std::fs::copy(input, output).map_err(|source| ToolError::Spawn {
                program: "copy".into(),
                source,
            })?;
            Ok(())
        }
    }

    struct BrokenNormalizer;

    #[async_trait]
    impl Normalizer for BrokenNormalizer {
        fn name(&self) -> &str {
            "broken"
        }

        async fn normalize(&self, _input: &Path, _output: &Path) -> std::result::Result<(), ToolError> {
            Err(ToolError::Failed {
                program: "gs".into(),
                status: 1,
                stderr: "Unrecoverable error".into(),
            })
        }
    }

    struct CleanChecker;

    #[async_trait]
    impl IntegrityChecker for CleanChecker {
        fn name(&self) -> &str {
            "clean"
        }

        async fn check(&self, _pdf: &Path) -> std::result::Result<IntegrityVerdict, ToolError> {
            Ok(IntegrityVerdict::Clean)
        }
    }

    struct FixedRasterizer(u64);

    #[async_trait]
    impl Rasterizer for FixedRasterizer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn rasterize(
            &self,
            _pdf: &Path,
            _page: usize,
            _dpi: u32,
            _scratch: &Path,
        ) -> std::result::Result<u64, ToolError> {
            Ok(self.0)
        }
    }

    // --- fixtures ---

    struct Harness {
        dir: tempfile::TempDir,
        launcher: SimulatedLauncher,
        settings: BuildSettings,
        normalizer: Arc<dyn Normalizer>,
        raster_bytes: u64,
    }

    impl Harness {
        fn new(faults: Faults) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = BuildSettings {
                max_attempts: 30,
                transient_retries: 3,
                wall_clock_budget: None,
                timeouts: StageTimeouts {
                    render: Duration::from_millis(50),
                    settle: Duration::ZERO,
                    ..StageTimeouts::from(&TimeoutsConfig::default())
                },
                validation: ValidationConfig::default(),
                run_root: dir.path().to_path_buf(),
            };
            Self {
                dir,
                launcher: SimulatedLauncher::with_faults(faults),
                settings,
                normalizer: Arc::new(CopyNormalizer),
                raster_bytes: 4096,
            }
        }

        fn stats(&self) -> Arc<EngineStats> {
            self.launcher.stats()
        }

        fn output(&self) -> PathBuf {
            self.dir.path().join("dist/book.pdf")
        }

        async fn build(&self, model: &ContentModel, initial: BuildConfig) -> BuildOutcome {
            let supervisor = Supervisor::new(
                Arc::new(self.launcher.clone()),
                self.normalizer.clone(),
                StructuralValidator::new(
                    Arc::new(CleanChecker),
                    Arc::new(FixedRasterizer(self.raster_bytes)),
                    self.settings.validation.clone(),
                ),
                self.settings.clone(),
            );
            let request = BuildRequest {
                model,
                spec: trade().page_spec(None, None),
                initial_config: initial,
                output: self.output(),
                run_log: None,
            };
            supervisor.build(&request, &SilentProgress).await.unwrap()
        }
    }

    fn trade() -> PresetConfig {
        builtin_presets().remove("trade").unwrap()
    }

    fn chapter(number: u32, body: &str) -> Chapter {
        Chapter {
            number,
            title: format!("Part {number}"),
            body: body.into(),
            frontmatter: BTreeMap::new(),
        }
    }

    fn book(chapters: Vec<Chapter>) -> ContentModel {
        ContentModel {
            metadata: BookMetadata {
                title: "Field Notes".into(),
                author: "A. Writer".into(),
                subtitle: None,
                cover: None,
                trim: None,
                margins: None,
            },
            chapters,
            assets: BTreeMap::new(),
        }
    }

    fn short_book() -> ContentModel {
        book(vec![
            chapter(1, "The first morning was quiet."),
            chapter(2, "Rain, then wind."),
            chapter(3, "We packed up and left."),
        ])
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([40, 40, 40]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn overflow_pages(record: &AttemptRecord) -> Vec<Option<usize>> {
        record
            .validation
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::Overflow)
            .map(|i| i.page_index)
            .collect()
    }

    /// Per-attempt workspaces still present under the run root.
    fn leftover_workspaces(harness: &Harness) -> Vec<String> {
        std::fs::read_dir(harness.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("folio-attempt-"))
            .collect()
    }

    // --- scenarios ---

    #[tokio::test]
    async fn oversized_code_block_converges_after_one_tightening() {
        let code: String = (1..=60).map(|i| format!("let x{i} = {i};\n")).collect();
        let model = book(vec![
            chapter(1, "Opening."),
            chapter(2, "Middle."),
            chapter(3, "Later."),
            chapter(4, &format!("```rust\n{code}```")),
        ]);
        let initial = BuildConfig {
            max_code_block_height_pt: 600.0,
            ..trade().initial_config()
        };

        let harness = Harness::new(Faults::default());
        let outcome = harness.build(&model, initial).await;

        let attempts = outcome.attempts();
        assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
        assert_eq!(attempts.len(), 2);

        assert_eq!(attempts[0].outcome, AttemptOutcome::VisualViolation);
        assert_eq!(attempts[0].stage, BuildStage::Inspecting);
        assert_eq!(overflow_pages(&attempts[0]), vec![Some(4)]);

        assert_eq!(attempts[1].outcome, AttemptOutcome::Passed);
        assert_eq!(attempts[1].config.generation, 1);
        assert_eq!(attempts[1].config.max_code_block_height_pt, 450.0);
        assert!(attempts[1].config.is_no_looser_than(&attempts[0].config));
        assert!(attempts[1].validation.passed());
        assert!(overflow_pages(&attempts[1]).is_empty());
    }

    #[tokio::test]
    async fn missing_cover_is_fatal_without_retry() {
        let mut model = short_book();
        model.metadata.cover = Some("cover.png".into());

        let harness = Harness::new(Faults::default());
        let outcome = harness.build(&model, trade().initial_config()).await;

        assert_eq!(outcome.exit_code(), 2);
        let BuildOutcome::Fatal { error, attempts } = &outcome else {
            panic!("expected fatal, got {outcome:?}");
        };
        assert!(error.contains("cover.png"));
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].stage, BuildStage::Compiling);
        assert!(attempts[0].validation.has_issue(IssueKind::Compile));
        assert_eq!(harness.stats().launches(), 0);
        assert!(!harness.output().exists());
        assert_eq!(leftover_workspaces(&harness), Vec::<String>::new());
    }

    #[tokio::test]
    async fn hanging_renders_use_the_transient_budget() {
        let harness = Harness::new(Faults {
            hanging_exports: 2,
            ..Faults::default()
        });
        let initial = trade().initial_config();
        let outcome = harness.build(&short_book(), initial.clone()).await;

        let attempts = outcome.attempts();
        assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
        assert_eq!(attempts.len(), 3);
        for record in &attempts[..2] {
            assert_eq!(record.outcome, AttemptOutcome::Transient);
            assert_eq!(record.stage, BuildStage::Rendering);
            assert_eq!(record.budget, BudgetCharge::Transient);
            assert!(record.validation.has_issue(IssueKind::TransientRender));
        }
        assert_eq!(attempts[2].budget, BudgetCharge::Main);
        assert!(attempts.iter().all(|r| r.config == initial));

        let stats = harness.stats();
        assert_eq!(stats.launches(), 3);
        assert_eq!(stats.shutdowns(), 3);
        assert_eq!(stats.drops(), 3);
    }

    #[tokio::test]
    async fn clean_book_passes_first_time_and_persists_sidecars() {
        let harness = Harness::new(Faults::default());
        let model = short_book();
        let outcome = harness.build(&model, trade().initial_config()).await;

        let BuildOutcome::Success { artifact, attempts } = &outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].stage, BuildStage::Finalizing);
        assert_eq!(artifact.page_count, model.chapters.len() + 2);
        assert_eq!(artifact.path, harness.output());

        let sidecar = std::fs::read_to_string(sidecar_path(&artifact.path, ".sha256")).unwrap();
        assert!(sidecar.starts_with(&artifact.sha256));
        assert!(sidecar_path(&artifact.path, ".attempts.json").exists());

        let log = std::fs::read_to_string(sidecar_path(&artifact.path, ".build.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("attempt=1\tstage=finalizing\toutcome=passed\tissues=none"));

        // Every page of the final artifact matches the trim.
        let sizes = folio_validator::page_sizes(&artifact.path).unwrap();
        assert_eq!(sizes.len(), 5);
        assert!(sizes.iter().all(|s| (s.width_pt - 432.0).abs() <= 1.0));
        assert_eq!(leftover_workspaces(&harness), Vec::<String>::new());
    }

    #[tokio::test]
    async fn a_second_build_replaces_the_run_log() {
        let harness = Harness::new(Faults::default());
        let model = short_book();
        harness.build(&model, trade().initial_config()).await;
        harness.build(&model, trade().initial_config()).await;

        let log = std::fs::read_to_string(sidecar_path(&harness.output(), ".build.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn many_short_paragraphs_converge_by_stepping_the_font() {
        let body = (1..=25)
            .map(|i| format!("Short paragraph number {i}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let model = book(vec![chapter(1, &body)]);

        let harness = Harness::new(Faults::default());
        let outcome = harness.build(&model, trade().initial_config()).await;

        let attempts = outcome.attempts();
        assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
        assert_eq!(attempts.len(), 3);
        for record in &attempts[..2] {
            assert_eq!(record.outcome, AttemptOutcome::VisualViolation);
            assert!(!overflow_pages(record).is_empty());
        }
        let fonts: Vec<f64> = attempts.iter().map(|r| r.config.body_font_size_pt).collect();
        assert_eq!(fonts, vec![11.0, 10.5, 10.0]);
        let generations: Vec<u32> = attempts.iter().map(|r| r.config.generation).collect();
        assert_eq!(generations, vec![0, 1, 2]);
        assert!(attempts.windows(2).all(|w| w[1].config.is_no_looser_than(&w[0].config)));
        assert!(attempts[2].validation.passed());
    }

    #[tokio::test]
    async fn unresolvable_overflow_exhausts_the_budget() {
        let mut model = book(vec![chapter(1, "![Plate one](plate.png)")]);
        model.assets.insert("plate.png".into(), Asset { bytes: png() });

        let harness = Harness::new(Faults {
            pinned_overflow: Some(PinnedOverflow {
                descriptor: "p1-image-1".into(),
                exceeds_right_pt: 400.0,
                exceeds_bottom_pt: 0.0,
            }),
            ..Faults::default()
        });
        let outcome = harness.build(&model, trade().initial_config()).await;

        assert_eq!(outcome.exit_code(), 1);
        let BuildOutcome::Exhausted {
            attempts,
            last_validation,
            ..
        } = &outcome
        else {
            panic!("expected exhausted, got {outcome:?}");
        };
        assert_eq!(attempts.len(), 30);
        assert!(attempts.iter().all(|r| r.outcome == AttemptOutcome::VisualViolation
            && r.validation.has_issue(IssueKind::Overflow)));
        assert!(attempts.windows(2).all(|w| w[1].config.is_no_looser_than(&w[0].config)));
        assert!(
            attempts
                .iter()
                .enumerate()
                .all(|(i, r)| r.attempt_number == i as u32 + 1)
        );
        assert!(last_validation.has_issue(IssueKind::BudgetExhausted));
        assert!(!harness.output().exists());
        assert_eq!(leftover_workspaces(&harness), Vec::<String>::new());
    }

    // --- budget and classification edges ---

    #[tokio::test]
    async fn transient_failures_spill_into_the_main_budget() {
        let mut harness = Harness::new(Faults {
            hanging_exports: 100,
            ..Faults::default()
        });
        harness.settings.max_attempts = 2;
        harness.settings.transient_retries = 1;

        let outcome = harness.build(&short_book(), trade().initial_config()).await;
        assert_eq!(outcome.exit_code(), 1);
        let budgets: Vec<_> = outcome.attempts().iter().map(|r| r.budget).collect();
        assert_eq!(
            budgets,
            vec![BudgetCharge::Transient, BudgetCharge::Main, BudgetCharge::Main]
        );
    }

    #[tokio::test]
    async fn unstable_inspection_is_retried_unchanged() {
        let harness = Harness::new(Faults {
            jittered_measures: 1,
            ..Faults::default()
        });
        let outcome = harness.build(&short_book(), trade().initial_config()).await;

        let attempts = outcome.attempts();
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Transient);
        assert!(attempts[0].validation.has_issue(IssueKind::Nondeterministic));
        assert_eq!(attempts[0].config, attempts[1].config);
    }

    #[tokio::test]
    async fn image_that_never_loads_is_transient_not_tightened() {
        let mut model = book(vec![chapter(1, "![Plate one](plate.png)")]);
        model.assets.insert("plate.png".into(), Asset { bytes: png() });

        let mut harness = Harness::new(Faults {
            unloaded_images: ["p1-image-1".to_string()].into(),
            ..Faults::default()
        });
        harness.settings.max_attempts = 1;
        harness.settings.transient_retries = 1;

        let outcome = harness.build(&model, trade().initial_config()).await;
        assert_eq!(outcome.exit_code(), 1);
        let attempts = outcome.attempts();
        assert_eq!(attempts.len(), 2);
        for record in attempts {
            assert_eq!(record.outcome, AttemptOutcome::Transient);
            assert!(!record.validation.images_ok);
            assert!(record.validation.has_issue(IssueKind::MissingImageLoad));
            assert_eq!(record.config.generation, 0);
        }
    }

    #[tokio::test]
    async fn failed_normalization_still_ships_the_raw_capture() {
        let mut harness = Harness::new(Faults::default());
        harness.normalizer = Arc::new(BrokenNormalizer);

        let outcome = harness.build(&short_book(), trade().initial_config()).await;
        assert_eq!(outcome.exit_code(), 0, "{outcome:?}");
        let record = &outcome.attempts()[0];
        assert!(record.validation.passed());
        assert!(record.validation.has_issue(IssueKind::NormalizationDegraded));
    }

    #[tokio::test]
    async fn blank_pages_fail_structural_validation() {
        let mut harness = Harness::new(Faults::default());
        harness.raster_bytes = 10;
        harness.settings.max_attempts = 1;
        harness.settings.transient_retries = 1;

        let outcome = harness.build(&short_book(), trade().initial_config()).await;
        assert_eq!(outcome.exit_code(), 1);
        let attempts = outcome.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|r| r.outcome == AttemptOutcome::StructuralFailure
            && r.stage == BuildStage::Validating
            && r.validation.has_issue(IssueKind::StructuralValidation)));
    }

    #[tokio::test]
    async fn wall_clock_budget_stops_after_the_first_attempt() {
        let mut harness = Harness::new(Faults {
            hanging_exports: 100,
            ..Faults::default()
        });
        harness.settings.wall_clock_budget = Some(Duration::ZERO);

        let outcome = harness.build(&short_book(), trade().initial_config()).await;
        let BuildOutcome::Exhausted { reason, attempts, .. } = &outcome else {
            panic!("expected exhausted, got {outcome:?}");
        };
        assert_eq!(attempts.len(), 1);
        assert!(reason.contains("wall-clock"));
    }

    #[test]
    fn budgets_charge_transient_first() {
        let mut budgets = Budgets {
            max_attempts: 2,
            transient_retries: 1,
            main_used: 0,
            transient_used: 0,
        };
        assert_eq!(budgets.charge(true), BudgetCharge::Transient);
        assert_eq!(budgets.charge(true), BudgetCharge::Main);
        assert!(!budgets.exhausted());
        assert_eq!(budgets.charge(false), BudgetCharge::Main);
        assert!(budgets.exhausted());
    }
}
