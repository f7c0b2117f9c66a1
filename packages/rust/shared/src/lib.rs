//! Shared types, error model, and configuration for Folio.
//!
//! This crate is the foundation depended on by all other Folio crates.
//! It provides:
//! - Error types ([`FolioError`], [`ToolError`])
//! - Domain types ([`ContentModel`], [`BuildConfig`], [`PageSpec`], [`ValidationResult`], ...)
//! - Configuration ([`AppConfig`], [`BuildSettings`], presets, config loading)
//! - Content loading and time-boxed external tool invocation

pub mod config;
pub mod content;
pub mod error;
pub mod tool;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildSettings, DefaultsConfig, EngineConfig, PresetConfig, StageTimeouts,
    TimeoutsConfig, ToolsConfig, ValidationConfig, builtin_presets, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_preset,
};
pub use content::load_content;
pub use error::{FolioError, Result, ToolError};
pub use tool::{ToolCommand, ToolOutput, run_tool, run_tool_checked};
pub use types::{
    Asset, AttemptOutcome, AttemptRecord, BookMetadata, BudgetCharge, BuildConfig, BuildStage,
    CSS_PX_PER_INCH, Chapter, ContentModel, ElementKind, ElementOverflow, FinalArtifact,
    GEOMETRY_EPSILON_PT, Issue, IssueKind, Margins, OverflowReport, POINTS_PER_INCH, PageOverflow,
    PageSpec, Rect, TrimSize, ValidationResult,
};
