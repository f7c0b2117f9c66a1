//! Application configuration for Folio.
//!
//! User config lives at `~/.folio/folio.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FolioError, Result};
use crate::tool::ToolCommand;
use crate::types::{BuildConfig, Margins, PageSpec, TrimSize};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "folio.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".folio";

// ---------------------------------------------------------------------------
// Config structs (matching folio.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Rendering engine bridge.
    #[serde(default)]
    pub engine: EngineConfig,

    /// External post-processing and validation tools.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Per-stage time boxes.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Structural validation thresholds.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// User-defined presets; these shadow built-ins with the same name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub presets: BTreeMap<String, PresetConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Maximum attempts charged to the main budget.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Transient failures absorbed before the main budget is charged.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Optional wall-clock budget for a whole run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_clock_budget_secs: Option<u64>,

    /// Preset used when `--preset` is not given.
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Parent directory for per-attempt workspaces (defaults to the system temp dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_root: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            transient_retries: default_transient_retries(),
            wall_clock_budget_secs: None,
            preset: default_preset(),
            run_root: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    30
}
fn default_transient_retries() -> u32 {
    3
}
fn default_preset() -> String {
    "trade".into()
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program that hosts the rendering engine bridge.
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Arguments passed to the bridge program.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    /// How long to wait for the bridge's ready handshake.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            ready_timeout_ms: default_ready_timeout(),
        }
    }
}

fn default_engine_command() -> String {
    "node".into()
}
fn default_engine_args() -> Vec<String> {
    vec!["tools/render-bridge.mjs".into()]
}
fn default_ready_timeout() -> u64 {
    20_000
}

/// `[tools]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Font embedding / version pinning tool.
    #[serde(default = "default_normalizer")]
    pub normalizer: ToolCommand,

    /// Compatibility level the normalizer pins (e.g. "1.4").
    #[serde(default = "default_compatibility_level")]
    pub compatibility_level: String,

    /// Structural integrity checker.
    #[serde(default = "default_integrity_checker")]
    pub integrity_checker: ToolCommand,

    /// Page rasterizer used as a blank-page probe.
    #[serde(default = "default_rasterizer")]
    pub rasterizer: ToolCommand,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            normalizer: default_normalizer(),
            compatibility_level: default_compatibility_level(),
            integrity_checker: default_integrity_checker(),
            rasterizer: default_rasterizer(),
        }
    }
}

fn default_normalizer() -> ToolCommand {
    ToolCommand::new("gs")
}
fn default_compatibility_level() -> String {
    "1.4".into()
}
fn default_integrity_checker() -> ToolCommand {
    ToolCommand::new("qpdf")
}
fn default_rasterizer() -> ToolCommand {
    ToolCommand::new("pdftoppm")
}

/// `[timeouts]` section (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_load_timeout")]
    pub load_ms: u64,
    #[serde(default = "default_inspect_timeout")]
    pub inspect_ms: u64,
    #[serde(default = "default_render_timeout")]
    pub render_ms: u64,
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    #[serde(default = "default_tool_timeout")]
    pub tool_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            load_ms: default_load_timeout(),
            inspect_ms: default_inspect_timeout(),
            render_ms: default_render_timeout(),
            settle_ms: default_settle(),
            tool_ms: default_tool_timeout(),
        }
    }
}

fn default_load_timeout() -> u64 {
    30_000
}
fn default_inspect_timeout() -> u64 {
    30_000
}
fn default_render_timeout() -> u64 {
    60_000
}
fn default_settle() -> u64 {
    250
}
fn default_tool_timeout() -> u64 {
    120_000
}

/// `[validation]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Rasters smaller than this are treated as blank pages.
    #[serde(default = "default_min_raster_bytes")]
    pub min_raster_bytes: u64,

    /// Resolution of the blank-page probe.
    #[serde(default = "default_raster_dpi")]
    pub raster_dpi: u32,

    /// Interior pages sampled in addition to page 1.
    #[serde(default = "default_raster_sample_pages")]
    pub raster_sample_pages: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_raster_bytes: default_min_raster_bytes(),
            raster_dpi: default_raster_dpi(),
            raster_sample_pages: default_raster_sample_pages(),
        }
    }
}

fn default_min_raster_bytes() -> u64 {
    1_024
}
fn default_raster_dpi() -> u32 {
    36
}
fn default_raster_sample_pages() -> usize {
    2
}

/// `[presets.<name>]` entry: page geometry plus the initial thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub trim: TrimSize,
    pub margins: Margins,
    pub max_paragraph_chars: usize,
    pub max_code_block_height_pt: f64,
    pub body_font_size_pt: f64,
    pub max_image_dimension_px: u32,
}

impl PresetConfig {
    /// Page spec for this preset; trim and margins from the book win when given.
    pub fn page_spec(&self, trim: Option<TrimSize>, margins: Option<Margins>) -> PageSpec {
        PageSpec::new(trim.unwrap_or(self.trim), margins.unwrap_or(self.margins))
    }

    /// The generation-0 build config.
    pub fn initial_config(&self) -> BuildConfig {
        BuildConfig {
            generation: 0,
            max_paragraph_chars: self.max_paragraph_chars,
            max_code_block_height_pt: self.max_code_block_height_pt,
            body_font_size_pt: self.body_font_size_pt,
            max_image_dimension_px: self.max_image_dimension_px,
        }
    }
}

/// Presets shipped with the tool.
pub fn builtin_presets() -> BTreeMap<String, PresetConfig> {
    let preset = |width_in: f64, height_in: f64, margin_in: f64, font: f64| PresetConfig {
        trim: TrimSize {
            width_in,
            height_in,
        },
        margins: Margins::uniform(margin_in),
        max_paragraph_chars: 2_400,
        max_code_block_height_pt: (height_in - 2.0 * margin_in) * 72.0 * 0.6,
        body_font_size_pt: font,
        max_image_dimension_px: 1_800,
    };

    BTreeMap::from([
        ("trade".to_string(), preset(6.0, 9.0, 0.75, 11.0)),
        ("digest".to_string(), preset(5.5, 8.5, 0.625, 10.5)),
        ("a5".to_string(), preset(5.83, 8.27, 0.6, 10.5)),
        ("letter".to_string(), preset(8.5, 11.0, 1.0, 12.0)),
    ])
}

/// Look up a preset by name, user presets first.
pub fn resolve_preset(config: &AppConfig, name: &str) -> Result<PresetConfig> {
    if let Some(preset) = config.presets.get(name) {
        return Ok(preset.clone());
    }
    builtin_presets().remove(name).ok_or_else(|| {
        let mut known: Vec<String> = builtin_presets().into_keys().collect();
        known.extend(config.presets.keys().cloned());
        FolioError::config(format!(
            "unknown preset '{name}' (known: {})",
            known.join(", ")
        ))
    })
}

// ---------------------------------------------------------------------------
// Build settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Time boxes for each blocking stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    pub load: Duration,
    pub inspect: Duration,
    pub render: Duration,
    pub settle: Duration,
    pub tool: Duration,
}

impl From<&TimeoutsConfig> for StageTimeouts {
    fn from(t: &TimeoutsConfig) -> Self {
        Self {
            load: Duration::from_millis(t.load_ms),
            inspect: Duration::from_millis(t.inspect_ms),
            render: Duration::from_millis(t.render_ms),
            settle: Duration::from_millis(t.settle_ms),
            tool: Duration::from_millis(t.tool_ms),
        }
    }
}

/// Runtime build settings - merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Ceiling on main-budget attempts.
    pub max_attempts: u32,
    /// Transient sub-budget.
    pub transient_retries: u32,
    /// Optional wall-clock budget for the whole run.
    pub wall_clock_budget: Option<Duration>,
    /// Per-stage timeouts.
    pub timeouts: StageTimeouts,
    /// Structural validation thresholds.
    pub validation: ValidationConfig,
    /// Parent directory for attempt workspaces.
    pub run_root: PathBuf,
}

impl From<&AppConfig> for BuildSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.defaults.max_attempts,
            transient_retries: config.defaults.transient_retries,
            wall_clock_budget: config
                .defaults
                .wall_clock_budget_secs
                .map(Duration::from_secs),
            timeouts: StageTimeouts::from(&config.timeouts),
            validation: config.validation.clone(),
            run_root: config
                .defaults
                .run_root
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.folio/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| FolioError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.folio/folio.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FolioError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FolioError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FolioError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FolioError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FolioError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
