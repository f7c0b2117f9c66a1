//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::Result;
use folio_core::{BuildOutcome, BuildProgress, BuildRequest, BuildState, Supervisor};
use folio_shared::{
    AppConfig, AttemptRecord, BuildConfig, BuildSettings, builtin_presets, init_config,
    load_config, load_content, resolve_preset,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

/// Exit code for invalid input that no retry can fix.
const EXIT_INVALID_INPUT: u8 = 2;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Folio: convergent book builds.
#[derive(Parser)]
#[command(
    name = "folio",
    version,
    about = "Build a print-ready book artifact, tightening layout until it validates.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build and validate a book artifact.
    Build(BuildArgs),

    /// List the available presets.
    Presets,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
pub(crate) struct BuildArgs {
    /// Content directory (book.json + assets/) or a single JSON content model.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Preset name (defaults to `[defaults].preset`).
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Ceiling on main-budget attempts.
    #[arg(long, env = "FOLIO_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Where the finished artifact is written.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Run log path (defaults to `<output>.build.log`).
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Retries for transient failures before the main budget is charged.
    #[arg(long)]
    pub transient_retries: Option<u32>,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long)]
    pub budget_secs: Option<u64>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "folio=info",
        1 => "folio=debug",
        _ => "folio=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Build(args) => cmd_build(&args).await,
        Command::Presets => cmd_presets().map(|()| ExitCode::SUCCESS),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().map(|()| ExitCode::SUCCESS),
            ConfigAction::Show => cmd_config_show().map(|()| ExitCode::SUCCESS),
        },
    }
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

/// Apply CLI overrides on top of the config-derived settings.
fn build_settings(config: &AppConfig, args: &BuildArgs) -> BuildSettings {
    let mut settings = BuildSettings::from(config);
    if let Some(n) = args.max_attempts {
        settings.max_attempts = n;
    }
    if let Some(n) = args.transient_retries {
        settings.transient_retries = n;
    }
    if let Some(secs) = args.budget_secs {
        settings.wall_clock_budget = Some(Duration::from_secs(secs));
    }
    settings
}

async fn cmd_build(args: &BuildArgs) -> Result<ExitCode> {
    let config = load_config()?;
    let preset_name = args
        .preset
        .clone()
        .unwrap_or_else(|| config.defaults.preset.clone());

    // Anything wrong with the inputs is fatal before the first attempt.
    let prepared = resolve_preset(&config, &preset_name).and_then(|preset| {
        let model = load_content(&args.input)?;
        let spec = preset.page_spec(model.metadata.trim, model.metadata.margins);
        spec.validate()
            .map_err(|e| folio_shared::FolioError::content(format!("page geometry: {e}")))?;
        Ok((preset, model, spec))
    });
    let (preset, model, spec) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(error = %e, input = %args.input.display(), "invalid input");
            eprintln!("error: {e}");
            return Ok(ExitCode::from(EXIT_INVALID_INPUT));
        }
    };

    let settings = build_settings(&config, args);
    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        preset = %preset_name,
        chapters = model.chapters.len(),
        "building book"
    );

    let supervisor = Supervisor::from_config(&config, settings);
    let request = BuildRequest {
        model: &model,
        spec,
        initial_config: preset.initial_config(),
        output: args.output.clone(),
        run_log: args.log.clone(),
    };

    let reporter = CliProgress::new();
    let outcome = supervisor.build(&request, &reporter).await?;
    print_summary(&outcome, &args.output);
    Ok(ExitCode::from(outcome.exit_code()))
}

fn print_summary(outcome: &BuildOutcome, output: &Path) {
    println!();
    match outcome {
        BuildOutcome::Success { artifact, attempts } => {
            println!("  Book built successfully!");
            println!("  Path:     {}", artifact.path.display());
            println!("  Pages:    {}", artifact.page_count);
            println!("  Size:     {} bytes", artifact.size_bytes);
            println!("  SHA-256:  {}", artifact.sha256);
            println!("  Attempts: {}", attempts.len());
        }
        BuildOutcome::Exhausted {
            reason,
            last_validation,
            attempts,
        } => {
            println!("  Build did not converge: {reason}");
            println!("  Attempts: {}", attempts.len());
            for issue in &last_validation.issues {
                match issue.page_index {
                    Some(page) => println!("    - [{}] page {page}: {}", issue.kind.as_str(), issue.detail),
                    None => println!("    - [{}] {}", issue.kind.as_str(), issue.detail),
                }
            }
        }
        BuildOutcome::Fatal { error, attempts } => {
            println!("  Build failed: {error}");
            println!("  Attempts: {}", attempts.len());
        }
    }
    println!("  History:  {}.attempts.json", output.display());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner showing the current attempt and stage.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl BuildProgress for CliProgress {
    fn state(&self, attempt: u32, state: BuildState) {
        self.spinner
            .set_message(format!("Attempt {attempt}: {}", state.as_str()));
    }

    fn attempt_started(&self, attempt: u32, config: &BuildConfig) {
        self.spinner.set_message(format!(
            "Attempt {attempt} (generation {}, body {:.1} pt)",
            config.generation, config.body_font_size_pt
        ));
    }

    fn attempt_finished(&self, record: &AttemptRecord) {
        self.spinner.println(format!(
            "  attempt {:>2}  {:<11}  {:<18}  {}",
            record.attempt_number,
            record.stage.as_str(),
            record.outcome.as_str(),
            record.validation.summary()
        ));
    }

    fn done(&self, _outcome: &BuildOutcome) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// presets / config
// ---------------------------------------------------------------------------

fn cmd_presets() -> Result<()> {
    let config = load_config()?;
    let mut presets = builtin_presets();
    presets.extend(config.presets.clone());

    for (name, preset) in &presets {
        let marker = if name == &config.defaults.preset { "*" } else { " " };
        println!(
            "{marker} {name:<10} {:.2} x {:.2} in, body {:.1} pt",
            preset.trim.width_in, preset.trim.height_in, preset.body_font_size_pt
        );
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
