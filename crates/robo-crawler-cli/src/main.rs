//! Robo Crawler CLI: run robo tests against a simulated app and inspect their reports.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes
#![allow(clippy::fn_params_excessive_bools)] // CLI flags are naturally bools

use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use robo_crawler::app::sim::{ScreenGraph, SimulatedLauncher};
use robo_crawler::config::load_config_file;
use robo_crawler::report::{read_report, verify_checksums, ChecksumReport};
use robo_crawler::runner::{Clock, ProgressCallback, SystemClock};
use robo_crawler::script::{load_script_file, validate_script};
use robo_crawler::{
    CrawlerConfig, CrawlerError, CrawlerResult, EndReason, ErrorCode, HttpMethod,
    NetworkInterceptor, RequestMethodFilter, RoboCrawler, RunStatus, ScriptSource,
    TestOutputDetails, TestSettings, DEFAULT_MAX_RUN_MINUTES,
};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod progress;

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(
    name = "robo-crawler",
    version,
    about = "Automated UI exploration with traffic capture"
)]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a robo test against a simulated app model
    Run(RunArgs),
    /// Load and validate an action script without running it
    CheckScript {
        #[arg(help = "Path to a JSON or YAML script")]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print a persisted report
    ShowReport {
        #[arg(help = "Report directory (run-<id>)")]
        dir: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long, help = "Recompute artifact checksums")]
        verify: bool,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("script_source").args(["script", "script_url", "bundled"])))]
struct RunArgs {
    #[arg(long, help = "Screen graph describing the app under test (JSON or YAML)")]
    app: PathBuf,
    #[arg(long, help = "Action script file")]
    script: Option<PathBuf>,
    #[arg(long, help = "Fetch the action script from this URL")]
    script_url: Option<String>,
    #[arg(long, help = "Bundled script name, resolved under bundled_script_dir")]
    bundled: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_RUN_MINUTES, help = "Run length in minutes")]
    max_minutes: u32,
    #[arg(long, requires = "script_source", help = "Skip heuristic exploration")]
    run_only_script: bool,
    #[arg(long = "method", help = "Capture only these HTTP methods (repeatable)")]
    methods: Vec<HttpMethod>,
    #[arg(long = "path", help = "Capture only paths containing this (repeatable)")]
    paths: Vec<String>,
    #[arg(
        long = "always-path",
        help = "Always capture paths containing this (repeatable)"
    )]
    always_paths: Vec<String>,
    #[arg(long, help = "Report root directory (overrides config)")]
    reports: Option<PathBuf>,
    #[arg(long, help = "Crawler config file (JSON or YAML)")]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, short = 'v', help = "Show progress and info logs on stderr")]
    verbose: bool,
    #[arg(long, help = "Emit logs as JSON lines")]
    log_json: bool,
}

/// Configure color output based on CLI flag and environment
fn configure_colors(mode: ColorMode) {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
}

/// Install the stderr log subscriber. `RUST_LOG` wins over the verbosity flag.
fn init_tracing(verbose: bool, log_json: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    let installed = if log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.ok();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_colors(cli.color);
    match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::CheckScript { path, json } => cmd_check_script(&path, json),
        Commands::ShowReport { dir, json, verify } => cmd_show_report(&dir, json, verify),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Handle the run command.
fn cmd_run(args: RunArgs) -> Result<()> {
    init_tracing(args.verbose, args.log_json);
    let json = args.json;

    let mut config = match &args.config {
        Some(path) => match load_config_file(path) {
            Ok(config) => config,
            Err(err) => return emit_error(json, &err),
        },
        None => CrawlerConfig::default(),
    };
    if let Some(root) = args.reports.clone() {
        config.report_root = root;
    }
    let graph = match ScreenGraph::load(&args.app) {
        Ok(graph) => graph,
        Err(err) => return emit_error(json, &err),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let interceptor = NetworkInterceptor::new();
    let launcher =
        SimulatedLauncher::new(graph, Arc::clone(&clock)).with_interceptor(interceptor.clone());
    let mut builder = RoboCrawler::builder(launcher)
        .config(config)
        .clock(clock)
        .interceptor(interceptor);
    if args.verbose && !json {
        builder = builder
            .progress(Arc::new(progress::VerboseProgress::new()) as Arc<dyn ProgressCallback>);
    }
    let crawler = match builder.build() {
        Ok(crawler) => crawler,
        Err(err) => return emit_error(json, &err),
    };

    let interrupt = crawler.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        interrupt.cancel();
    }) {
        tracing::warn!(error = %err, "failed to install interrupt handler");
    }

    let settings = run_settings(args);
    emit_result(json, crawler.start(settings))
}

fn run_settings(args: RunArgs) -> TestSettings {
    let source = if let Some(path) = args.script {
        Some(ScriptSource::Path { path })
    } else if let Some(url) = args.script_url {
        Some(ScriptSource::Remote { url })
    } else {
        args.bundled.map(|name| ScriptSource::Bundled { name })
    };
    let filter = if args.methods.is_empty() && args.paths.is_empty() && args.always_paths.is_empty()
    {
        None
    } else {
        Some(RequestMethodFilter {
            methods: args.methods.into_iter().collect(),
            paths: args.paths,
            always_paths: args.always_paths,
        })
    };
    TestSettings {
        script: source,
        max_run_minutes: args.max_minutes,
        run_only_script: args.run_only_script,
        request_filter: filter,
    }
}

/// Handle the check-script command.
fn cmd_check_script(path: &std::path::Path, json: bool) -> Result<()> {
    let script = match load_script_file(path).and_then(|script| {
        validate_script(&script)?;
        Ok(script)
    }) {
        Ok(script) => script,
        Err(err) => return emit_error(json, &err),
    };
    if json {
        let payload = serde_json::json!({
            "valid": true,
            "name": script.metadata.name,
            "script_version": script.script_version,
            "steps": script.steps.len(),
        });
        println!("{payload}");
    } else {
        println!(
            "script '{}' is valid ({} steps)",
            script.metadata.name,
            script.steps.len()
        );
        for (index, step) in script.steps.iter().enumerate() {
            println!("  {}. {}", index + 1, step.display_name(index));
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ShowReportOutput<'a> {
    report: &'a TestOutputDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksums: Option<&'a ChecksumReport>,
}

/// Handle the show-report command.
fn cmd_show_report(dir: &std::path::Path, json: bool, verify: bool) -> Result<()> {
    let report = match read_report(dir) {
        Ok(report) => report,
        Err(err) => return emit_error(json, &err),
    };
    let checksums = if verify {
        match verify_checksums(dir) {
            Ok(checksums) => Some(checksums),
            Err(err) => return emit_error(json, &err),
        }
    } else {
        None
    };

    if json {
        let payload = serde_json::to_string(&ShowReportOutput {
            report: &report,
            checksums: checksums.as_ref(),
        })
        .into_diagnostic()?;
        println!("{payload}");
    } else {
        print_report(&report);
        if let Some(checksums) = &checksums {
            if checksums.is_ok() {
                println!("checksums: ok ({} verified)", checksums.verified);
            } else {
                println!("checksums: {} mismatched", checksums.mismatches.len());
                for mismatch in &checksums.mismatches {
                    println!(" - {}", mismatch.file);
                }
            }
        }
    }
    if checksums.is_some_and(|c| !c.is_ok()) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &TestOutputDetails) {
    let summary = &report.summary;
    println!(
        "run {}: {} ({}) in {}ms{}",
        report.run_id,
        wire_name(&report.status),
        wire_name(&report.end_reason),
        report.duration_ms,
        if report.truncated { ", truncated" } else { "" }
    );
    println!(
        "  script steps: {}/{}, explorer actions: {}, crashes: {}, screens: {}",
        summary.script_steps_executed,
        summary.script_steps_total,
        summary.explorer_actions,
        summary.crashes,
        summary.screens_visited
    );
    println!(
        "  requests: {} captured of {} observed ({} filtered)",
        summary.requests_captured, summary.requests_observed, summary.requests_filtered
    );
    if let Some(error) = &report.error {
        println!("  error: {}: {}", error.code, error.message);
    }
}

/// Handle the completions command.
#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

fn emit_result(json: bool, result: CrawlerResult<Arc<TestOutputDetails>>) -> Result<()> {
    let details = match result {
        Ok(details) => details,
        Err(err) => return emit_error(json, &err),
    };
    if json {
        let payload = serde_json::to_string(&*details).into_diagnostic()?;
        println!("{payload}");
    } else {
        print_report(&details);
        if let Some(report) = &details.report {
            eprintln!("report written to: {}", report.dir.display());
        }
    }
    match exit_code_for_result(&details) {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

fn exit_code_for_result(details: &TestOutputDetails) -> i32 {
    if details.end_reason == EndReason::Cancelled {
        return ErrorCode::Cancelled.exit_code();
    }
    match details.status {
        RunStatus::Passed => 0,
        RunStatus::Failed => 1,
        RunStatus::Errored => details
            .error
            .as_ref()
            .and_then(|err| ErrorCode::parse(&err.code))
            .map_or(1, ErrorCode::exit_code),
    }
}

fn emit_error(json: bool, err: &CrawlerError) -> Result<()> {
    if json {
        let payload = serde_json::to_string(&err.to_error_info()).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!("error: {err}");
    }
    std::process::exit(err.exit_code());
}

/// Snake-case name a value serializes to.
fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}
