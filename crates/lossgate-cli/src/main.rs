//! Lossgate - training regression harness CLI
//!
//! The `lossgate` command launches a training job, streams its log, and
//! fails as soon as `lm_loss` breaks a threshold or the job exits badly.
//!
//! ## Commands
//!
//! - `run`: run a built-in scenario or the scenarios of a suite file
//! - `check-line`: parse one log line and show the recovered fields
//! - `presets`: list built-in scenarios and their rules

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn, Level};

use lossgate_core::{
    init_tracing, parse_line, EchoMode, HarnessDefaults, LaunchSpec, ScenarioConfig,
    ScenarioRunner, SuiteConfig, SuiteOutcome,
};

#[derive(Parser)]
#[command(name = "lossgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a training job and gate it on reported lm_loss", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and print outcomes as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in scenario, or the scenarios of a suite file
    Run(RunArgs),

    /// Parse one log line and print the iteration/loss it reports
    CheckLine {
        /// The raw log line
        line: String,
    },

    /// List built-in scenarios
    Presets,
}

#[derive(Args)]
struct RunArgs {
    /// Built-in scenario name (see `lossgate presets`)
    #[arg(required_unless_present = "config", conflicts_with = "config")]
    preset: Option<String>,

    /// Suite file (TOML) with `[[scenarios]]`
    #[arg(short, long, env = "LOSSGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Run only this scenario from the suite file
    #[arg(short, long, requires = "config")]
    scenario: Option<String>,

    /// Override torchrun --nproc_per_node for training launches
    #[arg(long)]
    nproc_per_node: Option<u32>,

    /// Override torchrun --rdzv_endpoint for training launches
    #[arg(long)]
    rdzv_endpoint: Option<String>,

    /// Fail a scenario that runs longer than this many seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    deadline_secs: Option<u64>,

    /// Transcript file; a directory of `<scenario>.log` files when several run
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Do not echo job output
    #[arg(short, long)]
    quiet: bool,
}

impl RunArgs {
    /// Scenarios to run, with suite defaults and command-line overrides applied.
    fn scenarios(&self) -> Result<Vec<ScenarioConfig>> {
        let suite = match (&self.preset, &self.config) {
            (Some(name), None) => {
                let scenario = ScenarioConfig::preset(name)
                    .with_context(|| format!("unknown preset {name:?}; see `lossgate presets`"))?;
                SuiteConfig {
                    harness: HarnessDefaults::default(),
                    scenarios: vec![scenario],
                }
            }
            (None, Some(path)) => {
                let suite = SuiteConfig::load(path)
                    .with_context(|| format!("Failed to load suite {}", path.display()))?;
                match &self.scenario {
                    Some(name) => suite.select(name)?,
                    None => suite,
                }
            }
            _ => anyhow::bail!("pass either a preset name or --config"),
        };

        let mut scenarios = suite.resolved();
        let several = scenarios.len() > 1;
        for scenario in &mut scenarios {
            self.apply(scenario, several);
        }
        Ok(scenarios)
    }

    fn apply(&self, scenario: &mut ScenarioConfig, several: bool) {
        if let LaunchSpec::Training(launch) = &mut scenario.launch {
            if let Some(nproc) = self.nproc_per_node {
                launch.nproc_per_node = nproc;
            }
            if let Some(endpoint) = &self.rdzv_endpoint {
                launch.rdzv_endpoint = endpoint.clone();
            }
        }
        if let Some(secs) = self.deadline_secs {
            scenario.deadline_secs = Some(secs);
        }
        if let Some(path) = &self.transcript {
            scenario.transcript = Some(if several {
                path.join(format!("{}.log", scenario.name))
            } else {
                path.clone()
            });
        }
        if self.quiet {
            scenario.echo = Some(EchoMode::Silent);
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(&args, cli.json).await,
        Commands::CheckLine { line } => cmd_check_line(&line, cli.json),
        Commands::Presets => cmd_presets(cli.json),
    }
}

/// Run scenarios; the exit status reflects the verdict.
async fn cmd_run(args: &RunArgs, json: bool) -> Result<ExitCode> {
    let suite = SuiteConfig {
        harness: HarnessDefaults::default(),
        scenarios: args.scenarios()?,
    };
    let several = suite.scenarios.len() > 1;
    info!(scenarios = suite.scenarios.len(), "starting run");

    let runner = ScenarioRunner::default();
    // Interrupting drops the run future, which kills the job's process group.
    let finished = tokio::select! {
        outcome = runner.run_suite(&suite) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(outcome) = finished else {
        warn!("interrupted; job torn down");
        return Ok(ExitCode::from(130));
    };

    print_outcome(&outcome, several, json)?;
    Ok(if outcome.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_outcome(outcome: &SuiteOutcome, several: bool, json: bool) -> Result<()> {
    if json {
        if several {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        } else if let Some(scenario) = outcome.scenarios.first() {
            println!("{}", serde_json::to_string_pretty(scenario)?);
        }
        return Ok(());
    }

    for scenario in &outcome.scenarios {
        if several {
            println!("[{}] {}", scenario.scenario, scenario.status_line());
        } else {
            println!("{}", scenario.status_line());
        }
        if let Some(failure) = &scenario.failure {
            eprintln!("  {}", failure.message);
        }
    }
    if several {
        println!(
            "{} passed, {} failed",
            outcome.passed_count(),
            outcome.failed_count()
        );
    }
    Ok(())
}

fn cmd_check_line(line: &str, json: bool) -> Result<ExitCode> {
    match parse_line(line) {
        Ok(fields) => {
            if json {
                println!("{}", serde_json::to_string(&fields)?);
            } else if fields.is_empty() {
                println!("no metric fields");
            } else {
                println!(
                    "iteration: {}",
                    fields.iteration.map_or("-".to_string(), |i| i.to_string())
                );
                println!(
                    "lm_loss:   {}",
                    fields.loss.map_or("-".to_string(), |l| l.to_string())
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if json {
                println!("{}", json!({ "error": e.to_string(), "line": e.line() }));
            } else {
                println!("parse error: {e}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_presets(json: bool) -> Result<ExitCode> {
    let presets = ScenarioConfig::presets();
    if json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(ExitCode::SUCCESS);
    }

    for preset in &presets {
        println!("{}", preset.name);
        if let Some(description) = &preset.description {
            println!("  {description}");
        }
        println!("  command: {}", preset.launch.to_command().display());
        if preset.rules.is_empty() {
            println!("  rules:   exit code {} only", preset.expected_exit_code);
        }
        for rule in &preset.rules {
            println!("  rule:    {rule}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
