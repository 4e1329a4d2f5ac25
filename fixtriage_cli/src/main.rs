use fixtriage_core::config::TriageConfig;
use fixtriage_core::corpus::{CorpusWalker, ErrorPolicy};
use fixtriage_core::executor::CommandExecutor;
use fixtriage_core::minimizer::Minimizer;
use fixtriage_core::oracle::CrashOracle;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Root-causes crashes of injection-instrumented fuzz targets", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Log at debug level.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Minimize every crash testcase to the injection points it needs.
    Crashes {
        #[clap(long)]
        crashes_dir: PathBuf,
        #[clap(long, value_enum)]
        on_error: Option<OnError>,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Collect the injection points reached and triggered by a corpus.
    Coverage {
        #[clap(long)]
        units_dir: PathBuf,
        #[clap(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Instrumented fuzz target, overriding the config file.
    #[clap(long)]
    binary: Option<PathBuf>,
    #[clap(long)]
    unit_timeout_secs: Option<u64>,
    #[clap(long)]
    rss_limit_mb: Option<u64>,
    /// Write the JSON report here instead of stdout.
    #[clap(short, long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OnError {
    Abort,
    Skip,
}

impl From<OnError> for ErrorPolicy {
    fn from(value: OnError) -> Self {
        match value {
            OnError::Abort => ErrorPolicy::Abort,
            OnError::Skip => ErrorPolicy::Skip,
        }
    }
}

fn load_config(config_file: Option<PathBuf>) -> Result<TriageConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            TriageConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                TriageConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and default 'config.toml' not found, using built-in defaults.");
                Ok(TriageConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut TriageConfig, common: &CommonArgs) {
    if let Some(binary) = &common.binary {
        if let Some(previous) = &config.target.binary {
            warn!("--binary overrides configured target {previous:?}");
        }
        config.target.binary = Some(binary.clone());
    }
    if let Some(secs) = common.unit_timeout_secs {
        config.target.unit_timeout_secs = secs;
    }
    if let Some(mb) = common.rss_limit_mb {
        config.target.rss_limit_mb = mb;
    }
}

/// JSON report: the target binary plus the run's own fields.
#[derive(Serialize)]
struct Report<'a, T: Serialize> {
    binary: &'a Path,
    #[serde(flatten)]
    run: &'a T,
}

fn write_report<T: Serialize>(
    binary: &Path,
    run: &T,
    output: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let rendered = serde_json::to_string_pretty(&Report { binary, run })?;
    match output {
        Some(path) => {
            std::fs::write(path, rendered + "\n")
                .map_err(|e| anyhow::anyhow!("Failed to write report to {:?}: {}", path, e))?;
            info!("Report written to {path:?}");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{rendered}")?;
        }
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(cli.config_file)?;
    let start_time = Instant::now();

    match cli.command {
        Command::Crashes {
            crashes_dir,
            on_error,
            common,
        } => {
            apply_overrides(&mut config, &common);
            if let Some(policy) = on_error {
                config.triage.on_error = policy.into();
            }
            info!("Effective configuration: {config:?}");

            let executor = CommandExecutor::new(config.executor_config()?);
            let oracle = CrashOracle::with_classifier(config.stack_parser());
            let mut minimizer = Minimizer::new(executor, oracle);

            let walker = CorpusWalker::new(crashes_dir)
                .with_skip_prefixes(config.triage.skip_prefixes.clone())
                .with_error_policy(config.triage.on_error);
            let report = walker.run_crashes(&mut minimizer)?;

            info!(
                "Crashes run finished in {:.2?}: {} unique crashes from {} testcases",
                start_time.elapsed(),
                report.crashes.len(),
                report.stats.testcases
            );
            write_report(
                &minimizer.executor().config().binary,
                &report,
                common.output.as_deref(),
            )?;
        }
        Command::Coverage { units_dir, common } => {
            apply_overrides(&mut config, &common);
            info!("Effective configuration: {config:?}");

            let mut executor = CommandExecutor::new(config.executor_config()?);
            let walker =
                CorpusWalker::new(units_dir).with_error_policy(config.triage.on_error);
            let report = walker.run_coverage(&mut executor)?;

            info!(
                "Coverage run finished in {:.2?}: {} units",
                start_time.elapsed(),
                report.stats.testcases
            );
            write_report(&executor.config().binary, &report, common.output.as_deref())?;
        }
    }

    Ok(())
}
