use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use refplat_builder::lifecycle::signals;
use refplat_builder::{pipeline, LifecycleGuard, RunConfig};

/// Extract Cisco refplat images and build vrnetlab containers from them.
#[derive(Debug, Parser)]
#[command(name = "refplat-builder", version)]
struct Cli {
    /// Directory holding refplat .zip and .iso files [default: refplats]
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Where staged images are written [default: refplat-images]
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// vrnetlab checkout, cloned if missing [default: vrnetlab]
    #[arg(long, value_name = "DIR")]
    vrnetlab_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of platform builds run at once
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: Option<u16>,

    /// Do not `git pull` an existing vrnetlab checkout
    #[arg(long)]
    no_update: bool,

    /// Write the run report as JSON to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Debug logging with timestamps, plus captured build output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let guard = LifecycleGuard::new();
    match run(cli, &guard) {
        Ok(()) => {
            signals::exit_if_signalled(&guard);
            ExitCode::SUCCESS
        }
        Err(err) => {
            signals::exit_if_signalled(&guard);
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if verbose {
        builder.init();
    } else {
        builder.without_time().with_target(false).init();
    }
}

fn run(cli: Cli, guard: &LifecycleGuard) -> Result<()> {
    let config = load_config(&cli)?;

    // Must run before any other thread exists so the signal mask is inherited.
    if let Err(err) = signals::install(guard.clone(), config.build.grace_period) {
        warn!("signal handling unavailable: {err}");
    }

    let report = pipeline::run(&config, guard)?;
    print!("{}", report.summary());

    if let Some(path) = &cli.report {
        report
            .write_json(path)
            .with_context(|| format!("writing report to '{}'", path.display()))?;
    }
    if report.has_failures() {
        warn!("run completed with recorded failures");
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = RunConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.source_dir {
        config.source_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(dir) = &cli.vrnetlab_dir {
        config.checkout.dir = dir.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.build.jobs = usize::from(jobs);
    }
    if cli.no_update {
        config.checkout.update = false;
    }
    Ok(config)
}
