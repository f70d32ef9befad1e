//! jobline CLI entry point.
//!
//! Initializes logging, loads configuration and races the chosen command
//! against the shutdown signal.

mod cli;
mod ui;

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use jobline::config::JoblineConfig;
use jobline::context::PipelineContext;
use jobline::engine::StageEngine;
use jobline::topology::Instance;
use jobline::transform::TransformRegistry;
use jobline::{record, shutdown};

use cli::{Cli, Command};
use ui::DrainProgress;

const EXIT_FAILURE: u8 = 1;
const EXIT_MISCONFIGURED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

const LOG_FILE: &str = "pipeline.log";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match JoblineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&cli, None);
            return fail(EXIT_MISCONFIGURED, &anyhow::Error::new(e));
        }
    };
    init_tracing(&cli, Some(&config.log_dir()));

    let cancel = match shutdown::install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            let e = anyhow::Error::new(e).context("cannot install signal handlers");
            return fail(EXIT_FAILURE, &e);
        }
    };

    let ctx = match PipelineContext::from_config(&config, cancel.clone()) {
        Ok(ctx) => ctx,
        Err(e) => return fail(EXIT_MISCONFIGURED, &e),
    };
    let transforms = TransformRegistry::from_config(&config);

    let outcome = tokio::select! {
        result = run_command(cli.command, &ctx, &transforms) => Some(result),
        _ = cancel.cancelled() => None,
    };

    match outcome {
        Some(Ok(())) => ExitCode::SUCCESS,
        Some(Err(e)) => fail(EXIT_FAILURE, &e),
        None => {
            // The dropped command future has released its own leases already.
            match ctx.leases.store().release_own_stale() {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "cleaned up leftover leases"),
                Err(e) => warn!(error = %e, "lease cleanup failed"),
            }
            warn!("interrupted by signal");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

/// Logs to stderr and, when `log_dir` is given, appends to
/// `<log_dir>/pipeline.log` as well.
fn init_tracing(cli: &Cli, log_dir: Option<&Path>) {
    // Priority: RUST_LOG env var > --verbose > --log-level
    let fallback = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone()
    };

    let (file, file_error) = match log_dir.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = file.map(|file| fmt::layer().with_writer(Arc::new(file)).with_ansi(false));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback)))
        .init();

    if let Some(e) = file_error {
        warn!("file logging disabled: {e:#}");
    }
}

fn open_log_file(log_dir: &Path) -> Result<File> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create {}", log_dir.display()))?;
    let path = log_dir.join(LOG_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot open {}", path.display()))
}

fn fail(code: u8, err: &anyhow::Error) -> ExitCode {
    error!("{err:#}");
    eprintln!("{} {err:#}", Style::new().red().bold().apply_to("error:"));
    ExitCode::from(code)
}

async fn run_command(
    command: Command,
    ctx: &PipelineContext,
    transforms: &TransformRegistry,
) -> Result<()> {
    match command {
        Command::Setup => {
            ctx.topology
                .setup()
                .with_context(|| format!("cannot create {}", ctx.topology.root().display()))?;
            println!("pipeline ready under {}", ctx.topology.root().display());
        }
        Command::Submit {
            priority,
            headers,
            file,
        } => {
            let body = read_body(file.as_deref()).await?;
            let instance = if priority {
                Instance::Priority
            } else {
                Instance::Normal
            };
            let handle = ctx.submit(instance, headers.into_iter().collect(), body)?;
            println!("{}", handle.id);
        }
        Command::Run {
            stage,
            instance,
            watch,
            poll_secs,
        } => {
            if ctx.topology.stage(&stage).is_none() {
                anyhow::bail!("unknown stage {stage:?}");
            }
            let engine = StageEngine::new(ctx, transforms).with_instances(instance.instances());
            run_stages(ctx, &engine, &[stage], watch, poll_secs).await?;
        }
        Command::RunAll {
            instance,
            watch,
            poll_secs,
        } => {
            let stages: Vec<String> = ctx
                .topology
                .stages()
                .iter()
                .map(|s| s.name.clone())
                .collect();
            let engine = StageEngine::new(ctx, transforms).with_instances(instance.instances());
            run_stages(ctx, &engine, &stages, watch, poll_secs).await?;
        }
        Command::Status => ui::print_status(&ctx.status()?),
        Command::Recover { stage } => {
            let restored = ctx.recover(&stage)?;
            if restored.is_empty() {
                println!("no in-progress claims for {stage}");
            }
            for path in restored {
                println!("restored {}", path.display());
            }
        }
    }
    Ok(())
}

/// Drains `stages` in order; with `watch`, repeats until the stop sentinel
/// appears or the process is signalled.
async fn run_stages(
    ctx: &PipelineContext,
    engine: &StageEngine<'_>,
    stages: &[String],
    watch: bool,
    poll_secs: u64,
) -> Result<()> {
    loop {
        let mut busy = false;
        for stage in stages {
            if ctx.stop_requested() {
                info!(stop_file = %ctx.stop_file.display(), "stop sentinel present, exiting");
                return Ok(());
            }
            let progress = DrainProgress::start(stage);
            let report = engine
                .drain_with(stage, |report| progress.update(report))
                .await
                .with_context(|| format!("stage {stage} failed"))?;

            let quiet = report.processed() == 0 && report.deferred == 0 && report.corrupt.is_empty();
            if watch && quiet {
                progress.clear();
            } else {
                progress.finish(&report);
            }
            if report.stopped {
                return Ok(());
            }
            busy |= report.processed() > 0;
        }

        if !watch {
            return Ok(());
        }
        if !busy {
            tokio::time::sleep(Duration::from_secs(poll_secs)).await;
        }
    }
}

/// Reads a record body from `path`, or from stdin for `None` and `-`.
async fn read_body(path: Option<&Path>) -> Result<String> {
    let bytes = match path {
        Some(path) if path != Path::new("-") => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
        _ => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("cannot read stdin")?;
            buf
        }
    };
    Ok(record::decode(bytes))
}
