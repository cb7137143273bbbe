use anyhow::{Context, Result};
use clap::Parser;
use latencywatch::cli::{Cli, OutputFormat};
use latencywatch::config::TracerConfig;
use latencywatch::global;
use latencywatch::report::Report;
use latencywatch::workload::{self, WorkloadParams};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Build the tracer configuration from the config file and CLI overrides
fn load_config(args: &Cli) -> Result<TracerConfig> {
    let mut config = match &args.config {
        Some(path) => TracerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TracerConfig::default(),
    };
    if let Some(threshold) = args.min_latency_us {
        config.min_latency_us = Some(threshold);
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    if args.threads == 0 {
        anyhow::bail!("Invalid value for --threads: 0 (must be >= 1)");
    }

    init_tracing(args.debug);

    let config = load_config(&args)?;
    let tracer = global::install(config)?;

    tracer.enable();
    workload::run(
        args.workload,
        WorkloadParams {
            size: args.size,
            threads: args.threads,
            unit: Duration::from_millis(args.unit_ms),
        },
    );
    tracer.disable();

    let mut report = Report::from_snapshot(&tracer.snapshot(), args.sort);
    if let Some(top) = args.top {
        report.truncate(top);
    }

    match args.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Csv => print!("{}", report.to_csv()),
    }

    for fault in tracer.drain_faults() {
        tracing::debug!(?fault, "logged consistency fault");
    }

    Ok(())
}
