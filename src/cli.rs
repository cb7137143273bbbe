//! CLI argument parsing for latencywatch

use crate::report::SortKey;
use crate::workload::Workload;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the timing report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Text,
    /// JSON format for machine parsing
    Json,
    /// CSV format for spreadsheet analysis
    Csv,
}

#[derive(Parser, Debug)]
#[command(name = "latencywatch")]
#[command(version)]
#[command(about = "Call-stack latency tracer: per-function call counts, total, self and max time", long_about = None)]
pub struct Cli {
    /// Built-in workload to trace
    #[arg(value_enum, default_value = "fib")]
    pub workload: Workload,

    /// Workload size (fib argument, or calls per thread)
    #[arg(short = 'n', long = "size", value_name = "N", default_value = "15")]
    pub size: u64,

    /// Threads for the `threads` workload
    #[arg(short = 't', long = "threads", value_name = "COUNT", default_value = "4")]
    pub threads: usize,

    /// Sleep unit in milliseconds for the `nested` workload
    #[arg(long = "unit-ms", value_name = "MS", default_value = "5")]
    pub unit_ms: u64,

    /// Report format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Column to sort the report by
    #[arg(long = "sort", value_enum, default_value = "total")]
    pub sort: SortKey,

    /// Only show the N most expensive functions
    #[arg(long = "top", value_name = "N")]
    pub top: Option<usize>,

    /// Only aggregate calls at least this slow (overrides the config file)
    #[arg(long = "min-latency-us", value_name = "US")]
    pub min_latency_us: Option<u64>,

    /// Tracer configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
