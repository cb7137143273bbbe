//! Rendering of tracer snapshots
//!
//! Turns a [`Snapshot`] into rows sorted by cost and renders them as a text
//! table, JSON or CSV. Runs on the reporter's side, never on the hot path.

use crate::fault::FaultCounts;
use crate::hook::Snapshot;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Column a report is sorted by (descending)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SortKey {
    /// Cumulative time including callees
    #[default]
    Total,
    /// Cumulative time excluding callees
    #[value(name = "self")]
    SelfTime,
    /// Number of calls
    Calls,
    /// Slowest single call
    Max,
    /// Mean time per call
    Avg,
}

/// One function's line in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSummary {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub calls: u64,
    pub total_ns: u64,
    pub self_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

/// Sorted, rendering-ready view of a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub functions: Vec<FunctionSummary>,
    pub faults: FaultCounts,
    pub filtered_calls: u64,
}

fn nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

impl Report {
    pub fn from_snapshot(snapshot: &Snapshot, sort: SortKey) -> Self {
        let mut functions: Vec<FunctionSummary> = snapshot
            .records
            .iter()
            .map(|(function, record)| FunctionSummary {
                function: function.name().to_string(),
                file: function.file().to_string(),
                line: function.line(),
                calls: record.calls,
                total_ns: nanos(record.total_time),
                self_ns: nanos(record.self_time),
                max_ns: nanos(record.max_time),
                avg_ns: nanos(record.avg_time()),
            })
            .collect();

        let key = |row: &FunctionSummary| match sort {
            SortKey::Total => row.total_ns,
            SortKey::SelfTime => row.self_ns,
            SortKey::Calls => row.calls,
            SortKey::Max => row.max_ns,
            SortKey::Avg => row.avg_ns,
        };
        // Ties broken by name so output is deterministic
        functions.sort_by(|a, b| key(b).cmp(&key(a)).then_with(|| a.function.cmp(&b.function)));

        Self {
            functions,
            faults: snapshot.faults,
            filtered_calls: snapshot.filtered_calls,
        }
    }

    /// Keep only the first `n` rows
    pub fn truncate(&mut self, n: usize) {
        self.functions.truncate(n);
    }

    /// Human-readable table
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if self.functions.is_empty() {
            out.push_str("No function timing data collected.\n");
            self.render_footer(&mut out);
            return out;
        }

        let _ = writeln!(
            out,
            "{:<48} {:>8} {:>12} {:>12} {:>12} {:>12}",
            "Function", "Calls", "Total", "Self", "Avg", "Max"
        );
        let _ = writeln!(out, "{}", "─".repeat(109));
        for row in &self.functions {
            let _ = writeln!(
                out,
                "{:<48} {:>8} {:>12} {:>12} {:>12} {:>12}",
                truncate_name(&row.function, 48),
                row.calls,
                format_duration(row.total_ns),
                format_duration(row.self_ns),
                format_duration(row.avg_ns),
                format_duration(row.max_ns),
            );
        }
        let _ = writeln!(out, "{}", "─".repeat(109));
        self.render_footer(&mut out);
        out
    }

    fn render_footer(&self, out: &mut String) {
        if self.faults.total() > 0 {
            let _ = writeln!(
                out,
                "Consistency faults: {} (empty stack: {}, mismatch: {}, negative duration: {})",
                self.faults.total(),
                self.faults.empty_stack,
                self.faults.mismatch,
                self.faults.negative_duration
            );
        }
        if self.filtered_calls > 0 {
            let _ = writeln!(out, "Calls below latency threshold: {}", self.filtered_calls);
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("function,file,line,calls,total_ns,self_ns,avg_ns,max_ns\n");
        for row in &self.functions {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{}",
                escape_field(&row.function),
                escape_field(&row.file),
                row.line,
                row.calls,
                row.total_ns,
                row.self_ns,
                row.avg_ns,
                row.max_ns
            );
        }
        out
    }
}

/// Escape a CSV field (commas, quotes, newlines)
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Keep the tail of long qualified names; the leaf is the useful part
fn truncate_name(name: &str, width: usize) -> String {
    let count = name.chars().count();
    if count <= width {
        return name.to_string();
    }
    let tail: String = name.chars().skip(count - (width - 1)).collect();
    format!("…{}", tail)
}

/// Scale nanoseconds to the largest unit that keeps a leading digit
pub fn format_duration(ns: u64) -> String {
    match ns {
        0..=999 => format!("{}ns", ns),
        1_000..=999_999 => format!("{:.2}µs", ns as f64 / 1e3),
        1_000_000..=999_999_999 => format!("{:.2}ms", ns as f64 / 1e6),
        _ => format!("{:.3}s", ns as f64 / 1e9),
    }
}
