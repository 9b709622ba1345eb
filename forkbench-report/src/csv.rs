//! CSV Output
//!
//! One row per (benchmark, combination, fork), JMH column order.

use crate::report::{EntryStatus, Report};

const HEADER: &str = "Benchmark,Mode,Threads,Params,Fork,Status,Cnt,Score,Unit,Error";

/// Generate a CSV report with a header row.
pub fn generate_csv_report(report: &Report) -> String {
    let mut out = String::with_capacity(64 * (report.results.len() + 1));
    out.push_str(HEADER);
    out.push('\n');

    for entry in &report.results {
        let status = match entry.status {
            EntryStatus::Success => "success",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        };
        let score = entry
            .score
            .map(|s| format!("{s:.6}"))
            .unwrap_or_default();
        let error = entry
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("");

        let row = [
            escape(&entry.benchmark),
            entry.mode.short_label().to_string(),
            entry.threads.to_string(),
            escape(&entry.params_label()),
            entry.fork.to_string(),
            status.to_string(),
            entry.cnt.to_string(),
            score,
            escape(&entry.score_unit),
            escape(error),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Quote a field when it contains a separator, quote or newline
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
