//! Output Formatting
//!
//! JMH-style result table: one row per (benchmark, combination, fork),
//! one `(name)` column per parameter, failures listed under the table.

use forkbench_report::{EntryStatus, Report, ReportEntry};

/// Format a report for human-readable terminal display
pub fn format_human_output(report: &Report) -> String {
    let mut output = String::new();

    let param_names = param_columns(&report.results);
    let with_alloc = report.results.iter().any(|r| r.alloc.is_some());

    let mut header: Vec<String> = vec!["Benchmark".to_string()];
    header.extend(param_names.iter().map(|n| format!("({n})")));
    header.extend(
        ["Mode", "Threads", "Fork", "Cnt", "Score", "Units"]
            .iter()
            .map(|s| s.to_string()),
    );
    if with_alloc {
        header.push("B/op".to_string());
        header.push("allocs/op".to_string());
    }

    let rows: Vec<Vec<String>> = report
        .results
        .iter()
        .map(|entry| {
            let mut row = vec![entry.benchmark.clone()];
            row.extend(
                param_names
                    .iter()
                    .map(|n| entry.param(n).unwrap_or("N/A").to_string()),
            );
            let (cnt, score) = match entry.status {
                EntryStatus::Success => (
                    entry.cnt.to_string(),
                    entry.score.map(format_score).unwrap_or_default(),
                ),
                EntryStatus::Failed => (String::new(), "FAILED".to_string()),
                EntryStatus::Skipped => (String::new(), "SKIPPED".to_string()),
            };
            row.push(entry.mode.short_label().to_string());
            row.push(entry.threads.to_string());
            row.push(entry.fork.to_string());
            row.push(cnt);
            row.push(score);
            row.push(entry.score_unit.clone());
            if with_alloc {
                match entry.alloc {
                    Some(alloc) => {
                        row.push(format!("{:.1}", alloc.bytes_per_op));
                        row.push(format!("{:.3}", alloc.allocs_per_op));
                    }
                    None => {
                        row.push(String::new());
                        row.push(String::new());
                    }
                }
            }
            row
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|col| {
            rows.iter()
                .map(|r| r[col].chars().count())
                .chain(std::iter::once(header[col].chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    output.push('\n');
    push_row(&mut output, &header, &widths);
    for row in &rows {
        push_row(&mut output, row, &widths);
    }

    let failures: Vec<&ReportEntry> = report
        .results
        .iter()
        .filter(|r| r.status == EntryStatus::Failed)
        .collect();
    if !failures.is_empty() {
        output.push_str("\nFailures\n");
        output.push_str(&"-".repeat(60));
        output.push('\n');
        for entry in failures {
            if let Some(error) = &entry.error {
                let phase = error
                    .phase
                    .as_deref()
                    .map(|p| format!(" during {p}"))
                    .unwrap_or_default();
                output.push_str(&format!("  ✗ [{}{}] {}\n", error.kind, phase, error.message));
            }
        }
    }

    output.push_str("\nSummary\n");
    output.push_str(&"-".repeat(60));
    output.push('\n');
    output.push_str(&format!(
        "  Total: {}  Succeeded: {}  Failed: {}  Skipped: {}\n",
        report.summary.total, report.summary.succeeded, report.summary.failed, report.summary.skipped
    ));
    output.push_str(&format!(
        "  Duration: {:.2} ms\n",
        report.summary.total_duration_ms
    ));

    output
}

/// Parameter names across all entries, in first-seen order
fn param_columns(entries: &[ReportEntry]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in entries {
        for p in &entry.params {
            if !names.contains(&p.name) {
                names.push(p.name.clone());
            }
        }
    }
    names
}

/// Benchmark name left-aligned, everything else right-aligned
fn push_row(output: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i == 0 {
            line.push_str(&format!("{:<width$}", cell, width = width));
        } else {
            line.push_str(&format!("  {:>width$}", cell, width = width));
        }
    }
    output.push_str(line.trim_end());
    output.push('\n');
}

fn format_score(value: f64) -> String {
    if value != 0.0 && value.abs() < 0.001 {
        format!("{:.3e}", value)
    } else {
        format!("{:.3}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbench_report::{ParamEntry, ReportMeta, SCHEMA_VERSION, SystemInfo};
    use forkbench_stats::{Mode, ResultAggregator, Sample, TimeUnit};

    fn report(entries: Vec<ReportEntry>) -> Report {
        Report::new(
            ReportMeta {
                schema_version: SCHEMA_VERSION,
                version: "test".to_string(),
                timestamp: chrono::Utc::now(),
                system: SystemInfo::default(),
                config: Default::default(),
            },
            entries,
            42.0,
        )
    }

    fn entry(block: &str, fork: u32) -> ReportEntry {
        ReportEntry::new(
            "codec::compress",
            "codec",
            Mode::AverageTime,
            TimeUnit::Milliseconds,
            1,
            vec![ParamEntry {
                name: "block.size".to_string(),
                value: block.to_string(),
            }],
            fork,
        )
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(0.01), "0.010");
        assert_eq!(format_score(100_000.0), "100000.000");
        assert_eq!(format_score(0.0000123), "1.230e-5");
    }

    #[test]
    fn test_table_has_param_columns_and_failures() {
        let aggregator: ResultAggregator =
            std::iter::repeat_n(Sample::new(10_000_000, 1000), 5).collect();
        let result = aggregator
            .finalize(Mode::AverageTime, TimeUnit::Milliseconds)
            .unwrap();

        let output = format_human_output(&report(vec![
            entry("65536", 1).succeeded(&result, 1000),
            entry("131072", 1).failed("measurement", Some("measurement".to_string()), "boom"),
        ]));

        let lines: Vec<&str> = output.lines().filter(|l| !l.is_empty()).collect();
        assert!(lines[0].starts_with("Benchmark"));
        assert!(lines[0].contains("(block.size)"));
        assert!(lines[0].ends_with("Units"));
        assert!(lines[1].contains("65536"));
        assert!(lines[1].contains("0.010"));
        assert!(lines[1].ends_with("ms/op"));
        assert!(lines[2].contains("FAILED"));
        assert!(output.contains("[measurement during measurement] boom"));
        assert!(output.contains("Total: 2  Succeeded: 1  Failed: 1  Skipped: 0"));
    }
}
