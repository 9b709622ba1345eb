#![warn(missing_docs)]
//! forkbench Report - Result Output
//!
//! Report model shared by the runner and its writers:
//! - JSON (machine-readable, round-trips through serde)
//! - CSV (spreadsheet-compatible)
//! - Human-readable tables are rendered by the CLI

mod csv;
mod json;
#[allow(missing_docs)]
mod report;

pub use csv::generate_csv_report;
pub use json::{generate_json_report, parse_json_report};
pub use report::{
    AllocationMetrics, EntryStatus, FailureInfo, ParamEntry, Report, ReportConfig, ReportEntry,
    ReportMeta, ReportSummary, SCHEMA_VERSION, SystemInfo,
};

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable terminal table
    Human,
    /// JSON with full schema
    Json,
    /// CSV for spreadsheets
    Csv,
}

impl OutputFormat {
    /// Every supported format
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Human, OutputFormat::Json, OutputFormat::Csv];

    /// Name accepted by `--format`
    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Human => "human",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "human" | "text" => Ok(OutputFormat::Human),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}
