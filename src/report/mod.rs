//! Report output
//!
//! Verdict rows are written once as delimited text; the run summary goes to
//! an optional JSON file and the final counters to an optional Prometheus
//! text file.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::OutputConfig;
use crate::orchestrator::{FaultOutcome, PhaseTiming};
use crate::publisher::PublisherReport;
use crate::stats::StatsSnapshot;
use crate::verdict::{SubjectVerdict, VerdictRow};

pub const CSV_HEADER: &str = "subject,publisher,sequence,received_by,status,note";

/// Report sink errors
#[derive(Debug)]
pub enum ReportError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The report was already written
    AlreadyWritten,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::Io(e) => write!(f, "IO error: {}", e),
            ReportError::Json(e) => write!(f, "JSON error: {}", e),
            ReportError::AlreadyWritten => write!(f, "report already written"),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<std::io::Error> for ReportError {
    fn from(e: std::io::Error) -> Self {
        ReportError::Io(e)
    }
}

impl From<serde_json::Error> for ReportError {
    fn from(e: serde_json::Error) -> Self {
        ReportError::Json(e)
    }
}

/// The ordered verdict rows of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub rows: Vec<VerdictRow>,
}

impl Report {
    pub fn new(rows: Vec<VerdictRow>) -> Self {
        Self { rows }
    }
}

/// A payload that did not carry a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub subscriber: String,
    pub payload: String,
}

/// Everything about a run except the per-row detail
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub passed: bool,
    pub broker: String,
    pub universe_size: usize,
    pub subjects: Vec<SubjectVerdict>,
    pub publishers: Vec<PublisherReport>,
    pub stats: StatsSnapshot,
    pub phases: Vec<PhaseTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultOutcome>,
    pub connect_failures: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    /// Prometheus text exposition of the final counters
    #[serde(skip)]
    pub metrics: Option<String>,
}

/// Destination for the report and the summary
pub trait ReportSink: Send {
    /// Write the verdict rows. A report is written at most once.
    fn write_report(&mut self, report: Report) -> Result<(), ReportError>;

    fn write_summary(&mut self, summary: &RunSummary) -> Result<(), ReportError>;
}

/// Quote a field when it holds a delimiter, a quote or a line break
fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\"")).into()
    } else {
        value.into()
    }
}

fn write_rows<W: Write>(mut out: W, rows: &[VerdictRow]) -> std::io::Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for row in rows {
        writeln!(
            out,
            "{},{},{},{},{},{}",
            csv_field(&row.subject),
            csv_field(&row.publisher),
            row.sequence,
            csv_field(&row.received_by),
            row.status,
            csv_field(&row.note)
        )?;
    }
    out.flush()
}

fn create(path: &Path) -> Result<BufWriter<File>, ReportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// CSV report file with optional JSON summary and metrics files
#[derive(Debug, Default)]
pub struct CsvReportSink {
    report: Option<PathBuf>,
    summary: Option<PathBuf>,
    metrics: Option<PathBuf>,
    written: bool,
}

impl CsvReportSink {
    pub fn new(report: impl Into<PathBuf>) -> Self {
        Self {
            report: Some(report.into()),
            ..Default::default()
        }
    }

    /// Every file the output section names; rows are dropped without a report path
    pub fn from_output(output: &OutputConfig) -> Self {
        Self {
            report: output.report.clone(),
            summary: output.summary.clone(),
            metrics: output.metrics.clone(),
            written: false,
        }
    }

    pub fn with_summary(mut self, path: Option<PathBuf>) -> Self {
        self.summary = path;
        self
    }

    pub fn with_metrics(mut self, path: Option<PathBuf>) -> Self {
        self.metrics = path;
        self
    }
}

impl ReportSink for CsvReportSink {
    fn write_report(&mut self, report: Report) -> Result<(), ReportError> {
        if self.written {
            return Err(ReportError::AlreadyWritten);
        }
        self.written = true;
        if let Some(path) = &self.report {
            write_rows(create(path)?, &report.rows)?;
            info!("Report written to {} ({} rows)", path.display(), report.rows.len());
        }
        Ok(())
    }

    fn write_summary(&mut self, summary: &RunSummary) -> Result<(), ReportError> {
        if let Some(path) = &self.summary {
            let mut out = create(path)?;
            serde_json::to_writer_pretty(&mut out, summary)?;
            out.flush()?;
            info!("Summary written to {}", path.display());
        }
        if let (Some(path), Some(metrics)) = (&self.metrics, &summary.metrics) {
            let mut out = create(path)?;
            out.write_all(metrics.as_bytes())?;
            out.flush()?;
            info!("Metrics written to {}", path.display());
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    rows: Option<Vec<VerdictRow>>,
    summary: Option<RunSummary>,
}

/// Keeps everything in memory; clones share the same storage
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Option<Vec<VerdictRow>> {
        self.state.lock().rows.clone()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.state.lock().summary.clone()
    }

    /// The rows rendered as CSV text
    pub fn csv(&self) -> Option<String> {
        let rows = self.rows()?;
        let mut buf = Vec::new();
        write_rows(&mut buf, &rows).ok()?;
        String::from_utf8(buf).ok()
    }
}

impl ReportSink for MemorySink {
    fn write_report(&mut self, report: Report) -> Result<(), ReportError> {
        let mut state = self.state.lock();
        if state.rows.is_some() {
            return Err(ReportError::AlreadyWritten);
        }
        state.rows = Some(report.rows);
        Ok(())
    }

    fn write_summary(&mut self, summary: &RunSummary) -> Result<(), ReportError> {
        self.state.lock().summary = Some(summary.clone());
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn write_report(&mut self, _report: Report) -> Result<(), ReportError> {
        Ok(())
    }

    fn write_summary(&mut self, _summary: &RunSummary) -> Result<(), ReportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::RowStatus;
    use compact_str::CompactString;
    use pretty_assertions::assert_eq;

    fn row(subject: &str, sequence: u64, received_by: &str, status: RowStatus, note: &str) -> VerdictRow {
        VerdictRow {
            subject: subject.to_string(),
            publisher: CompactString::from("verify-pub-0"),
            sequence,
            received_by: received_by.to_string(),
            status,
            note: note.to_string(),
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            passed: true,
            broker: "loopback".to_string(),
            universe_size: 2,
            subjects: Vec::new(),
            publishers: Vec::new(),
            stats: StatsSnapshot::default(),
            phases: Vec::new(),
            fault: None,
            connect_failures: Vec::new(),
            anomalies: Vec::new(),
            metrics: Some("verify_publish_attempts_total 2\n".to_string()),
        }
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a;b"), "a;b");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_csv_sink_writes_rows_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/report.csv");
        let mut sink = CsvReportSink::new(&path);

        let report = Report::new(vec![
            row("verify-sub-0", 1, "verify-sub-0", RowStatus::Pass, ""),
            row("group-0", 2, "a;b", RowStatus::Fail, "duplicate"),
        ]);
        sink.write_report(report.clone()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "subject,publisher,sequence,received_by,status,note\n\
             verify-sub-0,verify-pub-0,1,verify-sub-0,Pass,\n\
             group-0,verify-pub-0,2,a;b,Fail,duplicate\n"
        );

        assert!(matches!(
            sink.write_report(report),
            Err(ReportError::AlreadyWritten)
        ));
    }

    #[test]
    fn test_csv_sink_summary_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let summary_path = dir.path().join("summary.json");
        let metrics_path = dir.path().join("metrics.prom");
        let mut sink = CsvReportSink::new(dir.path().join("report.csv"))
            .with_summary(Some(summary_path.clone()))
            .with_metrics(Some(metrics_path.clone()));

        sink.write_summary(&summary()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(json["passed"], serde_json::Value::Bool(true));
        assert_eq!(json["universe_size"], 2);
        assert!(json.get("metrics").is_none());
        assert!(json.get("fault").is_none());

        let metrics = std::fs::read_to_string(&metrics_path).unwrap();
        assert_eq!(metrics, "verify_publish_attempts_total 2\n");
    }

    #[test]
    fn test_output_without_report_path_still_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            summary: Some(dir.path().join("summary.json")),
            ..Default::default()
        };
        let mut sink = CsvReportSink::from_output(&output);

        sink.write_report(Report::default()).unwrap();
        sink.write_summary(&summary()).unwrap();
        assert!(dir.path().join("summary.json").exists());
        assert!(sink.write_report(Report::default()).is_err());
    }

    #[test]
    fn test_memory_sink_shares_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer
            .write_report(Report::new(vec![row("s", 1, "", RowStatus::Fail, "missing")]))
            .unwrap();
        writer.write_summary(&summary()).unwrap();

        assert_eq!(sink.rows().unwrap().len(), 1);
        assert!(sink.summary().unwrap().passed);
        assert_eq!(
            sink.csv().unwrap(),
            "subject,publisher,sequence,received_by,status,note\ns,verify-pub-0,1,,Fail,missing\n"
        );
        assert!(writer.write_report(Report::default()).is_err());
    }
}
