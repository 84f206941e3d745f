use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::archive::{ArchiveLayout, RunAttempt};
use crate::input::ArtifactKind;
use crate::outcome::{Outcome, OutcomeCounts};

pub const NO_CUSTOM_ATTRIBUTE: &str = "none";

const ITERATION_COLUMNS: [&str; 7] = [
    "Iteration",
    "ErrorCode",
    "OutputMessages",
    "ActionSequence",
    "MapFileType",
    "CustomAttribute",
    "MapFilePath",
];
const OVERVIEW_COLUMNS: [&str; 4] = ["ErrorCode", "OutputMessage", "Count", "IterationNumbers"];
const HISTORY_COLUMNS: [&str; 8] = [
    "AttemptNr",
    "Timestamp",
    "ExecutionTime",
    "Accepted",
    "Crashed",
    "Rejected",
    "Unknown",
    "TimedOut",
];
const ERROR_HISTORY_COLUMNS: [&str; 5] =
    ["AttemptNr", "Timestamp", "ErrorCode", "OutputMessage", "Count"];

/// One completed iteration. Immutable once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub map_path: PathBuf,
    pub map_kind: ArtifactKind,
    pub action_sequence: String,
    pub outcome: Outcome,
    pub raw_output: String,
    pub custom_attribute: String,
}

impl IterationRecord {
    fn csv_fields(&self) -> [String; 7] {
        [
            self.iteration.to_string(),
            self.outcome.error_code(),
            self.raw_output.clone(),
            self.action_sequence.clone(),
            self.map_kind.to_string(),
            self.custom_attribute.clone(),
            self.map_path.display().to_string(),
        ]
    }
}

/// Records sharing one `(outcome, raw output)` key. Output text is compared
/// byte for byte; nothing in it is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeGroup {
    pub outcome: Outcome,
    pub output: String,
    pub iterations: Vec<usize>,
}

impl OutcomeGroup {
    pub fn count(&self) -> usize {
        self.iterations.len()
    }

    fn iteration_list(&self) -> String {
        self.iterations
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// What a flush managed to write.
#[derive(Debug, Default)]
pub struct LedgerReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Append-only log of the iterations of one run attempt.
pub struct IterationLedger {
    layout: ArchiveLayout,
    log_history: bool,
    records: Vec<IterationRecord>,
}

impl IterationLedger {
    pub fn new(layout: ArchiveLayout, log_history: bool) -> Self {
        Self {
            layout,
            log_history,
            records: Vec::new(),
        }
    }

    /// Index the next recorded iteration will get. Indices are 1-based and
    /// contiguous.
    pub fn next_iteration(&self) -> usize {
        self.records.len() + 1
    }

    pub fn record(
        &mut self,
        map_path: PathBuf,
        action_sequence: String,
        outcome: Outcome,
        raw_output: String,
        custom_attribute: Option<String>,
    ) -> &IterationRecord {
        let record = IterationRecord {
            iteration: self.next_iteration(),
            map_kind: ArtifactKind::from_path(&map_path),
            map_path,
            action_sequence,
            outcome,
            raw_output,
            custom_attribute: custom_attribute
                .unwrap_or_else(|| NO_CUSTOM_ATTRIBUTE.to_string()),
        };
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for r in &self.records {
            counts.record(r.outcome);
        }
        counts
    }

    /// Groups by `(outcome, raw output)`, largest first. Equal sizes keep
    /// the order in which their first member was recorded.
    pub fn groups(&self) -> Vec<OutcomeGroup> {
        let mut index: HashMap<(Outcome, &str), usize> = HashMap::new();
        let mut groups: Vec<OutcomeGroup> = Vec::new();
        for r in &self.records {
            let key = (r.outcome, r.raw_output.as_str());
            match index.get(&key) {
                Some(&i) => groups[i].iterations.push(r.iteration),
                None => {
                    index.insert(key, groups.len());
                    groups.push(OutcomeGroup {
                        outcome: r.outcome,
                        output: r.raw_output.clone(),
                        iterations: vec![r.iteration],
                    });
                }
            }
        }
        // Stable sort keeps encounter order among ties.
        groups.sort_by(|a, b| b.count().cmp(&a.count()));
        groups
    }

    /// Writes every run artifact. Each one is attempted independently: a
    /// failed write is logged and reported, never propagated.
    pub fn flush(&self, attempt: &RunAttempt) -> LedgerReport {
        let mut report = LedgerReport::default();
        let groups = self.groups();
        let counts = self.counts();
        let elapsed = attempt.elapsed();

        let mut attempt_write = |path: PathBuf, result: Result<()>| match result {
            Ok(()) => report.written.push(path),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "failed to write log artifact");
                report.failed.push((path, format!("{:#}", e)));
            }
        };

        let path = self.layout.trace_file();
        attempt_write(path.clone(), write_trace(&path, &self.records, &counts));
        let path = self.layout.iterations_csv();
        attempt_write(path.clone(), write_iterations_csv(&path, &self.records));
        let path = self.layout.overview_csv();
        attempt_write(path.clone(), write_overview_csv(&path, &groups));

        if self.log_history {
            let timestamp = attempt.started_at().format("%d-%m-%Y %H:%M").to_string();
            let path = self.layout.history_csv();
            attempt_write(
                path.clone(),
                append_history(&path, attempt.number(), &timestamp, elapsed, &counts),
            );
            let path = self.layout.error_history_csv();
            attempt_write(
                path.clone(),
                append_error_history(&path, attempt.number(), &timestamp, &groups),
            );
            let path = self.layout.full_history_csv();
            attempt_write(
                path.clone(),
                append_full_history(&path, attempt.number(), &self.records),
            );
        }

        info!(
            attempt = attempt.number(),
            iterations = self.records.len(),
            written = report.written.len(),
            failed = report.failed.len(),
            "ledger flushed"
        );
        report
    }
}

pub fn format_execution_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn write_trace(path: &Path, records: &[IterationRecord], counts: &OutcomeCounts) -> Result<()> {
    let mut out = String::new();
    for r in records {
        out.push_str(&format!("Iteration: {}\n", r.iteration));
        out.push_str(&format!("Map File Type: {}\n", r.map_kind));
        out.push_str(&format!("Map File Path: {}\n", r.map_path.display()));
        out.push_str(&format!("Action Sequence: {}\n", r.action_sequence));
        out.push_str(&format!("Outcome: {}\n", r.outcome));
        out.push_str(&format!("Error Code: {}\n", r.outcome.error_code()));
        out.push_str(&format!("Output Messages: {}\n", r.raw_output));
        out.push_str(&format!("Custom Attribute: {}\n", r.custom_attribute));
        out.push('\n');
    }
    out.push_str("SUMMARY\n");
    out.push_str(&format!("Accepted: {} occurrences\n", counts.accepted));
    out.push_str(&format!("Crashed: {} occurrences\n", counts.crashed));
    out.push_str(&format!("Rejected: {} occurrences\n", counts.rejected));
    out.push_str(&format!("Timed out: {} occurrences\n", counts.timed_out));
    out.push_str(&format!("Unknown: {} occurrences\n", counts.unknown));
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn write_iterations_csv(path: &Path, records: &[IterationRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(ITERATION_COLUMNS)?;
    for r in records {
        writer.write_record(r.csv_fields())?;
    }
    writer.flush()?;
    Ok(())
}

fn write_overview_csv(path: &Path, groups: &[OutcomeGroup]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(OVERVIEW_COLUMNS)?;
    for g in groups {
        writer.write_record([
            g.outcome.error_code(),
            g.output.clone(),
            g.count().to_string(),
            g.iteration_list(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Opens a long-lived CSV for appending. The header goes in only when the
/// file is new or empty.
fn open_appending(path: &Path, header: &[&str]) -> Result<csv::Writer<fs::File>> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let is_new = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(header)?;
    }
    Ok(writer)
}

fn append_history(
    path: &Path,
    attempt: u64,
    timestamp: &str,
    elapsed: Duration,
    counts: &OutcomeCounts,
) -> Result<()> {
    let mut writer = open_appending(path, &HISTORY_COLUMNS)?;
    writer.write_record([
        attempt.to_string(),
        timestamp.to_string(),
        format_execution_time(elapsed),
        counts.accepted.to_string(),
        counts.crashed.to_string(),
        counts.rejected.to_string(),
        counts.unknown.to_string(),
        counts.timed_out.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

fn append_error_history(
    path: &Path,
    attempt: u64,
    timestamp: &str,
    groups: &[OutcomeGroup],
) -> Result<()> {
    let mut writer = open_appending(path, &ERROR_HISTORY_COLUMNS)?;
    for g in groups {
        writer.write_record([
            attempt.to_string(),
            timestamp.to_string(),
            g.outcome.error_code(),
            g.output.clone(),
            g.count().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn append_full_history(path: &Path, attempt: u64, records: &[IterationRecord]) -> Result<()> {
    let mut header = vec!["AttemptNr"];
    header.extend_from_slice(&ITERATION_COLUMNS);
    let mut writer = open_appending(path, &header)?;
    for r in records {
        let mut row = vec![attempt.to_string()];
        row.extend(r.csv_fields());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// A row of the per-iteration CSV, as read back from disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IterationCsvRow {
    iteration: usize,
    error_code: String,
    output_messages: String,
    action_sequence: String,
    map_file_type: String,
    custom_attribute: String,
    map_file_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationRow {
    pub iteration: usize,
    pub outcome: Outcome,
    pub output: String,
    pub action_sequence: String,
    pub map_file_type: String,
    pub custom_attribute: String,
    pub map_path: PathBuf,
}

pub fn read_iterations_csv(path: &Path) -> Result<Vec<IterationRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, rec) in reader.deserialize::<IterationCsvRow>().enumerate() {
        let row = rec.with_context(|| {
            format!("failed to read record {} in {}", i + 1, path.display())
        })?;
        let outcome = Outcome::parse_error_code(&row.error_code).ok_or_else(|| {
            anyhow!(
                "record {} in {} has invalid ErrorCode {:?}",
                i + 1,
                path.display(),
                row.error_code
            )
        })?;
        rows.push(IterationRow {
            iteration: row.iteration,
            outcome,
            output: row.output_messages,
            action_sequence: row.action_sequence,
            map_file_type: row.map_file_type,
            custom_attribute: row.custom_attribute,
            map_path: PathBuf::from(row.map_file_path),
        });
    }
    Ok(rows)
}
