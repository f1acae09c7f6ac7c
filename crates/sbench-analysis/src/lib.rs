use anyhow::{Context, Result};
use csv::StringRecord;
use sbench_core::{
    tmp_sibling, RunIdError, RunIdentifier, BATCH_LATENCY_FILE, BATCH_SIZE_FILE,
    DEFAULT_REPORTING_PERIOD_SECS, DEFAULT_TIMEOUT_SECS, MEMORY_FILE, TOTAL_LATENCY_FILE,
    TOTAL_SIZE_FILE, TOTAL_TIME_FILE,
};
use serde::{Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const REPORT_COLUMNS: [&str; 18] = [
    "query",
    "exec",
    "binding",
    "window-size",
    "slide-size",
    "slide-count",
    "processed-size-mean",
    "processed-size-p99",
    "processed-mean",
    "processed-p99",
    "total-size-mean",
    "total-size-p99",
    "total-mean",
    "total-p99",
    "tput",
    "total-time",
    "last-slide-time",
    "memory",
];

const STAT_ROW_COLUMNS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSettings {
    /// Substituted for the total time of runs that were killed.
    pub timeout_secs: u64,
    pub reporting_period_secs: u64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            reporting_period_secs: DEFAULT_REPORTING_PERIOD_SECS,
        }
    }
}

/// Why a single run directory was left out of the report.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("cannot decode run directory name '{name}': {source}")]
    InvalidRunName {
        name: String,
        #[source]
        source: RunIdError,
    },
    #[error("{run}: missing {file}")]
    MissingFile { run: String, file: &'static str },
    #[error("{run}: {file} has no data rows")]
    EmptyFile { run: String, file: &'static str },
    #[error("{run}: failed to read {file}: {source}")]
    Csv {
        run: String,
        file: &'static str,
        #[source]
        source: csv::Error,
    },
    #[error("{run}: malformed row in {file}: {reason}")]
    MalformedRow {
        run: String,
        file: &'static str,
        reason: String,
    },
}

impl AggregationError {
    pub fn run(&self) -> &str {
        match self {
            AggregationError::InvalidRunName { name, .. } => name,
            AggregationError::MissingFile { run, .. }
            | AggregationError::EmptyFile { run, .. }
            | AggregationError::Csv { run, .. }
            | AggregationError::MalformedRow { run, .. } => run,
        }
    }
}

/// One line of a windowed metric log: `[id, window-index, mean, p25, p50, p75, p90, p99, p999]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedStatRow {
    pub id: String,
    pub window_index: u64,
    pub mean: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p99: f64,
    pub p999: f64,
}

impl WindowedStatRow {
    fn parse(record: &StringRecord) -> Result<Self, String> {
        if record.len() < STAT_ROW_COLUMNS {
            return Err(format!(
                "expected {} columns, found {}",
                STAT_ROW_COLUMNS,
                record.len()
            ));
        }
        let num = |idx: usize| -> Result<f64, String> {
            let raw = record[idx].trim();
            raw.parse::<f64>()
                .map_err(|_| format!("column {} is not a number: '{}'", idx, raw))
        };
        let window_index = record[1]
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("window index is not an integer: '{}'", record[1].trim()))?;
        Ok(Self {
            id: record[0].trim().to_string(),
            window_index,
            mean: num(2)?,
            p25: num(3)?,
            p50: num(4)?,
            p75: num(5)?,
            p90: num(6)?,
            p99: num(7)?,
            p999: num(8)?,
        })
    }
}

/// How long a run took, as far as its logs tell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TotalTime {
    Completed(f64),
    /// No `total-time.csv` row: the supervisor killed the run.
    TimedOut,
}

impl TotalTime {
    pub fn seconds(&self, settings: &AggregationSettings) -> f64 {
        match self {
            TotalTime::Completed(secs) => *secs,
            TotalTime::TimedOut => settings.timeout_secs as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    pub id: RunIdentifier,
    pub slide_count: u64,
    pub last_slide_count: usize,
    pub processed_size: WindowedStatRow,
    pub total_size: WindowedStatRow,
    pub processed_latency: WindowedStatRow,
    pub total_latency: WindowedStatRow,
    pub total_time: TotalTime,
    pub memory: u64,
}

/// One row of the aggregated report. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregatedRecord {
    pub query: String,
    pub exec: String,
    pub binding: String,
    pub window_size: String,
    pub slide_size: String,
    pub slide_count: u64,
    #[serde(serialize_with = "integral_as_integer")]
    pub processed_size_mean: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub processed_size_p99: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub processed_mean: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub processed_p99: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub total_size_mean: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub total_size_p99: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub total_mean: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub total_p99: f64,
    pub tput: f64,
    #[serde(serialize_with = "integral_as_integer")]
    pub total_time: f64,
    pub last_slide_time: u64,
    pub memory: u64,
}

impl AggregatedRecord {
    pub fn from_metrics(metrics: &RunMetrics, settings: &AggregationSettings) -> Self {
        Self {
            query: metrics.id.query_name.clone(),
            exec: metrics.id.exec_name.clone(),
            binding: metrics.id.binding.clone(),
            window_size: metrics.id.window_size.clone(),
            slide_size: metrics.id.slide_size.clone(),
            slide_count: metrics.slide_count,
            processed_size_mean: metrics.processed_size.mean,
            processed_size_p99: metrics.processed_size.p99,
            processed_mean: metrics.processed_latency.mean,
            processed_p99: metrics.processed_latency.p99,
            total_size_mean: metrics.total_size.mean,
            total_size_p99: metrics.total_size.p99,
            total_mean: metrics.total_latency.mean,
            total_p99: metrics.total_latency.p99,
            tput: throughput(
                metrics.slide_count,
                metrics.processed_size.mean,
                metrics.last_slide_count,
                settings.reporting_period_secs,
            ),
            total_time: metrics.total_time.seconds(settings),
            last_slide_time: metrics.last_slide_count as u64 * settings.reporting_period_secs,
            memory: metrics.memory,
        }
    }
}

/// Pass-through measurements keep their log form: `20`, not `20.0`.
fn integral_as_integer<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// `slide-count * processed-size-mean / (last-slide-count * reporting-period)`
pub fn throughput(
    slide_count: u64,
    processed_size_mean: f64,
    last_slide_count: usize,
    reporting_period_secs: u64,
) -> f64 {
    slide_count as f64 * processed_size_mean
        / (last_slide_count as f64 * reporting_period_secs as f64)
}

/// A parsed windowed log: its data rows plus how many header lines preceded them.
#[derive(Debug, Clone, PartialEq)]
pub struct StatLog {
    pub header_lines: usize,
    pub rows: Vec<WindowedStatRow>,
}

impl StatLog {
    /// Last data row. Logs are never built without one.
    pub fn terminal(&self) -> &WindowedStatRow {
        &self.rows[self.rows.len() - 1]
    }

    /// 1-based line position, header included, of the first row carrying the
    /// terminal row's window index.
    ///
    /// Linear scan from the start of the file, O(rows). A header line never
    /// matches and counts as one position. When the terminal index also shows
    /// up earlier after a non-contiguous gap, the earliest occurrence wins.
    pub fn last_slide_count(&self) -> Option<usize> {
        let last = self.rows.last()?;
        self.rows
            .iter()
            .position(|row| row.window_index == last.window_index)
            .map(|pos| self.header_lines + pos + 1)
    }
}

#[derive(Debug, Default)]
pub struct AggregationOutcome {
    pub records: Vec<AggregatedRecord>,
    pub failures: Vec<AggregationError>,
}

/// Walks the immediate subdirectories of `results_root` in name order and
/// extracts one record per run. Runs that fail are collected as diagnostics.
pub fn aggregate_results(
    results_root: &Path,
    settings: &AggregationSettings,
) -> Result<AggregationOutcome> {
    let mut outcome = AggregationOutcome::default();
    for entry in WalkDir::new(results_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry
            .with_context(|| format!("failed to list {}", results_root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        info!(run = %name, "opening run directory");
        match aggregate_run(entry.path(), &name, settings) {
            Ok(record) => {
                info!(run = %name, "result aggregated");
                outcome.records.push(record);
            }
            Err(err) => {
                warn!(run = %name, error = %err, "skipping run");
                outcome.failures.push(err);
            }
        }
    }
    Ok(outcome)
}

fn aggregate_run(
    dir: &Path,
    name: &str,
    settings: &AggregationSettings,
) -> Result<AggregatedRecord, AggregationError> {
    let id = RunIdentifier::decode(name).map_err(|source| AggregationError::InvalidRunName {
        name: name.to_string(),
        source,
    })?;
    let metrics = extract_run_metrics(dir, id)?;
    Ok(AggregatedRecord::from_metrics(&metrics, settings))
}

pub fn extract_run_metrics(dir: &Path, id: RunIdentifier) -> Result<RunMetrics, AggregationError> {
    let run = id.encode();
    let reader = RunLogReader { dir, run: &run };

    let batch_sizes = reader.stat_log(BATCH_SIZE_FILE)?;
    let processed_size = batch_sizes.terminal().clone();
    let last_slide_count = batch_sizes.last_slide_count().unwrap_or(1);
    let total_size = reader.stat_log(TOTAL_SIZE_FILE)?.terminal().clone();
    let processed_latency = reader.stat_log(BATCH_LATENCY_FILE)?.terminal().clone();
    let total_latency = reader.stat_log(TOTAL_LATENCY_FILE)?.terminal().clone();
    let memory = reader.peak_memory()?;
    let total_time = reader.total_time()?;

    Ok(RunMetrics {
        id,
        slide_count: processed_size.window_index,
        last_slide_count,
        processed_size,
        total_size,
        processed_latency,
        total_latency,
        total_time,
        memory,
    })
}

struct RunLogReader<'a> {
    dir: &'a Path,
    run: &'a str,
}

impl RunLogReader<'_> {
    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn records(&self, file: &'static str) -> Result<Option<Vec<StringRecord>>, AggregationError> {
        let path = self.path(file);
        if !path.is_file() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .map_err(|source| self.csv_error(file, source))?;
        let mut out = Vec::new();
        for record in reader.records() {
            out.push(record.map_err(|source| self.csv_error(file, source))?);
        }
        Ok(Some(out))
    }

    fn required_records(&self, file: &'static str) -> Result<Vec<StringRecord>, AggregationError> {
        self.records(file)?
            .ok_or_else(|| AggregationError::MissingFile {
                run: self.run.to_string(),
                file,
            })
    }

    fn stat_log(&self, file: &'static str) -> Result<StatLog, AggregationError> {
        let records = self.required_records(file)?;
        let header_lines = usize::from(records.first().is_some_and(is_header));
        let rows = records[header_lines..]
            .iter()
            .map(|record| {
                WindowedStatRow::parse(record).map_err(|reason| self.malformed(file, reason))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Err(self.empty(file));
        }
        Ok(StatLog { header_lines, rows })
    }

    fn peak_memory(&self) -> Result<u64, AggregationError> {
        let records = self.required_records(MEMORY_FILE)?;
        let last = records.last().ok_or_else(|| self.empty(MEMORY_FILE))?;
        let raw = last.get(0).unwrap_or("").trim();
        raw.parse::<u64>().map_err(|_| {
            self.malformed(MEMORY_FILE, format!("peak memory is not an integer: '{}'", raw))
        })
    }

    /// `[id, id, elapsed-seconds]`; absent or empty means the run timed out.
    fn total_time(&self) -> Result<TotalTime, AggregationError> {
        let Some(records) = self.records(TOTAL_TIME_FILE)? else {
            return Ok(TotalTime::TimedOut);
        };
        let Some(last) = records.iter().rev().find(|r| !is_blank(r)) else {
            return Ok(TotalTime::TimedOut);
        };
        let raw = last.get(2).ok_or_else(|| {
            self.malformed(
                TOTAL_TIME_FILE,
                format!("expected 3 columns, found {}", last.len()),
            )
        })?;
        let raw = raw.trim();
        match raw.parse::<f64>() {
            Ok(secs) => Ok(TotalTime::Completed(secs)),
            // a header line alone carries no measurement
            Err(_) if records.len() == 1 => Ok(TotalTime::TimedOut),
            Err(_) => Err(self.malformed(
                TOTAL_TIME_FILE,
                format!("elapsed seconds is not a number: '{}'", raw),
            )),
        }
    }

    fn csv_error(&self, file: &'static str, source: csv::Error) -> AggregationError {
        AggregationError::Csv {
            run: self.run.to_string(),
            file,
            source,
        }
    }

    fn empty(&self, file: &'static str) -> AggregationError {
        AggregationError::EmptyFile {
            run: self.run.to_string(),
            file,
        }
    }

    fn malformed(&self, file: &'static str, reason: String) -> AggregationError {
        AggregationError::MalformedRow {
            run: self.run.to_string(),
            file,
            reason,
        }
    }
}

fn is_header(record: &StringRecord) -> bool {
    record
        .get(1)
        .map(|v| v.trim().parse::<u64>().is_err())
        .unwrap_or(false)
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|f| f.trim().is_empty())
}

/// Writes the header plus every record. The table appears under `path` only once complete.
pub fn write_aggregated_report(path: &Path, records: &[AggregatedRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        writer.write_record(REPORT_COLUMNS)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move report into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch_dir(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sbench_analysis_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("scratch dir");
        root
    }

    fn stat_row(window_index: u64, mean: f64, p99: f64) -> WindowedStatRow {
        WindowedStatRow {
            id: "r".to_string(),
            window_index,
            mean,
            p25: mean,
            p50: mean,
            p75: mean,
            p90: mean,
            p99,
            p999: p99,
        }
    }

    fn write_stat_file(dir: &Path, file: &str, rows: &[(u64, f64, f64)]) {
        let mut body = String::from("id,window,mean,p25,p50,p75,p90,p99,p999\n");
        for (i, (window, mean, p99)) in rows.iter().enumerate() {
            body.push_str(&format!(
                "{},{},{},{},{},{},{},{},{}\n",
                i, window, mean, mean, mean, mean, mean, p99, p99
            ));
        }
        fs::write(dir.join(file), body).expect("write stat file");
    }

    fn write_complete_run(root: &Path, name: &str, total_time: Option<&str>) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("run dir");
        write_stat_file(
            &dir,
            BATCH_SIZE_FILE,
            &[(5, 10.0, 11.0), (7, 18.0, 90.0), (7, 19.0, 95.0), (7, 20.0, 99.0)],
        );
        write_stat_file(&dir, TOTAL_SIZE_FILE, &[(5, 100.0, 120.0), (7, 140.0, 180.0)]);
        write_stat_file(&dir, BATCH_LATENCY_FILE, &[(7, 2.5, 9.0)]);
        write_stat_file(&dir, TOTAL_LATENCY_FILE, &[(7, 30.0, 41.0)]);
        fs::write(dir.join(MEMORY_FILE), "max\n1048576\n").expect("memory");
        if let Some(body) = total_time {
            fs::write(dir.join(TOTAL_TIME_FILE), body).expect("total time");
        }
        dir
    }

    #[test]
    fn last_slide_count_counts_header_line() {
        let log = StatLog {
            header_lines: 1,
            rows: vec![
                stat_row(5, 10.0, 1.0),
                stat_row(7, 18.0, 1.0),
                stat_row(7, 19.0, 1.0),
                stat_row(7, 20.0, 1.0),
            ],
        };
        assert_eq!(log.last_slide_count(), Some(3));
        assert_eq!(log.terminal().mean, 20.0);
        let empty = StatLog {
            header_lines: 1,
            rows: Vec::new(),
        };
        assert_eq!(empty.last_slide_count(), None);
    }

    #[test]
    fn last_slide_count_from_exporter_file() {
        let root = scratch_dir("lsc");
        let dir = write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        let reader = RunLogReader {
            dir: &dir,
            run: "engineA#q1#0#10#5#1",
        };
        let log = reader.stat_log(BATCH_SIZE_FILE).expect("batch sizes");
        assert_eq!(log.header_lines, 1);
        assert_eq!(log.rows.len(), 4);
        assert_eq!(log.last_slide_count(), Some(3));

        fs::write(
            dir.join(BATCH_SIZE_FILE),
            "0,5,10,10,10,10,10,11,11\n1,7,20,20,20,20,20,99,99\n",
        )
        .expect("headerless");
        let log = reader.stat_log(BATCH_SIZE_FILE).expect("batch sizes");
        assert_eq!(log.header_lines, 0);
        assert_eq!(log.last_slide_count(), Some(2));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn last_slide_count_prefers_earliest_reused_index() {
        let log = StatLog {
            header_lines: 0,
            rows: vec![
                stat_row(3, 1.0, 1.0),
                stat_row(1, 1.0, 1.0),
                stat_row(2, 1.0, 1.0),
                stat_row(3, 1.0, 1.0),
            ],
        };
        assert_eq!(log.last_slide_count(), Some(1));
    }

    #[test]
    fn throughput_uses_reporting_period() {
        assert_eq!(throughput(10, 50.0, 2, 5), 50.0);
    }

    #[test]
    fn end_to_end_run_directory_is_decoded_and_extracted() {
        let root = scratch_dir("e2e");
        write_complete_run(&root, "engineA#q1#0#1000#100#2", Some("a,b,c\n0,0,42.5\n"));
        let outcome = aggregate_results(&root, &AggregationSettings::default()).expect("agg");
        assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
        assert_eq!(outcome.records.len(), 1);
        let rec = &outcome.records[0];
        assert_eq!(rec.exec, "engineA");
        assert_eq!(rec.query, "q1");
        assert_eq!(rec.binding, "0");
        assert_eq!(rec.window_size, "1000");
        assert_eq!(rec.slide_size, "100");
        assert_eq!(rec.slide_count, 7);
        assert_eq!(rec.processed_size_mean, 20.0);
        assert_eq!(rec.processed_size_p99, 99.0);
        assert_eq!(rec.total_size_mean, 140.0);
        assert_eq!(rec.total_size_p99, 180.0);
        assert_eq!(rec.processed_mean, 2.5);
        assert_eq!(rec.processed_p99, 9.0);
        assert_eq!(rec.total_mean, 30.0);
        assert_eq!(rec.total_p99, 41.0);
        assert_eq!(rec.total_time, 42.5);
        assert_eq!(rec.last_slide_time, 15);
        assert_eq!(rec.tput, 7.0 * 20.0 / 15.0);
        assert_eq!(rec.memory, 1_048_576);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_total_time_substitutes_timeout() {
        let root = scratch_dir("timeout");
        write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        write_complete_run(&root, "engineA#q1#1#10#5#1", Some(""));
        let settings = AggregationSettings {
            timeout_secs: 900,
            reporting_period_secs: 5,
        };
        let outcome = aggregate_results(&root, &settings).expect("agg");
        assert_eq!(outcome.records.len(), 2);
        for rec in &outcome.records {
            assert_eq!(rec.total_time, 900.0);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_memory_skips_only_that_run() {
        let root = scratch_dir("malformed");
        write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        let bad = write_complete_run(&root, "engineA#q1#1#10#5#1", None);
        write_complete_run(&root, "engineB#q1#0#10#5#1", None);
        fs::write(bad.join(MEMORY_FILE), "max\nlots\n").expect("corrupt memory");

        let outcome = aggregate_results(&root, &AggregationSettings::default()).expect("agg");
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records.iter().all(|r| r.binding == "0"));
        assert_eq!(outcome.failures.len(), 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.run(), "engineA#q1#1#10#5#1");
        assert!(matches!(
            failure,
            AggregationError::MalformedRow { file: MEMORY_FILE, .. }
        ));

        let out = root.join("out").join("aggregated.csv");
        write_aggregated_report(&out, &outcome.records).expect("write report");
        let body = fs::read_to_string(&out).expect("read report");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], REPORT_COLUMNS.join(","));
        assert!(lines[1].starts_with("q1,engineA,0,10,5,7,"), "{}", lines[1]);
        assert!(lines[2].starts_with("q1,engineB,0,10,5,7,"), "{}", lines[2]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn undecodable_directories_and_loose_files_are_handled() {
        let root = scratch_dir("names");
        write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        fs::create_dir_all(root.join("not-a-run")).expect("dir");
        fs::write(root.join("aggregated.csv"), "stale").expect("file");

        let outcome = aggregate_results(&root, &AggregationSettings::default()).expect("agg");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            outcome.failures[0],
            AggregationError::InvalidRunName { .. }
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_and_header_only_logs_fail_the_run() {
        let root = scratch_dir("missing");
        let dir = write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        fs::remove_file(dir.join(TOTAL_LATENCY_FILE)).expect("remove");
        let id = RunIdentifier::decode("engineA#q1#0#10#5#1").expect("id");
        let err = extract_run_metrics(&dir, id.clone()).expect_err("missing file");
        assert!(matches!(
            err,
            AggregationError::MissingFile { file: TOTAL_LATENCY_FILE, .. }
        ));

        write_stat_file(&dir, TOTAL_LATENCY_FILE, &[]);
        let err = extract_run_metrics(&dir, id).expect_err("header only");
        assert!(matches!(
            err,
            AggregationError::EmptyFile { file: TOTAL_LATENCY_FILE, .. }
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn short_stat_row_is_malformed() {
        let root = scratch_dir("short");
        let dir = write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        fs::write(dir.join(BATCH_LATENCY_FILE), "0,7,2.5,3.0\n").expect("write");
        let id = RunIdentifier::decode("engineA#q1#0#10#5#1").expect("id");
        let err = extract_run_metrics(&dir, id).expect_err("short row");
        assert!(err.to_string().contains("expected 9 columns"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn report_keeps_integral_measurements_plain() {
        let root = scratch_dir("plain");
        write_complete_run(&root, "engineA#q1#0#10#5#1", None);
        let outcome = aggregate_results(&root, &AggregationSettings::default()).expect("agg");
        let out = root.join("aggregated.csv");
        write_aggregated_report(&out, &outcome.records).expect("write report");
        let body = fs::read_to_string(&out).expect("read report");
        let row: Vec<&str> = body.lines().nth(1).expect("data row").split(',').collect();
        assert_eq!(
            &row[..14],
            &[
                "q1", "engineA", "0", "10", "5", "7", "20", "99", "2.5", "9", "140", "180", "30",
                "41"
            ]
        );
        let tput: f64 = row[14].parse().expect("tput");
        assert!((tput - 140.0 / 15.0).abs() < 1e-9, "{}", row[14]);
        assert_eq!(&row[15..], &["600", "15", "1048576"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_report_still_has_header() {
        let root = scratch_dir("empty");
        let out = root.join("aggregated.csv");
        write_aggregated_report(&out, &[]).expect("write");
        assert_eq!(
            fs::read_to_string(&out).expect("read"),
            format!("{}\n", REPORT_COLUMNS.join(","))
        );
        let _ = fs::remove_dir_all(root);
    }
}
