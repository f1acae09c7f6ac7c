use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// Wall-clock budget for a single run before it is killed.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Interval at which both the benchmarked process and the supervisor emit a data point.
pub const DEFAULT_REPORTING_PERIOD_SECS: u64 = 5;

pub const RUN_ID_DELIMITER: char = '#';

pub const BATCH_SIZE_FILE: &str = "batch-size.csv";
pub const TOTAL_SIZE_FILE: &str = "total-size.csv";
pub const BATCH_LATENCY_FILE: &str = "batch-latency.csv";
pub const TOTAL_LATENCY_FILE: &str = "total-latency.csv";
pub const TOTAL_TIME_FILE: &str = "total-time.csv";
pub const MEMORY_FILE: &str = "memory.csv";
pub const SUPERVISION_FILE: &str = "supervision.json";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunIdError {
    #[error("run identifier field '{field}' contains the delimiter '#': {value}")]
    DelimiterInField { field: &'static str, value: String },
    #[error("run identifier field '{field}' contains a path separator: {value}")]
    PathSeparator { field: &'static str, value: String },
    #[error("run identifier field '{field}' is empty")]
    EmptyField { field: &'static str },
    #[error("run identifier '{raw}' has {found} fields, expected 6")]
    FieldCount { raw: String, found: usize },
}

/// Key of one run, doubling as the name of its report directory:
/// `<exec>#<query>#<binding>#<window>#<slide>#<threads>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentifier {
    pub exec_name: String,
    pub query_name: String,
    pub binding: String,
    pub window_size: String,
    pub slide_size: String,
    pub thread_count: String,
}

impl RunIdentifier {
    pub fn new(
        exec_name: impl Into<String>,
        query_name: impl Into<String>,
        binding: impl Into<String>,
        window_size: impl Into<String>,
        slide_size: impl Into<String>,
        thread_count: impl Into<String>,
    ) -> Result<Self, RunIdError> {
        let id = Self {
            exec_name: exec_name.into(),
            query_name: query_name.into(),
            binding: binding.into(),
            window_size: window_size.into(),
            slide_size: slide_size.into(),
            thread_count: thread_count.into(),
        };
        id.validate()?;
        Ok(id)
    }

    fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("exec-name", &self.exec_name),
            ("query-name", &self.query_name),
            ("binding", &self.binding),
            ("window-size", &self.window_size),
            ("slide-size", &self.slide_size),
            ("thread-count", &self.thread_count),
        ]
    }

    fn validate(&self) -> Result<(), RunIdError> {
        for (field, value) in self.fields() {
            if value.is_empty() {
                return Err(RunIdError::EmptyField { field });
            }
            if value.contains(RUN_ID_DELIMITER) {
                return Err(RunIdError::DelimiterInField {
                    field,
                    value: value.to_string(),
                });
            }
            if value.contains('/') || value.contains('\\') {
                return Err(RunIdError::PathSeparator {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> String {
        self.fields()
            .iter()
            .map(|(_, v)| *v)
            .collect::<Vec<_>>()
            .join(RUN_ID_DELIMITER.to_string().as_str())
    }

    /// Strict split into exactly six fields.
    pub fn decode(raw: &str) -> Result<Self, RunIdError> {
        let parts: Vec<&str> = raw.split(RUN_ID_DELIMITER).collect();
        if parts.len() != 6 {
            return Err(RunIdError::FieldCount {
                raw: raw.to_string(),
                found: parts.len(),
            });
        }
        Self::new(parts[0], parts[1], parts[2], parts[3], parts[4], parts[5])
    }
}

impl fmt::Display for RunIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for RunIdentifier {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a temp sibling and renames it over `path`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = tmp_sibling(path);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_identifier_round_trips() {
        let id = RunIdentifier::new("engineA", "q1", "0", "1000", "100", "2").expect("valid id");
        let encoded = id.encode();
        assert_eq!(encoded, "engineA#q1#0#1000#100#2");
        let decoded = RunIdentifier::decode(&encoded).expect("decode");
        assert_eq!(decoded, id);
    }

    #[test]
    fn run_identifier_rejects_delimiter_in_component() {
        let err = RunIdentifier::new("eng#ine", "q1", "0", "1", "1", "1").expect_err("must fail");
        assert_eq!(
            err,
            RunIdError::DelimiterInField {
                field: "exec-name",
                value: "eng#ine".to_string()
            }
        );
    }

    #[test]
    fn run_identifier_decode_is_strict_about_field_count() {
        assert!(matches!(
            RunIdentifier::decode("a#b#c#d#e"),
            Err(RunIdError::FieldCount { found: 5, .. })
        ));
        assert!(matches!(
            RunIdentifier::decode("a#b#c#d#e#f#g"),
            Err(RunIdError::FieldCount { found: 7, .. })
        ));
        assert!(matches!(
            RunIdentifier::new("./bin/engine", "q", "0", "1", "1", "1"),
            Err(RunIdError::PathSeparator { field: "exec-name", .. })
        ));
        assert!(matches!(
            RunIdentifier::decode("a##c#d#e#f"),
            Err(RunIdError::EmptyField { field: "query-name" })
        ));
    }

    #[test]
    fn atomic_write_replaces_previous_content() {
        let root = std::env::temp_dir().join(format!(
            "sbench_core_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("nested").join("out.txt");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1, "temp file must not survive the rename");
        let _ = fs::remove_dir_all(root);
    }
}
