use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sbench_core::{
    atomic_write_json_pretty, ensure_dir, RunIdentifier, DEFAULT_REPORTING_PERIOD_SECS,
    DEFAULT_TIMEOUT_SECS, MEMORY_FILE, SUPERVISION_FILE,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

pub const DEFAULT_LOG_LEVEL: &str = "info";
const CHILD_LOG_VAR: &str = "RUST_LOG";

/// One fully resolved benchmark execution. Built once per configuration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub id: RunIdentifier,
    pub executable: Executable,
    pub query_name: String,
    pub input_path: PathBuf,
    pub input_kind: String,
    pub window_size: u64,
    pub slide_size: u64,
    pub thread_count: u64,
    pub predicates: Vec<String>,
    pub report_dir: PathBuf,
}

/// Program to spawn plus any arguments that precede the benchmark argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl RunSpec {
    /// `[window, slide, input-kind, input-path, report-path, query, predicate-count, predicate...]`
    pub fn argv(&self) -> Vec<String> {
        let mut args = vec![
            self.window_size.to_string(),
            self.slide_size.to_string(),
            self.input_kind.clone(),
            self.input_path.to_string_lossy().to_string(),
            self.report_dir.to_string_lossy().to_string(),
            self.query_name.clone(),
            self.predicates.len().to_string(),
        ];
        args.extend(self.predicates.iter().cloned());
        args
    }

    pub fn command_line(&self) -> Vec<String> {
        let mut parts = vec![self.executable.program.clone()];
        parts.extend(self.executable.leading_args.iter().cloned());
        parts.extend(self.argv());
        parts
    }

    pub fn command(&self, env: &LaunchEnv, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.executable.program);
        cmd.args(&self.executable.leading_args);
        cmd.args(self.argv());
        cmd.current_dir(working_dir);
        cmd.stdin(Stdio::null());
        env.apply(&mut cmd);
        cmd
    }
}

/// Environment handed to every child: the harness's own environment plus named overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    pub base: BTreeMap<OsString, OsString>,
    pub overrides: BTreeMap<OsString, OsString>,
}

impl LaunchEnv {
    pub fn inherited(log_level: &str) -> Self {
        Self {
            base: std::env::vars_os().collect(),
            overrides: BTreeMap::new(),
        }
        .with_override(CHILD_LOG_VAR, log_level)
    }

    pub fn with_override(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    pub fn resolved(&self) -> BTreeMap<OsString, OsString> {
        let mut out = self.base.clone();
        for (k, v) in &self.overrides {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.resolved());
    }
}

#[derive(Debug, Clone)]
pub struct BenchPlan {
    pub config_path: PathBuf,
    pub project_base: PathBuf,
    pub dataset: PathBuf,
    pub report_folder: PathBuf,
    pub input_kind: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub log_level: String,
    pub runs: Vec<RunSpec>,
}

impl BenchPlan {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
        }
    }

    pub fn launch_env(&self) -> LaunchEnv {
        LaunchEnv::inherited(&self.log_level)
    }
}

struct GlobalSettings {
    project_base: PathBuf,
    dataset: PathBuf,
    report_folder: PathBuf,
    input_kind: String,
    launcher: Vec<String>,
}

pub fn load_plan(path: &Path) -> Result<BenchPlan> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse configuration {}", path.display()))?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let config_dir = std::env::current_dir()?.join(path.parent().unwrap_or(Path::new("")));
    let mut plan = plan_from_value(&json_value, &config_dir)?;
    plan.config_path = path.to_path_buf();
    Ok(plan)
}

pub fn plan_from_value(json_value: &Value, config_dir: &Path) -> Result<BenchPlan> {
    validate_required_fields(json_value)?;

    let project_base = required_str(json_value, "/project-base")?;
    let project_base = normalize_path(&config_dir.join(project_base));
    let launcher = match json_value.pointer("/launcher") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => string_list(v, "/launcher")?,
    };
    let settings = GlobalSettings {
        dataset: project_base.join(required_str(json_value, "/dataset")?),
        report_folder: project_base.join(required_str(json_value, "/report-folder")?),
        input_kind: required_str(json_value, "/input-type")?.to_string(),
        launcher,
        project_base,
    };
    let timeout = Duration::from_secs(required_u64(json_value, "/timeout")?);
    let poll_interval = Duration::from_secs(
        optional_u64(json_value, "/poll-interval")?.unwrap_or(DEFAULT_REPORTING_PERIOD_SECS),
    );
    if poll_interval.is_zero() {
        return Err(anyhow!("/poll-interval must be at least 1 second"));
    }
    let log_level = optional_str(json_value, "/log-level")?
        .unwrap_or(DEFAULT_LOG_LEVEL)
        .to_string();

    let entries = json_value
        .pointer("/runs")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("/runs must be a list"))?;
    let mut runs = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let spec = build_run_spec(entry, &settings)
            .with_context(|| format!("invalid run entry /runs/{}", idx))?;
        runs.push(spec);
    }

    Ok(BenchPlan {
        config_path: PathBuf::new(),
        project_base: settings.project_base,
        dataset: settings.dataset,
        report_folder: settings.report_folder,
        input_kind: settings.input_kind,
        timeout,
        poll_interval,
        log_level,
        runs,
    })
}

fn build_run_spec(entry: &Value, settings: &GlobalSettings) -> Result<RunSpec> {
    let query_name = required_str(entry, "/query-name")?.to_string();
    let exec_name = required_str(entry, "/exec-name")?.to_string();
    let index = required_u64(entry, "/index")?;
    let window_size = required_u64(entry, "/window-size")?;
    let slide_size = required_u64(entry, "/slide-size")?;
    let thread_count = optional_u64(entry, "/thread-count")?.unwrap_or(1);
    let predicates = string_list(
        entry
            .pointer("/predicates")
            .ok_or_else(|| anyhow!("missing /predicates"))?,
        "/predicates",
    )?;

    let exec_label = Path::new(&exec_name)
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("/exec-name has no file name: {}", exec_name))?;
    let id = RunIdentifier::new(
        exec_label,
        query_name.as_str(),
        index.to_string(),
        window_size.to_string(),
        slide_size.to_string(),
        thread_count.to_string(),
    )?;
    let report_dir = settings.report_folder.join(id.encode());
    let executable = resolve_executable(&exec_name, &settings.launcher, &settings.project_base);

    Ok(RunSpec {
        id,
        executable,
        query_name,
        input_path: settings.dataset.clone(),
        input_kind: settings.input_kind.clone(),
        window_size,
        slide_size,
        thread_count,
        predicates,
        report_dir,
    })
}

fn resolve_executable(exec_name: &str, launcher: &[String], project_base: &Path) -> Executable {
    if let Some((program, rest)) = launcher.split_first() {
        let mut leading_args = rest.to_vec();
        leading_args.push(exec_name.to_string());
        return Executable {
            program: program.clone(),
            leading_args,
        };
    }
    let p = Path::new(exec_name);
    let program = if p.is_relative() && exec_name_looks_like_path(exec_name) {
        normalize_path(&project_base.join(p))
            .to_string_lossy()
            .to_string()
    } else {
        exec_name.to_string()
    };
    Executable {
        program,
        leading_args: Vec::new(),
    }
}

fn exec_name_looks_like_path(part: &str) -> bool {
    part.starts_with('.') || part.contains('/')
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required_globals: &[&str] = &[
        "/dataset",
        "/report-folder",
        "/timeout",
        "/project-base",
        "/input-type",
        "/runs",
    ];
    let required_per_run: &[&str] = &[
        "/query-name",
        "/index",
        "/exec-name",
        "/predicates",
        "/window-size",
        "/slide-size",
    ];
    let mut missing: Vec<String> = Vec::new();
    for pointer in required_globals {
        if is_missing(json_value.pointer(pointer)) {
            missing.push(pointer.to_string());
        }
    }
    if let Some(runs) = json_value.pointer("/runs").and_then(|v| v.as_array()) {
        for (idx, entry) in runs.iter().enumerate() {
            for pointer in required_per_run {
                if is_missing(entry.pointer(pointer)) {
                    missing.push(format!("/runs/{}{}", idx, pointer));
                }
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "configuration missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn required_str<'a>(value: &'a Value, pointer: &str) -> Result<&'a str> {
    value
        .pointer(pointer)
        .ok_or_else(|| anyhow!("missing {}", pointer))?
        .as_str()
        .ok_or_else(|| anyhow!("{} must be a string", pointer))
}

fn optional_str<'a>(value: &'a Value, pointer: &str) -> Result<Option<&'a str>> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a string", pointer)),
    }
}

fn required_u64(value: &Value, pointer: &str) -> Result<u64> {
    optional_u64(value, pointer)?.ok_or_else(|| anyhow!("missing {}", pointer))
}

fn optional_u64(value: &Value, pointer: &str) -> Result<Option<u64>> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be an unsigned integer (found {})", pointer, v)),
    }
}

fn string_list(value: &Value, pointer: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("{} must be a list of strings", pointer))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("{} must be a list of strings (found {})", pointer, v))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_REPORTING_PERIOD_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Source of resident-memory samples for a running child.
pub trait MemorySampler {
    /// Resident set size in bytes, or `None` when the process can no longer be observed.
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryReadings {
    samples: Vec<u64>,
}

impl MemoryReadings {
    pub fn push(&mut self, bytes: u64) {
        self.samples.push(bytes);
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `None` when the child exited before the first poll.
    pub fn peak(&self) -> Option<u64> {
        self.samples.iter().copied().max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited { code: Option<i32> },
    TimedOut,
}

impl RunOutcome {
    fn from_status(status: ExitStatus) -> Self {
        RunOutcome::Exited {
            code: status.code(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Exited { .. } => "exited",
            RunOutcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervision {
    pub pid: u32,
    pub outcome: RunOutcome,
    pub readings: MemoryReadings,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Spawns `command` and polls it until it exits or the timeout forces a kill.
///
/// Each tick sleeps one poll interval, then samples memory if the child is still
/// alive. Once the elapsed time exceeds the timeout the child gets SIGKILL, is
/// reaped, and the loop waits one more interval so the runtime can release its
/// memory before the next run starts.
pub fn supervise<P: MemorySampler>(
    mut command: Command,
    config: &SupervisorConfig,
    sampler: &mut P,
) -> Result<Supervision> {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", command.get_program()))?;
    let pid = child.id();
    let mut readings = MemoryReadings::default();

    let outcome = loop {
        thread::sleep(config.poll_interval);

        let status = child.try_wait()?;
        if status.is_none() {
            match sampler.resident_bytes(pid) {
                Some(bytes) => {
                    debug!(pid, bytes, "memory sample");
                    readings.push(bytes);
                }
                None => debug!(pid, "process already terminated, sample skipped"),
            }
        }
        if let Some(status) = status {
            break RunOutcome::from_status(status);
        }

        if start.elapsed() > config.timeout {
            warn!(pid, timeout_secs = config.timeout.as_secs_f64(), "killing after timeout");
            if let Err(err) = child.kill() {
                warn!(pid, error = %err, "kill failed");
            }
            if let Err(err) = child.wait() {
                warn!(pid, error = %err, "reaping killed child failed");
            }
            thread::sleep(config.poll_interval);
            break RunOutcome::TimedOut;
        }
    };

    Ok(Supervision {
        pid,
        outcome,
        readings,
        elapsed: start.elapsed(),
        started_at,
        finished_at: Utc::now(),
    })
}

/// Writes `memory.csv` (header `max`, one value row), replacing earlier content.
pub fn write_memory_report(report_dir: &Path, peak: Option<u64>) -> Result<PathBuf> {
    ensure_dir(report_dir)?;
    let path = report_dir.join(MEMORY_FILE);
    let value = match peak {
        Some(bytes) => bytes,
        None => {
            warn!(
                report_dir = %report_dir.display(),
                "no memory samples collected, recording 0"
            );
            0
        }
    };
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["max"])?;
    writer.write_record([value.to_string()])?;
    writer.flush()?;
    Ok(path)
}

fn write_supervision_record(spec: &RunSpec, supervision: &Supervision) -> Result<()> {
    let exit_code = match supervision.outcome {
        RunOutcome::Exited { code } => code,
        RunOutcome::TimedOut => None,
    };
    let payload = json!({
        "schema_version": "supervision_v1",
        "run_id": spec.id.encode(),
        "command": spec.command_line(),
        "pid": supervision.pid,
        "outcome": supervision.outcome.as_str(),
        "exit_code": exit_code,
        "elapsed_secs": supervision.elapsed.as_secs_f64(),
        "memory_samples": supervision.readings.len(),
        "peak_memory_bytes": supervision.readings.peak(),
        "started_at": supervision.started_at.to_rfc3339(),
        "finished_at": supervision.finished_at.to_rfc3339(),
    });
    atomic_write_json_pretty(&spec.report_dir.join(SUPERVISION_FILE), &payload)
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub id: RunIdentifier,
    pub report_dir: PathBuf,
    pub outcome: RunOutcome,
    pub peak_memory: Option<u64>,
    pub elapsed: Duration,
}

pub fn execute_run<P: MemorySampler>(
    spec: &RunSpec,
    plan: &BenchPlan,
    env: &LaunchEnv,
    sampler: &mut P,
) -> Result<RunResult> {
    info!(run_id = %spec.id, command = ?spec.command_line(), "starting run");
    let command = spec.command(env, &plan.project_base);
    let supervision = supervise(command, &plan.supervisor_config(), sampler)
        .with_context(|| format!("run {} failed", spec.id))?;
    let peak = supervision.readings.peak();
    write_memory_report(&spec.report_dir, peak)?;
    write_supervision_record(spec, &supervision)?;
    info!(
        run_id = %spec.id,
        outcome = supervision.outcome.as_str(),
        peak_memory_bytes = peak.unwrap_or(0),
        elapsed_secs = supervision.elapsed.as_secs_f64(),
        "run finished"
    );
    Ok(RunResult {
        id: spec.id.clone(),
        report_dir: spec.report_dir.clone(),
        outcome: supervision.outcome,
        peak_memory: peak,
        elapsed: supervision.elapsed,
    })
}

/// Executes every run of the plan, one at a time. The first failure halts the batch.
pub fn run_plan(plan: &BenchPlan) -> Result<Vec<RunResult>> {
    let env = plan.launch_env();
    let mut sampler = SysinfoSampler::new();
    let mut results = Vec::with_capacity(plan.runs.len());
    for spec in &plan.runs {
        results.push(execute_run(spec, plan, &env, &mut sampler)?);
    }
    info!(runs = results.len(), "all runs completed");
    Ok(results)
}
