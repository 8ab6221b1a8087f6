//! Log filter composition, the rolling file sink and the crash hook.
//!
//! External tool output is logged under dedicated targets. The console keeps
//! those targets quiet unless the user picked a filter explicitly, while the
//! file sink always records them at debug level.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_SUFFIX: &str = "log";

/// Targets carrying raw stderr of the external tools.
pub const TOOL_STDERR_TARGETS: [&str; 2] = ["ffmpeg_stderr", "potrace_stderr"];

const CONSOLE_TOOL_LEVEL: &str = "error";
const FILE_TOOL_LEVEL: &str = "debug";

static PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Server,
    Convert,
}

impl RunMode {
    pub fn log_file_prefix(self) -> &'static str {
        match self {
            Self::Server => "framevec",
            Self::Convert => "framevec-convert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub mode: RunMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Server,
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            env_filter: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// Where the user-facing part of the filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Cli,
    Verbose,
    Env,
    Default,
}

impl FilterSource {
    fn is_explicit(self) -> bool {
        matches!(self, Self::Cli | Self::Verbose)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub source: FilterSource,
    pub base: String,
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// Priority: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
    /// [`DEFAULT_LOG_FILTER`].
    pub fn compose(options: &LoggingOptions) -> Self {
        let (source, base) = if let Some(filter) = options.cli_filter.as_deref() {
            (FilterSource::Cli, filter.to_string())
        } else if options.verbose >= 2 {
            (FilterSource::Verbose, "trace".to_string())
        } else if options.verbose == 1 {
            (FilterSource::Verbose, "debug".to_string())
        } else if let Some(filter) = options.env_filter.as_deref() {
            (FilterSource::Env, filter.to_string())
        } else {
            (FilterSource::Default, DEFAULT_LOG_FILTER.to_string())
        };

        if source.is_explicit() {
            return Self {
                source,
                console: base.clone(),
                file: base.clone(),
                base,
            };
        }

        Self {
            source,
            console: format!("{},{base}", tool_directives(CONSOLE_TOOL_LEVEL)),
            file: format!("{},{base}", tool_directives(FILE_TOOL_LEVEL)),
            base,
        }
    }
}

fn tool_directives(level: &str) -> String {
    TOOL_STDERR_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, thiserror::Error)]
pub enum FileSinkError {
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to initialize rolling file sink: {0}")]
    Appender(#[from] InitError),
}

/// Daily rolling log files under `<data_dir>/logs`.
#[derive(Debug)]
pub struct FileSink {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

impl FileSink {
    pub fn open(
        data_dir: &Path,
        mode: RunMode,
        retention_files: usize,
    ) -> Result<Self, FileSinkError> {
        let retention_files = if retention_files == 0 {
            DEFAULT_LOG_RETENTION_FILES
        } else {
            retention_files
        };

        let log_dir = data_dir.join(LOG_DIR_NAME);
        fs::create_dir_all(&log_dir).map_err(|source| FileSinkError::CreateDir {
            path: log_dir.clone(),
            source,
        })?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(mode.log_file_prefix())
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(retention_files)
            .build(&log_dir)?;

        Ok(Self {
            log_dir,
            retention_files,
            appender,
        })
    }
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookStatus {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create crash directory {}: {source}", path.display())]
pub struct PanicHookError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Chain a hook that writes one crash report per panic into
/// `<data_dir>/logs/crash` before the previous hook runs. Installs once per
/// process.
pub fn install_panic_hook(data_dir: &Path) -> Result<PanicHookStatus, PanicHookError> {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return Ok(PanicHookStatus::AlreadyInstalled(existing.clone()));
    }

    let dir = crash_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|source| PanicHookError {
        path: dir.clone(),
        source,
    })?;

    let _guard = PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return Ok(PanicHookStatus::AlreadyInstalled(existing.clone()));
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(dir.clone());
    Ok(PanicHookStatus::Installed(dir))
}

#[derive(Debug)]
struct CrashReport {
    time: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace_status: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_status, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled",
                "<set RUST_BACKTRACE=1 to capture>".to_string(),
            ),
            _ => ("unsupported", "<unavailable>".to_string()),
        };

        Self {
            time: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_status,
            backtrace,
        }
    }

    fn render(&self) -> String {
        format!(
            "time={}\nthread={}\nlocation={}\npayload={}\nbacktrace_status={}\nbacktrace:\n{}\n",
            self.time.to_rfc3339(),
            self.thread,
            self.location,
            self.payload,
            self.backtrace_status,
            self.backtrace,
        )
    }
}

fn record_crash(dir: &Path, info: &PanicHookInfo<'_>) {
    if CRASH_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(dir, &CrashReport::capture(info))
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: could not write crash report to '{}': {err}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash hook failed while writing to '{}'",
            dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn write_crash_report(dir: &Path, report: &CrashReport) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let sequence = CRASH_REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "panic-{}-{sequence:04}.{LOG_FILE_SUFFIX}",
        report.time.format("%Y%m%dT%H%M%S%.3f")
    ));

    let mut file = fs::File::create(&path)?;
    file.write_all(report.render().as_bytes())?;
    file.flush()?;
    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn sample_report() -> CrashReport {
        CrashReport {
            time: Utc::now(),
            thread: "worker-3".to_string(),
            location: "src/convert.rs:10:5".to_string(),
            payload: "boom".to_string(),
            backtrace_status: "captured",
            backtrace: "frame 0".to_string(),
        }
    }

    #[test]
    fn cli_filter_wins_over_everything() {
        let options = LoggingOptions {
            verbose: 2,
            cli_filter: Some("framevec_core=trace".to_string()),
            env_filter: Some("error".to_string()),
            ..Default::default()
        };

        let filters = LogFilters::compose(&options);
        assert_eq!(filters.source, FilterSource::Cli);
        assert_eq!(filters.console, "framevec_core=trace");
        assert_eq!(filters.file, "framevec_core=trace");
    }

    #[test]
    fn verbosity_maps_to_debug_and_trace() {
        let debug = LoggingOptions {
            verbose: 1,
            env_filter: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingOptions {
            verbose: 3,
            ..Default::default()
        };

        assert_eq!(LogFilters::compose(&debug).console, "debug");
        assert_eq!(LogFilters::compose(&trace).console, "trace");
        assert_eq!(LogFilters::compose(&trace).source, FilterSource::Verbose);
    }

    #[test]
    fn implicit_filters_quiet_tool_output_on_console_only() {
        let options = LoggingOptions {
            env_filter: Some("warn,framevec_core=debug".to_string()),
            ..Default::default()
        };

        let filters = LogFilters::compose(&options);
        assert_eq!(filters.source, FilterSource::Env);
        assert_eq!(
            filters.console,
            "ffmpeg_stderr=error,potrace_stderr=error,warn,framevec_core=debug"
        );
        assert_eq!(
            filters.file,
            "ffmpeg_stderr=debug,potrace_stderr=debug,warn,framevec_core=debug"
        );
    }

    #[test]
    fn default_filter_is_info() {
        let filters = LogFilters::compose(&LoggingOptions::default());
        assert_eq!(filters.source, FilterSource::Default);
        assert_eq!(filters.base, DEFAULT_LOG_FILTER);
        assert!(filters.console.ends_with(",info"));
    }

    #[test]
    fn file_sink_lives_under_data_dir() {
        let data_dir = tempdir().unwrap();

        let sink = FileSink::open(data_dir.path(), RunMode::Server, 0).unwrap();

        assert_eq!(sink.log_dir, data_dir.path().join(LOG_DIR_NAME));
        assert_eq!(sink.retention_files, DEFAULT_LOG_RETENTION_FILES);
        assert!(sink.log_dir.is_dir());
    }

    #[test]
    fn file_sink_fails_when_data_dir_is_a_file() {
        let not_a_dir = NamedTempFile::new().unwrap();

        let err = FileSink::open(not_a_dir.path(), RunMode::Convert, 3).unwrap_err();

        assert!(matches!(err, FileSinkError::CreateDir { .. }));
        assert!(err.to_string().contains("failed to create log directory"));
    }

    #[test]
    fn run_modes_use_distinct_prefixes() {
        assert_ne!(
            RunMode::Server.log_file_prefix(),
            RunMode::Convert.log_file_prefix()
        );
    }

    #[test]
    fn crash_report_is_written_as_key_value_lines() {
        let dir = tempdir().unwrap();

        let path = write_crash_report(dir.path(), &sample_report()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();

        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
        assert!(contents.starts_with("time="));
        assert!(contents.contains("thread=worker-3\n"));
        assert!(contents.contains("location=src/convert.rs:10:5\n"));
        assert!(contents.contains("payload=boom\n"));
        assert!(contents.contains("backtrace_status=captured\n"));
        assert!(contents.contains("backtrace:\nframe 0"));
    }

    #[test]
    fn crash_report_surfaces_unwritable_directory() {
        let file = NamedTempFile::new().unwrap();
        let dir = file.path().join("crash");

        assert!(write_crash_report(&dir, &sample_report()).is_err());
    }

    #[test]
    fn payload_text_handles_str_string_and_other() {
        let as_str: &(dyn Any + Send) = &"static";
        let as_string: &(dyn Any + Send) = &"owned".to_string();
        let other: &(dyn Any + Send) = &7_u8;

        assert_eq!(payload_text(as_str), "static");
        assert_eq!(payload_text(as_string), "owned");
        assert_eq!(payload_text(other), "<non-string panic payload>");
    }
}
