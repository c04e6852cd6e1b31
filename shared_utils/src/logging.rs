//! Logging Module - unified logging system
//!
//! Builds on the `tracing` framework:
//! - stderr output for interactive use
//! - daily-rolling log file in a configurable directory (system temp by default)
//! - pruning of old log files
//! - structured records of external tool invocations (ffmpeg, ffprobe, nvidia-smi)
//!
//! # Examples
//!
//! ```no_run
//! use shared_utils::logging::{LogConfig, init_logging};
//! use tracing::info;
//!
//! let config = LogConfig::default();
//! init_logging("vid_variant", config).expect("Failed to initialize logging");
//!
//! info!(run_index = 3, "Run committed");
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files (system temp dir by default)
    pub log_dir: PathBuf,
    /// Number of log files kept after pruning
    pub max_files: usize,
    /// Level applied to the workspace crates when `RUST_LOG` is unset
    pub level: Level,
    /// Emit the file layer as JSON lines instead of plain text
    pub json_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            max_files: 5,
            level: Level::INFO,
            json_file: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_json_file(mut self, json: bool) -> Self {
        self.json_file = json;
        self
    }
}

/// Default filter directive: the program itself plus `shared_utils` at `level`.
fn default_directive(program_name: &str, level: Level) -> String {
    format!("{}={},shared_utils={}", program_name, level, level)
}

/// Initialize the global subscriber.
///
/// Log file name: `{program_name}.log` (with the date suffix appended by the
/// rolling appender). May only be called once per process.
pub fn init_logging(program_name: &str, config: LogConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

    let log_file_name = format!("{}.log", program_name);
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &log_file_name);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(program_name, config.level)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_line_number(false);

    let registry = tracing_subscriber::registry().with(env_filter).with(stderr_layer);

    if config.json_file {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_thread_ids(true),
            )
            .try_init()
            .context("Global tracing subscriber already installed")?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()
            .context("Global tracing subscriber already installed")?;
    }

    tracing::info!(
        program = program_name,
        log_dir = ?config.log_dir,
        log_file = log_file_name,
        max_files = config.max_files,
        level = ?config.level,
        "Logging system initialized"
    );

    cleanup_old_logs(&config.log_dir, program_name, config.max_files)?;

    Ok(())
}

/// Keep only the newest `max_files` log files belonging to `program_name`.
fn cleanup_old_logs(log_dir: &Path, program_name: &str, max_files: usize) -> Result<()> {
    let prefix = format!("{program_name}.log");
    let mut owned: Vec<(SystemTime, PathBuf)> = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory: {:?}", log_dir))?
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|entry| {
            let meta = entry.metadata().ok().filter(|m| m.is_file())?;
            Some((meta.modified().ok()?, entry.path()))
        })
        .collect();

    if owned.len() <= max_files {
        return Ok(());
    }
    owned.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in owned.drain(max_files..) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = ?path, error = %e, "Failed to prune log file");
        } else {
            tracing::debug!(path = ?path, "Pruned log file");
        }
    }
    Ok(())
}

/// Record one external tool invocation (ffmpeg, ffprobe, nvidia-smi).
///
/// Successful runs log at debug with the output at trace; failures log at
/// error with the output attached.
pub fn log_external_tool(
    tool_name: &str,
    args: &[String],
    output: &str,
    exit_code: Option<i32>,
    duration: Duration,
) {
    let command = format!("{} {}", tool_name, args.join(" "));
    let elapsed = duration.as_secs_f64();

    if exit_code == Some(0) {
        tracing::debug!(tool = tool_name, %command, elapsed, "External tool finished");
        tracing::trace!(tool = tool_name, %output, "External tool output");
        return;
    }

    let status = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    tracing::error!(tool = tool_name, %command, elapsed, %status, %output, "External tool failed");
}

/// Captured output of a short-lived external command
#[derive(Debug)]
pub struct ExternalCommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExternalCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a short-lived external command, capture its output and log it.
///
/// Spawn failures (tool missing) are errors; non-zero exits are returned in
/// the result for the caller to interpret.
pub fn execute_external_command(tool_name: &str, args: &[String]) -> Result<ExternalCommandResult> {
    use std::process::Command;

    let start_time = std::time::Instant::now();
    let output = Command::new(tool_name)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute command: {} {}", tool_name, args.join(" ")))?;
    let duration = start_time.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();

    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (false, true) => stdout.clone(),
        _ => stderr.clone(),
    };
    log_external_tool(tool_name, args, &combined, exit_code, duration);

    Ok(ExternalCommandResult {
        exit_code,
        stdout,
        stderr,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.max_files, 5);
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_file);
    }

    #[test]
    fn test_log_config_builder() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig::new()
            .with_log_dir(temp_dir.path())
            .with_max_files(3)
            .with_level(Level::DEBUG)
            .with_json_file(true);

        assert_eq!(config.log_dir, temp_dir.path());
        assert_eq!(config.max_files, 3);
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json_file);
    }

    #[test]
    fn test_default_directive_covers_shared_utils() {
        let directive = default_directive("vid_variant", Level::DEBUG);
        assert_eq!(directive, "vid_variant=DEBUG,shared_utils=DEBUG");
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let program_name = "test_program";

        for i in 0..10 {
            let file_path = temp_dir.path().join(format!("{}.log.{}", program_name, i));
            fs::write(&file_path, format!("log content {}", i)).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        cleanup_old_logs(temp_dir.path(), program_name, 3).unwrap();

        let remaining: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(program_name))
            .collect();
        assert_eq!(remaining.len(), 3);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_execute_external_command_missing_tool() {
        let result = execute_external_command("nonexistent_command_xyz", &["arg1".to_string()]);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_external_command_success() {
        let result = execute_external_command("echo", &["hello".to_string()]).unwrap();
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }
}
