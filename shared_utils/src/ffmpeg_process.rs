//! FFmpeg process management - deadlock-free child process handling
//!
//! ## Background
//!
//! When stdout and stderr are both piped but only stdout is read, an ffmpeg
//! run that writes more than the pipe buffer (~64KB) to stderr blocks forever.
//! [`FfmpegProcess`] drains stderr on a dedicated thread.
//!
//! [`FfmpegRun`] is the one-shot form used by stage backends: build the
//! argument list, run to completion, get a typed error with the most useful
//! stderr line on failure.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::logging::log_external_tool;

// ═══════════════════════════════════════════════════════════════
// FfmpegProcess - spawned ffmpeg with stderr drained in the background
// ═══════════════════════════════════════════════════════════════

pub struct FfmpegProcess {
    child: Child,
    stderr_thread: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    /// Spawn the configured command; stdout discarded, stderr piped.
    pub fn spawn(cmd: &mut Command) -> Result<Self> {
        let command_str = format!("{:?}", cmd);
        info!(command = %command_str, "Executing FFmpeg command");

        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = cmd.spawn().context("Failed to spawn FFmpeg process")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture FFmpeg stderr"))?;

        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(std::result::Result::ok) {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        Ok(Self {
            child,
            stderr_thread: Some(stderr_thread),
        })
    }

    /// Wait for exit and collect the drained stderr.
    pub fn wait_with_output(mut self) -> Result<(ExitStatus, String)> {
        let status = self.child.wait().context("Failed to wait for FFmpeg")?;
        let stderr = self
            .stderr_thread
            .take()
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();

        if status.success() {
            debug!(exit_code = status.code(), "FFmpeg process completed successfully");
        } else {
            error!(
                exit_code = status.code(),
                stderr_output = %format_ffmpeg_error(&stderr),
                "FFmpeg process failed"
            );
        }

        Ok((status, stderr))
    }
}

// ═══════════════════════════════════════════════════════════════
// FfmpegRun - one-shot invocation with typed failure
// ═══════════════════════════════════════════════════════════════

/// Failure of a completed (or unspawnable) ffmpeg run
#[derive(Debug, Clone, thiserror::Error)]
pub enum FfmpegFailure {
    #[error("ffmpeg could not be started: {0}")]
    Spawn(String),
    #[error("ffmpeg exited with {exit_code:?}: {message}")]
    Exit {
        exit_code: Option<i32>,
        message: String,
        recoverable: bool,
        /// Input could not be demuxed/decoded at all
        corrupt_input: bool,
        /// Hardware device/session failure
        accelerator_fault: bool,
    },
}

/// Argument-list builder for a single ffmpeg invocation
#[derive(Debug, Clone, Default)]
pub struct FfmpegRun {
    args: Vec<String>,
}

impl FfmpegRun {
    /// Starts with `-hide_banner -nostdin -y`.
    pub fn new() -> Self {
        Self {
            args: vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn as_args(&self) -> &[String] {
        &self.args
    }

    /// Run to completion. Success returns the stderr text.
    pub fn execute(&self) -> std::result::Result<String, FfmpegFailure> {
        let start = Instant::now();
        let mut cmd = Command::new("ffmpeg");
        cmd.args(&self.args);

        let process = FfmpegProcess::spawn(&mut cmd).map_err(|e| FfmpegFailure::Spawn(e.to_string()))?;
        let (status, stderr) = process
            .wait_with_output()
            .map_err(|e| FfmpegFailure::Spawn(e.to_string()))?;

        log_external_tool("ffmpeg", &self.args, &stderr, status.code(), start.elapsed());

        if status.success() {
            Ok(stderr)
        } else {
            Err(FfmpegFailure::Exit {
                exit_code: status.code(),
                message: format_ffmpeg_error(&stderr),
                recoverable: is_recoverable_error(&stderr),
                corrupt_input: is_corrupt_input(&stderr),
                accelerator_fault: is_accelerator_error(&stderr),
            })
        }
    }
}

pub fn is_ffmpeg_available() -> bool {
    which::which("ffmpeg").is_ok()
}

// ═══════════════════════════════════════════════════════════════
// stderr interpretation
// ═══════════════════════════════════════════════════════════════

/// Most meaningful line of ffmpeg stderr.
///
/// 1. last line mentioning "Error"/"error"
/// 2. otherwise the last non-progress, non-empty line
/// 3. otherwise "Unknown FFmpeg error"
pub fn format_ffmpeg_error(stderr: &str) -> String {
    if let Some(error_line) = stderr
        .lines()
        .rev()
        .find(|line| line.contains("Error") || line.contains("error"))
    {
        return error_line.trim().to_string();
    }

    stderr
        .lines()
        .rev()
        .find(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && !trimmed.starts_with("frame=")
                && !trimmed.starts_with("fps=")
                && !trimmed.starts_with("size=")
        })
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "Unknown FFmpeg error".to_string())
}

/// Transient resource failures worth another try
pub fn is_recoverable_error(stderr: &str) -> bool {
    const RECOVERABLE_PATTERNS: [&str; 5] = [
        "Resource temporarily unavailable",
        "Cannot allocate memory",
        "Too many open files",
        "Connection reset",
        "Broken pipe",
    ];
    RECOVERABLE_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

/// Demuxer/decoder refused the input
pub fn is_corrupt_input(stderr: &str) -> bool {
    const CORRUPT_PATTERNS: [&str; 4] = [
        "Invalid data found when processing input",
        "moov atom not found",
        "could not find codec parameters",
        "End of file",
    ];
    CORRUPT_PATTERNS.iter().any(|pattern| stderr.contains(pattern))
}

/// Hardware device/session failures: the CPU path should be tried instead
pub fn is_accelerator_error(stderr: &str) -> bool {
    const ACCEL_PATTERNS: [&str; 6] = [
        "No NVENC capable devices found",
        "OpenEncodeSessionEx failed",
        "Failed to create a VAAPI device",
        "Device creation failed",
        "CUDA_ERROR",
        "Error initializing output stream",
    ];
    ACCEL_PATTERNS.iter().any(|pattern| stderr.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_prefers_error_line() {
        let stderr = "frame=  10\nsomething\n[h264] Error while decoding\nsize=12kB";
        assert_eq!(format_ffmpeg_error(stderr), "[h264] Error while decoding");
    }

    #[test]
    fn test_format_error_skips_progress_lines() {
        let stderr = "Conversion aborted\nframe=  100\nfps=30\n";
        assert_eq!(format_ffmpeg_error(stderr), "Conversion aborted");
    }

    #[test]
    fn test_format_error_empty() {
        assert_eq!(format_ffmpeg_error(""), "Unknown FFmpeg error");
    }

    #[test]
    fn test_is_recoverable_error() {
        assert!(is_recoverable_error("Resource temporarily unavailable"));
        assert!(is_recoverable_error("Cannot allocate memory"));
        assert!(!is_recoverable_error("Invalid input file"));
    }

    #[test]
    fn test_is_corrupt_input() {
        assert!(is_corrupt_input("in.mp4: Invalid data found when processing input"));
        assert!(is_corrupt_input("[mov,mp4] moov atom not found"));
        assert!(!is_corrupt_input("Conversion failed!"));
    }

    #[test]
    fn test_is_accelerator_error() {
        assert!(is_accelerator_error("[hevc_nvenc] OpenEncodeSessionEx failed: out of memory"));
        assert!(!is_accelerator_error("Unknown encoder 'libfoo'"));
    }

    #[test]
    fn test_run_builder_prefix() {
        let run = FfmpegRun::new().arg("-i").arg("in.mp4").args(["-c", "copy"]).arg("out.mp4");
        assert_eq!(
            run.as_args(),
            &["-hide_banner", "-nostdin", "-y", "-i", "in.mp4", "-c", "copy", "out.mp4"]
        );
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any non-empty stderr yields a non-empty message
        #[test]
        fn prop_format_error_non_empty(content in "[a-zA-Z0-9 ]{1,100}") {
            let error = format_ffmpeg_error(&content);
            prop_assert!(!error.is_empty(), "Error message should not be empty");
        }

        /// A line containing "Error" always wins
        #[test]
        fn prop_format_error_prefers_error_line(
            prefix in "[a-zA-Z ]{0,50}",
            suffix in "[a-df-zA-DF-Z ]{0,50}"
        ) {
            let stderr = format!("{}\nError: test error message\n{}", prefix, suffix);
            let error = format_ffmpeg_error(&stderr);
            prop_assert!(error.contains("Error"), "Should contain 'Error', got: {}", error);
        }
    }
}
