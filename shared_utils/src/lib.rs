//! Shared Utilities for vid_variant tools
//!
//! Infrastructure shared by the variant engine and its command-line front end:
//! - Logging (tracing subscriber with stderr + rolling file layers)
//! - Error categories and unified error reporting
//! - Iteration guard for bounded search loops
//! - Accelerator capability detection (hardware encoders, device memory)
//! - FFmpeg process management (deadlock-free stderr draining)
//! - FFprobe media probing
//! - Worker/thread budgeting for parallel runs

pub mod error_handler;
pub mod ffmpeg_process;
pub mod ffprobe;
pub mod gpu_accel;
pub mod logging;
pub mod thread_manager;
pub mod types;

pub use error_handler::{handle_error, report_error, ErrorAction, ErrorCategory};

pub use ffmpeg_process::{
    format_ffmpeg_error, is_accelerator_error, is_corrupt_input, is_ffmpeg_available,
    is_recoverable_error, FfmpegFailure, FfmpegProcess, FfmpegRun,
};

pub use ffprobe::{is_ffprobe_available, probe_media, MediaProbe, ProbeError, StreamKind, StreamProbe};

pub use gpu_accel::{AcceleratorCapability, GpuAccel, GpuEncoder, GpuType};

pub use thread_manager::{
    get_balanced_thread_config, resolve_worker_count, ThreadAllocation, WorkloadType,
};

pub use types::{IterationError, IterationGuard};
