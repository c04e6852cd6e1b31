//! ffmpeg stage backend
//!
//! Every stage is one ffmpeg invocation reading the previous artifact and
//! writing a new one into the attempt's work directory:
//!
//! | stage                     | what runs                                  | output |
//! |---------------------------|--------------------------------------------|--------|
//! | audio                     | `-af` chain, video stream-copied           | .mkv   |
//! | color, motion, composite  | `-vf` chain, near-lossless x264, audio copied | .mkv |
//! | encoder                   | stream-copy remux with the rendered args   | .mkv   |
//! | packaging                 | final encode with the run's [`ParameterSet`] | .mp4 |
//!
//! The accelerated variants add `-hwaccel` decode (filter stages) or use the
//! detected hardware encoder (packaging). A stage whose members carry no
//! filter template passes its input through unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use shared_utils::{probe_media, FfmpegFailure, FfmpegRun, GpuAccel, GpuEncoder, GpuType};

use crate::errors::StageError;
use crate::params::{ColorSpaceTag, EncoderParameters, ParameterSet, RateControl};
use crate::quality_gate::{ArtifactMetrics, MetricsProbe};
use crate::stage::{Artifact, ExecutionPath, StageBinding, StageImpl, StageKind, StageProvider, StageRequest};

/// Extra tries for failures ffmpeg reports as transient (EAGAIN, ENOMEM...)
const TRANSIENT_RETRIES: u32 = 1;

/// Quality of the intermediate filter passes; the packaging stage sets the
/// real rate.
const INTERMEDIATE_CRF: &str = "14";

// ═══════════════════════════════════════════════════════════════
// Provider
// ═══════════════════════════════════════════════════════════════

/// Binds each [`StageKind`] to ffmpeg invocations.
#[derive(Debug, Clone)]
pub struct FfmpegStageProvider {
    /// `-threads` for every child process
    threads: usize,
    hwaccel: Option<&'static str>,
    encoder: Option<GpuEncoder>,
}

impl FfmpegStageProvider {
    pub fn cpu_only(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            hwaccel: None,
            encoder: None,
        }
    }

    /// Accelerated variants for whatever `gpu` detected; H.264 preferred so
    /// both paths produce the same codec.
    pub fn from_gpu(gpu: &GpuAccel, threads: usize) -> Self {
        if !gpu.enabled {
            return Self::cpu_only(threads);
        }
        Self {
            threads: threads.max(1),
            hwaccel: gpu.hwaccel,
            encoder: gpu
                .get_h264_encoder()
                .or_else(|| gpu.get_hevc_encoder())
                .cloned(),
        }
    }

    fn stage(&self, step: Step) -> Arc<dyn StageImpl> {
        Arc::new(FfmpegStage {
            step,
            threads: self.threads,
        })
    }
}

impl StageProvider for FfmpegStageProvider {
    fn bind(&self, kind: StageKind) -> StageBinding {
        match kind {
            StageKind::Audio => StageBinding::cpu_only(self.stage(Step::AudioFilter)),
            StageKind::Color | StageKind::Motion | StageKind::Composite => {
                let fallback = self.stage(Step::VideoFilter { hwaccel: None });
                match self.hwaccel {
                    Some(hwaccel) => StageBinding::with_accelerated(
                        self.stage(Step::VideoFilter {
                            hwaccel: Some(hwaccel),
                        }),
                        fallback,
                    ),
                    None => StageBinding::cpu_only(fallback),
                }
            }
            StageKind::Encoder => StageBinding::cpu_only(self.stage(Step::Remux)),
            StageKind::Packaging => {
                let fallback = self.stage(Step::Package { encoder: None });
                match &self.encoder {
                    Some(encoder) => StageBinding::with_accelerated(
                        self.stage(Step::Package {
                            encoder: Some(encoder.clone()),
                        }),
                        fallback,
                    ),
                    None => StageBinding::cpu_only(fallback),
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Stage implementation
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Step {
    AudioFilter,
    VideoFilter { hwaccel: Option<&'static str> },
    Remux,
    Package { encoder: Option<GpuEncoder> },
}

#[derive(Debug)]
struct FfmpegStage {
    step: Step,
    threads: usize,
}

impl FfmpegStage {
    /// Command for this request, `None` when there is nothing to apply.
    fn command(&self, request: &StageRequest<'_>) -> Result<Option<(FfmpegRun, PathBuf)>, StageError> {
        let input = path_arg(request.kind, &request.input.path)?;
        let threads = self.threads.to_string();

        let (run, output) = match &self.step {
            Step::AudioFilter => {
                let filters = rendered(request)?;
                if filters.is_empty() {
                    return Ok(None);
                }
                let output = request.output_path("mkv");
                let run = FfmpegRun::new()
                    .args(["-i", input.as_str()])
                    .args(["-map", "0:v", "-map", "0:a?"])
                    .args(["-af", filters.join(",").as_str()])
                    .args(["-c:v", "copy", "-c:a", "flac"])
                    .args(["-threads", threads.as_str()]);
                (run, output)
            }
            Step::VideoFilter { hwaccel } => {
                let mut filters = rendered(request)?;
                if filters.is_empty() {
                    return Ok(None);
                }
                // crop/pad/scale knobs may leave odd dimensions, x264 4:2:0 needs even
                filters.push("scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string());
                let output = request.output_path("mkv");
                let mut run = FfmpegRun::new();
                if let Some(hwaccel) = hwaccel {
                    run = run.args(["-hwaccel", *hwaccel]);
                }
                let run = run
                    .args(["-i", input.as_str()])
                    .args(["-map", "0:v:0", "-map", "0:a?"])
                    .args(["-vf", filters.join(",").as_str()])
                    .args(["-c:v", "libx264", "-preset", "veryfast", "-crf", INTERMEDIATE_CRF])
                    .args(["-pix_fmt", "yuv420p", "-c:a", "copy"])
                    .args(["-threads", threads.as_str()]);
                (run, output)
            }
            Step::Remux => {
                let remux_args = rendered(request)?;
                let extra: Vec<&str> = remux_args.iter().flat_map(|a| a.split_whitespace()).collect();
                if extra.is_empty() {
                    return Ok(None);
                }
                let output = request.output_path("mkv");
                let run = FfmpegRun::new()
                    .args(["-i", input.as_str()])
                    .args(["-map", "0:v", "-map", "0:a?", "-c", "copy"])
                    .args(extra);
                (run, output)
            }
            Step::Package { encoder } => {
                let output = request.output_path("mp4");
                let params = request.params;
                let run = FfmpegRun::new()
                    .args(["-i", input.as_str()])
                    .args(["-map", "0:v:0", "-map", "0:a?"])
                    .args(video_args(&params.encoder, encoder.as_ref()))
                    .args(color_args(params.encoder.color_space))
                    .args(["-c:a", "aac"])
                    .args(["-ar".to_string(), params.audio.sample_rate.to_string()])
                    .args(["-b:a".to_string(), format!("{}k", params.audio.bitrate_kbps)])
                    .args(["-movflags", "+faststart"])
                    .args(["-threads", threads.as_str()]);
                (run, output)
            }
        };

        let output_arg = path_arg(request.kind, &output)?;
        Ok(Some((run.arg(output_arg), output)))
    }
}

impl StageImpl for FfmpegStage {
    fn apply(&self, request: &StageRequest<'_>) -> Result<Artifact, StageError> {
        let Some((run, output)) = self.command(request)? else {
            debug!(stage = %request.kind, "Nothing to apply, passing input through");
            return Ok(request.input.clone());
        };
        execute(request.kind, &run, request.path())?;
        Ok(request.input.derive(output))
    }
}

// ═══════════════════════════════════════════════════════════════
// Argument builders
// ═══════════════════════════════════════════════════════════════

/// Rendered filter templates of the stage members, in member order.
fn rendered(request: &StageRequest<'_>) -> Result<Vec<String>, StageError> {
    request
        .transformations
        .iter()
        .filter_map(|t| t.filter.as_deref().map(|f| (t.id.as_str(), f)))
        .map(|(id, template)| {
            request
                .params
                .render(template)
                .map_err(|e| StageError::ExecutionFailed {
                    stage: request.kind.to_string(),
                    message: format!("{id}: {e}"),
                })
        })
        .collect()
}

fn video_args(params: &EncoderParameters, encoder: Option<&GpuEncoder>) -> Vec<String> {
    let kbps = params.video_bitrate_kbps;
    let mut args: Vec<String> = Vec::new();

    match encoder {
        Some(encoder) => {
            args.push("-c:v".into());
            args.push(encoder.ffmpeg_name().into());
            args.extend(encoder.get_extra_args().into_iter().map(String::from));
            if encoder.gpu_type == GpuType::Vaapi {
                args.extend(["-vf", "format=nv12,hwupload"].map(String::from));
            }
            // hardware encoders have no capped-crf mode; treat it as vbr
            match params.rate_control {
                RateControl::Cbr => args.extend(cbr(kbps)),
                RateControl::Vbr | RateControl::CappedCrf => args.extend(vbr(kbps)),
            }
        }
        None => {
            args.extend(
                ["-c:v", "libx264", "-preset", "medium", "-pix_fmt", "yuv420p"]
                    .map(String::from),
            );
            args.push("-x264-params".into());
            args.push(format!(
                "scenecut={}:me={}",
                params.scenecut_threshold,
                params.motion_estimation.as_str()
            ));
            match params.rate_control {
                RateControl::Vbr => args.extend(vbr(kbps)),
                RateControl::Cbr => args.extend(cbr(kbps)),
                RateControl::CappedCrf => {
                    args.extend(["-crf", "20"].map(String::from));
                    args.extend([String::from("-maxrate"), format!("{kbps}k")]);
                    args.extend([String::from("-bufsize"), format!("{}k", kbps * 2)]);
                }
            }
        }
    }

    args.extend([String::from("-g"), params.gop_size.to_string()]);
    args
}

fn vbr(kbps: u32) -> [String; 6] {
    [
        "-b:v".into(),
        format!("{kbps}k"),
        "-maxrate".into(),
        format!("{}k", kbps + kbps / 2),
        "-bufsize".into(),
        format!("{}k", kbps * 2),
    ]
}

fn cbr(kbps: u32) -> [String; 8] {
    [
        "-b:v".into(),
        format!("{kbps}k"),
        "-minrate".into(),
        format!("{kbps}k"),
        "-maxrate".into(),
        format!("{kbps}k"),
        "-bufsize".into(),
        format!("{kbps}k"),
    ]
}

/// `-colorspace`, `-color_primaries`, `-color_trc` tags
fn color_args(tag: ColorSpaceTag) -> [&'static str; 6] {
    let (primaries, trc) = match tag {
        ColorSpaceTag::Bt709 => ("bt709", "bt709"),
        ColorSpaceTag::Bt601 => ("smpte170m", "smpte170m"),
        ColorSpaceTag::Bt2020 => ("bt2020", "bt709"),
    };
    [
        "-colorspace",
        tag.as_ffmpeg(),
        "-color_primaries",
        primaries,
        "-color_trc",
        trc,
    ]
}

fn path_arg(kind: StageKind, path: &Path) -> Result<String, StageError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| StageError::ExecutionFailed {
            stage: kind.to_string(),
            message: format!("path is not valid UTF-8: {}", path.display()),
        })
}

// ═══════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════

fn execute(kind: StageKind, run: &FfmpegRun, path: ExecutionPath) -> Result<(), StageError> {
    let mut retries = 0;
    loop {
        match run.execute() {
            Ok(_) => return Ok(()),
            Err(FfmpegFailure::Exit {
                recoverable: true,
                ref message,
                ..
            }) if retries < TRANSIENT_RETRIES => {
                retries += 1;
                warn!(stage = %kind, message = %message, "Transient ffmpeg failure, retrying");
            }
            Err(failure) => return Err(stage_error(kind, failure, path)),
        }
    }
}

/// Map an ffmpeg failure to the stage taxonomy. Device faults only count as
/// such on the accelerated path; on the CPU path they are plain failures.
fn stage_error(kind: StageKind, failure: FfmpegFailure, path: ExecutionPath) -> StageError {
    let stage = kind.to_string();
    match failure {
        FfmpegFailure::Spawn(message) => StageError::ExecutionFailed { stage, message },
        FfmpegFailure::Exit {
            message,
            corrupt_input: true,
            ..
        } => StageError::CorruptInput { stage, message },
        FfmpegFailure::Exit {
            message,
            accelerator_fault: true,
            ..
        } if path == ExecutionPath::Accelerated => StageError::AcceleratorFault { stage, message },
        FfmpegFailure::Exit { message, .. } => StageError::ExecutionFailed { stage, message },
    }
}

// ═══════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════

/// Quality-gate measurements through ffprobe
#[derive(Debug, Default, Clone, Copy)]
pub struct FfprobeMetrics;

impl MetricsProbe for FfprobeMetrics {
    fn measure(&self, artifact: &Artifact) -> Result<ArtifactMetrics, String> {
        probe_media(&artifact.path)
            .map(|probe| ArtifactMetrics::from(&probe))
            .map_err(|e| e.to_string())
    }
}
