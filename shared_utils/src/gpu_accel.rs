//! GPU acceleration module - hardware encoder and device capability detection
//!
//! ## Supported hardware paths
//!
//! | Platform | HEVC encoder | H.264 encoder | Decode hwaccel |
//! |----------|--------------|---------------|----------------|
//! | NVIDIA | hevc_nvenc | h264_nvenc | cuda |
//! | Apple Silicon | hevc_videotoolbox | h264_videotoolbox | videotoolbox |
//! | Intel QSV | hevc_qsv | h264_qsv | qsv |
//! | AMD AMF | hevc_amf | h264_amf | d3d11va |
//! | VAAPI (Linux) | hevc_vaapi | h264_vaapi | vaapi |
//!
//! Detection only reports what the runtime offers. Slot accounting and
//! availability caching for long-running processes live with the caller.
//!
//! ```no_run
//! use shared_utils::gpu_accel::GpuAccel;
//!
//! let gpu = GpuAccel::detect();
//! if let Some(encoder) = gpu.get_hevc_encoder() {
//!     println!("Using GPU encoder: {}", encoder.ffmpeg_name());
//! }
//! ```

use std::process::Command;
use std::sync::OnceLock;

use crate::logging::execute_external_command;

/// Process-wide detection result
static GPU_ACCEL: OnceLock<GpuAccel> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuType {
    /// NVIDIA GPU (NVENC)
    Nvidia,
    /// Apple Silicon (VideoToolbox)
    Apple,
    /// Intel Quick Sync Video
    IntelQsv,
    /// AMD Advanced Media Framework
    AmdAmf,
    /// VA-API (Linux)
    Vaapi,
    None,
}

impl std::fmt::Display for GpuType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuType::Nvidia => write!(f, "NVIDIA NVENC"),
            GpuType::Apple => write!(f, "Apple VideoToolbox"),
            GpuType::IntelQsv => write!(f, "Intel QSV"),
            GpuType::AmdAmf => write!(f, "AMD AMF"),
            GpuType::Vaapi => write!(f, "VA-API"),
            GpuType::None => write!(f, "None (CPU)"),
        }
    }
}

/// A hardware encoder usable by ffmpeg
#[derive(Debug, Clone)]
pub struct GpuEncoder {
    pub gpu_type: GpuType,
    /// ffmpeg encoder name
    pub name: &'static str,
    /// hevc | h264
    pub codec: &'static str,
    /// Recommended arguments placed after `-c:v <name>`
    pub extra_args: Vec<&'static str>,
}

impl GpuEncoder {
    pub fn ffmpeg_name(&self) -> &'static str {
        self.name
    }

    pub fn get_extra_args(&self) -> Vec<&'static str> {
        self.extra_args.clone()
    }
}

/// Static description of one vendor path
struct VendorSpec {
    gpu_type: GpuType,
    hevc: &'static str,
    h264: &'static str,
    hwaccel: &'static str,
    hevc_args: &'static [&'static str],
    h264_args: &'static [&'static str],
}

static NVENC: VendorSpec = VendorSpec {
    gpu_type: GpuType::Nvidia,
    hevc: "hevc_nvenc",
    h264: "h264_nvenc",
    hwaccel: "cuda",
    hevc_args: &["-preset", "p4", "-tune", "hq", "-profile:v", "main"],
    h264_args: &["-preset", "p4", "-tune", "hq", "-profile:v", "high"],
};

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
static VIDEOTOOLBOX: VendorSpec = VendorSpec {
    gpu_type: GpuType::Apple,
    hevc: "hevc_videotoolbox",
    h264: "h264_videotoolbox",
    hwaccel: "videotoolbox",
    hevc_args: &["-profile:v", "main", "-tag:v", "hvc1"],
    h264_args: &["-profile:v", "high"],
};

static QSV: VendorSpec = VendorSpec {
    gpu_type: GpuType::IntelQsv,
    hevc: "hevc_qsv",
    h264: "h264_qsv",
    hwaccel: "qsv",
    hevc_args: &["-preset", "medium", "-profile:v", "main"],
    h264_args: &["-preset", "medium", "-profile:v", "high"],
};

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
static AMF: VendorSpec = VendorSpec {
    gpu_type: GpuType::AmdAmf,
    hevc: "hevc_amf",
    h264: "h264_amf",
    hwaccel: "d3d11va",
    hevc_args: &["-quality", "quality", "-profile:v", "main"],
    h264_args: &["-quality", "quality", "-profile:v", "high"],
};

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
static VAAPI: VendorSpec = VendorSpec {
    gpu_type: GpuType::Vaapi,
    hevc: "hevc_vaapi",
    h264: "h264_vaapi",
    hwaccel: "vaapi",
    hevc_args: &["-vaapi_device", "/dev/dri/renderD128", "-profile:v", "main"],
    h264_args: &["-vaapi_device", "/dev/dri/renderD128", "-profile:v", "high"],
};

/// Vendor probe order for the current platform.
/// macOS prefers VideoToolbox, everything else NVENC first.
fn vendor_order() -> Vec<&'static VendorSpec> {
    let mut order: Vec<&'static VendorSpec> = Vec::new();
    #[cfg(target_os = "macos")]
    order.push(&VIDEOTOOLBOX);
    order.push(&NVENC);
    order.push(&QSV);
    #[cfg(target_os = "windows")]
    order.push(&AMF);
    #[cfg(target_os = "linux")]
    order.push(&VAAPI);
    order
}

/// What the runtime environment offers on the accelerator side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorCapability {
    pub gpu_type: GpuType,
    pub device_present: bool,
    /// Free device memory when the vendor tooling reports it
    pub memory_free_mb: Option<u64>,
    /// ffmpeg `-hwaccel` name for decode
    pub hwaccel: Option<&'static str>,
}

impl AcceleratorCapability {
    pub fn absent() -> Self {
        Self {
            gpu_type: GpuType::None,
            device_present: false,
            memory_free_mb: None,
            hwaccel: None,
        }
    }
}

/// GPU detection result
#[derive(Debug, Clone)]
pub struct GpuAccel {
    pub gpu_type: GpuType,
    pub hevc_encoder: Option<GpuEncoder>,
    pub h264_encoder: Option<GpuEncoder>,
    pub hwaccel: Option<&'static str>,
    pub memory_free_mb: Option<u64>,
    pub enabled: bool,
}

impl Default for GpuAccel {
    fn default() -> Self {
        Self {
            gpu_type: GpuType::None,
            hevc_encoder: None,
            h264_encoder: None,
            hwaccel: None,
            memory_free_mb: None,
            enabled: false,
        }
    }
}

impl GpuAccel {
    /// Detect once per process and cache.
    pub fn detect() -> &'static GpuAccel {
        GPU_ACCEL.get_or_init(|| {
            let result = Self::detect_fresh();
            if result.enabled {
                tracing::info!(
                    gpu = %result.gpu_type,
                    hevc = result.hevc_encoder.as_ref().map(|e| e.name),
                    h264 = result.h264_encoder.as_ref().map(|e| e.name),
                    memory_free_mb = result.memory_free_mb,
                    "GPU acceleration detected"
                );
            } else {
                tracing::info!("No GPU acceleration available, using CPU paths");
            }
            result
        })
    }

    /// Run detection without touching the process cache.
    pub fn detect_fresh() -> GpuAccel {
        if which::which("ffmpeg").is_err() {
            tracing::warn!("ffmpeg not found in PATH, accelerator detection skipped");
            return GpuAccel::default();
        }

        let encoders = get_available_encoders();
        vendor_order()
            .into_iter()
            .find_map(|spec| Self::try_vendor(spec, &encoders))
            .unwrap_or_default()
    }

    fn try_vendor(spec: &VendorSpec, encoders: &[String]) -> Option<GpuAccel> {
        let has_hevc = encoders.iter().any(|e| e.contains(spec.hevc));
        let has_h264 = encoders.iter().any(|e| e.contains(spec.h264));

        if !has_hevc && !has_h264 {
            return None;
        }

        // listed is not the same as usable: encode one frame to be sure
        let probe_encoder = if has_hevc { spec.hevc } else { spec.h264 };
        if !test_encoder(probe_encoder) {
            tracing::debug!(encoder = probe_encoder, "Encoder listed but not usable");
            return None;
        }

        let memory_free_mb = match spec.gpu_type {
            GpuType::Nvidia => query_nvidia_free_memory(),
            _ => None,
        };

        Some(GpuAccel {
            gpu_type: spec.gpu_type,
            hevc_encoder: has_hevc.then(|| GpuEncoder {
                gpu_type: spec.gpu_type,
                name: spec.hevc,
                codec: "hevc",
                extra_args: spec.hevc_args.to_vec(),
            }),
            h264_encoder: has_h264.then(|| GpuEncoder {
                gpu_type: spec.gpu_type,
                name: spec.h264,
                codec: "h264",
                extra_args: spec.h264_args.to_vec(),
            }),
            hwaccel: Some(spec.hwaccel),
            memory_free_mb,
            enabled: true,
        })
    }

    pub fn get_hevc_encoder(&self) -> Option<&GpuEncoder> {
        if self.enabled {
            self.hevc_encoder.as_ref()
        } else {
            None
        }
    }

    pub fn get_h264_encoder(&self) -> Option<&GpuEncoder> {
        if self.enabled {
            self.h264_encoder.as_ref()
        } else {
            None
        }
    }

    pub fn is_available(&self) -> bool {
        self.enabled
    }

    pub fn capability(&self) -> AcceleratorCapability {
        AcceleratorCapability {
            gpu_type: self.gpu_type,
            device_present: self.enabled,
            memory_free_mb: self.memory_free_mb,
            hwaccel: self.hwaccel,
        }
    }

    pub fn description(&self) -> String {
        if self.enabled {
            format!("{} (Hardware Accelerated)", self.gpu_type)
        } else {
            "CPU (Software Encoding)".to_string()
        }
    }
}

/// Video encoder lines from `ffmpeg -encoders`
fn get_available_encoders() -> Vec<String> {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-encoders")
        .output();

    match output {
        Ok(out) => parse_encoder_listing(&String::from_utf8_lossy(&out.stdout)),
        Err(_) => Vec::new(),
    }
}

fn parse_encoder_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.starts_with(" V"))
        .map(|line| line.to_string())
        .collect()
}

/// Encode a single synthetic frame with `encoder`.
fn test_encoder(encoder: &str) -> bool {
    Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-f")
        .arg("lavfi")
        .arg("-i")
        .arg("nullsrc=s=64x64:d=0.1")
        .arg("-c:v")
        .arg(encoder)
        .arg("-frames:v")
        .arg("1")
        .arg("-f")
        .arg("null")
        .arg("-")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn query_nvidia_free_memory() -> Option<u64> {
    which::which("nvidia-smi").ok()?;
    let args = ["--query-gpu=memory.free", "--format=csv,noheader,nounits"].map(String::from);
    let result = execute_external_command("nvidia-smi", &args).ok()?;
    if !result.success() {
        return None;
    }
    parse_nvidia_memory(&result.stdout)
}

/// First device's free memory (MiB) from `nvidia-smi` csv output.
fn parse_nvidia_memory(stdout: &str) -> Option<u64> {
    stdout.lines().next()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_encoder_listing_keeps_video_lines() {
        let listing = "Encoders:\n V..... = Video\n V....D hevc_nvenc  NVIDIA NVENC hevc encoder\n A....D aac  AAC\n V....D libx264 H.264\n";
        let encoders = parse_encoder_listing(listing);
        assert_eq!(encoders.len(), 3);
        assert!(encoders.iter().any(|e| e.contains("hevc_nvenc")));
        assert!(!encoders.iter().any(|e| e.contains("aac")));
    }

    #[test]
    fn test_parse_nvidia_memory() {
        assert_eq!(parse_nvidia_memory("7842\n1024\n"), Some(7842));
        assert_eq!(parse_nvidia_memory(" 512 \n"), Some(512));
        assert_eq!(parse_nvidia_memory("[N/A]\n"), None);
        assert_eq!(parse_nvidia_memory(""), None);
    }

    #[test]
    fn test_default_is_disabled() {
        let accel = GpuAccel::default();
        assert!(!accel.is_available());
        assert!(accel.get_hevc_encoder().is_none());
        assert_eq!(accel.capability(), AcceleratorCapability::absent());
        assert_eq!(accel.description(), "CPU (Software Encoding)");
    }

    #[test]
    fn test_vendor_order_starts_with_platform_preference() {
        let order = vendor_order();
        #[cfg(target_os = "macos")]
        assert_eq!(order[0].gpu_type, GpuType::Apple);
        #[cfg(not(target_os = "macos"))]
        assert_eq!(order[0].gpu_type, GpuType::Nvidia);
    }

    #[test]
    fn test_gpu_type_display() {
        assert_eq!(GpuType::Nvidia.to_string(), "NVIDIA NVENC");
        assert_eq!(GpuType::None.to_string(), "None (CPU)");
    }
}
