//! FFprobe wrapper module
//!
//! Container and per-stream facts used to sanity-check rendered variants
//! (duration, size, bitrate, resolution, empty streams).

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use crate::logging::log_external_tool;

#[derive(Debug)]
pub enum ProbeError {
    ToolNotFound(String),
    ExecutionFailed(String),
    ParseError(String),
    IoError(io::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::ToolNotFound(s) => write!(f, "Tool not found: {}", s),
            ProbeError::ExecutionFailed(s) => write!(f, "FFprobe failed: {}", s),
            ProbeError::ParseError(s) => write!(f, "Parse error: {}", s),
            ProbeError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        ProbeError::IoError(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl StreamKind {
    fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            _ => StreamKind::Data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProbe {
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub duration: Option<f64>,
    pub frame_count: Option<u64>,
    pub bit_rate: Option<u64>,
}

impl StreamProbe {
    /// A stream that is present but carries no media.
    pub fn is_zero_length(&self) -> bool {
        match (self.kind, self.duration, self.frame_count) {
            (_, Some(d), _) if d <= 0.0 => true,
            (StreamKind::Video, _, Some(0)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    pub format_name: String,
    pub duration: f64,
    pub size: u64,
    pub bit_rate: u64,
    pub width: u32,
    pub height: u32,
    pub streams: Vec<StreamProbe>,
}

impl MediaProbe {
    pub fn count(&self, kind: StreamKind) -> usize {
        self.streams.iter().filter(|s| s.kind == kind).count()
    }

    pub fn zero_length_streams(&self) -> usize {
        self.streams.iter().filter(|s| s.is_zero_length()).count()
    }
}

pub fn is_ffprobe_available() -> bool {
    which::which("ffprobe").is_ok()
}

pub fn probe_media(path: &Path) -> Result<MediaProbe, ProbeError> {
    if !is_ffprobe_available() {
        return Err(ProbeError::ToolNotFound(
            "ffprobe not found. Install ffmpeg and make sure it is in PATH".to_string(),
        ));
    }

    if !path.is_file() {
        return Err(ProbeError::ExecutionFailed(format!(
            "Not a file: {}",
            path.display()
        )));
    }

    let path_str = path.to_str().ok_or_else(|| {
        ProbeError::ExecutionFailed(format!("Invalid path encoding: {}", path.display()))
    })?;

    let args: Vec<String> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "--",
        path_str,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let start = Instant::now();
    let output = Command::new("ffprobe").args(&args).output()?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    log_external_tool("ffprobe", &args, &stderr, output.status.code(), start.elapsed());

    if !output.status.success() {
        let error_msg = if stderr.trim().is_empty() {
            format!(
                "ffprobe failed to analyze file: {} (exit code: {:?})",
                path.display(),
                output.status.code()
            )
        } else {
            format!("ffprobe error for '{}': {}", path.display(), stderr.trim())
        };
        return Err(ProbeError::ExecutionFailed(error_msg));
    }

    parse_probe_json(&String::from_utf8_lossy(&output.stdout))
}

fn parse_number<T: std::str::FromStr>(value: &serde_json::Value) -> Option<T> {
    match value {
        serde_json::Value::String(s) => s.parse::<T>().ok(),
        serde_json::Value::Number(n) => n.to_string().parse::<T>().ok(),
        _ => None,
    }
}

/// Parse `ffprobe -show_format -show_streams -print_format json` output.
pub fn parse_probe_json(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = &json["format"];
    let format_name = format["format_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let duration = parse_number::<f64>(&format["duration"]).unwrap_or(0.0);
    let size = parse_number::<u64>(&format["size"]).unwrap_or(0);
    let bit_rate = parse_number::<u64>(&format["bit_rate"]).unwrap_or(0);

    let raw_streams = json["streams"]
        .as_array()
        .ok_or_else(|| ProbeError::ParseError("No streams found".to_string()))?;

    let streams: Vec<StreamProbe> = raw_streams
        .iter()
        .enumerate()
        .map(|(i, s)| StreamProbe {
            index: s["index"].as_u64().map(|v| v as u32).unwrap_or(i as u32),
            kind: StreamKind::from_codec_type(s["codec_type"].as_str().unwrap_or("data")),
            codec: s["codec_name"].as_str().unwrap_or("unknown").to_string(),
            duration: parse_number::<f64>(&s["duration"]),
            frame_count: parse_number::<u64>(&s["nb_frames"]),
            bit_rate: parse_number::<u64>(&s["bit_rate"]),
        })
        .collect();

    let video = raw_streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"));
    let width = video.and_then(|v| v["width"].as_u64()).unwrap_or(0) as u32;
    let height = video.and_then(|v| v["height"].as_u64()).unwrap_or(0) as u32;

    Ok(MediaProbe {
        format_name,
        duration,
        size,
        bit_rate,
        width,
        height,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1920, "height": 1080,
             "duration": "10.000000", "nb_frames": "300", "bit_rate": "4000000"},
            {"index": 1, "codec_name": "aac", "codec_type": "audio", "duration": "10.010000", "bit_rate": "128000"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "10.010000",
                   "size": "5200000", "bit_rate": "4156000"}
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let probe = parse_probe_json(SAMPLE).unwrap();
        assert_eq!(probe.width, 1920);
        assert_eq!(probe.height, 1080);
        assert_eq!(probe.size, 5_200_000);
        assert!((probe.duration - 10.01).abs() < 1e-9);
        assert_eq!(probe.count(StreamKind::Video), 1);
        assert_eq!(probe.count(StreamKind::Audio), 1);
        assert_eq!(probe.zero_length_streams(), 0);
    }

    #[test]
    fn test_zero_length_stream_detection() {
        let json = r#"{
            "streams": [
                {"codec_name": "h264", "codec_type": "video", "width": 640, "height": 360, "nb_frames": "0"},
                {"codec_name": "aac", "codec_type": "audio", "duration": "0.000000"}
            ],
            "format": {"duration": "0.0", "size": "1024"}
        }"#;
        let probe = parse_probe_json(json).unwrap();
        assert_eq!(probe.zero_length_streams(), 2);
        assert_eq!(probe.streams[1].index, 1);
    }

    #[test]
    fn test_parse_rejects_missing_streams() {
        assert!(matches!(
            parse_probe_json(r#"{"format": {}}"#),
            Err(ProbeError::ParseError(_))
        ));
        assert!(matches!(parse_probe_json("not json"), Err(ProbeError::ParseError(_))));
    }
}
