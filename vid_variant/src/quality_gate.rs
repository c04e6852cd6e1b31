//! Quality gate: ordered post-execution checks on a rendered variant
//!
//! Checks run in configured order and stop at the first failure; the
//! rejection names that check. Output and source metrics are measured at most
//! once per evaluation and only if some check needs them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shared_utils::{MediaProbe, StreamKind};
use tracing::{debug, info};

use crate::errors::QualityRejection;
use crate::pipeline::PipelineManifest;
use crate::stage::Artifact;

/// Container facts the checks look at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetrics {
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub bit_rate: u64,
    pub width: u32,
    pub height: u32,
    pub video_streams: usize,
    pub audio_streams: usize,
    pub zero_length_streams: usize,
}

impl From<&MediaProbe> for ArtifactMetrics {
    fn from(probe: &MediaProbe) -> Self {
        Self {
            duration_secs: probe.duration,
            size_bytes: probe.size,
            bit_rate: probe.bit_rate,
            width: probe.width,
            height: probe.height,
            video_streams: probe.count(StreamKind::Video),
            audio_streams: probe.count(StreamKind::Audio),
            zero_length_streams: probe.zero_length_streams(),
        }
    }
}

pub trait MetricsProbe: Send + Sync {
    fn measure(&self, artifact: &Artifact) -> Result<ArtifactMetrics, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum QualityCheck {
    /// |out - src| <= max(src * pct / 100, secs), and out > 0
    DurationWithinTolerance {
        tolerance_pct: f64,
        #[serde(default)]
        tolerance_secs: f64,
    },
    /// Absolute floor, and ceiling as a ratio of the source size
    SizeWithinBounds { min_bytes: u64, max_ratio: f64 },
    NoZeroLengthStreams,
    BitrateWithinBounds { min_kbps: u64, max_kbps: u64 },
    ResolutionPreserved { tolerance_pct: f64 },
    /// Every planned transformation was applied by a completed stage
    ManifestComplete,
}

impl QualityCheck {
    pub fn name(&self) -> &'static str {
        match self {
            QualityCheck::DurationWithinTolerance { .. } => "duration_within_tolerance",
            QualityCheck::SizeWithinBounds { .. } => "size_within_bounds",
            QualityCheck::NoZeroLengthStreams => "no_zero_length_streams",
            QualityCheck::BitrateWithinBounds { .. } => "bitrate_within_bounds",
            QualityCheck::ResolutionPreserved { .. } => "resolution_preserved",
            QualityCheck::ManifestComplete => "manifest_complete",
        }
    }

    /// Default gate: duration, size, stream sanity, manifest completeness.
    pub fn defaults() -> Vec<QualityCheck> {
        vec![
            QualityCheck::ManifestComplete,
            QualityCheck::DurationWithinTolerance {
                tolerance_pct: 2.0,
                tolerance_secs: 0.5,
            },
            QualityCheck::SizeWithinBounds {
                min_bytes: 1024,
                max_ratio: 4.0,
            },
            QualityCheck::NoZeroLengthStreams,
        ]
    }

    fn check(&self, ctx: &mut GateContext<'_>) -> Result<(), String> {
        match *self {
            QualityCheck::DurationWithinTolerance {
                tolerance_pct,
                tolerance_secs,
            } => {
                let out = ctx.output()?.duration_secs;
                let src = ctx.source()?.duration_secs;
                if out <= 0.0 {
                    return Err("output duration is zero".into());
                }
                let allowed = (src * tolerance_pct / 100.0).max(tolerance_secs);
                let drift = (out - src).abs();
                if drift > allowed {
                    return Err(format!(
                        "duration {:.3}s vs source {:.3}s (drift {:.3}s > {:.3}s)",
                        out, src, drift, allowed
                    ));
                }
                Ok(())
            }
            QualityCheck::SizeWithinBounds {
                min_bytes,
                max_ratio,
            } => {
                let out = ctx.output()?.size_bytes;
                if out < min_bytes {
                    return Err(format!("output is {} bytes, minimum {}", out, min_bytes));
                }
                let src = ctx.source()?.size_bytes;
                if src > 0 && out as f64 > src as f64 * max_ratio {
                    return Err(format!(
                        "output is {} bytes, more than {:.2}x source ({} bytes)",
                        out, max_ratio, src
                    ));
                }
                Ok(())
            }
            QualityCheck::NoZeroLengthStreams => {
                let out = ctx.output()?;
                if out.video_streams + out.audio_streams == 0 {
                    return Err("output has no audio or video streams".into());
                }
                if out.zero_length_streams > 0 {
                    return Err(format!("{} zero-length stream(s)", out.zero_length_streams));
                }
                Ok(())
            }
            QualityCheck::BitrateWithinBounds { min_kbps, max_kbps } => {
                let kbps = ctx.output()?.bit_rate / 1000;
                if kbps < min_kbps || kbps > max_kbps {
                    return Err(format!(
                        "bitrate {} kbps outside [{}, {}]",
                        kbps, min_kbps, max_kbps
                    ));
                }
                Ok(())
            }
            QualityCheck::ResolutionPreserved { tolerance_pct } => {
                let out = ctx.output()?.clone();
                let src = ctx.source()?;
                let off = |o: u32, s: u32| -> f64 {
                    if s == 0 {
                        0.0
                    } else {
                        (o as f64 - s as f64).abs() / s as f64 * 100.0
                    }
                };
                let worst = off(out.width, src.width).max(off(out.height, src.height));
                if worst > tolerance_pct {
                    return Err(format!(
                        "resolution {}x{} vs source {}x{} ({:.1}% > {:.1}%)",
                        out.width, out.height, src.width, src.height, worst, tolerance_pct
                    ));
                }
                Ok(())
            }
            QualityCheck::ManifestComplete => {
                let applied = ctx.manifest.applied_transformations();
                let missing: Vec<&str> = ctx
                    .manifest
                    .planned
                    .iter()
                    .map(String::as_str)
                    .filter(|id| !applied.contains(id))
                    .collect();
                if !missing.is_empty() {
                    return Err(format!("planned but not applied: {:?}", missing));
                }
                Ok(())
            }
        }
    }
}

/// Lazily measured metrics of one artifact
struct Lazy<'a> {
    probe: &'a dyn MetricsProbe,
    artifact: Artifact,
    value: Option<Result<ArtifactMetrics, String>>,
}

impl Lazy<'_> {
    fn get(&mut self, label: &str) -> Result<&ArtifactMetrics, String> {
        if self.value.is_none() {
            debug!(artifact = %self.artifact.path.display(), label, "Measuring artifact");
            self.value = Some(self.probe.measure(&self.artifact));
        }
        match self.value.as_ref() {
            Some(Ok(m)) => Ok(m),
            Some(Err(e)) => Err(format!("{} metrics unavailable: {}", label, e)),
            None => Err(format!("{} metrics unavailable", label)),
        }
    }
}

struct GateContext<'a> {
    manifest: &'a PipelineManifest,
    output: Lazy<'a>,
    source: Lazy<'a>,
}

impl GateContext<'_> {
    fn output(&mut self) -> Result<&ArtifactMetrics, String> {
        self.output.get("output")
    }

    fn source(&mut self) -> Result<&ArtifactMetrics, String> {
        self.source.get("source")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(QualityRejection),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

#[derive(Clone)]
pub struct QualityGate {
    checks: Vec<QualityCheck>,
    probe: Arc<dyn MetricsProbe>,
}

impl QualityGate {
    pub fn new(checks: Vec<QualityCheck>, probe: Arc<dyn MetricsProbe>) -> Self {
        Self { checks, probe }
    }

    pub fn checks(&self) -> &[QualityCheck] {
        &self.checks
    }

    /// Judge `artifact` against the source recorded in `manifest`.
    pub fn evaluate(&self, manifest: &PipelineManifest, artifact: &Artifact) -> Verdict {
        let mut ctx = GateContext {
            manifest,
            output: Lazy {
                probe: self.probe.as_ref(),
                artifact: artifact.clone(),
                value: None,
            },
            source: Lazy {
                probe: self.probe.as_ref(),
                artifact: Artifact::source(&manifest.source),
                value: None,
            },
        };

        for check in &self.checks {
            if let Err(reason) = check.check(&mut ctx) {
                let rejection = QualityRejection::new(check.name(), reason);
                info!(run_id = %manifest.run_id, rejection = %rejection, "Quality gate rejected variant");
                return Verdict::Reject(rejection);
            }
        }
        debug!(run_id = %manifest.run_id, checks = self.checks.len(), "Quality gate accepted variant");
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{derive, ValidatedBounds};
    use crate::pipeline::StageRecord;
    use crate::selector::SelectionPlan;
    use crate::stage::{ExecutionPath, StageKind};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metrics(duration: f64, size: u64) -> ArtifactMetrics {
        ArtifactMetrics {
            duration_secs: duration,
            size_bytes: size,
            bit_rate: 4_000_000,
            width: 1920,
            height: 1080,
            video_streams: 1,
            audio_streams: 1,
            zero_length_streams: 0,
        }
    }

    /// Metrics by path, counting measurements.
    struct Table {
        by_path: HashMap<PathBuf, ArtifactMetrics>,
        calls: AtomicUsize,
    }

    impl Table {
        fn new(source: ArtifactMetrics, output: ArtifactMetrics) -> Arc<Self> {
            let mut by_path = HashMap::new();
            by_path.insert(PathBuf::from("/in.mp4"), source);
            by_path.insert(PathBuf::from("/out.mp4"), output);
            Arc::new(Self {
                by_path,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl MetricsProbe for Table {
        fn measure(&self, artifact: &Artifact) -> Result<ArtifactMetrics, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.by_path
                .get(&artifact.path)
                .cloned()
                .ok_or_else(|| "no such file".to_string())
        }
    }

    fn manifest(applied: &[&str], planned: &[&str]) -> PipelineManifest {
        let plan = SelectionPlan {
            seed: 3,
            run_index: 0,
            ledger_version: 0,
            transformations: planned.iter().map(|s| s.to_string()).collect(),
            missing_categories: vec![],
            draws: 0,
            params: derive(3, &ValidatedBounds::default()),
        };
        let mut m = PipelineManifest::new(&plan, &Artifact::source("/in.mp4"), 1);
        m.stages.push(StageRecord {
            index: 0,
            kind: StageKind::Color,
            transformations: applied.iter().map(|s| s.to_string()).collect(),
            path: ExecutionPath::Fallback,
            fallback_reason: None,
            device_slot: None,
            started_ms: 0,
            elapsed_ms: 1,
            output: None,
            error: None,
        });
        m
    }

    fn out() -> Artifact {
        Artifact::source("/in.mp4").derive("/out.mp4")
    }

    #[test]
    fn test_accepts_good_output() {
        let probe = Table::new(metrics(10.0, 5_000_000), metrics(10.1, 4_800_000));
        let gate = QualityGate::new(QualityCheck::defaults(), probe.clone());
        assert_eq!(gate.evaluate(&manifest(&["a"], &["a"]), &out()), Verdict::Accept);
        // one measurement each for output and source
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_duration_rejected_by_named_check() {
        let probe = Table::new(metrics(10.0, 5_000_000), metrics(0.0, 4_800_000));
        let gate = QualityGate::new(QualityCheck::defaults(), probe);
        match gate.evaluate(&manifest(&["a"], &["a"]), &out()) {
            Verdict::Reject(r) => {
                assert_eq!(r.predicate, "duration_within_tolerance");
                assert_eq!(r.reason, "output duration is zero");
            }
            v => panic!("expected rejection, got {v:?}"),
        }
    }

    #[test]
    fn test_short_circuit_skips_measurement() {
        let probe = Table::new(metrics(10.0, 5_000_000), metrics(10.0, 5_000_000));
        let gate = QualityGate::new(QualityCheck::defaults(), probe.clone());
        let verdict = gate.evaluate(&manifest(&[], &["a"]), &out());
        assert!(matches!(verdict, Verdict::Reject(ref r) if r.predicate == "manifest_complete"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_size_bounds() {
        let tiny = Table::new(metrics(10.0, 5_000_000), metrics(10.0, 10));
        let gate = QualityGate::new(
            vec![QualityCheck::SizeWithinBounds {
                min_bytes: 1024,
                max_ratio: 2.0,
            }],
            tiny,
        );
        assert!(!gate.evaluate(&manifest(&[], &[]), &out()).is_accept());

        let bloated = Table::new(metrics(10.0, 1_000_000), metrics(10.0, 3_000_000));
        let gate = QualityGate::new(
            vec![QualityCheck::SizeWithinBounds {
                min_bytes: 1024,
                max_ratio: 2.0,
            }],
            bloated,
        );
        assert!(!gate.evaluate(&manifest(&[], &[]), &out()).is_accept());
    }

    #[test]
    fn test_zero_length_stream_and_resolution() {
        let mut bad = metrics(10.0, 5_000_000);
        bad.zero_length_streams = 1;
        let gate = QualityGate::new(
            vec![QualityCheck::NoZeroLengthStreams],
            Table::new(metrics(10.0, 5_000_000), bad),
        );
        assert!(!gate.evaluate(&manifest(&[], &[]), &out()).is_accept());

        let mut cropped = metrics(10.0, 5_000_000);
        cropped.width = 1280;
        let gate = QualityGate::new(
            vec![QualityCheck::ResolutionPreserved { tolerance_pct: 5.0 }],
            Table::new(metrics(10.0, 5_000_000), cropped),
        );
        assert!(!gate.evaluate(&manifest(&[], &[]), &out()).is_accept());
    }

    #[test]
    fn test_unmeasurable_output_rejects() {
        let probe = Table::new(metrics(10.0, 5_000_000), metrics(10.0, 5_000_000));
        let gate = QualityGate::new(vec![QualityCheck::NoZeroLengthStreams], probe);
        let missing = Artifact::source("/in.mp4").derive("/missing.mp4");
        match gate.evaluate(&manifest(&[], &[]), &missing) {
            Verdict::Reject(r) => assert!(r.reason.contains("output metrics unavailable")),
            v => panic!("expected rejection, got {v:?}"),
        }
    }

    #[test]
    fn test_check_config_roundtrip_names() {
        let json = r#"[
            {"check": "duration_within_tolerance", "tolerance_pct": 1.5},
            {"check": "bitrate_within_bounds", "min_kbps": 500, "max_kbps": 9000},
            {"check": "no_zero_length_streams"}
        ]"#;
        let checks: Vec<QualityCheck> = serde_json::from_str(json).unwrap();
        assert_eq!(
            checks[0],
            QualityCheck::DurationWithinTolerance {
                tolerance_pct: 1.5,
                tolerance_secs: 0.0
            }
        );
        assert_eq!(checks[1].name(), "bitrate_within_bounds");
    }
}
