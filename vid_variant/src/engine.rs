//! Run coordinator: the select / execute / gate / commit loop
//!
//! One variant = one [`RunJob`]. Each attempt:
//!
//! 1. snapshot the ledger
//! 2. select a plan (attempt 1 uses the job seed as given)
//! 3. execute it in a fresh attempt directory
//! 4. gate the artifact; reject -> rollback, next attempt
//! 5. publish the artifact, then commit; a lost commit conflict -> next attempt
//!
//! Stage failures and cancellation end the run immediately with the manifest
//! so far. Batches run one job per rayon worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use shared_utils::{handle_error, resolve_worker_count, ErrorAction, ErrorCategory};
use tracing::{debug, info, info_span, warn};

use crate::catalog::Catalog;
use crate::config::ValidatedConfig;
use crate::device::DeviceManager;
use crate::errors::{ExecutionError, LedgerError, QualityRejection, RunError, SelectionError};
use crate::ledger::{CommitReceipt, CooldownLedger};
use crate::params::mix_seed;
use crate::pipeline::{CancellationToken, ExecutionOutput, PipelineExecutor, PipelineManifest};
use crate::quality_gate::{MetricsProbe, QualityGate, Verdict};
use crate::selector::{SelectionPlan, Selector};
use crate::stage::{Artifact, StageProvider};

#[derive(Debug, Clone)]
pub struct RunJob {
    pub source: PathBuf,
    /// Published only once the variant is accepted and committed
    pub output: PathBuf,
    /// Per-attempt intermediates go below this directory
    pub work_dir: PathBuf,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub output: PathBuf,
    pub receipt: CommitReceipt,
    pub attempts: u32,
    /// Gate rejections of earlier attempts
    pub rejections: Vec<QualityRejection>,
    pub manifest: PipelineManifest,
}

enum AttemptFailure {
    NotAttempted,
    Selection(SelectionError),
    Rejected(QualityRejection),
    Conflict(Vec<String>),
}

pub struct VariantEngine {
    catalog: Arc<Catalog>,
    config: ValidatedConfig,
    ledger: Arc<CooldownLedger>,
    devices: DeviceManager,
    provider: Arc<dyn StageProvider>,
    gate: QualityGate,
}

impl VariantEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        config: ValidatedConfig,
        ledger: Arc<CooldownLedger>,
        devices: DeviceManager,
        provider: Arc<dyn StageProvider>,
        metrics: Arc<dyn MetricsProbe>,
    ) -> Self {
        let gate = QualityGate::new(config.config().quality_checks.clone(), metrics);
        Self {
            catalog,
            config,
            ledger,
            devices,
            provider,
            gate,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    fn selector(&self) -> Selector<'_> {
        Selector::new(&self.catalog, self.config.selection(), self.config.bounds())
    }

    /// Select against the current ledger without executing or committing.
    pub fn plan(&self, seed: Option<u64>) -> Result<SelectionPlan, SelectionError> {
        self.selector().select(&self.ledger.snapshot(), seed)
    }

    pub fn run(&self, job: &RunJob, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let span = info_span!("variant", source = %job.source.display(), output = %job.output.display());
        let _enter = span.enter();

        let config = self.config.config();
        let selector = self.selector();
        let executor = PipelineExecutor::new(
            &self.catalog,
            &self.devices,
            self.provider.as_ref(),
            config.devices.acquire_timeout(),
        );
        let source = Artifact::source(&job.source);
        let mut rejections = Vec::new();
        let mut last = AttemptFailure::NotAttempted;

        for attempt in 1..=config.max_attempts {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled { manifest: None });
            }

            let snapshot = self.ledger.snapshot();
            let seed = job
                .seed
                .map(|s| if attempt == 1 { s } else { mix_seed(s, attempt as u64) });

            let plan = match selector.select(&snapshot, seed) {
                Ok(plan) => plan,
                Err(e) if e.category() == ErrorCategory::Fatal => return Err(RunError::Selection(e)),
                Err(e) => {
                    warn!(attempt, error = %e, "Selection failed, retrying");
                    last = AttemptFailure::Selection(e);
                    continue;
                }
            };

            let attempt_dir = job.work_dir.join(format!("attempt{:02}", attempt));
            fs::create_dir_all(&attempt_dir).map_err(|source| RunError::Io {
                path: attempt_dir.clone(),
                source,
            })?;

            let ExecutionOutput {
                artifact,
                mut manifest,
            } = match executor.execute(&plan, &source, &attempt_dir, attempt, cancel) {
                Ok(output) => output,
                Err(failure) => {
                    self.cleanup(&attempt_dir);
                    let manifest = Box::new(failure.manifest);
                    return Err(match failure.error {
                        ExecutionError::Cancelled => RunError::Cancelled {
                            manifest: Some(manifest),
                        },
                        ExecutionError::Stage(error) => RunError::Stage { error, manifest },
                    });
                }
            };

            if let Verdict::Reject(rejection) = self.gate.evaluate(&manifest, &artifact) {
                self.ledger.rollback(&plan);
                manifest.mark_rolled_back(rejection.to_string());
                self.cleanup(&attempt_dir);
                let action = handle_error(
                    rejection.category(),
                    "quality gate",
                    rejection.clone(),
                    Some("re-selecting"),
                );
                if let ErrorAction::Abort(_) = action {
                    return Err(RunError::QualityExhausted {
                        attempts: attempt,
                        last: rejection,
                    });
                }
                rejections.push(rejection.clone());
                last = AttemptFailure::Rejected(rejection);
                continue;
            }

            publish(&artifact.path, &job.output)?;

            match self.ledger.commit(&plan, &self.catalog, Utc::now().timestamp()) {
                Ok(receipt) => {
                    manifest.mark_committed(receipt.run_index, &job.output);
                    self.cleanup(&attempt_dir);
                    info!(
                        attempt,
                        run_index = receipt.run_index,
                        transformations = ?manifest.transformations,
                        fallbacks = manifest.fallback_count(),
                        "Variant committed"
                    );
                    return Ok(RunReport {
                        output: job.output.clone(),
                        receipt,
                        attempts: attempt,
                        rejections,
                        manifest,
                    });
                }
                Err(e) => {
                    unpublish(&job.output);
                    self.cleanup(&attempt_dir);
                    match e {
                        LedgerError::Conflict { ids, .. } => {
                            manifest.mark_rolled_back(format!("ledger conflict on {:?}", ids));
                            last = AttemptFailure::Conflict(ids);
                        }
                        other => return Err(RunError::Ledger(other)),
                    }
                }
            }
        }

        let attempts = config.max_attempts;
        Err(match last {
            AttemptFailure::Selection(e) => RunError::Selection(e),
            AttemptFailure::Rejected(last) => RunError::QualityExhausted { attempts, last },
            AttemptFailure::Conflict(ids) => RunError::ConflictExhausted { attempts, ids },
            AttemptFailure::NotAttempted => RunError::Selection(SelectionError::InvalidConstraints(
                "no attempts allowed".into(),
            )),
        })
    }

    /// Run every job, one per worker. Results are in job order.
    pub fn run_batch(
        &self,
        jobs: &[RunJob],
        cancel: &CancellationToken,
    ) -> Vec<Result<RunReport, RunError>> {
        let workers = resolve_worker_count(self.config.config().workers).min(jobs.len().max(1));
        info!(jobs = jobs.len(), workers, "Starting batch");

        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| jobs.par_iter().map(|job| self.run(job, cancel)).collect()),
            Err(e) => {
                warn!(error = %e, "Thread pool unavailable, running sequentially");
                jobs.iter().map(|job| self.run(job, cancel)).collect()
            }
        }
    }

    fn cleanup(&self, attempt_dir: &Path) {
        if self.config.config().keep_intermediates {
            return;
        }
        if let Err(e) = fs::remove_dir_all(attempt_dir) {
            debug!(dir = %attempt_dir.display(), error = %e, "Could not remove attempt directory");
        }
    }
}

fn publish(artifact: &Path, output: &Path) -> Result<(), RunError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| RunError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::copy(artifact, output).map_err(|source| RunError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn unpublish(output: &Path) {
    if let Err(e) = fs::remove_file(output) {
        warn!(output = %output.display(), error = %e, "Could not remove unpublished output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Category, TransformationDescriptor as T};
    use crate::config::EngineConfig;
    use crate::device::{DeviceConfig, StaticProbe};
    use crate::errors::StageError;
    use crate::ledger::CooldownUnit;
    use crate::pipeline::RunState;
    use crate::quality_gate::{ArtifactMetrics, QualityCheck};
    use crate::selector::SelectionConstraints;
    use crate::stage::{StageBinding, StageImpl, StageKind, StageRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Copies input to the stage output path; optionally fails one stage kind.
    struct CopyStage {
        fail_on: Option<StageKind>,
    }

    impl StageImpl for CopyStage {
        fn apply(&self, request: &StageRequest<'_>) -> Result<Artifact, StageError> {
            if self.fail_on == Some(request.kind) {
                return Err(StageError::ExecutionFailed {
                    stage: request.kind.to_string(),
                    message: "Conversion failed!".into(),
                });
            }
            let out = request.output_path("mkv");
            fs::copy(&request.input.path, &out).map_err(|e| StageError::ExecutionFailed {
                stage: request.kind.to_string(),
                message: e.to_string(),
            })?;
            Ok(request.input.derive(out))
        }
    }

    struct CopyProvider(Arc<CopyStage>);

    impl StageProvider for CopyProvider {
        fn bind(&self, _kind: StageKind) -> StageBinding {
            StageBinding::cpu_only(self.0.clone())
        }
    }

    /// Source is 10s; outputs take their duration from a script (10s once empty).
    struct ScriptedMetrics {
        output_durations: Mutex<VecDeque<f64>>,
    }

    impl ScriptedMetrics {
        fn new(durations: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                output_durations: Mutex::new(durations.iter().copied().collect()),
            })
        }
    }

    impl MetricsProbe for ScriptedMetrics {
        fn measure(&self, artifact: &Artifact) -> Result<ArtifactMetrics, String> {
            let duration = if artifact.generation == 0 {
                10.0
            } else {
                self.output_durations.lock().unwrap().pop_front().unwrap_or(10.0)
            };
            Ok(ArtifactMetrics {
                duration_secs: duration,
                size_bytes: 2048,
                bit_rate: 3_000_000,
                width: 1280,
                height: 720,
                video_streams: 1,
                audio_streams: 1,
                zero_length_streams: 0,
            })
        }
    }

    fn catalog() -> Catalog {
        Catalog::new(vec![
            T::new("a", Category::Color, 1.0).group("ab"),
            T::new("b", Category::Color, 1.0).group("ab"),
            T::new("c", Category::Motion, 1.0),
            T::new("d", Category::Motion, 2.0),
            T::new("e", Category::Audio, 1.0),
            T::new("f", Category::Audio, 0.5),
        ])
        .unwrap()
    }

    struct Fixture {
        dir: TempDir,
        ledger_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("in.mp4"), b"not really a video").unwrap();
            let ledger_path = dir.path().join("state").join("ledger.json");
            Self { dir, ledger_path }
        }

        fn job(&self, name: &str, seed: Option<u64>) -> RunJob {
            RunJob {
                source: self.dir.path().join("in.mp4"),
                output: self.dir.path().join("out").join(format!("{name}.mp4")),
                work_dir: self.dir.path().join("work").join(name),
                seed,
            }
        }

        fn engine(
            &self,
            max_attempts: u32,
            fail_on: Option<StageKind>,
            metrics: Arc<ScriptedMetrics>,
        ) -> VariantEngine {
            self.engine_with(catalog(), max_attempts, fail_on, metrics)
        }

        fn engine_with(
            &self,
            catalog: Catalog,
            max_attempts: u32,
            fail_on: Option<StageKind>,
            metrics: Arc<ScriptedMetrics>,
        ) -> VariantEngine {
            let config = EngineConfig {
                selection: SelectionConstraints {
                    min: 2,
                    max: 4,
                    required_categories: vec![Category::Color],
                    ..Default::default()
                },
                quality_checks: vec![
                    QualityCheck::ManifestComplete,
                    QualityCheck::DurationWithinTolerance {
                        tolerance_pct: 2.0,
                        tolerance_secs: 0.5,
                    },
                ],
                max_attempts,
                workers: Some(2),
                ..Default::default()
            }
            .validate()
            .unwrap();
            let ledger = CooldownLedger::load(&self.ledger_path, CooldownUnit::Runs).unwrap();
            VariantEngine::new(
                Arc::new(catalog),
                config,
                Arc::new(ledger),
                DeviceManager::new(&DeviceConfig::default(), StaticProbe::absent()),
                Arc::new(CopyProvider(Arc::new(CopyStage { fail_on }))),
                metrics,
            )
        }
    }

    // ====================================================================
    // Scenarios
    // ====================================================================

    #[test]
    fn test_accepted_run_commits_and_publishes() {
        let fx = Fixture::new();
        let engine = fx.engine(3, None, ScriptedMetrics::new(&[]));
        let job = fx.job("v1", Some(42));

        let report = engine.run(&job, &CancellationToken::new()).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.receipt.run_index, 0);
        assert_eq!(report.manifest.state, RunState::Committed);
        assert_eq!(report.manifest.seed, 42);
        assert!(job.output.exists());
        assert!(fx.ledger_path.exists());
        assert_eq!(engine.ledger().snapshot().version(), 1);
        // intermediates removed
        assert!(!job.work_dir.join("attempt01").exists());

        // plan() with the same seed against the pre-commit state picks the same set
        let replay = fx.engine(3, None, ScriptedMetrics::new(&[]));
        let mut planned = report.manifest.planned.clone();
        planned.sort();
        let fresh = CooldownLedger::in_memory(CooldownUnit::Runs);
        let c = replay.config.selection().clone();
        let mut again = Selector::new(replay.catalog(), &c, replay.config.bounds())
            .select(&fresh.snapshot(), Some(42))
            .unwrap()
            .transformations;
        again.sort();
        assert_eq!(planned, again);
    }

    #[test]
    fn test_rejection_leaves_ledger_byte_identical() {
        let fx = Fixture::new();
        // seed the ledger file with one committed run
        fx.engine(1, None, ScriptedMetrics::new(&[]))
            .run(&fx.job("first", Some(1)), &CancellationToken::new())
            .unwrap();
        let before = fs::read(&fx.ledger_path).unwrap();

        let engine = fx.engine(1, None, ScriptedMetrics::new(&[0.0]));
        let job = fx.job("rejected", Some(2));
        let err = engine.run(&job, &CancellationToken::new()).unwrap_err();
        match err {
            RunError::QualityExhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert_eq!(last.predicate, "duration_within_tolerance");
            }
            other => panic!("expected QualityExhausted, got {other:?}"),
        }
        assert_eq!(fs::read(&fx.ledger_path).unwrap(), before);
        assert!(!job.output.exists());
    }

    #[test]
    fn test_rejection_then_reselection_commits() {
        let fx = Fixture::new();
        let engine = fx.engine(3, None, ScriptedMetrics::new(&[0.0]));
        let report = engine.run(&fx.job("v", Some(7)), &CancellationToken::new()).unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.receipt.run_index, 0);
        assert_eq!(engine.ledger().snapshot().version(), 1);
    }

    #[test]
    fn test_rejected_selection_stays_eligible_for_reselection() {
        // every plan must take both entries, and both carry a cooldown
        let cooling = Catalog::new(vec![
            T::new("x", Category::Color, 1.0).cooldown(5),
            T::new("y", Category::Audio, 1.0).cooldown(5),
        ])
        .unwrap();
        let fx = Fixture::new();
        let engine = fx.engine_with(cooling, 3, None, ScriptedMetrics::new(&[0.0]));

        let report = engine.run(&fx.job("v", Some(11)), &CancellationToken::new()).unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.rejections.len(), 1);
        let mut applied = report.manifest.transformations.clone();
        applied.sort();
        assert_eq!(applied, vec!["x".to_string(), "y".to_string()]);

        let snap = engine.ledger().snapshot();
        let recorded: Vec<&str> = snap.state().entries.keys().map(String::as_str).collect();
        assert_eq!(recorded, vec!["x", "y"]);
        assert!(snap.state().entries.values().all(|e| e.last_run_index == 0));
        assert_eq!(snap.version(), 1);
        for id in ["x", "y"] {
            assert!(!snap.is_eligible(engine.catalog().get(id).unwrap()));
        }

        let reloaded = CooldownLedger::load(&fx.ledger_path, CooldownUnit::Runs).unwrap();
        assert_eq!(reloaded.snapshot().state(), snap.state());
    }

    #[test]
    fn test_stage_failure_aborts_without_commit() {
        let fx = Fixture::new();
        let engine = fx.engine(3, Some(StageKind::Packaging), ScriptedMetrics::new(&[]));
        let job = fx.job("broken", Some(3));
        let err = engine.run(&job, &CancellationToken::new()).unwrap_err();

        let manifest = err.manifest().expect("stage failure carries the manifest");
        assert_eq!(manifest.state, RunState::Failed);
        assert!(matches!(err, RunError::Stage { .. }));
        assert_eq!(engine.ledger().snapshot().version(), 0);
        assert!(!fx.ledger_path.exists());
        assert!(!job.output.exists());
    }

    #[test]
    fn test_cancelled_before_start() {
        let fx = Fixture::new();
        let engine = fx.engine(3, None, ScriptedMetrics::new(&[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            engine.run(&fx.job("c", None), &cancel),
            Err(RunError::Cancelled { manifest: None })
        ));
    }

    #[test]
    fn test_batch_commits_each_job_once() {
        let fx = Fixture::new();
        let engine = fx.engine(3, None, ScriptedMetrics::new(&[]));
        let jobs: Vec<RunJob> = (0..4).map(|i| fx.job(&format!("b{i}"), Some(i))).collect();

        let results = engine.run_batch(&jobs, &CancellationToken::new());
        assert_eq!(results.len(), 4);

        let mut indexes: Vec<u64> = results
            .into_iter()
            .map(|r| r.unwrap().receipt.run_index)
            .collect();
        indexes.sort();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        for job in &jobs {
            assert!(job.output.exists());
        }
    }
}
