//! Pipeline executor: runs a selection plan as ordered stages
//!
//! ## Run states
//!
//! ```text
//! Planned -> Staging -> Running -> Committed | RolledBack | Failed
//!    |          |
//!    +----------+-----------------> Failed
//! ```
//!
//! Staging groups the plan by [`StageKind`] precedence, ascending id within a
//! stage, packaging last. Running threads each stage's output artifact into the
//! next. GPU-affine stages try the accelerated implementation under a device
//! handle; a resource error or accelerator fault falls back to the CPU
//! implementation and the fallback is recorded. Cancellation is observed at
//! stage boundaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_utils::{handle_error, ErrorAction};
use tracing::{debug, info, info_span, warn};

use crate::catalog::Catalog;
use crate::device::DeviceManager;
use crate::errors::{ExecutionError, StageError};
use crate::params::ParameterSet;
use crate::selector::SelectionPlan;
use crate::stage::{
    Artifact, ExecutionPath, PlannedStage, StageBinding, StageKind, StageProvider, StageRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planned,
    Staging,
    Running,
    Committed,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Planned, Staging)
                | (Planned, Failed)
                | (Staging, Running)
                | (Staging, Failed)
                | (Running, Committed)
                | (Running, RolledBack)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::RolledBack | RunState::Failed)
    }
}

/// Shared flag checked between stages
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════
// Manifest
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub index: usize,
    pub kind: StageKind,
    pub transformations: Vec<String>,
    /// Path of the last implementation tried
    pub path: ExecutionPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_slot: Option<usize>,
    /// Offset from run start
    pub started_ms: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What ran, in which order, how, and how it ended
#[derive(Debug, Clone, Serialize)]
pub struct PipelineManifest {
    pub run_id: String,
    pub attempt: u32,
    pub seed: u64,
    pub planned_run_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_run_index: Option<u64>,
    pub ledger_version: u64,
    /// Selection order
    pub planned: Vec<String>,
    /// Execution order
    pub transformations: Vec<String>,
    pub params: ParameterSet,
    pub stages: Vec<StageRecord>,
    pub state: RunState,
    pub history: Vec<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_reason: Option<String>,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl PipelineManifest {
    pub fn new(plan: &SelectionPlan, source: &Artifact, attempt: u32) -> Self {
        Self {
            run_id: format!("{:016x}-a{}", plan.seed, attempt),
            attempt,
            seed: plan.seed,
            planned_run_index: plan.run_index,
            committed_run_index: None,
            ledger_version: plan.ledger_version,
            planned: plan.transformations.clone(),
            transformations: Vec::new(),
            params: plan.params.clone(),
            stages: Vec::new(),
            state: RunState::Planned,
            history: vec![RunState::Planned],
            outcome_reason: None,
            source: source.path.clone(),
            output: None,
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    fn advance(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = ?self.state, to = ?next, "Ignoring illegal run state transition");
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.state, next);
            return;
        }
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Run state");
        self.state = next;
        self.history.push(next);
    }

    fn fail(&mut self, reason: String) {
        self.outcome_reason = Some(reason);
        self.advance(RunState::Failed);
    }

    /// Gate accepted and the ledger commit succeeded.
    pub fn mark_committed(&mut self, run_index: u64, output: &Path) {
        self.committed_run_index = Some(run_index);
        self.output = Some(output.to_path_buf());
        self.advance(RunState::Committed);
    }

    /// Gate rejected the artifact or the commit lost a conflict.
    pub fn mark_rolled_back(&mut self, reason: impl Into<String>) {
        self.outcome_reason = Some(reason.into());
        self.advance(RunState::RolledBack);
    }

    /// Ids of transformations whose stage completed.
    pub fn applied_transformations(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.succeeded())
            .flat_map(|s| s.transformations.iter().map(String::as_str))
            .collect()
    }

    pub fn fallback_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.fallback_reason.is_some())
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct ExecutionOutput {
    pub artifact: Artifact,
    pub manifest: PipelineManifest,
}

/// Execution stopped early; carries the manifest so far
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: ExecutionError,
    pub manifest: PipelineManifest,
}

// ═══════════════════════════════════════════════════════════════
// Staging
// ═══════════════════════════════════════════════════════════════

/// Group a plan into stages: precedence order, ascending id inside a stage,
/// packaging appended last.
pub fn plan_stages<'c>(
    catalog: &'c Catalog,
    plan: &SelectionPlan,
) -> Result<Vec<PlannedStage<'c>>, StageError> {
    let mut by_kind: BTreeMap<StageKind, Vec<_>> = BTreeMap::new();
    for id in &plan.transformations {
        let descriptor = catalog
            .get(id)
            .ok_or_else(|| StageError::UnknownTransformation(id.clone()))?;
        by_kind
            .entry(StageKind::for_category(descriptor.category))
            .or_default()
            .push(descriptor);
    }

    let mut stages: Vec<PlannedStage<'c>> = by_kind
        .into_iter()
        .map(|(kind, mut transformations)| {
            transformations.sort_by(|a, b| a.id.cmp(&b.id));
            PlannedStage {
                kind,
                transformations,
            }
        })
        .collect();
    stages.push(PlannedStage {
        kind: StageKind::Packaging,
        transformations: Vec::new(),
    });
    Ok(stages)
}

// ═══════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════

pub struct PipelineExecutor<'a> {
    catalog: &'a Catalog,
    devices: &'a DeviceManager,
    provider: &'a dyn StageProvider,
    acquire_timeout: Duration,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(
        catalog: &'a Catalog,
        devices: &'a DeviceManager,
        provider: &'a dyn StageProvider,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            devices,
            provider,
            acquire_timeout,
        }
    }

    pub fn execute(
        &self,
        plan: &SelectionPlan,
        source: &Artifact,
        work_dir: &Path,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionFailure> {
        let run_start = Instant::now();
        let mut manifest = PipelineManifest::new(plan, source, attempt);
        let span = info_span!("run", run_id = %manifest.run_id);
        let _enter = span.enter();

        macro_rules! bail {
            ($error:expr) => {{
                let error: ExecutionError = $error;
                manifest.fail(error.to_string());
                manifest.elapsed_ms = run_start.elapsed().as_millis() as u64;
                return Err(ExecutionFailure { error, manifest });
            }};
        }

        manifest.advance(RunState::Staging);
        let stages = match plan_stages(self.catalog, plan) {
            Ok(stages) => stages,
            Err(e) => bail!(ExecutionError::Stage(e)),
        };
        manifest.transformations = stages.iter().flat_map(|s| s.ids()).collect();

        manifest.advance(RunState::Running);
        info!(
            stages = stages.len(),
            transformations = ?manifest.transformations,
            "Executing pipeline"
        );

        let mut current = source.clone();
        for (index, stage) in stages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(index, "Cancellation observed at stage boundary");
                bail!(ExecutionError::Cancelled);
            }

            let binding = self.provider.bind(stage.kind);
            let request = StageInput {
                index,
                stage,
                params: &plan.params,
                input: &current,
                work_dir,
                started_ms: run_start.elapsed().as_millis() as u64,
            };
            match self.run_stage(&request, &binding) {
                Ok((artifact, record)) => {
                    manifest.stages.push(record);
                    current = artifact;
                }
                Err((error, record)) => {
                    manifest.stages.push(record);
                    bail!(ExecutionError::Stage(error));
                }
            }
        }

        if cancel.is_cancelled() {
            bail!(ExecutionError::Cancelled);
        }

        manifest.elapsed_ms = run_start.elapsed().as_millis() as u64;
        info!(
            elapsed_ms = manifest.elapsed_ms,
            fallbacks = manifest.fallback_count(),
            output = %current.path.display(),
            "Pipeline finished"
        );
        Ok(ExecutionOutput {
            artifact: current,
            manifest,
        })
    }

    fn run_stage(
        &self,
        input: &StageInput<'_, '_>,
        binding: &StageBinding,
    ) -> Result<(Artifact, StageRecord), (StageError, StageRecord)> {
        let stage_start = Instant::now();
        let mut record = StageRecord {
            index: input.index,
            kind: input.stage.kind,
            transformations: input.stage.ids(),
            path: ExecutionPath::Fallback,
            fallback_reason: None,
            device_slot: None,
            started_ms: input.started_ms,
            elapsed_ms: 0,
            output: None,
            error: None,
        };

        let accelerated = binding
            .accelerated
            .as_ref()
            .filter(|_| input.stage.gpu_affinity());

        if let Some(accelerated) = accelerated {
            match self.devices.acquire(self.acquire_timeout) {
                Ok(handle) => {
                    let request = input.request(Some(&handle));
                    let result = accelerated.apply(&request);
                    record.device_slot = Some(handle.slot());
                    self.devices.release(&handle);

                    match result {
                        Ok(artifact) => {
                            record.path = ExecutionPath::Accelerated;
                            record.elapsed_ms = stage_start.elapsed().as_millis() as u64;
                            record.output = Some(artifact.path.clone());
                            debug!(stage = %record.kind, slot = ?record.device_slot, "Stage done on accelerator");
                            return Ok((artifact, record));
                        }
                        Err(e) => {
                            let action = handle_error(
                                e.category(),
                                "accelerated stage",
                                e.clone(),
                                Some("running CPU fallback"),
                            );
                            match action {
                                ErrorAction::Continue => {
                                    record.fallback_reason = Some(e.to_string());
                                    self.devices.invalidate_probe();
                                }
                                ErrorAction::Abort(_) => {
                                    record.path = ExecutionPath::Accelerated;
                                    record.elapsed_ms = stage_start.elapsed().as_millis() as u64;
                                    record.error = Some(e.to_string());
                                    return Err((e, record));
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    match handle_error(e.category(), "device acquire", e, Some("running CPU fallback")) {
                        ErrorAction::Continue => record.fallback_reason = Some(reason),
                        ErrorAction::Abort(cause) => {
                            let error = StageError::ExecutionFailed {
                                stage: record.kind.to_string(),
                                message: cause.to_string(),
                            };
                            record.error = Some(error.to_string());
                            return Err((error, record));
                        }
                    }
                }
            }
        }

        let request = input.request(None);
        let result = binding.fallback.apply(&request);
        record.elapsed_ms = stage_start.elapsed().as_millis() as u64;
        match result {
            Ok(artifact) => {
                record.output = Some(artifact.path.clone());
                debug!(stage = %record.kind, fallback = record.fallback_reason.is_some(), "Stage done on CPU");
                Ok((artifact, record))
            }
            Err(e) => {
                record.error = Some(e.to_string());
                Err((e, record))
            }
        }
    }
}

/// Per-stage inputs, turned into a [`StageRequest`] once the path is known
struct StageInput<'s, 'c> {
    index: usize,
    stage: &'s PlannedStage<'c>,
    params: &'s ParameterSet,
    input: &'s Artifact,
    work_dir: &'s Path,
    started_ms: u64,
}

impl<'s, 'c> StageInput<'s, 'c> {
    fn request<'r>(&'r self, device: Option<&'r crate::device::DeviceHandle>) -> StageRequest<'r> {
        StageRequest {
            kind: self.stage.kind,
            index: self.index,
            transformations: &self.stage.transformations,
            params: self.params,
            input: self.input,
            work_dir: self.work_dir,
            device,
        }
    }
}
