//! vid-variant - constrained-random video variant engine
//!
//! Produces perceptually equivalent but byte-distinct variants of a source
//! clip:
//! - Seeded selection of transformations under category, exclusion and
//!   cooldown constraints
//! - Per-run encoder/filter parameter randomization
//! - Staged execution with accelerator slots and CPU fallback
//! - Quality gate before any selection is committed to the cooldown ledger
//!
//! ## Planning only
//! ```rust,ignore
//! use vid_variant::{Catalog, CooldownLedger, CooldownUnit, SelectionConstraints, Selector, ValidatedBounds};
//!
//! let catalog = Catalog::builtin();
//! let ledger = CooldownLedger::in_memory(CooldownUnit::Runs);
//! let constraints = SelectionConstraints::default();
//! let bounds = ValidatedBounds::default();
//! let plan = Selector::new(&catalog, &constraints, &bounds).select(&ledger.snapshot(), Some(42))?;
//! ```

pub mod catalog;
pub mod config;
pub mod device;
pub mod engine;
pub mod errors;
pub mod ffmpeg_stages;
pub mod ledger;
pub mod params;
pub mod pipeline;
pub mod quality_gate;
pub mod selector;
pub mod stage;

pub use catalog::{Catalog, Category, TransformationDescriptor};
pub use config::{EngineConfig, ValidatedConfig, FORCE_CPU_ENV, LEDGER_ENV};
pub use device::{
    AcceleratorProbe, AcceleratorStatus, DeviceConfig, DeviceHandle, DeviceManager, StaticProbe,
    SystemProbe,
};
pub use engine::{RunJob, RunReport, VariantEngine};
pub use errors::{
    CatalogError, ConfigError, ExecutionError, LedgerError, ParamError, QualityRejection,
    ResourceError, RunError, SelectionError, StageError,
};
pub use ffmpeg_stages::{FfmpegStageProvider, FfprobeMetrics};
pub use ledger::{CommitReceipt, CooldownLedger, CooldownUnit, LedgerSnapshot};
pub use params::{derive, ParameterBounds, ParameterSet, ValidatedBounds};
pub use pipeline::{
    plan_stages, CancellationToken, PipelineExecutor, PipelineManifest, RunState, StageRecord,
};
pub use quality_gate::{ArtifactMetrics, MetricsProbe, QualityCheck, QualityGate, Verdict};
pub use selector::{QuotaPolicy, SelectionConstraints, SelectionPlan, Selector};
pub use stage::{Artifact, StageBinding, StageImpl, StageKind, StageProvider, StageRequest};
