//! Stage abstractions: what a pipeline step is and how it is bound
//!
//! A stage backend supplies a [`StageBinding`] per [`StageKind`]: an optional
//! accelerated implementation plus a mandatory CPU fallback. The executor
//! picks between them at call time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Category, TransformationDescriptor};
use crate::device::DeviceHandle;
use crate::errors::StageError;
use crate::params::ParameterSet;

/// Pipeline stage, in execution precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Audio,
    Color,
    Motion,
    Composite,
    Encoder,
    /// Final encode/mux, always last
    Packaging,
}

impl StageKind {
    pub const ORDER: [StageKind; 6] = [
        StageKind::Audio,
        StageKind::Color,
        StageKind::Motion,
        StageKind::Composite,
        StageKind::Encoder,
        StageKind::Packaging,
    ];

    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Audio => StageKind::Audio,
            Category::Color => StageKind::Color,
            Category::Motion => StageKind::Motion,
            Category::Composite => StageKind::Composite,
            Category::Encoder => StageKind::Encoder,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Audio => "audio",
            StageKind::Color => "color",
            StageKind::Motion => "motion",
            StageKind::Composite => "composite",
            StageKind::Encoder => "encoder",
            StageKind::Packaging => "packaging",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media file produced (or consumed) by a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// 0 for the source, +1 per stage that wrote a new file
    pub generation: u32,
}

impl Artifact {
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generation: 0,
        }
    }

    pub fn derive(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            generation: self.generation + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPath {
    Accelerated,
    Fallback,
}

/// Everything a stage implementation gets for one invocation
pub struct StageRequest<'a> {
    pub kind: StageKind,
    /// Position in the run, used for output naming
    pub index: usize,
    /// Members of this stage, ascending id
    pub transformations: &'a [&'a TransformationDescriptor],
    pub params: &'a ParameterSet,
    pub input: &'a Artifact,
    pub work_dir: &'a Path,
    /// Present only on the accelerated path
    pub device: Option<&'a DeviceHandle>,
}

impl StageRequest<'_> {
    pub fn output_path(&self, extension: &str) -> PathBuf {
        self.work_dir
            .join(format!("stage{:02}_{}.{}", self.index, self.kind, extension))
    }

    pub fn path(&self) -> ExecutionPath {
        if self.device.is_some() {
            ExecutionPath::Accelerated
        } else {
            ExecutionPath::Fallback
        }
    }
}

pub trait StageImpl: Send + Sync {
    fn apply(&self, request: &StageRequest<'_>) -> Result<Artifact, StageError>;
}

/// Accelerated and CPU implementations of one stage
#[derive(Clone)]
pub struct StageBinding {
    pub accelerated: Option<Arc<dyn StageImpl>>,
    pub fallback: Arc<dyn StageImpl>,
}

impl StageBinding {
    pub fn cpu_only(fallback: Arc<dyn StageImpl>) -> Self {
        Self {
            accelerated: None,
            fallback,
        }
    }

    pub fn with_accelerated(accelerated: Arc<dyn StageImpl>, fallback: Arc<dyn StageImpl>) -> Self {
        Self {
            accelerated: Some(accelerated),
            fallback,
        }
    }
}

/// Backend that knows how to run each stage kind
pub trait StageProvider: Send + Sync {
    fn bind(&self, kind: StageKind) -> StageBinding;
}

/// Selected transformations grouped into one stage
#[derive(Debug, Clone)]
pub struct PlannedStage<'c> {
    pub kind: StageKind,
    pub transformations: Vec<&'c TransformationDescriptor>,
}

impl PlannedStage<'_> {
    /// Packaging always may use a hardware encoder; other stages only when a
    /// member asks for it.
    pub fn gpu_affinity(&self) -> bool {
        self.kind == StageKind::Packaging || self.transformations.iter().any(|t| t.gpu_affinity)
    }

    pub fn ids(&self) -> Vec<String> {
        self.transformations.iter().map(|t| t.id.clone()).collect()
    }
}
