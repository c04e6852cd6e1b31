//! Effect catalog: the static registry of transformation descriptors
//!
//! Loaded once at startup (JSON file or the built-in set) and validated:
//! ids are non-empty and unique, weights finite and positive. Entries are
//! kept sorted by id; the selector relies on that order for tie-breaking.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Color,
    Motion,
    Composite,
    Audio,
    Encoder,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Color,
        Category::Motion,
        Category::Composite,
        Category::Audio,
        Category::Encoder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Color => "color",
            Category::Motion => "motion",
            Category::Composite => "composite",
            Category::Audio => "audio",
            Category::Encoder => "encoder",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transformation the engine may apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationDescriptor {
    pub id: String,
    pub category: Category,
    /// Relative selection weight, > 0
    pub weight: f64,
    /// At most one member of a group per run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion_group: Option<String>,
    /// Cooldown window, in the configured unit (runs or seconds)
    #[serde(default)]
    pub cooldown: u64,
    /// Stage may run on the accelerator
    #[serde(default)]
    pub gpu_affinity: bool,
    /// Capability expression for the stage backend, `{knob}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl TransformationDescriptor {
    pub fn new(id: &str, category: Category, weight: f64) -> Self {
        Self {
            id: id.to_string(),
            category,
            weight,
            exclusion_group: None,
            cooldown: 0,
            gpu_affinity: false,
            filter: None,
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.exclusion_group = Some(group.to_string());
        self
    }

    pub fn cooldown(mut self, cooldown: u64) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn gpu(mut self) -> Self {
        self.gpu_affinity = true;
        self
    }

    pub fn filter(mut self, template: &str) -> Self {
        self.filter = Some(template.to_string());
        self
    }
}

/// Validated, id-sorted set of descriptors
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<TransformationDescriptor>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(mut entries: Vec<TransformationDescriptor>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        for (position, entry) in entries.iter().enumerate() {
            if entry.id.trim().is_empty() {
                return Err(CatalogError::EmptyId { position });
            }
            if !entry.weight.is_finite() || entry.weight <= 0.0 {
                return Err(CatalogError::InvalidWeight {
                    id: entry.id.clone(),
                    weight: entry.weight.to_string(),
                });
            }
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if index.insert(entry.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateId(entry.id.clone()));
            }
        }

        debug!(entries = entries.len(), "Catalog validated");
        Ok(Self { entries, index })
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let entries: Vec<TransformationDescriptor> =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(entries)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let catalog = Self::from_json_str(&json)?;
        info!(path = %path.display(), entries = catalog.len(), "Catalog loaded");
        Ok(catalog)
    }

    /// Built-in transformation set used when no catalog file is configured.
    ///
    /// Filter placeholders refer to knobs in the default parameter bounds.
    pub fn builtin() -> Self {
        use Category::*;
        use TransformationDescriptor as T;

        let entries = vec![
            // audio
            T::new("pitch_shift", Audio, 1.0)
                .group("audio_tempo")
                .cooldown(2)
                // resample first so asetrate relabels PCM already at the drawn rate
                .filter(
                    "aresample={audio_sample_rate},asetrate={audio_sample_rate}*{pitch},\
                     aresample={audio_sample_rate},atempo=1/{pitch}",
                ),
            T::new("audio_tempo", Audio, 0.8)
                .group("audio_tempo")
                .filter("atempo={tempo}"),
            T::new("volume_jitter", Audio, 1.2).filter("volume={volume}"),
            T::new("audio_eq", Audio, 0.7)
                .cooldown(1)
                .filter("equalizer=f=1000:t=q:w=1:g={eq_gain}"),
            // color
            T::new("gamma_shift", Color, 1.0)
                .group("eq")
                .gpu()
                .filter("eq=gamma={gamma}"),
            T::new("saturation_boost", Color, 1.0)
                .group("eq")
                .gpu()
                .filter("eq=saturation={saturation}"),
            T::new("hue_rotate", Color, 0.6)
                .cooldown(2)
                .filter("hue=h={hue}"),
            T::new("vignette", Color, 0.5)
                .cooldown(3)
                .filter("vignette=angle={vignette}"),
            // motion
            T::new("zoom_crop", Motion, 1.0)
                .group("framing")
                .gpu()
                .filter("scale=iw*{zoom}:ih*{zoom},crop=iw/{zoom}:ih/{zoom}"),
            T::new("edge_crop", Motion, 0.8)
                .group("framing")
                .filter("crop=iw-2*{crop_px}:ih-2*{crop_px},scale=iw+2*{crop_px}:ih+2*{crop_px}"),
            T::new("mirror", Motion, 0.5)
                .group("orientation")
                .cooldown(3)
                .filter("hflip"),
            T::new("micro_rotate", Motion, 0.7)
                .group("orientation")
                .filter("rotate={rotate}*PI/180:fillcolor=black"),
            // composite
            T::new("film_grain", Composite, 1.0)
                .group("texture")
                .filter("noise=alls={noise}:allf=t"),
            T::new("sharpen", Composite, 0.8)
                .group("texture")
                .gpu()
                .filter("unsharp=5:5:{sharpen}"),
            T::new("border_pad", Composite, 0.5)
                .cooldown(2)
                .filter("pad=iw+2*{pad_px}:ih+2*{pad_px}:{pad_px}:{pad_px},scale=iw-2*{pad_px}:ih-2*{pad_px}"),
            // encoder: output arguments for a stream-copy remux
            T::new("metadata_scrub", Encoder, 1.0)
                .filter("-map_metadata -1 -metadata comment={nonce}"),
            T::new("handler_rename", Encoder, 0.6)
                .filter("-metadata:s:v:0 handler_name=vh{nonce}"),
            T::new("chapter_strip", Encoder, 0.4)
                .cooldown(1)
                .filter("-map_chapters -1"),
        ];

        // static table, validated by test_builtin_catalog_is_valid
        match Self::new(entries) {
            Ok(catalog) => catalog,
            Err(e) => unreachable!("built-in catalog invalid: {e}"),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TransformationDescriptor> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &TransformationDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.entries.iter().map(|e| e.category).collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries)
    }
}
