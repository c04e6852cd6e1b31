//! Engine configuration
//!
//! One JSON document, every field defaulted. Validated once at startup into a
//! [`ValidatedConfig`]; nothing downstream re-checks bounds or constraints.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::device::DeviceConfig;
use crate::errors::ConfigError;
use crate::ledger::CooldownUnit;
use crate::params::{ParameterBounds, ValidatedBounds};
use crate::quality_gate::QualityCheck;
use crate::selector::SelectionConstraints;

/// Forces the CPU path for every stage when set to `1`/`true`
pub const FORCE_CPU_ENV: &str = "VID_VARIANT_FORCE_CPU";
/// Overrides `ledger_path`
pub const LEDGER_ENV: &str = "VID_VARIANT_LEDGER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub selection: SelectionConstraints,
    pub cooldown_unit: CooldownUnit,
    pub parameters: ParameterBounds,
    pub devices: DeviceConfig,
    pub quality_checks: Vec<QualityCheck>,
    /// Select/execute/gate attempts per variant
    pub max_attempts: u32,
    /// Parallel runs; `None` = thread manager default
    pub workers: Option<usize>,
    pub ledger_path: Option<PathBuf>,
    /// JSON catalog; `None` = built-in catalog
    pub catalog_path: Option<PathBuf>,
    /// Keep per-attempt intermediate files
    pub keep_intermediates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            selection: SelectionConstraints::default(),
            cooldown_unit: CooldownUnit::Runs,
            parameters: ParameterBounds::default(),
            devices: DeviceConfig::default(),
            quality_checks: QualityCheck::defaults(),
            max_attempts: 3,
            workers: None,
            ledger_path: None,
            catalog_path: None,
            keep_intermediates: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Apply `VID_VARIANT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get(FORCE_CPU_ENV) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.devices.force_cpu = true,
                "0" | "false" | "no" | "" => {}
                other => warn!(var = FORCE_CPU_ENV, value = other, "Ignoring unrecognized value"),
            }
        }
        if let Some(path) = get(LEDGER_ENV).filter(|p| !p.trim().is_empty()) {
            self.ledger_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        self.selection.validate()?;
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        for check in &self.quality_checks {
            let bad_ratio = matches!(
                check,
                QualityCheck::SizeWithinBounds { max_ratio, .. } if !(*max_ratio > 0.0)
            );
            let bad_bitrate = matches!(
                check,
                QualityCheck::BitrateWithinBounds { min_kbps, max_kbps } if min_kbps > max_kbps
            );
            if bad_ratio || bad_bitrate {
                return Err(ConfigError::Invalid(format!(
                    "quality check '{}' has inconsistent bounds",
                    check.name()
                )));
            }
        }
        let bounds = self.parameters.clone().validate()?;
        Ok(ValidatedConfig {
            config: self,
            bounds,
        })
    }
}

/// Configuration that passed [`EngineConfig::validate`]
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    config: EngineConfig,
    bounds: ValidatedBounds,
}

impl ValidatedConfig {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bounds(&self) -> &ValidatedBounds {
        &self.bounds
    }

    pub fn selection(&self) -> &SelectionConstraints {
        &self.config.selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Category;
    use crate::errors::{ParamError, SelectionError};
    use std::collections::HashMap;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document() {
        let json = r#"{
            "selection": {"min": 1, "max": 3, "required_categories": ["audio"], "quota_policy": "strict"},
            "cooldown_unit": "seconds",
            "devices": {"slots": 2},
            "max_attempts": 5
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.selection.max, 3);
        assert_eq!(config.selection.required_categories, vec![Category::Audio]);
        assert_eq!(config.selection.retry_factor, 10);
        assert_eq!(config.cooldown_unit, CooldownUnit::Seconds);
        assert_eq!(config.devices.slots, 2);
        assert_eq!(config.devices.acquire_timeout_ms, 5_000);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.selection.min = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Selection(SelectionError::InvalidConstraints(_)))
        ));

        let mut config = EngineConfig::default();
        config.parameters.audio_sample_rate.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Params(ParamError::EmptyOptions { .. }))
        ));

        let config = EngineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            [(FORCE_CPU_ENV, "true"), (LEDGER_ENV, "/var/lib/vv/ledger.json")].into();
        let mut config = EngineConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(config.devices.force_cpu);
        assert_eq!(
            config.ledger_path,
            Some(PathBuf::from("/var/lib/vv/ledger.json"))
        );

        let mut config = EngineConfig::default();
        config.apply_overrides(|_| Some("0".to_string()));
        assert!(!config.devices.force_cpu);
    }
}
