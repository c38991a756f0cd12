use std::path::{Path, PathBuf};
use std::time::Duration;

use loanrec_core::{ManifestRegistry, TransitionPolicy};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autosave: AutosaveConfig,
    pub lifecycle: LifecycleConfig,
    pub manifests: ManifestConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Debounce window restarted by every edit.
    pub delay_ms: u64,
    /// Append a `fields_updated` entry for each persisted batch.
    pub summary_history: bool,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_AUTOSAVE_DELAY_MS,
            summary_history: false,
        }
    }
}

impl AutosaveConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub policy: TransitionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "loanrec.db".into(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::from_toml_str(&source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(EngineError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// External manifests when configured, otherwise the built-in set.
    pub fn manifest_registry(&self) -> Result<ManifestRegistry, EngineError> {
        let registry = match &self.manifests.path {
            Some(path) => ManifestRegistry::load(path)?,
            None => ManifestRegistry::builtin()?,
        };
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.autosave.delay(), Duration::from_secs(2));
        assert_eq!(config.lifecycle.policy, TransitionPolicy::Permissive);
        assert!(!config.autosave.summary_history);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [autosave]
            summary_history = true

            [lifecycle]
            policy = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.autosave.delay_ms, DEFAULT_AUTOSAVE_DELAY_MS);
        assert!(config.autosave.summary_history);
        assert_eq!(config.lifecycle.policy, TransitionPolicy::Strict);
        assert_eq!(config.storage.path, "loanrec.db");
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = EngineConfig::from_toml_str("[lifecycle]\npolicy = \"loose\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/loanrec.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn builtin_manifests_when_no_path() {
        let registry = EngineConfig::default().manifest_registry().unwrap();
        assert!(registry.get("Residential NOO - DSCR").is_ok());
    }
}
