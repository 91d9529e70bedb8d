//! Configuration system for Medflow.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment variables -> explicit overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::definition::RetryPolicy;
use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedflowConfig {
    pub orchestrator: OrchestratorConfig,
    pub audit: AuditConfig,
    pub storage: StorageConfig,
    pub redaction: RedactionConfig,
    /// Defaults to two offline mock providers, `primary` and `secondary`.
    pub providers: Vec<ProviderConfig>,
}

impl Default for MedflowConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            audit: AuditConfig::default(),
            storage: StorageConfig::default(),
            redaction: RedactionConfig::default(),
            providers: vec![ProviderConfig::mock("primary"), ProviderConfig::mock("secondary")],
        }
    }
}

/// Execution limits and defaults applied to steps that don't override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on steps executing at once across all instances.
    pub max_concurrent_steps: usize,
    pub default_step_timeout_secs: u64,
    pub default_retry: RetryPolicy,
    /// How often a step result is re-applied after a stale write before the
    /// conflict is surfaced.
    pub max_commit_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            default_step_timeout_secs: 120,
            default_retry: RetryPolicy::default(),
            max_commit_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    /// Log file for the `jsonl` backend.
    pub path: Option<PathBuf>,
    /// Link entries into a SHA-256 hash chain.
    pub hash_chain: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Memory,
            path: None,
            hash_chain: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the `file` backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Scrub PHI from prompts before they reach a provider.
    pub enabled: bool,
    /// Also scrub string values inside the structured context.
    pub redact_context: bool,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_context: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Mock,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key. Keys never live in config files.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub input_cost_per_million: f64,
    #[serde(default)]
    pub output_cost_per_million: f64,
}

impl ProviderConfig {
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Mock,
            base_url: None,
            model: None,
            api_key_env: None,
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
        }
    }
}

impl MedflowConfig {
    /// Check cross-field constraints figment cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_concurrent_steps == 0 {
            return Err(ConfigError::Invalid {
                message: "orchestrator.max_concurrent_steps must be at least 1".into(),
            });
        }
        if self.orchestrator.max_commit_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "orchestrator.max_commit_attempts must be at least 1".into(),
            });
        }
        self.orchestrator
            .default_retry
            .check()
            .map_err(|reason| ConfigError::Invalid {
                message: format!("orchestrator.default_retry: {reason}"),
            })?;
        if self.audit.backend == AuditBackend::Jsonl && self.audit.path.is_none() {
            return Err(ConfigError::MissingField {
                field: "audit.path".into(),
            });
        }
        if self.storage.backend == StorageBackend::File && self.storage.path.is_none() {
            return Err(ConfigError::MissingField {
                field: "storage.path".into(),
            });
        }
        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("provider '{}' is configured twice", provider.name),
                });
            }
        }
        Ok(())
    }
}

/// Path of the per-user config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "medflow", "medflow")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration by merging layers, lowest priority first:
///
/// 1. Built-in defaults
/// 2. User config (`~/.config/medflow/config.toml`)
/// 3. The explicit `config_file`, if given
/// 4. Environment variables (`MEDFLOW_AUDIT__BACKEND`, `MEDFLOW_ORCHESTRATOR__MAX_CONCURRENT_STEPS`, ...)
/// 5. Explicit overrides
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&MedflowConfig>,
) -> Result<MedflowConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(MedflowConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("MEDFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: MedflowConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Backoff;

    #[test]
    fn test_defaults() {
        let config = MedflowConfig::default();
        assert_eq!(config.orchestrator.default_step_timeout_secs, 120);
        assert_eq!(config.audit.backend, AuditBackend::Memory);
        assert!(config.redaction.enabled);
        assert_eq!(config.providers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = MedflowConfig::default();
        overrides.orchestrator.default_step_timeout_secs = 15;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.orchestrator.default_step_timeout_secs, 15);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medflow.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
default_step_timeout_secs = 45

[orchestrator.default_retry]
max_attempts = 5
backoff = { strategy = "fixed", delay_ms = 100 }

[audit]
backend = "jsonl"
path = "/var/log/medflow/audit.jsonl"

[[providers]]
name = "primary"
kind = "openai_compatible"
base_url = "http://localhost:8000/v1"
model = "clinical-7b"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.orchestrator.default_step_timeout_secs, 45);
        assert_eq!(config.orchestrator.default_retry.max_attempts, 5);
        assert_eq!(
            config.orchestrator.default_retry.backoff,
            Backoff::Fixed { delay_ms: 100 }
        );
        assert_eq!(config.audit.backend, AuditBackend::Jsonl);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::OpenAiCompatible);
    }

    #[test]
    fn test_load_demo_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/medflow.toml");
        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.audit.backend, AuditBackend::Jsonl);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].kind, ProviderKind::OpenAiCompatible);
        assert_eq!(config.providers[1].kind, ProviderKind::Mock);
    }

    #[test]
    fn test_provider_kind_names() {
        let kind: ProviderKind = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAiCompatible);
        assert_eq!(
            serde_json::to_string(&ProviderKind::OpenAiCompatible).unwrap(),
            "\"openai_compatible\""
        );
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/medflow.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_jsonl_audit_requires_path() {
        let mut config = MedflowConfig::default();
        config.audit.backend = AuditBackend::Jsonl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut config = MedflowConfig::default();
        config.providers.push(ProviderConfig::mock("primary"));
        assert!(config.validate().is_err());
    }
}
