//! Loading and validation of [`ComponentsSettings`].
//!
//! Settings come from `$CONFIG_DIR/components.json` (default
//! `.components/config`). Schema defaults fill anything the file omits, the
//! merged document is validated against the embedded Draft 7 schema, and
//! `COMPONENTS_*` environment variables override individual fields last.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

mod overrides;

pub use overrides::{EnvSource, ProcessEnv, StaticEnv};

const SETTINGS_SCHEMA: &str = include_str!("../schema/components-settings.v1.json");
const SETTINGS_FILE: &str = "components.json";
const DEFAULT_CONFIG_DIR: &str = ".components/config";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("Invalid value for {variable}: {message}")]
    InvalidOverride { variable: String, message: String },

    #[error("Inconsistent settings: {message}")]
    Inconsistent { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

/// Immutable settings shared by every job a process runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComponentsSettings {
    pub docker: DockerSettings,
    /// Ceiling in GiB; the effective limit is `min(requested, memory_limit)`.
    pub memory_limit: u64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub cpuset_cpus: Option<String>,
    pub pids_limit: i64,
    pub io_image: String,
    pub nvidia_visible_devices: String,
    pub service: ServiceSettings,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DockerSettings {
    pub base_url: Option<String>,
    pub runtime: Option<String>,
    pub timeout_secs: u64,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca_cert: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSettings {
    pub network: String,
    pub http_entrypoint: String,
    pub websocket_entrypoint: String,
    pub api_hostname: String,
}

impl Default for ComponentsSettings {
    fn default() -> Self {
        Self {
            docker: DockerSettings::default(),
            memory_limit: 4,
            cpu_period: 100_000,
            cpu_quota: 100_000,
            cpu_shares: 1024,
            cpuset_cpus: None,
            pids_limit: 128,
            io_image: "alpine:3.16".to_string(),
            nvidia_visible_devices: String::new(),
            service: ServiceSettings::default(),
            debug: false,
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            runtime: None,
            timeout_secs: 120,
            tls: None,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            network: "components_services".to_string(),
            http_entrypoint: "workstation-http".to_string(),
            websocket_entrypoint: "workstation-websocket".to_string(),
            api_hostname: "gc.localhost".to_string(),
        }
    }
}

pub struct SettingsLoader {
    config_dir: PathBuf,
}

impl SettingsLoader {
    pub fn new() -> Self {
        let config_dir = std::env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        Self { config_dir }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    #[instrument(skip(self))]
    pub fn load(&self) -> Result<ComponentsSettings, ConfigError> {
        self.load_with_env(&ProcessEnv)
    }

    #[instrument(skip(self, env))]
    pub fn load_with_env<E: EnvSource + ?Sized>(
        &self,
        env: &E,
    ) -> Result<ComponentsSettings, ConfigError> {
        let path = self.settings_path();
        let file_value = if path.exists() {
            debug!("Loading settings from: {:?}", path);
            read_json(&path)?
        } else {
            debug!("Settings file not found, using schema defaults");
            Value::Object(Map::new())
        };

        let mut merged = schema_defaults()?;
        merge(&mut merged, file_value);
        validate_settings_value(&merged)?;

        overrides::apply(&mut merged, env)?;
        validate_settings_value(&merged)?;

        let settings: ComponentsSettings =
            serde_json::from_value(merged).map_err(|e| ConfigError::JsonParsingFailed {
                message: e.to_string(),
            })?;
        check_consistency(&settings)?;
        Ok(settings)
    }

    /// Validates an explicit settings file without applying overrides.
    #[instrument(skip(self))]
    pub fn validate_file(&self, path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }
        let mut merged = schema_defaults()?;
        merge(&mut merged, read_json(path)?);
        validate_settings_value(&merged)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_settings_value(value: &Value) -> Result<(), ConfigError> {
    let schema = compiled_schema()?;
    if let Err(errors) = schema.validate(value) {
        let validation_errors: Vec<ValidationError> = errors
            .map(|error| ValidationError {
                json_pointer: error.instance_path.to_string(),
                message: error.to_string(),
                schema_path: error.schema_path.to_string(),
            })
            .collect();
        return Err(ConfigError::ValidationFailed {
            errors: validation_errors,
        });
    }
    Ok(())
}

fn compiled_schema() -> Result<JSONSchema, ConfigError> {
    let schema_value = schema_value()?;
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|e| ConfigError::SchemaCompilationFailed {
            message: e.to_string(),
        })
}

fn schema_value() -> Result<Value, ConfigError> {
    serde_json::from_str(SETTINGS_SCHEMA).map_err(|e| ConfigError::SchemaCompilationFailed {
        message: e.to_string(),
    })
}

/// Builds the document implied by the schema's `default` annotations.
pub fn schema_defaults() -> Result<Value, ConfigError> {
    Ok(defaults_for(&schema_value()?))
}

fn defaults_for(schema: &Value) -> Value {
    let mut out = Map::new();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, property) in properties {
            let nested = property.get("properties").is_some();
            match property.get("default") {
                Some(Value::Object(_)) if nested => {
                    out.insert(key.clone(), defaults_for(property));
                }
                Some(Value::Null) | None => {}
                Some(default_value) => {
                    out.insert(key.clone(), default_value.clone());
                }
            }
        }
    }
    Value::Object(out)
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file: {}", e),
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
        message: e.to_string(),
    })
}

fn check_consistency(settings: &ComponentsSettings) -> Result<(), ConfigError> {
    if settings.docker.tls.is_some() && settings.docker.base_url.is_none() {
        return Err(ConfigError::Inconsistent {
            message: "docker.tls requires docker.baseUrl".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> StaticEnv {
        StaticEnv::from_pairs(pairs)
    }

    #[test]
    fn test_schema_defaults_match_default_impl() {
        let defaults: ComponentsSettings =
            serde_json::from_value(schema_defaults().unwrap()).unwrap();
        assert_eq!(defaults, ComponentsSettings::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loader = SettingsLoader::with_dir(temp_dir.path());

        let settings = loader.load_with_env(&env(&[])).unwrap();
        assert_eq!(settings, ComponentsSettings::default());
    }

    #[test]
    fn test_partial_nested_object_keeps_sibling_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("components.json"),
            r#"{"service": {"network": "workstations"}}"#,
        )
        .unwrap();
        let loader = SettingsLoader::with_dir(temp_dir.path());

        let settings = loader.load_with_env(&env(&[])).unwrap();
        assert_eq!(settings.service.network, "workstations");
        assert_eq!(settings.service.http_entrypoint, "workstation-http");
    }

    #[test]
    fn test_tls_without_base_url_is_inconsistent() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("components.json"),
            r#"{"docker": {"tls": {"cert": "c.pem", "key": "k.pem", "caCert": "ca.pem"}}}"#,
        )
        .unwrap();
        let loader = SettingsLoader::with_dir(temp_dir.path());

        let result = loader.load_with_env(&env(&[]));
        assert!(matches!(result, Err(ConfigError::Inconsistent { .. })));
    }

    #[test]
    fn test_merge_replaces_scalars_and_recurses_into_objects() {
        let mut base = serde_json::json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge(&mut base, serde_json::json!({"a": 5, "b": {"d": 4}}));
        assert_eq!(base, serde_json::json!({"a": 5, "b": {"c": 2, "d": 4}}));
    }
}
