use crate::ConfigError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Source of `COMPONENTS_*` override variables.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads overrides from the process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed variable set, for callers that must not touch the process environment.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv(pub HashMap<String, String>);

impl StaticEnv {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl EnvSource for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Text,
    /// Empty means unset.
    OptionalText,
    Integer,
    Flag,
}

const OVERRIDES: &[(&str, &[&str], Kind)] = &[
    ("COMPONENTS_DOCKER_BASE_URL", &["docker", "baseUrl"], Kind::OptionalText),
    ("COMPONENTS_DOCKER_RUNTIME", &["docker", "runtime"], Kind::OptionalText),
    ("COMPONENTS_DOCKER_TIMEOUT", &["docker", "timeoutSecs"], Kind::Integer),
    ("COMPONENTS_MEMORY_LIMIT", &["memoryLimit"], Kind::Integer),
    ("COMPONENTS_CPU_PERIOD", &["cpuPeriod"], Kind::Integer),
    ("COMPONENTS_CPU_QUOTA", &["cpuQuota"], Kind::Integer),
    ("COMPONENTS_CPU_SHARES", &["cpuShares"], Kind::Integer),
    ("COMPONENTS_CPUSET_CPUS", &["cpusetCpus"], Kind::OptionalText),
    ("COMPONENTS_PIDS_LIMIT", &["pidsLimit"], Kind::Integer),
    ("COMPONENTS_IO_IMAGE", &["ioImage"], Kind::Text),
    ("COMPONENTS_NVIDIA_VISIBLE_DEVICES", &["nvidiaVisibleDevices"], Kind::Text),
    ("COMPONENTS_SERVICE_NETWORK", &["service", "network"], Kind::Text),
    ("COMPONENTS_HTTP_ENTRYPOINT", &["service", "httpEntrypoint"], Kind::Text),
    ("COMPONENTS_WEBSOCKET_ENTRYPOINT", &["service", "websocketEntrypoint"], Kind::Text),
    ("COMPONENTS_API_HOSTNAME", &["service", "apiHostname"], Kind::Text),
    ("COMPONENTS_DEBUG", &["debug"], Kind::Flag),
];

const TLS_VERIFY: &str = "COMPONENTS_DOCKER_TLSVERIFY";
const TLS_FILES: &[(&str, &str)] = &[
    ("COMPONENTS_DOCKER_TLSCERT", "cert"),
    ("COMPONENTS_DOCKER_TLSKEY", "key"),
    ("COMPONENTS_DOCKER_TLSCACERT", "caCert"),
];

pub(crate) fn apply<E: EnvSource + ?Sized>(settings: &mut Value, env: &E) -> Result<(), ConfigError> {
    for (variable, path, kind) in OVERRIDES {
        let Some(raw) = env.var(variable) else {
            continue;
        };
        let value = convert(variable, raw.trim(), *kind)?;
        debug!(variable, "Applying settings override");
        set_path(settings, path, value);
    }

    if let Some(raw) = env.var(TLS_VERIFY) {
        if convert_flag(TLS_VERIFY, raw.trim())? {
            let mut tls = Map::new();
            for (variable, field) in TLS_FILES {
                let path = env.var(variable).ok_or_else(|| ConfigError::InvalidOverride {
                    variable: (*variable).to_string(),
                    message: format!("required when {} is set", TLS_VERIFY),
                })?;
                tls.insert((*field).to_string(), Value::String(path));
            }
            set_path(settings, &["docker", "tls"], Value::Object(tls));
        } else {
            set_path(settings, &["docker", "tls"], Value::Null);
        }
    }
    Ok(())
}

fn convert(variable: &str, raw: &str, kind: Kind) -> Result<Value, ConfigError> {
    match kind {
        Kind::Text => Ok(Value::String(raw.to_string())),
        Kind::OptionalText if raw.is_empty() => Ok(Value::Null),
        Kind::OptionalText => Ok(Value::String(raw.to_string())),
        Kind::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| ConfigError::InvalidOverride {
                variable: variable.to_string(),
                message: e.to_string(),
            }),
        Kind::Flag => convert_flag(variable, raw).map(Value::Bool),
    }
}

fn convert_flag(variable: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidOverride {
            variable: variable.to_string(),
            message: format!("expected a boolean, got {:?}", other),
        }),
    }
}

fn set_path(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert((*last).to_string(), value);
    }
}
