//! On-disk job and service manifests. YAML, which also accepts JSON.

use anyhow::{Context, Result};
use components::interface::ComponentInterface;
use components::values::CivValue;
use components::{ComponentInterfaceValue, ImageReference, JobClass, JobRef};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

fn default_memory_limit_gb() -> u64 {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobSection {
    pub app: String,
    pub model: String,
    pub id: String,
}

impl JobSection {
    pub fn job_ref(&self) -> Result<JobRef> {
        let class = JobClass::new(&self.app, &self.model)?;
        Ok(JobRef::new(class, &self.id)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InputEntry {
    pub interface: ComponentInterface,
    /// `{json: ...}`, `{file: {name, blob}}` or `{image: {...}}`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub value: CivValue,
    /// Directory below `/input/` to place the value in.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub decompress: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobManifest {
    pub job: JobSection,
    pub image: ImageReference,
    #[serde(default = "default_memory_limit_gb")]
    pub memory_limit_gb: u64,
    #[serde(default)]
    pub inputs: Vec<InputEntry>,
    #[serde(default)]
    pub outputs: Vec<ComponentInterface>,
}

impl JobManifest {
    /// Input values paired with their prefix overrides.
    pub fn input_values(&self) -> (Vec<ComponentInterfaceValue>, Vec<(Uuid, String)>) {
        let mut values = Vec::with_capacity(self.inputs.len());
        let mut prefixes = Vec::new();
        for entry in &self.inputs {
            let mut civ = ComponentInterfaceValue::new(entry.interface.clone(), entry.value.clone());
            if entry.decompress {
                civ = civ.decompressed();
            }
            if let Some(prefix) = &entry.prefix {
                prefixes.push((civ.id, prefix.clone()));
            }
            values.push(civ);
        }
        (values, prefixes)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceManifest {
    pub job: JobSection,
    pub image: ImageReference,
    #[serde(default = "default_memory_limit_gb")]
    pub memory_limit_gb: u64,
    pub hostname: String,
    pub http_port: u16,
    pub websocket_port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use components::interface::InterfaceKind;

    const MANIFEST: &str = r#"
job:
  app: algorithms
  model: job
  id: "0b5c"
image:
  digest: "sha256:3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b"
  blob: images/algorithm.tar
memoryLimitGb: 2
inputs:
  - interface: {slug: flag, title: Flag, kind: bool, relativePath: flag.json}
    value: {json: true}
    prefix: case-1/
  - interface: {slug: gt, title: Ground truth, kind: zip, relativePath: gt.zip}
    value: {file: {name: gt.zip, blob: uploads/gt.zip}}
    decompress: true
outputs:
  - {slug: result, title: Result, kind: bool, relativePath: result.json}
"#;

    #[test]
    fn test_job_manifest_parses_inputs_and_prefixes() {
        let manifest: JobManifest = serde_yaml::from_str(MANIFEST).unwrap();

        assert_eq!(manifest.job.job_ref().unwrap().label(), "algorithms-job-0b5c");
        assert_eq!(manifest.memory_limit_gb, 2);
        assert_eq!(manifest.outputs[0].kind, InterfaceKind::Bool);

        let (values, prefixes) = manifest.input_values();
        assert_eq!(values.len(), 2);
        assert_eq!(prefixes, vec![(values[0].id, "case-1/".to_string())]);
        assert!(values[1].decompress);
    }

    #[test]
    fn test_input_values_are_single_key_maps() {
        let manifest: JobManifest = serde_yaml::from_str(MANIFEST).unwrap();

        assert_eq!(manifest.inputs[0].value, CivValue::Json(serde_json::json!(true)));
        match &manifest.inputs[1].value {
            CivValue::File(file) => {
                assert_eq!(file.name, "gt.zip");
                assert_eq!(file.blob.as_str(), "uploads/gt.zip");
            }
            other => panic!("expected a stored file, got {other:?}"),
        }
    }

    #[test]
    fn test_json_manifest_is_accepted() {
        let manifest = r#"{
            "job": {"app": "algorithms", "model": "job", "id": "1"},
            "image": {"digest": "sha256:3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b", "blob": "a.tar"},
            "inputs": [{
                "interface": {"slug": "n", "title": "N", "kind": "integer", "relativePath": "n.json"},
                "value": {"json": 3}
            }]
        }"#;
        let manifest: JobManifest = serde_yaml::from_str(manifest).unwrap();

        assert_eq!(manifest.memory_limit_gb, 4);
        assert_eq!(manifest.inputs[0].value, CivValue::Json(serde_json::json!(3)));
    }

    #[test]
    fn test_invalid_digest_is_rejected() {
        let manifest = MANIFEST.replace("sha256:3b", "sha256:zz");

        assert!(serde_yaml::from_str::<JobManifest>(&manifest).is_err());
    }

    #[test]
    fn test_unsafe_job_id_is_rejected() {
        let manifest: JobManifest =
            serde_yaml::from_str(&MANIFEST.replace("id: \"0b5c\"", "id: ../x")).unwrap();

        assert!(manifest.job.job_ref().is_err());
    }
}
