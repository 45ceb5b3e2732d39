use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobRefError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} '{value}' may only contain ASCII letters, digits, '-', '_' or '.'")]
    InvalidCharacters { field: &'static str, value: String },
}

/// Which kind of job a label belongs to, e.g. `algorithms`/`job`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawJobClass")]
pub struct JobClass {
    app_label: String,
    model_name: String,
}

#[derive(Deserialize)]
struct RawJobClass {
    app_label: String,
    model_name: String,
}

impl TryFrom<RawJobClass> for JobClass {
    type Error = JobRefError;

    fn try_from(raw: RawJobClass) -> Result<Self, Self::Error> {
        JobClass::new(raw.app_label, raw.model_name)
    }
}

impl JobClass {
    pub fn new(
        app_label: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Result<Self, JobRefError> {
        let app_label = app_label.into();
        let model_name = model_name.into();
        check_name("app_label", &app_label)?;
        check_name("model_name", &model_name)?;
        Ok(Self {
            app_label,
            model_name,
        })
    }

    pub fn algorithm_job() -> Self {
        Self {
            app_label: "algorithms".to_string(),
            model_name: "job".to_string(),
        }
    }

    pub fn evaluation() -> Self {
        Self {
            app_label: "evaluation".to_string(),
            model_name: "evaluation".to_string(),
        }
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Identity of one logical job. Every runtime object created for the job is
/// named after and labeled with [`JobRef::label`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawJobRef")]
pub struct JobRef {
    class: JobClass,
    id: String,
}

#[derive(Deserialize)]
struct RawJobRef {
    class: JobClass,
    id: String,
}

impl TryFrom<RawJobRef> for JobRef {
    type Error = JobRefError;

    fn try_from(raw: RawJobRef) -> Result<Self, Self::Error> {
        JobRef::new(raw.class, raw.id)
    }
}

impl JobRef {
    pub fn new(class: JobClass, id: impl Into<String>) -> Result<Self, JobRefError> {
        let id = id.into();
        check_name("id", &id)?;
        Ok(Self { class, id })
    }

    pub fn class(&self) -> &JobClass {
        &self.class
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}",
            self.class.app_label, self.class.model_name, self.id
        )
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn check_name(field: &'static str, value: &str) -> Result<(), JobRefError> {
    if value.is_empty() {
        return Err(JobRefError::Empty { field });
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(JobRefError::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
