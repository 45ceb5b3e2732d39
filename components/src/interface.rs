//! Component interfaces: the typed slots a component reads from `/input/`
//! and writes to `/output/`.

use crate::import::ImportedImage;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    String,
    Integer,
    Float,
    Bool,
    AnyJson,
    Chart,
    TwoDBoundingBox,
    MultipleTwoDBoundingBoxes,
    DistanceMeasurement,
    MultipleDistanceMeasurements,
    Point,
    MultiplePoints,
    Polygon,
    MultiplePolygons,
    Csv,
    Zip,
    Pdf,
    ThumbnailJpg,
    ThumbnailPng,
    Image,
    Segmentation,
    HeatMap,
}

/// How values of a kind are stored and harvested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperKind {
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Stored,
}

impl InterfaceKind {
    pub fn super_kind(self) -> SuperKind {
        match self {
            InterfaceKind::Image | InterfaceKind::Segmentation | InterfaceKind::HeatMap => {
                SuperKind::Image
            }
            _ => SuperKind::File,
        }
    }

    /// `None` for image kinds.
    pub fn file_format(self) -> Option<FileFormat> {
        match self {
            InterfaceKind::Image | InterfaceKind::Segmentation | InterfaceKind::HeatMap => None,
            InterfaceKind::Csv
            | InterfaceKind::Zip
            | InterfaceKind::Pdf
            | InterfaceKind::ThumbnailJpg
            | InterfaceKind::ThumbnailPng => Some(FileFormat::Stored),
            _ => Some(FileFormat::Json),
        }
    }

    pub fn is_json(self) -> bool {
        self.file_format() == Some(FileFormat::Json)
    }

    fn extensions(self) -> &'static [&'static str] {
        match self.file_format() {
            Some(FileFormat::Json) => &[".json"],
            None => &[],
            Some(FileFormat::Stored) => match self {
                InterfaceKind::Csv => &[".csv"],
                InterfaceKind::Zip => &[".zip"],
                InterfaceKind::Pdf => &[".pdf"],
                InterfaceKind::ThumbnailJpg => &[".jpg", ".jpeg"],
                _ => &[".png"],
            },
        }
    }

    /// Built-in schema every JSON value of this kind must satisfy.
    pub fn value_schema(self) -> Option<Value> {
        let point = json!({
            "type": "array",
            "items": {"type": "number"},
            "minItems": 3,
            "maxItems": 3
        });
        let line = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "start": point, "end": point},
            "required": ["start", "end"]
        });
        let corners = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "corners": {"type": "array", "items": point, "minItems": 4, "maxItems": 4}
            },
            "required": ["corners"]
        });
        let named_point = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "point": point},
            "required": ["point"]
        });
        let polygon = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "seed_point": point,
                "path_points": {"type": "array", "items": point},
                "sub_type": {"type": "string"},
                "groups": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["name", "seed_point", "path_points", "sub_type", "groups"]
        });
        let schema = match self {
            InterfaceKind::String => json!({"type": "string"}),
            InterfaceKind::Integer => json!({"type": "integer"}),
            InterfaceKind::Float => json!({"type": "number"}),
            InterfaceKind::Bool => json!({"type": "boolean"}),
            InterfaceKind::AnyJson => json!({}),
            InterfaceKind::Chart => json!({"type": "object"}),
            InterfaceKind::TwoDBoundingBox => annotation(
                "2D bounding box",
                corners["properties"].clone(),
                &["corners"],
            ),
            InterfaceKind::MultipleTwoDBoundingBoxes => annotation(
                "Multiple 2D bounding boxes",
                json!({"boxes": {"type": "array", "items": corners}}),
                &["boxes"],
            ),
            InterfaceKind::DistanceMeasurement => annotation(
                "Distance measurement",
                line["properties"].clone(),
                &["start", "end"],
            ),
            InterfaceKind::MultipleDistanceMeasurements => annotation(
                "Multiple distance measurements",
                json!({"lines": {"type": "array", "items": line}}),
                &["lines"],
            ),
            InterfaceKind::Point => {
                annotation("Point", named_point["properties"].clone(), &["point"])
            }
            InterfaceKind::MultiplePoints => annotation(
                "Multiple points",
                json!({"points": {"type": "array", "items": named_point}}),
                &["points"],
            ),
            InterfaceKind::Polygon => polygon,
            InterfaceKind::MultiplePolygons => annotation(
                "Multiple polygons",
                json!({"polygons": {"type": "array", "items": polygon}}),
                &["polygons"],
            ),
            _ => return None,
        };
        Some(schema)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("Relative path cannot be empty")]
    EmptyPath,
    #[error("Relative path {path} must be relative and must not contain '..'")]
    UnsafePath { path: String },
    #[error("Interface of kind {kind:?} must have a relative path ending in one of {expected:?}")]
    WrongExtension {
        kind: InterfaceKind,
        expected: &'static [&'static str],
    },
    #[error("Additional schema for {slug} is only allowed on JSON kinds")]
    SchemaNotAllowed { slug: String },
    #[error("Additional schema for {slug} is invalid: {message}")]
    InvalidSchema { slug: String, message: String },
}

/// Reason a candidate value was refused by an interface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValueRejected {
    pub message: String,
}

impl ValueRejected {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawInterface")]
pub struct ComponentInterface {
    pub slug: String,
    pub title: String,
    pub kind: InterfaceKind,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInterface {
    slug: String,
    title: String,
    kind: InterfaceKind,
    relative_path: String,
    #[serde(default)]
    schema: Option<Value>,
}

impl TryFrom<RawInterface> for ComponentInterface {
    type Error = InterfaceError;

    fn try_from(raw: RawInterface) -> Result<Self, Self::Error> {
        let interface = ComponentInterface::new(raw.slug, raw.title, raw.kind, raw.relative_path)?;
        match raw.schema {
            Some(schema) => interface.with_schema(schema),
            None => Ok(interface),
        }
    }
}

impl ComponentInterface {
    pub fn new(
        slug: impl Into<String>,
        title: impl Into<String>,
        kind: InterfaceKind,
        relative_path: impl Into<String>,
    ) -> Result<Self, InterfaceError> {
        let interface = Self {
            slug: slug.into(),
            title: title.into(),
            kind,
            relative_path: relative_path.into(),
            schema: None,
        };
        interface.check_relative_path()?;
        Ok(interface)
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, InterfaceError> {
        if !self.kind.is_json() {
            return Err(InterfaceError::SchemaNotAllowed { slug: self.slug });
        }
        compile(&schema).map_err(|message| InterfaceError::InvalidSchema {
            slug: self.slug.clone(),
            message,
        })?;
        self.schema = Some(schema);
        Ok(self)
    }

    pub fn super_kind(&self) -> SuperKind {
        self.kind.super_kind()
    }

    fn check_relative_path(&self) -> Result<(), InterfaceError> {
        let path = self.relative_path.as_str();
        if path.is_empty() {
            return Err(InterfaceError::EmptyPath);
        }
        if path.starts_with('/') || path.split('/').any(|part| part == "..") {
            return Err(InterfaceError::UnsafePath {
                path: path.to_string(),
            });
        }
        let extensions = self.kind.extensions();
        let lower = path.to_ascii_lowercase();
        if !extensions.is_empty() && !extensions.iter().any(|ext| lower.ends_with(ext)) {
            return Err(InterfaceError::WrongExtension {
                kind: self.kind,
                expected: extensions,
            });
        }
        Ok(())
    }

    /// Checks a JSON value against the kind's schema and the interface schema.
    pub fn validate_value(&self, value: &Value) -> Result<(), ValueRejected> {
        if !self.kind.is_json() {
            return Err(ValueRejected::new(format!(
                "{} does not accept JSON values",
                self.slug
            )));
        }
        let schemas = self.kind.value_schema().into_iter().chain(self.schema.clone());
        for schema in schemas {
            let compiled = compile(&schema).map_err(ValueRejected::new)?;
            let result = compiled.validate(value).map_err(|errors| {
                errors
                    .map(|error| error.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            result.map_err(ValueRejected::new)?;
        }
        Ok(())
    }

    /// Checks the content signature of a stored-file value.
    pub fn validate_file(&self, content: &[u8]) -> Result<(), ValueRejected> {
        let valid = match self.kind {
            InterfaceKind::Csv => std::str::from_utf8(content).is_ok(),
            InterfaceKind::Zip => {
                content.starts_with(b"PK\x03\x04") || content.starts_with(b"PK\x05\x06")
            }
            InterfaceKind::Pdf => content.starts_with(b"%PDF-"),
            InterfaceKind::ThumbnailJpg => content.starts_with(&[0xFF, 0xD8, 0xFF]),
            InterfaceKind::ThumbnailPng => {
                content.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
            }
            _ => {
                return Err(ValueRejected::new(format!(
                    "{} does not accept stored files",
                    self.slug
                )))
            }
        };
        if valid {
            Ok(())
        } else {
            Err(ValueRejected::new(format!(
                "Content is not a valid {:?} file",
                self.kind
            )))
        }
    }

    pub fn validate_image(&self, image: &ImportedImage) -> Result<(), ValueRejected> {
        match self.kind {
            InterfaceKind::Segmentation if !image.element_type.is_integer() => {
                Err(ValueRejected::new(format!(
                    "Segmentations must have an integer element type, {} has {:?}",
                    image.name, image.element_type
                )))
            }
            InterfaceKind::Image | InterfaceKind::Segmentation | InterfaceKind::HeatMap => Ok(()),
            _ => Err(ValueRejected::new(format!(
                "{} does not accept images",
                self.slug
            ))),
        }
    }
}

fn annotation(type_name: &str, body: Value, required: &[&str]) -> Value {
    let mut properties = json!({
        "type": {"const": type_name},
        "version": {
            "type": "object",
            "additionalProperties": {"type": "number"},
            "required": ["major", "minor"]
        }
    });
    if let (Some(target), Value::Object(extra)) = (properties.as_object_mut(), body) {
        target.extend(extra);
    }
    let mut needed = vec!["type", "version"];
    needed.extend_from_slice(required);
    json!({"type": "object", "properties": properties, "required": needed})
}

fn compile(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| e.to_string())
}
