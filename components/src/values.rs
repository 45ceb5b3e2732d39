use crate::interface::ComponentInterface;
use crate::store::BlobKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pixel element type of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
}

impl ElementType {
    pub fn is_integer(self) -> bool {
        !matches!(self, ElementType::Float32 | ElementType::Float64)
    }

    pub fn size_in_bytes(self) -> u64 {
        match self {
            ElementType::UInt8 | ElementType::Int8 => 1,
            ElementType::UInt16 | ElementType::Int16 => 2,
            ElementType::UInt32 | ElementType::Int32 | ElementType::Float32 => 4,
            ElementType::UInt64 | ElementType::Int64 | ElementType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub blob: BlobKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntity {
    pub id: Uuid,
    pub name: String,
    pub element_type: ElementType,
    pub dimensions: Vec<u64>,
    pub files: Vec<StoredFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CivValue {
    Json(Value),
    File(StoredFile),
    Image(ImageEntity),
}

/// A value bound to an interface. Never mutated once created; a new value
/// replaces an old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInterfaceValue {
    pub id: Uuid,
    pub interface: ComponentInterface,
    pub value: CivValue,
    /// Legacy: unzip a `Zip` value into the input prefix instead of copying it.
    #[serde(default)]
    pub decompress: bool,
}

impl ComponentInterfaceValue {
    pub fn new(interface: ComponentInterface, value: CivValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface,
            value,
            decompress: false,
        }
    }

    pub fn json(interface: ComponentInterface, value: Value) -> Self {
        Self::new(interface, CivValue::Json(value))
    }

    pub fn decompressed(mut self) -> Self {
        self.decompress = true;
        self
    }

    pub fn relative_path(&self) -> &str {
        &self.interface.relative_path
    }
}

/// Content of a value that is about to be created by a store.
#[derive(Debug, Clone)]
pub enum NewValue {
    Json(Value),
    File(NewFile),
    Image(NewImage),
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub name: String,
    pub element_type: ElementType,
    pub dimensions: Vec<u64>,
    pub files: Vec<NewFile>,
}
