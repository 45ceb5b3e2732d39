//! Image import: turns a directory of files produced by a component into
//! image entities.
//!
//! Builders run in order; each sees only the files that earlier builders did
//! not consume. Files no builder accepts are reported per file rather than
//! failing the whole import.

use crate::values::ElementType;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedImage {
    pub name: String,
    pub element_type: ElementType,
    pub dimensions: Vec<u64>,
    /// Files that make up the image, absolute.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ImportResult {
    pub new_images: Vec<ImportedImage>,
    pub file_errors: BTreeMap<PathBuf, String>,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("failed to walk {dir}: {source}")]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

pub trait ImageImporter: Send + Sync {
    fn import(&self, dir: &Path) -> Result<ImportResult, ImportError>;
}

/// What a builder made of the files it was offered.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub images: Vec<ImportedImage>,
    pub consumed: BTreeSet<PathBuf>,
    pub errors: BTreeMap<PathBuf, String>,
}

pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, files: &BTreeSet<PathBuf>) -> BuildOutcome;
}

/// Runs a fixed chain of builders over every file below a directory.
pub struct BasicImageImporter {
    builders: Vec<Box<dyn ImageBuilder>>,
}

impl BasicImageImporter {
    pub fn new(builders: Vec<Box<dyn ImageBuilder>>) -> Self {
        Self { builders }
    }
}

impl Default for BasicImageImporter {
    fn default() -> Self {
        Self::new(vec![Box::new(MetaImageBuilder), Box::new(TiffBuilder)])
    }
}

impl ImageImporter for BasicImageImporter {
    fn import(&self, dir: &Path) -> Result<ImportResult, ImportError> {
        let mut remaining = BTreeSet::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(|source| ImportError::Walk {
                dir: dir.to_path_buf(),
                source,
            })?;
            if entry.file_type().is_file() {
                remaining.insert(entry.into_path());
            }
        }

        let mut result = ImportResult::default();
        for builder in &self.builders {
            if remaining.is_empty() {
                break;
            }
            let outcome = builder.build(&remaining);
            debug!(
                builder = builder.name(),
                images = outcome.images.len(),
                consumed = outcome.consumed.len(),
                "Ran image builder"
            );
            for path in &outcome.consumed {
                remaining.remove(path);
                result.file_errors.remove(path);
            }
            for (path, error) in outcome.errors {
                if remaining.contains(&path) {
                    result.file_errors.entry(path).or_insert(error);
                }
            }
            result.new_images.extend(outcome.images);
        }
        for path in remaining {
            result
                .file_errors
                .entry(path)
                .or_insert_with(|| "File could not be imported by any builder".to_string());
        }
        Ok(result)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

const MAX_HEADER_LINES: usize = 256;

/// Builds images from MetaImage files: `.mha` with inline data and `.mhd`
/// headers pointing at a separate data file.
pub struct MetaImageBuilder;

#[derive(Debug)]
struct MetaHeader {
    fields: BTreeMap<String, String>,
    length: u64,
}

impl MetaHeader {
    fn read(path: &Path) -> Result<Self, String> {
        let file = File::open(path).map_err(|e| e.to_string())?;
        let mut reader = BufReader::new(file);
        let mut fields = BTreeMap::new();
        let mut length = 0u64;
        let mut line = Vec::new();
        for _ in 0..MAX_HEADER_LINES {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| e.to_string())?;
            if read == 0 {
                break;
            }
            length += read as u64;
            let text = std::str::from_utf8(&line).map_err(|_| "Header is not text".to_string())?;
            let (key, value) = text
                .split_once('=')
                .ok_or_else(|| format!("Malformed header line {:?}", text.trim()))?;
            let key = key.trim().to_string();
            let is_last = key == "ElementDataFile";
            fields.insert(key, value.trim().to_string());
            if is_last {
                return Ok(Self { fields, length });
            }
        }
        Err("Header does not declare ElementDataFile".to_string())
    }

    fn get(&self, key: &str) -> Result<&str, String> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| format!("Header is missing {}", key))
    }

    fn image(&self, name: String, files: Vec<PathBuf>, data_len: u64) -> Result<ImportedImage, String> {
        if self.get("ObjectType")? != "Image" {
            return Err("ObjectType must be Image".to_string());
        }
        let ndims: usize = self
            .get("NDims")?
            .parse()
            .map_err(|_| "NDims is not a number".to_string())?;
        let dimensions = self
            .get("DimSize")?
            .split_whitespace()
            .map(|d| d.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| "DimSize is not a list of numbers".to_string())?;
        if dimensions.len() != ndims {
            return Err(format!(
                "DimSize has {} entries but NDims is {}",
                dimensions.len(),
                ndims
            ));
        }
        let element_type = meta_element_type(self.get("ElementType")?)?;
        let channels: u64 = match self.fields.get("ElementNumberOfChannels") {
            Some(value) => value
                .parse()
                .map_err(|_| "ElementNumberOfChannels is not a number".to_string())?,
            None => 1,
        };
        let compressed = self
            .fields
            .get("CompressedData")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !compressed {
            let expected = dimensions
                .iter()
                .product::<u64>()
                .saturating_mul(channels)
                .saturating_mul(element_type.size_in_bytes());
            if data_len < expected {
                return Err(format!(
                    "Element data holds {} bytes, expected {}",
                    data_len, expected
                ));
            }
        }
        Ok(ImportedImage {
            name,
            element_type,
            dimensions,
            files,
        })
    }
}

fn meta_element_type(value: &str) -> Result<ElementType, String> {
    Ok(match value {
        "MET_UCHAR" => ElementType::UInt8,
        "MET_CHAR" => ElementType::Int8,
        "MET_USHORT" => ElementType::UInt16,
        "MET_SHORT" => ElementType::Int16,
        "MET_UINT" => ElementType::UInt32,
        "MET_INT" => ElementType::Int32,
        "MET_ULONG_LONG" | "MET_ULONG" => ElementType::UInt64,
        "MET_LONG_LONG" | "MET_LONG" => ElementType::Int64,
        "MET_FLOAT" => ElementType::Float32,
        "MET_DOUBLE" => ElementType::Float64,
        other => return Err(format!("Unsupported ElementType {}", other)),
    })
}

impl MetaImageBuilder {
    fn build_one(&self, header_path: &Path, files: &BTreeSet<PathBuf>) -> Result<ImportedImage, String> {
        let header = MetaHeader::read(header_path)?;
        let data_file = header.get("ElementDataFile")?;
        let file_len = |path: &Path| -> Result<u64, String> {
            std::fs::metadata(path)
                .map(|m| m.len())
                .map_err(|e| e.to_string())
        };
        match extension(header_path).as_deref() {
            Some("mha") => {
                if data_file != "LOCAL" {
                    return Err("ElementDataFile must be LOCAL in a .mha file".to_string());
                }
                let data_len = file_len(header_path)?.saturating_sub(header.length);
                header.image(file_name(header_path), vec![header_path.to_path_buf()], data_len)
            }
            _ => {
                let parent = header_path.parent().unwrap_or_else(|| Path::new(""));
                let data_path = parent.join(data_file);
                if data_file.contains('/') || !files.contains(&data_path) {
                    return Err(format!("Element data file {} not found", data_file));
                }
                let data_len = file_len(&data_path)?;
                header.image(
                    file_name(header_path),
                    vec![header_path.to_path_buf(), data_path],
                    data_len,
                )
            }
        }
    }
}

impl ImageBuilder for MetaImageBuilder {
    fn name(&self) -> &'static str {
        "metaimage"
    }

    fn build(&self, files: &BTreeSet<PathBuf>) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        for path in files {
            if !matches!(extension(path).as_deref(), Some("mha") | Some("mhd")) {
                continue;
            }
            match self.build_one(path, files) {
                Ok(image) => {
                    outcome.consumed.extend(image.files.iter().cloned());
                    outcome.images.push(image);
                }
                Err(error) => {
                    outcome.errors.insert(path.clone(), error);
                }
            }
        }
        outcome
    }
}

/// Builds images from baseline TIFF files by reading the first IFD.
pub struct TiffBuilder;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

struct TiffReader {
    file: File,
    little_endian: bool,
}

impl TiffReader {
    fn open(path: &Path) -> Result<(Self, u32), String> {
        let mut file = File::open(path).map_err(|e| e.to_string())?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|_| "File is too short to be a TIFF".to_string())?;
        let little_endian = match &header[..4] {
            b"II*\0" => true,
            b"MM\0*" => false,
            _ => return Err("Not a TIFF file".to_string()),
        };
        let mut reader = Self {
            file,
            little_endian,
        };
        let offset = reader.u32_from(&header[4..8]);
        Ok((reader, offset))
    }

    fn u16_from(&self, bytes: &[u8]) -> u16 {
        let bytes = [bytes[0], bytes[1]];
        if self.little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        }
    }

    fn u32_from(&self, bytes: &[u8]) -> u32 {
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    /// First value of each tag in the first IFD.
    fn first_ifd(&mut self, offset: u32) -> Result<BTreeMap<u16, u32>, String> {
        let corrupt = |_| "Corrupt TIFF directory".to_string();
        let mut count = [0u8; 2];
        self.read_at(offset as u64, &mut count).map_err(corrupt)?;
        let count = self.u16_from(&count) as u64;
        let mut tags = BTreeMap::new();
        for index in 0..count {
            let mut entry = [0u8; 12];
            self.read_at(offset as u64 + 2 + index * 12, &mut entry)
                .map_err(corrupt)?;
            let tag = self.u16_from(&entry[0..2]);
            let kind = self.u16_from(&entry[2..4]);
            let values = self.u32_from(&entry[4..8]);
            let value = match kind {
                TYPE_SHORT if values <= 2 => self.u16_from(&entry[8..10]) as u32,
                TYPE_SHORT => {
                    let mut first = [0u8; 2];
                    let at = self.u32_from(&entry[8..12]) as u64;
                    self.read_at(at, &mut first).map_err(corrupt)?;
                    self.u16_from(&first) as u32
                }
                TYPE_LONG if values <= 1 => self.u32_from(&entry[8..12]),
                TYPE_LONG => {
                    let mut first = [0u8; 4];
                    let at = self.u32_from(&entry[8..12]) as u64;
                    self.read_at(at, &mut first).map_err(corrupt)?;
                    self.u32_from(&first)
                }
                _ => continue,
            };
            tags.insert(tag, value);
        }
        Ok(tags)
    }
}

fn tiff_element_type(bits: u32, format: u32) -> Result<ElementType, String> {
    Ok(match (format, bits) {
        (1, 8) => ElementType::UInt8,
        (1, 16) => ElementType::UInt16,
        (1, 32) => ElementType::UInt32,
        (1, 64) => ElementType::UInt64,
        (2, 8) => ElementType::Int8,
        (2, 16) => ElementType::Int16,
        (2, 32) => ElementType::Int32,
        (2, 64) => ElementType::Int64,
        (3, 32) => ElementType::Float32,
        (3, 64) => ElementType::Float64,
        _ => {
            return Err(format!(
                "Unsupported sample format {} with {} bits per sample",
                format, bits
            ))
        }
    })
}

impl TiffBuilder {
    fn build_one(&self, path: &Path) -> Result<ImportedImage, String> {
        let (mut reader, offset) = TiffReader::open(path)?;
        let tags = reader.first_ifd(offset)?;
        let tag = |id: u16, name: &str| {
            tags.get(&id)
                .copied()
                .ok_or_else(|| format!("TIFF is missing {}", name))
        };
        let width = tag(TAG_IMAGE_WIDTH, "ImageWidth")?;
        let height = tag(TAG_IMAGE_LENGTH, "ImageLength")?;
        let bits = tags.get(&TAG_BITS_PER_SAMPLE).copied().unwrap_or(1);
        let format = tags.get(&TAG_SAMPLE_FORMAT).copied().unwrap_or(1);
        let samples = tags.get(&TAG_SAMPLES_PER_PIXEL).copied().unwrap_or(1);

        let mut dimensions = vec![width as u64, height as u64];
        if samples > 1 {
            dimensions.push(samples as u64);
        }
        Ok(ImportedImage {
            name: file_name(path),
            element_type: tiff_element_type(bits, format)?,
            dimensions,
            files: vec![path.to_path_buf()],
        })
    }
}

impl ImageBuilder for TiffBuilder {
    fn name(&self) -> &'static str {
        "tiff"
    }

    fn build(&self, files: &BTreeSet<PathBuf>) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        for path in files {
            if !matches!(extension(path).as_deref(), Some("tif") | Some("tiff")) {
                continue;
            }
            match self.build_one(path) {
                Ok(image) => {
                    outcome.consumed.insert(path.clone());
                    outcome.images.push(image);
                }
                Err(error) => {
                    outcome.errors.insert(path.clone(), error);
                }
            }
        }
        outcome
    }
}

/// Fixtures shared by unit and integration tests.
#[doc(hidden)]
pub mod fixtures {
    /// A 2x2 `MET_UCHAR` MetaImage with inline data.
    pub fn mha(element_type: &str) -> Vec<u8> {
        let bytes_per_element = match element_type {
            "MET_FLOAT" | "MET_INT" | "MET_UINT" => 4,
            "MET_DOUBLE" => 8,
            "MET_SHORT" | "MET_USHORT" => 2,
            _ => 1,
        };
        let mut content = format!(
            "ObjectType = Image\nNDims = 2\nBinaryData = True\nBinaryDataByteOrderMSB = False\n\
             DimSize = 2 2\nElementType = {}\nElementDataFile = LOCAL\n",
            element_type
        )
        .into_bytes();
        content.extend(std::iter::repeat(1u8).take(4 * bytes_per_element));
        content
    }

    /// A little-endian 3x2 8-bit TIFF with a single strip.
    pub fn tiff() -> Vec<u8> {
        let entries: [(u16, u16, u32, u32); 4] = [
            (256, 3, 1, 3),
            (257, 3, 1, 2),
            (258, 3, 1, 8),
            (339, 3, 1, 1),
        ];
        let mut content = b"II*\0".to_vec();
        content.extend_from_slice(&8u32.to_le_bytes());
        content.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (tag, kind, count, value) in entries {
            content.extend_from_slice(&tag.to_le_bytes());
            content.extend_from_slice(&kind.to_le_bytes());
            content.extend_from_slice(&count.to_le_bytes());
            content.extend_from_slice(&value.to_le_bytes());
        }
        content.extend_from_slice(&0u32.to_le_bytes());
        content.extend_from_slice(&[0u8; 6]);
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn import(files: &[(&str, Vec<u8>)]) -> (TempDir, ImportResult) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let result = BasicImageImporter::default().import(dir.path()).unwrap();
        (dir, result)
    }

    #[test]
    fn test_imports_mha() {
        let (_dir, result) = import(&[("ct/image.mha", fixtures::mha("MET_UCHAR"))]);

        assert_eq!(result.new_images.len(), 1);
        let image = &result.new_images[0];
        assert_eq!(image.name, "image.mha");
        assert_eq!(image.element_type, ElementType::UInt8);
        assert_eq!(image.dimensions, vec![2, 2]);
        assert!(result.file_errors.is_empty());
    }

    #[test]
    fn test_imports_mhd_with_data_file() {
        let header = b"ObjectType = Image\nNDims = 3\nDimSize = 2 2 1\n\
ElementType = MET_SHORT\nElementDataFile = image.raw\n"
            .to_vec();
        let (_dir, result) = import(&[("image.mhd", header), ("image.raw", vec![0u8; 8])]);

        assert_eq!(result.new_images.len(), 1);
        assert_eq!(result.new_images[0].files.len(), 2);
        assert_eq!(result.new_images[0].element_type, ElementType::Int16);
        assert!(result.file_errors.is_empty());
    }

    #[test]
    fn test_imports_tiff() {
        let (_dir, result) = import(&[("slide.tif", fixtures::tiff())]);

        assert_eq!(result.new_images.len(), 1);
        assert_eq!(result.new_images[0].dimensions, vec![3, 2]);
        assert_eq!(result.new_images[0].element_type, ElementType::UInt8);
    }

    #[test]
    fn test_reports_unimportable_files() {
        let truncated = b"ObjectType = Image\nNDims = 2\nDimSize = 4 4\n\
ElementType = MET_FLOAT\nElementDataFile = LOCAL\n"
            .to_vec();
        let (dir, result) = import(&[("notes.txt", b"hello".to_vec()), ("bad.mha", truncated)]);

        assert!(result.new_images.is_empty());
        assert_eq!(result.file_errors.len(), 2);
        assert!(result.file_errors[&dir.path().join("bad.mha")].contains("expected 64"));
    }

    #[test]
    fn test_rejects_non_image_object_type() {
        let header = b"ObjectType = Transform\nNDims = 1\nDimSize = 1\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\nx"
            .to_vec();
        let (_dir, result) = import(&[("transform.mha", header)]);

        assert!(result.new_images.is_empty());
        assert_eq!(result.file_errors.len(), 1);
    }
}
