//! GGUF container model: element types, typed metadata and the tensor directory.

mod reader;
mod writer;

pub use reader::parse_header;
pub use writer::{ContainerWriter, PendingTensor};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::quant::{Q4_0_BLOCK_BYTES, Q8_0_BLOCK_BYTES, QK};

#[cfg(test)]
#[path = "../../tests/unit/gguf_test.rs"]
mod gguf_test;

/// File magic, `GGUF` read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
/// Oldest container version with 64-bit counts.
pub const MIN_VERSION: u32 = 2;
/// Version written by [`ContainerWriter`].
pub const WRITE_VERSION: u32 = 3;
/// Tensor data alignment used by [`ContainerWriter`].
pub const DEFAULT_ALIGNMENT: u64 = 32;

/// Tensor element encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    /// Recognized tag without a codec.
    Other(u32),
}

impl GgmlType {
    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Other(id) => id,
        }
    }

    /// Returns `(elements per block, bytes per block)` when the layout is known.
    pub fn block_info(self) -> Option<(u64, u64)> {
        let qk = QK as u64;
        match self {
            Self::F32 => Some((1, 4)),
            Self::F16 => Some((1, 2)),
            Self::Q4_0 => Some((qk, Q4_0_BLOCK_BYTES as u64)),
            Self::Q4_1 => Some((qk, 2 + 2 + 16)),
            Self::Q5_0 => Some((qk, 2 + 4 + 16)),
            Self::Q5_1 => Some((qk, 2 + 2 + 4 + 16)),
            Self::Q8_0 => Some((qk, Q8_0_BLOCK_BYTES as u64)),
            Self::Q8_1 => Some((qk, 4 + 4 + 32)),
            Self::Other(_) => None,
        }
    }

    /// Bytes needed for `elements` values, rounding partial blocks up.
    pub fn byte_size(self, elements: u64) -> Option<u64> {
        let (block, bytes) = self.block_info()?;
        elements.div_ceil(block).checked_mul(bytes)
    }

    /// Whether the weight store can materialize this type as floats.
    pub fn is_loadable(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::Q4_0 | Self::Q8_0)
    }
}

impl From<u32> for GgmlType {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "F32"),
            Self::F16 => write!(f, "F16"),
            Self::Q4_0 => write!(f, "Q4_0"),
            Self::Q4_1 => write!(f, "Q4_1"),
            Self::Q5_0 => write!(f, "Q5_0"),
            Self::Q5_1 => write!(f, "Q5_1"),
            Self::Q8_0 => write!(f, "Q8_0"),
            Self::Q8_1 => write!(f, "Q8_1"),
            Self::Other(id) => write!(f, "type#{id}"),
        }
    }
}

impl FromStr for GgmlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(Self::F32),
            "f16" => Ok(Self::F16),
            "q4_0" => Ok(Self::Q4_0),
            "q8_0" => Ok(Self::Q8_0),
            other => Err(format!("unsupported element type '{other}', expected one of f32, f16, q4_0, q8_0")),
        }
    }
}

/// Metadata value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    pub fn id(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::F32 => 6,
            Self::Bool => 7,
            Self::String => 8,
            Self::Array => 9,
            Self::U64 => 10,
            Self::I64 => 11,
            Self::F64 => 12,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            _ => return None,
        })
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    /// Homogeneous array; the element type survives even when empty.
    Array(ValueType, Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::F32(_) => ValueType::F32,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Array(..) => ValueType::Array,
            Self::U64(_) => ValueType::U64,
            Self::I64(_) => ValueType::I64,
            Self::F64(_) => ValueType::F64,
        }
    }

    /// Integer view; negative and fractional values do not coerce.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(v as i64),
            Self::I16(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            Self::I64(v) => Some(v),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            Self::F64(v) => Some(v as f32),
            _ => self.as_i64().map(|v| v as f32),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(_, items) => Some(items),
            _ => None,
        }
    }

    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(ValueType::String, items.into_iter().map(|s| Self::String(s.into())).collect())
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(ty, items) => write!(f, "[{ty:?}; {}]", items.len()),
            Self::U64(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

/// Key/value metadata section.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: BTreeMap<String, MetadataValue>,
}

impl Metadata {
    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetadataValue::as_u64)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(MetadataValue::as_f32)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    /// Collects a string array, skipping any non-string element.
    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        let items = self.get(key)?.as_array()?;
        Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.entries.iter()
    }
}

/// One tensor directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub name: String,
    /// Dimensions, fastest-varying first.
    pub dims: Vec<u64>,
    pub ty: GgmlType,
    /// Absolute byte offset of the tensor data within the container.
    pub offset: u64,
}

impl TensorDescriptor {
    /// Saturates instead of wrapping; the reader rejects overflowing shapes.
    pub fn element_count(&self) -> u64 {
        self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
    }

    pub fn byte_len(&self) -> Option<u64> {
        self.ty.byte_size(self.element_count())
    }
}

/// Tensor directory: unique names, first-seen order, sorted offsets for extent checks.
#[derive(Debug, Clone, Default)]
pub struct TensorDirectory {
    tensors: Vec<TensorDescriptor>,
    index: HashMap<String, usize>,
    offsets: BTreeSet<u64>,
}

impl TensorDirectory {
    /// Inserts a descriptor; a repeated name replaces the earlier entry.
    pub fn insert(&mut self, descriptor: TensorDescriptor) {
        match self.index.get(&descriptor.name) {
            Some(&slot) => {
                self.tensors[slot] = descriptor;
                self.offsets = self.tensors.iter().map(|t| t.offset).collect();
            }
            None => {
                self.offsets.insert(descriptor.offset);
                self.index.insert(descriptor.name.clone(), self.tensors.len());
                self.tensors.push(descriptor);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TensorDescriptor> {
        self.index.get(name).map(|&slot| &self.tensors[slot])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Smallest tensor offset strictly greater than `offset`.
    pub fn next_offset_after(&self, offset: u64) -> Option<u64> {
        offset.checked_add(1).and_then(|from| self.offsets.range(from..).next().copied())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.tensors.iter()
    }
}

/// Everything in a container before the tensor data.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub metadata: Metadata,
    pub tensors: TensorDirectory,
    /// Bytes consumed by the header, metadata and directory.
    pub header_len: u64,
}
