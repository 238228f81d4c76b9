use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use super::{
    GGUF_MAGIC, GgmlType, GgufHeader, MIN_VERSION, Metadata, MetadataValue, TensorDescriptor, TensorDirectory,
    ValueType,
};
use crate::error::{ModelError, Result};

/// Deepest array-of-array nesting accepted in metadata.
const MAX_ARRAY_DEPTH: usize = 8;
/// Smallest encoded metadata entry: key length, empty key, type tag, one byte value.
const MIN_METADATA_ENTRY: u64 = 8 + 4 + 1;
/// Smallest encoded tensor entry: name length, dimension count, element type, offset.
const MIN_TENSOR_ENTRY: u64 = 8 + 4 + 4 + 8;

/// Parses the header, metadata section and tensor directory from the start of `bytes`.
///
/// Tensor data is never touched; a bad signature or version fails after reading 8 bytes.
pub fn parse_header(bytes: &[u8]) -> Result<GgufHeader> {
    let mut reader = HeaderReader { cursor: Cursor::new(bytes) };

    let magic = reader.u32("magic")?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::BadMagic { found: magic, expected: GGUF_MAGIC });
    }

    let version = reader.u32("version")?;
    if version < MIN_VERSION {
        return Err(ModelError::UnsupportedVersion { found: version, minimum: MIN_VERSION });
    }

    let tensor_count = reader.u64("tensor count")?;
    let metadata_count = reader.u64("metadata count")?;
    reader.ensure_fits(metadata_count, MIN_METADATA_ENTRY, "metadata entries")?;

    let mut metadata = Metadata::default();
    for _ in 0..metadata_count {
        let key = reader.string("metadata key")?;
        let value = reader.tagged_value(0)?;
        metadata.insert(key, value);
    }

    reader.ensure_fits(tensor_count, MIN_TENSOR_ENTRY, "tensor entries")?;
    let mut tensors = TensorDirectory::default();
    for _ in 0..tensor_count {
        tensors.insert(reader.tensor_descriptor()?);
    }

    let header_len = reader.position();
    debug!(
        "Parsed GGUF v{version}: {} metadata entries, {} tensors, header {header_len} bytes",
        metadata.len(),
        tensors.len()
    );

    Ok(GgufHeader { version, metadata, tensors, header_len })
}

struct HeaderReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

// Reads a little-endian scalar, reporting the offset where the stream ran dry.
macro_rules! read_le {
    ($reader:expr, $method:ident, $what:expr) => {{
        let offset = $reader.position();
        $reader
            .cursor
            .$method::<LittleEndian>()
            .map_err(|_| ModelError::format(offset, format!("unexpected end of data reading {}", $what)))?
    }};
}

impl HeaderReader<'_> {
    fn position(&self) -> u64 {
        self.cursor.position()
    }

    fn remaining(&self) -> u64 {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.position())
    }

    /// Rejects counts that could not possibly fit in the remaining bytes.
    fn ensure_fits(&self, count: u64, min_entry: u64, what: &str) -> Result<()> {
        if count > self.remaining() / min_entry {
            return Err(ModelError::format(
                self.position(),
                format!("{count} {what} cannot fit in the remaining {} bytes", self.remaining()),
            ));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        let offset = self.position();
        self.cursor
            .read_u8()
            .map_err(|_| ModelError::format(offset, format!("unexpected end of data reading {what}")))
    }

    fn i8(&mut self, what: &str) -> Result<i8> {
        Ok(self.u8(what)? as i8)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(read_le!(self, read_u32, what))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        Ok(read_le!(self, read_u64, what))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let offset = self.position();
        let len = self.u64(what)?;
        if len > self.remaining() {
            return Err(ModelError::format(
                offset,
                format!("{what} length {len} exceeds the remaining {} bytes", self.remaining()),
            ));
        }

        let mut buf = vec![0u8; len as usize];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| ModelError::format(offset, format!("unexpected end of data reading {what}")))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn value_type(&mut self) -> Result<ValueType> {
        let offset = self.position();
        let tag = self.u32("value type")?;
        ValueType::from_id(tag).ok_or_else(|| ModelError::format(offset, format!("unknown metadata value type {tag}")))
    }

    fn tagged_value(&mut self, depth: usize) -> Result<MetadataValue> {
        let ty = self.value_type()?;
        self.value(ty, depth)
    }

    fn value(&mut self, ty: ValueType, depth: usize) -> Result<MetadataValue> {
        Ok(match ty {
            ValueType::U8 => MetadataValue::U8(self.u8("u8 value")?),
            ValueType::I8 => MetadataValue::I8(self.i8("i8 value")?),
            ValueType::U16 => MetadataValue::U16(read_le!(self, read_u16, "u16 value")),
            ValueType::I16 => MetadataValue::I16(read_le!(self, read_i16, "i16 value")),
            ValueType::U32 => MetadataValue::U32(read_le!(self, read_u32, "u32 value")),
            ValueType::I32 => MetadataValue::I32(read_le!(self, read_i32, "i32 value")),
            ValueType::F32 => MetadataValue::F32(read_le!(self, read_f32, "f32 value")),
            ValueType::Bool => MetadataValue::Bool(self.u8("bool value")? != 0),
            ValueType::String => MetadataValue::String(self.string("string value")?),
            ValueType::U64 => MetadataValue::U64(read_le!(self, read_u64, "u64 value")),
            ValueType::I64 => MetadataValue::I64(read_le!(self, read_i64, "i64 value")),
            ValueType::F64 => MetadataValue::F64(read_le!(self, read_f64, "f64 value")),
            ValueType::Array => {
                let offset = self.position();
                if depth >= MAX_ARRAY_DEPTH {
                    return Err(ModelError::format(offset, format!("arrays nested deeper than {MAX_ARRAY_DEPTH}")));
                }
                let element_type = self.value_type()?;
                let count = self.u64("array length")?;
                self.ensure_fits(count, 1, "array elements")?;

                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.value(element_type, depth + 1)?);
                }
                MetadataValue::Array(element_type, items)
            }
        })
    }

    fn tensor_descriptor(&mut self) -> Result<TensorDescriptor> {
        let start = self.position();
        let name = self.string("tensor name")?;
        let n_dims = self.u32("dimension count")?;
        self.ensure_fits(n_dims as u64, 8, "dimensions")?;

        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(self.u64("dimension")?);
        }
        if dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(ModelError::format(start, format!("tensor '{name}' dimensions overflow")));
        }

        let ty = GgmlType::from(self.u32("element type")?);
        let offset = self.u64("tensor offset")?;

        Ok(TensorDescriptor { name, dims, ty, offset })
    }
}
