use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{DEFAULT_ALIGNMENT, GGUF_MAGIC, GgmlType, MetadataValue, WRITE_VERSION};
use crate::error::{ModelError, Result};
use crate::quant;

/// A tensor declared on a [`ContainerWriter`].
#[derive(Debug, Clone)]
pub struct PendingTensor {
    pub name: String,
    /// Dimensions, fastest-varying first.
    pub dims: Vec<u64>,
    pub ty: GgmlType,
    data: Option<Vec<u8>>,
}

impl PendingTensor {
    pub fn element_count(&self) -> u64 {
        self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
    }

    fn byte_len(&self) -> u64 {
        self.ty.byte_size(self.element_count()).unwrap_or(0)
    }
}

/// Serializes a container: header, metadata, tensor directory with absolute aligned offsets, tensor data.
///
/// Tensors are declared first. Their bytes are either pushed in memory or produced on demand while writing,
/// so large exports never hold more than one encoded tensor at a time.
#[derive(Debug)]
pub struct ContainerWriter {
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<PendingTensor>,
    alignment: u64,
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter {
    pub fn new() -> Self {
        let mut writer = Self { metadata: Vec::new(), tensors: Vec::new(), alignment: DEFAULT_ALIGNMENT };
        writer.set_metadata("general.alignment", MetadataValue::U32(DEFAULT_ALIGNMENT as u32));
        writer
    }

    /// Sets a metadata entry, replacing any earlier value for the key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: MetadataValue) -> &mut Self {
        let key = key.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key, value)),
        }
        self
    }

    /// Declares a tensor whose bytes are produced later by [`ContainerWriter::write_with`].
    pub fn declare_tensor(&mut self, name: impl Into<String>, dims: &[u64], ty: GgmlType) -> &mut Self {
        self.tensors.push(PendingTensor { name: name.into(), dims: dims.to_vec(), ty, data: None });
        self
    }

    /// Encodes `values` as `ty` and keeps the bytes in memory.
    pub fn push_tensor(&mut self, name: impl Into<String>, dims: &[u64], ty: GgmlType, values: &[f32]) -> Result<()> {
        let name = name.into();
        let expected: u64 = dims.iter().product();
        if values.len() as u64 != expected {
            return Err(ModelError::ShapeMismatch {
                name,
                expected: dims.to_vec(),
                actual: vec![values.len() as u64],
            });
        }
        let bytes = quant::encode(ty, values).ok_or_else(|| ModelError::UnsupportedType { name: name.clone(), ty })?;
        self.push_raw_tensor(name, dims, ty, bytes);
        Ok(())
    }

    /// Keeps already-encoded bytes in memory. A length that disagrees with `dims` and `ty` fails at write time.
    pub fn push_raw_tensor(&mut self, name: impl Into<String>, dims: &[u64], ty: GgmlType, bytes: Vec<u8>) {
        self.tensors.push(PendingTensor { name: name.into(), dims: dims.to_vec(), ty, data: Some(bytes) });
    }

    pub fn tensors(&self) -> &[PendingTensor] {
        &self.tensors
    }

    /// Writes the container, calling `produce` for every declared tensor without in-memory bytes.
    ///
    /// Returns the total number of bytes written.
    pub fn write_with<W, F, E>(&self, out: &mut W, mut produce: F) -> std::result::Result<u64, E>
    where
        W: Write,
        F: FnMut(usize, &PendingTensor) -> std::result::Result<Vec<u8>, E>,
        E: From<io::Error>,
    {
        let offsets = self.tensor_offsets();
        let header = self.encode_header(&offsets)?;
        out.write_all(&header)?;
        let mut written = header.len() as u64;

        for (idx, (tensor, &offset)) in self.tensors.iter().zip(&offsets).enumerate() {
            written += write_padding(out, offset - written)?;

            let produced;
            let bytes = match &tensor.data {
                Some(bytes) => bytes,
                None => {
                    produced = produce(idx, tensor)?;
                    &produced
                }
            };

            if bytes.len() as u64 != tensor.byte_len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "tensor '{}' has {} bytes, {} {} elements need {}",
                        tensor.name,
                        bytes.len(),
                        tensor.element_count(),
                        tensor.ty,
                        tensor.byte_len()
                    ),
                )
                .into());
            }

            out.write_all(bytes)?;
            written += bytes.len() as u64;
        }

        out.flush()?;
        Ok(written)
    }

    /// Serializes a container whose tensors were all pushed in memory.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_with(&mut out, |_, tensor| {
            Err(io::Error::new(io::ErrorKind::InvalidInput, format!("tensor '{}' has no data", tensor.name)))
        })?;
        Ok(out)
    }

    pub fn write_file(&self, path: &Path) -> Result<u64> {
        let file = File::create(path).map_err(|e| ModelError::io(path, e))?;
        let mut out = BufWriter::new(file);
        self.write_with(&mut out, |_, tensor| {
            Err(io::Error::new(io::ErrorKind::InvalidInput, format!("tensor '{}' has no data", tensor.name)))
        })
        .map_err(|e| ModelError::io(path, e))
    }

    fn header_len(&self) -> u64 {
        let metadata: u64 = self.metadata.iter().map(|(key, value)| 8 + key.len() as u64 + 4 + value_len(value)).sum();
        let directory: u64 =
            self.tensors.iter().map(|t| 8 + t.name.len() as u64 + 4 + 8 * t.dims.len() as u64 + 4 + 8).sum();
        4 + 4 + 8 + 8 + metadata + directory
    }

    fn tensor_offsets(&self) -> Vec<u64> {
        let mut cursor = self.header_len();
        self.tensors
            .iter()
            .map(|tensor| {
                let offset = cursor.next_multiple_of(self.alignment);
                cursor = offset + tensor.byte_len();
                offset
            })
            .collect()
    }

    fn encode_header(&self, offsets: &[u64]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.header_len() as usize);
        buf.write_u32::<LittleEndian>(GGUF_MAGIC)?;
        buf.write_u32::<LittleEndian>(WRITE_VERSION)?;
        buf.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        buf.write_u64::<LittleEndian>(self.metadata.len() as u64)?;

        for (key, value) in &self.metadata {
            write_string(&mut buf, key)?;
            buf.write_u32::<LittleEndian>(value.value_type().id())?;
            write_value(&mut buf, value)?;
        }

        for (tensor, &offset) in self.tensors.iter().zip(offsets) {
            write_string(&mut buf, &tensor.name)?;
            buf.write_u32::<LittleEndian>(tensor.dims.len() as u32)?;
            for &dim in &tensor.dims {
                buf.write_u64::<LittleEndian>(dim)?;
            }
            buf.write_u32::<LittleEndian>(tensor.ty.id())?;
            buf.write_u64::<LittleEndian>(offset)?;
        }

        Ok(buf)
    }
}

fn value_len(value: &MetadataValue) -> u64 {
    match value {
        MetadataValue::U8(_) | MetadataValue::I8(_) | MetadataValue::Bool(_) => 1,
        MetadataValue::U16(_) | MetadataValue::I16(_) => 2,
        MetadataValue::U32(_) | MetadataValue::I32(_) | MetadataValue::F32(_) => 4,
        MetadataValue::U64(_) | MetadataValue::I64(_) | MetadataValue::F64(_) => 8,
        MetadataValue::String(s) => 8 + s.len() as u64,
        MetadataValue::Array(_, items) => 4 + 8 + items.iter().map(value_len).sum::<u64>(),
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    buf.write_u64::<LittleEndian>(s.len() as u64)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: &MetadataValue) -> io::Result<()> {
    match value {
        MetadataValue::U8(v) => buf.write_u8(*v)?,
        MetadataValue::I8(v) => buf.write_i8(*v)?,
        MetadataValue::U16(v) => buf.write_u16::<LittleEndian>(*v)?,
        MetadataValue::I16(v) => buf.write_i16::<LittleEndian>(*v)?,
        MetadataValue::U32(v) => buf.write_u32::<LittleEndian>(*v)?,
        MetadataValue::I32(v) => buf.write_i32::<LittleEndian>(*v)?,
        MetadataValue::F32(v) => buf.write_f32::<LittleEndian>(*v)?,
        MetadataValue::Bool(v) => buf.write_u8(*v as u8)?,
        MetadataValue::String(s) => write_string(buf, s)?,
        MetadataValue::U64(v) => buf.write_u64::<LittleEndian>(*v)?,
        MetadataValue::I64(v) => buf.write_i64::<LittleEndian>(*v)?,
        MetadataValue::F64(v) => buf.write_f64::<LittleEndian>(*v)?,
        MetadataValue::Array(element_type, items) => {
            buf.write_u32::<LittleEndian>(element_type.id())?;
            buf.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                if item.value_type() != *element_type {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("array of {element_type:?} holds a {:?}", item.value_type()),
                    ));
                }
                write_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn write_padding<W: Write>(out: &mut W, len: u64) -> io::Result<u64> {
    const ZEROS: [u8; DEFAULT_ALIGNMENT as usize] = [0; DEFAULT_ALIGNMENT as usize];
    let mut left = len;
    while left > 0 {
        let chunk = left.min(ZEROS.len() as u64);
        out.write_all(&ZEROS[..chunk as usize])?;
        left -= chunk;
    }
    Ok(len)
}
