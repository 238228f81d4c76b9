use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use memmap2::Mmap;

use crate::configuration::ModelConfig;
use crate::error::{ModelError, Result};
use crate::gguf::{ContainerWriter, GgmlType, GgufHeader, Metadata, MetadataValue, TensorDescriptor, parse_header};
use crate::quant;
use crate::tensor_names as names;

#[cfg(test)]
#[path = "../tests/unit/storage_test.rs"]
mod storage_test;

/// Owned model bytes: a read-only mapping, or a heap copy when mapping is unavailable.
pub enum ModelBytes {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl ModelBytes {
    /// Maps `path` read-only, falling back to reading it into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;

        // SAFETY: the mapping is read-only; the file must not be truncated while the model is loaded.
        match unsafe { Mmap::map(&file) } {
            Ok(mmap) => Ok(Self::Mapped(mmap)),
            Err(e) => {
                warn!("Memory mapping {} failed ({e}), reading into memory instead", path.display());
                std::fs::read(path).map(Self::Heap).map_err(|e| ModelError::io(path, e))
            }
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

impl Deref for ModelBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Heap(bytes) => bytes,
        }
    }
}

impl std::fmt::Debug for ModelBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBytes")
            .field("mapped", &self.is_mapped())
            .field("len", &self.len())
            .finish()
    }
}

/// A parsed container: its bytes, header and derived architecture. Immutable once built.
pub struct ModelContainer {
    bytes: ModelBytes,
    header: GgufHeader,
    config: ModelConfig,
    source: Option<PathBuf>,
}

impl ModelContainer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = ModelBytes::open(path)?;
        info!(
            "📂 Opened {} ({} bytes, {})",
            path.display(),
            bytes.len(),
            if bytes.is_mapped() { "mapped" } else { "heap" }
        );
        Self::from_model_bytes(bytes, Some(path.to_path_buf()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_model_bytes(ModelBytes::Heap(bytes), None)
    }

    /// Zero-filled stand-in used when developer mode allows running without a model file.
    pub fn synthetic() -> Result<Self> {
        warn!("Using a zero-filled synthetic model");
        Self::from_bytes(SyntheticModel::default().to_bytes()?)
    }

    fn from_model_bytes(bytes: ModelBytes, source: Option<PathBuf>) -> Result<Self> {
        let header = parse_header(&bytes)?;
        let config = ModelConfig::from_header(&header)?;

        info!(
            "GGUF v{}: {} tensors, {} metadata entries, architecture '{}'",
            header.version,
            header.tensors.len(),
            header.metadata.len(),
            config.architecture
        );
        debug!("{config:#?}");

        Ok(Self { bytes, header, config, source })
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn header(&self) -> &GgufHeader {
        &self.header
    }

    pub fn metadata(&self) -> &Metadata {
        &self.header.metadata
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Result<&TensorDescriptor> {
        self.header.tensors.get(name).ok_or_else(|| ModelError::TensorNotFound { name: name.to_string() })
    }

    /// Raw bytes of a tensor, after checking they fit before the end of file and the next tensor.
    pub fn tensor_bytes(&self, name: &str) -> Result<(&TensorDescriptor, &[u8])> {
        let descriptor = self.descriptor(name)?;
        let needed = descriptor
            .byte_len()
            .ok_or_else(|| ModelError::UnsupportedType { name: name.to_string(), ty: descriptor.ty })?;

        let file_len = self.bytes.len() as u64;
        let limit = self.header.tensors.next_offset_after(descriptor.offset).map_or(file_len, |next| next.min(file_len));
        let available = limit.saturating_sub(descriptor.offset);

        if needed > available || descriptor.offset > file_len {
            return Err(ModelError::TruncatedTensor {
                name: name.to_string(),
                offset: descriptor.offset,
                needed,
                available,
            });
        }

        let start = descriptor.offset as usize;
        Ok((descriptor, &self.bytes[start..start + needed as usize]))
    }
}

impl std::fmt::Debug for ModelContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelContainer")
            .field("source", &self.source)
            .field("version", &self.header.version)
            .field("tensors", &self.header.tensors.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Materializes container tensors as `f32` arrays.
///
/// **Purpose**: the single place where raw bytes become weights
/// **Types**: `F32` and `F16` are converted element-wise, `Q4_0`/`Q8_0` are dequantized per block (in parallel)
/// **Note**: a `Q4_0` output projection is additionally kept as raw bytes for the quantization-aware matmul
pub struct WeightStore {
    container: ModelContainer,
    raw_output_q4: OnceLock<Option<Arc<[u8]>>>,
}

impl WeightStore {
    pub fn new(container: ModelContainer) -> Self {
        Self { container, raw_output_q4: OnceLock::new() }
    }

    pub fn container(&self) -> &ModelContainer {
        &self.container
    }

    pub fn config(&self) -> &ModelConfig {
        self.container.config()
    }

    pub fn descriptor(&self, name: &str) -> Result<&TensorDescriptor> {
        self.container.descriptor(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.container.header().tensors.contains(name)
    }

    /// Loads a tensor as floats.
    pub fn load(&self, name: &str) -> Result<Vec<f32>> {
        let (descriptor, bytes) = self.container.tensor_bytes(name)?;
        if !descriptor.ty.is_loadable() {
            return Err(ModelError::UnsupportedType { name: name.to_string(), ty: descriptor.ty });
        }

        let mut out = vec![0.0f32; descriptor.element_count() as usize];
        quant::decode_into(descriptor.ty, bytes, &mut out);
        Ok(out)
    }

    /// Loads a `rows × cols` row-major matrix, stored with dims `[cols, rows]`.
    pub fn load_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Vec<f32>> {
        self.check_matrix(name, rows, cols)?;
        self.load(name)
    }

    /// Checks that `name` is a `rows × cols` matrix whose bytes are all present.
    pub fn check_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<()> {
        self.check_shape(name, &[cols as u64, rows as u64])?;
        self.container.tensor_bytes(name).map(|_| ())
    }

    /// Loads a vector of `len` elements.
    pub fn load_vector(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        self.check_shape(name, &[len as u64])?;
        self.load(name)
    }

    /// Loads an optional vector; a missing or truncated tensor is logged and yields `None`.
    pub fn load_optional_vector(&self, name: &str, len: usize) -> Result<Option<Vec<f32>>> {
        match self.load_vector(name, len) {
            Ok(values) => Ok(Some(values)),
            Err(e) if e.is_missing_tensor() => {
                warn!("Optional tensor skipped: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Raw `Q4_0` bytes of the output projection, when it is stored that way.
    pub fn raw_q4_output(&self) -> Option<Arc<[u8]>> {
        self.raw_output_q4
            .get_or_init(|| match self.container.tensor_bytes(names::OUTPUT) {
                Ok((descriptor, bytes)) if descriptor.ty == GgmlType::Q4_0 => {
                    debug!("Keeping {} raw Q4_0 bytes of {}", bytes.len(), names::OUTPUT);
                    Some(Arc::from(bytes))
                }
                _ => None,
            })
            .clone()
    }

    fn check_shape(&self, name: &str, expected: &[u64]) -> Result<()> {
        let descriptor = self.descriptor(name)?;
        let expected_count: u64 = expected.iter().product();
        let trailing_ones = descriptor.dims.iter().skip(expected.len()).all(|&d| d == 1);

        let matches = descriptor.element_count() == expected_count
            && (descriptor.dims.len() <= 1 && expected.len() == 1
                || descriptor.dims.len() >= expected.len()
                    && descriptor.dims[..expected.len()] == *expected
                    && trailing_ones);

        if !matches {
            return Err(ModelError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: descriptor.dims.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightStore")
            .field("container", &self.container)
            .field("raw_output_q4", &self.raw_output_q4.get().map(|raw| raw.as_ref().map_or(0, |r| r.len())))
            .finish()
    }
}

/// Builder for small in-memory models with the full tensor set.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub context_length: Option<usize>,
    /// Element type for matrices; vectors are always `F32`.
    pub ty: GgmlType,
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self {
            dim: 16,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 2,
            hidden_dim: 64,
            vocab_size: 32,
            context_length: None,
            ty: GgmlType::F32,
        }
    }
}

impl SyntheticModel {
    /// Every tensor name with its dims (fastest first) and whether it is a matrix.
    pub fn tensor_layout(&self) -> Vec<(String, Vec<u64>, bool)> {
        let (d, h, v) = (self.dim as u64, self.hidden_dim as u64, self.vocab_size as u64);
        let kv = (self.dim / self.n_heads.max(1) * self.n_kv_heads) as u64;

        let mut layout = vec![(names::TOKEN_EMBD.to_string(), vec![d, v], true)];
        for l in 0..self.n_layers {
            layout.extend([
                (names::layer(l, names::ATTN_NORM), vec![d], false),
                (names::layer(l, names::ATTN_NORM_BIAS), vec![d], false),
                (names::layer(l, names::ATTN_Q), vec![d, d], true),
                (names::layer(l, names::ATTN_K), vec![kv, d], true),
                (names::layer(l, names::ATTN_V), vec![kv, d], true),
                (names::layer(l, names::ATTN_OUTPUT), vec![d, d], true),
                (names::layer(l, names::FFN_NORM), vec![d], false),
                (names::layer(l, names::FFN_NORM_BIAS), vec![d], false),
                (names::layer(l, names::FFN_UP), vec![h, d], true),
                (names::layer(l, names::FFN_GATE), vec![h, d], true),
                (names::layer(l, names::FFN_DOWN), vec![d, h], true),
            ]);
        }
        layout.extend([
            (names::OUTPUT_NORM.to_string(), vec![d], false),
            (names::OUTPUT_NORM_BIAS.to_string(), vec![d], false),
            (names::OUTPUT.to_string(), vec![v, d], true),
        ]);
        layout
    }

    /// Builds a writer whose tensor values come from `fill(name, flat_index)`.
    pub fn writer_with(&self, mut fill: impl FnMut(&str, usize) -> f32) -> Result<ContainerWriter> {
        let mut writer = ContainerWriter::new();
        writer
            .set_metadata("general.architecture", MetadataValue::String("llama".into()))
            .set_metadata("general.name", MetadataValue::String("synthetic".into()))
            .set_metadata("llama.embedding_length", MetadataValue::U32(self.dim as u32))
            .set_metadata("llama.block_count", MetadataValue::U32(self.n_layers as u32))
            .set_metadata("llama.attention.head_count", MetadataValue::U32(self.n_heads as u32))
            .set_metadata("llama.attention.head_count_kv", MetadataValue::U32(self.n_kv_heads as u32))
            .set_metadata("llama.feed_forward_length", MetadataValue::U32(self.hidden_dim as u32));
        if let Some(ctx) = self.context_length {
            writer.set_metadata("llama.context_length", MetadataValue::U32(ctx as u32));
        }

        for (name, dims, is_matrix) in self.tensor_layout() {
            let count: u64 = dims.iter().product();
            let values: Vec<f32> = (0..count as usize).map(|i| fill(&name, i)).collect();
            let ty = if is_matrix { self.ty } else { GgmlType::F32 };
            writer.push_tensor(name, &dims, ty, &values)?;
        }
        Ok(writer)
    }

    /// Zero-filled container bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.writer_with(|_, _| 0.0)?
            .to_bytes()
            .map_err(|e| ModelError::io("<synthetic>", e))
    }
}
