#[cfg(test)]
#[path = "../tests/unit/tensor_reader_test.rs"]
mod tensor_reader_test;

use anyhow::{Context, Result};
use ggrun_inference::quant::f16_to_f32;
use log::info;
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const MAX_CACHED_FILES: usize = 10;

/// A checkpoint tensor widened to `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTensor {
    /// Outermost dimension first, as stored in safetensors.
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Memory-mapped reader over the safetensors shards of a checkpoint directory.
#[derive(Debug)]
pub struct TensorReader {
    /// Tensor name to the shard holding it.
    index: BTreeMap<String, PathBuf>,
    mmap_cache: Arc<Mutex<MmapCache>>,
}

impl TensorReader {
    pub fn new(model_path: &Path) -> Result<Self> {
        let mut safetensors_files = std::fs::read_dir(model_path)
            .with_context(|| format!("Failed to read directory: {}", model_path.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();

        if safetensors_files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", model_path.display());
        }
        safetensors_files.sort();

        let reader = TensorReader {
            index: BTreeMap::new(),
            mmap_cache: Arc::new(Mutex::new(MmapCache::new(MAX_CACHED_FILES))),
        };

        let mut index = BTreeMap::new();
        for filename in &safetensors_files {
            let mmap = reader.get_mmap(filename)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", filename.display()))?;
            for name in safetensors.names() {
                index.insert(name.clone(), filename.clone());
            }
        }

        info!("Found {} safetensor files with {} tensors", safetensors_files.len(), index.len());

        Ok(TensorReader { index, ..reader })
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.index.contains_key(tensor_name)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Loads a tensor by name, widening `F32`/`F16`/`BF16` to `f32`. `None` when no shard holds it.
    pub fn load_tensor(&self, tensor_name: &str) -> Result<Option<LoadedTensor>> {
        let Some(filename) = self.index.get(tensor_name) else {
            return Ok(None);
        };

        let mmap = self.get_mmap(filename)?;
        let safetensors = SafeTensors::deserialize(&mmap)
            .with_context(|| format!("Failed to deserialize {}", filename.display()))?;
        let view = safetensors
            .tensor(tensor_name)
            .with_context(|| format!("Failed to read {tensor_name} from {}", filename.display()))?;

        Ok(Some(LoadedTensor { shape: view.shape().to_vec(), values: Self::convert_tensor_to_f32(&view, tensor_name)? }))
    }

    fn convert_tensor_to_f32(view: &TensorView, tensor_name: &str) -> Result<Vec<f32>> {
        let data = view.data();
        let expected_elements = view.shape().iter().product::<usize>();

        let width = match view.dtype() {
            Dtype::F32 => 4,
            Dtype::F16 | Dtype::BF16 => 2,
            dtype => anyhow::bail!("Unsupported tensor dtype {:?} for {}", dtype, tensor_name),
        };

        if data.len() != expected_elements * width {
            anyhow::bail!(
                "{:?} tensor {} size mismatch. Expected {} bytes, got {}",
                view.dtype(),
                tensor_name,
                expected_elements * width,
                data.len()
            );
        }

        let values = match view.dtype() {
            Dtype::F32 => data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            Dtype::F16 => data.chunks_exact(2).map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]]))).collect(),
            // BF16 is the upper half of an f32
            _ => data.chunks_exact(2).map(|c| f32::from_bits((u16::from_le_bytes([c[0], c[1]]) as u32) << 16)).collect(),
        };
        Ok(values)
    }

    /// Get or create a cached memory mapping for a file
    fn get_mmap(&self, path: &Path) -> Result<Arc<Mmap>> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;

        if let Some(cached_mmap) = cache.get(path) {
            return Ok(cached_mmap);
        }

        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: the mapping is read-only; a checkpoint modified while exporting is outside the supported use.
        let mmap =
            Arc::new(unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?);

        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }

    /// Drops every cached mapping.
    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;
        cache.clear();
        Ok(())
    }
}

/// Least-recently-used set of memory mappings.
#[derive(Debug)]
struct MmapCache {
    cache: HashMap<PathBuf, Arc<Mmap>>,
    access_order: VecDeque<PathBuf>,
    max_size: usize,
}

impl MmapCache {
    fn new(max_size: usize) -> Self {
        Self { cache: HashMap::new(), access_order: VecDeque::new(), max_size }
    }

    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
        self.access_order.push_front(path.to_path_buf());
    }

    fn get(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        let mmap = Arc::clone(self.cache.get(path)?);
        self.touch(path);
        Some(mmap)
    }

    fn insert(&mut self, path: PathBuf, mmap: Arc<Mmap>) {
        if !self.cache.contains_key(&path) {
            while self.cache.len() >= self.max_size {
                match self.access_order.pop_back() {
                    Some(lru_path) => {
                        self.cache.remove(&lru_path);
                    }
                    None => break,
                }
            }
        }

        self.touch(&path);
        self.cache.insert(path, mmap);
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.access_order.clear();
    }
}
