use log::warn;

use crate::error::{ModelError, Result};
use crate::gguf::GgufHeader;

#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

const DEFAULT_ARCHITECTURE: &str = "llama";
const DEFAULT_EMBEDDING_LENGTH: u64 = 4096;
const DEFAULT_BLOCK_COUNT: u64 = 32;
const DEFAULT_HEAD_COUNT: u64 = 32;
const DEFAULT_VOCAB_SIZE: u64 = 32000;
const DEFAULT_ROPE_FREQ_BASE: f32 = 10000.0;
const DEFAULT_NORM_EPS: f32 = 1e-5;

/// How attention heads are laid out over the embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionLayout {
    /// `n_heads` query heads sharing `n_kv_heads` key/value heads, with rotary embeddings.
    Grouped,
    /// One head spanning the whole embedding, no rotary embeddings.
    SingleHead,
}

/// Architecture scalars derived from container metadata.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: String,
    pub name: Option<String>,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    /// Trained context length, when the container declares one.
    pub context_length: Option<usize>,
    pub rope_freq_base: f32,
    pub norm_eps: f32,
    pub layout: AttentionLayout,
    /// Rotary inverse frequencies, `head_dim / 2` entries; empty for [`AttentionLayout::SingleHead`].
    pub inv_freq: Vec<f32>,
}

impl ModelConfig {
    /// Reads `{arch}.*` keys, falling back to defaults for anything absent.
    pub fn from_header(header: &GgufHeader) -> Result<Self> {
        let metadata = &header.metadata;
        let architecture = metadata.get_str("general.architecture").unwrap_or(DEFAULT_ARCHITECTURE).to_string();
        let key = |suffix: &str| format!("{architecture}.{suffix}");

        let dim = metadata.get_u64(&key("embedding_length")).unwrap_or(DEFAULT_EMBEDDING_LENGTH) as usize;
        if dim == 0 {
            return Err(ModelError::format(0, "embedding length is zero"));
        }

        let n_layers = metadata.get_u64(&key("block_count")).unwrap_or(DEFAULT_BLOCK_COUNT) as usize;
        let declared_heads = metadata.get_u64(&key("attention.head_count")).unwrap_or(DEFAULT_HEAD_COUNT) as usize;
        let declared_kv_heads =
            metadata.get_u64(&key("attention.head_count_kv")).map(|v| v as usize).unwrap_or(declared_heads);
        let hidden_dim = metadata.get_u64(&key("feed_forward_length")).map(|v| v as usize).unwrap_or(4 * dim);
        let context_length = metadata.get_u64(&key("context_length")).map(|v| v as usize);
        let rope_freq_base = metadata.get_f32(&key("rope.freq_base")).unwrap_or(DEFAULT_ROPE_FREQ_BASE);
        let norm_eps = metadata.get_f32(&key("attention.layer_norm_epsilon")).unwrap_or(DEFAULT_NORM_EPS);

        let vocab_size = header
            .tensors
            .get("token_embd.weight")
            .map(|t| t.element_count())
            .filter(|&count| count > 0 && count % dim as u64 == 0)
            .map(|count| count / dim as u64)
            .or_else(|| metadata.get_u64(&key("vocab_size")))
            .unwrap_or(DEFAULT_VOCAB_SIZE) as usize;

        let (layout, n_heads, n_kv_heads, head_dim) = match head_layout(dim, declared_heads, declared_kv_heads) {
            Some(head_dim) => (AttentionLayout::Grouped, declared_heads, declared_kv_heads, head_dim),
            None => {
                warn!(
                    "Unusable head metadata (heads={declared_heads}, kv_heads={declared_kv_heads}, dim={dim}), \
                     falling back to single-head attention"
                );
                (AttentionLayout::SingleHead, 1, 1, dim)
            }
        };

        let inv_freq = match layout {
            AttentionLayout::Grouped => inverse_frequencies(head_dim, rope_freq_base),
            AttentionLayout::SingleHead => Vec::new(),
        };

        Ok(Self {
            architecture,
            name: metadata.get_str("general.name").map(str::to_string),
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_dim,
            vocab_size,
            context_length,
            rope_freq_base,
            norm_eps,
            layout,
            inv_freq,
        })
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }
}

/// Head dimension for a usable multi-head layout, `None` when single-head fallback applies.
fn head_layout(dim: usize, heads: usize, kv_heads: usize) -> Option<usize> {
    if heads == 0 || kv_heads == 0 || kv_heads > heads || dim % heads != 0 {
        return None;
    }
    let head_dim = dim / heads;
    (head_dim > 0 && head_dim % 2 == 0).then_some(head_dim)
}

/// `inv_freq[i] = 1 / base^(2i / head_dim)`.
pub fn inverse_frequencies(head_dim: usize, base: f32) -> Vec<f32> {
    (0..head_dim / 2).map(|i| base.powf((2 * i) as f32 / head_dim as f32).recip()).collect()
}
