use log::info;
use rayon::prelude::*;

use crate::configuration::ModelConfig;
use crate::error::{ModelError, Result};
use crate::gguf::GgmlType;
use crate::kv_cache::KvCache;
use crate::layers::{FeedForward, LayerNorm, Linear, MultiHeadAttention, OutputHead, RunState, TokenEmbedding};
use crate::matmul::MatmulKernel;
use crate::storage::WeightStore;
use crate::tensor_names as names;

#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod transformer_test;

/// Decoder-only transformer with LayerNorm, grouped-query attention and a gated feed-forward block
///
/// **Model Components:**
/// 1. **Token Embedding**: `[vocab_size, dim]` table
/// 2. **N Transformer Blocks**: attention then feed-forward, each with its own residual add
/// 3. **Final LayerNorm**: optional gain/bias
/// 4. **Output Head**: projection to vocabulary logits, dense or raw `Q4_0`
///
/// Weights are immutable after loading, so one instance can serve many sessions. All per-sequence state
/// (scratch buffers, KV cache) is passed in by the caller.
pub struct Transformer {
    config: ModelConfig,
    token_embedding: TokenEmbedding,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    head: OutputHead,
}

impl Transformer {
    /// Materializes every weight the forward pass needs.
    ///
    /// Missing or truncated required tensors fail the load; missing norm tensors are logged and act as identity.
    pub fn load(store: &WeightStore) -> Result<Self> {
        let config = store.config().clone();
        let ModelConfig { dim, vocab_size, n_layers, .. } = config;

        let token_embedding = TokenEmbedding::new(store.load_matrix(names::TOKEN_EMBD, vocab_size, dim)?, dim);

        let blocks = (0..n_layers)
            .into_par_iter()
            .map(|layer| TransformerBlock::load(store, &config, layer))
            .collect::<Result<Vec<_>>>()?;

        let final_norm = LayerNorm::new(
            store.load_optional_vector(names::OUTPUT_NORM, dim)?,
            store.load_optional_vector(names::OUTPUT_NORM_BIAS, dim)?,
            config.norm_eps,
        );

        let head = Self::load_head(store, dim, vocab_size)?;

        info!(
            "🧠 Loaded {n_layers} layers: dim={dim}, heads={}/{}, head_dim={}, hidden={}, vocab={vocab_size}, head={}",
            config.n_heads,
            config.n_kv_heads,
            config.head_dim,
            config.hidden_dim,
            if head.is_quantized() { "Q4_0" } else { "dense" }
        );

        Ok(Self { config, token_embedding, blocks, final_norm, head })
    }

    fn load_head(store: &WeightStore, dim: usize, vocab_size: usize) -> Result<OutputHead> {
        let descriptor = store.descriptor(names::OUTPUT)?;
        if descriptor.ty == GgmlType::Q4_0 {
            store.check_matrix(names::OUTPUT, dim, vocab_size)?;
            if let Some(raw) = store.raw_q4_output() {
                return Ok(OutputHead::Q4 { raw, in_features: dim, out_features: vocab_size });
            }
        }
        Ok(OutputHead::Dense(Linear::new(store.load_matrix(names::OUTPUT, dim, vocab_size)?, dim, vocab_size)))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Copies the embedding row of `token` into the residual stream.
    pub fn embed_token(&self, token: usize, state: &mut RunState) -> Result<()> {
        if self.token_embedding.forward(token, &mut state.x) {
            Ok(())
        } else {
            Err(ModelError::InvalidInput(format!(
                "token {token} outside vocabulary of {}",
                self.token_embedding.vocab_size()
            )))
        }
    }

    /// Runs every layer over `state.x` at the cache's current position and returns the logits.
    ///
    /// **Process Flow:**
    /// 1. **Transformer Blocks**: attention writes K/V at the current position, then feed-forward
    /// 2. **Final Normalization**: LayerNorm of the residual stream
    /// 3. **Output Head**: projection to vocabulary space
    pub fn forward<'a>(&self, state: &'a mut RunState, cache: &mut KvCache, kernel: &dyn MatmulKernel) -> &'a [f32] {
        for (layer, block) in self.blocks.iter().enumerate() {
            block.forward(layer, state, cache, kernel);
        }

        self.final_norm.forward(&mut state.xb, &state.x);
        self.head.forward(kernel, &mut state.logits, &state.xb);

        &state.logits
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'_, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("head", &self.head)
            .finish()
    }
}

/// One decoder layer: attention then feed-forward.
#[derive(Debug)]
struct TransformerBlock {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
}

impl TransformerBlock {
    fn load(store: &WeightStore, config: &ModelConfig, layer: usize) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, .. } = *config;
        let q_dim = config.n_heads * config.head_dim;
        let kv_dim = config.kv_dim();
        let name = |suffix: &str| names::layer(layer, suffix);
        let linear = |suffix: &str, rows: usize, cols: usize| -> Result<Linear> {
            Ok(Linear::new(store.load_matrix(&name(suffix), rows, cols)?, rows, cols))
        };

        let attention = MultiHeadAttention::new(
            LayerNorm::new(
                store.load_optional_vector(&name(names::ATTN_NORM), dim)?,
                store.load_optional_vector(&name(names::ATTN_NORM_BIAS), dim)?,
                config.norm_eps,
            ),
            linear(names::ATTN_Q, dim, q_dim)?,
            linear(names::ATTN_K, dim, kv_dim)?,
            linear(names::ATTN_V, dim, kv_dim)?,
            linear(names::ATTN_OUTPUT, q_dim, dim)?,
            config,
        );

        let feed_forward = FeedForward::new(
            LayerNorm::new(
                store.load_optional_vector(&name(names::FFN_NORM), dim)?,
                store.load_optional_vector(&name(names::FFN_NORM_BIAS), dim)?,
                config.norm_eps,
            ),
            linear(names::FFN_UP, dim, hidden_dim)?,
            linear(names::FFN_GATE, dim, hidden_dim)?,
            linear(names::FFN_DOWN, hidden_dim, dim)?,
        );

        Ok(Self { attention, feed_forward })
    }

    fn forward(&self, layer: usize, state: &mut RunState, cache: &mut KvCache, kernel: &dyn MatmulKernel) {
        self.attention.forward(layer, state, cache, kernel);
        self.feed_forward.forward(state, kernel);
    }
}
