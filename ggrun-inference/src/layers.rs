use std::sync::Arc;

use crate::configuration::{AttentionLayout, ModelConfig};
use crate::kv_cache::KvCache;
use crate::matmul::{MatmulKernel, matmul_q4};

#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

/// Token embedding table
///
/// **Purpose**: Maps token ids to rows of a `[vocab_size, dim]` table
pub struct TokenEmbedding {
    pub embedding_table: Vec<f32>,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(embedding_table: Vec<f32>, dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding_table.len() / self.dim
    }

    /// Copies the row of `token`; returns `false` when the id is outside the table.
    pub fn forward(&self, token: usize, output: &mut [f32]) -> bool {
        let Some(start) = token.checked_mul(self.dim) else {
            return false;
        };
        let Some(end) = start.checked_add(self.dim) else {
            return false;
        };
        match self.embedding_table.get(start..end) {
            Some(row) => {
                output[..self.dim].copy_from_slice(row);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

/// Placeholder embedding for raw text: `e[i] = byte_i / 255 + 0.01 * i / dim` over the first `dim` bytes.
pub fn byte_embedding(text: &str, output: &mut [f32]) {
    let dim = output.len();
    output.fill(0.0);
    for (i, (slot, &byte)) in output.iter_mut().zip(text.as_bytes()).enumerate() {
        *slot = byte as f32 / 255.0 + 0.01 * (i as f32 / dim as f32);
    }
}

/// Layer normalization with optional gain and bias
///
/// **Mathematical Formula**:
/// ```text
/// LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + ε) * γ + β
/// ```
/// A missing `γ` acts as ones and a missing `β` as zeros.
pub struct LayerNorm {
    pub gain: Option<Vec<f32>>,
    pub bias: Option<Vec<f32>>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(gain: Option<Vec<f32>>, bias: Option<Vec<f32>>, eps: f32) -> Self {
        Self { gain, bias, eps }
    }

    pub fn identity(eps: f32) -> Self {
        Self::new(None, None, eps)
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());

        let n = input.len() as f32;
        let mean = input.iter().sum::<f32>() / n;
        let var = input.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let inv_std = (var + self.eps).sqrt().recip();

        for (i, (out, &x)) in output.iter_mut().zip(input).enumerate() {
            let g = self.gain.as_ref().map_or(1.0, |g| g[i]);
            let b = self.bias.as_ref().map_or(0.0, |b| b[i]);
            *out = (x - mean) * inv_std * g + b;
        }
    }
}

impl std::fmt::Debug for LayerNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerNorm")
            .field("gain", &self.gain.as_ref().map(Vec::len))
            .field("bias", &self.bias.as_ref().map(Vec::len))
            .field("eps", &self.eps)
            .finish()
    }
}

/// Rotary Position Embedding over adjacent pairs
///
/// **Mathematical Foundation**:
/// - Pair `(h[i], h[i+1])` is rotated by `pos * inv_freq[i / 2]`
/// - Rotation preserves the vector norm; only the relative angle between positions matters
#[derive(Debug, Clone)]
pub struct RoPE {
    pub inv_freq: Vec<f32>,
}

impl RoPE {
    pub fn new(inv_freq: Vec<f32>) -> Self {
        Self { inv_freq }
    }

    pub fn apply(&self, head: &mut [f32], pos: usize) {
        for (pair, &freq) in head.chunks_exact_mut(2).zip(&self.inv_freq) {
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();
            let (v0, v1) = (pair[0], pair[1]);
            pair[0] = v0 * cos - v1 * sin;
            pair[1] = v0 * sin + v1 * cos;
        }
    }
}

/// Dense projection stored as a row-major `[in_features, out_features]` matrix.
pub struct Linear {
    pub weight: Vec<f32>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, in_features: usize, out_features: usize) -> Self {
        debug_assert_eq!(weight.len(), in_features * out_features);
        Self { weight, in_features, out_features }
    }

    pub fn forward(&self, kernel: &dyn MatmulKernel, output: &mut [f32], input: &[f32]) {
        kernel.matmul(input, &self.weight, output, 1, self.in_features, self.out_features);
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Final vocabulary projection: dense, or raw `Q4_0` blocks dequantized on the fly.
pub enum OutputHead {
    Dense(Linear),
    Q4 { raw: Arc<[u8]>, in_features: usize, out_features: usize },
}

impl OutputHead {
    pub fn forward(&self, kernel: &dyn MatmulKernel, output: &mut [f32], input: &[f32]) {
        match self {
            Self::Dense(linear) => linear.forward(kernel, output, input),
            Self::Q4 { raw, in_features, out_features } => {
                matmul_q4(input, raw, output, 1, *in_features, *out_features)
            }
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Q4 { .. })
    }
}

impl std::fmt::Debug for OutputHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dense(linear) => f.debug_tuple("Dense").field(linear).finish(),
            Self::Q4 { raw, in_features, out_features } => f
                .debug_struct("Q4")
                .field("bytes", &raw.len())
                .field("in_features", in_features)
                .field("out_features", out_features)
                .finish(),
        }
    }
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// **Architecture Details**:
/// - `n_heads` query heads read `n_kv_heads` key/value heads; head `h` uses kv head `h * n_kv_heads / n_heads`
/// - Queries come from the normalized input, keys and values from the raw residual stream
/// - Keys are rotated before caching, values are cached as projected
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_head)V
/// ```
pub struct MultiHeadAttention {
    pub norm: LayerNorm,
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    /// `None` for the single-head layout.
    pub rope: Option<RoPE>,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(norm: LayerNorm, wq: Linear, wk: Linear, wv: Linear, wo: Linear, config: &ModelConfig) -> Self {
        let rope = match config.layout {
            AttentionLayout::Grouped => Some(RoPE::new(config.inv_freq.clone())),
            AttentionLayout::SingleHead => None,
        };
        Self {
            norm,
            wq,
            wk,
            wv,
            wo,
            rope,
            n_heads: config.n_heads,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
        }
    }

    /// Attends at the cache's current position and adds the result onto `state.x`.
    pub fn forward(&self, layer: usize, state: &mut RunState, cache: &mut KvCache, kernel: &dyn MatmulKernel) {
        let RunState { x, xb, q, k, v, att, attn_out, proj, .. } = state;
        let pos = cache.position();
        let head_dim = self.head_dim;

        // Projections
        self.norm.forward(xb, x);
        self.wq.forward(kernel, q, xb);
        self.wk.forward(kernel, k, x);
        self.wv.forward(kernel, v, x);

        // Rotary embeddings per head
        if let Some(rope) = &self.rope {
            q.chunks_exact_mut(head_dim).take(self.n_heads).for_each(|head| rope.apply(head, pos));
            k.chunks_exact_mut(head_dim).take(self.n_kv_heads).for_each(|head| rope.apply(head, pos));
        }

        for kv_head in 0..self.n_kv_heads {
            let range = kv_head * head_dim..(kv_head + 1) * head_dim;
            cache.write(layer, kv_head, &k[range.clone()], &v[range]);
        }

        // Scaled dot-product attention over positions 0..=pos
        let scale = (head_dim as f32).sqrt().recip();
        let scores = &mut att[..=pos];

        for head in 0..self.n_heads {
            let kv_head = head * self.n_kv_heads / self.n_heads;
            let q_head = &q[head * head_dim..(head + 1) * head_dim];
            let keys = cache.keys(layer, kv_head);
            let values = cache.values(layer, kv_head);

            for (score, key) in scores.iter_mut().zip(keys.chunks_exact(head_dim)) {
                *score = q_head.iter().zip(key).map(|(&a, &b)| a * b).sum::<f32>() * scale;
            }
            softmax(scores);

            let out_head = &mut attn_out[head * head_dim..(head + 1) * head_dim];
            out_head.fill(0.0);
            for (&weight, value) in scores.iter().zip(values.chunks_exact(head_dim)) {
                out_head.iter_mut().zip(value).for_each(|(out, &v)| *out += weight * v);
            }
        }

        // Output projection and residual
        self.wo.forward(kernel, proj, attn_out);
        x.iter_mut().zip(proj.iter()).for_each(|(x, &p)| *x += p);
    }
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("rope", &self.rope.is_some())
            .field("norm", &self.norm)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Feed-Forward Network with a SiLU-gated linear unit
///
/// **Activation**: `up ⊙ gate ⊙ sigmoid(gate)`
/// **Components**:
/// - **Up / Gate**: project to the hidden width
/// - **Down**: projects back to the embedding width, then adds onto the residual stream
pub struct FeedForward {
    pub norm: LayerNorm,
    pub up: Linear,
    pub gate: Linear,
    pub down: Linear,
}

impl FeedForward {
    pub fn new(norm: LayerNorm, up: Linear, gate: Linear, down: Linear) -> Self {
        Self { norm, up, gate, down }
    }

    pub fn forward(&self, state: &mut RunState, kernel: &dyn MatmulKernel) {
        let RunState { x, xb, hb, hb2, proj, .. } = state;

        self.norm.forward(xb, x);
        self.up.forward(kernel, hb, xb);
        self.gate.forward(kernel, hb2, xb);

        hb.iter_mut().zip(hb2.iter()).for_each(|(up, &gate)| {
            let sigmoid = (1.0f32 + (-gate).exp()).recip();
            *up *= gate * sigmoid;
        });

        self.down.forward(kernel, proj, hb);
        x.iter_mut().zip(proj.iter()).for_each(|(x, &p)| *x += p);
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.up.out_features)
            .field("norm", &self.norm)
            .field("up", &self.up)
            .field("gate", &self.gate)
            .field("down", &self.down)
            .finish()
    }
}

/// Max-subtracted softmax in place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    if sum > 0.0 {
        let inv_sum = sum.recip();
        x.iter_mut().for_each(|val| *val *= inv_sum);
    }
}

/// Scratch buffers for one forward pass, sized once per session.
#[derive(Debug)]
pub struct RunState {
    /// Residual stream
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Normalized copy of the residual stream
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Shape: [n_heads * head_dim]
    pub q: Vec<f32>,
    /// Shape: [n_kv_heads * head_dim]
    pub k: Vec<f32>,
    /// Shape: [n_kv_heads * head_dim]
    pub v: Vec<f32>,

    /// Attention scores for one head
    /// Shape: [cache capacity]
    pub att: Vec<f32>,

    /// Concatenated head outputs
    /// Shape: [n_heads * head_dim]
    pub attn_out: Vec<f32>,

    /// Block output before the residual add
    /// Shape: [dim]
    pub proj: Vec<f32>,

    /// Up projection, then activation
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,
    /// Gate projection
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Logits, then probabilities after sampling
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,
}

impl RunState {
    pub fn new(config: &ModelConfig, capacity: usize) -> Self {
        let ModelConfig { dim, hidden_dim, n_heads, head_dim, vocab_size, .. } = *config;
        let all_heads_dim = n_heads * head_dim;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            q: vec![0.0; all_heads_dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; capacity.max(1)],
            attn_out: vec![0.0; all_heads_dim],
            proj: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            logits: vec![0.0; vocab_size],
        }
    }
}
