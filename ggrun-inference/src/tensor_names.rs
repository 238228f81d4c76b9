//! Container tensor names used by the engine and the exporter.

pub const TOKEN_EMBD: &str = "token_embd.weight";
pub const OUTPUT: &str = "output.weight";
pub const OUTPUT_NORM: &str = "output_norm.weight";
pub const OUTPUT_NORM_BIAS: &str = "output_norm.bias";

pub const ATTN_NORM: &str = "attn_norm.weight";
pub const ATTN_NORM_BIAS: &str = "attn_norm.bias";
pub const ATTN_Q: &str = "attn_q.weight";
pub const ATTN_K: &str = "attn_k.weight";
pub const ATTN_V: &str = "attn_v.weight";
pub const ATTN_OUTPUT: &str = "attn_output.weight";
pub const FFN_NORM: &str = "ffn_norm.weight";
pub const FFN_NORM_BIAS: &str = "ffn_norm.bias";
pub const FFN_UP: &str = "ffn_up.weight";
pub const FFN_GATE: &str = "ffn_gate.weight";
pub const FFN_DOWN: &str = "ffn_down.weight";

/// `blk.{layer}.{suffix}`
pub fn layer(layer: usize, suffix: &str) -> String {
    format!("blk.{layer}.{suffix}")
}
