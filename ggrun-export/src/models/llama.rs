use ggrun_inference::tensor_names as names;

use super::*;

/// The Llama checkpoint layout, shared by Mistral and the Qwen2/Qwen3 families.
pub struct Llama {
    id: ArchitectureId,
    tensor_mappings: Vec<TensorMapping>,
}

impl Llama {
    const EMBED_TOKENS_KEY: &'static str = "model.embed_tokens.weight";
    const LM_HEAD_KEY: &'static str = "lm_head.weight";
    const FINAL_NORM_KEY: &'static str = "model.norm.weight";

    const QWEN2_UNSUPPORTED: &'static [&'static str] =
        &["model.layers.0.self_attn.q_proj.bias", "model.layers.0.self_attn.k_proj.bias", "model.layers.0.self_attn.v_proj.bias"];
    const QWEN3_UNSUPPORTED: &'static [&'static str] =
        &["model.layers.0.self_attn.q_norm.weight", "model.layers.0.self_attn.k_norm.weight"];

    pub fn new(config: &ModelConfig) -> Self {
        let dim = config.dim;
        let q_dim = config.q_dim();
        let kv_dim = config.kv_dim();
        let hidden = config.hidden_dim;
        let linear = |in_features, out_features| TensorKind::Linear { in_features, out_features };

        #[rustfmt::skip]
        let layer_components = [
            ("input_layernorm.weight", names::ATTN_NORM, TensorKind::Norm { len: dim }),
            ("self_attn.q_proj.weight", names::ATTN_Q, linear(dim, q_dim)),
            ("self_attn.k_proj.weight", names::ATTN_K, linear(dim, kv_dim)),
            ("self_attn.v_proj.weight", names::ATTN_V, linear(dim, kv_dim)),
            ("self_attn.o_proj.weight", names::ATTN_OUTPUT, linear(q_dim, dim)),
            ("post_attention_layernorm.weight", names::FFN_NORM, TensorKind::Norm { len: dim }),
            ("mlp.gate_proj.weight", names::FFN_GATE, linear(dim, hidden)),
            ("mlp.up_proj.weight", names::FFN_UP, linear(dim, hidden)),
            ("mlp.down_proj.weight", names::FFN_DOWN, linear(hidden, dim)),
        ];

        let mut tensor_mappings = Vec::with_capacity(2 + layer_components.len() * config.n_layers as usize);
        tensor_mappings.push(TensorMapping::new(
            Self::EMBED_TOKENS_KEY,
            names::TOKEN_EMBD,
            TensorKind::Embedding { rows: config.vocab_size, cols: dim },
            true,
        ));

        for layer in 0..config.n_layers as usize {
            for (component, target, kind) in layer_components {
                let required = kind.is_matrix();
                tensor_mappings.push(TensorMapping::new(
                    format!("model.layers.{layer}.{component}"),
                    names::layer(layer, target),
                    kind,
                    required,
                ));
            }
        }

        tensor_mappings.push(TensorMapping::new(
            Self::FINAL_NORM_KEY,
            names::OUTPUT_NORM,
            TensorKind::Norm { len: dim },
            false,
        ));

        Self { id: config.architecture, tensor_mappings }
    }
}

impl Architecture for Llama {
    fn id(&self) -> ArchitectureId {
        self.id
    }

    fn embed_tokens_layer(&self) -> &'static str {
        Self::EMBED_TOKENS_KEY
    }

    fn lm_head_layer(&self) -> &'static str {
        Self::LM_HEAD_KEY
    }

    fn tensor_mappings(&self) -> &[TensorMapping] {
        &self.tensor_mappings
    }

    fn unsupported_layers(&self) -> &[&'static str] {
        match self.id {
            ArchitectureId::Qwen2ForCausalLM => Self::QWEN2_UNSUPPORTED,
            ArchitectureId::Qwen3ForCausalLM => Self::QWEN3_UNSUPPORTED,
            ArchitectureId::LlamaForCausalLM | ArchitectureId::MistralForCausalLM => &[],
        }
    }
}
