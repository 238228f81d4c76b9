#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use std::{fs, path::Path};

use crate::models::ArchitectureId;

const DEFAULT_ROPE_THETA: f32 = 10000.0;
const DEFAULT_NORM_EPS: f32 = 1e-5;

/// Architecture scalars of a HuggingFace checkpoint, as the exporter needs them.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub vocab_size: u32,
    pub max_seq_len: u32,
    pub head_dim: u32,
    pub norm_eps: f32,
    pub rope_theta: f32,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub tie_word_embeddings: bool,
    pub name: Option<String>,
    pub architecture: ArchitectureId,
}

impl ModelConfig {
    pub fn q_dim(&self) -> u32 {
        self.n_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> u32 {
        self.n_kv_heads * self.head_dim
    }
}

/// `eos_token_id` is a single id in most checkpoints and a list in some chat models.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn first(self) -> Option<u32> {
        match self {
            Self::One(id) => Some(id),
            Self::Many(ids) => ids.first().copied(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HfConfig {
    hidden_size: u32,
    intermediate_size: u32,
    num_hidden_layers: u32,
    num_attention_heads: u32,
    #[serde(default)]
    num_key_value_heads: Option<u32>,
    vocab_size: u32,
    #[serde(default)]
    max_position_embeddings: Option<u32>,
    #[serde(default)]
    rms_norm_eps: Option<f32>,
    #[serde(default)]
    rope_theta: Option<f32>,
    #[serde(default)]
    head_dim: Option<u32>,
    #[serde(default)]
    bos_token_id: Option<TokenIds>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    tie_word_embeddings: Option<bool>,
    #[serde(default, rename = "_name_or_path")]
    name_or_path: Option<String>,
    #[serde(default)]
    architectures: Option<Vec<String>>,
}

/// Loads `config.json` from a checkpoint directory.
pub fn load_model_config(model_path: &Path) -> Result<ModelConfig> {
    let config_path = model_path.join("config.json");
    if !config_path.exists() {
        anyhow::bail!("No config.json found in {}", model_path.display());
    }
    load_hf_config(&config_path)
}

fn load_hf_config(config_path: &Path) -> Result<ModelConfig> {
    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to open config.json at {}", config_path.display()))?;

    let hf_config: HfConfig =
        serde_json::from_str(&contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {}", err))?;

    if hf_config.num_attention_heads == 0 {
        anyhow::bail!("config.json declares zero attention heads");
    }

    let architecture = match hf_config.architectures.as_deref() {
        Some([single]) => ArchitectureId::try_from(single.as_str())?,
        Some([]) | None => anyhow::bail!("Cannot determine architecture"),
        Some(many) => anyhow::bail!("Multiple architectures are not supported: {many:?}"),
    };

    let head_dim = hf_config.head_dim.unwrap_or(hf_config.hidden_size / hf_config.num_attention_heads);

    let config = ModelConfig {
        dim: hf_config.hidden_size,
        hidden_dim: hf_config.intermediate_size,
        n_layers: hf_config.num_hidden_layers,
        n_heads: hf_config.num_attention_heads,
        n_kv_heads: hf_config.num_key_value_heads.unwrap_or(hf_config.num_attention_heads),
        vocab_size: hf_config.vocab_size,
        max_seq_len: hf_config.max_position_embeddings.unwrap_or(0),
        head_dim,
        norm_eps: hf_config.rms_norm_eps.unwrap_or(DEFAULT_NORM_EPS),
        rope_theta: hf_config.rope_theta.unwrap_or(DEFAULT_ROPE_THETA),
        bos_token_id: hf_config.bos_token_id.and_then(TokenIds::first),
        eos_token_id: hf_config.eos_token_id.and_then(TokenIds::first),
        tie_word_embeddings: hf_config.tie_word_embeddings.unwrap_or(false),
        name: hf_config.name_or_path.filter(|name| !name.is_empty()),
        architecture,
    };

    info!("Model configuration loaded:");
    info!("   • Architecture: {:?}", config.architecture);
    info!("   • Dimensions: {}", config.dim);
    info!("   • Layers: {}", config.n_layers);
    info!("   • Attention heads: {}", config.n_heads);
    info!("   • KV heads: {}", config.n_kv_heads);
    info!("   • Vocabulary size: {}", config.vocab_size);
    info!("   • Max sequence length: {}", config.max_seq_len);
    info!("   • Head dimension: {}", config.head_dim);
    info!("");

    Ok(config)
}
