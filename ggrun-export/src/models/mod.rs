use anyhow::Result;

use crate::ModelConfig;
use crate::models::llama::Llama;

mod llama;

/// Checkpoint architectures the exporter knows how to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureId {
    LlamaForCausalLM,
    MistralForCausalLM,
    Qwen2ForCausalLM,
    Qwen3ForCausalLM,
}

impl ArchitectureId {
    /// Value written to `general.architecture`; also the prefix of the architecture metadata keys.
    pub fn container_name(self) -> &'static str {
        match self {
            Self::LlamaForCausalLM | Self::MistralForCausalLM => "llama",
            Self::Qwen2ForCausalLM => "qwen2",
            Self::Qwen3ForCausalLM => "qwen3",
        }
    }
}

impl TryFrom<&str> for ArchitectureId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "LlamaForCausalLM" => Ok(Self::LlamaForCausalLM),
            "MistralForCausalLM" => Ok(Self::MistralForCausalLM),
            "Qwen2ForCausalLM" => Ok(Self::Qwen2ForCausalLM),
            "Qwen3ForCausalLM" => Ok(Self::Qwen3ForCausalLM),
            _ => anyhow::bail!("Unknown ArchitectureId: {value}"),
        }
    }
}

/// How a checkpoint tensor is laid out and how it lands in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// `[vocab, dim]` lookup table, copied row for row.
    Embedding { rows: u32, cols: u32 },
    /// Checkpoint `[out, in]` weight, transposed to `[in × out]` row-major.
    Linear { in_features: u32, out_features: u32 },
    /// Per-channel vector, always kept as `F32`.
    Norm { len: u32 },
}

impl TensorKind {
    pub fn element_count(self) -> usize {
        match self {
            Self::Embedding { rows, cols } => rows as usize * cols as usize,
            Self::Linear { in_features, out_features } => in_features as usize * out_features as usize,
            Self::Norm { len } => len as usize,
        }
    }

    /// Checkpoint shape, outermost first.
    pub fn source_shape(self) -> Vec<usize> {
        match self {
            Self::Embedding { rows, cols } => vec![rows as usize, cols as usize],
            Self::Linear { in_features, out_features } => vec![out_features as usize, in_features as usize],
            Self::Norm { len } => vec![len as usize],
        }
    }

    /// Container dimensions, fastest-varying first.
    pub fn container_dims(self) -> Vec<u64> {
        match self {
            Self::Embedding { rows, cols } => vec![cols as u64, rows as u64],
            Self::Linear { in_features, out_features } => vec![out_features as u64, in_features as u64],
            Self::Norm { len } => vec![len as u64],
        }
    }

    pub fn is_matrix(self) -> bool {
        !matches!(self, Self::Norm { .. })
    }
}

/// One checkpoint tensor and its place in the container.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMapping {
    pub source: String,
    pub target: String,
    pub kind: TensorKind,
    /// Missing required tensors fail the export; missing optional ones are skipped.
    pub required: bool,
}

impl TensorMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: TensorKind, required: bool) -> Self {
        Self { source: source.into(), target: target.into(), kind, required }
    }
}

pub trait Architecture {
    fn id(&self) -> ArchitectureId;

    fn embed_tokens_layer(&self) -> &'static str;

    fn lm_head_layer(&self) -> &'static str;

    /// Every tensor to export, in container order, except the output head.
    fn tensor_mappings(&self) -> &[TensorMapping];

    /// Checkpoint tensors the runtime has no use for; their presence is reported, not exported.
    fn unsupported_layers(&self) -> &[&'static str];
}

pub fn create_architecture(config: &ModelConfig) -> Box<dyn Architecture> {
    Box::new(Llama::new(config))
}
