#[cfg(test)]
#[path = "../tests/unit/model_exporter_test.rs"]
mod model_exporter_test;

use anyhow::{Context, Result};
use ggrun_inference::gguf::{ContainerWriter, GgmlType, MetadataValue};
use ggrun_inference::{quant, tensor_names};
use log::{info, warn};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use crate::ModelConfig;
use crate::models::{Architecture, TensorKind, TensorMapping, create_architecture};
use crate::tensor_reader::TensorReader;
use crate::tokenizer_exporter::TokenizerData;
use crate::utils::ProgressTracker;

/// Encoded tensor bytes and the largest absolute reconstruction error.
#[derive(Debug)]
pub struct QuantizedWeight {
    pub data: Vec<u8>,
    pub max_error: f32,
}

/// What an export produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub tensors: usize,
    pub bytes: u64,
    pub max_error: f32,
}

/// Streams checkpoint tensors into a container, one tensor in memory at a time.
///
/// Matrices are stored in the requested element type; norm vectors always stay `F32`.
#[derive(Debug)]
pub struct GgufModelExporter {
    config: ModelConfig,
    weight_type: GgmlType,
}

impl GgufModelExporter {
    pub fn new(config: ModelConfig, weight_type: GgmlType) -> Result<Self> {
        if !matches!(weight_type, GgmlType::F32 | GgmlType::F16 | GgmlType::Q4_0 | GgmlType::Q8_0) {
            anyhow::bail!("Cannot export weights as {weight_type}, use f32, f16, q4_0 or q8_0");
        }
        if config.q_dim() != config.dim {
            anyhow::bail!(
                "Unsupported attention shape: {} heads × {} head_dim != hidden size {}",
                config.n_heads,
                config.head_dim,
                config.dim
            );
        }
        if config.n_kv_heads == 0 || config.n_heads % config.n_kv_heads != 0 {
            anyhow::bail!("{} attention heads cannot be grouped over {} KV heads", config.n_heads, config.n_kv_heads);
        }
        Ok(Self { config, weight_type })
    }

    pub fn weight_type(&self) -> GgmlType {
        self.weight_type
    }

    pub fn export(&self, model_path: &Path, output_path: &Path, tokenizer: Option<&TokenizerData>) -> Result<ExportReport> {
        let tensor_reader = TensorReader::new(model_path)?;
        let architecture = create_architecture(&self.config);

        let plan = self.plan(architecture.as_ref(), &tensor_reader)?;

        let mut writer = ContainerWriter::new();
        self.write_metadata(&mut writer);
        if let Some(tokenizer) = tokenizer {
            tokenizer.write_metadata(&mut writer);
        }
        for mapping in &plan {
            writer.declare_tensor(&mapping.target, &mapping.kind.container_dims(), self.element_type(mapping.kind));
        }

        let result = self.write_tensors(&writer, &plan, &tensor_reader, output_path);
        if result.is_err() {
            // never leave a truncated container behind
            let _ = fs::remove_file(output_path);
        }

        tensor_reader.clear_cache()?;
        let report = result?;

        info!(
            "💾 Written {} tensors ({} bytes) to {}, max {} error {:.8}",
            report.tensors,
            report.bytes,
            output_path.display(),
            self.weight_type,
            report.max_error
        );
        Ok(report)
    }

    fn write_tensors(
        &self,
        writer: &ContainerWriter,
        plan: &[TensorMapping],
        tensor_reader: &TensorReader,
        output_path: &Path,
    ) -> Result<ExportReport> {
        let file = File::create(output_path).with_context(|| format!("Failed to create {}", output_path.display()))?;
        let mut out = BufWriter::new(file);

        let progress = ProgressTracker::new(plan.len(), "Quantizing");
        let mut max_error = 0.0f32;

        let bytes = writer.write_with(&mut out, |idx, pending| -> Result<Vec<u8>> {
            let mapping = &plan[idx];
            progress.set_current(idx + 1, Some(&mapping.target));

            let values = self.convert(mapping, tensor_reader)?;
            let quantized = quantize(pending.ty, &values)?;
            max_error = max_error.max(quantized.max_error);
            Ok(quantized.data)
        })?;

        Ok(ExportReport { tensors: plan.len(), bytes, max_error })
    }

    /// Resolves every container tensor to a checkpoint tensor, output head last.
    fn plan(&self, architecture: &dyn Architecture, tensor_reader: &TensorReader) -> Result<Vec<TensorMapping>> {
        for &name in architecture.unsupported_layers() {
            if tensor_reader.contains(name) {
                warn!("{:?} checkpoints carry tensors like {name} that the runtime ignores", architecture.id());
            }
        }

        let mut plan = Vec::with_capacity(architecture.tensor_mappings().len() + 1);
        for mapping in architecture.tensor_mappings() {
            match (tensor_reader.contains(&mapping.source), mapping.required) {
                (true, _) => plan.push(mapping.clone()),
                (false, false) => warn!("Optional tensor {} not found, skipping", mapping.source),
                (false, true) => anyhow::bail!("Missing weight tensor: {}", mapping.source),
            }
        }

        let head_kind = TensorKind::Linear { in_features: self.config.dim, out_features: self.config.vocab_size };
        let lm_head = architecture.lm_head_layer();
        let head_source = if !self.config.tie_word_embeddings && tensor_reader.contains(lm_head) {
            lm_head
        } else {
            info!("Output head tied to {}", architecture.embed_tokens_layer());
            architecture.embed_tokens_layer()
        };
        plan.push(TensorMapping::new(head_source, tensor_names::OUTPUT, head_kind, true));

        Ok(plan)
    }

    fn element_type(&self, kind: TensorKind) -> GgmlType {
        if kind.is_matrix() { self.weight_type } else { GgmlType::F32 }
    }

    /// Loads one checkpoint tensor and rearranges it into container layout.
    fn convert(&self, mapping: &TensorMapping, tensor_reader: &TensorReader) -> Result<Vec<f32>> {
        let tensor = tensor_reader
            .load_tensor(&mapping.source)?
            .ok_or_else(|| anyhow::anyhow!("Missing weight tensor: {}", mapping.source))?;

        let expected = mapping.kind.source_shape();
        if tensor.shape != expected {
            anyhow::bail!("Tensor {} has shape {:?}, expected {:?}", mapping.source, tensor.shape, expected);
        }

        Ok(match mapping.kind {
            TensorKind::Linear { in_features, out_features } => {
                transpose(&tensor.values, out_features as usize, in_features as usize)
            }
            TensorKind::Embedding { .. } | TensorKind::Norm { .. } => tensor.values,
        })
    }

    fn write_metadata(&self, writer: &mut ContainerWriter) {
        let config = &self.config;
        let arch = config.architecture.container_name();
        let key = |suffix: &str| format!("{arch}.{suffix}");

        writer
            .set_metadata("general.architecture", MetadataValue::String(arch.to_string()))
            .set_metadata("general.file_type", MetadataValue::U32(self.weight_type.id()))
            .set_metadata(key("embedding_length"), MetadataValue::U32(config.dim))
            .set_metadata(key("block_count"), MetadataValue::U32(config.n_layers))
            .set_metadata(key("feed_forward_length"), MetadataValue::U32(config.hidden_dim))
            .set_metadata(key("attention.head_count"), MetadataValue::U32(config.n_heads))
            .set_metadata(key("attention.head_count_kv"), MetadataValue::U32(config.n_kv_heads))
            .set_metadata(key("rope.freq_base"), MetadataValue::F32(config.rope_theta))
            .set_metadata(key("attention.layer_norm_epsilon"), MetadataValue::F32(config.norm_eps))
            .set_metadata(key("vocab_size"), MetadataValue::U32(config.vocab_size));

        if config.max_seq_len > 0 {
            writer.set_metadata(key("context_length"), MetadataValue::U32(config.max_seq_len));
        }
        if let Some(name) = &config.name {
            writer.set_metadata("general.name", MetadataValue::String(name.clone()));
        }
    }
}

/// Encodes `values` as `ty` and measures the round-trip error.
pub fn quantize(ty: GgmlType, values: &[f32]) -> Result<QuantizedWeight> {
    let data = quant::encode(ty, values).ok_or_else(|| anyhow::anyhow!("No encoder for {ty}"))?;

    if ty == GgmlType::F32 {
        return Ok(QuantizedWeight { data, max_error: 0.0 });
    }

    let mut decoded = vec![0.0f32; values.len()];
    if !quant::decode_into(ty, &data, &mut decoded) {
        anyhow::bail!("No decoder for {ty}");
    }
    let max_error = values
        .par_iter()
        .zip(decoded.par_iter())
        .map(|(a, b)| (a - b).abs())
        .reduce(|| 0.0f32, f32::max);

    Ok(QuantizedWeight { data, max_error })
}

/// `[rows × cols]` row-major into `[cols × rows]` row-major.
pub fn transpose(values: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; values.len()];
    out.par_chunks_mut(rows.max(1)).enumerate().for_each(|(col, out_row)| {
        for (row, slot) in out_row.iter_mut().enumerate() {
            *slot = values[row * cols + col];
        }
    });
    out
}
