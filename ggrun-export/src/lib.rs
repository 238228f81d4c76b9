//! # ggrun-export
//!
//! Packs a HuggingFace safetensors checkpoint into a GGUF container the inference crate can load.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use ggrun_export::export_model;
//! use ggrun_inference::gguf::GgmlType;
//!
//! # fn main() -> anyhow::Result<()> {
//! export_model("path/to/huggingface/model", "output/model.gguf", GgmlType::Q4_0)?;
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod model_exporter;
pub mod models;
pub mod tensor_reader;
pub mod tokenizer_exporter;
mod utils;

pub use config_loader::{ModelConfig, load_model_config};
pub use model_exporter::{ExportReport, GgufModelExporter, QuantizedWeight, quantize, transpose};
pub use tokenizer_exporter::{TokenizerData, TokenizerExporter, TokenizerModel};

use anyhow::Result;
use ggrun_inference::gguf::GgmlType;
use log::info;
use std::path::Path;

/// Exports a checkpoint directory into a single container file.
///
/// That is:
/// - linear weights are transposed to `[in × out]` and stored as `weight_type`
/// - the embedding table is stored as `weight_type`, the norm vectors as `F32`
/// - the output head falls back to the embedding table when the checkpoint ties them
/// - the vocabulary from `tokenizer.json`, when present, is embedded as metadata
pub fn export_model(model_path: &str, output_path: &str, weight_type: GgmlType) -> Result<ExportReport> {
    info!("🚀 Starting model export as {weight_type}...");
    info!("");

    let model_path = Path::new(model_path);
    let output_path = Path::new(output_path);

    let config = load_model_config(model_path)?;

    info!("🔤 Loading tokenizer...");
    let tokenizer =
        TokenizerExporter::new().load_tokenizer(model_path, config.vocab_size, config.bos_token_id, config.eos_token_id)?;
    info!("");

    info!("🧮 Exporting weights...");
    let report = GgufModelExporter::new(config, weight_type)?.export(model_path, output_path, tokenizer.as_ref())?;

    info!("");
    info!("✅ Complete export finished successfully!");
    Ok(report)
}
