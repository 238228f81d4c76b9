#[cfg(test)]
#[path = "../tests/unit/tokenizer_exporter_test.rs"]
mod tests;

use anyhow::{Context, Result};
use ggrun_inference::gguf::{ContainerWriter, MetadataValue};
use log::{info, warn};
use serde_json::Value;
use std::{collections::HashMap, fs, path::Path};

/// How token strings are stored, written as `tokenizer.ggml.model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerModel {
    /// Byte-level BPE: bytes are remapped to printable code points.
    Gpt2,
    /// SentencePiece: `▁` for spaces, `<0xNN>` byte fallback tokens.
    Llama,
}

impl TokenizerModel {
    pub fn container_name(self) -> &'static str {
        match self {
            Self::Gpt2 => "gpt2",
            Self::Llama => "llama",
        }
    }
}

/// Vocabulary ready to be written into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerData {
    /// Token strings indexed by id.
    pub tokens: Vec<String>,
    pub model: TokenizerModel,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
}

impl TokenizerData {
    /// Adds the `tokenizer.ggml.*` entries.
    pub fn write_metadata(&self, writer: &mut ContainerWriter) {
        writer.set_metadata("tokenizer.ggml.model", MetadataValue::String(self.model.container_name().to_string()));
        writer.set_metadata("tokenizer.ggml.tokens", MetadataValue::string_array(self.tokens.iter().cloned()));
        if let Some(bos) = self.bos_token_id {
            writer.set_metadata("tokenizer.ggml.bos_token_id", MetadataValue::U32(bos));
        }
        if let Some(eos) = self.eos_token_id {
            writer.set_metadata("tokenizer.ggml.eos_token_id", MetadataValue::U32(eos));
        }
    }
}

/// Reads a HuggingFace `tokenizer.json` into a decode-only vocabulary.
#[derive(Debug)]
pub struct TokenizerExporter;

impl TokenizerExporter {
    const TOKENIZER_FILE_NAME: &'static str = "tokenizer.json";
    const TOKENIZER_CONFIG_FILE_NAME: &'static str = "tokenizer_config.json";

    pub const fn new() -> Self {
        Self
    }

    /// Loads the vocabulary of a checkpoint. `Ok(None)` when the directory has no `tokenizer.json`.
    ///
    /// The token list is padded to `vocab_size` so every embedding row has a string; ids without a token
    /// become `[PAD{id}]`. BOS/EOS ids from `config.json` win over the special tokens named in
    /// `tokenizer_config.json`.
    pub fn load_tokenizer(
        &self,
        model_path: &Path,
        vocab_size: u32,
        bos_token_id: Option<u32>,
        eos_token_id: Option<u32>,
    ) -> Result<Option<TokenizerData>> {
        let tokenizer_path = model_path.join(Self::TOKENIZER_FILE_NAME);
        if !tokenizer_path.exists() {
            warn!("tokenizer.json not found in {}, exporting without a vocabulary", model_path.display());
            return Ok(None);
        }

        let tokenizer_data = self.load_json_file(&tokenizer_path)?;
        let mut vocab = self.extract_vocabulary(&tokenizer_data)?;
        self.add_added_tokens(&tokenizer_data, &mut vocab);

        let config_path = model_path.join(Self::TOKENIZER_CONFIG_FILE_NAME);
        let tokenizer_config = if config_path.exists() {
            Some(self.load_json_file(&config_path)?)
        } else {
            warn!("tokenizer_config.json not found, skipping special tokens");
            None
        };
        if let Some(config) = &tokenizer_config {
            self.add_special_tokens_from_config(config, &mut vocab);
        }

        let special_id = |key: &str| {
            tokenizer_config
                .as_ref()
                .and_then(|config| special_token_content(config, key))
                .and_then(|content| vocab.get(content).copied())
        };
        let bos_token_id = bos_token_id.or_else(|| special_id("bos_token"));
        let eos_token_id = eos_token_id.or_else(|| special_id("eos_token"));

        let model = self.detect_model(&tokenizer_data, &vocab);
        let tokens = self.create_ordered_tokens(&vocab, vocab_size);

        info!("📊 Found {} tokens in vocabulary ({})", vocab.len(), model.container_name());
        if tokens.len() > vocab_size as usize {
            warn!("Tokenizer has {} tokens but the model embeds only {vocab_size}", tokens.len());
        }

        Ok(Some(TokenizerData { tokens, model, bos_token_id, eos_token_id }))
    }

    /// Token strings by id, gaps filled with `[PAD{id}]`.
    fn create_ordered_tokens(&self, vocab: &HashMap<String, u32>, vocab_size: u32) -> Vec<String> {
        let len = vocab.values().map(|&id| id as usize + 1).max().unwrap_or(0).max(vocab_size as usize);
        let mut tokens: Vec<Option<&str>> = vec![None; len];
        for (token, &id) in vocab {
            tokens[id as usize] = Some(token);
        }
        tokens
            .into_iter()
            .enumerate()
            .map(|(id, token)| token.map_or_else(|| format!("[PAD{id}]"), str::to_string))
            .collect()
    }

    fn extract_vocabulary(&self, tokenizer_data: &Value) -> Result<HashMap<String, u32>> {
        let vocab_obj = tokenizer_data
            .pointer("/model/vocab")
            .and_then(|v| v.as_object())
            .or_else(|| tokenizer_data.pointer("/vocab").and_then(|v| v.as_object()))
            .ok_or_else(|| anyhow::anyhow!("Could not find vocabulary in tokenizer.json"))?;

        Ok(vocab_obj.iter().filter_map(|(token, id)| id.as_u64().map(|id| (token.clone(), id as u32))).collect())
    }

    /// `added_tokens` of `tokenizer.json` (special and user tokens outside the model vocabulary).
    fn add_added_tokens(&self, tokenizer_data: &Value, vocab: &mut HashMap<String, u32>) {
        let added = tokenizer_data.pointer("/added_tokens").and_then(|v| v.as_array()).map_or(0, |tokens| {
            tokens
                .iter()
                .filter_map(|token| {
                    let id = token.pointer("/id")?.as_u64()? as u32;
                    let content = token.pointer("/content")?.as_str()?;
                    vocab.insert(content.to_string(), id).is_none().then_some(())
                })
                .count()
        });

        if added > 0 {
            info!("🎯 Added {added} tokens from added_tokens");
        }
    }

    /// `added_tokens_decoder` of `tokenizer_config.json`, for tokens the vocabulary does not list yet.
    fn add_special_tokens_from_config(&self, config_data: &Value, vocab: &mut HashMap<String, u32>) {
        let added_count = config_data
            .pointer("/added_tokens_decoder")
            .and_then(|obj| obj.as_object())
            .map(|added_tokens_obj| {
                added_tokens_obj
                    .iter()
                    .filter_map(|(id_str, token_info)| {
                        let id = id_str.parse::<u32>().ok()?;
                        let content = token_info.pointer("/content")?.as_str()?;
                        if vocab.contains_key(content) {
                            return None;
                        }
                        vocab.insert(content.to_string(), id);
                        Some(())
                    })
                    .count()
            })
            .unwrap_or(0);

        if added_count > 0 {
            info!("🎯 Added {added_count} special tokens from tokenizer_config.json");
        }
    }

    /// Byte-level pre-tokenizers or decoders mean GPT-2 storage; byte fallback or `▁` tokens mean SentencePiece.
    fn detect_model(&self, tokenizer_data: &Value, vocab: &HashMap<String, u32>) -> TokenizerModel {
        let mentions = |pointer: &str, needle: &str| {
            tokenizer_data.pointer(pointer).is_some_and(|v| v.to_string().contains(needle))
        };

        if mentions("/decoder", "ByteLevel") || mentions("/pre_tokenizer", "ByteLevel") {
            TokenizerModel::Gpt2
        } else if tokenizer_data.pointer("/model/byte_fallback").and_then(Value::as_bool).unwrap_or(false)
            || mentions("/decoder", "ByteFallback")
            || mentions("/pre_tokenizer", "Metaspace")
            || vocab.keys().any(|token| token.starts_with('\u{2581}'))
        {
            TokenizerModel::Llama
        } else {
            TokenizerModel::Gpt2
        }
    }

    fn load_json_file(&self, path: &Path) -> Result<Value> {
        let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse JSON from {}", path.display()))
    }
}

impl Default for TokenizerExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// `"bos_token": "<s>"` or `"bos_token": {"content": "<s>", ...}`.
fn special_token_content<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    let value = config.get(key)?;
    value.as_str().or_else(|| value.pointer("/content")?.as_str())
}
