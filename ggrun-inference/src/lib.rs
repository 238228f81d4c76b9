//! CPU inference runtime for GGUF decoder-only transformers.
//!
//! Loads `F32`/`F16`/`Q4_0`/`Q8_0` weights from a GGUF container and generates tokens one step at a time.

mod configuration;
mod cpu;
mod error;
pub mod gguf;
mod kv_cache;
mod layers;
mod matmul;
pub mod quant;
mod sampler;
mod session;
mod storage;
pub mod tensor_names;
mod transformer;
mod vocab;

use anyhow::{Context, Result};
use log::debug;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub use configuration::{AttentionLayout, ModelConfig};
pub use cpu::CpuCapabilities;
pub use error::{ModelError, Result as ModelResult};
pub use kv_cache::KvCache;
pub use matmul::{MatmulKernel, Precision, ScalarKernel, matmul_q4, select_kernel};
pub use sampler::{Rng, Sampled, Sampler, SamplingPolicy, argmax};
pub use session::{
    CancellationToken, GenerationConfig, GenerationSummary, InferenceSession, Model, Prompt, SessionState, StepOutcome,
    StopReason, TokenEvent,
};
pub use storage::{ModelBytes, ModelContainer, SyntheticModel, WeightStore};
pub use transformer::Transformer;
pub use vocab::{TokenEncoding, Vocabulary};

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: String,
    pub generation: GenerationConfig,
    pub seed: u64,
    pub ctx_length: Option<usize>,
    pub precision: Precision,
    pub allow_synthetic: bool,
    /// `None` starts from the BOS token, or token 0 without one.
    pub prompt: Option<Prompt>,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<usize>,
    repeat_penalty: Option<f32>,
    eos_token: Option<usize>,
    seed: Option<u64>,
    ctx_length: Option<usize>,
    strict: Option<bool>,
    allow_synthetic: Option<bool>,
    prompt_token: Option<usize>,
    prompt_text: Option<String>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn repeat_penalty(mut self, repeat_penalty: Option<f32>) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }
    pub fn eos_token(mut self, eos_token: Option<usize>) -> Self {
        self.eos_token = eos_token;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn strict(mut self, strict: Option<bool>) -> Self {
        self.strict = strict;
        self
    }
    pub fn allow_synthetic(mut self, allow: Option<bool>) -> Self {
        self.allow_synthetic = allow;
        self
    }
    pub fn prompt_token(mut self, token: Option<usize>) -> Self {
        self.prompt_token = token;
        self
    }
    pub fn prompt_text(mut self, text: Option<&String>) -> Self {
        self.prompt_text = text.cloned();
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let defaults = GenerationConfig::default();
        let generation = defaults
            .clone()
            .with_temperature(self.temperature.unwrap_or(defaults.temperature()))
            .with_top_p(self.top_p.unwrap_or(defaults.top_p()))
            .with_max_tokens(self.max_tokens.unwrap_or(defaults.max_tokens()))
            .with_repeat_penalty(self.repeat_penalty.unwrap_or(defaults.repeat_penalty()))
            .with_eos_token(self.eos_token);

        let prompt = match (self.prompt_token, self.prompt_text) {
            (Some(_), Some(_)) => return Err("prompt token and prompt text are mutually exclusive".to_string()),
            (Some(token), None) => Some(Prompt::Token(token)),
            (None, Some(text)) => Some(Prompt::Text(text)),
            (None, None) => None,
        };

        Ok(InferenceConfig {
            model_path: self.model_path.ok_or("model_path is required")?,
            generation,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default()
            }),
            ctx_length: self.ctx_length,
            precision: if self.strict.unwrap_or(false) { Precision::Strict } else { Precision::Relaxed },
            allow_synthetic: self.allow_synthetic.unwrap_or(false),
            prompt,
        })
    }
}

/// Runs one generation and streams the decoded tokens to stdout.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let mut session = InferenceSession::new(
        inference_config.generation.clone(),
        inference_config.precision,
        inference_config.seed,
    )
    .with_ctx_length(inference_config.ctx_length)
    .with_synthetic_fallback(inference_config.allow_synthetic);

    session
        .load(&inference_config.model_path)
        .with_context(|| format!("Failed to load model from {}", inference_config.model_path))?;

    debug!("{session:#?}");

    let prompt = match inference_config.prompt {
        Some(prompt) => prompt,
        None => {
            let bos = session.model().and_then(|model| model.vocab().bos_id()).unwrap_or(0);
            Prompt::Token(bos)
        }
    };

    let mut stdout = io::stdout();
    let summary = session
        .generate(prompt, |event: &TokenEvent| -> io::Result<()> {
            write!(stdout, "{}", event.text)?;
            stdout.flush()
        })
        .context("Generation failed")?;

    println!(
        "\n[Generated {} tokens in {:.2}s - {:.2} tokens/sec, stopped by {:?}]",
        summary.tokens.len(),
        summary.elapsed.as_secs_f64(),
        summary.tokens_per_second(),
        summary.stop_reason
    );
    Ok(())
}
