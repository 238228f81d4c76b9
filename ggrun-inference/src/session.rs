//! Token-by-token generation over a loaded model.
//!
//! A [`Model`] is immutable once loaded and can be shared between sessions through an `Arc`.
//! Each [`InferenceSession`] owns everything that changes per sequence: scratch buffers, KV cache, sampler and RNG.

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::cpu::CpuCapabilities;
use crate::error::{ModelError, Result};
use crate::kv_cache::KvCache;
use crate::layers::{RunState, byte_embedding};
use crate::matmul::{MatmulKernel, Precision, select_kernel};
use crate::sampler::{Rng, Sampler};
use crate::storage::{ModelContainer, WeightStore};
use crate::transformer::Transformer;
use crate::vocab::Vocabulary;

#[cfg(test)]
#[path = "../tests/unit/session_test.rs"]
mod session_test;

/// Sampling and stopping parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    eos_token: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_tokens: 64, temperature: 0.8, top_p: 0.95, repeat_penalty: 1.1, eos_token: None }
    }
}

impl GenerationConfig {
    /// At least one token is always generated.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.max(0.0);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p.clamp(0.0, 1.0);
        self
    }

    /// Stored for callers; the sampler does not apply it.
    pub fn with_repeat_penalty(mut self, repeat_penalty: f32) -> Self {
        self.repeat_penalty = repeat_penalty.max(1.0);
        self
    }

    pub fn with_eos_token(mut self, eos_token: Option<usize>) -> Self {
        self.eos_token = eos_token;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn repeat_penalty(&self) -> f32 {
        self.repeat_penalty
    }

    pub fn eos_token(&self) -> Option<usize> {
        self.eos_token
    }
}

/// What the first step starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// One token id, looked up in the embedding table.
    Token(usize),
    /// Every token is run through the model; sampling starts after the last one.
    Tokens(Vec<usize>),
    /// Placeholder byte embedding of the text.
    Text(String),
    /// A ready-made input vector of the model's width.
    Embedding(Vec<f32>),
}

impl Prompt {
    fn len(&self) -> usize {
        match self {
            Prompt::Tokens(tokens) => tokens.len(),
            _ => 1,
        }
    }
}

/// One generated token, handed to the caller's sink as soon as it is sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    /// Zero-based count within this generation
    pub index: usize,
    pub token: usize,
    pub text: String,
    /// Cache position the token was produced at
    pub position: usize,
    /// Post-softmax probability of the token
    pub prob: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Budget,
    EndOfSequence,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub tokens: Vec<usize>,
    pub text: String,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

impl GenerationSummary {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.tokens.len() as f64 / secs } else { 0.0 }
    }
}

/// Result of one call to [`InferenceSession::step`].
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step budget ran out; call `step` again to continue.
    Yielded { emitted: usize },
    Finished(GenerationSummary),
}

/// Cooperative stop signal, checked between tokens.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Generating,
    Completed,
    Failed,
}

/// Immutable weights, decoded transformer and vocabulary.
#[derive(Debug)]
pub struct Model {
    store: WeightStore,
    transformer: Transformer,
    vocab: Vocabulary,
}

impl Model {
    /// Opens a container file. With `allow_synthetic`, a missing file yields a zero-filled synthetic model.
    pub fn open(path: impl AsRef<Path>, allow_synthetic: bool) -> Result<Self> {
        let path = path.as_ref();
        let container = match ModelContainer::open(path) {
            Err(ModelError::Io { source, .. }) if allow_synthetic && source.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, developer mode falls back to a synthetic model", path.display());
                ModelContainer::synthetic()?
            }
            other => other?,
        };
        Self::from_container(container)
    }

    pub fn from_container(container: ModelContainer) -> Result<Self> {
        let vocab = Vocabulary::load(container.metadata(), container.source());
        let store = WeightStore::new(container);
        let transformer = Transformer::load(&store)?;
        Ok(Self { store, transformer, vocab })
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }
}

/// Per-sequence state, rebuilt by every `begin`.
struct Generation {
    run_state: RunState,
    cache: KvCache,
    sampler: Sampler,
    tokens: Vec<usize>,
    started: Instant,
    sampled: bool,
}

pub struct InferenceSession {
    model: Option<Arc<Model>>,
    source: Option<PathBuf>,
    allow_synthetic: bool,
    config: GenerationConfig,
    ctx_length: Option<usize>,
    kernel: Box<dyn MatmulKernel>,
    seed: u64,
    rng: Rng,
    cancel: CancellationToken,
    generation: Option<Generation>,
    state: SessionState,
}

impl InferenceSession {
    pub fn new(config: GenerationConfig, precision: Precision, seed: u64) -> Self {
        Self {
            model: None,
            source: None,
            allow_synthetic: false,
            config,
            ctx_length: None,
            kernel: select_kernel(CpuCapabilities::detect(), precision),
            seed,
            rng: Rng::new(seed),
            cancel: CancellationToken::new(),
            generation: None,
            state: SessionState::Unloaded,
        }
    }

    /// Fixes the cache capacity instead of deriving it from the prompt and token budget.
    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    /// Allows [`load`](Self::load) to fall back to a synthetic model when the file is missing.
    pub fn with_synthetic_fallback(mut self, allow: bool) -> Self {
        self.allow_synthetic = allow;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: GenerationConfig) {
        self.config = config;
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.model.as_ref()
    }

    /// Handle other threads can use to stop the running generation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Loads a model file. On failure the session stays `Unloaded`.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.unload();
        let model = Model::open(path, self.allow_synthetic)?;
        self.source = Some(path.to_path_buf());
        self.attach(Arc::new(model));
        Ok(())
    }

    /// Uses an already loaded model, typically one shared with another session.
    pub fn attach(&mut self, model: Arc<Model>) {
        self.generation = None;
        self.model = Some(model);
        self.state = SessionState::Loaded;
    }

    pub fn unload(&mut self) {
        self.generation = None;
        self.model = None;
        self.state = SessionState::Unloaded;
    }

    /// Replaces the model with another file, or reloads the current one when `path` is `None`.
    pub fn hot_patch(&mut self, path: Option<&Path>) -> Result<()> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.source.clone())
            .ok_or_else(|| ModelError::InvalidState("no model path to reload".to_string()))?;
        info!("♻️ Reloading model from {}", path.display());
        self.load(path)
    }

    /// Prepares a generation: sizes the cache, runs any prefill tokens and places the first input.
    pub fn begin(&mut self, prompt: Prompt) -> Result<()> {
        let model = self.model.clone().ok_or(ModelError::NotLoaded)?;
        if self.state == SessionState::Generating {
            debug!("Abandoning the running generation");
        }
        self.generation = None;
        self.cancel.reset();
        self.rng = Rng::new(self.seed);

        match self.prefill(&model, prompt) {
            Ok(generation) => {
                self.generation = Some(generation);
                self.state = SessionState::Generating;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn prefill(&self, model: &Model, prompt: Prompt) -> Result<Generation> {
        let transformer = &model.transformer;
        let config = transformer.config();
        let capacity = self.capacity_for(config.context_length, prompt.len());

        let mut run_state = RunState::new(config, capacity);
        let mut cache = KvCache::for_model(config, capacity);
        info!("KV cache: {capacity} positions, {} bytes", cache.size_bytes());

        match prompt {
            Prompt::Token(token) => transformer.embed_token(token, &mut run_state)?,
            Prompt::Tokens(tokens) => {
                let Some((&last, history)) = tokens.split_last() else {
                    return Err(ModelError::InvalidInput("empty token prompt".to_string()));
                };
                for &token in history {
                    transformer.embed_token(token, &mut run_state)?;
                    transformer.forward(&mut run_state, &mut cache, self.kernel.as_ref());
                    cache.advance();
                }
                transformer.embed_token(last, &mut run_state)?;
            }
            Prompt::Text(text) => byte_embedding(&text, &mut run_state.x),
            Prompt::Embedding(values) => {
                if values.len() != config.dim {
                    return Err(ModelError::InvalidInput(format!(
                        "embedding has {} values, model width is {}",
                        values.len(),
                        config.dim
                    )));
                }
                run_state.x.copy_from_slice(&values);
            }
        }

        Ok(Generation {
            run_state,
            cache,
            sampler: Sampler::new(config.vocab_size, self.config.temperature, self.config.top_p),
            tokens: Vec::with_capacity(self.config.max_tokens),
            started: Instant::now(),
            sampled: false,
        })
    }

    /// Override, else `max_tokens + prompt length` bounded by the model's context length; at least 1.
    fn capacity_for(&self, context_length: Option<usize>, prompt_len: usize) -> usize {
        let capacity = self.ctx_length.unwrap_or_else(|| {
            let wanted = self.config.max_tokens + prompt_len;
            context_length.map_or(wanted, |limit| wanted.min(limit))
        });
        capacity.max(1)
    }

    /// Generates up to `budget` tokens, delivering each to `sink`.
    ///
    /// Returns `Finished` once the token budget, the end-of-sequence id or a cancellation ends the generation.
    /// A sink error fails the generation; tokens already delivered stay delivered.
    pub fn step<F, E>(&mut self, budget: usize, mut sink: F) -> Result<StepOutcome>
    where
        F: FnMut(&TokenEvent) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let model = self.model.clone().ok_or(ModelError::NotLoaded)?;
        if self.state != SessionState::Generating {
            return Err(ModelError::InvalidState(format!("cannot step a session in state {:?}", self.state)));
        }
        let Some(generation) = self.generation.as_mut() else {
            return Err(ModelError::InvalidState("no generation in progress".to_string()));
        };

        let transformer = &model.transformer;
        let mut emitted = 0;
        let stop = loop {
            if self.cancel.is_cancelled() {
                break Some(StopReason::Cancelled);
            }
            if generation.tokens.len() >= self.config.max_tokens {
                break Some(StopReason::Budget);
            }
            if emitted >= budget {
                break None;
            }

            let position = generation.cache.position();
            transformer.forward(&mut generation.run_state, &mut generation.cache, self.kernel.as_ref());
            let Some(sampled) = generation.sampler.sample(&mut generation.run_state.logits, &mut self.rng) else {
                self.state = SessionState::Failed;
                return Err(ModelError::InvalidState("model produced no logits".to_string()));
            };
            generation.sampled = true;
            debug!("token {} p={:.4} at position {position}", sampled.token, sampled.prob);

            let event = TokenEvent {
                index: generation.tokens.len(),
                token: sampled.token,
                text: model.vocab.decode(sampled.token),
                position,
                prob: sampled.prob,
            };
            generation.tokens.push(sampled.token);
            emitted += 1;

            if let Err(e) = sink(&event) {
                self.state = SessionState::Failed;
                return Err(ModelError::Sink(e.to_string()));
            }

            if self.config.eos_token == Some(sampled.token) {
                break Some(StopReason::EndOfSequence);
            }

            generation.cache.advance();
            if let Err(e) = transformer.embed_token(sampled.token, &mut generation.run_state) {
                self.state = SessionState::Failed;
                return Err(e);
            }
        };

        match stop {
            None => Ok(StepOutcome::Yielded { emitted }),
            Some(stop_reason) => {
                self.state = SessionState::Completed;
                let summary = GenerationSummary {
                    text: model.vocab.decode_all(&generation.tokens),
                    tokens: generation.tokens.clone(),
                    stop_reason,
                    elapsed: generation.started.elapsed(),
                };
                info!(
                    "Generated {} tokens in {:.2}s - {:.2} tokens/sec ({:?})",
                    summary.tokens.len(),
                    summary.elapsed.as_secs_f64(),
                    summary.tokens_per_second(),
                    summary.stop_reason
                );
                Ok(StepOutcome::Finished(summary))
            }
        }
    }

    /// Runs a whole generation from `prompt` to completion.
    pub fn generate<F, E>(&mut self, prompt: Prompt, mut sink: F) -> Result<GenerationSummary>
    where
        F: FnMut(&TokenEvent) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        self.begin(prompt)?;
        loop {
            if let StepOutcome::Finished(summary) = self.step(usize::MAX, &mut sink)? {
                return Ok(summary);
            }
        }
    }

    /// Copies the probability distribution of the last sampled step into `out`.
    pub fn copy_logits_into(&self, out: &mut [f32]) -> Result<()> {
        if self.model.is_none() {
            return Err(ModelError::NotLoaded);
        }
        let generation = self
            .generation
            .as_ref()
            .filter(|generation| generation.sampled)
            .ok_or_else(|| ModelError::InvalidState("no step has been sampled yet".to_string()))?;

        let logits = &generation.run_state.logits;
        if out.len() != logits.len() {
            return Err(ModelError::OutputBuffer { expected: logits.len(), actual: out.len() });
        }
        out.copy_from_slice(logits);
        Ok(())
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("state", &self.state)
            .field("source", &self.source)
            .field("config", &self.config)
            .field("ctx_length", &self.ctx_length)
            .field("kernel", &self.kernel.name())
            .field("seed", &self.seed)
            .finish()
    }
}
