//! Decode-only vocabulary: token id to display text.
//!
//! Token strings come from `tokenizer.ggml.tokens`, else from a `<model>.vocab` sidecar (one token per line).
//! Ids without a string decode as `<token_N>`.

use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ModelError, Result};
use crate::gguf::Metadata;

#[cfg(test)]
#[path = "../tests/unit/vocab_test.rs"]
mod vocab_test;

pub const TOKENS_KEY: &str = "tokenizer.ggml.tokens";
pub const MODEL_KEY: &str = "tokenizer.ggml.model";
pub const BOS_KEY: &str = "tokenizer.ggml.bos_token_id";
pub const EOS_KEY: &str = "tokenizer.ggml.eos_token_id";

/// How stored token strings map back to bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenEncoding {
    /// Strings are the token text as-is.
    Plain,
    /// GPT-2 byte-level BPE: every byte is stored as a printable code point.
    ByteLevel,
    /// SentencePiece: `▁` marks a space and `<0xNN>` is a raw byte.
    SentencePiece,
}

impl TokenEncoding {
    fn from_model(model: Option<&str>) -> Self {
        match model {
            Some("gpt2") => TokenEncoding::ByteLevel,
            Some("llama") => TokenEncoding::SentencePiece,
            _ => TokenEncoding::Plain,
        }
    }
}

pub struct Vocabulary {
    tokens: Vec<String>,
    encoding: TokenEncoding,
    byte_decoder: HashMap<char, u8>,
    bos_id: Option<usize>,
    eos_id: Option<usize>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>, encoding: TokenEncoding) -> Self {
        let byte_decoder = match encoding {
            TokenEncoding::ByteLevel => byte_decoder(),
            _ => HashMap::new(),
        };
        Self { tokens, encoding, byte_decoder, bos_id: None, eos_id: None }
    }

    /// No token strings; every id decodes as `<token_N>`.
    pub fn empty() -> Self {
        Self::new(Vec::new(), TokenEncoding::Plain)
    }

    /// Builds the vocabulary for a model: container metadata first, then the sidecar next to `model_path`.
    pub fn load(metadata: &Metadata, model_path: Option<&Path>) -> Self {
        let encoding = TokenEncoding::from_model(metadata.get_str(MODEL_KEY));

        let mut vocab = match metadata.get_strings(TOKENS_KEY) {
            Some(tokens) if !tokens.is_empty() => {
                info!("📖 Vocabulary: {} tokens from container ({encoding:?})", tokens.len());
                Self::new(tokens, encoding)
            }
            _ => match model_path.map(sidecar_path) {
                Some(path) if path.exists() => match Self::from_sidecar(&path, encoding) {
                    Ok(vocab) => {
                        info!("📖 Vocabulary: {} tokens from {}", vocab.len(), path.display());
                        vocab
                    }
                    Err(e) => {
                        warn!("Ignoring vocabulary sidecar: {e}");
                        Self::empty()
                    }
                },
                _ => {
                    warn!("No vocabulary found, tokens decode as <token_N>");
                    Self::empty()
                }
            },
        };

        vocab.bos_id = metadata.get_u64(BOS_KEY).map(|id| id as usize);
        vocab.eos_id = metadata.get_u64(EOS_KEY).map(|id| id as usize);
        vocab
    }

    pub fn from_sidecar(path: &Path, encoding: TokenEncoding) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ModelError::io(path, e))?;
        Ok(Self::new(text.lines().map(str::to_string).collect(), encoding))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn encoding(&self) -> TokenEncoding {
        self.encoding
    }

    pub fn bos_id(&self) -> Option<usize> {
        self.bos_id
    }

    pub fn eos_id(&self) -> Option<usize> {
        self.eos_id
    }

    /// Stored string for `id`, undecoded.
    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    /// Raw bytes of one token after undoing the storage encoding.
    pub fn token_bytes(&self, id: usize) -> Vec<u8> {
        let Some(text) = self.token(id) else {
            return format!("<token_{id}>").into_bytes();
        };

        match self.encoding {
            TokenEncoding::Plain => text.as_bytes().to_vec(),
            TokenEncoding::ByteLevel => {
                let mut bytes = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    match self.byte_decoder.get(&ch) {
                        Some(&b) => bytes.push(b),
                        None => bytes.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
                    }
                }
                bytes
            }
            TokenEncoding::SentencePiece => match parse_byte_token(text) {
                Some(b) => vec![b],
                None => text.replace('\u{2581}', " ").into_bytes(),
            },
        }
    }

    /// Display text of one token. Partial UTF-8 sequences are replaced lossily.
    pub fn decode(&self, id: usize) -> String {
        String::from_utf8_lossy(&self.token_bytes(id)).into_owned()
    }

    /// Decodes a whole sequence at once, so multi-byte characters split across tokens survive.
    pub fn decode_all(&self, ids: &[usize]) -> String {
        let bytes: Vec<u8> = ids.iter().flat_map(|&id| self.token_bytes(id)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("tokens", &self.tokens.len())
            .field("encoding", &self.encoding)
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .finish()
    }
}

/// `model.gguf` -> `model.vocab`
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("vocab")
}

/// `<0x0A>` -> `0x0A`
fn parse_byte_token(text: &str) -> Option<u8> {
    let hex = text.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Inverse of the GPT-2 byte-to-unicode table.
///
/// Printable Latin-1 bytes map to themselves; the remaining 68 bytes map to `U+0100` onwards in byte order.
pub fn byte_decoder() -> HashMap<char, u8> {
    let printable = |b: u8| matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
    let mut decoder = HashMap::with_capacity(256);
    let mut shifted = 0u32;
    for b in 0..=255u8 {
        let code = if printable(b) {
            b as u32
        } else {
            shifted += 1;
            255 + shifted
        };
        if let Some(ch) = char::from_u32(code) {
            decoder.insert(ch, b);
        }
    }
    decoder
}
