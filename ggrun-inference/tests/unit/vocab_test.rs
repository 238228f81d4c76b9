use super::*;
use crate::gguf::MetadataValue;
use std::io::Write;

fn metadata_with_tokens(model: &str, tokens: &[&str]) -> Metadata {
    let mut metadata = Metadata::default();
    metadata.insert(TOKENS_KEY, MetadataValue::string_array(tokens.iter().copied()));
    metadata.insert(MODEL_KEY, MetadataValue::String(model.to_string()));
    metadata
}

#[test]
fn test_byte_decoder_covers_every_byte() {
    let decoder = byte_decoder();
    assert_eq!(decoder.len(), 256);
    assert_eq!(decoder[&'A'], b'A');
    assert_eq!(decoder[&'\u{0120}'], b' ');
    assert_eq!(decoder[&'\u{010A}'], b'\n');
    assert_eq!(decoder[&'\u{0100}'], 0);
}

#[test]
fn test_gpt2_tokens_decode_to_bytes() {
    let vocab = Vocabulary::load(&metadata_with_tokens("gpt2", &["Hello", "\u{0120}world", "\u{010A}"]), None);
    assert_eq!(vocab.encoding(), TokenEncoding::ByteLevel);
    assert_eq!(vocab.decode(0), "Hello");
    assert_eq!(vocab.decode(1), " world");
    assert_eq!(vocab.decode(2), "\n");
    assert_eq!(vocab.decode_all(&[0, 1, 2]), "Hello world\n");
}

#[test]
fn test_gpt2_multibyte_character_across_tokens() {
    // 'é' is 0xC3 0xA9; byte-level maps 0xC3 -> 'Ã', 0xA9 -> '©'
    let vocab = Vocabulary::load(&metadata_with_tokens("gpt2", &["\u{00C3}", "\u{00A9}"]), None);
    assert_eq!(vocab.decode_all(&[0, 1]), "é");
    assert_eq!(vocab.decode(0), "\u{FFFD}");
}

#[test]
fn test_sentencepiece_tokens() {
    let vocab = Vocabulary::load(&metadata_with_tokens("llama", &["\u{2581}the", "<0x0A>", "<0xZZ>"]), None);
    assert_eq!(vocab.decode(0), " the");
    assert_eq!(vocab.decode(1), "\n");
    assert_eq!(vocab.decode(2), "<0xZZ>");
}

#[test]
fn test_unknown_ids_use_placeholder() {
    let vocab = Vocabulary::empty();
    assert!(vocab.is_empty());
    assert_eq!(vocab.decode(42), "<token_42>");

    let vocab = Vocabulary::load(&metadata_with_tokens("unknown", &["x"]), None);
    assert_eq!(vocab.encoding(), TokenEncoding::Plain);
    assert_eq!(vocab.decode(1), "<token_1>");
}

#[test]
fn test_special_ids_are_reported() {
    let mut metadata = metadata_with_tokens("gpt2", &["<s>", "</s>"]);
    metadata.insert(BOS_KEY, MetadataValue::U32(0));
    metadata.insert(EOS_KEY, MetadataValue::U32(1));
    let vocab = Vocabulary::load(&metadata, None);
    assert_eq!(vocab.bos_id(), Some(0));
    assert_eq!(vocab.eos_id(), Some(1));
}

#[test]
fn test_sidecar_is_used_without_metadata_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("model.gguf");
    let mut sidecar = std::fs::File::create(dir.path().join("model.vocab")).unwrap();
    writeln!(sidecar, "alpha\nbeta\ngamma").unwrap();

    let vocab = Vocabulary::load(&Metadata::default(), Some(&model_path));
    assert_eq!(vocab.len(), 3);
    assert_eq!(vocab.decode(1), "beta");
    assert_eq!(sidecar_path(&model_path), dir.path().join("model.vocab"));
}

#[test]
fn test_metadata_tokens_win_over_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("model.gguf");
    std::fs::write(sidecar_path(&model_path), "sidecar\n").unwrap();

    let vocab = Vocabulary::load(&metadata_with_tokens("gpt2", &["meta"]), Some(&model_path));
    assert_eq!(vocab.token(0), Some("meta"));
}
