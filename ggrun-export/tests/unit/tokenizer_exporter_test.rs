use super::*;
use ggrun_inference::gguf::parse_header;
use serde_json::json;
use tempfile::TempDir;

fn write_json(dir: &TempDir, name: &str, value: &Value) {
    fs::write(dir.path().join(name), serde_json::to_string(value).unwrap()).unwrap();
}

fn gpt2_tokenizer() -> Value {
    json!({
        "model": {
            "type": "BPE",
            "vocab": { "Hello": 0, "Ġworld": 1, "!": 2 },
            "merges": ["H e", "Ġ w"]
        },
        "pre_tokenizer": { "type": "ByteLevel", "add_prefix_space": false },
        "decoder": { "type": "ByteLevel" },
        "added_tokens": [
            { "id": 5, "content": "<|endoftext|>", "special": true }
        ]
    })
}

#[test]
fn test_new_and_default() {
    assert_eq!(format!("{:?}", TokenizerExporter::new()), format!("{:?}", TokenizerExporter::default()));
}

#[test]
fn test_missing_tokenizer_is_not_an_error() {
    let dir = TempDir::new().unwrap();

    let data = TokenizerExporter::new().load_tokenizer(dir.path(), 8, Some(1), Some(2)).unwrap();
    assert_eq!(data, None);
}

#[test]
fn test_gpt2_tokenizer_with_padding() {
    let dir = TempDir::new().unwrap();
    write_json(&dir, "tokenizer.json", &gpt2_tokenizer());

    let data = TokenizerExporter::new().load_tokenizer(dir.path(), 8, None, Some(5)).unwrap().unwrap();

    assert_eq!(data.model, TokenizerModel::Gpt2);
    assert_eq!(
        data.tokens,
        vec!["Hello", "Ġworld", "!", "[PAD3]", "[PAD4]", "<|endoftext|>", "[PAD6]", "[PAD7]"]
    );
    assert_eq!(data.bos_token_id, None);
    assert_eq!(data.eos_token_id, Some(5));
}

#[test]
fn test_tokens_beyond_vocab_size_are_kept() {
    let dir = TempDir::new().unwrap();
    write_json(&dir, "tokenizer.json", &gpt2_tokenizer());

    let data = TokenizerExporter::new().load_tokenizer(dir.path(), 2, None, None).unwrap().unwrap();
    assert_eq!(data.tokens.len(), 6);
}

#[test]
fn test_special_tokens_from_config() {
    let dir = TempDir::new().unwrap();
    write_json(&dir, "tokenizer.json", &gpt2_tokenizer());
    write_json(
        &dir,
        "tokenizer_config.json",
        &json!({
            "bos_token": { "content": "<|im_start|>", "lstrip": false },
            "eos_token": "<|endoftext|>",
            "added_tokens_decoder": {
                "5": { "content": "<|endoftext|>", "special": true },
                "6": { "content": "<|im_start|>", "special": true }
            }
        }),
    );

    let data = TokenizerExporter::new().load_tokenizer(dir.path(), 7, None, None).unwrap().unwrap();

    assert_eq!(data.tokens[6], "<|im_start|>");
    assert_eq!(data.bos_token_id, Some(6));
    assert_eq!(data.eos_token_id, Some(5));
}

#[test]
fn test_config_ids_win_over_tokenizer_config() {
    let dir = TempDir::new().unwrap();
    write_json(&dir, "tokenizer.json", &gpt2_tokenizer());
    write_json(&dir, "tokenizer_config.json", &json!({ "eos_token": "<|endoftext|>" }));

    let data = TokenizerExporter::new().load_tokenizer(dir.path(), 6, Some(0), Some(2)).unwrap().unwrap();

    assert_eq!(data.bos_token_id, Some(0));
    assert_eq!(data.eos_token_id, Some(2));
}

#[test]
fn test_sentencepiece_detection() {
    let exporter = TokenizerExporter::new();
    let vocab: HashMap<String, u32> =
        [("<unk>", 0), ("<0x0A>", 1), ("\u{2581}the", 2)].into_iter().map(|(t, id)| (t.to_string(), id)).collect();

    let byte_fallback = json!({ "model": { "type": "BPE", "byte_fallback": true, "vocab": {} } });
    assert_eq!(exporter.detect_model(&byte_fallback, &HashMap::new()), TokenizerModel::Llama);

    let decoder = json!({ "model": {}, "decoder": { "type": "Sequence", "decoders": [{ "type": "ByteFallback" }] } });
    assert_eq!(exporter.detect_model(&decoder, &HashMap::new()), TokenizerModel::Llama);

    let plain = json!({ "model": {} });
    assert_eq!(exporter.detect_model(&plain, &vocab), TokenizerModel::Llama);
    assert_eq!(exporter.detect_model(&plain, &HashMap::new()), TokenizerModel::Gpt2);

    assert_eq!(exporter.detect_model(&gpt2_tokenizer(), &vocab), TokenizerModel::Gpt2);
}

#[test]
fn test_vocabulary_without_model_section() {
    let exporter = TokenizerExporter::new();

    let flat = json!({ "vocab": { "a": 0, "b": 1 } });
    assert_eq!(exporter.extract_vocabulary(&flat).unwrap().len(), 2);

    let error = exporter.extract_vocabulary(&json!({ "model": {} })).unwrap_err();
    assert!(error.to_string().contains("Could not find vocabulary"));
}

#[test]
fn test_invalid_tokenizer_json() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("tokenizer.json"), "{ not json").unwrap();

    let error = TokenizerExporter::new().load_tokenizer(dir.path(), 4, None, None).unwrap_err();
    assert!(error.to_string().contains("Failed to parse JSON"));
}

#[test]
fn test_write_metadata() {
    let data = TokenizerData {
        tokens: vec!["<s>".into(), "\u{2581}hi".into()],
        model: TokenizerModel::Llama,
        bos_token_id: Some(0),
        eos_token_id: None,
    };

    let mut writer = ContainerWriter::new();
    data.write_metadata(&mut writer);
    let header = parse_header(&writer.to_bytes().unwrap()).unwrap();

    assert_eq!(header.metadata.get_str("tokenizer.ggml.model"), Some("llama"));
    assert_eq!(
        header.metadata.get_strings("tokenizer.ggml.tokens"),
        Some(vec!["<s>".to_string(), "\u{2581}hi".to_string()])
    );
    assert_eq!(header.metadata.get_u64("tokenizer.ggml.bos_token_id"), Some(0));
    assert_eq!(header.metadata.get_u64("tokenizer.ggml.eos_token_id"), None);
}
