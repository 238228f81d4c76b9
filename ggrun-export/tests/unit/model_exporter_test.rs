use super::*;
use crate::models::ArchitectureId;
use ggrun_inference::gguf::parse_header;
use safetensors::{Dtype, tensor::TensorView};
use tempfile::TempDir;

fn create_test_config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        hidden_dim: 16,
        n_layers: 1,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 16,
        max_seq_len: 64,
        head_dim: 4,
        norm_eps: 1e-5,
        rope_theta: 10000.0,
        bos_token_id: Some(1),
        eos_token_id: Some(2),
        tie_word_embeddings: false,
        name: Some("tiny".to_string()),
        architecture: ArchitectureId::LlamaForCausalLM,
    }
}

/// Checkpoint tensors of [`create_test_config`], each filled with `index * 0.01`.
fn checkpoint_tensors(with_lm_head: bool) -> Vec<(String, Vec<usize>)> {
    let mut tensors = vec![
        ("model.embed_tokens.weight".to_string(), vec![16, 8]),
        ("model.norm.weight".to_string(), vec![8]),
    ];
    for (component, shape) in [
        ("input_layernorm.weight", vec![8]),
        ("post_attention_layernorm.weight", vec![8]),
        ("self_attn.q_proj.weight", vec![8, 8]),
        ("self_attn.k_proj.weight", vec![4, 8]),
        ("self_attn.v_proj.weight", vec![4, 8]),
        ("self_attn.o_proj.weight", vec![8, 8]),
        ("mlp.gate_proj.weight", vec![16, 8]),
        ("mlp.up_proj.weight", vec![16, 8]),
        ("mlp.down_proj.weight", vec![8, 16]),
    ] {
        tensors.push((format!("model.layers.0.{component}"), shape));
    }
    if with_lm_head {
        tensors.push(("lm_head.weight".to_string(), vec![16, 8]));
    }
    tensors
}

fn write_checkpoint(dir: &Path, tensors: &[(String, Vec<usize>)]) {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, shape)| {
            let count: usize = shape.iter().product();
            (0..count).flat_map(|i| (i as f32 * 0.01).to_le_bytes()).collect()
        })
        .collect();
    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .zip(&bytes)
        .map(|((name, shape), data)| (name.clone(), TensorView::new(Dtype::F32, shape.clone(), data).unwrap()))
        .collect();
    safetensors::serialize_to_file(views, &None, &dir.join("model.safetensors")).unwrap();
}

#[test]
fn test_transpose() {
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    assert_eq!(transpose(&values, 2, 3), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert_eq!(transpose(&transpose(&values, 2, 3), 3, 2), values.to_vec());
    assert!(transpose(&[], 0, 0).is_empty());
}

#[test]
fn test_quantize_f32_is_exact() {
    let values = [0.0, 1.5, -2.25];
    let quantized = quantize(GgmlType::F32, &values).unwrap();

    assert_eq!(quantized.data.len(), 12);
    assert_eq!(quantized.max_error, 0.0);
}

#[test]
fn test_quantize_q8_error_bound() {
    let values: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 0.1).collect();
    let quantized = quantize(GgmlType::Q8_0, &values).unwrap();

    assert_eq!(quantized.data.len(), 2 * 34);
    // half a step of the largest block scale, plus f16 scale rounding
    let step = 3.2 / 127.0;
    assert!(quantized.max_error > 0.0);
    assert!(quantized.max_error <= step * 0.5 * 1.01);
}

#[test]
fn test_quantize_q4_coarser_than_q8() {
    let values: Vec<f32> = (0..96).map(|i| ((i * 37) % 23) as f32 * 0.05 - 0.5).collect();

    let q4 = quantize(GgmlType::Q4_0, &values).unwrap();
    let q8 = quantize(GgmlType::Q8_0, &values).unwrap();

    assert_eq!(q4.data.len(), 3 * 18);
    assert!(q4.max_error > q8.max_error);
}

#[test]
fn test_quantize_zero_weights() {
    let quantized = quantize(GgmlType::Q8_0, &[0.0; 32]).unwrap();

    assert_eq!(quantized.max_error, 0.0);
    assert!(quantized.data.iter().all(|&b| b == 0));
}

#[test]
fn test_quantize_without_encoder() {
    assert!(quantize(GgmlType::Q4_1, &[1.0; 32]).is_err());
}

#[test]
fn test_new_validates_type_and_shape() {
    assert!(GgufModelExporter::new(create_test_config(), GgmlType::Q8_1).is_err());
    assert_eq!(GgufModelExporter::new(create_test_config(), GgmlType::F16).unwrap().weight_type(), GgmlType::F16);

    let wide_heads = ModelConfig { head_dim: 8, ..create_test_config() };
    let error = GgufModelExporter::new(wide_heads, GgmlType::Q4_0).unwrap_err();
    assert!(error.to_string().contains("Unsupported attention shape"));

    let bad_groups = ModelConfig { n_kv_heads: 3, ..create_test_config() };
    assert!(GgufModelExporter::new(bad_groups, GgmlType::Q4_0).is_err());
}

#[test]
fn test_plan_order_and_head_selection() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), &checkpoint_tensors(true));
    let reader = TensorReader::new(dir.path()).unwrap();
    let config = create_test_config();
    let architecture = create_architecture(&config);

    let exporter = GgufModelExporter::new(config.clone(), GgmlType::Q4_0).unwrap();
    let plan = exporter.plan(architecture.as_ref(), &reader).unwrap();
    let targets: Vec<&str> = plan.iter().map(|m| m.target.as_str()).collect();

    assert_eq!(
        targets,
        vec![
            "token_embd.weight",
            "blk.0.attn_norm.weight",
            "blk.0.attn_q.weight",
            "blk.0.attn_k.weight",
            "blk.0.attn_v.weight",
            "blk.0.attn_output.weight",
            "blk.0.ffn_norm.weight",
            "blk.0.ffn_gate.weight",
            "blk.0.ffn_up.weight",
            "blk.0.ffn_down.weight",
            "output_norm.weight",
            "output.weight",
        ]
    );
    assert_eq!(plan.last().unwrap().source, "lm_head.weight");

    let tied = GgufModelExporter::new(ModelConfig { tie_word_embeddings: true, ..config }, GgmlType::Q4_0).unwrap();
    let plan = tied.plan(architecture.as_ref(), &reader).unwrap();
    assert_eq!(plan.last().unwrap().source, "model.embed_tokens.weight");
}

#[test]
fn test_plan_ties_head_when_lm_head_absent() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), &checkpoint_tensors(false));
    let reader = TensorReader::new(dir.path()).unwrap();
    let config = create_test_config();

    let exporter = GgufModelExporter::new(config.clone(), GgmlType::F32).unwrap();
    let plan = exporter.plan(create_architecture(&config).as_ref(), &reader).unwrap();

    let head = plan.last().unwrap();
    assert_eq!(head.source, "model.embed_tokens.weight");
    assert_eq!(head.kind, TensorKind::Linear { in_features: 8, out_features: 16 });
}

#[test]
fn test_plan_missing_tensors() {
    let dir = TempDir::new().unwrap();
    let tensors: Vec<_> = checkpoint_tensors(true)
        .into_iter()
        .filter(|(name, _)| name != "model.norm.weight" && name != "model.layers.0.mlp.up_proj.weight")
        .collect();
    write_checkpoint(dir.path(), &tensors);
    let reader = TensorReader::new(dir.path()).unwrap();
    let config = create_test_config();

    let exporter = GgufModelExporter::new(config.clone(), GgmlType::F32).unwrap();
    let error = exporter.plan(create_architecture(&config).as_ref(), &reader).unwrap_err();

    assert_eq!(error.to_string(), "Missing weight tensor: model.layers.0.mlp.up_proj.weight");
}

#[test]
fn test_convert_transposes_linear_weights() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), &checkpoint_tensors(true));
    let reader = TensorReader::new(dir.path()).unwrap();
    let exporter = GgufModelExporter::new(create_test_config(), GgmlType::F32).unwrap();

    let k_proj = TensorMapping::new(
        "model.layers.0.self_attn.k_proj.weight",
        "blk.0.attn_k.weight",
        TensorKind::Linear { in_features: 8, out_features: 4 },
        true,
    );
    let converted = exporter.convert(&k_proj, &reader).unwrap();

    // checkpoint (out=1, in=0) holds 8 * 0.01 and lands at row 0, column 1
    assert!((converted[1] - 0.08).abs() < 1e-6);
    // checkpoint (out=0, in=1) lands at row 1, column 0
    assert!((converted[4] - 0.01).abs() < 1e-6);

    let wrong = TensorMapping { kind: TensorKind::Linear { in_features: 4, out_features: 8 }, ..k_proj };
    let error = exporter.convert(&wrong, &reader).unwrap_err();
    assert!(error.to_string().contains("has shape [4, 8], expected [8, 4]"));
}

#[test]
fn test_export_writes_loadable_container() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), &checkpoint_tensors(false));
    let output = dir.path().join("tiny.gguf");

    let exporter = GgufModelExporter::new(create_test_config(), GgmlType::Q8_0).unwrap();
    let report = exporter.export(dir.path(), &output, None).unwrap();

    assert_eq!(report.tensors, 12);
    assert_eq!(report.bytes, fs::metadata(&output).unwrap().len());
    assert!(report.max_error < 0.01);

    let header = parse_header(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(header.metadata.get_str("general.architecture"), Some("llama"));
    assert_eq!(header.metadata.get_str("general.name"), Some("tiny"));
    assert_eq!(header.metadata.get_u64("llama.embedding_length"), Some(8));
    assert_eq!(header.metadata.get_u64("llama.attention.head_count_kv"), Some(1));
    assert_eq!(header.metadata.get_u64("llama.context_length"), Some(64));
    assert_eq!(header.metadata.get_u64("general.file_type"), Some(8));

    let q = header.tensors.get("blk.0.attn_k.weight").unwrap();
    assert_eq!(q.dims, vec![4, 8]);
    assert_eq!(q.ty, GgmlType::Q8_0);
    let norm = header.tensors.get("output_norm.weight").unwrap();
    assert_eq!(norm.ty, GgmlType::F32);
    assert_eq!(header.tensors.get("token_embd.weight").unwrap().dims, vec![8, 16]);
    assert_eq!(header.tensors.get("output.weight").unwrap().dims, vec![16, 8]);
}

#[test]
fn test_failed_export_removes_output() {
    let dir = TempDir::new().unwrap();
    let mut tensors = checkpoint_tensors(true);
    // lm_head with the wrong shape fails while streaming, after the file was created
    tensors.last_mut().unwrap().1 = vec![8, 16];
    write_checkpoint(dir.path(), &tensors);
    let output = dir.path().join("broken.gguf");

    let exporter = GgufModelExporter::new(create_test_config(), GgmlType::F32).unwrap();
    assert!(exporter.export(dir.path(), &output, None).is_err());
    assert!(!output.exists());
}
