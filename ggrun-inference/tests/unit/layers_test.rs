use super::*;
use crate::configuration::inverse_frequencies;
use crate::matmul::ScalarKernel;

fn grouped_config(dim: usize, n_heads: usize, n_kv_heads: usize) -> ModelConfig {
    let head_dim = dim / n_heads;
    ModelConfig {
        architecture: "llama".into(),
        name: None,
        dim,
        hidden_dim: 2 * dim,
        n_layers: 1,
        n_heads,
        n_kv_heads,
        head_dim,
        vocab_size: 4,
        context_length: None,
        rope_freq_base: 10000.0,
        norm_eps: 1e-5,
        layout: AttentionLayout::Grouped,
        inv_freq: inverse_frequencies(head_dim, 10000.0),
    }
}

fn identity_linear(n: usize) -> Linear {
    let mut weight = vec![0.0; n * n];
    (0..n).for_each(|i| weight[i * n + i] = 1.0);
    Linear::new(weight, n, n)
}

#[test]
fn test_softmax_sums_to_one() {
    let mut x = vec![1.0, 2.0, 3.0, -50.0, 1000.0];
    softmax(&mut x);
    assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    assert!(x.iter().all(|&p| p >= 0.0));
    assert!(x[4] > 0.99);
}

#[test]
fn test_layer_norm_without_params_standardizes() {
    let norm = LayerNorm::identity(1e-5);
    let input = [1.0, 2.0, 3.0, 4.0];
    let mut out = [0.0; 4];
    norm.forward(&mut out, &input);

    let mean = out.iter().sum::<f32>() / 4.0;
    let var = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
    assert!(mean.abs() < 1e-6);
    assert!((var - 1.0).abs() < 1e-3);
}

#[test]
fn test_layer_norm_gain_and_bias() {
    let norm = LayerNorm::new(Some(vec![2.0; 2]), Some(vec![0.5, -0.5]), 0.0);
    let mut out = [0.0; 2];
    norm.forward(&mut out, &[1.0, 3.0]);
    assert_eq!(out, [-1.5, 1.5]);
}

#[test]
fn test_rope_changes_direction_not_norm() {
    let rope = RoPE::new(inverse_frequencies(4, 10000.0));
    let base = [0.3, -1.2, 0.7, 0.4];
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();

    let mut at_p = base;
    let mut at_next = base;
    rope.apply(&mut at_p, 5);
    rope.apply(&mut at_next, 6);

    assert_ne!(at_p, at_next);
    assert!((norm(&at_p) - norm(&base)).abs() < 1e-5);
    assert!((norm(&at_next) - norm(&base)).abs() < 1e-5);

    let mut at_zero = base;
    rope.apply(&mut at_zero, 0);
    assert_eq!(at_zero, base);
}

#[test]
fn test_token_embedding_rows() {
    let embedding = TokenEmbedding::new((0..6).map(|v| v as f32).collect(), 2);
    let mut out = [0.0; 2];
    assert_eq!(embedding.vocab_size(), 3);
    assert!(embedding.forward(2, &mut out));
    assert_eq!(out, [4.0, 5.0]);
    assert!(!embedding.forward(3, &mut out));
}

#[test]
fn test_byte_embedding() {
    let mut out = [9.0; 4];
    byte_embedding("\u{0}\u{ff}", &mut out);
    assert_eq!(out[0], 0.0);
    // U+00FF is two UTF-8 bytes: 0xC3 0xBF
    assert!((out[1] - (0xC3 as f32 / 255.0 + 0.01 * 0.25)).abs() < 1e-6);
    assert!((out[2] - (0xBF as f32 / 255.0 + 0.01 * 0.5)).abs() < 1e-6);
    assert_eq!(out[3], 0.0);
}

#[test]
fn test_attention_first_position_returns_value() {
    // with a single cached position the softmax weight is 1, so the head output is v
    let config = grouped_config(4, 2, 1);
    let attention = MultiHeadAttention::new(
        LayerNorm::identity(1e-5),
        identity_linear(4),
        Linear::new(vec![1.0; 8], 4, 2),
        Linear::new(vec![0.5; 8], 4, 2),
        identity_linear(4),
        &config,
    );
    let mut state = RunState::new(&config, 3);
    let mut cache = KvCache::for_model(&config, 3);
    state.x.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

    attention.forward(0, &mut state, &mut cache, &ScalarKernel);

    // v = 0.5 * sum(x) = 5 for both components; both query heads share kv head 0
    assert_eq!(state.x, vec![6.0, 7.0, 8.0, 9.0]);
    assert_eq!(cache.values(0, 0), &[5.0, 5.0]);
}

#[test]
fn test_query_heads_share_contiguous_kv_heads() {
    // 4 query heads over 2 kv heads: heads 0-1 read kv head 0, heads 2-3 read kv head 1
    let config = grouped_config(8, 4, 2);
    let column_sums = [1.0, 2.0, 3.0, 4.0];
    let wv: Vec<f32> = (0..8 * 4).map(|i| column_sums[i % 4] / 8.0).collect();
    let attention = MultiHeadAttention::new(
        LayerNorm::identity(1e-5),
        identity_linear(8),
        Linear::new(vec![0.0; 8 * 4], 8, 4),
        Linear::new(wv, 8, 4),
        identity_linear(8),
        &config,
    );
    let mut state = RunState::new(&config, 2);
    let mut cache = KvCache::for_model(&config, 2);
    state.x.fill(1.0);

    attention.forward(0, &mut state, &mut cache, &ScalarKernel);

    assert_eq!(cache.values(0, 0), &[1.0, 2.0]);
    assert_eq!(cache.values(0, 1), &[3.0, 4.0]);
    assert_eq!(state.x, vec![2.0, 3.0, 2.0, 3.0, 4.0, 5.0, 4.0, 5.0]);
}

#[test]
fn test_attention_uses_raw_input_for_keys_and_values() {
    let config = grouped_config(2, 1, 1);
    let mut norm = LayerNorm::identity(1e-5);
    norm.bias = Some(vec![100.0, 100.0]);
    let attention = MultiHeadAttention::new(
        norm,
        identity_linear(2),
        identity_linear(2),
        identity_linear(2),
        identity_linear(2),
        &config,
    );
    let mut state = RunState::new(&config, 1);
    let mut cache = KvCache::for_model(&config, 1);
    state.x.copy_from_slice(&[1.0, 3.0]);

    attention.forward(0, &mut state, &mut cache, &ScalarKernel);

    // values are cached unrotated from raw x
    assert_eq!(cache.values(0, 0), &[1.0, 3.0]);
    assert_eq!(state.x, vec![2.0, 6.0]);
}

#[test]
fn test_feed_forward_gated_activation() {
    let config = grouped_config(2, 1, 1);
    let feed_forward = FeedForward::new(
        LayerNorm::new(None, Some(vec![1.0, 1.0]), 1e-5),
        Linear::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 2, 4),
        Linear::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 2, 4),
        Linear::new(vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 4, 2),
    );
    let mut state = RunState::new(&config, 1);
    // constant input normalizes to zero, so the norm output is the bias
    state.x.copy_from_slice(&[0.5, 0.5]);

    feed_forward.forward(&mut state, &ScalarKernel);

    // up = gate = 1 + 1 = 2 in hidden 0; silu-gated = 2 * 2 * sigmoid(2)
    let expected = 4.0 * (1.0f32 + (-2.0f32).exp()).recip();
    assert!((state.x[0] - (0.5 + expected)).abs() < 1e-5);
    assert!((state.x[1] - (0.5 + expected)).abs() < 1e-5);
}

#[test]
fn test_q4_head_matches_dense_head() {
    let (dim, vocab) = (8, 8);
    let weight: Vec<f32> = (0..dim * vocab).map(|i| ((i % 9) as f32 - 4.0) * 0.25).collect();
    let raw = crate::quant::quantize_q4_0(&weight);
    let mut dequantized = vec![0.0; weight.len()];
    crate::quant::dequantize_q4_0(&raw, &mut dequantized);

    let dense = OutputHead::Dense(Linear::new(dequantized, dim, vocab));
    let quantized = OutputHead::Q4 { raw: Arc::from(raw), in_features: dim, out_features: vocab };
    assert!(quantized.is_quantized());

    let input: Vec<f32> = (0..dim).map(|i| i as f32 * 0.1 - 0.3).collect();
    let mut a = vec![0.0; vocab];
    let mut b = vec![0.0; vocab];
    dense.forward(&ScalarKernel, &mut a, &input);
    quantized.forward(&ScalarKernel, &mut b, &input);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-5);
    }
}
