use super::*;
use ggrun_inference::quant::f32_to_f16;
use safetensors::{Dtype, tensor::TensorView};
use std::{fs, io::Write};
use tempfile::TempDir;

/// Writes `(name, dtype, shape, raw little-endian bytes)` tensors into one shard.
fn write_shard(path: &Path, tensors: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) {
    let views: Vec<(String, TensorView)> = tensors
        .iter()
        .map(|(name, dtype, shape, bytes)| (name.to_string(), TensorView::new(*dtype, shape.clone(), bytes).unwrap()))
        .collect();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_load_f32_tensor() {
    let dir = TempDir::new().unwrap();
    write_shard(
        &dir.path().join("model.safetensors"),
        &[("w", Dtype::F32, vec![2, 3], f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))],
    );

    let reader = TensorReader::new(dir.path()).unwrap();
    let tensor = reader.load_tensor("w").unwrap().unwrap();

    assert_eq!(tensor.shape, vec![2, 3]);
    assert_eq!(tensor.values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_load_half_precision_tensors() {
    let dir = TempDir::new().unwrap();
    let values = [0.5f32, -2.0, 1.0 / 3.0, 100.25];
    let f16: Vec<u8> = values.iter().flat_map(|&v| f32_to_f16(v).to_le_bytes()).collect();
    let bf16: Vec<u8> = values.iter().flat_map(|&v| ((v.to_bits() >> 16) as u16).to_le_bytes()).collect();
    write_shard(
        &dir.path().join("model.safetensors"),
        &[("half", Dtype::F16, vec![4], f16), ("brain", Dtype::BF16, vec![4], bf16)],
    );

    let reader = TensorReader::new(dir.path()).unwrap();
    let half = reader.load_tensor("half").unwrap().unwrap();
    let brain = reader.load_tensor("brain").unwrap().unwrap();

    for (i, &expected) in values.iter().enumerate() {
        assert!((half.values[i] - expected).abs() <= expected.abs() * 1e-3, "f16 {i}");
        assert!((brain.values[i] - expected).abs() <= expected.abs() * 1e-2, "bf16 {i}");
    }
    // bf16 truncation keeps exactly representable values exact
    assert_eq!(brain.values[0], 0.5);
    assert_eq!(brain.values[1], -2.0);
}

#[test]
fn test_tensors_across_shards() {
    let dir = TempDir::new().unwrap();
    write_shard(
        &dir.path().join("model-00001-of-00002.safetensors"),
        &[("a", Dtype::F32, vec![1], f32_bytes(&[1.0]))],
    );
    write_shard(
        &dir.path().join("model-00002-of-00002.safetensors"),
        &[("b", Dtype::F32, vec![1], f32_bytes(&[2.0]))],
    );
    fs::write(dir.path().join("config.json"), "{}").unwrap();

    let reader = TensorReader::new(dir.path()).unwrap();

    assert!(reader.contains("a"));
    assert!(reader.contains("b"));
    assert!(!reader.contains("c"));
    assert_eq!(reader.tensor_names().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(reader.load_tensor("b").unwrap().unwrap().values, vec![2.0]);
    assert_eq!(reader.load_tensor("c").unwrap(), None);
}

#[test]
fn test_unsupported_dtype() {
    let dir = TempDir::new().unwrap();
    write_shard(&dir.path().join("model.safetensors"), &[("ids", Dtype::I32, vec![2], vec![0u8; 8])]);

    let reader = TensorReader::new(dir.path()).unwrap();
    let error = reader.load_tensor("ids").unwrap_err();

    assert!(error.to_string().contains("Unsupported tensor dtype"));
}

#[test]
fn test_no_safetensors_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("model.bin"), b"not safetensors").unwrap();

    let error = TensorReader::new(dir.path()).unwrap_err();
    assert!(error.to_string().contains("No SafeTensors files found"));
}

#[test]
fn test_corrupt_shard() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("model.safetensors"), b"garbage").unwrap();

    let error = TensorReader::new(dir.path()).unwrap_err();
    assert!(error.to_string().contains("Failed to deserialize"));
}

#[test]
fn test_mmap_cache_evicts_least_recently_used() {
    let dir = TempDir::new().unwrap();
    let map = |name: &str| {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"bytes").unwrap();
        let file = File::open(&path).unwrap();
        (path, Arc::new(unsafe { Mmap::map(&file) }.unwrap()))
    };
    let (a, mmap_a) = map("a");
    let (b, mmap_b) = map("b");
    let (c, mmap_c) = map("c");

    let mut cache = MmapCache::new(2);
    cache.insert(a.clone(), mmap_a);
    cache.insert(b.clone(), mmap_b);
    assert!(cache.get(&a).is_some());

    cache.insert(c.clone(), mmap_c);

    assert_eq!(cache.cache.len(), 2);
    assert!(cache.get(&a).is_some());
    assert!(cache.get(&b).is_none());
    assert!(cache.get(&c).is_some());

    cache.clear();
    assert!(cache.get(&a).is_none());
    assert!(cache.access_order.is_empty());
}
