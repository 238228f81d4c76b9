use super::*;
use crate::error::ModelError;
use byteorder::{LittleEndian, WriteBytesExt};

/// Header prefix followed by raw, possibly malformed, metadata bytes.
fn raw_container(version: u32, tensor_count: u64, metadata_count: u64, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
    buf.write_u32::<LittleEndian>(version).unwrap();
    buf.write_u64::<LittleEndian>(tensor_count).unwrap();
    buf.write_u64::<LittleEndian>(metadata_count).unwrap();
    buf.extend_from_slice(body);
    buf
}

fn key(buf: &mut Vec<u8>, key: &str) {
    buf.write_u64::<LittleEndian>(key.len() as u64).unwrap();
    buf.extend_from_slice(key.as_bytes());
}

fn sample_writer() -> ContainerWriter {
    let mut writer = ContainerWriter::new();
    writer
        .set_metadata("general.architecture", MetadataValue::String("llama".into()))
        .set_metadata("llama.embedding_length", MetadataValue::U32(8))
        .set_metadata("llama.rope.freq_base", MetadataValue::F32(5000.0))
        .set_metadata("general.file_type", MetadataValue::U64(2))
        .set_metadata("tokenizer.ggml.tokens", MetadataValue::string_array(["a", "b", "c"]));
    writer.push_tensor("first", &[3], GgmlType::F32, &[1.0, 2.0, 3.0]).unwrap();
    writer.push_tensor("second", &[32, 2], GgmlType::Q8_0, &[0.5; 64]).unwrap();
    writer
}

#[test]
fn test_writer_output_parses_back() {
    let bytes = sample_writer().to_bytes().unwrap();
    let header = parse_header(&bytes).unwrap();

    assert_eq!(header.version, WRITE_VERSION);
    assert_eq!(header.metadata.get_str("general.architecture"), Some("llama"));
    assert_eq!(header.metadata.get_u64("llama.embedding_length"), Some(8));
    assert_eq!(header.metadata.get_f32("llama.rope.freq_base"), Some(5000.0));
    assert_eq!(header.metadata.get_u64("general.alignment"), Some(DEFAULT_ALIGNMENT));
    assert_eq!(header.metadata.get_strings("tokenizer.ggml.tokens").unwrap(), vec!["a", "b", "c"]);

    assert_eq!(header.tensors.len(), 2);
    let second = header.tensors.get("second").unwrap();
    assert_eq!(second.dims, vec![32, 2]);
    assert_eq!(second.ty, GgmlType::Q8_0);
    assert_eq!(second.byte_len(), Some(2 * Q8_0_BLOCK_BYTES as u64));
}

#[test]
fn test_tensor_offsets_are_absolute_and_aligned() {
    let bytes = sample_writer().to_bytes().unwrap();
    let header = parse_header(&bytes).unwrap();

    let first = header.tensors.get("first").unwrap();
    assert_eq!(first.offset % DEFAULT_ALIGNMENT, 0);
    assert!(first.offset >= header.header_len);

    let data = &bytes[first.offset as usize..first.offset as usize + 12];
    let values: Vec<f32> = data.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);

    let second = header.tensors.get("second").unwrap();
    assert_eq!(second.offset % DEFAULT_ALIGNMENT, 0);
    assert_eq!(header.tensors.next_offset_after(first.offset), Some(second.offset));
    assert_eq!(bytes.len() as u64, second.offset + second.byte_len().unwrap());
}

#[test]
fn test_bad_magic_is_rejected() {
    let mut bytes = sample_writer().to_bytes().unwrap();
    bytes[0] = b'X';
    assert!(matches!(parse_header(&bytes), Err(ModelError::BadMagic { .. })));
}

#[test]
fn test_old_version_is_rejected_before_counts() {
    // nothing after the version field
    let mut bytes = Vec::new();
    bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
    bytes.write_u32::<LittleEndian>(1).unwrap();
    assert!(matches!(
        parse_header(&bytes),
        Err(ModelError::UnsupportedVersion { found: 1, minimum: MIN_VERSION })
    ));
}

#[test]
fn test_unknown_value_type_is_format_error() {
    let mut body = Vec::new();
    key(&mut body, "mystery");
    body.write_u32::<LittleEndian>(13).unwrap();
    body.extend_from_slice(&[0; 16]);

    let bytes = raw_container(3, 0, 1, &body);
    match parse_header(&bytes) {
        Err(ModelError::Format { offset, reason }) => {
            assert_eq!(offset, 24 + 8 + "mystery".len() as u64);
            assert!(reason.contains("13"), "{reason}");
        }
        other => panic!("expected format error, got {other:?}"),
    }
}

#[test]
fn test_wide_scalar_tags_are_accepted() {
    let mut body = Vec::new();
    key(&mut body, "big");
    body.write_u32::<LittleEndian>(ValueType::U64.id()).unwrap();
    body.write_u64::<LittleEndian>(1 << 40).unwrap();
    key(&mut body, "signed");
    body.write_u32::<LittleEndian>(ValueType::I64.id()).unwrap();
    body.write_i64::<LittleEndian>(-5).unwrap();
    key(&mut body, "double");
    body.write_u32::<LittleEndian>(ValueType::F64.id()).unwrap();
    body.write_f64::<LittleEndian>(0.25).unwrap();

    let header = parse_header(&raw_container(2, 0, 3, &body)).unwrap();
    assert_eq!(header.metadata.get_u64("big"), Some(1 << 40));
    assert_eq!(header.metadata.get("signed").and_then(MetadataValue::as_i64), Some(-5));
    assert_eq!(header.metadata.get_u64("signed"), None);
    assert_eq!(header.metadata.get_f32("double"), Some(0.25));
}

#[test]
fn test_truncated_metadata_reports_offset() {
    let mut body = Vec::new();
    key(&mut body, "name");
    body.write_u32::<LittleEndian>(ValueType::String.id()).unwrap();
    body.write_u64::<LittleEndian>(100).unwrap();
    body.extend_from_slice(b"short");

    match parse_header(&raw_container(3, 0, 1, &body)) {
        Err(ModelError::Format { offset, .. }) => assert_eq!(offset, 24 + 8 + 4 + 4),
        other => panic!("expected format error, got {other:?}"),
    }
}

#[test]
fn test_absurd_counts_fail_fast() {
    let bytes = raw_container(3, 0, u64::MAX, &[]);
    assert!(matches!(parse_header(&bytes), Err(ModelError::Format { .. })));
}

#[test]
fn test_deeply_nested_arrays_are_rejected() {
    let mut body = Vec::new();
    key(&mut body, "nested");
    body.write_u32::<LittleEndian>(ValueType::Array.id()).unwrap();
    for _ in 0..10 {
        body.write_u32::<LittleEndian>(ValueType::Array.id()).unwrap();
        body.write_u64::<LittleEndian>(1).unwrap();
    }
    body.extend_from_slice(&[0; 64]);

    let err = parse_header(&raw_container(3, 0, 1, &body)).unwrap_err();
    assert!(err.to_string().contains("nested"), "{err}");
}

#[test]
fn test_overflowing_tensor_dims_are_format_error() {
    let mut body = Vec::new();
    key(&mut body, "token_embd.weight");
    body.write_u32::<LittleEndian>(2).unwrap();
    body.write_u64::<LittleEndian>(u64::MAX).unwrap();
    body.write_u64::<LittleEndian>(3).unwrap();
    body.write_u32::<LittleEndian>(GgmlType::F32.id()).unwrap();
    body.write_u64::<LittleEndian>(0).unwrap();

    match parse_header(&raw_container(3, 1, 0, &body)) {
        Err(ModelError::Format { offset, reason }) => {
            assert_eq!(offset, 24);
            assert!(reason.contains("dimensions overflow"), "{reason}");
        }
        other => panic!("expected format error, got {other:?}"),
    }
}

#[test]
fn test_element_count_saturates() {
    let descriptor = TensorDescriptor { name: "w".into(), dims: vec![u64::MAX, 3], ty: GgmlType::F32, offset: 0 };
    assert_eq!(descriptor.element_count(), u64::MAX);
    assert_eq!(descriptor.byte_len(), None);
}

#[test]
fn test_next_offset_after_last_possible_offset() {
    let mut directory = TensorDirectory::default();
    directory.insert(TensorDescriptor { name: "w".into(), dims: vec![4], ty: GgmlType::F32, offset: u64::MAX });

    assert_eq!(directory.next_offset_after(u64::MAX), None);
    assert_eq!(directory.next_offset_after(0), Some(u64::MAX));
}

#[test]
fn test_duplicate_tensor_names_overwrite() {
    let mut directory = TensorDirectory::default();
    directory.insert(TensorDescriptor { name: "w".into(), dims: vec![4], ty: GgmlType::F32, offset: 64 });
    directory.insert(TensorDescriptor { name: "x".into(), dims: vec![4], ty: GgmlType::F32, offset: 96 });
    directory.insert(TensorDescriptor { name: "w".into(), dims: vec![8], ty: GgmlType::F16, offset: 128 });

    assert_eq!(directory.len(), 2);
    let w = directory.get("w").unwrap();
    assert_eq!((w.dims.as_slice(), w.ty, w.offset), (&[8u64][..], GgmlType::F16, 128));
    assert_eq!(directory.next_offset_after(96), Some(128));
    assert_eq!(directory.next_offset_after(64), Some(96));
    assert_eq!(directory.next_offset_after(128), None);
}

#[test]
fn test_ggml_type_tags_and_sizes() {
    assert_eq!(GgmlType::from(8), GgmlType::Q8_0);
    assert_eq!(GgmlType::from(99), GgmlType::Other(99));
    assert_eq!(GgmlType::Q4_0.id(), 2);
    assert_eq!(GgmlType::Q4_0.byte_size(64), Some(36));
    assert_eq!(GgmlType::Q4_0.byte_size(33), Some(36));
    assert_eq!(GgmlType::F16.byte_size(3), Some(6));
    assert_eq!(GgmlType::Other(99).byte_size(3), None);
    assert_eq!(GgmlType::Other(99).to_string(), "type#99");
    assert_eq!("Q4_0".parse::<GgmlType>(), Ok(GgmlType::Q4_0));
    assert!("q5_k".parse::<GgmlType>().is_err());
}

#[test]
fn test_writer_rejects_wrong_value_count() {
    let mut writer = ContainerWriter::new();
    let err = writer.push_tensor("w", &[2, 2], GgmlType::F32, &[1.0; 3]).unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { .. }));
}

#[test]
fn test_streamed_tensor_length_is_checked() {
    let mut writer = ContainerWriter::new();
    writer.declare_tensor("w", &[4], GgmlType::F32);

    let mut out = Vec::new();
    let err = writer.write_with(&mut out, |_, _| Ok::<_, std::io::Error>(vec![0u8; 8])).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    let mut out = Vec::new();
    let written = writer.write_with(&mut out, |_, _| Ok::<_, std::io::Error>(vec![0u8; 16])).unwrap();
    assert_eq!(written, out.len() as u64);
    assert_eq!(parse_header(&out).unwrap().tensors.get("w").unwrap().dims, vec![4]);
}
