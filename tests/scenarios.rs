//! End-to-end scenarios over the full open/write/update paths.

use asdf::{
    AsdfFile, AsdfValue, Mask, NativeObject, NdArray, OpenOptions, WriteOptions,
};

const BLOCK_MAGIC: &[u8] = b"\xd3BLK";

fn magic_offsets(bytes: &[u8]) -> Vec<usize> {
    (0..bytes.len().saturating_sub(3))
        .filter(|&i| &bytes[i..i + 4] == BLOCK_MAGIC)
        .collect()
}

fn insert_array(file: &mut AsdfFile, key: &str, array: NdArray) {
    file.insert(key, AsdfValue::Object(NativeObject::new(array)));
}

fn block_header_at(bytes: &[u8], offset: usize) -> asdf_blocks::BlockHeader {
    let header_len = u16::from_be_bytes([bytes[offset + 4], bytes[offset + 5]]) as usize;
    asdf_blocks::BlockHeader::from_bytes(&bytes[offset + 6..offset + 6 + header_len]).unwrap()
}

#[test]
fn test_simple_array_round_trip() {
    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "x", NdArray::from_f64(&[0.0, 1.0, 2.0, 3.0]));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    assert!(bytes.starts_with(b"#ASDF "));
    let magics = magic_offsets(&bytes);
    assert_eq!(magics.len(), 1, "expected exactly one block magic");
    let header = block_header_at(&bytes, magics[0]);
    assert_eq!(header.used_size, 32);

    let text = String::from_utf8_lossy(&bytes[..magics[0]]);
    assert!(text.contains("datatype: float64"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let array = read_back.get("x").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(array.to_f64_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_inline_threshold() {
    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "x", NdArray::from_f64(&[0.0, 1.0, 2.0, 3.0]));
    let options = WriteOptions {
        array_inline_threshold: Some(8),
        ..WriteOptions::default()
    };
    let bytes = file.write_to_bytes(options).unwrap();

    assert!(magic_offsets(&bytes).is_empty(), "expected zero blocks");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("[0.0, 1.0, 2.0, 3.0]"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let array = read_back.get("x").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(array.to_f64_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_view_sharing() {
    let mut file = AsdfFile::new().unwrap();
    let a = NdArray::from_i32(&[10, 20, 30, 40]);
    let b = a.view(1, vec![2]).unwrap();
    insert_array(&mut file, "a", a);
    insert_array(&mut file, "b", b);
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let magics = magic_offsets(&bytes);
    assert_eq!(magics.len(), 1, "views over one buffer share one block");
    let header = block_header_at(&bytes, magics[0]);
    assert_eq!(header.used_size, 16);

    let text = String::from_utf8_lossy(&bytes[..magics[0]]);
    assert!(text.contains("offset: 4"), "{}", text);
    assert!(text.contains("shape: [2]"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let a = read_back.get("a").unwrap().downcast_ref::<NdArray>().unwrap();
    let b = read_back.get("b").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(a.to_i64_vec().unwrap(), vec![10, 20, 30, 40]);
    assert_eq!(b.to_i64_vec().unwrap(), vec![20, 30]);
    assert_eq!(a.data_identity(), b.data_identity(), "read-back views share bytes");
}

#[test]
fn test_masked_array_with_nan_sentinel() {
    let mut file = AsdfFile::new().unwrap();
    let array = NdArray::from_f64(&[1.0, 2.0, 3.0, f64::NAN]).with_mask(Mask::Scalar(f64::NAN));
    insert_array(&mut file, "m", array);
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let magics = magic_offsets(&bytes);
    assert_eq!(magics.len(), 1, "one data block");
    let text = String::from_utf8_lossy(&bytes[..magics[0]]);
    assert!(text.contains("mask: .NaN"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let array = read_back.get("m").unwrap().downcast_ref::<NdArray>().unwrap();
    let flags = array.mask_flags().unwrap().unwrap();
    assert_eq!(flags, vec![false, false, false, true]);
}

#[test]
fn test_update_without_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three.asdf");

    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "a", NdArray::from_i32(&[1, 1, 1, 1]));
    insert_array(&mut file, "b", NdArray::from_i32(&[2, 2, 2, 2]));
    insert_array(&mut file, "c", NdArray::from_i32(&[3, 3, 3, 3]));
    file.write_to(&path, WriteOptions::default()).unwrap();

    let before = std::fs::read(&path).unwrap();
    let offsets_before = magic_offsets(&before);
    // The index trailer also mentions no magic, so exactly the 3 blocks.
    assert_eq!(offsets_before.len(), 3);
    let checksums_before: Vec<_> = offsets_before
        .iter()
        .map(|&o| block_header_at(&before, o).checksum)
        .collect();

    // Mutate only the middle array, same size.
    let mut open = AsdfFile::open(&path, OpenOptions {
        read_write: true,
        ..OpenOptions::default()
    })
    .unwrap();
    insert_array(&mut open, "b", NdArray::from_i32(&[9, 9, 9, 9]));
    open.update(WriteOptions::default()).unwrap();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before.len(), after.len(), "file length unchanged");
    let offsets_after = magic_offsets(&after);
    assert_eq!(offsets_before, offsets_after, "block offsets unchanged");

    let checksums_after: Vec<_> = offsets_after
        .iter()
        .map(|&o| block_header_at(&after, o).checksum)
        .collect();
    assert_eq!(checksums_before[0], checksums_after[0]);
    assert_eq!(checksums_before[2], checksums_after[2]);
    assert_ne!(checksums_before[1], checksums_after[1], "middle checksum updated");

    let read_back = AsdfFile::open(&path, OpenOptions::default()).unwrap();
    let b = read_back.get("b").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(b.to_i64_vec().unwrap(), vec![9, 9, 9, 9]);
    let a = read_back.get("a").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(a.to_i64_vec().unwrap(), vec![1, 1, 1, 1]);
}

#[test]
fn test_update_grows_file_when_needed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.asdf");

    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "a", NdArray::from_i32(&[1, 2, 3, 4]));
    file.write_to(&path, WriteOptions::default()).unwrap();

    let mut open = AsdfFile::open(&path, OpenOptions {
        read_write: true,
        ..OpenOptions::default()
    })
    .unwrap();
    let bigger: Vec<i32> = (0..1000).collect();
    insert_array(&mut open, "b", NdArray::from_i32(&bigger));
    open.update(WriteOptions::default()).unwrap();

    let read_back = AsdfFile::open(&path, OpenOptions::default()).unwrap();
    let a = read_back.get("a").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(a.to_i64_vec().unwrap(), vec![1, 2, 3, 4]);
    let b = read_back.get("b").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(b.element_count(), 1000);
}

#[test]
fn test_checksums_stored_and_verified() {
    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "x", NdArray::from_f64(&[5.0, 6.0]));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let magics = magic_offsets(&bytes);
    let header = block_header_at(&bytes, magics[0]);
    let data_start = magics[0] + 6 + 48;
    let payload = &bytes[data_start..data_start + header.used_size as usize];
    assert_eq!(header.checksum, md5::compute(payload).0, "stored checksum is MD5 of used bytes");

    // Opening with verification enabled succeeds on a clean file...
    let options = OpenOptions {
        validate_checksums: true,
        ..OpenOptions::default()
    };
    AsdfFile::open_bytes(bytes.clone(), options.clone()).unwrap();

    // ...and fails when a payload byte is corrupted.
    let mut corrupted = bytes;
    corrupted[data_start] ^= 0xFF;
    let err = match AsdfFile::open_bytes(corrupted, options) {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert_eq!(err.kind(), asdf::ErrorKind::ChecksumMismatch);
}

#[test]
fn test_history_and_library_metadata() {
    let mut file = AsdfFile::new().unwrap();
    insert_array(&mut file, "x", NdArray::from_f64(&[1.0]));
    file.add_history_entry("initial import", Some(asdf::Software::new("pipeline", "2.1")));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("asdf_library"), "{}", text);
    assert!(text.contains("extension_class"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let entries = read_back.history_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].description, "initial import");
    assert_eq!(entries[0].software[0].name, "pipeline");
}

#[test]
fn test_streamed_block_write_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.asdf");

    let mut file = AsdfFile::new().unwrap();
    file.insert(
        "s",
        AsdfValue::Object(NativeObject::new(asdf::Stream::new(
            vec![2],
            asdf::Datatype::Scalar(asdf::ScalarKind::Float64),
        ))),
    );
    file.write_to(&path, WriteOptions::default()).unwrap();

    // Append three rows of two float64s.
    let mut row_bytes = Vec::new();
    for v in [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0] {
        if cfg!(target_endian = "big") {
            row_bytes.extend_from_slice(&v.to_bits().to_be_bytes());
        } else {
            row_bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }
    file.write_to_stream(&row_bytes).unwrap();
    drop(file);

    let read_back = AsdfFile::open(&path, OpenOptions::default()).unwrap();
    let array = read_back.get("s").unwrap().downcast_ref::<NdArray>().unwrap();
    assert!(array.is_streamed());
    assert_eq!(array.shape(), &[3, 2]);
    assert_eq!(
        array.to_f64_vec().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn test_inline_string_array() {
    let mut file = AsdfFile::new().unwrap();
    let array = asdf::ndarray::converter::inline_from_items(
        &[
            AsdfValue::String("ab".to_string()),
            AsdfValue::String("cdef".to_string()),
        ],
        None,
        None,
    )
    .unwrap();
    insert_array(&mut file, "names", array);
    let options = WriteOptions {
        array_inline_threshold: Some(10),
        ..WriteOptions::default()
    };
    let bytes = file.write_to_bytes(options).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("[ab, cdef]"), "{}", text);

    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let array = read_back.get("names").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(array.dtype(), &asdf::Datatype::Ucs4(4));
}
