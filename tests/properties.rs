//! Property-based invariants: round-trip fidelity, checksum correctness,
//! streamed block uniqueness.

use asdf::{AsdfFile, AsdfValue, NativeObject, NdArray, OpenOptions, WriteOptions};
use proptest::prelude::*;

/// Structural equality with NaN-tolerant floats; native objects are
/// compared by type only (scenario tests cover their payloads).
fn values_equal(a: &AsdfValue, b: &AsdfValue) -> bool {
    match (a, b) {
        (AsdfValue::Null, AsdfValue::Null) => true,
        (AsdfValue::Bool(x), AsdfValue::Bool(y)) => x == y,
        (AsdfValue::Int(x), AsdfValue::Int(y)) => x == y,
        (AsdfValue::UInt(x), AsdfValue::UInt(y)) => x == y,
        (AsdfValue::Int(x), AsdfValue::UInt(y)) | (AsdfValue::UInt(y), AsdfValue::Int(x)) => {
            u64::try_from(*x).map(|x| x == *y).unwrap_or(false)
        }
        (AsdfValue::Float(x), AsdfValue::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        (AsdfValue::String(x), AsdfValue::String(y)) => x == y,
        (AsdfValue::Sequence(x), AsdfValue::Sequence(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (AsdfValue::Mapping(x), AsdfValue::Mapping(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        (AsdfValue::Object(x), AsdfValue::Object(y)) => x.type_name() == y.type_name(),
        _ => false,
    }
}

fn value_strategy() -> impl Strategy<Value = AsdfValue> {
    let leaf = prop_oneof![
        Just(AsdfValue::Null),
        any::<bool>().prop_map(AsdfValue::Bool),
        any::<i64>().prop_map(AsdfValue::Int),
        any::<f64>().prop_map(AsdfValue::Float),
        "[ -~]{0,24}".prop_map(AsdfValue::String),
    ];
    leaf.prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(AsdfValue::Sequence),
            prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", inner, 0..6)
                .prop_map(|m| AsdfValue::Mapping(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tree_round_trip(value in value_strategy()) {
        let mut file = AsdfFile::new().unwrap();
        file.insert("payload", value.clone());
        let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();
        let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
        let round_tripped = read_back.get("payload").unwrap();
        prop_assert!(
            values_equal(&value, round_tripped),
            "mismatch: {:?} vs {:?}",
            value,
            round_tripped
        );
    }

    #[test]
    fn prop_array_round_trip(values in prop::collection::vec(any::<f64>(), 1..64)) {
        let mut file = AsdfFile::new().unwrap();
        file.insert(
            "data",
            AsdfValue::Object(NativeObject::new(NdArray::from_f64(&values))),
        );
        let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();
        let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
        let array = read_back.get("data").unwrap().downcast_ref::<NdArray>().unwrap();
        let decoded = array.to_f64_vec().unwrap();
        prop_assert_eq!(decoded.len(), values.len());
        for (a, b) in decoded.iter().zip(&values) {
            prop_assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn prop_every_block_checksum_is_md5(payload in prop::collection::vec(any::<u8>(), 1..256)) {
        let mut file = AsdfFile::new().unwrap();
        let array = NdArray::from_bytes(
            asdf::Datatype::Scalar(asdf::ScalarKind::UInt8),
            vec![payload.len() as u64],
            asdf::ByteOrder::Big,
            payload,
        )
        .unwrap();
        file.insert("raw", AsdfValue::Object(NativeObject::new(array)));
        let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

        let offset = (0..bytes.len() - 3)
            .find(|&i| &bytes[i..i + 4] == b"\xd3BLK")
            .expect("one block present");
        let header_len = u16::from_be_bytes([bytes[offset + 4], bytes[offset + 5]]) as usize;
        let header =
            asdf_blocks::BlockHeader::from_bytes(&bytes[offset + 6..offset + 6 + header_len]).unwrap();
        let data_start = offset + 6 + header_len;
        let stored = &bytes[data_start..data_start + header.used_size as usize];
        prop_assert_eq!(header.checksum, md5::compute(stored).0);
    }
}

#[test]
fn test_streamed_block_must_be_last_on_read() {
    // Hand-assemble a file whose index trailer exposes a streamed block
    // followed by an internal block; a scan could never see this, but a
    // trailer can claim it.
    let mut bytes = b"#ASDF 1.0.0\n#ASDF_STANDARD 1.5.0\n--- {}\n...\n".to_vec();

    let streamed = asdf_blocks::BlockHeader {
        flags: 1,
        compression: [0; 4],
        allocated_size: 0,
        used_size: 0,
        data_size: 0,
        checksum: [0; 16],
    };
    let offset_streamed = bytes.len() as u64;
    bytes.extend_from_slice(b"\xd3BLK");
    bytes.extend_from_slice(&48u16.to_be_bytes());
    bytes.extend_from_slice(&streamed.to_bytes());

    let payload = [9u8; 4];
    let internal = asdf_blocks::BlockHeader {
        flags: 0,
        compression: [0; 4],
        allocated_size: 4,
        used_size: 4,
        data_size: 4,
        checksum: md5::compute(payload).0,
    };
    let offset_internal = bytes.len() as u64;
    bytes.extend_from_slice(b"\xd3BLK");
    bytes.extend_from_slice(&48u16.to_be_bytes());
    bytes.extend_from_slice(&internal.to_bytes());
    bytes.extend_from_slice(&payload);

    bytes.extend_from_slice(
        format!(
            "#ASDF BLOCK INDEX\n%YAML 1.1\n--- [{}, {}]\n...\n",
            offset_streamed, offset_internal
        )
        .as_bytes(),
    );

    let err = match AsdfFile::open_bytes(bytes, OpenOptions::default()) {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(matches!(
        err,
        asdf::AsdfError::MultipleStreamedBlocks { .. } | asdf::AsdfError::BlockMalformed { .. }
    ));
}

#[test]
fn test_pad_blocks_aligns_allocations() {
    let mut file = AsdfFile::new().unwrap();
    file.insert(
        "x",
        AsdfValue::Object(NativeObject::new(NdArray::from_f64(&[1.0, 2.0, 3.0]))),
    );
    let options = WriteOptions {
        pad_blocks: Some(true),
        ..WriteOptions::default()
    };
    let bytes = file.write_to_bytes(options).unwrap();

    let offset = (0..bytes.len() - 3)
        .find(|&i| &bytes[i..i + 4] == b"\xd3BLK")
        .unwrap();
    let header = asdf_blocks::BlockHeader::from_bytes(&bytes[offset + 6..offset + 54]).unwrap();
    assert!(header.allocated_size > header.used_size);

    // Padding must be readable: the file still opens and the data is
    // intact.
    let read_back = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let array = read_back.get("x").unwrap().downcast_ref::<NdArray>().unwrap();
    assert_eq!(array.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_reference_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("target.asdf");

    let mut target = AsdfFile::new().unwrap();
    target.insert("answer", AsdfValue::Int(42));
    target.write_to(&target_path, WriteOptions::default()).unwrap();

    let main_path = dir.path().join("main.asdf");
    let mut main = AsdfFile::new().unwrap();
    main.insert(
        "remote",
        AsdfValue::Object(NativeObject::new(asdf::Reference::new("target.asdf#/answer"))),
    );
    main.write_to(&main_path, WriteOptions::default()).unwrap();

    let mut read_back = AsdfFile::open(&main_path, OpenOptions::default()).unwrap();
    // Unresolved references survive the round trip...
    assert!(read_back.get("remote").unwrap().downcast_ref::<asdf::Reference>().is_some());
    // ...until resolution substitutes the target node.
    read_back.resolve_references().unwrap();
    assert!(matches!(read_back.get("remote"), Some(AsdfValue::Int(42))));
}

#[test]
fn test_local_reference_resolution() {
    let mut file = AsdfFile::new().unwrap();
    file.insert("value", AsdfValue::Int(7));
    file.insert(
        "alias",
        AsdfValue::Object(NativeObject::new(asdf::Reference::local(&["value"]))),
    );
    file.resolve_references().unwrap();
    assert!(matches!(file.get("alias"), Some(AsdfValue::Int(7))));
}
