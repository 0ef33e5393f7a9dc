//! Custom extensions: schema validation of user tags, precedence over
//! built-ins, and converter block access through the context.

use std::sync::Arc;

use asdf::{
    AsdfError, AsdfFile, AsdfValue, ConversionResult, Converter, Extension, ExtensionEntry,
    NativeObject, OpenOptions, SerializationContext, TagDefinition, TypeRef, WriteOptions,
};
use asdf_schema::InMemoryResourceProvider;
use indexmap::IndexMap;

const FOO_TAG: &str = "tag:example.com/foo-1.0.0";
const FOO_SCHEMA_URI: &str = "asdf://example.com/schemas/foo-1.0.0";
const FOO_EXTENSION_URI: &str = "asdf://example.com/extensions/foo-1.0.0";

const FOO_SCHEMA: &str = r#"
$schema: "http://json-schema.org/draft-04/schema"
id: "asdf://example.com/schemas/foo-1.0.0"
type: object
properties:
  value:
    type: string
required: [value]
"#;

/// A native type whose schema requires a string value.
#[derive(Debug, Clone)]
struct Foo {
    value: AsdfValue,
}

struct FooConverter;

impl Converter for FooConverter {
    fn tags(&self) -> Vec<String> {
        vec![FOO_TAG.to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<Foo>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<AsdfValue> {
        let foo = obj.downcast_ref::<Foo>().expect("registered for Foo");
        let mut node = IndexMap::new();
        node.insert("value".to_string(), foo.value.clone());
        Ok(AsdfValue::Mapping(node))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<ConversionResult> {
        let value = node.get("value").cloned().unwrap_or(AsdfValue::Null);
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(Foo { value }))))
    }
}

struct FooExtension;

impl Extension for FooExtension {
    fn extension_uri(&self) -> &str {
        FOO_EXTENSION_URI
    }

    fn tags(&self) -> Vec<TagDefinition> {
        vec![TagDefinition::new(FOO_TAG)
            .unwrap()
            .with_schema_uris(vec![FOO_SCHEMA_URI.to_string()])]
    }

    fn converters(&self) -> Vec<Arc<dyn Converter>> {
        vec![Arc::new(FooConverter)]
    }
}

fn foo_file(value: AsdfValue) -> AsdfFile {
    let mut provider = InMemoryResourceProvider::new();
    provider.insert(FOO_SCHEMA_URI, FOO_SCHEMA.as_bytes().to_vec());
    let mut file = AsdfFile::with_extensions_and_resources(
        vec![ExtensionEntry::from_package(Arc::new(FooExtension), "foo-ext", "1.0")],
        vec![Arc::new(provider)],
    )
    .unwrap();
    file.insert("foo", AsdfValue::Object(NativeObject::new(Foo { value })));
    file
}

#[test]
fn test_schema_violation_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.asdf");

    let mut file = foo_file(AsdfValue::Int(12));
    let err = file.write_to(&path, WriteOptions::default()).unwrap_err();
    match err {
        AsdfError::SchemaViolation { path: tree_path, message } => {
            assert!(tree_path.contains("foo"), "{}", tree_path);
            assert!(message.contains("12 is not of type 'string'"), "{}", message);
        }
        other => panic!("expected SchemaViolation, got {:?}", other),
    }
    assert!(!path.exists(), "target file must not be created on failure");
}

#[test]
fn test_custom_tag_round_trip_and_history() {
    let mut file = foo_file(AsdfValue::String("hello".to_string()));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("!<tag:example.com/foo-1.0.0>"), "{}", text);
    assert!(text.contains(FOO_EXTENSION_URI), "extension use recorded in history");

    // Reading the file back requires the extension again.
    let mut provider = InMemoryResourceProvider::new();
    provider.insert(FOO_SCHEMA_URI, FOO_SCHEMA.as_bytes().to_vec());
    let read_back = AsdfFile::open_with(
        Box::new(asdf_io::MemoryFile::from_bytes(bytes)),
        OpenOptions::default(),
        vec![ExtensionEntry::from_package(Arc::new(FooExtension), "foo-ext", "1.0")],
        vec![Arc::new(provider)],
    )
    .unwrap();
    let foo = read_back.get("foo").unwrap().downcast_ref::<Foo>().unwrap();
    assert_eq!(foo.value.as_str(), Some("hello"));
}

#[test]
fn test_missing_extension_is_a_warning_by_default() {
    let mut file = foo_file(AsdfValue::String("ok".to_string()));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let plain = AsdfFile::open_bytes(bytes, OpenOptions::default()).unwrap();
    let kinds: Vec<_> = plain.diagnostics().entries().iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&asdf::ErrorKind::MissingExtension), "{:?}", kinds);
    // The foo node survives as raw tagged data, tag preserved.
    let raw = plain.get("foo").unwrap().downcast_ref::<asdf::RawTagged>().unwrap();
    assert_eq!(raw.tag, FOO_TAG);
    assert_eq!(raw.value.get("value").and_then(|v| v.as_str()), Some("ok"));

    // Rewriting keeps the tag even without the extension enabled.
    let mut plain = plain;
    let bytes_again = plain.write_to_bytes(WriteOptions::default()).unwrap();
    let text = String::from_utf8_lossy(&bytes_again);
    assert!(text.contains("!<tag:example.com/foo-1.0.0>"), "{}", text);
}

#[test]
fn test_strict_extension_check_escalates() {
    let mut file = foo_file(AsdfValue::String("ok".to_string()));
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    let result = asdf::config_context(|| {
        asdf::update_config(|c| c.strict_extension_check = true);
        AsdfFile::open_bytes(bytes, OpenOptions::default())
    });
    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(matches!(
        err,
        AsdfError::MissingExtension { .. } | AsdfError::UnknownTag { .. }
    ));
}

#[test]
fn test_incompatible_options_rejected() {
    let result = asdf::config_context(|| {
        asdf::update_config(|c| {
            c.strict_extension_check = true;
            c.ignore_missing_extensions = true;
        });
        AsdfFile::open_bytes(b"#ASDF 1.0.0\n".to_vec(), OpenOptions::default())
    });
    assert!(result.is_err());
}

// ---------------------------------------------------------------------
// Extension precedence

/// A user converter that claims the core ndarray tag and replaces every
/// array with a marker string on read.
struct HijackingConverter;

impl Converter for HijackingConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/ndarray-1.0.0".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        Vec::new()
    }

    fn to_yaml_tree(
        &self,
        _obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<AsdfValue> {
        unreachable!("never serializes")
    }

    fn from_yaml_tree(
        &self,
        _node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<ConversionResult> {
        Ok(ConversionResult::Complete(AsdfValue::String("hijacked".to_string())))
    }
}

struct HijackingExtension;

impl Extension for HijackingExtension {
    fn extension_uri(&self) -> &str {
        "asdf://example.com/extensions/hijack-1.0.0"
    }

    fn converters(&self) -> Vec<Arc<dyn Converter>> {
        vec![Arc::new(HijackingConverter)]
    }
}

#[test]
fn test_user_extension_takes_precedence_over_builtin() {
    let file = AsdfFile::with_extensions(vec![ExtensionEntry::new(Arc::new(HijackingExtension))])
        .unwrap();
    let entry = file
        .extensions()
        .converter_for_tag("tag:stsci.edu:asdf/core/ndarray-1.0.0")
        .unwrap();
    assert_eq!(entry.extension_uri, "asdf://example.com/extensions/hijack-1.0.0");
}

// ---------------------------------------------------------------------
// Converter block access

/// A payload-bearing type stored through the context block API rather
/// than as an ndarray.
#[derive(Debug)]
struct BlobData {
    payload: Vec<u8>,
}

const BLOB_TAG: &str = "tag:example.com/blob-1.0.0";

struct BlobConverter;

impl Converter for BlobConverter {
    fn tags(&self) -> Vec<String> {
        vec![BLOB_TAG.to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<BlobData>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<AsdfValue> {
        let blob = obj.downcast_arc::<BlobData>().expect("registered for BlobData");
        let payload = blob.payload.clone();
        let index = ctx.find_available_block_index(Arc::new(move || payload.clone()), None)?;
        let mut node = IndexMap::new();
        node.insert("block_index".to_string(), AsdfValue::Int(index as i64));
        Ok(AsdfValue::Mapping(node))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> asdf::Result<ConversionResult> {
        let index = match node.get("block_index") {
            Some(AsdfValue::Int(i)) => *i as usize,
            _ => return Err(AsdfError::Value("blob node has no block_index".to_string())),
        };
        let callback = ctx.get_block_data_callback(index, None)?;
        let payload = callback()?.as_slice().to_vec();
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(BlobData {
            payload,
        }))))
    }
}

struct BlobExtension;

impl Extension for BlobExtension {
    fn extension_uri(&self) -> &str {
        "asdf://example.com/extensions/blob-1.0.0"
    }

    fn tags(&self) -> Vec<TagDefinition> {
        vec![TagDefinition::new(BLOB_TAG).unwrap()]
    }

    fn converters(&self) -> Vec<Arc<dyn Converter>> {
        vec![Arc::new(BlobConverter)]
    }
}

#[test]
fn test_converter_block_access_round_trip() {
    let mut file =
        AsdfFile::with_extensions(vec![ExtensionEntry::new(Arc::new(BlobExtension))]).unwrap();
    file.insert(
        "blob",
        AsdfValue::Object(NativeObject::new(BlobData {
            payload: vec![7u8; 64],
        })),
    );
    let bytes = file.write_to_bytes(WriteOptions::default()).unwrap();

    // One block was reserved through the context.
    let magics: Vec<usize> = (0..bytes.len() - 3)
        .filter(|&i| &bytes[i..i + 4] == b"\xd3BLK")
        .collect();
    assert_eq!(magics.len(), 1);

    // Writing twice reuses the same block: the block is keyed to the
    // object, not re-reserved per write.
    let bytes_again = file.write_to_bytes(WriteOptions::default()).unwrap();
    let magics_again: Vec<usize> = (0..bytes_again.len() - 3)
        .filter(|&i| &bytes_again[i..i + 4] == b"\xd3BLK")
        .collect();
    assert_eq!(magics_again.len(), 1);
}
