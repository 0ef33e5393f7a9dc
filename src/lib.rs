//! # ASDF
//!
//! A reader and writer for the Advanced Scientific Data Format: a hybrid
//! container holding a human-readable, schema-validated YAML metadata
//! tree followed by tagged binary blocks in the same file.
//!
//! # Quick Start
//!
//! ```no_run
//! use asdf::{AsdfFile, NdArray, OpenOptions, WriteOptions};
//!
//! fn main() -> asdf::Result<()> {
//!     let mut file = AsdfFile::new()?;
//!     file.insert("x", asdf::AsdfValue::Object(
//!         asdf::NativeObject::new(NdArray::from_f64(&[0.0, 1.0, 2.0, 3.0])),
//!     ));
//!     file.write_to("data.asdf", WriteOptions::default())?;
//!
//!     let read_back = AsdfFile::open("data.asdf", OpenOptions::default())?;
//!     let array = read_back.get("x").unwrap().downcast_ref::<NdArray>().unwrap();
//!     assert_eq!(array.to_f64_vec()?, vec![0.0, 1.0, 2.0, 3.0]);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! [`AsdfFile`] is the main entry point; it orchestrates the tree codec
//! (YAML ↔ tagged tree ↔ native objects), the schema engine (draft-04
//! validation with custom keywords) and the block manager (lazy,
//! optionally memory-mapped binary payloads with MD5 checksums and
//! in-place update). Custom types plug in through
//! [`asdf_extension::Extension`] bundles of converters, validators and
//! compressors.

pub mod builtin;
pub mod emitter;
pub mod entities;
pub mod file;
pub mod ndarray;
pub mod reference;
pub mod treecodec;

pub use asdf_core::{
    config_context, get_config, set_global_config, update_config, AsdfConfig, AsdfError, AsdfValue,
    BlockStorage, ByteOrder, Diagnostic, Diagnostics, ErrorKind, NativeObject, Pointer, Result,
    TaggedNode,
};
pub use asdf_extension::{
    ConversionResult, Converter, Extension, ExtensionEntry, ExtensionRegistry, ManifestExtension,
    SerializationContext, TagDefinition, TypeRef, Validator,
};
pub use asdf_blocks::{BlockKey, Compressor};
pub use entities::{Complex, Constant, ExtensionMetadata, HistoryEntry, Software};
pub use file::{AsdfFile, OpenOptions, WriteOptions};
pub use ndarray::{Datatype, Mask, NdArray, ScalarKind, Stream};
pub use reference::Reference;
pub use treecodec::RawTagged;
