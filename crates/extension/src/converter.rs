//! The converter trait: custom tag ↔ native object mapping.

use std::any::TypeId;

use asdf_core::{AsdfError, AsdfValue, NativeObject, Result};

use crate::context::SerializationContext;

/// Reference to a native type a converter handles.
///
/// `Deferred` entries carry a fully-qualified type name and are lifted to
/// `Resolved` the first time a lookup sees a live value of that type, so
/// extensions can register converters for types their crate does not
/// define.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// A type known at registration time.
    Resolved(TypeId),
    /// A fully-qualified type name resolved lazily.
    Deferred(String),
}

impl TypeRef {
    /// Reference to a concrete type.
    pub fn of<T: 'static>() -> Self {
        TypeRef::Resolved(TypeId::of::<T>())
    }

    /// Reference by fully-qualified type name.
    pub fn by_name(name: impl Into<String>) -> Self {
        TypeRef::Deferred(name.into())
    }
}

/// Result of deserializing one tagged node.
pub enum ConversionResult {
    /// A finished native value.
    Complete(AsdfValue),
    /// Two-phase construction for self-referential objects: the
    /// placeholder is installed in the parent immediately and `finalize`
    /// runs once every descendant has resolved.
    Deferred {
        /// The value installed in the parent right away.
        placeholder: AsdfValue,
        /// Invoked after the whole tree has been converted.
        finalize: FinalizeFn,
    },
}

/// Deferred wiring step for two-phase construction.
pub type FinalizeFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Bidirectional mapper between a native object and its tagged YAML form.
///
/// `to_yaml_tree` produces a basic value (mapping, sequence or scalar)
/// which may still contain nested native objects; the codec converts those
/// recursively and applies the selected tag. `from_yaml_tree` receives a
/// value whose descendants have already been converted, so nested custom
/// objects arrive as native objects.
pub trait Converter: Send + Sync {
    /// Tag URIs (or trailing-`*` patterns) this converter handles.
    fn tags(&self) -> Vec<String>;

    /// Native types this converter serializes.
    fn types(&self) -> Vec<TypeRef>;

    /// Choose the tag to write for `obj` from this converter's concrete
    /// tags in the active registry.
    fn select_tag(
        &self,
        _obj: &NativeObject,
        tags: &[String],
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<String> {
        tags.first().cloned().ok_or_else(|| {
            AsdfError::Value("converter has no concrete tags to select from".to_string())
        })
    }

    /// Convert a native object into a basic value.
    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue>;

    /// Reconstruct a native value from a converted node.
    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        tag: &str,
        ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult>;
}
