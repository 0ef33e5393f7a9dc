//! The native tree: what callers get back after tag resolution.
//!
//! Plain YAML scalars and containers stay as themselves; custom-tagged
//! nodes become [`NativeObject`]s produced by converters. A `NativeObject`
//! is a shared, type-erased handle; converters downcast it back to the
//! concrete type they registered for.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// A value in the native tree.
#[derive(Debug, Clone)]
pub enum AsdfValue {
    /// Null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Unsigned integer scalar that does not fit in `i64`.
    UInt(u64),
    /// Floating point scalar.
    Float(f64),
    /// String scalar.
    String(String),
    /// Ordered sequence.
    Sequence(Vec<AsdfValue>),
    /// Insertion-ordered mapping with string keys.
    Mapping(IndexMap<String, AsdfValue>),
    /// A converter-produced object (array, time stamp, frame, ...).
    Object(NativeObject),
}

impl AsdfValue {
    /// Mapping entries, if this value is a mapping.
    pub fn as_mapping(&self) -> Option<&IndexMap<String, AsdfValue>> {
        match self {
            AsdfValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable mapping entries, if this value is a mapping.
    pub fn as_mapping_mut(&mut self) -> Option<&mut IndexMap<String, AsdfValue>> {
        match self {
            AsdfValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Sequence items, if this value is a sequence.
    pub fn as_sequence(&self) -> Option<&[AsdfValue]> {
        match self {
            AsdfValue::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// String value, if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AsdfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The wrapped native object, if any.
    pub fn as_object(&self) -> Option<&NativeObject> {
        match self {
            AsdfValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Downcast a wrapped native object to a concrete type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.as_object().and_then(|o| o.downcast_ref::<T>())
    }

    /// Look up a key in a mapping value.
    pub fn get(&self, key: &str) -> Option<&AsdfValue> {
        self.as_mapping().and_then(|m| m.get(key))
    }

    /// Visit this value and all descendants depth-first.
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(&AsdfValue),
    {
        visit(self);
        match self {
            AsdfValue::Mapping(m) => {
                for child in m.values() {
                    child.walk(visit);
                }
            }
            AsdfValue::Sequence(s) => {
                for child in s {
                    child.walk(visit);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for AsdfValue {
    fn from(b: bool) -> Self {
        AsdfValue::Bool(b)
    }
}

impl From<i64> for AsdfValue {
    fn from(i: i64) -> Self {
        AsdfValue::Int(i)
    }
}

impl From<f64> for AsdfValue {
    fn from(f: f64) -> Self {
        AsdfValue::Float(f)
    }
}

impl From<&str> for AsdfValue {
    fn from(s: &str) -> Self {
        AsdfValue::String(s.to_string())
    }
}

impl From<String> for AsdfValue {
    fn from(s: String) -> Self {
        AsdfValue::String(s)
    }
}

impl From<NativeObject> for AsdfValue {
    fn from(o: NativeObject) -> Self {
        AsdfValue::Object(o)
    }
}

/// A shared, type-erased native object.
///
/// Two handles are identical (not merely equal) when they share the same
/// allocation; identity is what block deduplication keys on.
#[derive(Clone)]
pub struct NativeObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl NativeObject {
    /// Wrap a concrete value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        NativeObject {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap an already shared value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        NativeObject {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The `TypeId` of the wrapped concrete type.
    pub fn concrete_type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }

    /// The fully-qualified name of the wrapped concrete type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the wrapped value as `T`.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Share the wrapped value as `Arc<T>`.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    /// An identity token for this allocation, stable for its lifetime.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// `true` if both handles share one allocation.
    pub fn same_object(&self, other: &NativeObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} at {:#x}>", self.type_name, self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_downcast_round_trip() {
        let obj = NativeObject::new(Marker(7));
        assert_eq!(obj.downcast_ref::<Marker>(), Some(&Marker(7)));
        assert!(obj.downcast_ref::<String>().is_none());
        assert_eq!(obj.concrete_type_id(), TypeId::of::<Marker>());
    }

    #[test]
    fn test_identity_tracks_allocation() {
        let obj = NativeObject::new(Marker(1));
        let alias = obj.clone();
        let other = NativeObject::new(Marker(1));
        assert!(obj.same_object(&alias));
        assert!(!obj.same_object(&other));
        assert_eq!(obj.identity(), alias.identity());
    }

    #[test]
    fn test_walk_visits_nested() {
        let mut m = IndexMap::new();
        m.insert(
            "xs".to_string(),
            AsdfValue::Sequence(vec![AsdfValue::Int(1), AsdfValue::Int(2)]),
        );
        let value = AsdfValue::Mapping(m);
        let mut count = 0;
        value.walk(&mut |_| count += 1);
        assert_eq!(count, 4);
    }
}
