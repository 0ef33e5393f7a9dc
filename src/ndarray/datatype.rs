//! The ndarray datatype model and its YAML representation.
//!
//! Scalar names follow the ASDF Standard (`int8` .. `float64`,
//! `complex64`/`complex128`, `bool8`), strings are `['ascii', N]` /
//! `['ucs4', N]`, and structured records are ordered sequences of
//! `{name, datatype, byteorder?, shape?}` entries.

use asdf_core::{AsdfError, ByteOrder, NodeValue, Result, TaggedNode};

/// A primitive element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ScalarKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Bool8,
}

impl ScalarKind {
    /// The ASDF name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::Int8 => "int8",
            ScalarKind::Int16 => "int16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::UInt8 => "uint8",
            ScalarKind::UInt16 => "uint16",
            ScalarKind::UInt32 => "uint32",
            ScalarKind::UInt64 => "uint64",
            ScalarKind::Float32 => "float32",
            ScalarKind::Float64 => "float64",
            ScalarKind::Complex64 => "complex64",
            ScalarKind::Complex128 => "complex128",
            ScalarKind::Bool8 => "bool8",
        }
    }

    /// Parse an ASDF scalar name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int8" => ScalarKind::Int8,
            "int16" => ScalarKind::Int16,
            "int32" => ScalarKind::Int32,
            "int64" => ScalarKind::Int64,
            "uint8" => ScalarKind::UInt8,
            "uint16" => ScalarKind::UInt16,
            "uint32" => ScalarKind::UInt32,
            "uint64" => ScalarKind::UInt64,
            "float32" => ScalarKind::Float32,
            "float64" => ScalarKind::Float64,
            "complex64" => ScalarKind::Complex64,
            "complex128" => ScalarKind::Complex128,
            "bool8" => ScalarKind::Bool8,
            _ => return None,
        })
    }

    /// Element size in bytes.
    pub fn itemsize(&self) -> u64 {
        match self {
            ScalarKind::Int8 | ScalarKind::UInt8 | ScalarKind::Bool8 => 1,
            ScalarKind::Int16 | ScalarKind::UInt16 => 2,
            ScalarKind::Int32 | ScalarKind::UInt32 | ScalarKind::Float32 => 4,
            ScalarKind::Int64
            | ScalarKind::UInt64
            | ScalarKind::Float64
            | ScalarKind::Complex64 => 8,
            ScalarKind::Complex128 => 16,
        }
    }

    fn int_width(&self) -> Option<(bool, u8)> {
        // (signed, bits)
        Some(match self {
            ScalarKind::Int8 => (true, 8),
            ScalarKind::Int16 => (true, 16),
            ScalarKind::Int32 => (true, 32),
            ScalarKind::Int64 => (true, 64),
            ScalarKind::UInt8 => (false, 8),
            ScalarKind::UInt16 => (false, 16),
            ScalarKind::UInt32 => (false, 32),
            ScalarKind::UInt64 => (false, 64),
            _ => return None,
        })
    }

    /// Safe-cast compatibility: numeric widening is allowed, narrowing and
    /// float → int are not.
    pub fn can_cast_safe(from: ScalarKind, to: ScalarKind) -> bool {
        use ScalarKind::*;
        if from == to {
            return true;
        }
        // Booleans widen to everything numeric; nothing narrows to bool.
        if from == Bool8 {
            return true;
        }
        if to == Bool8 {
            return false;
        }
        match (from.int_width(), to.int_width()) {
            (Some((false, fw)), Some((false, tw))) => tw >= fw,
            (Some((true, fw)), Some((true, tw))) => tw >= fw,
            (Some((false, fw)), Some((true, tw))) => tw > fw,
            (Some((true, _)), Some((false, _))) => false,
            (Some((signed, fw)), None) => {
                // Integer to float/complex: the mantissa must hold every
                // value exactly.
                let magnitude_bits = if signed { fw - 1 } else { fw };
                match to {
                    Float32 | Complex64 => magnitude_bits <= 24,
                    Float64 | Complex128 => magnitude_bits <= 53,
                    _ => false,
                }
            }
            (None, Some(_)) => false,
            (None, None) => matches!(
                (from, to),
                (Float32, Float64)
                    | (Float32, Complex64)
                    | (Float32, Complex128)
                    | (Float64, Complex128)
                    | (Complex64, Complex128)
            ),
        }
    }
}

/// One column of a structured record datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Column element type.
    pub datatype: Datatype,
    /// Per-column byte order override.
    pub byteorder: Option<ByteOrder>,
    /// Per-element subarray shape.
    pub shape: Option<Vec<u64>>,
}

/// An ndarray element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Datatype {
    /// Primitive scalar.
    Scalar(ScalarKind),
    /// Fixed-length byte string, `['ascii', N]`.
    Ascii(u64),
    /// Fixed-length UCS-4 string, `['ucs4', N]`.
    Ucs4(u64),
    /// Structured record with named columns.
    Record(Vec<Field>),
}

impl Datatype {
    /// Element size in bytes.
    pub fn itemsize(&self) -> u64 {
        match self {
            Datatype::Scalar(kind) => kind.itemsize(),
            Datatype::Ascii(n) => *n,
            Datatype::Ucs4(n) => 4 * n,
            Datatype::Record(fields) => fields
                .iter()
                .map(|f| {
                    let count: u64 = f.shape.as_deref().map(|s| s.iter().product()).unwrap_or(1);
                    f.datatype.itemsize() * count
                })
                .sum(),
        }
    }

    /// `true` for structured record datatypes.
    pub fn is_record(&self) -> bool {
        matches!(self, Datatype::Record(_))
    }

    /// The YAML node representing this datatype.
    pub fn to_node(&self) -> TaggedNode {
        match self {
            Datatype::Scalar(kind) => TaggedNode::string(kind.name()),
            Datatype::Ascii(n) => TaggedNode::sequence(vec![
                TaggedNode::string("ascii"),
                TaggedNode::int(*n as i64),
            ]),
            Datatype::Ucs4(n) => TaggedNode::sequence(vec![
                TaggedNode::string("ucs4"),
                TaggedNode::int(*n as i64),
            ]),
            Datatype::Record(fields) => TaggedNode::sequence(
                fields
                    .iter()
                    .map(|field| {
                        let mut entry = indexmap::IndexMap::new();
                        entry.insert("name".to_string(), TaggedNode::string(&field.name));
                        entry.insert("datatype".to_string(), field.datatype.to_node());
                        if let Some(byteorder) = field.byteorder {
                            entry.insert(
                                "byteorder".to_string(),
                                TaggedNode::string(byteorder.to_string()),
                            );
                        }
                        if let Some(shape) = &field.shape {
                            entry.insert(
                                "shape".to_string(),
                                TaggedNode::sequence(
                                    shape.iter().map(|&d| TaggedNode::int(d as i64)).collect(),
                                ),
                            );
                        }
                        TaggedNode::mapping(entry)
                    })
                    .collect(),
            ),
        }
    }

    /// Parse the YAML representation of a datatype.
    pub fn from_node(node: &TaggedNode) -> Result<Self> {
        match &node.value {
            NodeValue::String(name) => ScalarKind::from_name(name)
                .map(Datatype::Scalar)
                .ok_or_else(|| AsdfError::Value(format!("unknown datatype '{}'", name))),
            NodeValue::Sequence(items) => {
                // ['ascii', N] / ['ucs4', N], or a list of record fields.
                if items.len() == 2 {
                    if let (Some(kind), Some(len)) = (items[0].as_str(), items[1].as_u64()) {
                        return match kind {
                            "ascii" => Ok(Datatype::Ascii(len)),
                            "ucs4" => Ok(Datatype::Ucs4(len)),
                            other => {
                                Err(AsdfError::Value(format!("unknown string datatype '{}'", other)))
                            }
                        };
                    }
                }
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    fields.push(Self::field_from_node(item)?);
                }
                Ok(Datatype::Record(fields))
            }
            _ => Err(AsdfError::Value(format!(
                "invalid datatype node: {:?}",
                node.value
            ))),
        }
    }

    fn field_from_node(node: &TaggedNode) -> Result<Field> {
        let mapping = node
            .as_mapping()
            .ok_or_else(|| AsdfError::Value("record field entry must be a mapping".to_string()))?;
        let datatype_node = mapping
            .get("datatype")
            .ok_or_else(|| AsdfError::Value("record field entry has no datatype".to_string()))?;
        let byteorder = match mapping.get("byteorder").and_then(|n| n.as_str()) {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        let shape = match mapping.get("shape") {
            Some(shape_node) => {
                let items = shape_node.as_sequence().ok_or_else(|| {
                    AsdfError::Value("record field shape must be a sequence".to_string())
                })?;
                Some(
                    items
                        .iter()
                        .map(|n| {
                            n.as_u64().ok_or_else(|| {
                                AsdfError::Value("record field shape must be integers".to_string())
                            })
                        })
                        .collect::<Result<Vec<u64>>>()?,
                )
            }
            None => None,
        };
        Ok(Field {
            name: mapping
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            datatype: Datatype::from_node(datatype_node)?,
            byteorder,
            shape,
        })
    }

    /// Render for diagnostics, in the same shape the YAML uses.
    pub fn display_name(&self) -> String {
        match self {
            Datatype::Scalar(kind) => kind.name().to_string(),
            Datatype::Ascii(n) => format!("['ascii', {}]", n),
            Datatype::Ucs4(n) => format!("['ucs4', {}]", n),
            Datatype::Record(fields) => {
                let names: Vec<String> =
                    fields.iter().map(|f| f.datatype.display_name()).collect();
                format!("[{}]", names.join(", "))
            }
        }
    }

    /// Safe-cast compatibility between two datatypes.
    pub fn can_cast_safe(from: &Datatype, to: &Datatype) -> bool {
        match (from, to) {
            (Datatype::Scalar(f), Datatype::Scalar(t)) => ScalarKind::can_cast_safe(*f, *t),
            (Datatype::Ascii(f), Datatype::Ascii(t)) => t >= f,
            (Datatype::Ucs4(f), Datatype::Ucs4(t)) => t >= f,
            (Datatype::Ascii(f), Datatype::Ucs4(t)) => t >= f,
            (Datatype::Record(f), Datatype::Record(t)) => {
                f.len() == t.len()
                    && f.iter()
                        .zip(t)
                        .all(|(a, b)| Datatype::can_cast_safe(&a.datatype, &b.datatype))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        for name in ["int8", "uint32", "float64", "complex128", "bool8"] {
            let datatype = Datatype::from_node(&TaggedNode::string(name)).unwrap();
            assert_eq!(datatype.to_node().as_str(), Some(name));
        }
    }

    #[test]
    fn test_string_datatypes() {
        let node = TaggedNode::sequence(vec![TaggedNode::string("ascii"), TaggedNode::int(8)]);
        let datatype = Datatype::from_node(&node).unwrap();
        assert_eq!(datatype, Datatype::Ascii(8));
        assert_eq!(datatype.itemsize(), 8);

        let ucs = Datatype::Ucs4(4);
        assert_eq!(ucs.itemsize(), 16);
    }

    #[test]
    fn test_record_round_trip() {
        let record = Datatype::Record(vec![
            Field {
                name: "x".to_string(),
                datatype: Datatype::Scalar(ScalarKind::Float64),
                byteorder: Some(ByteOrder::Little),
                shape: None,
            },
            Field {
                name: "flags".to_string(),
                datatype: Datatype::Scalar(ScalarKind::UInt8),
                byteorder: None,
                shape: Some(vec![4]),
            },
        ]);
        assert_eq!(record.itemsize(), 12);
        let parsed = Datatype::from_node(&record.to_node()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_safe_cast_widening() {
        use ScalarKind::*;
        assert!(ScalarKind::can_cast_safe(Int8, Int16));
        assert!(ScalarKind::can_cast_safe(UInt8, Int16));
        assert!(ScalarKind::can_cast_safe(Int32, Float64));
        assert!(ScalarKind::can_cast_safe(Float32, Float64));
        assert!(ScalarKind::can_cast_safe(Bool8, Int8));

        assert!(!ScalarKind::can_cast_safe(Int16, Int8));
        assert!(!ScalarKind::can_cast_safe(Int8, UInt16));
        assert!(!ScalarKind::can_cast_safe(Float64, Int64));
        assert!(!ScalarKind::can_cast_safe(Int64, Float64));
        assert!(!ScalarKind::can_cast_safe(UInt64, Float64));
        assert!(!ScalarKind::can_cast_safe(Float64, Float32));
        assert!(!ScalarKind::can_cast_safe(Int8, Bool8));
    }

    #[test]
    fn test_unknown_datatype_rejected() {
        assert!(Datatype::from_node(&TaggedNode::string("float128")).is_err());
    }
}
