//! Core metadata entities: software records, history entries, extension
//! metadata, constants and complex scalars.

use indexmap::IndexMap;

use asdf_core::{AsdfError, AsdfValue, NativeObject, Result};
use asdf_extension::{ConversionResult, Converter, SerializationContext, TypeRef};

/// A software package record, attached to history entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Software {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Author or maintainer.
    pub author: Option<String>,
    /// Project homepage.
    pub homepage: Option<String>,
}

impl Software {
    /// Record for a named package version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Software {
            name: name.into(),
            version: version.into(),
            author: None,
            homepage: None,
        }
    }

    /// The record describing this library itself.
    pub fn this_library() -> Self {
        Software {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: None,
            homepage: Some("https://github.com/asdf-format/asdf-rs".to_string()),
        }
    }
}

/// One entry in the file's history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// What was done.
    pub description: String,
    /// ISO-8601 timestamp supplied by the caller.
    pub time: Option<String>,
    /// Software that performed the operation.
    pub software: Vec<Software>,
}

impl HistoryEntry {
    /// Entry with a description only.
    pub fn new(description: impl Into<String>) -> Self {
        HistoryEntry {
            description: description.into(),
            time: None,
            software: Vec::new(),
        }
    }
}

/// Metadata about an extension used to write the file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionMetadata {
    /// Implementation class or type name of the extension.
    pub extension_class: String,
    /// URI of the extension.
    pub extension_uri: Option<String>,
    /// The package providing the extension.
    pub software: Option<Software>,
}

/// A value wrapper marking a node constant on write.
#[derive(Debug, Clone)]
pub struct Constant {
    /// The wrapped value.
    pub value: AsdfValue,
}

/// A complex scalar, serialized in the `(re+imj)` string form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    /// Real part.
    pub re: f64,
    /// Imaginary part.
    pub im: f64,
}

impl Complex {
    /// A complex number.
    pub fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }

    fn format(&self) -> String {
        if self.im < 0.0 || self.im.is_nan() {
            format!("({}{}j)", format_float(self.re), format_float(self.im))
        } else {
            format!("({}+{}j)", format_float(self.re), format_float(self.im))
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let body = trimmed
            .strip_suffix(['j', 'J'])
            .ok_or_else(|| AsdfError::Value(format!("invalid complex literal '{}'", s)))?;

        // Split the imaginary term off at the last +/- that is not part
        // of an exponent or leading sign.
        let mut split = None;
        for (i, c) in body.char_indices().skip(1) {
            if (c == '+' || c == '-') && !matches!(body.as_bytes()[i - 1], b'e' | b'E') {
                split = Some(i);
            }
        }
        let (re, im) = match split {
            Some(i) => (&body[..i], &body[i..]),
            None => ("0", body),
        };
        let re: f64 = parse_float(re)?;
        let im: f64 = match im {
            "+" => 1.0,
            "-" => -1.0,
            other => parse_float(other)?,
        };
        Ok(Complex { re, im })
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{}", v)
    }
}

fn parse_float(s: &str) -> Result<f64> {
    match s.trim() {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" | "+nan" | "-nan" => Ok(f64::NAN),
        other => other
            .parse()
            .map_err(|_| AsdfError::Value(format!("invalid float literal '{}'", s))),
    }
}

// ---------------------------------------------------------------------
// Converters

/// Converter for [`Software`].
pub struct SoftwareConverter;

impl Converter for SoftwareConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/software-*".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<Software>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        let software = downcast::<Software>(obj)?;
        let mut node = IndexMap::new();
        node.insert("name".to_string(), AsdfValue::String(software.name.clone()));
        node.insert("version".to_string(), AsdfValue::String(software.version.clone()));
        if let Some(author) = &software.author {
            node.insert("author".to_string(), AsdfValue::String(author.clone()));
        }
        if let Some(homepage) = &software.homepage {
            node.insert("homepage".to_string(), AsdfValue::String(homepage.clone()));
        }
        Ok(AsdfValue::Mapping(node))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        let software = Software {
            name: require_str(node, "name")?,
            version: require_str(node, "version")?,
            author: optional_str(node, "author"),
            homepage: optional_str(node, "homepage"),
        };
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(software))))
    }
}

/// Converter for [`HistoryEntry`].
pub struct HistoryEntryConverter;

impl Converter for HistoryEntryConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/history_entry-*".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<HistoryEntry>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        let entry = downcast::<HistoryEntry>(obj)?;
        let mut node = IndexMap::new();
        node.insert(
            "description".to_string(),
            AsdfValue::String(entry.description.clone()),
        );
        if let Some(time) = &entry.time {
            node.insert("time".to_string(), AsdfValue::String(time.clone()));
        }
        if !entry.software.is_empty() {
            node.insert(
                "software".to_string(),
                AsdfValue::Sequence(
                    entry
                        .software
                        .iter()
                        .map(|s| AsdfValue::Object(NativeObject::new(s.clone())))
                        .collect(),
                ),
            );
        }
        Ok(AsdfValue::Mapping(node))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        let mut software = Vec::new();
        match node.get("software") {
            Some(AsdfValue::Sequence(items)) => {
                for item in items {
                    software.push(software_from_value(item)?);
                }
            }
            Some(item @ AsdfValue::Object(_)) | Some(item @ AsdfValue::Mapping(_)) => {
                software.push(software_from_value(item)?);
            }
            _ => {}
        }
        let entry = HistoryEntry {
            description: require_str(node, "description")?,
            time: optional_str(node, "time"),
            software,
        };
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(entry))))
    }
}

fn software_from_value(value: &AsdfValue) -> Result<Software> {
    if let Some(software) = value.downcast_ref::<Software>() {
        return Ok(software.clone());
    }
    // Tolerate an untagged mapping.
    Ok(Software {
        name: require_str(value, "name")?,
        version: require_str(value, "version")?,
        author: optional_str(value, "author"),
        homepage: optional_str(value, "homepage"),
    })
}

/// Converter for [`ExtensionMetadata`].
pub struct ExtensionMetadataConverter;

impl Converter for ExtensionMetadataConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/extension_metadata-*".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<ExtensionMetadata>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        let metadata = downcast::<ExtensionMetadata>(obj)?;
        let mut node = IndexMap::new();
        node.insert(
            "extension_class".to_string(),
            AsdfValue::String(metadata.extension_class.clone()),
        );
        if let Some(uri) = &metadata.extension_uri {
            node.insert("extension_uri".to_string(), AsdfValue::String(uri.clone()));
        }
        if let Some(software) = &metadata.software {
            node.insert(
                "software".to_string(),
                AsdfValue::Object(NativeObject::new(software.clone())),
            );
        }
        Ok(AsdfValue::Mapping(node))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        let software = match node.get("software") {
            Some(value) => Some(software_from_value(value)?),
            None => None,
        };
        let metadata = ExtensionMetadata {
            extension_class: require_str(node, "extension_class")?,
            extension_uri: optional_str(node, "extension_uri"),
            software,
        };
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(metadata))))
    }
}

/// Converter for [`Constant`].
pub struct ConstantConverter;

impl Converter for ConstantConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/constant-*".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<Constant>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        Ok(downcast::<Constant>(obj)?.value.clone())
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(Constant {
            value: node.clone(),
        }))))
    }
}

/// Converter for [`Complex`].
pub struct ComplexConverter;

impl Converter for ComplexConverter {
    fn tags(&self) -> Vec<String> {
        vec!["tag:stsci.edu:asdf/core/complex-*".to_string()]
    }

    fn types(&self) -> Vec<TypeRef> {
        vec![TypeRef::of::<Complex>()]
    }

    fn to_yaml_tree(
        &self,
        obj: &NativeObject,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<AsdfValue> {
        Ok(AsdfValue::String(downcast::<Complex>(obj)?.format()))
    }

    fn from_yaml_tree(
        &self,
        node: &AsdfValue,
        _tag: &str,
        _ctx: &mut SerializationContext<'_>,
    ) -> Result<ConversionResult> {
        let literal = node
            .as_str()
            .ok_or_else(|| AsdfError::Value("complex value must be a string".to_string()))?;
        let value = Complex::parse(literal)?;
        Ok(ConversionResult::Complete(AsdfValue::Object(NativeObject::new(value))))
    }
}

fn downcast<'a, T: std::any::Any + Send + Sync>(obj: &'a NativeObject) -> Result<&'a T> {
    obj.downcast_ref::<T>().ok_or_else(|| {
        AsdfError::Value(format!("converter received unexpected type '{}'", obj.type_name()))
    })
}

fn require_str(node: &AsdfValue, key: &str) -> Result<String> {
    node.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AsdfError::Value(format!("missing required property '{}'", key)))
}

fn optional_str(node: &AsdfValue, key: &str) -> Option<String> {
    node.get(key).and_then(|v| v.as_str()).map(str::to_string)
}
