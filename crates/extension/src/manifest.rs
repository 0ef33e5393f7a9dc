//! Extensions defined by a manifest document in the resource store.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use asdf_blocks::Compressor;
use asdf_core::{AsdfError, Result};
use asdf_schema::{CustomKeyword, ResourceStore};

use crate::converter::Converter;
use crate::extension::Extension;
use crate::tag_def::TagDefinition;

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    extension_uri: String,
    #[serde(default)]
    asdf_standard_requirement: Option<StandardRequirement>,
    #[serde(default)]
    tags: Vec<ManifestTag>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StandardRequirement {
    Exact(String),
    Range {
        #[serde(default)]
        gt: Option<String>,
        #[serde(default)]
        gte: Option<String>,
        #[serde(default)]
        lt: Option<String>,
        #[serde(default)]
        lte: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestTag {
    Uri(String),
    Full {
        tag_uri: String,
        #[serde(default)]
        schema_uri: Option<String>,
        #[serde(default)]
        schema_uris: Option<Vec<String>>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

/// Extension whose URI, standard requirement and tag list come from a
/// manifest document, with converters and validators supplied in code.
pub struct ManifestExtension {
    extension_uri: String,
    asdf_standard_requirement: Option<String>,
    tags: Vec<TagDefinition>,
    converters: Vec<Arc<dyn Converter>>,
    validators: Vec<Arc<dyn CustomKeyword>>,
    compressors: Vec<Arc<dyn Compressor>>,
    yaml_tag_handles: HashMap<String, String>,
}

impl ManifestExtension {
    /// Build from manifest bytes.
    pub fn from_bytes(manifest: &[u8]) -> Result<Self> {
        let document: ManifestDocument = serde_yaml::from_slice(manifest)
            .map_err(|e| AsdfError::Value(format!("malformed manifest document: {}", e)))?;

        let mut tags = Vec::with_capacity(document.tags.len());
        for tag in document.tags {
            tags.push(match tag {
                ManifestTag::Uri(uri) => TagDefinition::new(uri)?,
                ManifestTag::Full {
                    tag_uri,
                    schema_uri,
                    schema_uris,
                    title,
                    description,
                } => {
                    let mut def = TagDefinition::new(tag_uri)?;
                    let uris = match (schema_uris, schema_uri) {
                        (Some(uris), _) => uris,
                        (None, Some(uri)) => vec![uri],
                        (None, None) => Vec::new(),
                    };
                    def = def.with_schema_uris(uris);
                    if let Some(title) = title {
                        def = def.with_title(title);
                    }
                    if let Some(description) = description {
                        def = def.with_description(description);
                    }
                    def
                }
            });
        }

        Ok(ManifestExtension {
            extension_uri: document.extension_uri,
            asdf_standard_requirement: document.asdf_standard_requirement.map(render_requirement),
            tags,
            converters: Vec::new(),
            validators: Vec::new(),
            compressors: Vec::new(),
            yaml_tag_handles: HashMap::new(),
        })
    }

    /// Build from the manifest registered in the resource store at
    /// `manifest_uri`.
    pub fn from_uri(store: &ResourceStore, manifest_uri: &str) -> Result<Self> {
        let bytes = store.load(manifest_uri)?;
        ManifestExtension::from_bytes(&bytes)
    }

    /// Attach converters.
    pub fn with_converters(mut self, converters: Vec<Arc<dyn Converter>>) -> Self {
        self.converters = converters;
        self
    }

    /// Attach custom keyword validators.
    pub fn with_validators(mut self, validators: Vec<Arc<dyn CustomKeyword>>) -> Self {
        self.validators = validators;
        self
    }

    /// Attach compressors.
    pub fn with_compressors(mut self, compressors: Vec<Arc<dyn Compressor>>) -> Self {
        self.compressors = compressors;
        self
    }

    /// Declare a YAML tag handle.
    pub fn with_tag_handle(mut self, handle: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.yaml_tag_handles.insert(handle.into(), prefix.into());
        self
    }
}

fn render_requirement(requirement: StandardRequirement) -> String {
    match requirement {
        StandardRequirement::Exact(version) => format!("=={}", version),
        StandardRequirement::Range { gt, gte, lt, lte } => {
            let mut specifiers = Vec::new();
            if let Some(v) = gt {
                specifiers.push(format!(">{}", v));
            }
            if let Some(v) = gte {
                specifiers.push(format!(">={}", v));
            }
            if let Some(v) = lt {
                specifiers.push(format!("<{}", v));
            }
            if let Some(v) = lte {
                specifiers.push(format!("<={}", v));
            }
            specifiers.join(",")
        }
    }
}

impl Extension for ManifestExtension {
    fn extension_uri(&self) -> &str {
        &self.extension_uri
    }

    fn asdf_standard_requirement(&self) -> Option<String> {
        self.asdf_standard_requirement.clone()
    }

    fn tags(&self) -> Vec<TagDefinition> {
        self.tags.clone()
    }

    fn converters(&self) -> Vec<Arc<dyn Converter>> {
        self.converters.clone()
    }

    fn validators(&self) -> Vec<Arc<dyn CustomKeyword>> {
        self.validators.clone()
    }

    fn compressors(&self) -> Vec<Arc<dyn Compressor>> {
        self.compressors.clone()
    }

    fn yaml_tag_handles(&self) -> HashMap<String, String> {
        self.yaml_tag_handles.clone()
    }
}
