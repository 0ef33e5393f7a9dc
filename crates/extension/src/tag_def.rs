//! Tag definitions: the link between a tag URI and its schemas.

use asdf_core::{AsdfError, Result};

/// Properties of one custom YAML tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDefinition {
    tag_uri: String,
    schema_uris: Vec<String>,
    title: Option<String>,
    description: Option<String>,
}

impl TagDefinition {
    /// Definition for a concrete tag URI. URI patterns are not permitted
    /// here; wildcards belong on converters.
    pub fn new(tag_uri: impl Into<String>) -> Result<Self> {
        let tag_uri = tag_uri.into();
        if tag_uri.contains('*') {
            return Err(AsdfError::Value(
                "URI patterns are not permitted in TagDefinition".to_string(),
            ));
        }
        Ok(TagDefinition {
            tag_uri,
            schema_uris: Vec::new(),
            title: None,
            description: None,
        })
    }

    /// Attach the schemas that validate objects carrying this tag.
    pub fn with_schema_uris(mut self, schema_uris: Vec<String>) -> Self {
        self.schema_uris = schema_uris;
        self
    }

    /// Attach a short description.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Attach a long description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The tag URI.
    pub fn tag_uri(&self) -> &str {
        &self.tag_uri
    }

    /// URIs of the schemas that validate this tag.
    pub fn schema_uris(&self) -> &[String] {
        &self.schema_uris
    }

    /// Short description, when present.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Long description, when present.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_rejected() {
        assert!(TagDefinition::new("tag:example.com/thing-*").is_err());
    }

    #[test]
    fn test_builder() {
        let def = TagDefinition::new("tag:example.com/thing-1.0.0")
            .unwrap()
            .with_schema_uris(vec!["asdf://example.com/schemas/thing-1.0.0".to_string()])
            .with_title("A thing");
        assert_eq!(def.tag_uri(), "tag:example.com/thing-1.0.0");
        assert_eq!(def.schema_uris().len(), 1);
        assert_eq!(def.title(), Some("A thing"));
    }
}
