//! The extension trait: a bundle of tags, converters, validators and
//! compressors keyed by an extension URI.

use std::collections::HashMap;
use std::sync::Arc;

use asdf_blocks::Compressor;
use asdf_schema::CustomKeyword;

use crate::converter::Converter;
use crate::tag_def::TagDefinition;

/// A plugin bundle enabled on a file.
pub trait Extension: Send + Sync {
    /// URI identifying this extension, recorded in file history.
    fn extension_uri(&self) -> &str;

    /// ASDF Standard requirement specifier (`==1.5.0`, `>=1.4.0,<2.0.0`).
    fn asdf_standard_requirement(&self) -> Option<String> {
        None
    }

    /// Concrete tag definitions this extension provides.
    fn tags(&self) -> Vec<TagDefinition> {
        Vec::new()
    }

    /// Converters for the tags and native types this extension supports.
    fn converters(&self) -> Vec<Arc<dyn Converter>> {
        Vec::new()
    }

    /// Custom schema keyword validators.
    fn validators(&self) -> Vec<Arc<dyn CustomKeyword>> {
        Vec::new()
    }

    /// Block compressors.
    fn compressors(&self) -> Vec<Arc<dyn Compressor>> {
        Vec::new()
    }

    /// YAML tag handles to declare in the document prologue, handle →
    /// prefix (e.g. `!` → `tag:stsci.edu:asdf/`).
    fn yaml_tag_handles(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Fully-qualified class names used by older versions of this
    /// extension, matched against file metadata for compatibility.
    fn legacy_class_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// An extension together with the package that provided it, used for
/// precedence ordering and history records.
#[derive(Clone)]
pub struct ExtensionEntry {
    /// The extension implementation.
    pub extension: Arc<dyn Extension>,
    /// Name of the providing package, `None` for runtime registration.
    pub package_name: Option<String>,
    /// Version of the providing package.
    pub package_version: Option<String>,
}

impl ExtensionEntry {
    /// Entry for an extension registered at runtime.
    pub fn new(extension: Arc<dyn Extension>) -> Self {
        ExtensionEntry {
            extension,
            package_name: None,
            package_version: None,
        }
    }

    /// Entry for an extension provided by an installed package.
    pub fn from_package(
        extension: Arc<dyn Extension>,
        package_name: impl Into<String>,
        package_version: impl Into<String>,
    ) -> Self {
        ExtensionEntry {
            extension,
            package_name: Some(package_name.into()),
            package_version: Some(package_version.into()),
        }
    }
}

/// Order extensions by the documented precedence: user-supplied first,
/// then third-party plugins sorted by package name, then built-in last so
/// third parties can override built-ins.
pub fn order_extensions(
    user: Vec<ExtensionEntry>,
    mut plugins: Vec<ExtensionEntry>,
    builtin: Vec<ExtensionEntry>,
) -> Vec<ExtensionEntry> {
    plugins.sort_by(|a, b| a.package_name.cmp(&b.package_name));
    let mut ordered = user;
    ordered.extend(plugins);
    ordered.extend(builtin);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Extension for Named {
        fn extension_uri(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_precedence_ordering() {
        let user = vec![ExtensionEntry::new(Arc::new(Named("asdf://u/ext-1.0.0")))];
        let plugins = vec![
            ExtensionEntry::from_package(Arc::new(Named("asdf://z/ext-1.0.0")), "zeta", "1.0"),
            ExtensionEntry::from_package(Arc::new(Named("asdf://a/ext-1.0.0")), "alpha", "1.0"),
        ];
        let builtin = vec![ExtensionEntry::new(Arc::new(Named("asdf://b/ext-1.0.0")))];

        let ordered = order_extensions(user, plugins, builtin);
        let uris: Vec<&str> = ordered.iter().map(|e| e.extension.extension_uri()).collect();
        assert_eq!(
            uris,
            vec![
                "asdf://u/ext-1.0.0",
                "asdf://a/ext-1.0.0",
                "asdf://z/ext-1.0.0",
                "asdf://b/ext-1.0.0",
            ]
        );
    }
}
