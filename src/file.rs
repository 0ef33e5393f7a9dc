//! The `AsdfFile` facade: open, write, in-place update.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::bytes::Regex;
use tracing::{debug, info};

use asdf_blocks::{calculate_updated_layout, write_blocks_fixed, BlockManager, SharedFile};
use asdf_core::constants::{
    ASDF_MAGIC, ASDF_STANDARD_MAGIC, BLOCK_MAGIC, FILE_FORMAT_VERSION, YAML_END_MARKER_REGEX,
};
use asdf_core::{
    get_config, parse_version_triple, uri_match, validate_version, AsdfError, AsdfValue,
    BlockStorage, ConfigScope, Diagnostics, ErrorKind, NativeObject, NodeValue, Result, TaggedNode,
    update_config,
};
use asdf_extension::{ExtensionEntry, ExtensionRegistry, FinalizeFn, SerializationContext};
use asdf_io::{AtomicFile, GenericFile, MemoryFile, RealFile};
use asdf_schema::{SchemaEngine, SchemaLoader};

use crate::builtin::{build_registry, default_resource_store, ASDF_OBJECT_TAG};
use crate::entities::{ExtensionMetadata, HistoryEntry, Software};
use crate::ndarray::NdArray;
use crate::reference::{resolve_fragment, Reference};
use crate::treecodec;

/// Maximum depth when resolving references across files.
const MAX_REFERENCE_DEPTH: usize = 16;

/// Options for opening a file.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Open read-write so the file can be updated in place.
    pub read_write: bool,
    /// Verify every block checksum while opening.
    pub validate_checksums: bool,
    /// Memory-map block payloads when the file allows it.
    pub memmap: bool,
    /// Override the configured `validate_on_read`.
    pub validate: Option<bool>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_write: false,
            validate_checksums: false,
            memmap: true,
            validate: None,
        }
    }
}

/// Options for writing a file; `None` fields fall back to the active
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Storage class override applied to every array.
    pub all_array_storage: Option<BlockStorage>,
    /// Compression label applied to every internal block.
    pub all_array_compression: Option<String>,
    /// Round block allocations up to the filesystem block size.
    pub pad_blocks: Option<bool>,
    /// Arrays with at most this many elements serialize inline.
    pub array_inline_threshold: Option<u64>,
    /// ASDF Standard version for the file.
    pub version: Option<String>,
    /// Strip properties equal to their schema defaults before writing.
    pub strip_defaults: bool,
}

impl WriteOptions {
    fn apply_to_config(&self) {
        let options = self.clone();
        update_config(move |config| {
            if let Some(storage) = options.all_array_storage {
                config.all_array_storage = Some(storage);
            }
            if let Some(label) = &options.all_array_compression {
                config.all_array_compression = Some(label.clone());
            }
            if let Some(pad) = options.pad_blocks {
                config.pad_blocks = pad;
            }
            if let Some(threshold) = options.array_inline_threshold {
                config.array_inline_threshold = Some(threshold);
            }
            if let Some(version) = &options.version {
                config.default_version = version.clone();
            }
        });
    }
}

/// The main entry point: a tree of native values plus the block manager
/// and serialization machinery for one file.
pub struct AsdfFile {
    tree: IndexMap<String, AsdfValue>,
    registry: Arc<ExtensionRegistry>,
    schema_engine: SchemaEngine,
    blocks: BlockManager,
    fd: Option<SharedFile>,
    uri: Option<String>,
    version: String,
    diagnostics: Diagnostics,
    external: HashMap<String, AsdfFile>,
}

impl AsdfFile {
    /// An empty file with the built-in extension enabled.
    pub fn new() -> Result<Self> {
        AsdfFile::with_extensions(Vec::new())
    }

    /// An empty file with user extensions enabled ahead of the built-in.
    pub fn with_extensions(user_extensions: Vec<ExtensionEntry>) -> Result<Self> {
        AsdfFile::with_extensions_and_resources(user_extensions, Vec::new())
    }

    /// An empty file with user extensions and additional schema/manifest
    /// providers. User providers take precedence over the built-ins.
    pub fn with_extensions_and_resources(
        user_extensions: Vec<ExtensionEntry>,
        providers: Vec<Arc<dyn asdf_schema::ResourceProvider>>,
    ) -> Result<Self> {
        let mut store = default_resource_store();
        for provider in providers {
            store.push_front(provider);
        }
        let store = Arc::new(store);
        let registry = Arc::new(build_registry(&store, user_extensions)?);
        let loader = SchemaLoader::new(store);
        let schema_engine = SchemaEngine::new(loader, registry.validators().clone());
        let mut blocks = BlockManager::new();
        blocks.set_compressors(registry.compressors().clone());
        Ok(AsdfFile {
            tree: IndexMap::new(),
            registry,
            schema_engine,
            blocks,
            fd: None,
            uri: None,
            version: get_config().default_version,
            diagnostics: Diagnostics::new(),
            external: HashMap::new(),
        })
    }

    /// The top-level tree.
    pub fn tree(&self) -> &IndexMap<String, AsdfValue> {
        &self.tree
    }

    /// Mutable access to the top-level tree.
    pub fn tree_mut(&mut self) -> &mut IndexMap<String, AsdfValue> {
        &mut self.tree
    }

    /// Replace the top-level tree.
    pub fn set_tree(&mut self, tree: IndexMap<String, AsdfValue>) {
        self.tree = tree;
    }

    /// Look up a top-level key.
    pub fn get(&self, key: &str) -> Option<&AsdfValue> {
        self.tree.get(key)
    }

    /// Insert a top-level value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AsdfValue>) {
        self.tree.insert(key.into(), value.into());
    }

    /// The URI this file was opened from or written to, when known.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// The ASDF Standard version in effect for this file.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The enabled extensions.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// The block manager.
    pub fn blocks(&self) -> &BlockManager {
        &self.blocks
    }

    /// Non-fatal diagnostics accumulated by the last operations.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Force an array's storage class for subsequent writes.
    pub fn set_array_storage(&mut self, array: &NdArray, storage: BlockStorage) -> Result<()> {
        let identity = array.data_identity();
        let bytes = array.base_bytes()?;
        let index = self
            .blocks
            .find_or_create_block_for_data(identity, || Arc::new(bytes.as_slice().to_vec()))?;
        self.blocks.block_mut(index)?.set_storage(storage);
        Ok(())
    }

    /// The storage class an array will be written with.
    pub fn get_array_storage(&self, array: &NdArray) -> Option<BlockStorage> {
        self.blocks
            .block_for_identity(array.data_identity())
            .and_then(|i| self.blocks.block(i).ok())
            .map(|b| b.storage())
    }

    /// Append a history entry describing an operation on this file.
    pub fn add_history_entry(&mut self, description: impl Into<String>, software: Option<Software>) {
        let entry = HistoryEntry {
            description: description.into(),
            time: None,
            software: software.into_iter().collect(),
        };
        let history = self
            .tree
            .entry("history".to_string())
            .or_insert_with(|| AsdfValue::Mapping(IndexMap::new()));
        if let AsdfValue::Mapping(history) = history {
            let entries = history
                .entry("entries".to_string())
                .or_insert_with(|| AsdfValue::Sequence(Vec::new()));
            if let AsdfValue::Sequence(entries) = entries {
                entries.push(AsdfValue::Object(NativeObject::new(entry)));
            }
        }
    }

    /// History entries recorded in this file.
    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        let mut out = Vec::new();
        if let Some(AsdfValue::Mapping(history)) = self.tree.get("history") {
            if let Some(AsdfValue::Sequence(entries)) = history.get("entries") {
                for entry in entries {
                    if let Some(entry) = entry.downcast_ref::<HistoryEntry>() {
                        out.push(entry.clone());
                    }
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Open

    /// Open a file on disk.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let fd: Box<dyn GenericFile> = if options.read_write {
            Box::new(RealFile::open_read_write(path)?)
        } else {
            Box::new(RealFile::open_read(path)?)
        };
        AsdfFile::open_generic(fd, options)
    }

    /// Open an in-memory buffer.
    pub fn open_bytes(bytes: Vec<u8>, options: OpenOptions) -> Result<Self> {
        AsdfFile::open_generic(Box::new(MemoryFile::from_bytes(bytes)), options)
    }

    /// Open any file-like object.
    pub fn open_generic(fd: Box<dyn GenericFile>, options: OpenOptions) -> Result<Self> {
        AsdfFile::open_with(fd, options, Vec::new(), Vec::new())
    }

    /// Open any file-like object with user extensions and additional
    /// resource providers enabled.
    pub fn open_with(
        fd: Box<dyn GenericFile>,
        options: OpenOptions,
        user_extensions: Vec<ExtensionEntry>,
        providers: Vec<Arc<dyn asdf_schema::ResourceProvider>>,
    ) -> Result<Self> {
        let config = get_config();
        config.check_consistent()?;
        let mut file = AsdfFile::with_extensions_and_resources(user_extensions, providers)?;
        file.uri = fd.uri().map(str::to_string);
        let shared: SharedFile = Arc::new(Mutex::new(fd));
        file.fd = Some(Arc::clone(&shared));
        file.blocks.set_memmap(options.memmap);

        // Header comment lines.
        let (standard_version, token) = {
            let mut guard = shared.lock();
            let newline = Regex::new(r"\r?\n").expect("static regex");
            let header_line = guard.read_until(&newline, "newline", true)?;
            let format_version = parse_header_line(&header_line)?;
            debug!(?format_version, "read ASDF header");

            let mut standard_version = None;
            let token;
            loop {
                let mut first = [0u8; 1];
                let n = guard.read(&mut first)?;
                if n == 0 {
                    token = Vec::new();
                    break;
                }
                if first[0] == b'#' {
                    let line = guard.read_until(&newline, "newline", true)?;
                    let mut full = vec![b'#'];
                    full.extend_from_slice(&line);
                    if let Some(version) = parse_standard_line(&full) {
                        standard_version = Some(version);
                    }
                } else {
                    let mut rest = [0u8; 3];
                    guard.read_exact(&mut rest)?;
                    token = vec![first[0], rest[0], rest[1], rest[2]];
                    break;
                }
            }
            (standard_version, token)
        };

        if let Some(version) = standard_version {
            match validate_version(&version) {
                Ok(version) => file.version = version,
                Err(_) => {
                    if !config.ignore_version_mismatch {
                        file.diagnostics.push(
                            ErrorKind::HeaderMalformed,
                            format!("file was written with unrecognized standard version '{}'", version),
                            None,
                        );
                    }
                    file.version = version;
                }
            }
        }

        // YAML document, then blocks.
        let token_is_magic = token.as_slice() == &BLOCK_MAGIC[..];
        let token_is_yaml = matches!(token.as_slice(), b"%YAM" | b"--- " | b"---\n" | b"---\r");
        let yaml_content = {
            let mut guard = shared.lock();
            if token_is_yaml {
                let end_marker = Regex::new(YAML_END_MARKER_REGEX).expect("static regex");
                let mut content = token.clone();
                content.extend_from_slice(&guard.read_until(
                    &end_marker,
                    "End of YAML marker",
                    true,
                )?);
                Some(content)
            } else if token_is_magic || token.is_empty() {
                None
            } else {
                return Err(AsdfError::header(
                    "ASDF file appears to contain garbage after the header",
                ));
            }
        };

        let has_blocks = if yaml_content.is_some() {
            let magic = Regex::new(r"(?-u)\xd3BLK").expect("static regex");
            shared.lock().seek_until(&magic, true)?
        } else {
            token_is_magic
        };

        if has_blocks {
            file.blocks.read_blocks(Arc::clone(&shared), true)?;
        }
        if options.validate_checksums {
            file.blocks.verify_checksums()?;
        }

        let mut root = match &yaml_content {
            Some(content) => treecodec::parse_document(content)?,
            None => TaggedNode::mapping(IndexMap::new()),
        };

        file.check_declared_extensions(&root, &config)?;

        let validate = options.validate.unwrap_or(config.validate_on_read);
        if validate {
            file.validate_tagged(&mut root, &config)?;
        }

        let registry = Arc::clone(&file.registry);
        let resolver = |tag: &str| registry.schema_uris_for_tag(tag);
        file.schema_engine.fill_defaults(&mut root, &resolver)?;

        // The root tag marks the document; the tree itself is plain.
        root.tag = None;
        let (value, finalizers) = {
            let registry = Arc::clone(&file.registry);
            let mut ctx = SerializationContext::for_deserialization(
                file.version.clone(),
                file.uri.clone(),
                &registry,
                &mut file.blocks,
            );
            let mut unknown = Vec::new();
            let result = treecodec::tagged_to_native(&root, &mut ctx, &mut unknown)?;
            file.report_unknown_tags(unknown, &config)?;
            result
        };
        run_finalizers(finalizers)?;

        file.tree = match value {
            AsdfValue::Mapping(entries) => entries,
            AsdfValue::Null => IndexMap::new(),
            other => {
                return Err(AsdfError::header(format!(
                    "top-level ASDF node must be a mapping, got {:?}",
                    std::mem::discriminant(&other)
                )))
            }
        };

        file.resolve_external_arrays()?;
        info!(uri = ?file.uri, blocks = file.blocks.len(), "opened ASDF file");
        Ok(file)
    }

    fn check_declared_extensions(&mut self, root: &TaggedNode, config: &asdf_core::AsdfConfig) -> Result<()> {
        let declared = root
            .get("history")
            .and_then(|h| h.get("extensions"))
            .and_then(|e| e.as_sequence())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("extension_uri").and_then(|u| u.as_str()))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for extension_uri in declared {
            if self.registry.has_extension(&extension_uri) {
                continue;
            }
            if config.strict_extension_check {
                return Err(AsdfError::MissingExtension { extension_uri });
            }
            if !config.ignore_missing_extensions {
                self.diagnostics.push(
                    ErrorKind::MissingExtension,
                    format!(
                        "file was created with extension '{}', which is not currently installed",
                        extension_uri
                    ),
                    None,
                );
            }
        }
        Ok(())
    }

    fn validate_tagged(&mut self, root: &mut TaggedNode, config: &asdf_core::AsdfConfig) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let resolver = |tag: &str| registry.schema_uris_for_tag(tag);
        let outcome = self.schema_engine.validate_tree(root, &resolver)?;
        if let Some(error) = outcome.errors.first() {
            return Err(AsdfError::SchemaViolation {
                path: error.path.clone(),
                message: error.message.clone(),
            });
        }
        // A tag is unknown only when neither a definition nor a converter
        // claims it; converter-only tags simply have nothing to validate.
        let unknown = outcome
            .unknown_tags
            .into_iter()
            .filter(|(_, tag)| !self.registry.handles_tag(tag))
            .collect();
        self.report_unknown_tags(unknown, config)
    }

    fn report_unknown_tags(
        &mut self,
        unknown: Vec<(String, String)>,
        config: &asdf_core::AsdfConfig,
    ) -> Result<()> {
        for (path, tag) in unknown {
            if config.strict_extension_check {
                return Err(AsdfError::UnknownTag { tag });
            }
            if !config.ignore_unrecognized_tag {
                self.diagnostics.push(
                    ErrorKind::UnknownTag,
                    format!("no support available for YAML tag '{}'", tag),
                    Some(asdf_core::Pointer::Path(path)),
                );
            }
        }
        Ok(())
    }

    fn resolve_external_arrays(&mut self) -> Result<()> {
        let mut pending: Vec<(Arc<NdArray>, String)> = Vec::new();
        for value in self.tree.values() {
            value.walk(&mut |node| {
                if let AsdfValue::Object(obj) = node {
                    if let Some(array) = obj.downcast_arc::<NdArray>() {
                        if let Some(uri) = array.external_uri() {
                            pending.push((Arc::clone(&array), uri.to_string()));
                        }
                    }
                }
            });
        }
        for (array, uri) in pending {
            let payload = {
                let external = self.read_external(&uri, 0)?;
                if external.blocks.is_empty() {
                    return Err(AsdfError::ReferenceUnresolved {
                        uri: uri.clone(),
                        reason: "external file contains no blocks".to_string(),
                    });
                }
                external.blocks.block(0)?.payload_handle()
            };
            array.resolve_external(payload)?;
        }
        Ok(())
    }

    fn read_external(&mut self, uri: &str, depth: usize) -> Result<&AsdfFile> {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(AsdfError::ReferenceUnresolved {
                uri: uri.to_string(),
                reason: format!("reference nesting exceeds {} levels", MAX_REFERENCE_DEPTH),
            });
        }
        let resolved = asdf_io::resolve_uri(self.uri.as_deref(), uri);
        if !self.external.contains_key(&resolved) {
            let path = resolved.strip_prefix("file://").unwrap_or(&resolved);
            let external = AsdfFile::open(path, OpenOptions::default()).map_err(|e| {
                AsdfError::ReferenceUnresolved {
                    uri: resolved.clone(),
                    reason: e.to_string(),
                }
            })?;
            self.external.insert(resolved.clone(), external);
        }
        Ok(&self.external[&resolved])
    }

    // ------------------------------------------------------------------
    // References

    /// Replace every `{"$ref": ...}` object in the tree with its target
    /// node, loading external files as needed.
    pub fn resolve_references(&mut self) -> Result<()> {
        let tree = std::mem::take(&mut self.tree);
        let mut root = AsdfValue::Mapping(tree);
        let mut in_progress = HashSet::new();
        if let Some(uri) = &self.uri {
            in_progress.insert(uri.clone());
        }
        let result = self.resolve_refs_in(&mut root, &mut in_progress, 0);
        self.tree = match root {
            AsdfValue::Mapping(entries) => entries,
            _ => IndexMap::new(),
        };
        result
    }

    fn resolve_refs_in(
        &mut self,
        value: &mut AsdfValue,
        in_progress: &mut HashSet<String>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_REFERENCE_DEPTH {
            return Err(AsdfError::ReferenceUnresolved {
                uri: "<tree>".to_string(),
                reason: format!("reference nesting exceeds {} levels", MAX_REFERENCE_DEPTH),
            });
        }
        let reference = match value {
            AsdfValue::Object(obj) => obj.downcast_ref::<Reference>().cloned(),
            _ => None,
        };
        if let Some(reference) = reference {
            *value = self.resolve_one_reference(&reference, in_progress, depth)?;
            // The substituted subtree may itself contain references.
            return self.resolve_refs_in(value, in_progress, depth + 1);
        }
        match value {
            AsdfValue::Mapping(entries) => {
                for child in entries.values_mut() {
                    self.resolve_refs_in(child, in_progress, depth + 1)?;
                }
            }
            AsdfValue::Sequence(items) => {
                for child in items {
                    self.resolve_refs_in(child, in_progress, depth + 1)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_one_reference(
        &mut self,
        reference: &Reference,
        in_progress: &mut HashSet<String>,
        depth: usize,
    ) -> Result<AsdfValue> {
        let (base, fragment) = asdf_io::split_fragment(&reference.uri);
        let pointer = fragment.unwrap_or("");

        if base.is_empty() {
            let root = AsdfValue::Mapping(self.tree.clone());
            return Ok(resolve_fragment(&root, pointer)?.clone());
        }

        let resolved_uri = asdf_io::resolve_uri(self.uri.as_deref(), base);
        if !in_progress.insert(resolved_uri.clone()) {
            return Err(AsdfError::ReferenceUnresolved {
                uri: reference.uri.clone(),
                reason: "reference cycle detected".to_string(),
            });
        }
        let target = {
            let external = self.read_external(base, depth)?;
            let root = AsdfValue::Mapping(external.tree.clone());
            resolve_fragment(&root, pointer)?.clone()
        };
        in_progress.remove(&resolved_uri);
        Ok(target)
    }

    /// Resolve all references, then force every array inline so the saved
    /// file is fully self-contained YAML.
    pub fn resolve_and_inline(&mut self) -> Result<()> {
        self.resolve_references()?;
        let arrays = self.collect_arrays();
        for array in arrays {
            self.set_array_storage(&array, BlockStorage::Inline)?;
        }
        Ok(())
    }

    fn collect_arrays(&self) -> Vec<Arc<NdArray>> {
        let mut arrays = Vec::new();
        for value in self.tree.values() {
            value.walk(&mut |node| {
                if let AsdfValue::Object(obj) = node {
                    if let Some(array) = obj.downcast_arc::<NdArray>() {
                        arrays.push(array);
                    }
                }
            });
        }
        arrays
    }

    // ------------------------------------------------------------------
    // Write

    /// Write the file to a path, atomically: the target appears only
    /// when the write has fully succeeded.
    pub fn write_to(&mut self, path: impl AsRef<Path>, options: WriteOptions) -> Result<()> {
        let path = path.as_ref();
        let previous_uri = self.uri.clone();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        self.uri = Some(format!(
            "file://{}",
            std::fs::canonicalize(parent)
                .unwrap_or_else(|_| parent.to_path_buf())
                .join(path.file_name().unwrap_or_default())
                .display()
        ));

        let mut atomic = AtomicFile::create(path).map_err(|e| {
            self.uri = previous_uri.clone();
            e
        })?;
        let write_result = self.write_to_generic(atomic.file(), options);
        match write_result {
            Ok(()) => {
                atomic.commit()?;
                self.write_external_blocks(path)?;
                // Any previous handle points at the replaced inode; reopen
                // so streamed writes and in-place updates see the new file.
                match RealFile::open_read_write(path) {
                    Ok(mut fd) => {
                        if self.blocks.streamed_block_index().is_some() {
                            fd.seek(SeekFrom::End(0))?;
                        }
                        let fd: Box<dyn GenericFile> = Box::new(fd);
                        self.fd = Some(Arc::new(Mutex::new(fd)));
                    }
                    Err(_) => self.fd = None,
                }
                Ok(())
            }
            Err(e) => {
                self.uri = previous_uri;
                Err(e)
            }
        }
    }

    /// Write the file into an in-memory buffer.
    pub fn write_to_bytes(&mut self, options: WriteOptions) -> Result<Vec<u8>> {
        let mut fd = MemoryFile::new();
        self.write_to_generic(&mut fd, options)?;
        Ok(fd.into_bytes())
    }

    /// Write the file to any file-like object.
    pub fn write_to_generic(&mut self, fd: &mut dyn GenericFile, options: WriteOptions) -> Result<()> {
        let _scope = ConfigScope::enter();
        options.apply_to_config();
        let config = get_config();
        config.check_consistent()?;
        // An explicit option wins; otherwise a file keeps the version it
        // was opened with.
        let version = match &options.version {
            Some(version) => validate_version(version)?,
            None => validate_version(&self.version).unwrap_or(config.default_version.clone()),
        };
        self.version = version.clone();

        self.prune_blocks();

        let (mut tagged_root, _extensions_used) = self.serialize_tree(&version)?;

        if let Some(label) = &config.all_array_compression {
            self.blocks.apply_compression_override(label)?;
        }
        self.blocks.check_streamed_uniqueness()?;

        self.validate_tagged(&mut tagged_root, &config)?;
        if options.strip_defaults {
            let registry = Arc::clone(&self.registry);
            let resolver = |tag: &str| registry.schema_uris_for_tag(tag);
            self.schema_engine.strip_defaults(&mut tagged_root, &resolver)?;
        }

        let yaml = treecodec::dump_document(&tagged_root, &self.registry.yaml_tag_handles());

        fd.write_all(ASDF_MAGIC)?;
        fd.write_all(FILE_FORMAT_VERSION.as_bytes())?;
        fd.write_all(b"\n")?;
        fd.write_all(ASDF_STANDARD_MAGIC)?;
        fd.write_all(version.as_bytes())?;
        fd.write_all(b"\n")?;
        fd.write_all(&yaml)?;

        let offsets = self.blocks.write_blocks(fd, config.pad_blocks)?;
        self.blocks.write_index(fd, &offsets)?;
        fd.flush()?;
        info!(blocks = offsets.len(), version = %version, "wrote ASDF file");
        Ok(())
    }

    /// Append raw bytes to the open streamed block.
    pub fn write_to_stream(&mut self, data: &[u8]) -> Result<()> {
        if self.blocks.streamed_block_index().is_none() {
            return Err(AsdfError::Value(
                "file has no streamed block to write to".to_string(),
            ));
        }
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| AsdfError::Value("file is not open for streamed writing".to_string()))?;
        fd.lock().write_all(data)
    }

    /// Identities of every native object (and array base buffer) in the
    /// tree; blocks bound to anything else are stale.
    fn live_identities(&self) -> HashSet<usize> {
        let mut identities = HashSet::new();
        for value in self.tree.values() {
            value.walk(&mut |node| {
                if let AsdfValue::Object(obj) = node {
                    identities.insert(obj.identity());
                    if let Some(array) = obj.downcast_ref::<NdArray>() {
                        identities.insert(array.data_identity());
                        if let Some(crate::ndarray::Mask::Array(mask)) = array.mask() {
                            identities.insert(mask.data_identity());
                        }
                    }
                }
            });
        }
        identities
    }

    fn prune_blocks(&mut self) {
        let used = self.blocks.used_blocks_for_identities(&self.live_identities());
        self.blocks.remove_unused(&used);
    }

    /// Run the converters over the native tree and assemble the final
    /// tagged document, including `asdf_library` and history metadata.
    fn serialize_tree(&mut self, version: &str) -> Result<(TaggedNode, Vec<String>)> {
        let registry = Arc::clone(&self.registry);
        let mut ctx = SerializationContext::for_serialization(
            version.to_string(),
            self.uri.clone(),
            &registry,
            &mut self.blocks,
        );

        let user_tree = AsdfValue::Mapping(self.tree.clone());
        let body = treecodec::native_to_tagged(&user_tree, &mut ctx)?;

        // Extensions exercised above are recorded in the history block.
        let mut extensions_used: Vec<String> = ctx.extensions_used().iter().cloned().collect();
        extensions_used.sort();

        let mut metadata_values = Vec::new();
        for extension_uri in &extensions_used {
            let entry = registry
                .extension(extension_uri)
                .ok_or_else(|| AsdfError::NotAnExtension(extension_uri.clone()))?;
            let software = entry.package_name.as_ref().map(|name| Software {
                name: name.clone(),
                version: entry.package_version.clone().unwrap_or_default(),
                author: None,
                homepage: None,
            });
            metadata_values.push(AsdfValue::Object(NativeObject::new(ExtensionMetadata {
                extension_class: extension_uri.clone(),
                extension_uri: Some(extension_uri.clone()),
                software,
            })));
        }

        let library = AsdfValue::Object(NativeObject::new(Software::this_library()));
        let library_node = treecodec::native_to_tagged(&library, &mut ctx)?;
        let extensions_node =
            treecodec::native_to_tagged(&AsdfValue::Sequence(metadata_values), &mut ctx)?;

        let mut root = match body {
            TaggedNode {
                value: NodeValue::Mapping(entries),
                ..
            } => entries,
            _ => IndexMap::new(),
        };

        // asdf_library and history.extensions are regenerated on every
        // write; history entries are whatever the tree carries.
        root.shift_remove("asdf_library");
        let history_node = match root.shift_remove("history") {
            Some(mut existing) => {
                if let Some(mapping) = existing.as_mapping_mut() {
                    mapping.shift_remove("extensions");
                    mapping.insert("extensions".to_string(), extensions_node);
                }
                existing
            }
            None => {
                let mut mapping = IndexMap::new();
                mapping.insert("extensions".to_string(), extensions_node);
                TaggedNode::mapping(mapping)
            }
        };

        let mut assembled = IndexMap::new();
        assembled.insert("asdf_library".to_string(), library_node);
        assembled.insert("history".to_string(), history_node);
        for (key, value) in root {
            assembled.insert(key, value);
        }

        let mut tagged_root = TaggedNode::mapping(assembled);
        tagged_root.tag = Some(ASDF_OBJECT_TAG.to_string());
        Ok((tagged_root, extensions_used))
    }

    fn write_external_blocks(&mut self, path: &Path) -> Result<()> {
        let order = self.blocks.external_block_order();
        if order.is_empty() {
            return Ok(());
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AsdfError::Value("invalid target path for external blocks".to_string()))?;
        for (position, index) in order.into_iter().enumerate() {
            let external_name = BlockManager::external_filename(filename, position);
            let external_path = path.with_file_name(&external_name);
            let payload = self.blocks.block_data(index)?;

            let mut external = AsdfFile::new()?;
            let array = NdArray::from_bytes(
                crate::ndarray::Datatype::Scalar(crate::ndarray::ScalarKind::UInt8),
                vec![payload.len() as u64],
                asdf_core::ByteOrder::Big,
                payload.as_slice().to_vec(),
            )?;
            external.insert("data", AsdfValue::Object(NativeObject::new(array)));
            external.write_to(&external_path, WriteOptions::default())?;
            debug!(file = %external_name, "wrote external block");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update

    /// Rewrite the open file in place, keeping unchanged blocks at their
    /// existing offsets when the new layout fits; otherwise fall back to
    /// a full rewrite.
    pub fn update(&mut self, options: WriteOptions) -> Result<()> {
        let fd = self
            .fd
            .clone()
            .ok_or_else(|| AsdfError::Value("file is not open for update".to_string()))?;
        {
            let guard = fd.lock();
            if !guard.writable() || !guard.seekable() {
                return Err(AsdfError::Value(
                    "file must be opened read-write to update in place".to_string(),
                ));
            }
        }

        let _scope = ConfigScope::enter();
        options.apply_to_config();
        let config = get_config();
        let version = match &options.version {
            Some(version) => validate_version(version)?,
            None => validate_version(&self.version).unwrap_or(config.default_version.clone()),
        };
        self.version = version.clone();

        self.prune_blocks();
        let (mut tagged_root, _extensions) = self.serialize_tree(&version)?;
        self.blocks.check_streamed_uniqueness()?;
        self.validate_tagged(&mut tagged_root, &config)?;

        let dirty: Vec<bool> = self
            .blocks
            .blocks()
            .iter()
            .map(|b| b.offset().is_none())
            .collect();
        let has_streamed = self.blocks.streamed_block_index().is_some();
        if has_streamed && dirty.iter().any(|&d| d) {
            return Err(AsdfError::Value(
                "cannot update in place: new blocks would overwrite the streamed block".to_string(),
            ));
        }

        let header = render_header(&version);
        let mut yaml = treecodec::dump_document(&tagged_root, &self.registry.yaml_tag_handles());
        let mut tree_size = (header.len() + yaml.len()) as u64;

        let block_size = fd.lock().block_size();
        let mut laid_out = calculate_updated_layout(
            &mut self.blocks,
            tree_size,
            config.pad_blocks,
            block_size,
        );

        if laid_out {
            // Source numbering follows file order; renumber when first-fit
            // placement reordered the blocks, and re-check the layout if
            // the document length shifted.
            for _ in 0..2 {
                let remap = self.source_remap();
                if remap.iter().enumerate().all(|(i, &s)| i as i64 == s) {
                    break;
                }
                patch_sources(&mut tagged_root, &remap);
                yaml = treecodec::dump_document(&tagged_root, &self.registry.yaml_tag_handles());
                let new_size = (header.len() + yaml.len()) as u64;
                if new_size == tree_size {
                    break;
                }
                tree_size = new_size;
                laid_out = calculate_updated_layout(
                    &mut self.blocks,
                    tree_size,
                    config.pad_blocks,
                    block_size,
                );
                if !laid_out {
                    break;
                }
            }
        }

        if !laid_out {
            debug!("in-place layout failed, rewriting the file serially");
            return self.rewrite_in_place(&fd, options);
        }

        let mut guard = fd.lock();
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(&header)?;
        guard.write_all(&yaml)?;
        let tree_end = guard.tell()?;
        if tree_end > tree_size {
            return Err(AsdfError::Value("tree grew during update".to_string()));
        }
        guard.clear(tree_size - tree_end)?;

        let (offsets, end_of_blocks) =
            write_blocks_fixed(&mut self.blocks, guard.as_mut(), tree_size, config.pad_blocks, &dirty)?;
        if !has_streamed {
            guard.truncate(end_of_blocks)?;
            guard.seek(SeekFrom::Start(end_of_blocks))?;
            self.blocks.write_index(guard.as_mut(), &offsets)?;
        }
        guard.flush()?;
        drop(guard);

        self.blocks.sort_blocks_by_offset();
        info!(blocks = offsets.len(), "updated ASDF file in place");
        Ok(())
    }

    /// Positions of internal blocks ranked by file offset: entry `i` is
    /// the new source number for current source `i`.
    fn source_remap(&self) -> Vec<i64> {
        let order = self.blocks.internal_block_order();
        let mut by_offset: Vec<(u64, usize)> = order
            .iter()
            .enumerate()
            .filter_map(|(source, &index)| {
                self.blocks.blocks()[index].offset().map(|o| (o, source))
            })
            .collect();
        by_offset.sort();
        let mut remap = vec![0i64; order.len()];
        for (rank, (_, source)) in by_offset.iter().enumerate() {
            remap[*source] = rank as i64;
        }
        remap
    }

    fn rewrite_in_place(&mut self, fd: &SharedFile, options: WriteOptions) -> Result<()> {
        // Buffer every surviving payload, then drop mappings so the file
        // can be truncated under them.
        for index in 0..self.blocks.len() {
            self.blocks.block(index)?.payload_handle().bytes()?;
        }
        let mut buffer = MemoryFile::new();
        // The serial write path regenerates everything, so clear offsets
        // accumulated by the failed layout attempt.
        for index in 0..self.blocks.len() {
            self.blocks.block_mut(index)?.set_offset(None);
        }
        self.write_to_generic(&mut buffer, options)?;
        let bytes = buffer.into_bytes();

        let mut guard = fd.lock();
        guard.drop_memmap();
        guard.seek(SeekFrom::Start(0))?;
        guard.truncate(0)?;
        guard.write_all(&bytes)?;
        guard.flush()?;
        drop(guard);
        self.blocks.sort_blocks_by_offset();
        Ok(())
    }
}

fn render_header(version: &str) -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(ASDF_MAGIC);
    header.extend_from_slice(FILE_FORMAT_VERSION.as_bytes());
    header.push(b'\n');
    header.extend_from_slice(ASDF_STANDARD_MAGIC);
    header.extend_from_slice(version.as_bytes());
    header.push(b'\n');
    header
}

fn parse_header_line(line: &[u8]) -> Result<(u32, u32, u32)> {
    let text = std::str::from_utf8(line)
        .map_err(|_| AsdfError::header("does not appear to be an ASDF file"))?;
    let rest = text
        .strip_prefix("#ASDF ")
        .ok_or_else(|| AsdfError::header("does not appear to be an ASDF file"))?;
    parse_version_triple(rest.trim_end())
        .map_err(|_| AsdfError::header("does not appear to be an ASDF file"))
}

fn parse_standard_line(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?;
    Some(text.strip_prefix("#ASDF_STANDARD ")?.trim_end().to_string())
}

fn run_finalizers(finalizers: Vec<FinalizeFn>) -> Result<()> {
    for finalize in finalizers {
        finalize()?;
    }
    Ok(())
}

/// Renumber integer ndarray sources through `remap` after an update
/// layout reordered the blocks on disk. Entry `i` of `remap` holds the
/// new source number for current source `i`.
fn patch_sources(node: &mut TaggedNode, remap: &[i64]) {
    let is_ndarray = node
        .tag
        .as_deref()
        .map(|t| uri_match("tag:stsci.edu:asdf/core/ndarray-*", t))
        .unwrap_or(false);
    if is_ndarray {
        if let Some(mapping) = node.as_mapping_mut() {
            if let Some(source) = mapping.get_mut("source") {
                if let Some(old) = source.as_i64() {
                    if old >= 0 && (old as usize) < remap.len() {
                        *source = TaggedNode::int(remap[old as usize]);
                    }
                }
            }
        }
    }
    match &mut node.value {
        NodeValue::Mapping(entries) => {
            for child in entries.values_mut() {
                patch_sources(child, remap);
            }
        }
        NodeValue::Sequence(items) => {
            for child in items {
                patch_sources(child, remap);
            }
        }
        _ => {}
    }
}
