//! The block manager: exclusive owner of a file's binary blocks.
//!
//! Arrays and converters never hold blocks directly; they hold block keys
//! and lazy payload handles. The manager maps data identities to blocks so
//! views over one base buffer share a single block, enforces the
//! streamed-block invariants, and drives the read and write paths.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::sync::Arc;

use tracing::debug;

use asdf_core::constants::MAX_BLOCKS;
use asdf_core::{AsdfError, BlockStorage, Result};
use asdf_io::GenericFile;

use crate::block::Block;
use crate::compression::{parse_label, CompressorRegistry};
use crate::index::{read_block_index, write_block_index};
use crate::key::BlockKey;
use crate::padding::calculate_padding;
use crate::payload::{BlockDataCallback, DataCallback, PayloadBytes, SharedFile};

/// Owns the sequence of binary blocks for one file.
pub struct BlockManager {
    blocks: Vec<Block>,
    fd: Option<SharedFile>,
    key_to_block: HashMap<BlockKey, usize>,
    /// The identity of the object each key belongs to, so blocks can be
    /// released when their owner leaves the tree.
    key_owner: HashMap<BlockKey, usize>,
    identity_to_block: HashMap<usize, usize>,
    compressors: CompressorRegistry,
    memmap: bool,
}

impl BlockManager {
    /// New empty manager.
    pub fn new() -> Self {
        BlockManager {
            blocks: Vec::new(),
            fd: None,
            key_to_block: HashMap::new(),
            key_owner: HashMap::new(),
            identity_to_block: HashMap::new(),
            compressors: CompressorRegistry::new(),
            memmap: true,
        }
    }

    /// Replace the compressor registry (from the active extensions).
    pub fn set_compressors(&mut self, compressors: CompressorRegistry) {
        self.compressors = compressors;
    }

    /// The compressor registry in use.
    pub fn compressors(&self) -> &CompressorRegistry {
        &self.compressors
    }

    /// Allow or forbid memory mapping of payloads read from file.
    pub fn set_memmap(&mut self, memmap: bool) {
        self.memmap = memmap;
    }

    /// Number of blocks under management.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// `true` when no blocks are managed.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Borrow a block.
    pub fn block(&self, index: usize) -> Result<&Block> {
        self.blocks
            .get(index)
            .ok_or_else(|| AsdfError::Value(format!("block {} not found", index)))
    }

    /// Borrow a block mutably.
    pub fn block_mut(&mut self, index: usize) -> Result<&mut Block> {
        self.blocks
            .get_mut(index)
            .ok_or_else(|| AsdfError::Value(format!("block {} not found", index)))
    }

    /// All blocks, in creation order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    // ------------------------------------------------------------------
    // Read path

    /// Read all internal blocks starting at the current position of `fd`.
    ///
    /// With `past_magic` the position is just after the first block's magic
    /// token. The file handle is retained for lazy payload access.
    pub fn read_internal_blocks(&mut self, fd: SharedFile, mut past_magic: bool) -> Result<()> {
        self.fd = Some(Arc::clone(&fd));
        loop {
            match Block::read(&fd, past_magic, self.memmap)? {
                Some(block) => self.add_block(block)?,
                None => break,
            };
            past_magic = false;
        }
        self.check_read_invariants()
    }

    /// Read blocks through the index trailer when it validates, falling
    /// back to a sequential scan from the current position.
    pub fn read_blocks(&mut self, fd: SharedFile, past_magic: bool) -> Result<()> {
        let start = fd.lock().tell()?;
        let offsets = read_block_index(fd.lock().as_mut())?;
        match offsets {
            Some(offsets) => {
                debug!(blocks = offsets.len(), "reading blocks through index trailer");
                self.fd = Some(Arc::clone(&fd));
                for offset in offsets {
                    fd.lock().seek(SeekFrom::Start(offset))?;
                    match Block::read(&fd, false, self.memmap)? {
                        Some(block) => self.add_block(block)?,
                        None => {
                            return Err(AsdfError::BlockMalformed {
                                message: "block index points past end of file".to_string(),
                                offset: Some(offset),
                            })
                        }
                    };
                }
                self.check_read_invariants()
            }
            None => {
                fd.lock().seek(SeekFrom::Start(start))?;
                self.read_internal_blocks(fd, past_magic)
            }
        }
    }

    fn check_read_invariants(&self) -> Result<()> {
        let streamed = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.storage() == BlockStorage::Streamed)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if streamed.len() > 1 {
            return Err(AsdfError::MultipleStreamedBlocks {
                count: streamed.len(),
            });
        }
        if let Some(&index) = streamed.first() {
            if index + 1 != self.blocks.len() {
                return Err(AsdfError::block("streamed block must be the last block"));
            }
        }
        Ok(())
    }

    /// Verify every block's stored checksum.
    pub fn verify_checksums(&self) -> Result<()> {
        for (index, block) in self.blocks.iter().enumerate() {
            block.verify_checksum(index)?;
        }
        Ok(())
    }

    /// The payload of block `index`, decompressed if necessary.
    pub fn block_data(&self, index: usize) -> Result<PayloadBytes> {
        self.block(index)?.data(&self.compressors)
    }

    /// A zero-argument callback yielding block `index`'s bytes, for
    /// handing to converters during deserialization.
    pub fn data_callback(&self, index: usize) -> Result<BlockDataCallback> {
        let block = self.block(index)?;
        let payload = block.payload_handle();
        let compression = block.compression();
        let data_size = block.used_size();
        let compressors = self.compressors.clone();
        Ok(Arc::new(move || {
            let bytes = payload.bytes()?;
            if compression == crate::header::NO_COMPRESSION {
                Ok(bytes)
            } else {
                let compressor = compressors.get(&compression)?;
                let out = compressor.decompress(bytes.as_slice(), data_size as usize)?;
                Ok(PayloadBytes::Owned(Arc::new(out)))
            }
        }))
    }

    // ------------------------------------------------------------------
    // Block creation and lookup

    /// Append a block, enforcing the block-count limit.
    pub fn add_block(&mut self, block: Block) -> Result<usize> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(AsdfError::Value(format!(
                "cannot store more than {} blocks in one file",
                MAX_BLOCKS
            )));
        }
        self.blocks.push(block);
        Ok(self.blocks.len() - 1)
    }

    /// Find the block keyed by a data identity, creating one over `data`
    /// when absent. Two arrays over one base buffer share one block.
    pub fn find_or_create_block_for_data(
        &mut self,
        identity: usize,
        data: impl FnOnce() -> Arc<Vec<u8>>,
    ) -> Result<usize> {
        if let Some(&index) = self.identity_to_block.get(&identity) {
            return Ok(index);
        }
        let index = self.add_block(Block::from_data(data(), BlockStorage::Internal))?;
        self.identity_to_block.insert(identity, index);
        Ok(index)
    }

    /// The block already keyed by `identity`, if any.
    pub fn block_for_identity(&self, identity: usize) -> Option<usize> {
        self.identity_to_block.get(&identity).copied()
    }

    /// Bind a data identity to an existing block (used after read so a
    /// later write reuses the block).
    pub fn bind_identity(&mut self, identity: usize, index: usize) {
        self.identity_to_block.insert(identity, index);
    }

    /// The block bound to a converter key, if any.
    pub fn block_for_key(&self, key: BlockKey) -> Option<usize> {
        self.key_to_block.get(&key).copied()
    }

    /// Bind a converter key to a block.
    pub fn bind_key(&mut self, key: BlockKey, index: usize) {
        self.key_to_block.insert(key, index);
    }

    /// Record which object identity a key belongs to.
    pub fn bind_key_owner(&mut self, key: BlockKey, identity: usize) {
        self.key_owner.insert(key, identity);
    }

    /// Indices of blocks reachable from the given object identities,
    /// either directly or through an owned key.
    pub fn used_blocks_for_identities(&self, identities: &HashSet<usize>) -> HashSet<usize> {
        let mut used = HashSet::new();
        for (identity, &index) in &self.identity_to_block {
            if identities.contains(identity) {
                used.insert(index);
            }
        }
        for (key, &index) in &self.key_to_block {
            match self.key_owner.get(key) {
                Some(owner) if identities.contains(owner) => {
                    used.insert(index);
                }
                // A key without a recorded owner is kept conservatively.
                None => {
                    used.insert(index);
                }
                _ => {}
            }
        }
        used
    }

    /// Find or create the write block for a converter, keyed by `key`.
    ///
    /// The payload is produced by `callback` when the file is flushed.
    pub fn make_write_block(&mut self, callback: DataCallback, key: BlockKey) -> Result<usize> {
        if let Some(&index) = self.key_to_block.get(&key) {
            return Ok(index);
        }
        let index = self.add_block(Block::from_callback(callback))?;
        self.key_to_block.insert(key, index);
        Ok(index)
    }

    /// The streamed block, created on first request.
    pub fn get_or_create_streamed_block(&mut self) -> Result<usize> {
        if let Some(index) = self.streamed_block_index() {
            return Ok(index);
        }
        self.add_block(Block::streamed())
    }

    /// Index of the streamed block, if one exists.
    pub fn streamed_block_index(&self) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.storage() == BlockStorage::Streamed)
    }

    // ------------------------------------------------------------------
    // Storage assignment

    /// Positions of internal blocks in write order: every internal block in
    /// creation order, then the streamed block if present.
    pub fn internal_block_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.storage() == BlockStorage::Internal)
            .map(|(i, _)| i)
            .collect();
        if let Some(streamed) = self.streamed_block_index() {
            order.push(streamed);
        }
        order
    }

    /// Indices of external blocks, in creation order.
    pub fn external_block_order(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.storage() == BlockStorage::External)
            .map(|(i, _)| i)
            .collect()
    }

    /// The source identifier written into an ndarray node for a block:
    /// the position among internal blocks, or `-1` for the streamed block.
    pub fn source_for_block(&self, index: usize) -> Result<i64> {
        let block = self.block(index)?;
        if block.storage() == BlockStorage::Streamed {
            return Ok(-1);
        }
        let order = self.internal_block_order();
        order
            .iter()
            .position(|&i| i == index)
            .map(|p| p as i64)
            .ok_or_else(|| AsdfError::Value(format!("block {} is not written to this file", index)))
    }

    /// The block for a non-negative source identifier.
    pub fn block_for_source(&self, source: i64) -> Result<usize> {
        if source < 0 {
            return self
                .streamed_block_index()
                .ok_or_else(|| AsdfError::Value("file has no streamed block".to_string()));
        }
        let order = self.internal_block_order();
        order
            .get(source as usize)
            .copied()
            .ok_or_else(|| AsdfError::Value(format!("block '{}' not found", source)))
    }

    /// Force a storage class onto every block (`all_array_storage`).
    pub fn apply_storage_override(&mut self, storage: BlockStorage) {
        for block in &mut self.blocks {
            block.set_storage(storage);
        }
    }

    /// Apply a compression label to every internal block, verifying a
    /// matching compressor is registered.
    pub fn apply_compression_override(&mut self, label: &str) -> Result<()> {
        let parsed = parse_label(label)?;
        if !self.compressors.contains(&parsed) {
            return Err(AsdfError::Value(format!(
                "all_array_compression '{}' requires a matching compressor plugin",
                label
            )));
        }
        for block in &mut self.blocks {
            if block.storage() == BlockStorage::Internal {
                block.set_compression(parsed);
            }
        }
        Ok(())
    }

    /// Drop blocks whose index is not in `used`, remapping key and
    /// identity bindings. Called after tree traversal decided which blocks
    /// the document still references.
    pub fn remove_unused(&mut self, used: &HashSet<usize>) {
        if used.len() == self.blocks.len() {
            return;
        }
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut kept = Vec::with_capacity(used.len());
        for (old_index, block) in self.blocks.drain(..).enumerate() {
            if used.contains(&old_index) {
                remap.insert(old_index, kept.len());
                kept.push(block);
            }
        }
        self.blocks = kept;
        self.key_to_block = self
            .key_to_block
            .drain()
            .filter_map(|(k, v)| remap.get(&v).map(|&nv| (k, nv)))
            .collect();
        let live_keys: HashSet<BlockKey> = self.key_to_block.keys().copied().collect();
        self.key_owner.retain(|k, _| live_keys.contains(k));
        self.identity_to_block = self
            .identity_to_block
            .drain()
            .filter_map(|(k, v)| remap.get(&v).map(|&nv| (k, nv)))
            .collect();
    }

    /// Reorder blocks by file offset (offset-less blocks last), remapping
    /// key and identity bindings. Called after an in-place update so that
    /// creation order matches file order again.
    pub fn sort_blocks_by_offset(&mut self) {
        let mut order: Vec<usize> = (0..self.blocks.len()).collect();
        order.sort_by_key(|&i| self.blocks[i].offset().unwrap_or(u64::MAX));
        let remap: HashMap<usize, usize> =
            order.iter().enumerate().map(|(new, &old)| (old, new)).collect();

        let mut reordered: Vec<Option<Block>> = self.blocks.drain(..).map(Some).collect();
        self.blocks = order
            .iter()
            .map(|&old| reordered[old].take().expect("each index moved once"))
            .collect();
        for index in self.key_to_block.values_mut() {
            *index = remap[index];
        }
        for index in self.identity_to_block.values_mut() {
            *index = remap[index];
        }
    }

    /// Enforce the single-streamed-block rule before writing.
    pub fn check_streamed_uniqueness(&self) -> Result<()> {
        let count = self
            .blocks
            .iter()
            .filter(|b| b.storage() == BlockStorage::Streamed)
            .count();
        if count > 1 {
            return Err(AsdfError::MultipleStreamedBlocks { count });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write path

    /// Write every internal block serially at the current position,
    /// zero-padding allocations, and return the offsets written.
    ///
    /// The streamed block, if any, is written last with an open header.
    pub fn write_blocks(&mut self, fd: &mut dyn GenericFile, pad_blocks: bool) -> Result<Vec<u64>> {
        self.check_streamed_uniqueness()?;
        let order = self.internal_block_order();
        let block_size = fd.block_size();
        let mut offsets = Vec::with_capacity(order.len());
        for index in order {
            let compressors = self.compressors.clone();
            let block = &mut self.blocks[index];
            offsets.push(fd.tell()?);
            if block.storage() == BlockStorage::Streamed {
                block.write(fd, &compressors)?;
                break;
            }
            // Force the payload first so the allocation can include padding
            // before the header goes out.
            block.prepare(&compressors)?;
            let padding = calculate_padding(block.used_size(), pad_blocks, block_size);
            block.set_allocated_size(block.used_size() + padding);
            block.write(fd, &compressors)?;
            fd.clear(padding)?;
        }
        Ok(offsets)
    }

    /// Write the index trailer for `offsets`, unless a streamed block is
    /// present or indexing is suppressed.
    pub fn write_index(&self, fd: &mut dyn GenericFile, offsets: &[u64]) -> Result<()> {
        if self.streamed_block_index().is_some() {
            return Ok(());
        }
        write_block_index(fd, offsets)
    }

    /// `true` if any payload is currently memory mapped.
    pub fn has_memmapped_payloads(&self) -> bool {
        self.blocks.iter().any(|b| b.is_memmapped())
    }

    /// The file handle blocks were read from, when reading from a file.
    pub fn fd(&self) -> Option<&SharedFile> {
        self.fd.as_ref()
    }

    /// Attach the file handle used for lazy reads.
    pub fn set_fd(&mut self, fd: SharedFile) {
        self.fd = Some(fd);
    }

    /// Generate the file name of the `index`-th external block for a main
    /// file called `filename`.
    pub fn external_filename(filename: &str, index: usize) -> String {
        let stem = match filename.rfind('.') {
            Some(dot) => &filename[..dot],
            None => filename,
        };
        format!("{}{:04}.asdf", stem, index)
    }
}

impl Default for BlockManager {
    fn default() -> Self {
        BlockManager::new()
    }
}
