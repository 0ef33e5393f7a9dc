//! In-place update: reuse the existing block layout where possible.
//!
//! Given a file whose tree has been mutated, the layout pass keeps every
//! block that already has an offset in place, fits new blocks into the free
//! gaps first-fit, and lets the tree grow into the leading free space. If
//! that fails the caller falls back to a serial rewrite.

use std::io::SeekFrom;

use tracing::debug;

use asdf_core::constants::BLOCK_HEADER_BOILERPLATE_SIZE;
use asdf_core::{AsdfError, BlockStorage, Result};
use asdf_io::GenericFile;

use crate::manager::BlockManager;
use crate::padding::calculate_padding;

#[derive(Debug, Clone, Copy)]
struct Entry {
    start: u64,
    end: u64,
    index: usize,
}

/// Assign offsets to the manager's free internal blocks, keeping blocks
/// that already have offsets fixed in place.
///
/// Returns `false` when no usable layout exists (no fixed blocks to anchor
/// on, or the tree has grown over the first fixed block, which cannot be
/// moved while views may be mapped onto it).
pub fn calculate_updated_layout(
    manager: &mut BlockManager,
    tree_size: u64,
    pad_blocks: bool,
    block_size: u64,
) -> bool {
    let mut fixed: Vec<Entry> = Vec::new();
    let mut free: Vec<usize> = Vec::new();

    for (index, block) in manager.blocks().iter().enumerate() {
        if block.storage() != BlockStorage::Internal {
            continue;
        }
        match block.offset() {
            Some(start) => fixed.push(Entry {
                start,
                end: start + block.size_on_disk(),
                index,
            }),
            None => free.push(index),
        }
    }

    if fixed.is_empty() {
        return false;
    }
    fixed.sort_by_key(|e| e.start);

    if fixed[0].start < tree_size {
        // Fixed blocks cannot be moved out of the tree's way.
        debug!(
            tree_size,
            first_block = fixed[0].start,
            "tree has grown over the first block, falling back to rewrite"
        );
        return false;
    }

    while let Some(index) = free.pop() {
        let size = manager.blocks()[index].size_on_disk();
        let mut last_end = tree_size;
        let mut placed_at = None;
        for entry in &fixed {
            if entry.start.saturating_sub(last_end) >= size {
                placed_at = Some(last_end);
                break;
            }
            last_end = entry.end;
        }
        let offset = placed_at.unwrap_or_else(|| {
            let last = fixed.last().expect("fixed is nonempty");
            let padding = calculate_padding(
                manager.blocks()[last.index].used_size(),
                pad_blocks,
                block_size,
            );
            last.end + padding
        });

        if let Ok(block) = manager.block_mut(index) {
            block.set_offset(Some(offset));
        }
        fixed.push(Entry {
            start: offset,
            end: offset + size,
            index,
        });
        fixed.sort_by_key(|e| e.start);
    }

    if let Some(streamed) = manager.streamed_block_index() {
        let last = fixed.last().expect("fixed is nonempty");
        let padding = calculate_padding(
            manager.blocks()[last.index].used_size(),
            pad_blocks,
            block_size,
        );
        if let Ok(block) = manager.block_mut(streamed) {
            if block.offset().is_none() {
                block.set_offset(Some(last.end + padding));
            }
        }
    }

    true
}

/// Write internal blocks at their assigned offsets.
///
/// Allocations are recomputed to fill the gaps between consecutive blocks.
/// Blocks flagged in `dirty` are fully rewritten (header, payload, zeroed
/// padding); clean blocks are left untouched unless their allocation
/// changed, in which case only the header is refreshed. Returns the block
/// offsets in ascending order and the end of the written region.
pub fn write_blocks_fixed(
    manager: &mut BlockManager,
    fd: &mut dyn GenericFile,
    tree_end: u64,
    pad_blocks: bool,
    dirty: &[bool],
) -> Result<(Vec<u64>, u64)> {
    let mut order: Vec<usize> = manager
        .blocks()
        .iter()
        .enumerate()
        .filter(|(_, b)| b.storage() == BlockStorage::Internal)
        .map(|(i, _)| i)
        .collect();
    order.sort_by_key(|&i| manager.blocks()[i].offset());

    let first_offset = match order.first() {
        Some(&i) => manager.blocks()[i]
            .offset()
            .ok_or_else(|| AsdfError::Value("update layout left a block unplaced".to_string()))?,
        None => return Ok((Vec::new(), tree_end)),
    };

    // Clear the slack between the tree and the first block so stale block
    // magic does not confuse a later scan.
    fd.seek(SeekFrom::Start(tree_end))?;
    fd.clear(first_offset.saturating_sub(tree_end))?;

    let block_size = fd.block_size();
    let compressors = manager.compressors().clone();
    let mut offsets = Vec::with_capacity(order.len());
    let mut end_of_blocks = tree_end;

    for (pos, &index) in order.iter().enumerate() {
        let next_start = order
            .get(pos + 1)
            .and_then(|&next| manager.blocks()[next].offset());
        let is_dirty = dirty.get(index).copied().unwrap_or(true);

        let block = manager.block_mut(index)?;
        let offset = block
            .offset()
            .ok_or_else(|| AsdfError::Value("update layout left a block unplaced".to_string()))?;
        offsets.push(offset);

        if is_dirty {
            // Buffer the payload before any bytes of the region are
            // overwritten.
            block.prepare(&compressors)?;
        }

        let header_footprint =
            BLOCK_HEADER_BOILERPLATE_SIZE as u64 + asdf_core::constants::BLOCK_HEADER_SIZE as u64;
        let allocation = match next_start {
            Some(next) => next
                .checked_sub(offset + header_footprint)
                .ok_or_else(|| AsdfError::Value("update layout produced overlapping blocks".to_string()))?,
            None => {
                let padding = calculate_padding(block.used_size(), pad_blocks, block_size);
                block.used_size() + padding
            }
        };
        if allocation < block.used_size() {
            return Err(AsdfError::Value(
                "update layout produced a gap smaller than its block".to_string(),
            ));
        }

        let allocation_changed = block.allocated_size() != allocation;
        if is_dirty {
            block.set_allocated_size(allocation);
            fd.seek(SeekFrom::Start(offset))?;
            block.write(fd, &compressors)?;
            fd.clear(allocation - block.used_size())?;
        } else if allocation_changed {
            block.set_allocated_size(allocation);
            fd.seek(SeekFrom::Start(offset))?;
            block.write(fd, &compressors)?;
            fd.seek(SeekFrom::Start(offset + header_footprint + allocation))?;
        }

        end_of_blocks = offset + header_footprint + allocation;
    }

    Ok((offsets, end_of_blocks))
}
