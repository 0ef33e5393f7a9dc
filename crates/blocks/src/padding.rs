//! Block allocation padding policy.

/// Compute padding for a block of `content_size` bytes.
///
/// Without `pad_blocks` the allocation equals the content. With it, the
/// content is grown by ten percent for in-place update headroom and the
/// result is rounded up to the next filesystem-block-size multiple; the
/// returned value is the difference from `content_size`.
pub fn calculate_padding(content_size: u64, pad_blocks: bool, block_size: u64) -> u64 {
    if !pad_blocks {
        return 0;
    }
    let block_size = block_size.max(1);
    let grown = content_size + (content_size + 9) / 10;
    let padded = (grown + block_size - 1) / block_size * block_size;
    padded.saturating_sub(content_size)
}
