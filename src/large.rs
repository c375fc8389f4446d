//! Large blocks. Anything above the configured threshold skips regions and
//! gets a standalone anonymous mapping:
//!
//! ```text
//! base          base + 12   base + 16                         base + size
//! +--------------+----------+----------------------------------+
//! |    unused    | tag word |             payload              |
//! +--------------+----------+----------------------------------+
//!  <-------- prelude ------->
//! ```
//!
//! The tag sits in the last word of a 16-byte prelude, so
//! [`Block::from_payload`] works on large payloads exactly like on region
//! payloads and `release` can tell the two apart by the large bit. Unlike a
//! region block, the size stored here is the *total* mapping size, which is
//! what `munmap` needs. Large blocks never appear on free lists and never
//! coalesce.

use std::ptr::NonNull;

use crate::{
    block::{Block, Word, ALIGNMENT, LARGE, USED, WORD_SIZE},
    platform,
};

/// Bytes between the mapping base and the payload.
pub(crate) const PRELUDE_SIZE: usize = 16;

/// The size field shares its word with the flag nibble, so this is the
/// biggest mapping a tag can describe.
const MAX_MAPPING_SIZE: usize = (Word::MAX & !0xf) as usize;

/// Maps a block big enough for `size` payload bytes. Returns `None` when the
/// OS refuses memory or the total would overflow the tag's size field.
pub(crate) unsafe fn acquire(size: usize) -> Option<Block> {
    let rounded = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    let total = rounded.checked_add(PRELUDE_SIZE)?;
    if total > MAX_MAPPING_SIZE {
        return None;
    }

    let address = platform::request_memory(total)?;

    let header = NonNull::new_unchecked(address.as_ptr().add(PRELUDE_SIZE - WORD_SIZE));
    let block = Block::from_header(header);
    block.set_header_word(total, USED | LARGE);

    Some(block)
}

/// Unmaps a large block. The tag holds the total mapping size.
pub(crate) unsafe fn release(block: Block) {
    let base = block.as_ptr().sub(PRELUDE_SIZE - WORD_SIZE);
    let length = block.size();
    platform::return_memory(NonNull::new_unchecked(base), length);
}
