//! Slot usage bitmaps.
//!
//! A set bit marks a FREE slot; the bitmaps are filled with 0xFF when a
//! region is created and bits are cleared as slots are handed out.  Bit
//! `i` of the map is bit `i & 7` of byte `i >> 3`, lowest bit first.
//!
//! These helpers operate on raw bitmap bytes inside a shared region; the
//! caller holds the region lock.

use std::ops::Range;

/// Marks every slot free.
pub fn fill_free(bitmap: &mut [u8]) {
    bitmap.fill(0xff);
}

/// Whether `slot` is currently allocated.
pub fn is_used(bitmap: &[u8], slot: usize) -> bool {
    bitmap[slot >> 3] & (1u8 << (slot & 7)) == 0
}

/// Allocates the first free slot in `range`, clearing its bit.  Returns
/// `None` when every slot in the range is in use.
pub fn alloc_in(bitmap: &mut [u8], range: Range<usize>) -> Option<usize> {
    for slot in range {
        let byte = &mut bitmap[slot >> 3];
        let bit = 1u8 << (slot & 7);
        if *byte & bit != 0 {
            *byte &= !bit;
            return Some(slot);
        }
    }
    None
}

/// Marks `slot` allocated.  Returns false if it already was.
pub fn take(bitmap: &mut [u8], slot: usize) -> bool {
    let byte = &mut bitmap[slot >> 3];
    let bit = 1u8 << (slot & 7);
    if *byte & bit == 0 {
        return false;
    }
    *byte &= !bit;
    true
}

/// Frees `slot`, setting its bit.  Returns false if the slot was already
/// free, which indicates a double free by the caller.
pub fn free(bitmap: &mut [u8], slot: usize) -> bool {
    let byte = &mut bitmap[slot >> 3];
    let bit = 1u8 << (slot & 7);
    if *byte & bit != 0 {
        return false;
    }
    *byte |= bit;
    true
}

/// Number of allocated slots in `range`.
pub fn count_used(bitmap: &[u8], range: Range<usize>) -> usize {
    range.filter(|&slot| is_used(bitmap, slot)).count()
}
