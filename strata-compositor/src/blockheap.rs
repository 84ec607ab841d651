//! A fixed-capacity typed arena with a usage bitmap and a tracked heap
//! fallback.
//!
//! Same allocation discipline as the registry's slot bitmaps (a set bit
//! is a free slot), but for in-process objects: when the arena runs out,
//! allocation falls back to the general heap and a leak counter keeps
//! score.  Freeing tells the two apart by handle range.  Dropping the
//! heap with anything still allocated is a bookkeeping bug in the caller:
//! it logs a warning, and asserts in debug builds.

/// Handle to an allocated block.
pub type BlockHandle = usize;

/// The arena.  `T: Default` so slots can be recycled in place.
pub struct BlockHeap<T: Default> {
    arena: Box<[T]>,
    bitmap: Box<[u8]>,
    fallback: Vec<Option<Box<T>>>,
    nr_fallback: usize,
}

impl<T: Default> BlockHeap<T> {
    /// An arena of `capacity` slots.
    pub fn new(capacity: usize) -> BlockHeap<T> {
        let arena = (0..capacity).map(|_| T::default()).collect();
        BlockHeap {
            arena,
            bitmap: vec![0xffu8; capacity.div_ceil(8)].into_boxed_slice(),
            fallback: Vec::new(),
            nr_fallback: 0,
        }
    }

    /// Allocates a block.  Arena first; heap with leak tracking when the
    /// arena is exhausted.
    pub fn alloc(&mut self) -> BlockHandle {
        for slot in 0..self.arena.len() {
            let byte = &mut self.bitmap[slot >> 3];
            let bit = 1u8 << (slot & 7);
            if *byte & bit != 0 {
                *byte &= !bit;
                return slot;
            }
        }
        self.nr_fallback += 1;
        for (pos, entry) in self.fallback.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(Box::default());
                return self.arena.len() + pos;
            }
        }
        self.fallback.push(Some(Box::default()));
        self.arena.len() + self.fallback.len() - 1
    }

    /// Frees a block.  A handle inside the arena range releases the slot
    /// bit; anything above it is a fallback block.
    pub fn free(&mut self, handle: BlockHandle) {
        if handle < self.arena.len() {
            self.arena[handle] = T::default();
            let byte = &mut self.bitmap[handle >> 3];
            let bit = 1u8 << (handle & 7);
            debug_assert_eq!(*byte & bit, 0, "double free of arena block");
            *byte |= bit;
        } else {
            let pos = handle - self.arena.len();
            if self.fallback[pos].take().is_some() {
                self.nr_fallback -= 1;
            } else {
                debug_assert!(false, "double free of fallback block");
            }
        }
    }

    /// Borrows a block.
    pub fn get(&self, handle: BlockHandle) -> &T {
        if handle < self.arena.len() {
            &self.arena[handle]
        } else {
            self.fallback[handle - self.arena.len()]
                .as_deref()
                .expect("stale block handle")
        }
    }

    /// Mutably borrows a block.
    pub fn get_mut(&mut self, handle: BlockHandle) -> &mut T {
        if handle < self.arena.len() {
            &mut self.arena[handle]
        } else {
            self.fallback[handle - self.arena.len()]
                .as_deref_mut()
                .expect("stale block handle")
        }
    }

    /// Blocks handed out from the heap fallback and not yet freed.
    pub fn fallback_count(&self) -> usize {
        self.nr_fallback
    }

    /// Arena slots currently allocated.
    pub fn used_count(&self) -> usize {
        (0..self.arena.len())
            .filter(|slot| self.bitmap[slot >> 3] & (1u8 << (slot & 7)) == 0)
            .count()
    }
}

impl<T: Default> Drop for BlockHeap<T> {
    fn drop(&mut self) {
        let used = self.used_count();
        if used != 0 || self.nr_fallback != 0 {
            log::warn!(
                "block heap dropped with {} arena blocks and {} fallback blocks live",
                used,
                self.nr_fallback
            );
            debug_assert!(
                false,
                "block heap dropped with live blocks ({} arena, {} fallback)",
                used, self.nr_fallback
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_first_then_fallback() {
        let mut heap: BlockHeap<u64> = BlockHeap::new(2);
        let a = heap.alloc();
        let b = heap.alloc();
        assert!(a < 2 && b < 2);
        assert_eq!(heap.fallback_count(), 0);

        let c = heap.alloc();
        assert!(c >= 2);
        assert_eq!(heap.fallback_count(), 1);

        *heap.get_mut(c) = 7;
        assert_eq!(*heap.get(c), 7);

        heap.free(c);
        assert_eq!(heap.fallback_count(), 0);
        heap.free(a);
        heap.free(b);
        assert_eq!(heap.used_count(), 0);
    }

    #[test]
    fn freed_arena_slots_are_preferred_over_fallback() {
        let mut heap: BlockHeap<u32> = BlockHeap::new(1);
        let a = heap.alloc();
        let spill = heap.alloc();
        heap.free(a);
        // The arena slot is free again, so the next alloc must not spill.
        let again = heap.alloc();
        assert_eq!(again, a);
        heap.free(again);
        heap.free(spill);
    }

    #[test]
    #[should_panic(expected = "live blocks")]
    #[cfg(debug_assertions)]
    fn dropping_with_live_blocks_asserts_in_debug() {
        let mut heap: BlockHeap<u32> = BlockHeap::new(1);
        let _leak = heap.alloc();
        drop(heap);
    }
}
