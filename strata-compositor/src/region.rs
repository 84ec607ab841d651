//! The damage region accumulated over one compositing cycle.
//!
//! A coarse region: a chain of rectangles allocated from a [`BlockHeap`],
//! deduplicated by containment, that collapses to its bounding box when
//! the chain would grow past its arena capacity.  Exact region algebra is
//! a compositor-quality concern; the tracker only needs "what must be
//! recomposited" with no false negatives.

use strata_wire::Rect;

use crate::blockheap::{BlockHandle, BlockHeap};

struct RegionNode {
    rect: Rect,
    next: Option<BlockHandle>,
}

impl Default for RegionNode {
    fn default() -> RegionNode {
        RegionNode {
            rect: Rect::new(0, 0, 0, 0),
            next: None,
        }
    }
}

/// A set of dirty rectangles.
pub struct DirtyRegion {
    heap: BlockHeap<RegionNode>,
    head: Option<BlockHandle>,
    nr: usize,
    max_rects: usize,
    bound: Rect,
}

fn union(a: &Rect, b: &Rect) -> Rect {
    if a.is_empty() {
        return *b;
    }
    if b.is_empty() {
        return *a;
    }
    Rect::new(
        a.left.min(b.left),
        a.top.min(b.top),
        a.right.max(b.right),
        a.bottom.max(b.bottom),
    )
}

fn contains(outer: &Rect, inner: &Rect) -> bool {
    outer.left <= inner.left
        && outer.top <= inner.top
        && outer.right >= inner.right
        && outer.bottom >= inner.bottom
}

impl DirtyRegion {
    /// An empty region backed by an arena of `max_rects` nodes.
    pub fn new(max_rects: usize) -> DirtyRegion {
        DirtyRegion {
            heap: BlockHeap::new(max_rects),
            head: None,
            nr: 0,
            max_rects,
            bound: Rect::new(0, 0, 0, 0),
        }
    }

    /// Whether nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Bounding box of the region.
    pub fn bound(&self) -> Rect {
        self.bound
    }

    /// Empties the region, returning every node to the arena.
    pub fn clear(&mut self) {
        let mut cursor = self.head.take();
        while let Some(handle) = cursor {
            cursor = self.heap.get(handle).next;
            self.heap.free(handle);
        }
        self.nr = 0;
        self.bound = Rect::new(0, 0, 0, 0);
    }

    /// Adds a rectangle.  Rectangles already covered are dropped, and
    /// rectangles the new one covers are removed.
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        // Covered already?
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.heap.get(handle);
            if contains(&node.rect, &rect) {
                return;
            }
            cursor = node.next;
        }
        self.remove_contained_by(&rect);
        if self.nr >= self.max_rects {
            // Degrade to the bounding box rather than spill to the heap
            // every frame.
            let bound = union(&self.bound, &rect);
            self.clear();
            self.push(bound);
            return;
        }
        self.push(rect);
    }

    fn push(&mut self, rect: Rect) {
        let handle = self.heap.alloc();
        {
            let node = self.heap.get_mut(handle);
            node.rect = rect;
            node.next = self.head;
        }
        self.head = Some(handle);
        self.nr += 1;
        self.bound = union(&self.bound, &rect);
    }

    fn remove_contained_by(&mut self, rect: &Rect) {
        let mut cursor = self.head;
        let mut prev: Option<BlockHandle> = None;
        while let Some(handle) = cursor {
            let (covered, next) = {
                let node = self.heap.get(handle);
                (contains(rect, &node.rect), node.next)
            };
            if covered {
                match prev {
                    Some(p) => self.heap.get_mut(p).next = next,
                    None => self.head = next,
                }
                self.heap.free(handle);
                self.nr -= 1;
            } else {
                prev = Some(handle);
            }
            cursor = next;
        }
    }

    /// Whether `rect` touches the region.
    pub fn intersects(&self, rect: &Rect) -> bool {
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.heap.get(handle);
            if node.rect.intersects(rect) {
                return true;
            }
            cursor = node.next;
        }
        false
    }

    /// The current rectangles, in no particular order.
    pub fn rects(&self) -> Vec<Rect> {
        let mut out = Vec::with_capacity(self.nr);
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.heap.get(handle);
            out.push(node.rect);
            cursor = node.next;
        }
        out
    }
}

impl Drop for DirtyRegion {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_deduplicates_in_both_directions() {
        let mut region = DirtyRegion::new(8);
        region.add(Rect::new(0, 0, 100, 100));
        region.add(Rect::new(10, 10, 20, 20));
        assert_eq!(region.rects().len(), 1);

        // A bigger rect swallows the existing one.
        region.add(Rect::new(-10, -10, 200, 200));
        assert_eq!(region.rects().len(), 1);
        assert_eq!(region.bound(), Rect::new(-10, -10, 200, 200));
    }

    #[test]
    fn overflow_collapses_to_the_bounding_box() {
        let mut region = DirtyRegion::new(2);
        region.add(Rect::new(0, 0, 10, 10));
        region.add(Rect::new(20, 0, 30, 10));
        region.add(Rect::new(0, 20, 10, 30));
        let rects = region.rects();
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0], Rect::new(0, 0, 30, 30));
        // Never spilled to the heap fallback.
        assert_eq!(region.heap.fallback_count(), 0);
    }

    #[test]
    fn intersects_and_clear() {
        let mut region = DirtyRegion::new(4);
        region.add(Rect::new(0, 0, 10, 10));
        assert!(region.intersects(&Rect::new(5, 5, 6, 6)));
        assert!(!region.intersects(&Rect::new(50, 50, 60, 60)));
        region.clear();
        assert!(region.is_empty());
        assert!(region.bound().is_empty());
    }

    #[test]
    fn empty_rects_are_ignored() {
        let mut region = DirtyRegion::new(4);
        region.add(Rect::new(5, 5, 5, 10));
        assert!(region.is_empty());
    }
}
