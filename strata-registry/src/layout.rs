//! Fixed byte layout of a registry region.
//!
//! Region layout, in order: [`RegistryHeader`], popup-menu record array,
//! window record array, record usage bitmap (rounded up to a multiple of
//! 8 bytes), mask-rectangle usage bitmap, mask-rectangle array.  Every
//! offset is computed from the capacity and size fields in the header so
//! differently-sized layers share the same code.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use strata_shm::RegionLock;
use strata_wire::{Level, Rect, NR_LEVELS};

/// Value of [`RegistryHeader::magic`] for an initialized region.
pub const REGISTRY_MAGIC: u32 = 0x5a52_4547;

/// Default popup-record capacity.
pub const DEF_NR_POPUPS: u32 = 16;

/// Default per-level record capacities, highest level first.
pub const DEF_LEVEL_CAPACITY: [u32; NR_LEVELS] = [8, 16, 8, 8, 16, 128, 8];

/// Default mask-rectangle capacity.
pub const DEF_NR_MASK_RECTS: u32 = 1024;

const MAX_TOTAL_RECORDS: u32 = 32 * 1024;

fn round8(n: usize) -> usize {
    (n + 7) & !7
}

/// Per-arena capacities of a registry, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    /// Popup-menu record slots.
    pub popups: u32,
    /// Window record slots per level, highest level first.
    pub levels: [u32; NR_LEVELS],
    /// Mask-rectangle slots, including the reserved null slot 0.
    pub mask_rects: u32,
}

impl Default for Capacities {
    fn default() -> Capacities {
        Capacities {
            popups: DEF_NR_POPUPS,
            levels: DEF_LEVEL_CAPACITY,
            mask_rects: DEF_NR_MASK_RECTS,
        }
    }
}

impl Capacities {
    /// Replaces zero entries with the defaults and rounds every capacity
    /// up to a multiple of 8, the granularity of the usage bitmaps.
    pub fn normalized(&self) -> Capacities {
        let def = Capacities::default();
        let pick = |v: u32, d: u32| -> u32 {
            let v = if v == 0 { d } else { v };
            (v + 7) & !7
        };
        let mut levels = [0u32; NR_LEVELS];
        for (i, slot) in levels.iter_mut().enumerate() {
            *slot = pick(self.levels[i], def.levels[i]);
        }
        Capacities {
            popups: pick(self.popups, def.popups),
            levels,
            mask_rects: pick(self.mask_rects, def.mask_rects),
        }
    }

    /// Total window-record slots including the desktop sentinel.
    pub fn total_records(&self) -> u32 {
        1 + self.levels.iter().sum::<u32>()
    }

    /// Bytes a region built with these capacities occupies.
    pub fn region_size(&self) -> usize {
        RegionLayout::for_capacities(self).total
    }

    /// Whether the capacities are sane enough to build a region from.
    pub fn is_valid(&self) -> bool {
        self.total_records() <= MAX_TOTAL_RECORDS
            && self.popups <= MAX_TOTAL_RECORDS
            && self.mask_rects >= 8
            && self.mask_rects <= MAX_TOTAL_RECORDS
    }
}

bitflags! {
    /// Stacking flags of a window or popup record.  The record's priority
    /// level is carried separately in the high byte of the same word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ZNodeFlags: u32 {
        /// The record is visible.
        const VISIBLE = strata_wire::FLAG_VISIBLE;
        /// The record is disabled for input.
        const DISABLED = strata_wire::FLAG_DISABLED;
        /// The window is maximized.
        const MAXIMIZED = strata_wire::FLAG_MAXIMIZED;
        /// The window is minimized.
        const MINIMIZED = strata_wire::FLAG_MINIMIZED;
        /// A main window rather than a control shown as one.
        const MAINWIN = strata_wire::FLAG_MAINWIN;
        /// The desktop sentinel record at index 0.
        const DESKTOP = 0x0000_0100;
        /// A popup-menu record.
        const POPUP = 0x0000_0200;
    }
}

const LEVEL_SHIFT: u32 = 24;
const LEVEL_MASK: u32 = 0xff << LEVEL_SHIFT;

/// One record of the registry, describing a window or a popup menu.
///
/// `next`/`prev` are arena indices into the window-record array (0 is the
/// list terminator as well as the desktop sentinel, which never appears
/// inside a level list); `mask_rect` heads a chain in the mask-rect arena
/// (0 means "no mask, clip to `rect`").
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct ZNode {
    /// `ZNodeFlags` bits plus the level in the high byte.
    pub flags: u32,
    /// Display rectangle in screen coordinates.
    pub rect: Rect,
    /// Owning-client id; 0 is the server itself.
    pub client: i32,
    /// The owner's window handle, opaque to the server.
    pub window: u32,
    /// Owning main window when this record is a control shown as a main
    /// window; 0 otherwise.
    pub main_window: u32,
    /// Cached content-change counter, compared against the surface's live
    /// counter by the damage tracker.
    pub dirty_age: u32,
    /// Stacking generation, bumped whenever another record's mutation may
    /// have changed what this record occludes or reveals.
    pub age: u32,
    /// Nonzero while a compositor is reading the record; guards against
    /// teardown under its feet.
    pub lock_count: u32,
    /// Next record below in the same level, 0 at the tail.
    pub next: i32,
    /// Previous record above in the same level, 0 at the head.
    pub prev: i32,
    /// Head of this record's mask-rectangle chain, 0 for none.
    pub mask_rect: i32,
    reserved: [u32; 2],
    /// Opaque per-record slot for the active compositor.
    pub private_data: u64,
}

impl ZNode {
    /// The record's flags, level byte stripped.
    pub fn flags(&self) -> ZNodeFlags {
        ZNodeFlags::from_bits_truncate(self.flags & !LEVEL_MASK)
    }

    /// The record's priority level.
    pub fn level(&self) -> Option<Level> {
        Level::from_wire((self.flags & LEVEL_MASK) >> LEVEL_SHIFT)
    }

    /// Whether the record is currently shown.
    pub fn is_visible(&self) -> bool {
        self.flags().contains(ZNodeFlags::VISIBLE)
    }

    pub(crate) fn set_level(&mut self, level: Level) {
        self.flags = (self.flags & !LEVEL_MASK) | ((level as u32) << LEVEL_SHIFT);
    }

    pub(crate) fn set_flags(&mut self, flags: ZNodeFlags) {
        self.flags = (self.flags & LEVEL_MASK) | flags.bits();
    }
}

/// One slot of the mask-rectangle arena: a clip rectangle in
/// window-relative coordinates plus chain links.  Slot 0 is reserved as
/// the null chain terminator and never allocated.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct MaskRect {
    /// Left edge, inclusive, relative to the record's rectangle.
    pub left: i32,
    /// Top edge, inclusive.
    pub top: i32,
    /// Right edge, exclusive.
    pub right: i32,
    /// Bottom edge, exclusive.
    pub bottom: i32,
    /// Next rectangle in the chain, 0 at the tail.
    pub next: i32,
    /// Previous rectangle, 0 at the head.
    pub prev: i32,
}

impl MaskRect {
    /// Whether the window-relative point lies inside this rectangle.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// The header at offset 0 of every registry region.
///
/// Not `Pod`: it embeds the live cross-process lock and is only ever
/// accessed in place through the mapping.
#[repr(C)]
pub struct RegistryHeader {
    /// [`REGISTRY_MAGIC`] once initialized.
    pub magic: u32,
    /// Total region size in bytes.
    pub size: u32,
    /// Popup-record capacity.
    pub max_nr_popups: u32,
    /// Live popup count.  Popups form a stack: indices `0..nr_popups` are
    /// in use, bottom first, and closing one closes everything above it.
    pub nr_popups: u32,
    /// Per-level record capacity, highest level first.
    pub capacity: [u32; NR_LEVELS],
    /// Per-level live record count.
    pub count: [u32; NR_LEVELS],
    /// Head record of each level's list, 0 when empty.
    pub first: [i32; NR_LEVELS],
    /// Total window-record capacity including the desktop sentinel.
    pub max_nr_records: u32,
    /// Mask-rectangle capacity including the reserved null slot.
    pub max_nr_mask_rects: u32,
    /// Byte size of the record usage bitmap (multiple of 8).
    pub size_record_bitmap: u32,
    /// Byte size of the mask-rect usage bitmap (multiple of 8).
    pub size_mask_bitmap: u32,
    /// Index of the active window record, 0 for none.
    pub active: i32,
    reserved: u32,
    /// The cross-process lock serializing all access to the region.
    pub lock: RegionLock,
}

/// Resolved byte offsets of every region section.
#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    /// Offset of the popup record array.
    pub popups_off: usize,
    /// Offset of the window record array.
    pub records_off: usize,
    /// Offset of the record usage bitmap.
    pub record_bitmap_off: usize,
    /// Byte length of the record usage bitmap.
    pub record_bitmap_len: usize,
    /// Offset of the mask-rect usage bitmap.
    pub mask_bitmap_off: usize,
    /// Byte length of the mask-rect usage bitmap.
    pub mask_bitmap_len: usize,
    /// Offset of the mask-rectangle array.
    pub masks_off: usize,
    /// Total region size in bytes.
    pub total: usize,
    /// Popup-record capacity.
    pub max_nr_popups: usize,
    /// Window-record capacity including the sentinel.
    pub max_nr_records: usize,
    /// Mask-rectangle capacity.
    pub max_nr_masks: usize,
}

impl RegionLayout {
    /// Computes the layout a region with these capacities will have.
    pub fn for_capacities(caps: &Capacities) -> RegionLayout {
        let max_nr_popups = caps.popups as usize;
        let max_nr_records = caps.total_records() as usize;
        let max_nr_masks = caps.mask_rects as usize;
        Self::build(max_nr_popups, max_nr_records, max_nr_masks)
    }

    /// Recomputes the layout from an initialized header's size fields.
    pub fn from_header(header: &RegistryHeader) -> RegionLayout {
        Self::build(
            header.max_nr_popups as usize,
            header.max_nr_records as usize,
            header.max_nr_mask_rects as usize,
        )
    }

    fn build(max_nr_popups: usize, max_nr_records: usize, max_nr_masks: usize) -> RegionLayout {
        use std::mem::size_of;
        let popups_off = round8(size_of::<RegistryHeader>());
        let records_off = popups_off + max_nr_popups * size_of::<ZNode>();
        let record_bitmap_off = records_off + max_nr_records * size_of::<ZNode>();
        let record_bitmap_len = round8((max_nr_popups + max_nr_records).div_ceil(8));
        let mask_bitmap_off = record_bitmap_off + record_bitmap_len;
        let mask_bitmap_len = round8(max_nr_masks.div_ceil(8));
        let masks_off = mask_bitmap_off + mask_bitmap_len;
        let total = masks_off + max_nr_masks * size_of::<MaskRect>();
        RegionLayout {
            popups_off,
            records_off,
            record_bitmap_off,
            record_bitmap_len,
            mask_bitmap_off,
            mask_bitmap_len,
            masks_off,
            total,
            max_nr_popups,
            max_nr_records,
            max_nr_masks,
        }
    }

    /// Slot range of `level` in the window-record index space.  Index 0 is
    /// the sentinel; level ranges start at 1 and are laid out highest
    /// level first.
    pub fn level_range(&self, capacity: &[u32; NR_LEVELS], level: Level) -> std::ops::Range<usize> {
        let mut start = 1usize;
        for higher in Level::ALL.iter().take(level as usize) {
            start += capacity[*higher as usize] as usize;
        }
        start..start + capacity[level as usize] as usize
    }
}
