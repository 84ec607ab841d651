//! The registry proper: validated, locked operations over a mapped region.

use bytemuck::Zeroable;
use strata_shm::RegionLockGuard;
use strata_wire::{Level, Rect, NR_LEVELS};

use crate::bitmap;
use crate::layout::{
    Capacities, MaskRect, RegionLayout, RegistryHeader, ZNode, ZNodeFlags, REGISTRY_MAGIC,
};
use crate::RegistryError;

/// A z-order registry living in a mapped region.
///
/// The wrapper holds only the base pointer and the resolved layout; all
/// state lives in the region itself, so any process that maps the same
/// region sees the same registry.  Every public operation validates its
/// indices against the fixed capacities before touching memory and runs
/// under the region's embedded cross-process lock.
pub struct Registry {
    base: *mut u8,
    layout: RegionLayout,
}

// All region access happens under the embedded cross-process lock.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    /// Initializes a registry in a zeroed region of at least
    /// `caps.region_size()` bytes and returns a handle to it.
    ///
    /// The desktop sentinel (record 0) is allocated here, covering
    /// `desktop_rect`, and is never freed.
    ///
    /// # Safety
    ///
    /// `base` must point to a zeroed, 8-byte-aligned region of `len`
    /// bytes that no other process touches until this returns, and the
    /// region must outlive the returned handle.
    pub unsafe fn create_at(
        base: *mut u8,
        len: usize,
        caps: &Capacities,
        desktop_rect: Rect,
    ) -> Result<Registry, RegistryError> {
        if !caps.is_valid() {
            return Err(RegistryError::BadCapacity);
        }
        let layout = RegionLayout::for_capacities(caps);
        if layout.total > len {
            return Err(RegistryError::BadCapacity);
        }
        let registry = Registry { base, layout };

        let header = registry.hdr();
        header.size = layout.total as u32;
        header.max_nr_popups = caps.popups;
        header.capacity = caps.levels;
        header.max_nr_records = layout.max_nr_records as u32;
        header.max_nr_mask_rects = layout.max_nr_masks as u32;
        header.size_record_bitmap = layout.record_bitmap_len as u32;
        header.size_mask_bitmap = layout.mask_bitmap_len as u32;
        strata_shm::RegionLock::init_in_place(&mut header.lock)?;

        bitmap::fill_free(registry.record_bitmap());
        bitmap::fill_free(registry.mask_bitmap());
        // The desktop sentinel and the null mask slot are permanently
        // allocated.
        bitmap::take(registry.record_bitmap(), registry.record_slot(0));
        bitmap::take(registry.mask_bitmap(), 0);

        let desktop = registry.node(0);
        desktop.set_flags(ZNodeFlags::DESKTOP | ZNodeFlags::VISIBLE);
        desktop.set_level(Level::Launcher);
        desktop.rect = desktop_rect;

        header.magic = REGISTRY_MAGIC;
        log::debug!(
            "registry created: {} records, {} popups, {} mask rects, {} bytes",
            layout.max_nr_records,
            layout.max_nr_popups,
            layout.max_nr_masks,
            layout.total
        );
        Ok(registry)
    }

    /// Attaches to an already initialized region.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped region of `len` bytes that outlives
    /// the returned handle.
    pub unsafe fn open_at(base: *mut u8, len: usize) -> Result<Registry, RegistryError> {
        if len < std::mem::size_of::<RegistryHeader>() {
            return Err(RegistryError::BadRegion);
        }
        let header = &*(base as *const RegistryHeader);
        if header.magic != REGISTRY_MAGIC || header.size as usize > len {
            return Err(RegistryError::BadRegion);
        }
        let layout = RegionLayout::from_header(header);
        if layout.total != header.size as usize {
            return Err(RegistryError::BadRegion);
        }
        Ok(Registry { base, layout })
    }

    /// The resolved section layout.
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Tears the registry down: reports leaked slots and destroys the
    /// embedded lock.  Returns the number of leaked slots.
    ///
    /// # Safety
    ///
    /// No other process may still be using the region.
    pub unsafe fn destroy(&self) -> usize {
        let leaked = self.leak_count();
        if leaked != 0 {
            log::warn!("registry torn down with {} slots still in use", leaked);
            debug_assert_eq!(leaked, 0, "registry torn down with slots still in use");
        }
        strata_shm::RegionLock::destroy_in_place(&mut self.hdr().lock);
        leaked
    }

    /// Number of allocated slots other than the permanent sentinels.
    pub fn leak_count(&self) -> usize {
        unsafe {
            let header = self.hdr();
            let records = bitmap::count_used(
                self.record_bitmap(),
                self.record_slot(1)..self.record_slot(self.layout.max_nr_records),
            );
            let popups = header.nr_popups as usize;
            let masks = bitmap::count_used(self.mask_bitmap(), 1..self.layout.max_nr_masks);
            records + popups + masks
        }
    }

    // Raw section accessors.  Callers hold the region lock and must not
    // let two mutable borrows of the same slot coexist.

    #[allow(clippy::mut_from_ref)]
    unsafe fn hdr(&self) -> &mut RegistryHeader {
        &mut *(self.base as *mut RegistryHeader)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn node(&self, idx: usize) -> &mut ZNode {
        debug_assert!(idx < self.layout.max_nr_records);
        &mut *(self
            .base
            .add(self.layout.records_off + idx * std::mem::size_of::<ZNode>())
            as *mut ZNode)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn popup(&self, idx: usize) -> &mut ZNode {
        debug_assert!(idx < self.layout.max_nr_popups);
        &mut *(self
            .base
            .add(self.layout.popups_off + idx * std::mem::size_of::<ZNode>())
            as *mut ZNode)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn mask(&self, idx: usize) -> &mut MaskRect {
        debug_assert!(idx != 0 && idx < self.layout.max_nr_masks);
        &mut *(self
            .base
            .add(self.layout.masks_off + idx * std::mem::size_of::<MaskRect>())
            as *mut MaskRect)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn record_bitmap(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.base.add(self.layout.record_bitmap_off),
            self.layout.record_bitmap_len,
        )
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn mask_bitmap(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.base.add(self.layout.mask_bitmap_off),
            self.layout.mask_bitmap_len,
        )
    }

    /// Position of window record `idx` in the shared usage bitmap, which
    /// covers popups first and records after them.
    fn record_slot(&self, idx: usize) -> usize {
        self.layout.max_nr_popups + idx
    }

    fn lock_excl(&self) -> Result<RegionLockGuard<'_>, RegistryError> {
        unsafe { self.hdr() }.lock.acquire().map_err(RegistryError::Lock)
    }

    fn lock_shared(&self) -> Result<RegionLockGuard<'_>, RegistryError> {
        unsafe { self.hdr() }
            .lock
            .acquire_shared()
            .map_err(RegistryError::Lock)
    }

    /// Validates a non-sentinel record index against capacity and the
    /// usage bitmap.  Lock must be held.
    fn check_record(&self, idx: i32) -> Result<usize, RegistryError> {
        let i = idx as usize;
        if idx <= 0
            || i >= self.layout.max_nr_records
            || !bitmap::is_used(unsafe { self.record_bitmap() }, self.record_slot(i))
        {
            return Err(RegistryError::InvalidIndex(idx));
        }
        Ok(i)
    }

    /// The level a record index belongs to, by its slot sub-range.
    fn level_of(&self, idx: usize) -> Result<Level, RegistryError> {
        let capacity = unsafe { self.hdr() }.capacity;
        for level in Level::ALL {
            if self.layout.level_range(&capacity, level).contains(&idx) {
                return Ok(level);
            }
        }
        Err(RegistryError::InvalidIndex(idx as i32))
    }

    fn first_at_or_below(&self, start: usize) -> i32 {
        let header = unsafe { self.hdr() };
        for level in &Level::ALL[start..] {
            let first = header.first[*level as usize];
            if first != 0 {
                return first;
            }
        }
        0
    }

    fn tail_of(&self, level: Level) -> i32 {
        let mut idx = unsafe { self.hdr() }.first[level as usize];
        if idx == 0 {
            return 0;
        }
        loop {
            let next = unsafe { self.node(idx as usize) }.next;
            if next == 0 {
                return idx;
            }
            idx = next;
        }
    }

    fn next_locked(&self, from: i32) -> Result<i32, RegistryError> {
        if from <= 0 {
            return Ok(self.first_at_or_below(0));
        }
        let i = self.check_record(from)?;
        let next = unsafe { self.node(i) }.next;
        if next != 0 {
            return Ok(next);
        }
        let level = self.level_of(i)?;
        Ok(self.first_at_or_below(level as usize + 1))
    }

    fn prev_locked(&self, from: i32) -> Result<i32, RegistryError> {
        if from <= 0 {
            for level in Level::ALL.iter().rev() {
                let tail = self.tail_of(*level);
                if tail != 0 {
                    return Ok(tail);
                }
            }
            return Ok(0);
        }
        let i = self.check_record(from)?;
        let prev = unsafe { self.node(i) }.prev;
        if prev != 0 {
            return Ok(prev);
        }
        let level = self.level_of(i)?;
        for higher in Level::ALL[..level as usize].iter().rev() {
            let tail = self.tail_of(*higher);
            if tail != 0 {
                return Ok(tail);
            }
        }
        Ok(0)
    }

    /// Returns the record strictly below `from` in full stacking order,
    /// skipping nothing.  `from <= 0` starts at the very top; 0 means the
    /// desktop was reached.
    pub fn next(&self, from: i32) -> Result<i32, RegistryError> {
        let _guard = self.lock_shared()?;
        self.next_locked(from)
    }

    /// Returns the record strictly above `from`.  `from <= 0` starts at
    /// the very bottom; 0 means the top was passed.
    pub fn prev(&self, from: i32) -> Result<i32, RegistryError> {
        let _guard = self.lock_shared()?;
        self.prev_locked(from)
    }

    /// Bumps the stacking generation of every visible record below
    /// `above` whose rectangle intersects `rect`, the desktop included.
    /// Lock must be held.
    fn age_overlapped_below(&self, above: i32, rect: &Rect) -> Result<(), RegistryError> {
        let mut idx = above;
        loop {
            idx = self.next_locked(idx)?;
            if idx == 0 {
                break;
            }
            let node = unsafe { self.node(idx as usize) };
            if node.is_visible() && node.rect.intersects(rect) {
                node.age = node.age.wrapping_add(1);
            }
        }
        let desktop = unsafe { self.node(0) };
        if desktop.rect.intersects(rect) {
            desktop.age = desktop.age.wrapping_add(1);
        }
        Ok(())
    }

    fn unlink(&self, idx: usize) -> Result<(), RegistryError> {
        let level = self.level_of(idx)?;
        let (prev, next) = {
            let node = unsafe { self.node(idx) };
            (node.prev, node.next)
        };
        if prev != 0 {
            unsafe { self.node(prev as usize) }.next = next;
        } else {
            unsafe { self.hdr() }.first[level as usize] = next;
        }
        if next != 0 {
            unsafe { self.node(next as usize) }.prev = prev;
        }
        Ok(())
    }

    fn link_at_head(&self, idx: usize, level: Level) {
        let header = unsafe { self.hdr() };
        let old_first = header.first[level as usize];
        {
            let node = unsafe { self.node(idx) };
            node.next = old_first;
            node.prev = 0;
        }
        if old_first != 0 {
            unsafe { self.node(old_first as usize) }.prev = idx as i32;
        }
        header.first[level as usize] = idx as i32;
    }

    /// Allocates a record in `level` and links it at the top of that
    /// level.  Fails with [`RegistryError::LevelFull`] when the level's
    /// slot sub-range is exhausted.
    pub fn alloc_record(
        &self,
        level: Level,
        flags: ZNodeFlags,
        rect: Rect,
        client: i32,
        window: u32,
        main_window: u32,
    ) -> Result<i32, RegistryError> {
        let _guard = self.lock_excl()?;
        let range = {
            let header = unsafe { self.hdr() };
            self.layout.level_range(&header.capacity, level)
        };
        let slot_range = self.record_slot(range.start)..self.record_slot(range.end);
        let slot = bitmap::alloc_in(unsafe { self.record_bitmap() }, slot_range)
            .ok_or(RegistryError::LevelFull(level))?;
        let idx = slot - self.layout.max_nr_popups;

        {
            let node = unsafe { self.node(idx) };
            *node = ZNode::zeroed();
            node.set_level(level);
            node.set_flags(flags & !(ZNodeFlags::DESKTOP | ZNodeFlags::POPUP));
            node.rect = rect;
            node.client = client;
            node.window = window;
            node.main_window = main_window;
        }
        self.link_at_head(idx, level);
        unsafe { self.hdr() }.count[level as usize] += 1;

        if flags.contains(ZNodeFlags::VISIBLE) {
            self.age_overlapped_below(idx as i32, &rect)?;
        }
        log::trace!("record {} allocated at level {:?}", idx, level);
        Ok(idx as i32)
    }

    /// Frees a record: unlinks it, releases its mask-rect chain, clears
    /// the active reference if it pointed here, and returns the slot.
    /// The desktop sentinel is refused.
    pub fn free_record(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = self.check_record(idx)?;
        let level = self.level_of(i)?;
        let (rect, was_visible, mask_head) = {
            let node = unsafe { self.node(i) };
            if node.lock_count > 0 {
                return Err(RegistryError::Locked(idx));
            }
            (node.rect, node.is_visible(), node.mask_rect)
        };
        // Capture the record below before the links are gone; it anchors
        // the reveal walk.
        let below = self.next_locked(idx)?;
        self.free_mask_chain(mask_head);
        self.unlink(i)?;
        let header = unsafe { self.hdr() };
        header.count[level as usize] -= 1;
        if header.active == idx {
            header.active = 0;
        }
        *unsafe { self.node(i) } = ZNode::zeroed();
        bitmap::free(unsafe { self.record_bitmap() }, self.record_slot(i));
        if was_visible {
            // `below` was captured before the unlink and is still valid;
            // everything it reveals gets its generation bumped.
            self.reveal_walk(below, &rect)?;
        }
        log::trace!("record {} freed from level {:?}", idx, level);
        Ok(())
    }

    /// Bumps everything at or below `from` that intersects `rect`.
    fn reveal_walk(&self, from: i32, rect: &Rect) -> Result<(), RegistryError> {
        let mut idx = from;
        while idx != 0 {
            let node = unsafe { self.node(idx as usize) };
            if node.is_visible() && node.rect.intersects(rect) {
                node.age = node.age.wrapping_add(1);
            }
            idx = self.next_locked(idx)?;
        }
        let desktop = unsafe { self.node(0) };
        if desktop.rect.intersects(rect) {
            desktop.age = desktop.age.wrapping_add(1);
        }
        Ok(())
    }

    /// Raises a record to the top of its level.  Raising the current top
    /// is a no-op.
    pub fn move_to_top(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = self.check_record(idx)?;
        let level = self.level_of(i)?;
        if unsafe { self.hdr() }.first[level as usize] == idx {
            return Ok(());
        }
        self.unlink(i)?;
        self.link_at_head(i, level);
        let (rect, visible) = {
            let node = unsafe { self.node(i) };
            (node.rect, node.is_visible())
        };
        if visible {
            let node = unsafe { self.node(i) };
            node.age = node.age.wrapping_add(1);
            self.age_overlapped_below(idx, &rect)?;
        }
        Ok(())
    }

    /// Makes `idx` the active record (0 clears).  Returns the previous
    /// active record.
    pub fn set_active(&self, idx: i32) -> Result<i32, RegistryError> {
        let _guard = self.lock_excl()?;
        if idx != 0 {
            self.check_record(idx)?;
        }
        let header = unsafe { self.hdr() };
        let old = header.active;
        header.active = idx;
        Ok(old)
    }

    /// Shows or hides a record.  Returns whether the visibility actually
    /// changed.
    pub fn set_visible(&self, idx: i32, visible: bool) -> Result<bool, RegistryError> {
        let _guard = self.lock_excl()?;
        let i = self.check_record(idx)?;
        let (rect, changed) = {
            let node = unsafe { self.node(i) };
            if node.is_visible() == visible {
                (node.rect, false)
            } else {
                let mut flags = node.flags();
                flags.set(ZNodeFlags::VISIBLE, visible);
                node.set_flags(flags);
                node.age = node.age.wrapping_add(1);
                (node.rect, true)
            }
        };
        if changed {
            self.age_overlapped_below(idx, &rect)?;
        }
        Ok(changed)
    }

    fn free_mask_chain(&self, head: i32) {
        let mut idx = head;
        while idx > 0 && (idx as usize) < self.layout.max_nr_masks {
            let next = {
                let mask = unsafe { self.mask(idx as usize) };
                let next = mask.next;
                *mask = MaskRect::zeroed();
                next
            };
            bitmap::free(unsafe { self.mask_bitmap() }, idx as usize);
            idx = next;
        }
    }

    /// Replaces a record's mask-rectangle chain.  An empty slice removes
    /// the mask (the record clips to its rectangle).  On arena exhaustion
    /// the old chain is already gone and the record is left unmasked.
    pub fn set_mask_rects(&self, idx: i32, rects: &[Rect]) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = self.check_record(idx)?;
        let old_head = unsafe { self.node(i) }.mask_rect;
        self.free_mask_chain(old_head);
        unsafe { self.node(i) }.mask_rect = 0;

        let mut head = 0i32;
        let mut tail = 0i32;
        for rect in rects {
            let slot = match bitmap::alloc_in(unsafe { self.mask_bitmap() }, 1..self.layout.max_nr_masks) {
                Some(slot) => slot as i32,
                None => {
                    self.free_mask_chain(head);
                    return Err(RegistryError::Exhausted);
                }
            };
            {
                let mask = unsafe { self.mask(slot as usize) };
                *mask = MaskRect {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                    next: 0,
                    prev: tail,
                };
            }
            if tail != 0 {
                unsafe { self.mask(tail as usize) }.next = slot;
            } else {
                head = slot;
            }
            tail = slot;
        }
        let node = unsafe { self.node(i) };
        node.mask_rect = head;
        node.age = node.age.wrapping_add(1);
        Ok(())
    }

    /// Copies out a record.  Index 0 returns the desktop sentinel.
    pub fn record(&self, idx: i32) -> Result<ZNode, RegistryError> {
        let _guard = self.lock_shared()?;
        if idx == 0 {
            return Ok(*unsafe { self.node(0) });
        }
        let i = self.check_record(idx)?;
        Ok(*unsafe { self.node(i) })
    }

    /// Hit-tests the stacking order: the topmost visible record whose
    /// rectangle (and mask chain, if present) contains the point, or 0
    /// for the desktop.
    pub fn record_at_point(&self, x: i32, y: i32) -> Result<i32, RegistryError> {
        let _guard = self.lock_shared()?;
        let mut idx = self.next_locked(0)?;
        while idx != 0 {
            let node = unsafe { self.node(idx as usize) };
            if node.is_visible() && node.rect.contains(x, y) {
                if node.mask_rect == 0 {
                    return Ok(idx);
                }
                // Mask rects are window relative.
                let (wx, wy) = (x - node.rect.left, y - node.rect.top);
                let mut mask_idx = node.mask_rect;
                while mask_idx != 0 {
                    let mask = unsafe { self.mask(mask_idx as usize) };
                    if mask.contains(wx, wy) {
                        return Ok(idx);
                    }
                    mask_idx = mask.next;
                }
            }
            idx = self.next_locked(idx)?;
        }
        Ok(0)
    }

    /// Walks the stacking order top to bottom, desktop excluded, stopping
    /// early when `f` returns false.
    pub fn walk_records(
        &self,
        mut f: impl FnMut(i32, &ZNode) -> bool,
    ) -> Result<(), RegistryError> {
        let _guard = self.lock_shared()?;
        let mut idx = self.next_locked(0)?;
        while idx != 0 {
            let node = *unsafe { self.node(idx as usize) };
            if !f(idx, &node) {
                break;
            }
            idx = self.next_locked(idx)?;
        }
        Ok(())
    }

    /// Pushes a popup record on top of the popup stack.
    pub fn alloc_popup(
        &self,
        flags: ZNodeFlags,
        rect: Rect,
        client: i32,
        window: u32,
    ) -> Result<i32, RegistryError> {
        let _guard = self.lock_excl()?;
        let header = unsafe { self.hdr() };
        let idx = header.nr_popups as usize;
        if idx >= self.layout.max_nr_popups {
            return Err(RegistryError::Exhausted);
        }
        bitmap::take(unsafe { self.record_bitmap() }, idx);
        header.nr_popups += 1;
        let node = unsafe { self.popup(idx) };
        *node = ZNode::zeroed();
        node.set_flags((flags & !ZNodeFlags::DESKTOP) | ZNodeFlags::POPUP);
        node.rect = rect;
        node.client = client;
        node.window = window;
        Ok(idx as i32)
    }

    /// Pops popup `idx` and everything stacked above it.
    pub fn free_popup(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let header = unsafe { self.hdr() };
        let i = idx as usize;
        if idx < 0 || i >= header.nr_popups as usize {
            return Err(RegistryError::InvalidIndex(idx));
        }
        for popup in (i..header.nr_popups as usize).rev() {
            *unsafe { self.popup(popup) } = ZNode::zeroed();
            bitmap::free(unsafe { self.record_bitmap() }, popup);
        }
        header.nr_popups = i as u32;
        Ok(())
    }

    /// Copies one live popup record out of the stack.
    pub fn popup_record(&self, idx: i32) -> Result<ZNode, RegistryError> {
        let _guard = self.lock_shared()?;
        if idx < 0 || idx as usize >= unsafe { self.hdr() }.nr_popups as usize {
            return Err(RegistryError::InvalidIndex(idx));
        }
        Ok(*unsafe { self.popup(idx as usize) })
    }

    /// Walks live popup records top of stack first.
    pub fn walk_popups(
        &self,
        mut f: impl FnMut(i32, &ZNode) -> bool,
    ) -> Result<(), RegistryError> {
        let _guard = self.lock_shared()?;
        let nr = unsafe { self.hdr() }.nr_popups as usize;
        for idx in (0..nr).rev() {
            let node = *unsafe { self.popup(idx) };
            if !f(idx as i32, &node) {
                break;
            }
        }
        Ok(())
    }

    /// Updates the cached content counter of a record (or the desktop).
    pub fn set_record_dirty_age(&self, idx: i32, age: u32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = if idx == 0 { 0 } else { self.check_record(idx)? };
        unsafe { self.node(i) }.dirty_age = age;
        Ok(())
    }

    /// Updates the cached content counter of a popup record.
    pub fn set_popup_dirty_age(&self, idx: i32, age: u32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        if idx < 0 || idx as usize >= unsafe { self.hdr() }.nr_popups as usize {
            return Err(RegistryError::InvalidIndex(idx));
        }
        unsafe { self.popup(idx as usize) }.dirty_age = age;
        Ok(())
    }

    /// Brackets a compositor read of a record, so teardown can tell the
    /// record is in use.
    pub fn lock_record(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = if idx == 0 { 0 } else { self.check_record(idx)? };
        let node = unsafe { self.node(i) };
        node.lock_count += 1;
        Ok(())
    }

    /// Releases a compositor read bracket.
    pub fn unlock_record(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = if idx == 0 { 0 } else { self.check_record(idx)? };
        let node = unsafe { self.node(i) };
        node.lock_count = node.lock_count.saturating_sub(1);
        Ok(())
    }

    /// Drops every read bracket on a record.  Teardown only.
    fn clear_lock(&self, idx: i32) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = self.check_record(idx)?;
        unsafe { self.node(i) }.lock_count = 0;
        Ok(())
    }

    /// Stores a compositor's opaque per-record word.
    pub fn set_private_data(&self, idx: i32, data: u64) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let i = if idx == 0 { 0 } else { self.check_record(idx)? };
        unsafe { self.node(i) }.private_data = data;
        Ok(())
    }

    /// Clears every record's and popup's private-data word, handing each
    /// nonzero value to `f` so the outgoing compositor can release what it
    /// stored there.
    pub fn purge_private_data(&self, mut f: impl FnMut(i32, u64)) -> Result<(), RegistryError> {
        let _guard = self.lock_excl()?;
        let header = unsafe { self.hdr() };
        for idx in 0..self.layout.max_nr_records {
            if !bitmap::is_used(unsafe { self.record_bitmap() }, self.record_slot(idx)) {
                continue;
            }
            let node = unsafe { self.node(idx) };
            if node.private_data != 0 {
                f(idx as i32, node.private_data);
                node.private_data = 0;
            }
        }
        for idx in 0..header.nr_popups as usize {
            let node = unsafe { self.popup(idx) };
            if node.private_data != 0 {
                f(idx as i32, node.private_data);
                node.private_data = 0;
            }
        }
        Ok(())
    }

    /// Frees every record owned by `client`, calling `f` with each freed
    /// index first.  Used on client disconnect.
    pub fn free_client_records(
        &self,
        client: i32,
        mut f: impl FnMut(i32, &ZNode),
    ) -> Result<usize, RegistryError> {
        let mut doomed = Vec::new();
        self.walk_records(|idx, node| {
            if node.client == client {
                doomed.push((idx, *node));
            }
            true
        })?;
        for (idx, node) in &doomed {
            f(*idx, node);
            if node.lock_count > 0 {
                // The owner is gone; a leftover read bracket must not
                // keep the record alive forever.
                log::warn!("record {} still locked at client teardown", idx);
                self.clear_lock(*idx)?;
            }
            self.free_record(*idx)?;
        }
        Ok(doomed.len())
    }

    /// Per-level live record counts, highest level first.
    pub fn counts(&self) -> Result<[u32; NR_LEVELS], RegistryError> {
        let _guard = self.lock_shared()?;
        Ok(unsafe { self.hdr() }.count)
    }

    /// The active record index, 0 for none.
    pub fn active(&self) -> Result<i32, RegistryError> {
        let _guard = self.lock_shared()?;
        Ok(unsafe { self.hdr() }.active)
    }

    /// Live popup count.
    pub fn popup_count(&self) -> Result<u32, RegistryError> {
        let _guard = self.lock_shared()?;
        Ok(unsafe { self.hdr() }.nr_popups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapRegion;

    const DESKTOP: Rect = Rect::new(0, 0, 1024, 768);

    struct Fixture {
        _region: HeapRegion,
        registry: Registry,
    }

    fn fixture(caps: Capacities) -> Fixture {
        let mut region = HeapRegion::new(caps.region_size());
        let registry = unsafe {
            Registry::create_at(region.as_mut_ptr(), region.len(), &caps, DESKTOP).unwrap()
        };
        Fixture {
            _region: region,
            registry,
        }
    }

    fn small_caps() -> Capacities {
        Capacities {
            popups: 4,
            levels: [2, 2, 2, 2, 4, 4, 2],
            mask_rects: 8,
        }
    }

    fn alloc(registry: &Registry, level: Level, rect: Rect) -> i32 {
        registry
            .alloc_record(level, ZNodeFlags::VISIBLE, rect, 1, 0, 0)
            .unwrap()
    }

    #[test]
    fn level_exhaustion_and_slot_reuse() {
        let caps = Capacities {
            levels: [2, 2, 2, 2, 2, 4, 2],
            ..small_caps()
        };
        let f = fixture(caps);
        let rect = Rect::new(0, 0, 10, 10);
        let mut indices = Vec::new();
        for _ in 0..4 {
            indices.push(alloc(&f.registry, Level::Normal, rect));
        }
        assert!(matches!(
            f.registry.alloc_record(Level::Normal, ZNodeFlags::VISIBLE, rect, 1, 0, 0),
            Err(RegistryError::LevelFull(Level::Normal))
        ));
        // Another level is unaffected.
        alloc(&f.registry, Level::Topmost, rect);

        f.registry.free_record(indices[1]).unwrap();
        let reused = alloc(&f.registry, Level::Normal, rect);
        assert_eq!(reused, indices[1]);
    }

    #[test]
    fn stacking_order_crosses_levels_high_to_low() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let normal = alloc(&f.registry, Level::Normal, rect);
        let docker = alloc(&f.registry, Level::Docker, rect);
        let topmost = alloc(&f.registry, Level::Topmost, rect);
        let tooltip = alloc(&f.registry, Level::Tooltip, rect);

        let mut order = Vec::new();
        let mut idx = f.registry.next(0).unwrap();
        while idx != 0 {
            order.push(idx);
            idx = f.registry.next(idx).unwrap();
        }
        assert_eq!(order, vec![tooltip, docker, topmost, normal]);

        // Upward traversal is the exact reverse.
        let mut upward = Vec::new();
        let mut idx = f.registry.prev(0).unwrap();
        while idx != 0 {
            upward.push(idx);
            idx = f.registry.prev(idx).unwrap();
        }
        order.reverse();
        assert_eq!(upward, order);
    }

    #[test]
    fn traversal_is_symmetric() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        for level in [Level::Global, Level::Topmost, Level::Normal, Level::Normal] {
            alloc(&f.registry, level, rect);
        }
        let mut idx = f.registry.next(0).unwrap();
        while idx != 0 {
            let below = f.registry.next(idx).unwrap();
            if below != 0 {
                assert_eq!(f.registry.prev(below).unwrap(), idx);
            }
            idx = below;
        }
    }

    #[test]
    fn move_to_top_reorders_within_the_level_only() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let a = alloc(&f.registry, Level::Normal, rect);
        let b = alloc(&f.registry, Level::Normal, rect);
        let c = alloc(&f.registry, Level::Normal, rect);
        let top = alloc(&f.registry, Level::Topmost, rect);

        // Stack is top, c, b, a.  Raise a.
        f.registry.move_to_top(a).unwrap();
        assert_eq!(f.registry.next(top).unwrap(), a);
        assert_eq!(f.registry.next(a).unwrap(), c);
        assert_eq!(f.registry.next(c).unwrap(), b);
        assert_eq!(f.registry.next(b).unwrap(), 0);

        // Raising the top of a level changes nothing.
        f.registry.move_to_top(a).unwrap();
        assert_eq!(f.registry.next(top).unwrap(), a);
    }

    #[test]
    fn invalid_indices_are_hard_errors() {
        let f = fixture(small_caps());
        assert!(matches!(
            f.registry.next(9999),
            Err(RegistryError::InvalidIndex(9999))
        ));
        assert!(matches!(
            f.registry.free_record(0),
            Err(RegistryError::InvalidIndex(0))
        ));
        // A slot that was never allocated is stale even when in range.
        assert!(matches!(
            f.registry.move_to_top(3),
            Err(RegistryError::InvalidIndex(3))
        ));
        let idx = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 5, 5));
        f.registry.free_record(idx).unwrap();
        assert!(matches!(
            f.registry.free_record(idx),
            Err(RegistryError::InvalidIndex(_))
        ));
    }

    #[test]
    fn capacity_counts_stay_within_bounds() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let a = alloc(&f.registry, Level::Normal, rect);
        alloc(&f.registry, Level::Normal, rect);
        let counts = f.registry.counts().unwrap();
        assert_eq!(counts[Level::Normal as usize], 2);
        f.registry.free_record(a).unwrap();
        assert_eq!(f.registry.counts().unwrap()[Level::Normal as usize], 1);
    }

    #[test]
    fn freeing_everything_leaves_no_leaks() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let a = alloc(&f.registry, Level::Normal, rect);
        let b = alloc(&f.registry, Level::Docker, rect);
        f.registry
            .set_mask_rects(a, &[Rect::new(0, 0, 5, 5), Rect::new(5, 5, 10, 10)])
            .unwrap();
        let p = f.registry.alloc_popup(ZNodeFlags::VISIBLE, rect, 1, 0).unwrap();
        assert!(f.registry.leak_count() > 0);
        f.registry.free_popup(p).unwrap();
        f.registry.free_record(a).unwrap();
        f.registry.free_record(b).unwrap();
        assert_eq!(f.registry.leak_count(), 0);
    }

    #[test]
    fn mask_chain_exhaustion_rolls_back() {
        // mask_rects = 8 leaves 7 usable slots after the null sentinel.
        let f = fixture(small_caps());
        let idx = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 100, 100));
        let many: Vec<Rect> = (0..10).map(|i| Rect::new(i, i, i + 1, i + 1)).collect();
        assert!(matches!(
            f.registry.set_mask_rects(idx, &many),
            Err(RegistryError::Exhausted)
        ));
        assert_eq!(f.registry.record(idx).unwrap().mask_rect, 0);
        // Nothing stuck in the mask arena.
        f.registry.free_record(idx).unwrap();
        assert_eq!(f.registry.leak_count(), 0);
    }

    #[test]
    fn hit_testing_respects_stacking_visibility_and_masks() {
        let f = fixture(small_caps());
        let below = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 100, 100));
        let above = alloc(&f.registry, Level::Normal, Rect::new(50, 50, 150, 150));

        assert_eq!(f.registry.record_at_point(60, 60).unwrap(), above);
        assert_eq!(f.registry.record_at_point(10, 10).unwrap(), below);
        assert_eq!(f.registry.record_at_point(500, 500).unwrap(), 0);

        // Punch a hole: the upper window only covers its left half.
        f.registry
            .set_mask_rects(above, &[Rect::new(0, 0, 50, 100)])
            .unwrap();
        assert_eq!(f.registry.record_at_point(120, 60).unwrap(), below);
        assert_eq!(f.registry.record_at_point(60, 60).unwrap(), above);

        f.registry.set_visible(above, false).unwrap();
        assert_eq!(f.registry.record_at_point(60, 60).unwrap(), below);
    }

    #[test]
    fn freeing_the_active_record_clears_active() {
        let f = fixture(small_caps());
        let idx = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 10, 10));
        assert_eq!(f.registry.set_active(idx).unwrap(), 0);
        assert_eq!(f.registry.active().unwrap(), idx);
        f.registry.free_record(idx).unwrap();
        assert_eq!(f.registry.active().unwrap(), 0);
    }

    #[test]
    fn occlusion_changes_bump_stacking_generations() {
        let f = fixture(small_caps());
        let under = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 100, 100));
        let age_before = f.registry.record(under).unwrap().age;
        // An overlapping window appears above it.
        let over = alloc(&f.registry, Level::Normal, Rect::new(50, 50, 80, 80));
        assert_eq!(f.registry.record(under).unwrap().age, age_before + 1);
        // A disjoint window does not touch it.
        alloc(&f.registry, Level::Normal, Rect::new(500, 500, 600, 600));
        assert_eq!(f.registry.record(under).unwrap().age, age_before + 1);
        // Removing the overlap reveals it again.
        f.registry.free_record(over).unwrap();
        assert_eq!(f.registry.record(under).unwrap().age, age_before + 2);
    }

    #[test]
    fn popups_stack_and_pop_together() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let p0 = f.registry.alloc_popup(ZNodeFlags::VISIBLE, rect, 1, 10).unwrap();
        let p1 = f.registry.alloc_popup(ZNodeFlags::VISIBLE, rect, 1, 11).unwrap();
        let p2 = f.registry.alloc_popup(ZNodeFlags::VISIBLE, rect, 1, 12).unwrap();
        assert_eq!((p0, p1, p2), (0, 1, 2));

        let mut seen = Vec::new();
        f.registry
            .walk_popups(|idx, node| {
                seen.push((idx, node.window));
                true
            })
            .unwrap();
        assert_eq!(seen, vec![(2, 12), (1, 11), (0, 10)]);

        // Closing the middle popup closes the one above it too.
        f.registry.free_popup(p1).unwrap();
        assert_eq!(f.registry.popup_count().unwrap(), 1);
    }

    #[test]
    fn locked_records_refuse_teardown() {
        let f = fixture(small_caps());
        let idx = alloc(&f.registry, Level::Normal, Rect::new(0, 0, 10, 10));
        f.registry.lock_record(idx).unwrap();
        assert!(matches!(
            f.registry.free_record(idx),
            Err(RegistryError::Locked(_))
        ));
        // Still fully usable while bracketed.
        assert!(f.registry.record(idx).is_ok());

        f.registry.unlock_record(idx).unwrap();
        f.registry.free_record(idx).unwrap();
        assert!(matches!(
            f.registry.record(idx),
            Err(RegistryError::InvalidIndex(_))
        ));
    }

    #[test]
    fn disconnect_sweep_clears_leftover_brackets() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let mine = f
            .registry
            .alloc_record(Level::Normal, ZNodeFlags::VISIBLE, rect, 7, 1, 0)
            .unwrap();
        f.registry.lock_record(mine).unwrap();

        // The owner died without unlocking; the sweep must not wedge.
        let n = f.registry.free_client_records(7, |_, _| {}).unwrap();
        assert_eq!(n, 1);
        assert!(matches!(
            f.registry.record(mine),
            Err(RegistryError::InvalidIndex(_))
        ));
    }

    #[test]
    fn disconnect_sweep_frees_only_that_clients_records() {
        let f = fixture(small_caps());
        let rect = Rect::new(0, 0, 10, 10);
        let mine = f
            .registry
            .alloc_record(Level::Normal, ZNodeFlags::VISIBLE, rect, 7, 1, 0)
            .unwrap();
        let other = f
            .registry
            .alloc_record(Level::Normal, ZNodeFlags::VISIBLE, rect, 8, 2, 0)
            .unwrap();
        let mut freed = Vec::new();
        let n = f
            .registry
            .free_client_records(7, |idx, _| freed.push(idx))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(freed, vec![mine]);
        assert!(f.registry.record(other).is_ok());
        assert!(matches!(
            f.registry.record(mine),
            Err(RegistryError::InvalidIndex(_))
        ));
    }

    #[test]
    fn reopening_a_region_sees_the_same_registry() {
        let caps = small_caps();
        let mut region = HeapRegion::new(caps.region_size());
        let base = region.as_mut_ptr();
        let len = region.len();
        let created =
            unsafe { Registry::create_at(base, len, &caps, DESKTOP).unwrap() };
        let idx = alloc(&created, Level::Normal, Rect::new(1, 2, 3, 4));

        let reopened = unsafe { Registry::open_at(base, len).unwrap() };
        let node = reopened.record(idx).unwrap();
        assert_eq!(node.rect, Rect::new(1, 2, 3, 4));
        assert_eq!(reopened.layout().total, created.layout().total);
    }

    #[test]
    fn open_rejects_foreign_regions() {
        let mut region = HeapRegion::new(4096);
        assert!(matches!(
            unsafe { Registry::open_at(region.as_mut_ptr(), region.len()) },
            Err(RegistryError::BadRegion)
        ));
    }

    #[test]
    fn bad_capacities_are_rejected() {
        let caps = Capacities {
            mask_rects: 2,
            ..small_caps()
        };
        let mut region = HeapRegion::new(1 << 20);
        assert!(matches!(
            unsafe { Registry::create_at(region.as_mut_ptr(), region.len(), &caps, DESKTOP) },
            Err(RegistryError::BadCapacity)
        ));
        // A region too small for the capacities is refused too.
        let caps = small_caps();
        let mut tiny = HeapRegion::new(64);
        assert!(matches!(
            unsafe { Registry::create_at(tiny.as_mut_ptr(), tiny.len(), &caps, DESKTOP) },
            Err(RegistryError::BadCapacity)
        ));
    }
}
