//! The built-in compositor.  Always registered, never unregisterable,
//! and the one selected at startup: plain painter's-algorithm composition
//! of the stacking order into a [`FrameBuffer`], optionally fanned out
//! over a [`TaskPool`] in horizontal bands.

use std::sync::Arc;

use strata_registry::ZNode;
use strata_tasks::{split_rect, TaskPool, MAX_SPLIT_BANDS};
use strata_wire::Rect;

use crate::framebuffer::FrameBuffer;
use crate::ops::{CompositorContext, CompositorOps};
use crate::region::DirtyRegion;

/// Solid color painted where no window covers the desktop.
const DESKTOP_COLOR: u32 = 0xff30_3a46;

/// Arena capacity of the per-cycle dirty region.
const MAX_DIRTY_RECTS: usize = 32;

/// The default painter.
pub struct FallbackCompositor {
    frame: Arc<FrameBuffer>,
    pool: Option<Arc<TaskPool>>,
    dirty: DirtyRegion,
}

impl FallbackCompositor {
    /// A fallback compositor drawing into `frame`.  With a pool, each
    /// composite pass splits its area into one band per slice.
    pub fn new(frame: Arc<FrameBuffer>, pool: Option<Arc<TaskPool>>) -> FallbackCompositor {
        FallbackCompositor {
            frame,
            pool,
            dirty: DirtyRegion::new(MAX_DIRTY_RECTS),
        }
    }

    /// Bounding box of the damage accumulated so far.
    pub fn dirty_bound(&self) -> Rect {
        self.dirty.bound()
    }

    /// Adds a record's surface damage, translated to screen space.  A
    /// surface whose rect list overflowed reports whole-surface damage.
    fn merge_record(&mut self, ctx: &CompositorContext<'_>, node: &ZNode) {
        let Some(surface) = ctx.surfaces.surface_for(node) else {
            return;
        };
        match surface.dirty_rects() {
            None => self.dirty.add(node.rect),
            Some(rects) => {
                for r in rects {
                    let screen = Rect::new(
                        node.rect.left + r.left,
                        node.rect.top + r.top,
                        (node.rect.left + r.right).min(node.rect.right),
                        (node.rect.top + r.bottom).min(node.rect.bottom),
                    );
                    self.dirty.add(screen);
                }
            }
        }
    }

    /// Repaints `area`: desktop color first, then every visible surface
    /// bottom-up, each clipped to `area`.
    fn paint(&self, ctx: &CompositorContext<'_>, area: Rect) {
        if area.is_empty() {
            return;
        }

        // Stacking order, top first, flipped to bottom-up for painting.
        // Popups sit above every window level, so they go in first and
        // come out last after the flip.
        let mut stack: Vec<ZNode> = Vec::new();
        let _ = ctx.registry.walk_popups(|_, node| {
            if node.is_visible() && node.rect.intersects(&area) {
                stack.push(*node);
            }
            true
        });
        let _ = ctx.registry.walk_records(|_, node| {
            if node.is_visible() && node.rect.intersects(&area) {
                stack.push(*node);
            }
            true
        });

        let draws: Vec<(Rect, &strata_shm::Surface)> = stack
            .iter()
            .rev()
            .filter_map(|node| ctx.surfaces.surface_for(node).map(|s| (node.rect, s)))
            .collect();
        let wallpaper = ctx.surfaces.wallpaper();

        let paint_band = |band: &Rect| {
            match wallpaper {
                Some(surface) => self.frame.blit(surface, band.left, band.top, band),
                None => self.frame.fill_rect(band, DESKTOP_COLOR),
            }
            for (rect, surface) in &draws {
                let dst = Rect::new(
                    rect.left.max(band.left),
                    rect.top.max(band.top),
                    rect.right.min(band.right),
                    rect.bottom.min(band.bottom),
                );
                if dst.is_empty() {
                    continue;
                }
                self.frame
                    .blit(surface, dst.left - rect.left, dst.top - rect.top, &dst);
            }
        };

        match &self.pool {
            Some(pool) if pool.concurrency() > 1 => {
                // split_rect only takes power-of-two band counts.
                let conc = pool.concurrency().min(MAX_SPLIT_BANDS);
                let nr = if conc >= 8 {
                    8
                } else if conc >= 4 {
                    4
                } else {
                    2
                };
                let mut bands = [Rect::new(0, 0, 0, 0); MAX_SPLIT_BANDS];
                let nr = split_rect(&area, nr, &mut bands);
                if nr <= 1 {
                    paint_band(&area);
                    return;
                }
                pool.run(&|slice| {
                    if slice < nr {
                        paint_band(&bands[slice]);
                    }
                });
            }
            _ => paint_band(&area),
        }
    }
}

impl CompositorOps for FallbackCompositor {
    fn name(&self) -> &str {
        "fallback"
    }

    fn initialize(&mut self, _ctx: &CompositorContext<'_>) {
        self.dirty.clear();
    }

    fn terminate(&mut self, _ctx: &CompositorContext<'_>) {
        self.dirty.clear();
    }

    fn refresh(&mut self, ctx: &CompositorContext<'_>) {
        self.dirty.clear();
        self.paint(ctx, ctx.screen_rect);
    }

    fn reset_dirty_region(&mut self, _ctx: &CompositorContext<'_>) {
        self.dirty.clear();
    }

    fn merge_dirty_ppp(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        match ctx.registry.popup_record(idx) {
            Ok(node) => self.merge_record(ctx, &node),
            Err(err) => log::debug!("merge_dirty_ppp({}): {}", idx, err),
        }
    }

    fn merge_dirty_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        match ctx.registry.record(idx) {
            Ok(node) => self.merge_record(ctx, &node),
            Err(err) => log::debug!("merge_dirty_win({}): {}", idx, err),
        }
    }

    fn merge_dirty_wpp(&mut self, ctx: &CompositorContext<'_>) {
        self.dirty.add(ctx.screen_rect);
    }

    fn composite_layers(&mut self, ctx: &CompositorContext<'_>) {
        self.paint(ctx, self.dirty.bound());
    }

    fn on_moved_win(&mut self, ctx: &CompositorContext<'_>, idx: i32, old: Rect) {
        self.dirty.add(old);
        if let Ok(node) = ctx.registry.record(idx) {
            self.dirty.add(node.rect);
        }
    }

    fn on_showing_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        if let Ok(node) = ctx.registry.record(idx) {
            self.dirty.add(node.rect);
        }
    }

    fn on_hiding_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        if let Ok(node) = ctx.registry.record(idx) {
            self.dirty.add(node.rect);
        }
    }

    fn on_raised_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        if let Ok(node) = ctx.registry.record(idx) {
            self.dirty.add(node.rect);
        }
    }

    fn on_closed_menu(&mut self, _ctx: &CompositorContext<'_>, rect: Rect) {
        self.dirty.add(rect);
    }

    fn on_changed_rgn(&mut self, ctx: &CompositorContext<'_>, idx: i32) {
        if let Ok(node) = ctx.registry.record(idx) {
            self.dirty.add(node.rect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::SurfaceProvider;
    use std::collections::HashMap;
    use strata_registry::{Capacities, HeapRegion, Registry, ZNodeFlags};
    use strata_shm::Surface;
    use strata_wire::Level;

    #[derive(Default)]
    struct MapProvider {
        by_window: HashMap<u32, Surface>,
    }

    impl SurfaceProvider for MapProvider {
        fn surface_for(&self, record: &ZNode) -> Option<&Surface> {
            self.by_window.get(&record.window)
        }
        fn wallpaper(&self) -> Option<&Surface> {
            None
        }
    }

    struct Fixture {
        _region: HeapRegion,
        registry: Registry,
        provider: MapProvider,
    }

    fn fixture() -> Fixture {
        let caps = Capacities::default();
        let mut region = HeapRegion::new(caps.region_size());
        let registry = unsafe {
            Registry::create_at(
                region.as_mut_ptr(),
                region.len(),
                &caps,
                Rect::new(0, 0, 64, 64),
            )
            .unwrap()
        };
        Fixture {
            _region: region,
            registry,
            provider: MapProvider::default(),
        }
    }

    fn solid_surface(tag: &str, w: u32, h: u32, color: u32) -> Surface {
        let name = format!(
            "/strata-fallback-{}-{}-{:?}",
            tag,
            std::process::id(),
            std::thread::current().id()
        );
        let surface = Surface::create(&name, w, h).unwrap();
        unsafe {
            let px = surface.pixels().cast::<u32>();
            for i in 0..(w * h) as usize {
                px.add(i).write(color);
            }
        }
        surface
    }

    fn ctx<'a>(f: &'a Fixture) -> CompositorContext<'a> {
        CompositorContext {
            registry: &f.registry,
            surfaces: &f.provider,
            screen_rect: Rect::new(0, 0, 64, 64),
        }
    }

    #[test]
    fn surface_damage_lands_in_screen_space() {
        let mut f = fixture();
        let idx = f
            .registry
            .alloc_record(
                Level::Normal,
                ZNodeFlags::VISIBLE,
                Rect::new(10, 10, 26, 26),
                1,
                7,
                0,
            )
            .unwrap();
        f.provider.by_window.insert(7, solid_surface("damage", 16, 16, 1));
        f.provider.by_window[&7].mark_dirty(Rect::new(0, 0, 8, 8));

        let frame = Arc::new(FrameBuffer::new(64, 64));
        let mut comp = FallbackCompositor::new(frame, None);
        comp.merge_dirty_win(&ctx(&f), idx);
        assert_eq!(comp.dirty_bound(), Rect::new(10, 10, 18, 18));

        // A stale index merges nothing.
        comp.reset_dirty_region(&ctx(&f));
        comp.merge_dirty_win(&ctx(&f), idx + 1);
        assert!(comp.dirty_bound().is_empty());
    }

    #[test]
    fn refresh_paints_desktop_and_windows() {
        let mut f = fixture();
        f.registry
            .alloc_record(
                Level::Normal,
                ZNodeFlags::VISIBLE,
                Rect::new(8, 8, 24, 24),
                1,
                7,
                0,
            )
            .unwrap();
        f.provider
            .by_window
            .insert(7, solid_surface("refresh", 16, 16, 0xffaa_0000));

        let frame = Arc::new(FrameBuffer::new(64, 64));
        let mut comp = FallbackCompositor::new(Arc::clone(&frame), None);
        comp.refresh(&ctx(&f));

        assert_eq!(frame.pixel(0, 0), DESKTOP_COLOR);
        assert_eq!(frame.pixel(8, 8), 0xffaa_0000);
        assert_eq!(frame.pixel(23, 23), 0xffaa_0000);
        assert_eq!(frame.pixel(24, 24), DESKTOP_COLOR);
    }

    #[test]
    fn stacking_order_decides_overlap() {
        let mut f = fixture();
        let below = f
            .registry
            .alloc_record(
                Level::Normal,
                ZNodeFlags::VISIBLE,
                Rect::new(0, 0, 32, 32),
                1,
                1,
                0,
            )
            .unwrap();
        f.registry
            .alloc_record(
                Level::Normal,
                ZNodeFlags::VISIBLE,
                Rect::new(16, 16, 48, 48),
                1,
                2,
                0,
            )
            .unwrap();
        f.provider
            .by_window
            .insert(1, solid_surface("below", 32, 32, 0xff00_0011));
        f.provider
            .by_window
            .insert(2, solid_surface("above", 32, 32, 0xff00_0022));

        let frame = Arc::new(FrameBuffer::new(64, 64));
        let mut comp = FallbackCompositor::new(Arc::clone(&frame), None);
        comp.refresh(&ctx(&f));
        assert_eq!(frame.pixel(20, 20), 0xff00_0022);

        // Raising the lower window flips the overlap.
        f.registry.move_to_top(below).unwrap();
        comp.refresh(&ctx(&f));
        assert_eq!(frame.pixel(20, 20), 0xff00_0011);
        assert_eq!(frame.pixel(40, 40), 0xff00_0022);
    }

    #[test]
    fn banded_composition_matches_serial() {
        let mut f = fixture();
        f.registry
            .alloc_record(
                Level::Normal,
                ZNodeFlags::VISIBLE,
                Rect::new(5, 3, 37, 61),
                1,
                7,
                0,
            )
            .unwrap();
        f.provider
            .by_window
            .insert(7, solid_surface("banded", 32, 58, 0xff12_3456));

        let serial_frame = Arc::new(FrameBuffer::new(64, 64));
        let mut serial = FallbackCompositor::new(Arc::clone(&serial_frame), None);
        serial.refresh(&ctx(&f));

        let pool = Arc::new(TaskPool::new(3));
        let banded_frame = Arc::new(FrameBuffer::new(64, 64));
        let mut banded = FallbackCompositor::new(Arc::clone(&banded_frame), Some(pool));
        banded.refresh(&ctx(&f));

        for y in 0..64 {
            for x in 0..64 {
                assert_eq!(serial_frame.pixel(x, y), banded_frame.pixel(x, y));
            }
        }
    }

    #[test]
    fn popups_paint_over_windows() {
        let mut f = fixture();
        f.registry
            .alloc_record(
                Level::Tooltip,
                ZNodeFlags::VISIBLE,
                Rect::new(0, 0, 32, 32),
                1,
                1,
                0,
            )
            .unwrap();
        f.registry
            .alloc_popup(ZNodeFlags::VISIBLE, Rect::new(8, 8, 16, 16), 1, 2)
            .unwrap();
        f.provider
            .by_window
            .insert(1, solid_surface("win", 32, 32, 0xff00_00aa));
        f.provider
            .by_window
            .insert(2, solid_surface("ppp", 8, 8, 0xff00_00bb));

        let frame = Arc::new(FrameBuffer::new(64, 64));
        let mut comp = FallbackCompositor::new(Arc::clone(&frame), None);
        comp.refresh(&ctx(&f));
        assert_eq!(frame.pixel(10, 10), 0xff00_00bb);
        assert_eq!(frame.pixel(2, 2), 0xff00_00aa);

        // A popup pushed later sits above the earlier one.
        f.registry
            .alloc_popup(ZNodeFlags::VISIBLE, Rect::new(8, 8, 16, 16), 1, 3)
            .unwrap();
        f.provider
            .by_window
            .insert(3, solid_surface("ppp2", 8, 8, 0xff00_00cc));
        comp.refresh(&ctx(&f));
        assert_eq!(frame.pixel(10, 10), 0xff00_00cc);
    }
}
