//! The damage tracker: decides which surfaces really changed since the
//! last compositing cycle and drives the active compositor accordingly.
//!
//! Every surface carries a live content counter its owner bumps on each
//! draw; every registry record caches the counter value the compositor
//! last consumed.  A cycle walks popups, then windows in stacking order,
//! then the wallpaper, comparing live against cached with a plain
//! inequality.  Counter wraparound is out of contract: a counter that
//! wraps all the way back between two cycles goes unnoticed, exactly as
//! the single-writer bump-per-draw scheme makes impossible in practice.

use strata_registry::{RegistryError, ZNode};

use crate::ops::{CompositorContext, CompositorOps};

/// Tracks what the compositor has already seen.  Window and popup caches
/// live in their registry records; only the wallpaper's cache lives here,
/// since the wallpaper has no record.
pub struct DamageTracker {
    wallpaper_age: u32,
}

impl Default for DamageTracker {
    fn default() -> DamageTracker {
        DamageTracker::new()
    }
}

impl DamageTracker {
    /// A tracker that considers the current wallpaper content clean.
    pub fn new() -> DamageTracker {
        DamageTracker { wallpaper_age: 0 }
    }

    /// Runs one compositing cycle.  For every surface whose live counter
    /// differs from its cached value, exactly one `on_dirty_*`
    /// notification and exactly one `merge_dirty_*` call are made; if
    /// nothing changed, the compositor is not invoked at all and
    /// `Ok(false)` is returned.
    pub fn run_cycle(
        &mut self,
        ctx: &CompositorContext<'_>,
        ops: &mut dyn CompositorOps,
    ) -> Result<bool, RegistryError> {
        let mut dirty_popups: Vec<(i32, ZNode, u32)> = Vec::new();
        ctx.registry.walk_popups(|idx, node| {
            if let Some(surface) = ctx.surfaces.surface_for(node) {
                let live = surface.dirty_age();
                if live != node.dirty_age {
                    dirty_popups.push((idx, *node, live));
                }
            }
            true
        })?;

        let mut dirty_wins: Vec<(i32, ZNode, u32)> = Vec::new();
        ctx.registry.walk_records(|idx, node| {
            if node.is_visible() {
                if let Some(surface) = ctx.surfaces.surface_for(node) {
                    let live = surface.dirty_age();
                    if live != node.dirty_age {
                        dirty_wins.push((idx, *node, live));
                    }
                }
            }
            true
        })?;

        let wallpaper_live = ctx.surfaces.wallpaper().map(|s| s.dirty_age());
        let wallpaper_dirty = matches!(wallpaper_live, Some(live) if live != self.wallpaper_age);

        if dirty_popups.is_empty() && dirty_wins.is_empty() && !wallpaper_dirty {
            return Ok(false);
        }

        // One-shot change notifications, once per surface whose counter
        // moved, before any merging starts.
        for (idx, _, _) in &dirty_popups {
            ops.on_dirty_ppp(ctx, *idx);
        }
        for (idx, _, _) in &dirty_wins {
            ops.on_dirty_win(ctx, *idx);
        }
        if wallpaper_dirty {
            ops.on_dirty_wpp(ctx);
        }

        // Pass one: merge all damage into the compositor's region and
        // recomposite.  Window records are read-locked across their merge
        // so a disconnect sweep cannot tear one down mid-read.
        ops.reset_dirty_region(ctx);
        for (idx, _, _) in &dirty_popups {
            ops.merge_dirty_ppp(ctx, *idx);
        }
        for (idx, _, _) in &dirty_wins {
            ctx.registry.lock_record(*idx)?;
            ops.merge_dirty_win(ctx, *idx);
            ctx.registry.unlock_record(*idx)?;
        }
        if wallpaper_dirty {
            ops.merge_dirty_wpp(ctx);
        }
        ops.refresh_dirty_region(ctx);
        ops.composite_layers(ctx);

        // Pass two: commit the consumed counters and drop the surfaces'
        // rect accumulation.
        for (idx, node, live) in dirty_popups {
            ctx.registry.set_popup_dirty_age(idx, live)?;
            if let Some(surface) = ctx.surfaces.surface_for(&node) {
                surface.clear_dirty();
            }
        }
        for (idx, node, live) in dirty_wins {
            ctx.registry.set_record_dirty_age(idx, live)?;
            if let Some(surface) = ctx.surfaces.surface_for(&node) {
                surface.clear_dirty();
            }
        }
        if let Some(live) = wallpaper_live {
            if wallpaper_dirty {
                self.wallpaper_age = live;
                if let Some(surface) = ctx.surfaces.wallpaper() {
                    surface.clear_dirty();
                }
            }
        }
        Ok(true)
    }
}
