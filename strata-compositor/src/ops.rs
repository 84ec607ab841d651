//! The compositor operation set.

use strata_registry::{Registry, ZNode};
use strata_shm::Surface;
use strata_wire::Rect;

/// How a compositor implementation reaches the surfaces it composites.
/// The server implements this over its surface table; tests implement it
/// over plain maps.
pub trait SurfaceProvider {
    /// The pixel surface backing a record, if the owning client has
    /// created one.
    fn surface_for(&self, record: &ZNode) -> Option<&Surface>;
    /// The wallpaper surface, if any.
    fn wallpaper(&self) -> Option<&Surface>;
}

/// Everything a compositor callback may look at: the layer's registry,
/// the surfaces, and the screen geometry.
pub struct CompositorContext<'a> {
    /// The active layer's registry.
    pub registry: &'a Registry,
    /// Surface lookup.
    pub surfaces: &'a dyn SurfaceProvider,
    /// Full screen rectangle.
    pub screen_rect: Rect,
}

/// A layer-table change reported to the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerChange {
    /// A layer was created.
    Created,
    /// A layer was deleted.
    Deleted,
    /// The topmost layer changed.
    Switched,
}

/// The callback table every compositor implements.
///
/// All callbacks are infallible; a compositor that fails internally must
/// recover on its own or leave the screen stale.  Default bodies do
/// nothing, so an implementation only overrides what it reacts to.
/// Record indices refer to the context's registry; `idx` 0 is the
/// desktop, popup callbacks take popup-stack indices.
#[allow(unused_variables)]
pub trait CompositorOps {
    /// The compositor's registered name.
    fn name(&self) -> &str;

    /// Called when the compositor becomes active.
    fn initialize(&mut self, ctx: &CompositorContext<'_>) {}
    /// Called when the compositor stops being active.
    fn terminate(&mut self, ctx: &CompositorContext<'_>) {}
    /// Recomposites everything from scratch.
    fn refresh(&mut self, ctx: &CompositorContext<'_>) {}

    /// A layer was created, deleted, or became topmost.
    fn on_layer_op(&mut self, ctx: &CompositorContext<'_>, change: LayerChange) {}

    /// A popup's content changed (one-shot, from the mutation path).
    fn on_dirty_ppp(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window's content changed.
    fn on_dirty_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// The wallpaper's content changed.
    fn on_dirty_wpp(&mut self, ctx: &CompositorContext<'_>) {}

    /// Starts a compositing cycle's damage accumulation.
    fn reset_dirty_region(&mut self, ctx: &CompositorContext<'_>) {}
    /// Folds a dirty popup's damage into the cycle's region.
    fn merge_dirty_ppp(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// Folds a dirty window's damage into the cycle's region.
    fn merge_dirty_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// Folds wallpaper damage into the cycle's region.
    fn merge_dirty_wpp(&mut self, ctx: &CompositorContext<'_>) {}
    /// Recomposites the accumulated dirty region.
    fn refresh_dirty_region(&mut self, ctx: &CompositorContext<'_>) {}
    /// Produces the final frame for the current stacking order.
    fn composite_layers(&mut self, ctx: &CompositorContext<'_>) {}

    /// A popup is about to appear.
    fn on_showing_ppp(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A popup is about to disappear.
    fn on_hiding_ppp(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A tracked menu closed; `rect` is the area it covered.
    fn on_closed_menu(&mut self, ctx: &CompositorContext<'_>, rect: Rect) {}
    /// A window is about to appear.
    fn on_showing_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window is about to disappear.
    fn on_hiding_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window was raised to the top of its level.
    fn on_raised_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window moved; `old` is its previous rectangle.
    fn on_moved_win(&mut self, ctx: &CompositorContext<'_>, idx: i32, old: Rect) {}
    /// A window's mask-rect chain changed.
    fn on_changed_rgn(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window's caption changed.
    fn on_changed_ct(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window is maximizing.
    fn on_maximizing_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// A window is minimizing.
    fn on_minimizing_win(&mut self, ctx: &CompositorContext<'_>, idx: i32) {}
    /// The topmost layer is switching; a compositor may animate here.
    fn transit_to_layer(&mut self, ctx: &CompositorContext<'_>) {}
}
