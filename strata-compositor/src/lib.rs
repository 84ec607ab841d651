//! Compositor dispatch.
//!
//! A compositor turns registry state plus damaged surfaces into a final
//! frame.  At most one compositor is active at a time; the
//! [`CompositorManager`] owns the table of registered compositors and
//! keeps selection atomic with respect to damage dispatch.  The built-in
//! [`FallbackCompositor`] is always present and is what everything
//! degrades to when a plugin cannot be loaded.

mod blockheap;
mod damage;
mod fallback;
mod framebuffer;
mod manager;
mod ops;
mod plugin;
mod region;

pub use blockheap::BlockHeap;
pub use damage::DamageTracker;
pub use fallback::FallbackCompositor;
pub use framebuffer::FrameBuffer;
pub use manager::{CompositorError, CompositorManager, FALLBACK_NAME, MAX_COMPOSITORS};
pub use ops::{CompositorContext, CompositorOps, LayerChange, SurfaceProvider};
pub use plugin::{
    load_plugin, PluginCompositor, PluginEntry, PluginError, RawCompositorOps,
    COMPOSITOR_ABI_VERSION, FALLBACK_RAW_OPS, PLUGIN_ENTRY_SYMBOL, RAW_LAYER_CREATED,
    RAW_LAYER_DELETED, RAW_LAYER_SWITCHED,
};
pub use region::DirtyRegion;
