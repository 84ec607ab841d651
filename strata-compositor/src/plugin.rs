//! Out-of-tree compositors loaded from shared objects.
//!
//! A plugin exports one entry symbol returning a C callback table and
//! reporting, through an out parameter, the ABI version it was built
//! against; a mismatch rejects the plugin before any callback runs.  The
//! entry also receives the fallback delegation table: callbacks are
//! optional, and a null slot falls through to the built-in default
//! behavior, so a plugin only fills in what it implements.
//!
//! The registry and surface table never cross the C boundary.  A plugin
//! gets an opaque context pointer of its own choosing back on every call
//! and does its drawing against whatever it opened itself.

use std::ffi::{c_char, c_void, CStr, CString};

use strata_wire::Rect;

use crate::ops::{CompositorContext, CompositorOps};

/// Version of the callback-table layout below.  Bumped on any change to
/// [`RawCompositorOps`].
pub const COMPOSITOR_ABI_VERSION: u32 = 1;

/// Symbol a plugin shared object must export.
pub const PLUGIN_ENTRY_SYMBOL: &str = "strata_compositor_entry";

/// Raw code for [`LayerChange::Created`] across the C boundary.
pub const RAW_LAYER_CREATED: u32 = 0;
/// Raw code for [`LayerChange::Deleted`].
pub const RAW_LAYER_DELETED: u32 = 1;
/// Raw code for [`LayerChange::Switched`].
pub const RAW_LAYER_SWITCHED: u32 = 2;

/// The C callback table a plugin's entry point returns.  `ctx` is handed
/// back verbatim as the first argument of every callback.  The slot set
/// mirrors [`CompositorOps`] one to one.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawCompositorOps {
    /// Opaque plugin state.
    pub ctx: *mut c_void,
    pub initialize: Option<unsafe extern "C" fn(*mut c_void)>,
    pub terminate: Option<unsafe extern "C" fn(*mut c_void)>,
    pub refresh: Option<unsafe extern "C" fn(*mut c_void)>,
    /// Takes one of the `RAW_LAYER_*` codes.
    pub on_layer_op: Option<unsafe extern "C" fn(*mut c_void, u32)>,
    pub on_dirty_ppp: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_dirty_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_dirty_wpp: Option<unsafe extern "C" fn(*mut c_void)>,
    pub reset_dirty_region: Option<unsafe extern "C" fn(*mut c_void)>,
    pub merge_dirty_ppp: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub merge_dirty_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub merge_dirty_wpp: Option<unsafe extern "C" fn(*mut c_void)>,
    pub refresh_dirty_region: Option<unsafe extern "C" fn(*mut c_void)>,
    pub composite_layers: Option<unsafe extern "C" fn(*mut c_void)>,
    pub on_showing_ppp: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_hiding_ppp: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_closed_menu: Option<unsafe extern "C" fn(*mut c_void, Rect)>,
    pub on_showing_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_hiding_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_raised_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_moved_win: Option<unsafe extern "C" fn(*mut c_void, i32, Rect)>,
    pub on_changed_rgn: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_changed_ct: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_maximizing_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub on_minimizing_win: Option<unsafe extern "C" fn(*mut c_void, i32)>,
    pub transit_to_layer: Option<unsafe extern "C" fn(*mut c_void)>,
}

/// The delegation template handed to every plugin entry point.  All
/// slots are null; a null slot in the plugin's own table, whether left
/// empty or copied from here, falls through to the built-in default
/// behavior for that operation.
pub const FALLBACK_RAW_OPS: RawCompositorOps = RawCompositorOps {
    ctx: std::ptr::null_mut(),
    initialize: None,
    terminate: None,
    refresh: None,
    on_layer_op: None,
    on_dirty_ppp: None,
    on_dirty_win: None,
    on_dirty_wpp: None,
    reset_dirty_region: None,
    merge_dirty_ppp: None,
    merge_dirty_win: None,
    merge_dirty_wpp: None,
    refresh_dirty_region: None,
    composite_layers: None,
    on_showing_ppp: None,
    on_hiding_ppp: None,
    on_closed_menu: None,
    on_showing_win: None,
    on_hiding_win: None,
    on_raised_win: None,
    on_moved_win: None,
    on_changed_rgn: None,
    on_changed_ct: None,
    on_maximizing_win: None,
    on_minimizing_win: None,
    transit_to_layer: None,
};

/// Entry point signature.  The plugin receives the name it is being
/// registered under and a pointer to the fallback delegation table
/// ([`FALLBACK_RAW_OPS`]), writes the ABI version it was built against
/// through `version_out`, and returns its callback table (null to
/// refuse).
pub type PluginEntry = unsafe extern "C" fn(
    name: *const c_char,
    fallback_ops: *const RawCompositorOps,
    version_out: *mut u32,
) -> *const RawCompositorOps;

/// Why a plugin could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// `dlopen` failed.
    #[error("cannot open plugin {path}: {reason}")]
    Open {
        /// Path handed to `dlopen`.
        path: String,
        /// `dlerror` text.
        reason: String,
    },
    /// The entry symbol is missing.
    #[error("plugin {path} does not export {symbol}")]
    Symbol {
        /// Path handed to `dlopen`.
        path: String,
        /// The missing symbol.
        symbol: &'static str,
    },
    /// The plugin was built against a different table layout.
    #[error("plugin ABI version {found} does not match {expected}")]
    Version {
        /// Version in the plugin's table.
        found: u32,
        /// [`COMPOSITOR_ABI_VERSION`].
        expected: u32,
    },
    /// The entry point returned a null table.
    #[error("plugin entry returned no callback table")]
    NullOps,
}

/// Rejects tables from a different ABI generation.
fn check_abi(found: u32) -> Result<(), PluginError> {
    if found != COMPOSITOR_ABI_VERSION {
        return Err(PluginError::Version {
            found,
            expected: COMPOSITOR_ABI_VERSION,
        });
    }
    Ok(())
}

fn dlerror_string() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return "unknown dlerror".to_owned();
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

/// Loads a compositor plugin.  The shared object stays mapped until the
/// returned compositor is dropped.
pub fn load_plugin(path: &str, name: &str) -> Result<PluginCompositor, PluginError> {
    let c_path = CString::new(path).map_err(|_| PluginError::Open {
        path: path.to_owned(),
        reason: "path contains a NUL byte".to_owned(),
    })?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return Err(PluginError::Open {
            path: path.to_owned(),
            reason: dlerror_string(),
        });
    }

    let symbol = b"strata_compositor_entry\0";
    let entry = unsafe { libc::dlsym(handle, symbol.as_ptr().cast::<c_char>()) };
    if entry.is_null() {
        unsafe { libc::dlclose(handle) };
        return Err(PluginError::Symbol {
            path: path.to_owned(),
            symbol: PLUGIN_ENTRY_SYMBOL,
        });
    }

    let c_name = CString::new(name).map_err(|_| PluginError::Open {
        path: path.to_owned(),
        reason: "name contains a NUL byte".to_owned(),
    })?;
    let entry: PluginEntry = unsafe { std::mem::transmute(entry) };
    let mut version: u32 = 0;
    let table = unsafe { entry(c_name.as_ptr(), &FALLBACK_RAW_OPS, &mut version) };
    let compositor = match PluginCompositor::from_table(name, handle, table, version) {
        Ok(compositor) => compositor,
        Err(err) => {
            unsafe { libc::dlclose(handle) };
            return Err(err);
        }
    };
    log::info!("loaded compositor plugin {:?} from {}", name, path);
    Ok(compositor)
}

/// A loaded plugin, adapted to [`CompositorOps`].
pub struct PluginCompositor {
    name: String,
    handle: *mut c_void,
    ops: RawCompositorOps,
}

// The handle and ctx pointer are only touched through &mut self, and
// dlopen handles are process-global.
unsafe impl Send for PluginCompositor {}

impl PluginCompositor {
    fn from_table(
        name: &str,
        handle: *mut c_void,
        table: *const RawCompositorOps,
        version: u32,
    ) -> Result<PluginCompositor, PluginError> {
        check_abi(version)?;
        if table.is_null() {
            return Err(PluginError::NullOps);
        }
        Ok(PluginCompositor {
            name: name.to_owned(),
            handle,
            ops: unsafe { *table },
        })
    }

    /// Wraps a callback table without a backing shared object.
    #[cfg(test)]
    fn from_static_table(
        name: &str,
        table: &RawCompositorOps,
        version: u32,
    ) -> Result<PluginCompositor, PluginError> {
        PluginCompositor::from_table(name, std::ptr::null_mut(), table, version)
    }

    fn call0(&mut self, slot: Option<unsafe extern "C" fn(*mut c_void)>) {
        if let Some(f) = slot {
            unsafe { f(self.ops.ctx) };
        }
    }

    fn call_idx(&mut self, slot: Option<unsafe extern "C" fn(*mut c_void, i32)>, idx: i32) {
        if let Some(f) = slot {
            unsafe { f(self.ops.ctx, idx) };
        }
    }
}

impl Drop for PluginCompositor {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

impl CompositorOps for PluginCompositor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.initialize);
    }

    fn terminate(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.terminate);
    }

    fn refresh(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.refresh);
    }

    fn reset_dirty_region(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.reset_dirty_region);
    }

    fn merge_dirty_ppp(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.merge_dirty_ppp, idx);
    }

    fn merge_dirty_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.merge_dirty_win, idx);
    }

    fn merge_dirty_wpp(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.merge_dirty_wpp);
    }

    fn refresh_dirty_region(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.refresh_dirty_region);
    }

    fn composite_layers(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.composite_layers);
    }

    fn on_layer_op(&mut self, _ctx: &CompositorContext<'_>, change: crate::ops::LayerChange) {
        if let Some(f) = self.ops.on_layer_op {
            let code = match change {
                crate::ops::LayerChange::Created => RAW_LAYER_CREATED,
                crate::ops::LayerChange::Deleted => RAW_LAYER_DELETED,
                crate::ops::LayerChange::Switched => RAW_LAYER_SWITCHED,
            };
            unsafe { f(self.ops.ctx, code) };
        }
    }

    fn on_dirty_ppp(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_dirty_ppp, idx);
    }

    fn on_dirty_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_dirty_win, idx);
    }

    fn on_dirty_wpp(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.on_dirty_wpp);
    }

    fn on_showing_ppp(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_showing_ppp, idx);
    }

    fn on_hiding_ppp(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_hiding_ppp, idx);
    }

    fn on_closed_menu(&mut self, _ctx: &CompositorContext<'_>, rect: Rect) {
        if let Some(f) = self.ops.on_closed_menu {
            unsafe { f(self.ops.ctx, rect) };
        }
    }

    fn on_showing_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_showing_win, idx);
    }

    fn on_hiding_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_hiding_win, idx);
    }

    fn on_raised_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_raised_win, idx);
    }

    fn on_moved_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32, old: Rect) {
        if let Some(f) = self.ops.on_moved_win {
            unsafe { f(self.ops.ctx, idx, old) };
        }
    }

    fn on_changed_rgn(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_changed_rgn, idx);
    }

    fn on_changed_ct(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_changed_ct, idx);
    }

    fn on_maximizing_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_maximizing_win, idx);
    }

    fn on_minimizing_win(&mut self, _ctx: &CompositorContext<'_>, idx: i32) {
        self.call_idx(self.ops.on_minimizing_win, idx);
    }

    fn transit_to_layer(&mut self, _ctx: &CompositorContext<'_>) {
        self.call0(self.ops.transit_to_layer);
    }
}
