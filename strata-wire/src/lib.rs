//! Wire-protocol definitions for the strata windowing runtime.  This crate
//! provides only the protocol definition; it does no I/O.
//!
//! # Transport and message format
//!
//! The protocol is spoken over a Unix-domain socket between the window
//! server and each client process.  Each request is a fixed-layout struct
//! cast to a byte slice and sent directly, preceded by a [`RequestHeader`];
//! replies are preceded by a [`ReplyHeader`].  There is no marshalling step:
//! every message struct is `bytemuck::Pod`, so it has no padding bytes and
//! every bit pattern is valid.  All messages are in native byte order.
//!
//! Both the server and its clients treat the peer as untrusted.  The
//! declared length of every incoming message must be checked against
//! [`request_length_limits`] before the body is interpreted, and the server
//! must never size a buffer from an unsanitized length field.
//!
//! # Shared memory
//!
//! Large state (the z-order registry of each layer, window pixel surfaces)
//! is not carried over the socket at all.  The server hands out POSIX
//! shared-memory object names; clients map those objects themselves.  The
//! socket carries only small control structs and, for surface setup, an
//! optional file descriptor.

#![forbid(missing_docs)]
#![no_std]

use bytemuck::{Pod, Zeroable};

/// Well-known path of the server's listening socket.
pub const SERVER_SOCKET_PATH: &str = "/var/tmp/strata.sock";

/// Length of the transport timeout tick, in milliseconds.  All timeouts on
/// the wire are expressed as a count of these ticks; zero means "block
/// indefinitely" and is reserved for the server side.
pub const TIMEOUT_TICK_MS: u32 = 10;

/// Maximum length of a layer name, excluding the NUL terminator.
pub const LEN_LAYER_NAME: usize = 15;

/// Maximum length of a client name, excluding the NUL terminator.
pub const LEN_CLIENT_NAME: usize = 15;

/// Maximum length of a shared-memory object name carried in a reply.
pub const LEN_SHM_NAME: usize = 64;

/// Maximum number of concurrently existing layers.
pub const MAX_NR_LAYERS: usize = 16;

/// Number of stacking priority levels in a z-order registry.
pub const NR_LEVELS: usize = 7;

/// Highest request id reserved for built-in system requests.
pub const MAX_SYS_REQUEST_ID: u32 = 0x0020;

/// Highest request id that may be registered at all.  Application handlers
/// may only be registered in the band `(MAX_SYS_REQUEST_ID, MAX_REQUEST_ID]`.
pub const MAX_REQUEST_ID: u32 = 0x0030;

/// Arbitrary maximum width of a window surface, in pixels.
pub const MAX_SURFACE_WIDTH: u32 = 16384;

/// Arbitrary maximum height of a window surface, in pixels.
pub const MAX_SURFACE_HEIGHT: u32 = 6144;

/// Reply status: success.
pub const ERR_OK: i32 = 0;
/// Reply status: an I/O error occurred on the transport.
pub const ERR_IO: i32 = -1;
/// Reply status: the peer closed the connection.
pub const ERR_CLOSED: i32 = -2;
/// Reply status: an argument was invalid (bad id, bad length, bad index).
pub const ERR_INVARG: i32 = -3;
/// Reply status: the transport timeout expired.
pub const ERR_TIMEOUT: i32 = -4;
/// Reply status: a record index was out of range or stale.
pub const ERR_INVALID_INDEX: i32 = -5;
/// Reply status: the requested priority level is full.
pub const ERR_LEVEL_FULL: i32 = -6;
/// Reply status: a fixed arena (records or mask rects) is exhausted.
pub const ERR_EXHAUSTED: i32 = -7;
/// Reply status: the record is read-locked by the compositor.
pub const ERR_LOCKED: i32 = -8;

/// Stacking priority levels, highest first.  A window record belongs to
/// exactly one level; full stacking order is the concatenation of the
/// per-level lists in this order.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Tooltips; always on top of everything.
    Tooltip = 0,
    /// Global windows owned by the server itself.
    Global = 1,
    /// The screen-lock window.
    ScreenLock = 2,
    /// Docker windows (taskbars and panels).
    Docker = 3,
    /// Topmost ("always on top") application windows.
    Topmost = 4,
    /// Ordinary application windows.
    Normal = 5,
    /// The launcher, below everything but the desktop.
    Launcher = 6,
}

impl Level {
    /// All levels, highest first.
    pub const ALL: [Level; NR_LEVELS] = [
        Level::Tooltip,
        Level::Global,
        Level::ScreenLock,
        Level::Docker,
        Level::Topmost,
        Level::Normal,
        Level::Launcher,
    ];

    /// Converts a wire-level code into a [`Level`], or `None` for an
    /// out-of-range code.
    pub fn from_wire(code: u32) -> Option<Level> {
        Level::ALL.get(code as usize).copied()
    }
}

/// Record flag: the record is visible.
pub const FLAG_VISIBLE: u32 = 0x0000_0001;
/// Record flag: the record is disabled for input.
pub const FLAG_DISABLED: u32 = 0x0000_0002;
/// Record flag: the window is maximized.
pub const FLAG_MAXIMIZED: u32 = 0x0000_0004;
/// Record flag: the window is minimized.
pub const FLAG_MINIMIZED: u32 = 0x0000_0008;
/// Record flag: the record represents a main window (not a control shown
/// as a main window).
pub const FLAG_MAINWIN: u32 = 0x0000_0010;

macro_rules! request_ids {
    (
        $(
            $(#[$m: meta])*
            ($const_name: ident, $variant_name: ident) = $e: expr
        ),*$(,)?
    ) => {
        /// Built-in request ids.
        #[repr(u32)]
        #[non_exhaustive]
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub enum Request {
            $(
                $(#[$m])*
                $variant_name = $e,
            )*
        }

        $(
            $(#[$m])*
            pub const $const_name: u32 = Request::$variant_name as u32;
        )*
    }
}

request_ids! {
    /// Client ⇒ server: join a named layer, creating it if necessary.
    (REQ_JOIN_LAYER, JoinLayer) = 0x0001,
    /// Client ⇒ server: query information about a layer.
    (REQ_LAYER_INFO, LayerInfo) = 0x0002,
    /// Client ⇒ server: layer operation (set topmost, delete).
    (REQ_LAYER_OP, LayerOp) = 0x0003,
    /// Client ⇒ server: allocate a window record in the joined layer.
    (REQ_ALLOC_RECORD, AllocRecord) = 0x0004,
    /// Client ⇒ server: free a window record.
    (REQ_FREE_RECORD, FreeRecord) = 0x0005,
    /// Client ⇒ server: z-order operation on a record.
    (REQ_ZORDER_OP, ZOrderOp) = 0x0006,
    /// Client ⇒ server: replace a record's mask-rectangle chain.
    (REQ_SET_MASK_RECTS, SetMaskRects) = 0x0007,
    /// Client ⇒ server: create a shared pixel surface for a window.
    (REQ_SURFACE, Surface) = 0x0008,
    /// Client ⇒ server: liveness ping; also flushes pending damage.
    (REQ_PING, Ping) = 0x0009,
    /// Client ⇒ server: push a popup record onto the popup stack.
    (REQ_ALLOC_POPUP, AllocPopup) = 0x000A,
    /// Client ⇒ server: pop a popup record (and everything above it).
    (REQ_FREE_POPUP, FreePopup) = 0x000B,
}

/// Layer operation code: make the named layer the topmost layer.
pub const LAYER_OP_SET_TOPMOST: u32 = 1;
/// Layer operation code: delete the named layer (must be empty).
pub const LAYER_OP_DELETE: u32 = 2;

/// Z-order operation code: raise the record to the top of its level.
pub const ZOP_MOVE_TO_TOP: u32 = 1;
/// Z-order operation code: make the record the active window.
pub const ZOP_SET_ACTIVE: u32 = 2;
/// Z-order operation code: make the record visible.
pub const ZOP_SHOW: u32 = 3;
/// Z-order operation code: hide the record.
pub const ZOP_HIDE: u32 = 4;

/// A rectangle in screen coordinates.  `right` and `bottom` are exclusive.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct Rect {
    /// Left edge, inclusive.
    pub left: i32,
    /// Top edge, inclusive.
    pub top: i32,
    /// Right edge, exclusive.
    pub right: i32,
    /// Bottom edge, exclusive.
    pub bottom: i32,
}

impl Rect {
    /// A rectangle with the given edges.
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Width of the rectangle.  Negative widths are meaningless and only
    /// arise from invalid input.
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Height of the rectangle.
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Whether the rectangle covers no area.
    pub const fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Whether `self` and `other` share at least one point.
    pub const fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// Whether the point `(x, y)` lies inside the rectangle.
    pub const fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// Request and reply framing header.  `untrusted_len` is the length of the
/// body that follows; the receiver MUST validate it with
/// [`request_length_limits`] before use.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct RequestHeader {
    /// Request id; see the `REQ_*` constants.
    pub id: u32,
    /// UNTRUSTED length of the body in bytes.
    pub untrusted_len: u32,
}

/// Header of every reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct ReplyHeader {
    /// Status code; `ERR_OK` or one of the negative `ERR_*` constants.
    pub code: i32,
    /// Length of the reply body in bytes.
    pub untrusted_len: u32,
}

/// Client ⇒ server: join (or create) a layer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct JoinLayer {
    /// NUL-padded layer name.  An empty name means the default layer.
    pub layer_name: [u8; LEN_LAYER_NAME + 1],
    /// NUL-padded client name, for diagnostics.
    pub client_name: [u8; LEN_CLIENT_NAME + 1],
    /// Requested per-level record capacities for a newly created layer,
    /// highest level first.  Zero means "use the server default".  Ignored
    /// when the layer already exists.
    pub capacities: [u32; NR_LEVELS],
}

/// Server ⇒ client: result of a join.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct JoinedInfo {
    /// The client id assigned by the server.
    pub client_id: i32,
    /// Size of the layer's registry region in bytes.
    pub region_size: u32,
    /// NUL-padded name of the shared-memory object holding the registry.
    pub shm_name: [u8; LEN_SHM_NAME],
}

/// Client ⇒ server: query a layer.  An empty name means the client's own
/// layer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct LayerInfoRequest {
    /// NUL-padded layer name.
    pub layer_name: [u8; LEN_LAYER_NAME + 1],
}

/// Server ⇒ client: information about a layer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct LayerInfoReply {
    /// Number of clients joined to the layer.
    pub nr_clients: u32,
    /// 1 if the layer is currently the topmost layer, otherwise 0.
    pub is_topmost: u32,
    /// Client id holding the input focus in this layer, or −1.
    pub active_client: i32,
}

/// Client ⇒ server: layer operation.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct LayerOp {
    /// One of the `LAYER_OP_*` codes.
    pub op: u32,
    /// NUL-padded layer name.
    pub layer_name: [u8; LEN_LAYER_NAME + 1],
}

/// Client ⇒ server: allocate a window record.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct AllocRecord {
    /// Wire code of the requested [`Level`].
    pub level: u32,
    /// Initial `FLAG_*` bits.
    pub flags: u32,
    /// Display rectangle of the window.
    pub rect: Rect,
    /// The client's window handle, opaque to the server.
    pub window: u32,
    /// Handle of the owning main window when the record is a control shown
    /// as a main window; 0 otherwise.
    pub main_window: u32,
}

/// Server ⇒ client: the allocated record index.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct RecordAllocated {
    /// Arena index of the new record.
    pub index: i32,
    /// Padding; must be 0.
    pub reserved: u32,
}

/// Client ⇒ server: free a window record.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct FreeRecord {
    /// Arena index of the record to free.
    pub index: i32,
}

/// Client ⇒ server: push a popup record onto the popup stack.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct AllocPopup {
    /// Initial `FLAG_*` bits.
    pub flags: u32,
    /// Display rectangle of the popup.
    pub rect: Rect,
    /// The client's window handle, opaque to the server.
    pub window: u32,
}

/// Server ⇒ client: the allocated popup-stack index.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct PopupAllocated {
    /// Popup-stack index of the new record.
    pub index: i32,
    /// Padding; must be 0.
    pub reserved: u32,
}

/// Client ⇒ server: pop a popup record.  Everything stacked above it is
/// popped too.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct FreePopup {
    /// Popup-stack index of the record to pop.
    pub index: i32,
}

/// Client ⇒ server: z-order operation.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct ZOrderOp {
    /// One of the `ZOP_*` codes.
    pub op: u32,
    /// Arena index of the record to operate on.
    pub index: i32,
}

/// Client ⇒ server: header of a set-mask-rects request.  `count` packed
/// [`Rect`]s follow this struct in the same message body.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct SetMaskRects {
    /// Arena index of the record whose mask chain is replaced.
    pub index: i32,
    /// UNTRUSTED number of rectangles that follow.
    pub untrusted_count: u32,
}

/// Maximum number of mask rectangles in one request.
pub const MAX_MASK_RECTS: usize = 64;

/// Client ⇒ server: create a shared pixel surface.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct SurfaceRequest {
    /// The client's window handle the surface backs; 0 for the wallpaper.
    pub window: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Server ⇒ client: a created surface.  The reply also carries the region's
/// file descriptor out of band where the transport supports it.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
pub struct SurfaceReply {
    /// Total size of the surface region in bytes, header included.
    pub region_size: u32,
    /// NUL-padded name of the shared-memory object backing the surface.
    pub shm_name: [u8; LEN_SHM_NAME],
}

/// Gets the length limits of a request body of a given id, or `None` for an
/// unknown id (for which there are no limits and no built-in handler).
pub fn request_length_limits(id: u32) -> Option<core::ops::RangeInclusive<usize>> {
    use core::mem::size_of;
    Some(match id {
        REQ_JOIN_LAYER => size_of::<JoinLayer>()..=size_of::<JoinLayer>(),
        REQ_LAYER_INFO => size_of::<LayerInfoRequest>()..=size_of::<LayerInfoRequest>(),
        REQ_LAYER_OP => size_of::<LayerOp>()..=size_of::<LayerOp>(),
        REQ_ALLOC_RECORD => size_of::<AllocRecord>()..=size_of::<AllocRecord>(),
        REQ_FREE_RECORD => size_of::<FreeRecord>()..=size_of::<FreeRecord>(),
        REQ_ZORDER_OP => size_of::<ZOrderOp>()..=size_of::<ZOrderOp>(),
        REQ_SET_MASK_RECTS => {
            size_of::<SetMaskRects>()
                ..=size_of::<SetMaskRects>() + MAX_MASK_RECTS * size_of::<Rect>()
        }
        REQ_SURFACE => size_of::<SurfaceRequest>()..=size_of::<SurfaceRequest>(),
        REQ_PING => 0..=0,
        REQ_ALLOC_POPUP => size_of::<AllocPopup>()..=size_of::<AllocPopup>(),
        REQ_FREE_POPUP => size_of::<FreePopup>()..=size_of::<FreePopup>(),
        // Application-registered requests carry arbitrary payloads up to the
        // transport's frame limit.
        id if id > MAX_SYS_REQUEST_ID && id <= MAX_REQUEST_ID => 0..=MAX_FRAME_LEN,
        _ => return None,
    })
}

/// Maximum body length of any request or reply frame.
pub const MAX_FRAME_LEN: usize = 4096;

/// Copies `s` into a NUL-padded fixed buffer, truncating if necessary.
pub fn pack_name<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let len = s.len().min(N - 1);
    buf[..len].copy_from_slice(&s.as_bytes()[..len]);
    buf
}

/// Extracts a NUL-terminated name from a fixed buffer.  Non-UTF-8 input
/// yields `None`; the peer is untrusted.
pub fn unpack_name(buf: &[u8]) -> Option<&str> {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..len]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn structs_have_no_padding() {
        // Pod derivation already rejects padding at compile time; these
        // pin the wire sizes so they are not changed by accident.
        assert_eq!(size_of::<RequestHeader>(), 8);
        assert_eq!(size_of::<ReplyHeader>(), 8);
        assert_eq!(size_of::<Rect>(), 16);
        assert_eq!(size_of::<JoinLayer>(), 60);
        assert_eq!(size_of::<JoinedInfo>(), 72);
        assert_eq!(size_of::<AllocRecord>(), 32);
    }

    #[test]
    fn level_round_trips_through_wire_code() {
        for level in Level::ALL {
            assert_eq!(Level::from_wire(level as u32), Some(level));
        }
        assert_eq!(Level::from_wire(NR_LEVELS as u32), None);
    }

    #[test]
    fn length_limits_reject_unknown_ids() {
        assert!(request_length_limits(REQ_JOIN_LAYER).is_some());
        assert!(request_length_limits(REQ_ALLOC_POPUP).is_some());
        assert!(request_length_limits(REQ_FREE_POPUP).is_some());
        assert!(request_length_limits(0).is_none());
        assert!(request_length_limits(MAX_REQUEST_ID + 1).is_none());
        // Application band is open-ended but bounded by the frame limit.
        let app = request_length_limits(MAX_SYS_REQUEST_ID + 1).unwrap();
        assert_eq!(*app.end(), MAX_FRAME_LEN);
    }

    #[test]
    fn names_pack_and_unpack() {
        let packed: [u8; 16] = pack_name("lock-screen");
        assert_eq!(unpack_name(&packed), Some("lock-screen"));
        let truncated: [u8; 4] = pack_name("abcdef");
        assert_eq!(unpack_name(&truncated), Some("abc"));
    }

    #[test]
    fn rect_geometry() {
        let r = Rect::new(0, 0, 100, 50);
        assert_eq!(r.width(), 100);
        assert_eq!(r.height(), 50);
        assert!(r.contains(99, 49));
        assert!(!r.contains(100, 49));
        assert!(r.intersects(&Rect::new(99, 49, 200, 200)));
        assert!(!r.intersects(&Rect::new(100, 0, 200, 50)));
        assert!(Rect::new(5, 5, 5, 10).is_empty());
    }
}
