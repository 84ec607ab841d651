//! The shared z-order registry.
//!
//! A registry is a single fixed-size memory region shared between the
//! window server and every client joined to the same layer.  It holds the
//! bookkeeping for all windows and popup menus of that layer: which exist,
//! who owns them, where they are, how they stack, and how stale the
//! compositor's view of their content is.
//!
//! Because the region is mapped at a different base address in every
//! process, nothing in it is a pointer.  All list links are arena indices,
//! and all section offsets are derived from size fields in the header, so
//! a process that maps the region can reconstruct the layout without any
//! out-of-band information.
//!
//! The [`Registry`] type wraps a mapped region and exposes validated,
//! locked operations.  It is equally happy on plain heap memory (see
//! [`HeapRegion`]), which is how the unit tests exercise it without a
//! kernel object.

mod bitmap;
mod layout;
mod registry;

pub use layout::{
    Capacities, MaskRect, RegionLayout, RegistryHeader, ZNode, ZNodeFlags, REGISTRY_MAGIC,
};
pub use registry::Registry;

use std::io;

use strata_wire::Level;
use thiserror::Error;

/// Errors from registry operations.  Each variant has a stable negative
/// code for the wire (see [`RegistryError::wire_code`]).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An index was out of range, the desktop sentinel where it is not
    /// allowed, or referred to a slot that is not allocated.
    #[error("invalid record index {0}")]
    InvalidIndex(i32),
    /// Every slot of the requested priority level is in use.
    #[error("priority level {0:?} is full")]
    LevelFull(Level),
    /// A fixed arena (popup records or mask rectangles) is exhausted.
    #[error("arena exhausted")]
    Exhausted,
    /// The record is read-locked by the compositor and cannot be torn
    /// down right now.
    #[error("record {0} is locked")]
    Locked(i32),
    /// The requested capacities are zero, absurd, or do not fit the region.
    #[error("bad registry capacity")]
    BadCapacity,
    /// The mapped region does not carry a registry (bad magic or size).
    #[error("region does not contain a registry")]
    BadRegion,
    /// The cross-process lock failed.
    #[error("registry lock failed: {0}")]
    Lock(#[from] io::Error),
}

impl RegistryError {
    /// The negative wire code reported to clients for this error.
    pub fn wire_code(&self) -> i32 {
        match self {
            RegistryError::InvalidIndex(_) => strata_wire::ERR_INVALID_INDEX,
            RegistryError::LevelFull(_) => strata_wire::ERR_LEVEL_FULL,
            RegistryError::Exhausted => strata_wire::ERR_EXHAUSTED,
            RegistryError::Locked(_) => strata_wire::ERR_LOCKED,
            RegistryError::BadCapacity | RegistryError::BadRegion => strata_wire::ERR_INVARG,
            RegistryError::Lock(_) => strata_wire::ERR_IO,
        }
    }
}

/// An owned, zeroed, 8-byte-aligned buffer usable as a registry region.
///
/// The real server backs registries with shared memory; this exists for
/// unit tests and single-process embedding, where the same layout on heap
/// memory behaves identically.
pub struct HeapRegion {
    buf: Vec<u64>,
    len: usize,
}

impl HeapRegion {
    /// A zeroed region of at least `len` bytes.
    pub fn new(len: usize) -> HeapRegion {
        HeapRegion {
            buf: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    /// Base of the region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr().cast()
    }

    /// Usable size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
