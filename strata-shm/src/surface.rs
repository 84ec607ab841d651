//! Shared pixel surfaces.
//!
//! A surface is a shared-memory object holding one window's pixels plus a
//! small header with the live content-change counter ("dirty age") and the
//! rectangles touched since the compositor last looked.  The owning client
//! is the only writer of the counter; the damage tracker in the server is
//! its only reader, so a relaxed aligned atomic is all the synchronization
//! the counter needs.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use strata_wire::{Rect, MAX_SURFACE_HEIGHT, MAX_SURFACE_WIDTH};

use crate::{ShmError, ShmObject};

/// Value of the magic field of an initialized surface.
pub const SURFACE_MAGIC: u32 = 0x5a53_4646;

/// Dirty rectangles tracked per surface before degrading to "everything".
pub const MAX_DIRTY_RECTS: usize = 8;

/// Bytes per pixel.  Surfaces are always 32-bit.
pub const BYTES_PER_PIXEL: u32 = 4;

#[repr(C)]
struct SurfaceHeader {
    magic: u32,
    width: u32,
    height: u32,
    stride: u32,
    /// Live content-change counter, bumped by the owning client on every
    /// draw.  Compared against the registry record's cached copy.
    dirty_age: u32,
    /// Valid entries in `dirty_rects`; `MAX_DIRTY_RECTS + 1` means the
    /// whole surface is dirty.
    nr_dirty_rects: u32,
    dirty_rects: [Rect; MAX_DIRTY_RECTS],
}

fn header_size() -> usize {
    (std::mem::size_of::<SurfaceHeader>() + 7) & !7
}

/// Total object size for a surface of the given dimensions, or `None` if
/// the dimensions are out of range.
pub fn region_size(width: u32, height: u32) -> Option<usize> {
    if width == 0 || height == 0 || width > MAX_SURFACE_WIDTH || height > MAX_SURFACE_HEIGHT {
        return None;
    }
    Some(header_size() + (width * BYTES_PER_PIXEL) as usize * height as usize)
}

/// One mapped window surface.
pub struct Surface {
    shm: ShmObject,
}

impl Surface {
    /// Creates a surface object under `name`.
    pub fn create(name: &str, width: u32, height: u32) -> Result<Surface, ShmError> {
        let size = region_size(width, height).ok_or(ShmError::BadSize)?;
        let shm = ShmObject::create(name, size)?;
        let surface = Surface { shm };
        {
            let header = surface.header_mut();
            header.width = width;
            header.height = height;
            header.stride = width * BYTES_PER_PIXEL;
            header.magic = SURFACE_MAGIC;
        }
        Ok(surface)
    }

    /// Opens an existing surface by name.  `size` comes from the server's
    /// reply, not from the peer's header.
    pub fn open(name: &str, size: usize) -> Result<Surface, ShmError> {
        Self::validate(Surface {
            shm: ShmObject::open(name, size)?,
        })
    }

    /// Maps a surface from a descriptor received over the socket.
    pub fn from_fd(fd: RawFd, size: usize) -> Result<Surface, ShmError> {
        Self::validate(Surface {
            shm: ShmObject::from_fd(fd, size)?,
        })
    }

    fn validate(surface: Surface) -> Result<Surface, ShmError> {
        if surface.shm.len() < header_size() {
            return Err(ShmError::BadSize);
        }
        let header = surface.header();
        if header.magic != SURFACE_MAGIC
            || region_size(header.width, header.height) != Some(surface.shm.len())
        {
            return Err(ShmError::BadSize);
        }
        Ok(surface)
    }

    fn header(&self) -> &SurfaceHeader {
        unsafe { &*(self.shm.as_ptr() as *const SurfaceHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut SurfaceHeader {
        unsafe { &mut *(self.shm.as_ptr() as *mut SurfaceHeader) }
    }

    fn dirty_age_atomic(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(&self.header_mut().dirty_age as *const u32 as *mut u32) }
    }

    fn nr_dirty_atomic(&self) -> &AtomicU32 {
        unsafe {
            AtomicU32::from_ptr(&self.header_mut().nr_dirty_rects as *const u32 as *mut u32)
        }
    }

    /// The underlying shared-memory object.
    pub fn shm(&self) -> &ShmObject {
        &self.shm
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.header().width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.header().height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> u32 {
        self.header().stride
    }

    /// The live content-change counter.
    pub fn dirty_age(&self) -> u32 {
        self.dirty_age_atomic().load(Ordering::Relaxed)
    }

    /// Records a drawn rectangle and bumps the counter.  Once more than
    /// [`MAX_DIRTY_RECTS`] rectangles accumulate, the whole surface is
    /// considered dirty until the next [`Surface::clear_dirty`].
    pub fn mark_dirty(&self, rect: Rect) {
        let header = self.header_mut();
        let nr = self.nr_dirty_atomic().load(Ordering::Relaxed) as usize;
        if nr < MAX_DIRTY_RECTS {
            header.dirty_rects[nr] = rect;
            self.nr_dirty_atomic().store(nr as u32 + 1, Ordering::Relaxed);
        } else {
            self.nr_dirty_atomic()
                .store(MAX_DIRTY_RECTS as u32 + 1, Ordering::Relaxed);
        }
        self.dirty_age_atomic().fetch_add(1, Ordering::Relaxed);
    }

    /// The rectangles dirtied since the last clear, or `None` meaning the
    /// whole surface.
    pub fn dirty_rects(&self) -> Option<Vec<Rect>> {
        let nr = self.nr_dirty_atomic().load(Ordering::Relaxed) as usize;
        if nr > MAX_DIRTY_RECTS {
            return None;
        }
        Some(self.header().dirty_rects[..nr].to_vec())
    }

    /// Resets the dirty-rectangle accumulation.  Called by the damage
    /// tracker after it has consumed the state.
    pub fn clear_dirty(&self) {
        self.nr_dirty_atomic().store(0, Ordering::Relaxed);
    }

    /// The pixel buffer.
    pub fn pixels(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(header_size()) }
    }

    /// Length of the pixel buffer in bytes.
    pub fn pixels_len(&self) -> usize {
        self.shm.len() - header_size()
    }
}
