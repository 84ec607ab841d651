//! The in-memory frame target the built-in compositor draws into.
//!
//! The real display path (framebuffer drivers, GPU presentation) is a
//! collaborator outside this system; compositors here produce pixels into
//! this buffer and whatever owns the output scans it out.
//!
//! Draw methods take `&self` so a batch of workers can fill disjoint
//! bands concurrently; the caller guarantees disjointness by splitting
//! the target area with `strata_tasks::split_rect`.

use std::cell::UnsafeCell;

use strata_shm::Surface;
use strata_wire::Rect;

/// A 32-bit-per-pixel frame target.
pub struct FrameBuffer {
    width: i32,
    height: i32,
    pixels: UnsafeCell<Box<[u32]>>,
}

// Concurrent writers stay disjoint by contract; see the module doc.
unsafe impl Sync for FrameBuffer {}

impl FrameBuffer {
    /// A black frame of the given size.
    pub fn new(width: u32, height: u32) -> FrameBuffer {
        FrameBuffer {
            width: width as i32,
            height: height as i32,
            pixels: UnsafeCell::new(vec![0u32; (width * height) as usize].into_boxed_slice()),
        }
    }

    /// The full frame rectangle.
    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn clip(&self, rect: &Rect) -> Rect {
        Rect::new(
            rect.left.max(0),
            rect.top.max(0),
            rect.right.min(self.width),
            rect.bottom.min(self.height),
        )
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn row(&self, y: i32) -> &mut [u32] {
        let pixels = &mut *self.pixels.get();
        let start = (y * self.width) as usize;
        &mut pixels[start..start + self.width as usize]
    }

    /// Fills `rect` with a solid color.
    pub fn fill_rect(&self, rect: &Rect, color: u32) {
        let rect = self.clip(rect);
        if rect.is_empty() {
            return;
        }
        for y in rect.top..rect.bottom {
            let row = unsafe { self.row(y) };
            row[rect.left as usize..rect.right as usize].fill(color);
        }
    }

    /// Copies pixels from `surface` into `dst`.  The source origin is the
    /// surface pixel that lands on `dst`'s top-left corner; rows outside
    /// either the surface or the frame are clipped away.
    pub fn blit(&self, surface: &Surface, src_x: i32, src_y: i32, dst: &Rect) {
        let clipped = self.clip(dst);
        if clipped.is_empty() {
            return;
        }
        let src_x = src_x + (clipped.left - dst.left);
        let src_y = src_y + (clipped.top - dst.top);
        let src_w = surface.width() as i32;
        let src_h = surface.height() as i32;
        let stride = surface.stride() as usize;
        let base = surface.pixels();

        for y in clipped.top..clipped.bottom {
            let sy = src_y + (y - clipped.top);
            if sy < 0 || sy >= src_h {
                continue;
            }
            let copy_left = clipped.left.max(clipped.left - src_x);
            let copy_right = clipped.right.min(clipped.left + (src_w - src_x));
            if copy_left >= copy_right {
                continue;
            }
            let n = (copy_right - copy_left) as usize;
            let sx = src_x + (copy_left - clipped.left);
            unsafe {
                let src_row = base.add(sy as usize * stride).cast::<u32>().add(sx as usize);
                let dst_row = self.row(y);
                std::ptr::copy_nonoverlapping(
                    src_row,
                    dst_row[copy_left as usize..].as_mut_ptr(),
                    n,
                );
            }
        }
    }

    /// Reads one pixel; out-of-range coordinates read 0.
    pub fn pixel(&self, x: i32, y: i32) -> u32 {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return 0;
        }
        unsafe { (*self.pixels.get())[(y * self.width + x) as usize] }
    }
}
