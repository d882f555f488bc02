use std::fmt;

use crate::format::{ImageFormat, PixelStyle};
use crate::table::entry::EntryView;

/// Mutable draw target aimed at an entry's mapped pixel region. Rows are
/// `row_bytes` apart and the origin is the top-left pixel; whatever the
/// drawing block writes here lands directly in the table file.
pub struct BitmapContext<'a> {
    bytes: &'a mut [u8],
    width: u32,
    height: u32,
    row_bytes: usize,
    style: PixelStyle,
}

impl<'a> BitmapContext<'a> {
    pub(crate) fn new(
        bytes: &'a mut [u8],
        width: u32,
        height: u32,
        row_bytes: usize,
        style: PixelStyle,
    ) -> BitmapContext<'a> {
        debug_assert!(bytes.len() >= row_bytes * height as usize);
        BitmapContext {
            bytes,
            width,
            height,
            row_bytes,
            style,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn style(&self) -> PixelStyle {
        self.style
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.style.bytes_per_pixel()
    }

    /// The whole pixel region, row padding included.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// The visible pixels of row `y`, padding excluded.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        assert!(y < self.height, "row {y} out of {} rows", self.height);
        let start = y as usize * self.row_bytes;
        let visible = self.width as usize * self.style.bytes_per_pixel();
        &mut self.bytes[start..start + visible]
    }

    /// Repeat one pixel value across the visible region.
    pub fn fill(&mut self, pixel: &[u8]) {
        assert_eq!(
            pixel.len(),
            self.style.bytes_per_pixel(),
            "pixel width does not match {:?}",
            self.style
        );
        for y in 0..self.height {
            for dst in self.row_mut(y).chunks_exact_mut(pixel.len()) {
                dst.copy_from_slice(pixel);
            }
        }
    }
}

/// Read-only, zero-copy image handle returned to callers. Owns a chunk
/// handle clone, so the mapping outlives the caller's use of the bytes;
/// writing through it is not possible.
#[derive(Clone)]
pub struct CachedImage {
    view: EntryView,
    width: u32,
    height: u32,
    row_bytes: usize,
    style: PixelStyle,
}

impl CachedImage {
    pub(crate) fn new(view: EntryView, format: &ImageFormat) -> CachedImage {
        CachedImage {
            view,
            width: format.width(),
            height: format.height(),
            row_bytes: format.geometry().row_bytes,
            style: format.style(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn style(&self) -> PixelStyle {
        self.style
    }

    /// The mapped pixel region, row padding included.
    pub fn pixel_bytes(&self) -> &[u8] {
        self.view.pixel_bytes()
    }

    /// The visible pixels of row `y`, padding excluded.
    pub fn row(&self, y: u32) -> &[u8] {
        assert!(y < self.height, "row {y} out of {} rows", self.height);
        let start = y as usize * self.row_bytes;
        let visible = self.width as usize * self.style.bytes_per_pixel();
        &self.pixel_bytes()[start..start + visible]
    }
}

impl fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_bytes", &self.row_bytes)
            .field("style", &self.style)
            .field("slot", &self.view.slot())
            .finish()
    }
}
