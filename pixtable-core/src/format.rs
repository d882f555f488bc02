use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::table::chunk::page_size;
use crate::table::entry::{METADATA_VERSION, TRAILER_BYTES};

/// Rows are aligned for direct display-layer consumption (Core Animation
/// wants 64-byte row boundaries).
pub const ROW_ALIGNMENT: usize = 64;

/// Entries per mapped chunk. The entry stride is page-aligned, so a chunk is
/// always a whole number of pages as well as a whole number of entries.
pub const ENTRIES_PER_CHUNK: u32 = 4;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Pixel layout of every entry in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelStyle {
    /// Full color with alpha, 8 bits per component.
    Bgra32,
    /// Full color, no alpha; the fourth byte is unused.
    Bgr32,
    /// Reduced color, 5 bits per component; the top bit is unused.
    Bgr16,
    /// Single grayscale channel.
    Gray8,
}

impl PixelStyle {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelStyle::Bgra32 | PixelStyle::Bgr32 => 4,
            PixelStyle::Bgr16 => 2,
            PixelStyle::Gray8 => 1,
        }
    }

    pub fn bits_per_component(self) -> u32 {
        match self {
            PixelStyle::Bgra32 | PixelStyle::Bgr32 | PixelStyle::Gray8 => 8,
            PixelStyle::Bgr16 => 5,
        }
    }

    pub fn is_grayscale(self) -> bool {
        matches!(self, PixelStyle::Gray8)
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelStyle::Bgra32)
    }

    fn tag(self) -> &'static str {
        match self {
            PixelStyle::Bgra32 => "bgra32",
            PixelStyle::Bgr32 => "bgr32",
            PixelStyle::Bgr16 => "bgr16",
            PixelStyle::Gray8 => "gray8",
        }
    }
}

/// Data-protection tag for the table files. Recorded in the schema
/// fingerprint so that changing it invalidates existing tables; no platform
/// file-protection hook is applied beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionMode {
    #[default]
    None,
    Complete,
    CompleteAfterFirstUnlock,
}

impl ProtectionMode {
    fn tag(self) -> &'static str {
        match self {
            ProtectionMode::None => "none",
            ProtectionMode::Complete => "complete",
            ProtectionMode::CompleteAfterFirstUnlock => "complete-after-first-unlock",
        }
    }
}

/// Derived byte layout of a table, computed once when the format is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableGeometry {
    /// Bytes per pixel row, aligned to `ROW_ALIGNMENT`.
    pub row_bytes: usize,
    /// Bytes of the visible pixel region (`row_bytes * height`).
    pub pixel_bytes: usize,
    /// Stride between entries: pixels + trailer, page-aligned.
    pub entry_bytes: usize,
    pub entries_per_chunk: u32,
    pub chunk_bytes: usize,
    /// Chunks needed to hold `max_entries` slots.
    pub chunk_count: u32,
}

impl TableGeometry {
    fn for_format(width: u32, height: u32, style: PixelStyle, max_entries: u32) -> TableGeometry {
        let row_bytes = align_up(width as usize * style.bytes_per_pixel(), ROW_ALIGNMENT);
        let pixel_bytes = row_bytes * height as usize;
        let entry_bytes = align_up(pixel_bytes + TRAILER_BYTES, page_size());
        TableGeometry {
            row_bytes,
            pixel_bytes,
            entry_bytes,
            entries_per_chunk: ENTRIES_PER_CHUNK,
            chunk_bytes: entry_bytes * ENTRIES_PER_CHUNK as usize,
            chunk_count: max_entries.div_ceil(ENTRIES_PER_CHUNK),
        }
    }

    pub fn chunk_for_slot(&self, slot: u32) -> u32 {
        slot / self.entries_per_chunk
    }

    pub fn offset_in_chunk(&self, slot: u32) -> usize {
        (slot % self.entries_per_chunk) as usize * self.entry_bytes
    }
}

/// Canonically ordered document whose CBOR bytes are the schema fingerprint.
/// Any field change (including the trailer version) invalidates existing
/// table files on open.
#[derive(Serialize)]
struct FingerprintDoc<'a> {
    name: &'a str,
    family: Option<&'a str>,
    width: u32,
    height: u32,
    style: &'static str,
    max_entries: u32,
    protection: &'static str,
    screen_scale: f32,
    metadata_version: u32,
}

/// Immutable recipe for one image table: fixed pixel geometry, color layout,
/// capacity and family tag. All derived byte layout is computed at
/// construction and never changes afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFormat {
    name: String,
    family: Option<String>,
    width: u32,
    height: u32,
    style: PixelStyle,
    max_entries: u32,
    protection: ProtectionMode,
    screen_scale: f32,
    geometry: TableGeometry,
}

impl ImageFormat {
    pub fn new(
        name: &str,
        width: u32,
        height: u32,
        style: PixelStyle,
        max_entries: u32,
    ) -> Result<ImageFormat> {
        if name.is_empty() {
            return Err(CacheError::InvalidFormat("empty format name".into()));
        }
        if width == 0 || height == 0 {
            return Err(CacheError::InvalidFormat(format!(
                "format {name:?} has zero pixel dimension ({width}x{height})"
            )));
        }
        if max_entries == 0 {
            return Err(CacheError::InvalidFormat(format!(
                "format {name:?} allows zero entries"
            )));
        }
        Ok(ImageFormat {
            name: name.to_string(),
            family: None,
            width,
            height,
            style,
            max_entries,
            protection: ProtectionMode::default(),
            screen_scale: 1.0,
            geometry: TableGeometry::for_format(width, height, style, max_entries),
        })
    }

    /// Group this format with siblings that can be drawn from one source.
    pub fn with_family(mut self, family: &str) -> ImageFormat {
        self.family = Some(family.to_string());
        self
    }

    pub fn with_protection(mut self, protection: ProtectionMode) -> ImageFormat {
        self.protection = protection;
        self
    }

    /// Rendering scale assumed at creation; recorded in the fingerprint so a
    /// scale change invalidates the table.
    pub fn with_screen_scale(mut self, scale: f32) -> ImageFormat {
        self.screen_scale = scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn style(&self) -> PixelStyle {
        self.style
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn protection(&self) -> ProtectionMode {
        self.protection
    }

    pub fn screen_scale(&self) -> f32 {
        self.screen_scale
    }

    pub fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    /// Canonical serialization of the dictionary representation. Two formats
    /// are compatible iff their fingerprints match byte for byte.
    pub fn fingerprint(&self) -> Result<Vec<u8>> {
        let doc = FingerprintDoc {
            name: &self.name,
            family: self.family.as_deref(),
            width: self.width,
            height: self.height,
            style: self.style.tag(),
            max_entries: self.max_entries,
            protection: self.protection.tag(),
            screen_scale: self.screen_scale,
            metadata_version: METADATA_VERSION,
        };
        let mut buf = Vec::with_capacity(128);
        ciborium::ser::into_writer(&doc, &mut buf)
            .map_err(|e| CacheError::InvalidFormat(format!("unserializable format: {e}")))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> ImageFormat {
        ImageFormat::new("thumb", 100, 100, PixelStyle::Bgra32, 4).unwrap()
    }

    #[test]
    fn rejects_degenerate_formats() {
        assert!(ImageFormat::new("x", 0, 10, PixelStyle::Bgra32, 4).is_err());
        assert!(ImageFormat::new("x", 10, 0, PixelStyle::Bgra32, 4).is_err());
        assert!(ImageFormat::new("x", 10, 10, PixelStyle::Bgra32, 0).is_err());
        assert!(ImageFormat::new("", 10, 10, PixelStyle::Bgra32, 4).is_err());
    }

    #[test]
    fn geometry_alignment() {
        let geo = *format().geometry();
        assert!(geo.row_bytes >= 100 * 4);
        assert_eq!(geo.row_bytes % ROW_ALIGNMENT, 0);
        assert_eq!(geo.chunk_bytes % page_size(), 0);
        assert_eq!(geo.chunk_bytes % geo.entry_bytes, 0);
        assert!(geo.entry_bytes >= geo.pixel_bytes + TRAILER_BYTES);
        assert_eq!(geo.chunk_count, 1);
    }

    #[test]
    fn slot_addressing() {
        let geo = *format().geometry();
        assert_eq!(geo.chunk_for_slot(0), 0);
        assert_eq!(geo.chunk_for_slot(3), 0);
        assert_eq!(geo.chunk_for_slot(4), 1);
        assert_eq!(geo.offset_in_chunk(0), 0);
        assert_eq!(geo.offset_in_chunk(5), geo.entry_bytes);
    }

    #[test]
    fn bytes_per_pixel_per_style() {
        assert_eq!(PixelStyle::Bgra32.bytes_per_pixel(), 4);
        assert_eq!(PixelStyle::Bgr32.bytes_per_pixel(), 4);
        assert_eq!(PixelStyle::Bgr16.bytes_per_pixel(), 2);
        assert_eq!(PixelStyle::Gray8.bytes_per_pixel(), 1);
        assert_eq!(PixelStyle::Bgr16.bits_per_component(), 5);
        assert!(PixelStyle::Gray8.is_grayscale());
        assert!(PixelStyle::Bgra32.has_alpha());
    }

    #[test]
    fn fingerprint_tracks_every_field() {
        let base = format();
        assert_eq!(base.fingerprint().unwrap(), format().fingerprint().unwrap());

        let variants = [
            ImageFormat::new("thumb2", 100, 100, PixelStyle::Bgra32, 4).unwrap(),
            ImageFormat::new("thumb", 101, 100, PixelStyle::Bgra32, 4).unwrap(),
            ImageFormat::new("thumb", 100, 101, PixelStyle::Bgra32, 4).unwrap(),
            ImageFormat::new("thumb", 100, 100, PixelStyle::Bgr16, 4).unwrap(),
            ImageFormat::new("thumb", 100, 100, PixelStyle::Bgra32, 8).unwrap(),
            format().with_family("x"),
            format().with_protection(ProtectionMode::Complete),
            format().with_screen_scale(2.0),
        ];
        for variant in variants {
            assert_ne!(base.fingerprint().unwrap(), variant.fingerprint().unwrap());
        }
    }
}
