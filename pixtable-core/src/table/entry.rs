use uuid::Uuid;

use crate::format::TableGeometry;

use super::chunk::{ChunkHandle, page_size};

/// Version of the on-disk trailer layout. Bump on any change; existing table
/// files and sidecars are invalidated wholesale on open.
pub const METADATA_VERSION: u32 = 1;

/// Identity trailer written immediately after an entry's pixel region.
pub const TRAILER_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub entity_uuid: Uuid,
    pub source_uuid: Uuid,
}

impl Trailer {
    pub const ZERO: Trailer = Trailer {
        entity_uuid: Uuid::nil(),
        source_uuid: Uuid::nil(),
    };

    pub fn to_bytes(self) -> [u8; TRAILER_BYTES] {
        let mut buf = [0u8; TRAILER_BYTES];
        buf[..16].copy_from_slice(self.entity_uuid.as_bytes());
        buf[16..].copy_from_slice(self.source_uuid.as_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; TRAILER_BYTES]) -> Trailer {
        let mut entity = [0u8; 16];
        let mut source = [0u8; 16];
        entity.copy_from_slice(&buf[..16]);
        source.copy_from_slice(&buf[16..]);
        Trailer {
            entity_uuid: Uuid::from_bytes(entity),
            source_uuid: Uuid::from_bytes(source),
        }
    }
}

/// A typed window over one entry inside a mapped chunk: the pixel region
/// followed by the identity trailer. Holds a handle clone, so the chunk stays
/// mapped while any view is alive; dropping the last view releases it.
#[derive(Clone)]
pub struct EntryView {
    chunk: ChunkHandle,
    offset: usize,
    slot: u32,
    pixel_bytes: usize,
    entry_bytes: usize,
}

impl EntryView {
    pub(crate) fn new(
        chunk: ChunkHandle,
        offset: usize,
        slot: u32,
        geometry: &TableGeometry,
    ) -> EntryView {
        debug_assert!(offset + geometry.entry_bytes <= chunk.len());
        EntryView {
            chunk,
            offset,
            slot,
            pixel_bytes: geometry.pixel_bytes,
            entry_bytes: geometry.entry_bytes,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn chunk(&self) -> &ChunkHandle {
        &self.chunk
    }

    pub fn pixel_len(&self) -> usize {
        self.pixel_bytes
    }

    pub fn pixel_bytes(&self) -> &[u8] {
        let ptr = self.chunk.byte_range(self.offset, self.pixel_bytes);
        unsafe { std::slice::from_raw_parts(ptr, self.pixel_bytes) }
    }

    /// Mutable pixel region. Only the table writes through this, from the
    /// serial work queue, while no reader window over the slot exists.
    pub(crate) fn pixel_bytes_mut(&mut self) -> &mut [u8] {
        let ptr = self.chunk.byte_range(self.offset, self.pixel_bytes);
        unsafe { std::slice::from_raw_parts_mut(ptr, self.pixel_bytes) }
    }

    pub fn trailer(&self) -> Trailer {
        let ptr = self.chunk.byte_range(self.offset + self.pixel_bytes, TRAILER_BYTES);
        let mut buf = [0u8; TRAILER_BYTES];
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), TRAILER_BYTES) };
        Trailer::from_bytes(&buf)
    }

    pub(crate) fn set_trailer(&mut self, trailer: Trailer) {
        let ptr = self.chunk.byte_range(self.offset + self.pixel_bytes, TRAILER_BYTES);
        let buf = trailer.to_bytes();
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, TRAILER_BYTES) };
    }

    pub(crate) fn zero_pixels(&mut self) {
        self.pixel_bytes_mut().fill(0);
    }

    /// Touch one byte per page so the kernel pages the entry in before the
    /// first display draw.
    pub fn preheat(&self) {
        let bytes = self.pixel_bytes();
        let step = page_size();
        let mut acc = 0u8;
        let mut off = 0;
        while off < bytes.len() {
            acc = acc.wrapping_add(unsafe { std::ptr::read_volatile(bytes.as_ptr().add(off)) });
            off += step;
        }
        std::hint::black_box(acc);
    }

    /// Schedule the entry for writeback (`msync` with `MS_ASYNC`). Durability
    /// only; retrieval never depends on it.
    pub fn flush(&self) -> std::io::Result<()> {
        self.chunk.flush_async(self.offset, self.entry_bytes)
    }
}
