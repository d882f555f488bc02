use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bitmap::BitmapContext;
use crate::error::{CacheError, IoKind, Result};
use crate::format::ImageFormat;
use crate::paths::{CacheConfig, tables_directory};

use super::chunk::ChunkMapper;
use super::entry::{EntryView, METADATA_VERSION, Trailer};
use super::sidecar::Sidecar;
use super::slots::SlotIndex;

/// One image table: a single backing file of fixed-size entries plus the
/// sidecar that lets it reopen. Owns the chunk mapper and the in-memory
/// slot index; all mutation is serialized by the coordinator's work queue.
pub struct ImageTable {
    format: ImageFormat,
    table_path: PathBuf,
    sidecar_path: PathBuf,
    mapper: ChunkMapper,
    slots: SlotIndex,
    dirty: bool,
}

impl ImageTable {
    /// Open (or create) the table for `format` under the configured
    /// directory. A sidecar whose schema fingerprint, trailer version or
    /// screen scale differs from the current format wipes both files.
    pub fn open(format: ImageFormat, config: &CacheConfig) -> Result<ImageTable> {
        let dir = tables_directory(config);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(IoKind::OpenFailed, &dir, e))?;
        let table_path = dir.join(format.name());
        let sidecar_path = dir.join(format!("{}.metadata", format.name()));

        let mut slots = SlotIndex::new(format.max_entries());
        let restored = match Sidecar::load(&sidecar_path) {
            Some(doc) => match Self::check_schema(&doc, &format) {
                Ok(()) => {
                    slots.restore(&doc.slots);
                    debug!(
                        table = format.name(),
                        entries = slots.len(),
                        "restored table from sidecar"
                    );
                    true
                }
                Err(err) => {
                    warn!(table = format.name(), %err, "discarding incompatible table");
                    false
                }
            },
            None => false,
        };
        if !restored {
            // no trustworthy sidecar: whatever the table file holds is orphaned
            let _ = fs::remove_file(&table_path);
            let _ = fs::remove_file(&sidecar_path);
        }

        let mapper = ChunkMapper::open(&table_path, format.geometry().chunk_bytes)?;
        Ok(ImageTable {
            format,
            table_path,
            sidecar_path,
            mapper,
            slots,
            dirty: false,
        })
    }

    fn check_schema(doc: &Sidecar, format: &ImageFormat) -> Result<()> {
        if doc.metadata_version != METADATA_VERSION {
            return Err(CacheError::SchemaMismatch(format!(
                "trailer version {} != {METADATA_VERSION}",
                doc.metadata_version
            )));
        }
        if doc.screen_scale != format.screen_scale() {
            return Err(CacheError::SchemaMismatch(format!(
                "screen scale {} != {}",
                doc.screen_scale,
                format.screen_scale()
            )));
        }
        let fingerprint = format.fingerprint()?;
        if doc.fingerprint != fingerprint {
            debug!(
                stored = %hex::encode(&doc.fingerprint),
                current = %hex::encode(&fingerprint),
                "fingerprint mismatch"
            );
            return Err(CacheError::SchemaMismatch("format changed".into()));
        }
        Ok(())
    }

    pub fn format(&self) -> &ImageFormat {
        &self.format
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn entry_count(&self) -> usize {
        self.slots.len()
    }

    /// Look up the entry for `entity_uuid`, verify its identity trailer and
    /// promote it in the LRU order. A trailer that no longer matches means
    /// the slot is unusable (crash before the sidecar caught up, or the
    /// source changed); it is evicted and the lookup is a miss.
    pub fn get(
        &mut self,
        entity_uuid: Uuid,
        source_uuid: Uuid,
        preheat: bool,
    ) -> Result<Option<EntryView>> {
        let Some(view) = self.entry_checked(entity_uuid, source_uuid)? else {
            return Ok(None);
        };
        self.slots.touch(&entity_uuid);
        // the promotion must survive a reopen
        self.dirty = true;
        if preheat {
            view.preheat();
        }
        Ok(Some(view))
    }

    /// Like `get` without touching the LRU order; still evicts stale slots.
    pub fn exists(&mut self, entity_uuid: Uuid, source_uuid: Uuid) -> Result<bool> {
        Ok(self.entry_checked(entity_uuid, source_uuid)?.is_some())
    }

    /// Draw a new entry for `(entity_uuid, source_uuid)`. Reuses the entity's
    /// slot when it already has one, else the lowest free slot, else evicts
    /// the least-recently-used entry. A failing drawing block rolls the slot
    /// back to the free set.
    pub fn put<F>(&mut self, entity_uuid: Uuid, source_uuid: Uuid, draw: F) -> Result<()>
    where
        F: FnOnce(&mut BitmapContext<'_>) -> Result<()>,
    {
        let slot = if let Some(slot) = self.slots.slot_for(&entity_uuid) {
            slot
        } else if let Some(slot) = self.slots.pop_free() {
            slot
        } else if let Some((victim, slot)) = self.slots.lru_tail() {
            debug!(table = self.format.name(), %victim, slot, "evicting LRU entry");
            self.evict_slot(slot);
            slot
        } else {
            return Err(CacheError::InvalidFormat(format!(
                "table {:?} has no capacity",
                self.format.name()
            )));
        };

        if let Err(err) = self.draw_into_slot(slot, entity_uuid, source_uuid, draw) {
            self.slots.release_slot(slot);
            self.dirty = true;
            return Err(err);
        }
        self.dirty = true;
        Ok(())
    }

    fn draw_into_slot<F>(
        &mut self,
        slot: u32,
        entity_uuid: Uuid,
        source_uuid: Uuid,
        draw: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut BitmapContext<'_>) -> Result<()>,
    {
        let mut view = self.view_for_slot(slot)?;
        view.zero_pixels();
        let row_bytes = self.format.geometry().row_bytes;
        {
            let mut ctx = BitmapContext::new(
                view.pixel_bytes_mut(),
                self.format.width(),
                self.format.height(),
                row_bytes,
                self.format.style(),
            );
            draw(&mut ctx)?;
        }
        view.set_trailer(Trailer {
            entity_uuid,
            source_uuid,
        });
        self.slots.insert(entity_uuid, source_uuid, slot);
        if let Err(err) = view.flush() {
            warn!(table = self.format.name(), slot, %err, "entry flush failed");
        }
        Ok(())
    }

    /// Free the slot backing `entity_uuid`, if any, and erase its identity.
    pub fn delete(&mut self, entity_uuid: Uuid) {
        if let Some(slot) = self.slots.slot_for(&entity_uuid) {
            self.evict_slot(slot);
        }
    }

    /// Drop all mappings and bookkeeping, delete both files and start empty.
    pub fn reset(&mut self) -> Result<()> {
        debug!(table = self.format.name(), "resetting image table");
        self.slots.clear();
        self.dirty = false;
        let _ = fs::remove_file(&self.sidecar_path);
        self.mapper.reset()
    }

    /// Persist the sidecar if anything changed since the last save. Called
    /// opportunistically by the coordinator after each source delivery and
    /// once more when the table drops.
    pub fn save_metadata(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let doc = Sidecar {
            fingerprint: self.format.fingerprint()?,
            metadata_version: METADATA_VERSION,
            screen_scale: self.format.screen_scale(),
            slots: self.slots.records(),
        };
        doc.store(&self.sidecar_path)?;
        self.dirty = false;
        Ok(())
    }

    /// Live handles for the chunk that owns `slot` (for accounting checks).
    pub fn chunk_refcount(&self, slot: u32) -> usize {
        self.mapper.refcount(self.format.geometry().chunk_for_slot(slot))
    }

    pub fn mapped_chunk_count(&self) -> usize {
        self.mapper.mapped_chunk_count()
    }

    fn view_for_slot(&mut self, slot: u32) -> Result<EntryView> {
        let geometry = *self.format.geometry();
        let chunk = self.mapper.map(geometry.chunk_for_slot(slot))?;
        Ok(EntryView::new(
            chunk,
            geometry.offset_in_chunk(slot),
            slot,
            &geometry,
        ))
    }

    fn entry_checked(&mut self, entity_uuid: Uuid, source_uuid: Uuid) -> Result<Option<EntryView>> {
        let Some(slot) = self.slots.slot_for(&entity_uuid) else {
            return Ok(None);
        };
        let view = self.view_for_slot(slot)?;
        let trailer = view.trailer();
        if trailer.entity_uuid != entity_uuid || trailer.source_uuid != source_uuid {
            warn!(
                table = self.format.name(),
                slot, "stale entry identity, evicting"
            );
            drop(view);
            self.evict_slot(slot);
            return Ok(None);
        }
        Ok(Some(view))
    }

    fn evict_slot(&mut self, slot: u32) {
        if let Ok(mut view) = self.view_for_slot(slot) {
            view.set_trailer(Trailer::ZERO);
            if let Err(err) = view.flush() {
                warn!(table = self.format.name(), slot, %err, "trailer erase flush failed");
            }
        }
        self.slots.release_slot(slot);
        self.dirty = true;
    }
}

impl Drop for ImageTable {
    fn drop(&mut self) {
        if let Err(err) = self.save_metadata() {
            warn!(table = self.format.name(), %err, "failed to persist sidecar");
        }
    }
}
