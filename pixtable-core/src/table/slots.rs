use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use super::sidecar::SlotRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub entity_uuid: Uuid,
    pub source_uuid: Uuid,
}

/// In-memory occupied-slot index: entity -> slot, the remembered source
/// identity per slot, the most-recently-used ordering and the free-slot set.
/// Rebuilt from the sidecar on open; no two slots ever share an entity.
#[derive(Debug)]
pub struct SlotIndex {
    capacity: u32,
    by_entity: HashMap<Uuid, u32>,
    occupants: HashMap<u32, Occupant>,
    /// Most recently used first.
    mru: Vec<Uuid>,
    free: BTreeSet<u32>,
}

impl SlotIndex {
    pub fn new(capacity: u32) -> SlotIndex {
        SlotIndex {
            capacity,
            by_entity: HashMap::new(),
            occupants: HashMap::new(),
            mru: Vec::new(),
            free: (0..capacity).collect(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.occupants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }

    pub fn slot_for(&self, entity: &Uuid) -> Option<u32> {
        self.by_entity.get(entity).copied()
    }

    pub fn source_for_slot(&self, slot: u32) -> Option<Uuid> {
        self.occupants.get(&slot).map(|o| o.source_uuid)
    }

    /// Lowest-numbered free slot, if any.
    pub fn pop_free(&mut self) -> Option<u32> {
        let slot = self.free.iter().next().copied()?;
        self.free.remove(&slot);
        Some(slot)
    }

    /// Least-recently-used occupant and its slot.
    pub fn lru_tail(&self) -> Option<(Uuid, u32)> {
        let entity = *self.mru.last()?;
        let slot = self.slot_for(&entity)?;
        Some((entity, slot))
    }

    /// Record `entity` at `slot` and promote it to the head of the MRU order.
    pub fn insert(&mut self, entity_uuid: Uuid, source_uuid: Uuid, slot: u32) {
        if let Some(old) = self.occupants.insert(
            slot,
            Occupant {
                entity_uuid,
                source_uuid,
            },
        ) {
            self.forget_entity(&old.entity_uuid);
        }
        if let Some(old_slot) = self.by_entity.insert(entity_uuid, slot) {
            if old_slot != slot {
                self.occupants.remove(&old_slot);
                self.free.insert(old_slot);
            }
        }
        self.free.remove(&slot);
        self.promote(entity_uuid);
    }

    /// Promote an occupied entity to the head of the MRU order.
    pub fn touch(&mut self, entity: &Uuid) {
        if self.by_entity.contains_key(entity) {
            self.promote(*entity);
        }
    }

    /// Free `slot` and drop whatever identity occupied it.
    pub fn release_slot(&mut self, slot: u32) {
        if slot >= self.capacity {
            return;
        }
        if let Some(occupant) = self.occupants.remove(&slot) {
            self.forget_entity(&occupant.entity_uuid);
        }
        self.free.insert(slot);
    }

    pub fn clear(&mut self) {
        self.by_entity.clear();
        self.occupants.clear();
        self.mru.clear();
        self.free = (0..self.capacity).collect();
    }

    /// Occupants in MRU order (rank 0 = most recent), ready for the sidecar.
    pub fn records(&self) -> Vec<SlotRecord> {
        self.mru
            .iter()
            .enumerate()
            .filter_map(|(rank, entity)| {
                let slot = self.slot_for(entity)?;
                let occupant = self.occupants.get(&slot)?;
                Some(SlotRecord {
                    slot,
                    entity_uuid: occupant.entity_uuid,
                    source_uuid: occupant.source_uuid,
                    lru_rank: rank as u32,
                })
            })
            .collect()
    }

    /// Rebuild from sidecar records. Records with out-of-range slots or
    /// duplicate identities are dropped rather than trusted.
    pub fn restore(&mut self, records: &[SlotRecord]) {
        self.clear();
        let mut ordered: Vec<&SlotRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.lru_rank);
        for record in ordered {
            if record.slot >= self.capacity
                || self.occupants.contains_key(&record.slot)
                || self.by_entity.contains_key(&record.entity_uuid)
            {
                continue;
            }
            self.occupants.insert(
                record.slot,
                Occupant {
                    entity_uuid: record.entity_uuid,
                    source_uuid: record.source_uuid,
                },
            );
            self.by_entity.insert(record.entity_uuid, record.slot);
            self.free.remove(&record.slot);
            self.mru.push(record.entity_uuid);
        }
    }

    fn promote(&mut self, entity: Uuid) {
        if let Some(pos) = self.mru.iter().position(|e| *e == entity) {
            self.mru.remove(pos);
        }
        self.mru.insert(0, entity);
    }

    fn forget_entity(&mut self, entity: &Uuid) {
        self.by_entity.remove(entity);
        if let Some(pos) = self.mru.iter().position(|e| e == entity) {
            self.mru.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn free_slots_pop_lowest_first() {
        let mut idx = SlotIndex::new(3);
        assert_eq!(idx.pop_free(), Some(0));
        assert_eq!(idx.pop_free(), Some(1));
        idx.release_slot(0);
        assert_eq!(idx.pop_free(), Some(0));
        assert_eq!(idx.pop_free(), Some(2));
        assert_eq!(idx.pop_free(), None);
    }

    #[test]
    fn mru_order_tracks_touches() {
        let mut idx = SlotIndex::new(4);
        for n in 0..4u128 {
            let slot = idx.pop_free().unwrap();
            idx.insert(uuid(n), uuid(100 + n), slot);
        }
        // insertion order: 3 is most recent, 0 the tail
        assert_eq!(idx.lru_tail().unwrap().0, uuid(0));

        idx.touch(&uuid(0));
        assert_eq!(idx.lru_tail().unwrap().0, uuid(1));
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let mut idx = SlotIndex::new(2);
        for n in 0..5u128 {
            let slot = match idx.pop_free() {
                Some(s) => s,
                None => {
                    let (_, s) = idx.lru_tail().unwrap();
                    idx.release_slot(s);
                    s
                }
            };
            idx.insert(uuid(n), uuid(n), slot);
            assert!(idx.len() <= 2);
        }
        // the two most recent survive
        assert!(idx.slot_for(&uuid(4)).is_some());
        assert!(idx.slot_for(&uuid(3)).is_some());
        assert!(idx.slot_for(&uuid(2)).is_none());
    }

    #[test]
    fn reinserting_an_entity_keeps_one_slot() {
        let mut idx = SlotIndex::new(4);
        idx.insert(uuid(1), uuid(10), 0);
        idx.insert(uuid(1), uuid(11), 0);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.source_for_slot(0), Some(uuid(11)));
    }

    #[test]
    fn records_round_trip_preserves_lru() {
        let mut idx = SlotIndex::new(4);
        for n in 0..3u128 {
            let slot = idx.pop_free().unwrap();
            idx.insert(uuid(n), uuid(100 + n), slot);
        }
        idx.touch(&uuid(0));

        let records = idx.records();
        let mut restored = SlotIndex::new(4);
        restored.restore(&records);

        assert_eq!(restored.len(), 3);
        assert_eq!(restored.lru_tail().unwrap().0, idx.lru_tail().unwrap().0);
        assert_eq!(restored.records(), records);
        assert_eq!(restored.pop_free(), Some(3));
    }

    #[test]
    fn restore_drops_bogus_records() {
        let mut idx = SlotIndex::new(2);
        let records = vec![
            SlotRecord {
                slot: 0,
                entity_uuid: uuid(1),
                source_uuid: uuid(10),
                lru_rank: 0,
            },
            SlotRecord {
                slot: 9,
                entity_uuid: uuid(2),
                source_uuid: uuid(20),
                lru_rank: 1,
            },
            SlotRecord {
                slot: 1,
                entity_uuid: uuid(1),
                source_uuid: uuid(30),
                lru_rank: 2,
            },
        ];
        idx.restore(&records);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.slot_for(&uuid(1)), Some(0));
    }
}
