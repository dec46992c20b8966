//! Guest Physical Map (§3 "GPM", §4.C).

use crate::event::{GpmSetEvent, GPM_SET_BUS};
use crate::mam::{EntryOps, Level, Mam};
use crate::sync::RwLock;

/// GPM attribute word: `r,w,x` in bits [2:0], cache type in bits [5:3]
/// (§4.C "cache type either embedded in attr[5:3]").
pub(crate) type Attr = u64;

#[derive(Clone, Copy, Default)]
struct GpmEntry(u64);

struct GpmOps;

impl EntryOps<GpmEntry> for GpmOps {
    fn max_leaf_level(&self) -> Level {
        Level::L1
    }

    fn is_leaf(&self, _entry: GpmEntry, _level: Level) -> bool {
        true
    }

    fn is_present(&self, entry: GpmEntry) -> bool {
        entry.0 & 0b111 != 0
    }

    fn to_table(&self, table_hpa: u64) -> GpmEntry {
        GpmEntry((table_hpa & !0xFFF) | 0b111)
    }

    fn to_leaf(&self, target: u64, attr: u64, _level: Level) -> GpmEntry {
        GpmEntry((target & !0xFFF) | (attr & 0x3F))
    }

    fn table_hpa(&self, entry: GpmEntry) -> u64 {
        entry.0 & !0xFFF
    }

    fn leaf_target(&self, entry: GpmEntry, _level: Level) -> u64 {
        entry.0 & !0xFFF
    }

    fn leaf_get_attr(&self, entry: GpmEntry) -> u64 {
        entry.0 & 0x3F
    }
}

/// A guest's GPA -> HPA map, guarded by its own reader/writer lock
/// (§3 "GPM": "A MAM plus a per-guest reader/writer lock").
pub(crate) struct Gpm {
    guest_id: u32,
    mam: RwLock<Mam<GpmOps, GpmEntry>>,
}

impl Gpm {
    pub(crate) fn create(guest_id: u32) -> Self {
        Self { guest_id, mam: RwLock::new(Mam::create(GpmOps)) }
    }

    /// Raises `EVENT_GPM_SET` *before* mutating the MAM, so downstream
    /// tables observe the event inside the same critical section (§4.C,
    /// §5 ordering guarantee).
    pub(crate) fn set_mapping(&self, gpa: u64, hpa: u64, size: u64, attr: Attr) {
        let mam = self.mam.write();
        GPM_SET_BUS.lock().dispatch(&GpmSetEvent { guest_id: self.guest_id, gpa, size });
        mam.insert_range(gpa, hpa, size, attr);
    }

    /// `remove_mapping` is `set_mapping` with `attr=0` (§4.C).
    pub(crate) fn remove_mapping(&self, gpa: u64, size: u64) {
        self.set_mapping(gpa, 0, size, 0);
    }

    pub(crate) fn get_mapping(&self, gpa: u64) -> (u64, Attr, bool) {
        self.mam.read().get_mapping(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let gpm = Gpm::create(0);
        gpm.set_mapping(0x3000, 0xB000, 0x1000, 0b111);
        let (hpa, attr, present) = gpm.get_mapping(0x3000);
        assert!(present);
        assert_eq!(hpa, 0xB000);
        assert_eq!(attr, 0b111);
    }

    #[test]
    fn remove_mapping_clears_presence() {
        let gpm = Gpm::create(0);
        gpm.set_mapping(0x4000, 0xC000, 0x1000, 0b011);
        gpm.remove_mapping(0x4000, 0x1000);
        let (_, _, present) = gpm.get_mapping(0x4000);
        assert!(!present);
    }
}
