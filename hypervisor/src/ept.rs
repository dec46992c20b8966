//! Extended Page Table engine (§4.D).

use crate::gpm::Attr as GpmAttr;
use crate::mam::{Attr, EntryOps, Level, Mam};
use bitfield::bitfield;

bitfield! {
    /// EPT leaf/table entry layout (§6 "EPT entry layout (leaf, 4 KiB)").
    #[derive(Clone, Copy, Default)]
    pub(crate) struct EptEntry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub page_size, set_page_size: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub suppress_ve, set_suppress_ve: 62;
    u64, pfn, set_pfn: 51, 12;
}

/// EPT-specific attribute bits packed into the generic [`Attr`] word:
/// `r,w,x` in bits [2:0], EMT in bits [5:3], suppress-#VE (used as "TM" per
/// §6) in bit 6.
pub(crate) fn encode_attr(read: bool, write: bool, execute: bool, memory_type: u8, suppress_ve: bool) -> Attr {
    let mut attr: Attr = 0;
    if read {
        attr |= 1 << 0;
    }
    if write {
        attr |= 1 << 1;
    }
    if execute {
        attr |= 1 << 2;
    }
    attr |= u64::from(memory_type & 0b111) << 3;
    if suppress_ve {
        attr |= 1 << 6;
    }
    attr
}

/// Derives EPT r/w/x/memory-type attributes from a GPM attribute word
/// (§4.C "cache type embedded in attr[5:3]").
pub(crate) fn attr_from_gpm(gpm_attr: GpmAttr) -> Attr {
    let read = gpm_attr & 0b1 != 0;
    let write = gpm_attr & 0b10 != 0;
    let execute = gpm_attr & 0b100 != 0;
    let memory_type = ((gpm_attr >> 3) & 0b111) as u8;
    encode_attr(read, write, execute, memory_type, false)
}

pub(crate) struct EptOps {
    max_leaf_level: Level,
}

impl EntryOps<EptEntry> for EptOps {
    fn max_leaf_level(&self) -> Level {
        self.max_leaf_level
    }

    fn is_leaf(&self, entry: EptEntry, level: Level) -> bool {
        if matches!(level, Level::L1) {
            return true;
        }
        entry.page_size()
    }

    fn is_present(&self, entry: EptEntry) -> bool {
        entry.read() || entry.write() || entry.execute()
    }

    fn to_table(&self, table_hpa: u64) -> EptEntry {
        let mut e = EptEntry::default();
        e.set_read(true);
        e.set_write(true);
        e.set_execute(true);
        e.set_pfn(table_hpa >> 12);
        e
    }

    fn to_leaf(&self, target: u64, attr: Attr, level: Level) -> EptEntry {
        let mut e = EptEntry::default();
        e.set_read(attr & 1 != 0);
        e.set_write(attr & 0b10 != 0);
        e.set_execute(attr & 0b100 != 0);
        e.set_memory_type((attr >> 3) & 0b111);
        e.set_suppress_ve(attr & (1 << 6) != 0);
        if !matches!(level, Level::L1) {
            e.set_page_size(true);
        }
        e.set_pfn(target >> 12);
        e
    }

    fn table_hpa(&self, entry: EptEntry) -> u64 {
        entry.pfn() << 12
    }

    fn leaf_target(&self, entry: EptEntry, _level: Level) -> u64 {
        entry.pfn() << 12
    }

    fn leaf_get_attr(&self, entry: EptEntry) -> Attr {
        encode_attr(entry.read(), entry.write(), entry.execute(), entry.memory_type() as u8, entry.suppress_ve())
    }
}

/// A guest's EPT tree plus its composed EPTP (§4.D).
pub(crate) struct Ept {
    mam: Mam<EptOps, EptEntry>,
    walk_length_minus_one: u8,
    memory_type: u8,
}

impl Ept {
    pub(crate) fn create(max_leaf_level: Level, supports_wb: bool) -> Self {
        Self {
            mam: Mam::create(EptOps { max_leaf_level }),
            walk_length_minus_one: 3, // 4-level EPT: gaw field value 3.
            memory_type: if supports_wb { 6 } else { 0 }, // WB=6, UC=0.
        }
    }

    /// Composes EPTP: `{gaw=3, emt, root_hpa}` (§4.D).
    pub(crate) fn eptp(&self) -> u64 {
        let root = self.mam.get_root_hpa();
        (root & !0xFFF) | (u64::from(self.walk_length_minus_one) << 3) | u64::from(self.memory_type)
    }

    pub(crate) fn set_mapping(&self, gpa: u64, hpa: u64, size: u64, gpm_attr: GpmAttr) {
        self.mam.insert_range(gpa, hpa, size, attr_from_gpm(gpm_attr));
        self.invalidate();
    }

    pub(crate) fn remove_mapping(&self, gpa: u64, size: u64) {
        self.mam.insert_range(gpa, 0, size, 0);
        self.invalidate();
    }

    /// Flushes cached EPT translations for this tree's EPTP. Every mutation
    /// above must be followed by this, or a guest that remaps then
    /// immediately accesses memory can observe stale translations (§4.D).
    #[cfg(not(test))]
    fn invalidate(&self) {
        crate::x86_instructions::invept(self.eptp());
    }

    /// Unit tests run on the host without VMX operation active, so `INVEPT`
    /// would `#UD`; the hardware call is only real under `not(test)`.
    #[cfg(test)]
    fn invalidate(&self) {}

    pub(crate) fn translate(&self, gpa: u64) -> (u64, Attr, bool) {
        self.mam.get_mapping(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_round_trips_through_gpm_attr() {
        let ept = Ept::create(Level::L1, true);
        ept.set_mapping(0x1000, 0x9000, 0x1000, 0b0111); // r|w|x, UC memory type
        let (hpa, attr, present) = ept.translate(0x1000);
        assert!(present);
        assert_eq!(hpa, 0x9000);
        assert_eq!(attr & 0b111, 0b111);
    }

    #[test]
    fn removed_mapping_is_non_present() {
        let ept = Ept::create(Level::L1, true);
        ept.set_mapping(0x2000, 0xA000, 0x1000, 0b011);
        ept.remove_mapping(0x2000, 0x1000);
        let (_, _, present) = ept.translate(0x2000);
        assert!(!present);
    }

    #[test]
    fn eptp_encodes_gaw_and_memory_type() {
        let ept = Ept::create(Level::L1, true);
        let eptp = ept.eptp();
        assert_eq!(eptp & 0b111, 6); // WB memory type
        assert_eq!((eptp >> 3) & 0b111, 3); // 4-level walk length
    }
}
