//! Host Memory Manager (§4.B).
//!
//! Builds the host CR3 on top of the same [`crate::mam`] engine that backs
//! EPT and VT-d, generalizing the teacher's `allocator.rs`
//! (UEFI-boot-services-backed page allocation) from "identity map assumed,
//! never built explicitly" to an explicit HVA<->HPA MAM the monitor
//! constructs before calling `enable`.

use crate::mam::{EntryOps, Level, Mam};
use crate::sync::RwLock;
use alloc::collections::BTreeMap;

#[derive(Clone, Copy, Default)]
struct HmmEntry(u64);

struct HmmOps {
    max_leaf_level: Level,
}

impl EntryOps<HmmEntry> for HmmOps {
    fn max_leaf_level(&self) -> Level {
        self.max_leaf_level
    }

    fn is_leaf(&self, entry: HmmEntry, level: Level) -> bool {
        matches!(level, Level::L1) || entry.0 & (1 << 7) != 0
    }

    fn is_present(&self, entry: HmmEntry) -> bool {
        entry.0 & 1 != 0
    }

    fn to_table(&self, table_hpa: u64) -> HmmEntry {
        HmmEntry((table_hpa & !0xFFF) | 0b11)
    }

    fn to_leaf(&self, target: u64, attr: u64, level: Level) -> HmmEntry {
        let mut bits = (target & !0xFFF) | (attr & 0b111);
        if !matches!(level, Level::L1) {
            bits |= 1 << 7;
        }
        HmmEntry(bits)
    }

    fn table_hpa(&self, entry: HmmEntry) -> u64 {
        entry.0 & !0xFFF
    }

    fn leaf_target(&self, entry: HmmEntry, _level: Level) -> u64 {
        entry.0 & !0xFFF
    }

    fn leaf_get_attr(&self, entry: HmmEntry) -> u64 {
        entry.0 & 0b111
    }
}

/// present, writable, not-present-at-all: the three attribute words this
/// manager ever hands the MAM (§4.B "marked non-present except for that
/// CPU's own stack").
pub(crate) const ATTR_RW: u64 = 0b11;
pub(crate) const ATTR_RO: u64 = 0b01;

/// The host CR3-backing map plus an HVA<->HPA reverse index for the
/// allocator-facing lookups (§4.B `hva_to_hpa`/`hpa_to_hva`). Host virtual
/// addresses are identity-equal to host physical addresses in this design
/// (no separate HVA space is carved out), so the reverse map only needs to
/// track *unmapped* holes punched by `unmap_hpa`.
pub(crate) struct Hmm {
    mam: Mam<HmmOps, HmmEntry>,
    unmapped: RwLock<BTreeMap<u64, u64>>,
}

impl Hmm {
    pub(crate) fn create(max_leaf_level: Level) -> Self {
        Self { mam: Mam::create(HmmOps { max_leaf_level }), unmapped: RwLock::new(BTreeMap::new()) }
    }

    /// Identity-maps `[start, start+size)` with `attr`, the initial state
    /// every physical frame gets before per-CPU stack isolation and
    /// VMXON/VMPTRLD page unmapping run (§4.B).
    pub(crate) fn identity_map(&self, start: u64, size: u64, attr: u64) {
        self.mam.insert_range(start, start, size, attr);
    }

    pub(crate) fn hva_to_hpa(&self, hva: u64) -> Option<u64> {
        let (hpa, _attr, present) = self.mam.get_mapping(hva & !0xFFF);
        present.then_some(hpa | (hva & 0xFFF))
    }

    pub(crate) fn hpa_to_hva(&self, hpa: u64) -> Option<u64> {
        // Identity mapping: HVA equals HPA unless explicitly unmapped.
        if self.unmapped.read().range(..=hpa).next_back().is_some_and(|(&start, &len)| hpa < start + len) {
            return None;
        }
        Some(hpa)
    }

    /// Marks `[hpa, hpa+size)` non-present (§4.B: "VMXON/VMPTRLD pages are
    /// unmapped after use").
    pub(crate) fn unmap_hpa(&self, hpa: u64, size: u64) {
        self.mam.update_attr(hpa, size, 0b1, 0);
        self.unmapped.write().insert(hpa, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_stack_page_is_not_present() {
        let hmm = Hmm::create(Level::L1);
        hmm.identity_map(0, 0x10_0000, ATTR_RW);
        hmm.unmap_hpa(0x3000, 0x1000);
        assert!(hmm.hpa_to_hva(0x3000).is_none());
        assert!(hmm.hpa_to_hva(0x2000).is_some());
    }

    #[test]
    fn identity_map_round_trips_hva_to_hpa() {
        let hmm = Hmm::create(Level::L1);
        hmm.identity_map(0x10_0000, 0x1000, ATTR_RW);
        assert_eq!(hmm.hva_to_hpa(0x10_0004), Some(0x10_0004));
    }
}
