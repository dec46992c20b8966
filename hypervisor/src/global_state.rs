//! The module containing the [`GlobalState`] type.
//!
//! Process-wide state is legitimate only for the handful of things that are
//! genuinely shared across every logical processor: the guest table, VT-d's
//! remapping engine and domain list, the global PCI block-list, and the
//! parsed ACPI S3 singletons (§9 "Global mutable state"). Everything else —
//! a vCPU's registers, its own VMCS, its own I/O bitmap — is owned by the
//! per-core [`crate::gcpu::Gcpu`] and never routed through here. The
//! singleton is initialized once on the BSP before any AP leaves the
//! startup barrier and is read-only thereafter except through the
//! explicit mutator APIs below, each of which takes the lock for the
//! duration of its own (rare, broadcast-synchronized) update.

use crate::guest::Guest;
use crate::logger::apic_id;
use crate::pci::Bdf;
use crate::suspend::S3SleepTypes;
use crate::vtd::VtdSubsystem;
use alloc::vec::Vec;
use spin::{Mutex, Once};

/// Maps a PCI device to the guest that owns it, so a trapped MMCFG
/// configuration access can be routed to that guest's own
/// [`crate::pci::PciBlockList`] (§9 "`g_pci_block_guest`").
pub(crate) struct PciBlockGuestEntry {
    pub(crate) bdf: Bdf,
    pub(crate) guest_id: u32,
}

/// The ACPI facts parsed once at init and otherwise treated as read-only
/// singletons: the PM1 control block port addresses and this platform's
/// `(SLP_TYPa, SLP_TYPb)` pair for the S3 state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AcpiSingletons {
    pub(crate) pm1a_control_port: u16,
    pub(crate) pm1b_control_port: u16,
    pub(crate) s3_sleep_types: S3SleepTypes,
}

/// The singleton data structure shared across all processors. Any access
/// to it is synchronized through [`with_global`]; nothing here is touched
/// on the VMExit fast path.
pub(crate) struct GlobalState {
    /// One entry per guest this MON hosts, indexed by [`Guest::id`]
    /// (§9 "`engine_list`" — each guest is the unit of execution the
    /// dispatch loop drives).
    pub(crate) guests: Vec<Guest>,
    /// VT-d's remapping engine, absent when the platform has none or DMA
    /// remapping was disabled at init (§9 "`g_remapping`").
    pub(crate) vtd: Option<VtdSubsystem>,
    /// Which guest owns which PCI device, consulted by the MMCFG trap
    /// before falling through to that guest's own block list.
    pub(crate) pci_block_guest: Vec<PciBlockGuestEntry>,
    pub(crate) acpi: AcpiSingletons,
}

static GLOBAL: Once<Mutex<GlobalState>> = Once::new();

/// Installs the singleton. Must run exactly once, on the BSP, before any AP
/// leaves the startup barrier; a second call is a programming error.
pub(crate) fn init(state: GlobalState) {
    let installed = GLOBAL.call_once(|| Mutex::new(state));
    debug_assert!(core::ptr::eq(installed, GLOBAL.get().unwrap()), "global_state::init called twice");
}

/// Runs `f` with exclusive access to the singleton. Panics if called before
/// [`init`] — every caller only runs after the startup barrier.
pub(crate) fn with_global<R>(f: impl FnOnce(&mut GlobalState) -> R) -> R {
    let lock = GLOBAL.get().expect("global_state::with_global called before init");
    f(&mut lock.lock())
}

/// This host CPU's APIC ID, used to index a guest's per-vCPU table
/// (§9's global accessors are keyed by this everywhere a broadcast IPC
/// trampoline needs to find "my own" vCPU).
pub(crate) fn current_host_cpu_id() -> u32 {
    apic_id()
}

impl GlobalState {
    /// This CPU's own APIC ID, exposed as a method so call sites that
    /// already hold `&mut GlobalState` (inside [`with_global`]) don't need
    /// a second free-function import.
    pub(crate) fn current_host_cpu_id(&self) -> u32 {
        current_host_cpu_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_block_guest_entry_round_trips_bdf_and_owner() {
        let entry = PciBlockGuestEntry { bdf: Bdf { bus: 0, device: 2, function: 0 }, guest_id: 7 };
        assert_eq!(entry.bdf.bus, 0);
        assert_eq!(entry.guest_id, 7);
    }
}
