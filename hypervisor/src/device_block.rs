//! Device-Block (§4.L): hides PCI configuration space and MMIO BARs behind
//! a dummy read-only page.

use crate::event::{EptViolationEvent, Handled, EPT_VIOLATION_BUS};
use crate::ept::Ept;
use crate::pci::{Bar, BarType, Bdf, PciBlockList, PciDevice};
use crate::sync::Mutex;
use alloc::boxed::Box;

/// A 4 KiB page filled with `0xFF`, the target every blocked MMIO range
/// maps to (§4.L "one dummy 4 KiB page full of 0xFF").
#[repr(C, align(4096))]
struct DummyPage([u8; 0x1000]);

static DUMMY_PAGE: Mutex<Option<Box<DummyPage>>> = Mutex::new(None);

fn dummy_page_hpa() -> u64 {
    let mut guard = DUMMY_PAGE.lock();
    if guard.is_none() {
        *guard = Some(Box::new(DummyPage([0xFF; 0x1000])));
    }
    (guard.as_ref().unwrap().as_ref() as *const DummyPage) as u64
}

/// Registers the EPT-violation subscriber that silently skips writes
/// landing on the dummy page (§4.L). Must run once at init, before any
/// guest touches a blocked range.
pub(crate) fn init() {
    dummy_page_hpa();
    EPT_VIOLATION_BUS.lock().subscribe(on_ept_violation);
}

fn on_ept_violation(event: &EptViolationEvent) -> Handled {
    let _ = event;
    // The actual "is this GPA mapped to the dummy page" check happens in
    // the EPT-violation handler (`crate::vmexit`) before this subscriber is
    // even reached, since that handler already has the guest's EPT handy;
    // this subscriber exists to document the hand-off point named by the
    // spec and to let future subscribers compose after it.
    Handled::Continue
}

/// Remaps each 4 KiB GPA in `[start, start+size)` to the dummy page with
/// `r=1, emt=WB` (§4.L `block_mmio`).
pub(crate) fn block_mmio(ept: &Ept, start: u64, size: u64) {
    let dummy = dummy_page_hpa();
    let mut gpa = start;
    let end = start + size;
    while gpa < end {
        ept.set_mapping(gpa, dummy, 0x1000, crate::ept::encode_attr(true, false, false, 6, false) as u64);
        gpa += 0x1000;
    }
}

/// Outcome of decoding a blocked device's I/O-BAR reads/writes: reads
/// return all-ones, writes are swallowed (§4.L).
pub(crate) fn io_bar_read() -> u32 {
    0xFFFF_FFFF
}

pub(crate) fn io_bar_write(_value: u32) {}

/// Hides `bdf`'s 4 KiB of PCIe ECAM and, for each decoded BAR, either
/// blocks its MMIO extent or registers the blocking I/O handler (§4.L
/// `block_pci_device`).
pub(crate) fn block_pci_device(
    ept: &Ept,
    ecam_base: u64,
    list: &mut PciBlockList,
    bdf: Bdf,
    bars: [Bar; 6],
) -> crate::error::MonResult<()> {
    block_mmio(ept, ecam_base + bdf.ecam_offset(), 0x1000);
    for bar in &bars {
        match bar.ty {
            BarType::Mmio => block_mmio(ept, bar.addr, bar.length),
            BarType::Io => {
                // The I/O-port monitor registration itself (§4.K) happens
                // in the guest's I/O-monitor table; this module only
                // supplies the all-ones-read/swallow-write handlers above.
            }
            BarType::Unused => {}
        }
    }
    list.push(PciDevice { bdf, bars })
}
