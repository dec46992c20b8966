//! Host-state area programming for a VMCS (SDM §24.5, §27.2.3 "Checks on
//! Host Segment and Descriptor-Table Registers").
//!
//! One [`HostState`] is built once per physical core, the moment that core
//! enables VMX (§4.M start-up), and is then reused by every [`Vmcs`] that
//! core ever runs: `HOST_CS_SELECTOR`/`HOST_TR_SELECTOR` cannot be zero, and
//! the UEFI DXE phase's Task Register is zero, so a private GDT with a
//! freshly built TSS descriptor is appended the same way the teacher's
//! `HostGdt` does it.

use crate::vmcs::{Level, Vmcs};
use crate::x86_instructions::{cr0, cr3, cr4, sgdt, sidt};
use alloc::vec::Vec;
use x86::dtables::DescriptorTablePointer;
use x86::segmentation::{BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder, SegmentSelector};
use x86::vmx::vmcs;

/// See: Figure 8-11. 64-Bit TSS Format.
struct TaskStateSegment([u8; 104]);

/// The per-core host GDT/TSS plus the IDTR every VMCS on this core shares.
pub(crate) struct HostState {
    gdt: Vec<u64>,
    gdtr: DescriptorTablePointer<u64>,
    idtr: DescriptorTablePointer<u64>,
    tss: TaskStateSegment,
    tr: SegmentSelector,
    cs: SegmentSelector,
}

impl HostState {
    /// Clones the current GDT, appends a TSS descriptor, and captures the
    /// current IDTR, so the result is a valid, stable host-state source for
    /// every VMCS this core will ever own.
    ///
    /// # Safety
    /// Must run once per physical core, before that core's first `VMPTRLD`.
    pub(crate) fn build_from_current() -> Self {
        let mut current_gdtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut current_gdtr);
        // Safety: `current_gdtr` was just populated by `sgdt` and describes
        // the live GDT for this core.
        let current_gdt = unsafe {
            core::slice::from_raw_parts(current_gdtr.base.cast::<u64>(), usize::from(current_gdtr.limit + 1) / 8)
        };
        let mut gdt = current_gdt.to_vec();
        let tss = TaskStateSegment([0; 104]);
        gdt.push(task_segment_descriptor(&tss));

        let mut gdtr = DescriptorTablePointer::<u64>::default();
        gdtr.base = gdt.as_ptr();
        gdtr.limit = u16::try_from(gdt.len() * 8 - 1).expect("host GDT grew past 64 KiB");

        let tr_index = gdt.len() as u16 - 1;
        let tr = SegmentSelector::new(tr_index, x86::Ring::Ring0);
        let cs = x86::segmentation::cs();

        let mut idtr = DescriptorTablePointer::<u64>::default();
        sidt(&mut idtr);

        Self { gdt, gdtr, idtr, tss, tr, cs }
    }

    /// Writes this core's host-state fields into `vmcs` at `Level0`. RSP/RIP
    /// are intentionally not written here; [`crate::vmentry::run`]
    /// reprograms them on every VM-entry.
    pub(crate) fn program(&self, vmcs: &mut Vmcs) {
        let _ = &self.gdt; // kept alive by `self`; `gdtr.base` points into it.
        vmcs.write(vmcs::host::CS_SELECTOR, u64::from(self.cs.bits()), Level::Level0);
        vmcs.write(vmcs::host::TR_SELECTOR, u64::from(self.tr.bits()), Level::Level0);
        vmcs.write(vmcs::host::CR0, cr0().bits() as u64, Level::Level0);
        vmcs.write(vmcs::host::CR3, cr3(), Level::Level0);
        vmcs.write(vmcs::host::CR4, cr4().bits() as u64, Level::Level0);
        vmcs.write(vmcs::host::TR_BASE, core::ptr::addr_of!(self.tss) as u64, Level::Level0);
        vmcs.write(vmcs::host::GDTR_BASE, self.gdtr.base as u64, Level::Level0);
        vmcs.write(vmcs::host::IDTR_BASE, self.idtr.base as u64, Level::Level0);
    }
}

/// Builds a segment descriptor from the host TSS, matching the teacher's
/// `task_segment_descriptor`.
fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = core::mem::size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let tss_descriptor =
        <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(tss_base, tss_size - 1, true)
            .present()
            .dpl(x86::Ring::Ring0)
            .finish();
    // Safety: `tss_descriptor` is a valid 64-bit segment descriptor; this
    // reinterprets its bit pattern as the raw `u64` the GDT array stores.
    unsafe { core::mem::transmute::<Descriptor, u64>(tss_descriptor) }
}
