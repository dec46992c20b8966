//! Captures the processor's own live state into a VMCS's guest-state area
//! (§4.M "late-launch": a guest is not booted from reset, it is the OS
//! already running on this core at the moment the monitor installs itself
//! underneath it).
//!
//! Grounded in the teacher's `Vmx::revert_registers` (which restores a
//! snapshot's frozen register set field-by-field) and its segment-descriptor
//! helpers in `hardware_vt::mod`, but reading *this core's own* live
//! descriptor tables instead of a snapshot's, since there is no snapshot:
//! the guest-to-be is whatever was executing when [`capture_current`] runs.

use crate::vmcs::{Level, Vmcs};
use crate::x86_instructions::{cr0, cr3, cr4, rdmsr, sgdt, sidt, sldt, str};
use x86::current::paging::BASE_PAGE_SHIFT;
use x86::msr;
use x86::segmentation::{cs, ds, es, fs, gs, ss};
use x86::vmx::vmcs;

fn segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    // Safety: `table_base` names the currently loaded GDT, read immediately
    // before this call via `sgdt`.
    unsafe { *((table_base + u64::from(sel.index() * 8)) as *const u64) }
}

fn segment_limit(table_base: u64, selector: u16) -> u32 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return 0;
    }
    let value = segment_descriptor_value(table_base, selector);
    let limit_low = value & 0xFFFF;
    let limit_high = (value >> (32 + 16)) & 0xF;
    let mut limit = limit_low | (limit_high << 16);
    if (value >> (32 + 23)) & 1 != 0 {
        limit = ((limit + 1) << BASE_PAGE_SHIFT) - 1;
    }
    limit as u32
}

fn segment_access_rights(table_base: u64, selector: u16) -> u32 {
    const UNUSABLE: u32 = 1 << 16;
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 && (sel.bits() >> 2) == 0 {
        return UNUSABLE;
    }
    let value = segment_descriptor_value(table_base, selector);
    ((value >> 40) as u32) & 0b1111_0000_1111_1111
}

/// Writes every guest-state field this crate tracks from the processor's own
/// live context, except `RIP`/`RSP`/`RFLAGS`, which the caller supplies
/// explicitly: on a late launch these name the instruction right after the
/// call into this function, not anything readable from a register snapshot
/// taken mid-call.
pub(crate) fn capture_current(vmcs: &mut Vmcs, rip: u64, rsp: u64, rflags: u64) {
    let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    sgdt(&mut gdtr);
    let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    sidt(&mut idtr);
    let table_base = gdtr.base as u64;

    let tr = str();
    let ldtr = sldt();

    for (selector_field, access_field, limit_field, selector) in [
        (vmcs::guest::ES_SELECTOR, vmcs::guest::ES_ACCESS_RIGHTS, vmcs::guest::ES_LIMIT, es().bits()),
        (vmcs::guest::CS_SELECTOR, vmcs::guest::CS_ACCESS_RIGHTS, vmcs::guest::CS_LIMIT, cs().bits()),
        (vmcs::guest::SS_SELECTOR, vmcs::guest::SS_ACCESS_RIGHTS, vmcs::guest::SS_LIMIT, ss().bits()),
        (vmcs::guest::DS_SELECTOR, vmcs::guest::DS_ACCESS_RIGHTS, vmcs::guest::DS_LIMIT, ds().bits()),
        (vmcs::guest::FS_SELECTOR, vmcs::guest::FS_ACCESS_RIGHTS, vmcs::guest::FS_LIMIT, fs().bits()),
        (vmcs::guest::GS_SELECTOR, vmcs::guest::GS_ACCESS_RIGHTS, vmcs::guest::GS_LIMIT, gs().bits()),
        (vmcs::guest::TR_SELECTOR, vmcs::guest::TR_ACCESS_RIGHTS, vmcs::guest::TR_LIMIT, tr),
        (vmcs::guest::LDTR_SELECTOR, vmcs::guest::LDTR_ACCESS_RIGHTS, vmcs::guest::LDTR_LIMIT, ldtr),
    ] {
        vmcs.write(selector_field, u64::from(selector), Level::Level0);
        vmcs.write(access_field, u64::from(segment_access_rights(table_base, selector)), Level::Level0);
        vmcs.write(limit_field, u64::from(segment_limit(table_base, selector)), Level::Level0);
    }

    vmcs.write(vmcs::guest::FS_BASE, rdmsr(msr::IA32_FS_BASE), Level::Level0);
    vmcs.write(vmcs::guest::GS_BASE, rdmsr(msr::IA32_GS_BASE), Level::Level0);
    vmcs.write(vmcs::guest::TR_BASE, segment_descriptor_value(table_base, tr) >> 16 & 0xFF_FFFF, Level::Level0);
    vmcs.write(vmcs::guest::LDTR_BASE, 0, Level::Level0);
    vmcs.write(vmcs::guest::GDTR_BASE, gdtr.base as u64, Level::Level0);
    vmcs.write(vmcs::guest::GDTR_LIMIT, u64::from(gdtr.limit), Level::Level0);
    vmcs.write(vmcs::guest::IDTR_BASE, idtr.base as u64, Level::Level0);
    vmcs.write(vmcs::guest::IDTR_LIMIT, u64::from(idtr.limit), Level::Level0);

    vmcs.write(vmcs::guest::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS), Level::Level0);
    vmcs.write(vmcs::guest::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP), Level::Level0);
    vmcs.write(vmcs::guest::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP), Level::Level0);
    vmcs.write(vmcs::guest::IA32_EFER_FULL, rdmsr(msr::IA32_EFER), Level::Level0);

    vmcs.write(vmcs::guest::CR0, cr0().bits() as u64, Level::Level0);
    vmcs.write(vmcs::guest::CR3, cr3(), Level::Level0);
    vmcs.write(vmcs::guest::CR4, cr4().bits() as u64, Level::Level0);

    vmcs.write(vmcs::guest::RIP, rip, Level::Level0);
    vmcs.write(vmcs::guest::RSP, rsp, Level::Level0);
    vmcs.write(vmcs::guest::RFLAGS, rflags, Level::Level0);

    vmcs.write(vmcs::guest::LINK_PTR_FULL, u64::MAX, Level::Level0);
    vmcs.write(vmcs::guest::INTERRUPTIBILITY_STATE, 0, Level::Level0);
    vmcs.write(vmcs::guest::ACTIVITY_STATE, 0, Level::Level0);
}
