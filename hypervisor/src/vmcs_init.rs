//! Per-vCPU VMCS control-field bring-up (§4.H "Policy knobs", §4.G
//! start-up).
//!
//! Builds the eight [`ControlGroup`] accountants from the platform's VMX
//! capability MSRs, grounded in the teacher's `adjust_vmx_control`/
//! `adjust_cr0`/`adjust_feature_control_msr`, then wires a fresh VMCS's
//! control area, host-state area and guest-state area together the one time
//! a vCPU is created.

use crate::accountant::ControlGroup;
use crate::ept::Ept;
use crate::gcpu::{Gcpu, GpRegisters, IdtVectoringState, PendingInterruptBitmap, VmexitSetup, XmmRegisters};
use crate::guest_state;
use crate::host_state::HostState;
use crate::vmcs::{Level, Vmcs};
use crate::x86_instructions::{cr0, cr0_write, rdmsr, wrmsr};
use x86::controlregs::Cr0;
use x86::msr;
use x86::vmx::vmcs;

/// Which capability MSR a control group is adjusted against (teacher's
/// `VmxControl`, generalized to cover exit/entry controls too).
#[derive(Clone, Copy)]
enum Capability {
    PinBased,
    ProcBasedPrimary,
    ProcBasedSecondary,
    VmExit,
    VmEntry,
}

/// Splits a capability MSR's value into `(allowed_0, allowed_1)`, selecting
/// the TRUE or legacy MSR per `IA32_VMX_BASIC` bit 55 (teacher's
/// `adjust_vmx_control`).
fn allowed_bits(cap: Capability) -> (u32, u32) {
    const TRUE_CTLS_FLAG: u64 = 1 << 55;
    let vmx_basic = rdmsr(msr::IA32_VMX_BASIC);
    let true_supported = vmx_basic & TRUE_CTLS_FLAG != 0;

    let cap_msr = match (cap, true_supported) {
        (Capability::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (Capability::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (Capability::ProcBasedPrimary, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (Capability::ProcBasedPrimary, false) => msr::IA32_VMX_PROCBASED_CTLS,
        // No TRUE MSR exists for the secondary controls.
        (Capability::ProcBasedSecondary, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        (Capability::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (Capability::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (Capability::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (Capability::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
    };

    let value = rdmsr(cap_msr);
    (value as u32, (value >> 32) as u32)
}

fn capability_group(cap: Capability, required_1: u32) -> ControlGroup {
    let (allowed_0, allowed_1) = allowed_bits(cap);
    ControlGroup::new(allowed_0, allowed_1, required_1)
}

/// Bits this monitor always wants set, beyond whatever each component
/// requests through the accountant later (§4.H "Policy knobs").
mod baseline {
    pub(super) const PROC_BASED_PRIMARY_ACTIVATE_SECONDARY: u32 = 1 << 31;
    pub(super) const PROC_BASED_SECONDARY_ENABLE_EPT: u32 = 1 << 1;
    pub(super) const PROC_BASED_SECONDARY_ENABLE_RDTSCP: u32 = 1 << 3;
    pub(super) const PROC_BASED_SECONDARY_ENABLE_INVPCID: u32 = 1 << 12;
    pub(super) const PROC_BASED_SECONDARY_ENABLE_XSAVES: u32 = 1 << 20;
    pub(super) const VM_EXIT_HOST_ADDR_SPACE_SIZE: u32 = 1 << 9;
    pub(super) const VM_EXIT_ACK_INTERRUPT_ON_EXIT: u32 = 1 << 15;
    pub(super) const VM_ENTRY_IA32E_MODE_GUEST: u32 = 1 << 9;
}

/// Builds the eight [`ControlGroup`] accountants for a fresh `Gcpu`, each
/// seeded with its capability MSR's allowed bits plus this monitor's
/// baseline requirements. The exception bitmap and the CR0/CR4 guest/host
/// masks have no capability MSR of their own — they are pure software
/// fields — so every bit is left flexible (§4.H).
pub(crate) fn build_vmexit_setup() -> VmexitSetup {
    VmexitSetup {
        pin_based: capability_group(Capability::PinBased, 0),
        proc_based_primary: capability_group(
            Capability::ProcBasedPrimary,
            baseline::PROC_BASED_PRIMARY_ACTIVATE_SECONDARY,
        ),
        proc_based_secondary: capability_group(
            Capability::ProcBasedSecondary,
            baseline::PROC_BASED_SECONDARY_ENABLE_EPT
                | baseline::PROC_BASED_SECONDARY_ENABLE_RDTSCP
                | baseline::PROC_BASED_SECONDARY_ENABLE_INVPCID
                | baseline::PROC_BASED_SECONDARY_ENABLE_XSAVES,
        ),
        exception_bitmap: ControlGroup::new(0, 0xFFFF_FFFF, 0),
        exit_controls: capability_group(
            Capability::VmExit,
            baseline::VM_EXIT_HOST_ADDR_SPACE_SIZE | baseline::VM_EXIT_ACK_INTERRUPT_ON_EXIT,
        ),
        entry_controls: capability_group(Capability::VmEntry, baseline::VM_ENTRY_IA32E_MODE_GUEST),
        cr0_mask: ControlGroup::new(0, 0xFFFF_FFFF, 0),
        cr4_mask: ControlGroup::new(0, 0xFFFF_FFFF, 0),
    }
}

/// Writes every [`ControlGroup`]'s `apply_only()` result into the VMCS,
/// skipping fields whose computed value has not changed since the last call
/// (§4.H "writing the VMCS only when the computed value actually changes").
pub(crate) fn apply(setup: &mut VmexitSetup, vmcs: &mut Vmcs) {
    if let Some(v) = setup.pin_based.apply_only() {
        vmcs.write(vmcs::control::PINBASED_EXEC_CONTROLS, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.proc_based_primary.apply_only() {
        vmcs.write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.proc_based_secondary.apply_only() {
        vmcs.write(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.exception_bitmap.apply_only() {
        vmcs.write(vmcs::control::EXCEPTION_BITMAP, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.exit_controls.apply_only() {
        vmcs.write(vmcs::control::VMEXIT_CONTROLS, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.entry_controls.apply_only() {
        vmcs.write(vmcs::control::VMENTRY_CONTROLS, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.cr0_mask.apply_only() {
        vmcs.write(vmcs::control::CR0_GUEST_HOST_MASK, u64::from(v), Level::Merged);
    }
    if let Some(v) = setup.cr4_mask.apply_only() {
        vmcs.write(vmcs::control::CR4_GUEST_HOST_MASK, u64::from(v), Level::Merged);
    }
}

/// Clears CR0's VMX-fixed bits into range (teacher's `adjust_cr0`; its own
/// comment notes CR4 is always already satisfied in practice, so only CR0
/// needs adjusting here).
pub(crate) fn adjust_host_cr0() {
    let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
    let mut new_cr0 = cr0().bits() as u64;
    new_cr0 &= fixed1;
    new_cr0 |= fixed0;
    cr0_write(Cr0::from_bits_truncate(new_cr0 as usize));
}

/// Sets the `IA32_FEATURE_CONTROL` lock and VMXON-outside-SMX bits if they
/// are not already set, the precondition `VMXON` requires (teacher's
/// `adjust_feature_control_msr`).
pub(crate) fn adjust_feature_control_msr() {
    const LOCK_BIT: u64 = 1 << 0;
    const ENABLE_VMX_OUTSIDE_SMX: u64 = 1 << 2;
    let feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);
    if feature_control & LOCK_BIT == 0 {
        wrmsr(msr::IA32_FEATURE_CONTROL, feature_control | ENABLE_VMX_OUTSIDE_SMX | LOCK_BIT);
    }
}

/// Builds a brand-new [`Gcpu`] for a late-launch guest: `VMCLEAR`s and
/// `VMPTRLD`s its VMCS, programs this core's host-state area, captures this
/// core's own live context as the guest-state area (§4.M late-launch),
/// wires the EPT pointer, and applies the baseline control-field settings.
/// `rip`/`rsp`/`rflags` name the continuation point execution resumes at
/// once this vCPU is first entered.
pub(crate) fn create_gcpu(
    guest_id: u32,
    host_cpu_id: u32,
    host_state: &HostState,
    ept: &Ept,
    rip: u64,
    rsp: u64,
    rflags: u64,
) -> Gcpu {
    let mut vmcs = Vmcs::new(crate::vmcs::vmcs_revision_id());
    vmcs.clr_ptr();
    vmcs.set_ptr();

    host_state.program(&mut vmcs);
    guest_state::capture_current(&mut vmcs, rip, rsp, rflags);
    vmcs.write(vmcs::control::EPTP_FULL, ept.eptp(), Level::Level0);

    let mut vmexit_setup = build_vmexit_setup();
    apply(&mut vmexit_setup, &mut vmcs);

    Gcpu {
        vmcs,
        gp: GpRegisters::default(),
        xmm: XmmRegisters::default(),
        pending_interrupts: PendingInterruptBitmap::default(),
        cr_write_handlers: [None; crate::config::MAX_CR_WRITE_HANDLERS],
        idt_vectoring: IdtVectoringState::default(),
        vmexit_setup,
        guest_id,
        host_cpu_id,
        cr0_shadow: 0,
        cr4_shadow: 0,
        running_level1: false,
    }
}
