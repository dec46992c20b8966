//! VMCS-dump debug surface (§2 "debug aids").
//!
//! Mirrors the teacher's approach of reading VMCS fields straight off
//! hardware for diagnostics, but as a standalone dump a panic can trigger
//! rather than a `Debug` impl a caller must already hold a `&Vmcs` to use:
//! a fatal monitor error has no live `Gcpu` to borrow, only whatever VMCS
//! happens to be current on the CPU that panicked.

use log::error;
use x86::vmx::vmcs;

fn read(field: u32) -> Option<u64> {
    // Safety: the caller has already confirmed a VMCS is current via
    // `VMPTRST` before calling this.
    unsafe { x86::vmx::vmcs::vmread(field) }.ok()
}

/// Dumps a representative subset of VMCS fields for whichever VMCS is
/// currently loaded on this CPU, or logs nothing useful to dump if none is.
pub(crate) fn dump_current_vmcs() {
    use x86::controlregs::Cr4;
    if !crate::x86_instructions::cr4().contains(Cr4::CR4_ENABLE_VMX) {
        error!("VMCS dump: CR4.VMXE is clear, no VMX operation to inspect");
        return;
    }

    // Safety: `VMPTRST` has no preconditions beyond VMX operation being
    // active, which was just confirmed above.
    let current = unsafe { x86::vmx::vmptrst() };
    let hpa = match current {
        Ok(hpa) if hpa != u64::MAX => hpa,
        _ => {
            error!("VMCS dump: no VMCS is currently loaded on this CPU");
            return;
        }
    };

    error!("-- VMCS dump (current pointer {hpa:#x}) --");

    macro_rules! dump {
        ($label:literal, $field:expr) => {
            if let Some(value) = read($field) {
                error!("{:<40}: {:#x}", $label, value);
            }
        };
    }

    dump!("Exit reason", vmcs::ro::EXIT_REASON);
    dump!("Exit qualification", vmcs::ro::EXIT_QUALIFICATION);
    dump!("VM-instruction error", vmcs::ro::VM_INSTRUCTION_ERROR);
    dump!("Guest-physical address", vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);
    dump!("Guest-linear address", vmcs::ro::GUEST_LINEAR_ADDR);
    dump!("IDT-vectoring information field", vmcs::ro::IDT_VECTORING_INFO);
    dump!("IDT-vectoring error code", vmcs::ro::IDT_VECTORING_ERR_CODE);
    dump!("VM-exit instruction length", vmcs::ro::VMEXIT_INSTRUCTION_LEN);
    dump!("VM-exit interruption information", vmcs::ro::VMEXIT_INTERRUPTION_INFO);
    dump!("VM-exit interruption error code", vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE);
    dump!("Guest CR0", vmcs::guest::CR0);
    dump!("Guest CR3", vmcs::guest::CR3);
    dump!("Guest CR4", vmcs::guest::CR4);
    dump!("Guest RIP", vmcs::guest::RIP);
    dump!("Guest RSP", vmcs::guest::RSP);
    dump!("Guest RFLAGS", vmcs::guest::RFLAGS);
    dump!("Guest interruptibility state", vmcs::guest::INTERRUPTIBILITY_STATE);
    dump!("VM-entry interruption-information field", vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD);
    dump!("EPT pointer", vmcs::control::EPTP_FULL);
}
