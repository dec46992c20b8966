//! VMEnter Consistency Checker (§4.N).
//!
//! Triggered only after a `VM_ENTRY_FAILURE_INVALID_GUEST_STATE` or
//! `..._MSR_LOADING` VM-instruction-error; walks the guest/host/control
//! invariants Intel SDM §26.2-26.4 enumerate, logs every violation found,
//! then deadlocks. This never runs on the fast path — it exists purely to
//! turn an otherwise-opaque VM-entry failure into an actionable log.

use crate::error::vmm_deadloop;
use crate::gcpu::Gcpu;
use crate::vmcs::Level;
use x86::vmx::vmcs;

/// One violated invariant, named for the log line it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Violation {
    Cr0FixedBits,
    Cr4FixedBits,
    EferLmaLmeConsistency,
    GdtrIdtrNotCanonical,
    RipNotCanonical,
    RflagsReservedBits,
    PdpteReservedBits,
}

/// Checks `CR0`/`CR4` against the IA32_VMX_CR{0,4}_FIXED{0,1} MSRs: every
/// bit fixed to 1 must be 1, every bit fixed to 0 must be 0 (SDM §26.2.1.1).
fn check_cr_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> bool {
    (value | fixed0) == value && (value & fixed1) == value
}

/// `EFER.LMA` must equal `EFER.LME AND CR0.PG` whenever the "IA-32e mode
/// guest" entry control and unrestricted-guest semantics require
/// consistency (SDM §26.2.3).
fn check_efer_lma_consistency(efer: u64, cr0: u64, ia32e_mode_guest: bool) -> bool {
    let lma = efer & (1 << 10) != 0;
    let lme = efer & (1 << 8) != 0;
    let pg = cr0 & (1 << 31) != 0;
    if !ia32e_mode_guest {
        !lma
    } else {
        lma == (lme && pg)
    }
}

fn is_canonical(addr: u64) -> bool {
    let top17 = addr >> 47;
    top17 == 0 || top17 == 0x1_FFFF
}

/// PAE PDPTEs' reserved bits (`[2:1]`, `[8:5]`, and `[63:MAXPHYADDR]`) must
/// be zero when CR0.PG=1, CR4.PAE=1, and not in IA-32e mode (SDM §26.3.2.4).
fn check_pdpte_reserved_bits(pdpte: u64, max_phys_addr: u8) -> bool {
    const RESERVED_LOW: u64 = 0b0000_0110;
    const RESERVED_MID: u64 = 0b1_1110_0000;
    if pdpte & (RESERVED_LOW | RESERVED_MID) != 0 {
        return false;
    }
    let high_mask = !0u64 << max_phys_addr;
    pdpte & high_mask == 0
}

/// Walks every invariant this checker names against `gcpu`'s current VMCS
/// field values, returning every one that fails (empty if the VM-entry
/// failure's cause lies outside this checker's enumerated set).
pub(crate) fn audit(gcpu: &Gcpu, cr0_fixed0: u64, cr0_fixed1: u64, cr4_fixed0: u64, cr4_fixed1: u64, max_phys_addr: u8) -> alloc::vec::Vec<Violation> {
    let mut violations = alloc::vec::Vec::new();

    let cr0 = gcpu.vmcs.read(vmcs::guest::CR0, Level::Level0);
    let cr4 = gcpu.vmcs.read(vmcs::guest::CR4, Level::Level0);
    if !check_cr_fixed_bits(cr0, cr0_fixed0, cr0_fixed1) {
        violations.push(Violation::Cr0FixedBits);
    }
    if !check_cr_fixed_bits(cr4, cr4_fixed0, cr4_fixed1) {
        violations.push(Violation::Cr4FixedBits);
    }

    let efer = gcpu.vmcs.read(vmcs::guest::IA32_EFER_FULL, Level::Level0);
    let entry_controls = gcpu.vmcs.read(vmcs::control::VMENTRY_CONTROLS, Level::Level0);
    const IA32E_MODE_GUEST: u64 = 1 << 9;
    if !check_efer_lma_consistency(efer, cr0, entry_controls & IA32E_MODE_GUEST != 0) {
        violations.push(Violation::EferLmaLmeConsistency);
    }

    let gdtr_base = gcpu.vmcs.read(vmcs::guest::GDTR_BASE, Level::Level0);
    let idtr_base = gcpu.vmcs.read(vmcs::guest::IDTR_BASE, Level::Level0);
    if !is_canonical(gdtr_base) || !is_canonical(idtr_base) {
        violations.push(Violation::GdtrIdtrNotCanonical);
    }

    if entry_controls & IA32E_MODE_GUEST != 0 {
        let cs_l = gcpu.vmcs.read(vmcs::guest::CS_ACCESS_RIGHTS, Level::Level0) & (1 << 13) != 0;
        let rip = gcpu.vmcs.read(vmcs::guest::RIP, Level::Level0);
        if cs_l && !is_canonical(rip) {
            violations.push(Violation::RipNotCanonical);
        }
    }

    let rflags = gcpu.vmcs.read(vmcs::guest::RFLAGS, Level::Level0);
    const RESERVED_MBZ: u64 = !0x0003_7FD7;
    const RESERVED_MB1: u64 = 1 << 1;
    if rflags & RESERVED_MBZ != 0 || rflags & RESERVED_MB1 == 0 {
        violations.push(Violation::RflagsReservedBits);
    }

    let cr4_pae = cr4 & (1 << 5) != 0;
    if cr0 & (1 << 31) != 0 && cr4_pae && entry_controls & IA32E_MODE_GUEST == 0 {
        for field in
            [vmcs::guest::PDPTE0_FULL, vmcs::guest::PDPTE1_FULL, vmcs::guest::PDPTE2_FULL, vmcs::guest::PDPTE3_FULL]
        {
            let pdpte = gcpu.vmcs.read(field, Level::Level0);
            if pdpte & 1 != 0 && !check_pdpte_reserved_bits(pdpte, max_phys_addr) {
                violations.push(Violation::PdpteReservedBits);
                break;
            }
        }
    }

    violations
}

/// Logs every violation found, then deadlocks (§4.N "Each violation is
/// logged; after the sweep, deadloop.").
pub(crate) fn audit_and_deadloop(
    gcpu: &Gcpu,
    cr0_fixed0: u64,
    cr0_fixed1: u64,
    cr4_fixed0: u64,
    cr4_fixed1: u64,
    max_phys_addr: u8,
) -> ! {
    let violations = audit(gcpu, cr0_fixed0, cr0_fixed1, cr4_fixed0, cr4_fixed1, max_phys_addr);
    for v in &violations {
        log::error!("VM-entry consistency violation: {v:?}");
    }
    vmm_deadloop!("VM-entry failed consistency audit with {} violation(s)", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_fixed_bits_reject_forced_zero_and_forced_one_violations() {
        // bit 0 fixed to 1, bit 1 fixed to 0.
        let fixed0 = 0b01;
        let fixed1 = 0b01;
        assert!(check_cr_fixed_bits(0b01, fixed0, fixed1));
        assert!(!check_cr_fixed_bits(0b00, fixed0, fixed1)); // bit 0 must be 1
        assert!(!check_cr_fixed_bits(0b11, fixed0, fixed1)); // bit 1 must be 0
    }

    #[test]
    fn efer_lma_consistency_matches_lme_and_pg() {
        let lme_pg = (1 << 8) | (1u64 << 10);
        assert!(check_efer_lma_consistency(lme_pg, 1 << 31, true));
        assert!(!check_efer_lma_consistency(1 << 8, 1 << 31, true)); // LME+PG but LMA=0
        assert!(check_efer_lma_consistency(0, 0, false));
        assert!(!check_efer_lma_consistency(1 << 10, 0, false)); // LMA set without the mode
    }

    #[test]
    fn canonical_address_check_matches_48_bit_sign_extension() {
        assert!(is_canonical(0x0000_7FFF_FFFF_FFFF));
        assert!(is_canonical(0xFFFF_8000_0000_0000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
    }

    #[test]
    fn pdpte_reserved_bits_reject_nonzero_reserved_ranges() {
        assert!(check_pdpte_reserved_bits(0b0000_0001, 40));
        assert!(!check_pdpte_reserved_bits(0b0000_0010, 40));
        assert!(!check_pdpte_reserved_bits(1u64 << 52, 40));
    }
}
