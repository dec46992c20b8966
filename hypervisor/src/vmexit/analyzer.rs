//! Replicates "would this VMCS have caused this exit?" for the L1 guest
//! (§4.I "The analyzer replicates the Intel architectural rules...").
//!
//! The analyzer never mutates anything; it answers a single yes/no question
//! against an L1 VMCS's controls for one VMExit reason, using whatever
//! qualification the exit carried.

use crate::gcpu::Gcpu;
use crate::vmcs::Level;
use x86::vmx::vmcs;

/// The VMExit's basic exit reason (§6 "60 reasons (0..59)").
pub(crate) type ExitReason = u16;

pub(crate) const EXIT_REASON_EXCEPTION_OR_NMI: ExitReason = 0;
pub(crate) const EXIT_REASON_CR_ACCESS: ExitReason = 28;
pub(crate) const EXIT_REASON_IO_INSTRUCTION: ExitReason = 30;
pub(crate) const EXIT_REASON_MSR_READ: ExitReason = 31;
pub(crate) const EXIT_REASON_MSR_WRITE: ExitReason = 32;
pub(crate) const EXIT_REASON_PREEMPTION_TIMER: ExitReason = 52;

/// Everything the analyzer needs to know about a CR-access exit's
/// qualification, decoded once by the caller.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CrAccessQualification {
    pub(crate) cr_number: u8,
    pub(crate) is_write: bool,
    pub(crate) is_mov_to_cr3: bool,
}

/// Whether L1's CR0/CR4 guest/host mask+shadow, or CR3-target list, would
/// have intercepted this CR access (§4.I analyzer, "CR-access checks
/// mask/shadow and CR3-target list").
pub(crate) fn cr_access_would_exit_l1(gcpu: &Gcpu, q: CrAccessQualification, new_cr3: Option<u64>) -> bool {
    match q.cr_number {
        0 => {
            let mask = gcpu.vmcs.read(vmcs::control::CR0_GUEST_HOST_MASK, Level::Level1);
            mask != 0
        }
        4 => {
            let mask = gcpu.vmcs.read(vmcs::control::CR4_GUEST_HOST_MASK, Level::Level1);
            mask != 0
        }
        3 if q.is_mov_to_cr3 => {
            let exiting = l1_cr3_load_exiting(gcpu);
            if !exiting {
                return false;
            }
            let Some(new_cr3) = new_cr3 else { return true };
            !cr3_target_list_matches(gcpu, new_cr3)
        }
        _ => true,
    }
}

fn l1_cr3_load_exiting(gcpu: &Gcpu) -> bool {
    const CR3_LOAD_EXITING: u64 = 1 << 15;
    gcpu.vmcs.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, Level::Level1) & CR3_LOAD_EXITING != 0
}

/// Up to 4 CR3-target values exempt a `MOV CR3` from exiting even when
/// `CR3_LOAD_EXITING` is set (SDM §25.1.3).
fn cr3_target_list_matches(gcpu: &Gcpu, new_cr3: u64) -> bool {
    const TARGETS: [u32; 4] =
        [vmcs::control::CR3_TARGET_VALUE_0, vmcs::control::CR3_TARGET_VALUE_1, vmcs::control::CR3_TARGET_VALUE_2, vmcs::control::CR3_TARGET_VALUE_3];
    let count = gcpu.vmcs.read(vmcs::control::CR3_TARGET_COUNT, Level::Level1);
    TARGETS.iter().take(count as usize).any(|&field| gcpu.vmcs.read(field, Level::Level1) == new_cr3)
}

/// Whether L1's I/O bitmaps (or unconditional I/O exiting) would have
/// intercepted this port access (§4.I analyzer, "I/O checks
/// bitmap-or-unconditional").
pub(crate) fn io_would_exit_l1(gcpu: &Gcpu, port: u16, read_bitmap_bit: impl Fn(u64, u16) -> bool) -> bool {
    const UNCONDITIONAL_IO_EXITING: u64 = 1 << 24;
    const USE_IO_BITMAPS: u64 = 1 << 25;
    let proc = gcpu.vmcs.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, Level::Level1);
    if proc & USE_IO_BITMAPS == 0 {
        return proc & UNCONDITIONAL_IO_EXITING != 0;
    }
    let bitmap_a = gcpu.vmcs.read(vmcs::control::IO_BITMAP_A_FULL, Level::Level1);
    let bitmap_b = gcpu.vmcs.read(vmcs::control::IO_BITMAP_B_FULL, Level::Level1);
    if port < 0x8000 {
        read_bitmap_bit(bitmap_a, port)
    } else {
        read_bitmap_bit(bitmap_b, port - 0x8000)
    }
}

/// MSR ranges the low/high bitmap halves cover (§4.I analyzer, "MSR checks
/// bitmap ranges `[0..0x1fff]∪[0xc0000000..0xc0001fff]`").
fn msr_in_bitmap_range(msr: u32) -> bool {
    (0..=0x1FFF).contains(&msr) || (0xC000_0000..=0xC000_1FFF).contains(&msr)
}

/// Whether L1's MSR bitmap (or unconditional MSR exiting) would have
/// intercepted this RDMSR/WRMSR (§4.I analyzer).
pub(crate) fn msr_would_exit_l1(gcpu: &Gcpu, msr: u32, is_write: bool, read_bitmap_bit: impl Fn(u64, u32, bool) -> bool) -> bool {
    const USE_MSR_BITMAPS: u64 = 1 << 28;
    let proc = gcpu.vmcs.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, Level::Level1);
    if proc & USE_MSR_BITMAPS == 0 {
        return true;
    }
    if !msr_in_bitmap_range(msr) {
        return true;
    }
    let bitmap = gcpu.vmcs.read(vmcs::control::MSR_BITMAPS_FULL, Level::Level1);
    read_bitmap_bit(bitmap, msr, is_write)
}

/// Whether L1's exception bitmap (plus, for `#PF`, its error-code
/// mask/match filter) would have intercepted this exception (§4.I
/// analyzer, "exception checks bitmap + page-fault mask/match").
pub(crate) fn exception_would_exit_l1(gcpu: &Gcpu, vector: u8, page_fault_error_code: Option<u32>) -> bool {
    let bitmap = gcpu.vmcs.read(vmcs::control::EXCEPTION_BITMAP, Level::Level1);
    if bitmap & (1 << vector) == 0 {
        return false;
    }
    if vector != 14 {
        return true;
    }
    let Some(ec) = page_fault_error_code else { return true };
    let mask = gcpu.vmcs.read(vmcs::control::PAGE_FAULT_ERR_CODE_MASK, Level::Level1) as u32;
    let match_ = gcpu.vmcs.read(vmcs::control::PAGE_FAULT_ERR_CODE_MATCH, Level::Level1) as u32;
    (ec & mask) == match_
}

/// Whether L1's preemption-timer count would already have expired, compared
/// against L0's (§4.I analyzer, "preemption-timer compares counters between
/// L0 and L1 VMCS").
pub(crate) fn preemption_timer_would_exit_l1(gcpu: &Gcpu) -> bool {
    let l0 = gcpu.vmcs.read(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE, Level::Level0);
    let l1 = gcpu.vmcs.read(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE, Level::Level1);
    l0 >= l1
}

/// Top-level dispatch the dispatcher calls: "does L1 want this exit
/// reason?" Reasons outside the set the spec names default to `true`
/// (ascend), since a conservative analyzer never silently drops an L1
/// expectation.
pub(crate) fn l1_wants_exit(
    gcpu: &Gcpu,
    reason: ExitReason,
    cr_access: Option<CrAccessQualification>,
    new_cr3: Option<u64>,
    io_port: Option<u16>,
    msr: Option<(u32, bool)>,
    exception: Option<(u8, Option<u32>)>,
    read_io_bitmap_bit: impl Fn(u64, u16) -> bool,
    read_msr_bitmap_bit: impl Fn(u64, u32, bool) -> bool,
) -> bool {
    match reason {
        EXIT_REASON_CR_ACCESS => cr_access.is_some_and(|q| cr_access_would_exit_l1(gcpu, q, new_cr3)),
        EXIT_REASON_IO_INSTRUCTION => io_port.is_some_and(|port| io_would_exit_l1(gcpu, port, read_io_bitmap_bit)),
        EXIT_REASON_MSR_READ | EXIT_REASON_MSR_WRITE => {
            msr.is_some_and(|(msr, is_write)| msr_would_exit_l1(gcpu, msr, is_write, read_msr_bitmap_bit))
        }
        EXIT_REASON_EXCEPTION_OR_NMI => {
            exception.is_some_and(|(vector, ec)| exception_would_exit_l1(gcpu, vector, ec))
        }
        EXIT_REASON_PREEMPTION_TIMER => preemption_timer_would_exit_l1(gcpu),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msr_bitmap_range_matches_architectural_windows() {
        assert!(msr_in_bitmap_range(0));
        assert!(msr_in_bitmap_range(0x1FFF));
        assert!(!msr_in_bitmap_range(0x2000));
        assert!(msr_in_bitmap_range(0xC000_0000));
        assert!(msr_in_bitmap_range(0xC000_1FFF));
        assert!(!msr_in_bitmap_range(0xC000_2000));
        assert!(!msr_in_bitmap_range(0x5000_0000));
    }
}
