//! GVA -> GPA page walker across real/32-bit/PAE/IA-32e paging (§4.F).

use crate::gcpu::Gcpu;

bitflags::bitflags! {
    /// Access the walker is checking permissions for. `R` and `W` may be
    /// combined for a read-modify-write access.
    #[derive(Clone, Copy)]
    pub(crate) struct Access: u8 {
        const R = 0b01;
        const W = 0b10;
    }
}

/// `#PF` error-code bits (SDM §4.7), composed bit-for-bit by the walker.
bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct PfErrorCode: u32 {
        const P    = 1 << 0;
        const W    = 1 << 1;
        const U    = 1 << 2;
        const RSVD = 1 << 3;
        const I    = 1 << 4;
        const PK   = 1 << 5;
        const SS   = 1 << 6;
    }
}

/// Result of a walk: either a successfully translated GPA, a guest-visible
/// `#PF` (with its architected error code), or a MON-internal failure
/// reading the guest's own page tables (§7 "Recoverable MON errors").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalkResult {
    Translated(u64),
    PageFault(PfErrorCode),
    GuestPageTableUnreadable,
}

/// Which IA-32 paging mode governs the walk, selected per §4.F's mode
/// dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PagingMode {
    Identity,
    X86,
    Pae,
    Ia32e,
}

fn select_mode(gcpu: &Gcpu) -> PagingMode {
    let cr0 = gcpu.visible_cr0();
    if cr0 & 1 << 31 == 0 {
        return PagingMode::Identity;
    }
    let cr4 = gcpu.visible_cr4();
    if cr4 & 1 << 5 == 0 {
        return PagingMode::X86;
    }
    // EFER.LME, bit 8.
    let efer = gcpu.vmcs.read(x86::vmx::vmcs::guest::IA32_EFER_FULL, crate::vmcs::Level::Merged);
    if efer & 1 << 8 != 0 {
        PagingMode::Ia32e
    } else {
        PagingMode::Pae
    }
}

/// Translates `gva` under `access`, returning the GPA or a `#PF` (§4.F).
/// `cpl` is the guest's current privilege level (0-3); `read_guest_qword`
/// reads 8 bytes of guest-physical memory holding a paging-structure entry
/// (through the GPM, per §4.F step list preamble), returning `None` on a
/// GPM miss.
pub(crate) fn gva_to_gpa(
    gcpu: &Gcpu,
    gva: u64,
    access: Access,
    cpl: u8,
    read_guest_qword: impl Fn(u64) -> Option<u64>,
) -> WalkResult {
    match select_mode(gcpu) {
        PagingMode::Identity => WalkResult::Translated(gva),
        PagingMode::X86 => walk_x86(gcpu, gva, access, cpl, &read_guest_qword),
        PagingMode::Pae => walk_long_or_pae(gcpu, gva, access, cpl, &read_guest_qword, false),
        PagingMode::Ia32e => walk_long_or_pae(gcpu, gva, access, cpl, &read_guest_qword, true),
    }
}

struct LevelCheck {
    present: bool,
    reserved_violation: bool,
    nx_violation: bool,
    pk_violation: bool,
}

fn compose_fault(check_failed_at: &LevelCheck, access: Access, cpl: u8) -> PfErrorCode {
    let mut ec = PfErrorCode::empty();
    if check_failed_at.present {
        ec |= PfErrorCode::P;
    }
    if access.contains(Access::W) {
        ec |= PfErrorCode::W;
    }
    if cpl == 3 {
        ec |= PfErrorCode::U;
    }
    if check_failed_at.reserved_violation {
        ec |= PfErrorCode::RSVD;
    }
    if check_failed_at.nx_violation {
        ec |= PfErrorCode::I;
    }
    if check_failed_at.pk_violation {
        ec |= PfErrorCode::PK;
    }
    ec
}

/// 32-bit (non-PAE) two-level walk: PDE then PTE, with PSE 4 MiB pages.
fn walk_x86(
    gcpu: &Gcpu,
    gva: u64,
    access: Access,
    cpl: u8,
    read_qword: &impl Fn(u64) -> Option<u64>,
) -> WalkResult {
    let cr3 = gcpu.vmcs.read(x86::vmx::vmcs::guest::CR3, crate::vmcs::Level::Merged);
    let pde_addr = (cr3 & !0xFFF) + ((gva >> 22) & 0x3FF) * 4;
    let pde = match read_dword(read_qword, pde_addr) {
        Some(v) => v,
        None => return WalkResult::GuestPageTableUnreadable,
    };
    if pde & 1 == 0 {
        return fault(false, access, cpl, false, false);
    }
    let user_bit_pde = pde & (1 << 2) != 0;
    if cpl == 3 && !user_bit_pde {
        return fault(true, access, cpl, false, false);
    }
    if access.contains(Access::W) && pde & (1 << 1) == 0 {
        let cr0 = gcpu.visible_cr0();
        if cpl == 3 || cr0 & (1 << 16) != 0 {
            return fault(true, access, cpl, false, false);
        }
    }

    let cr4 = gcpu.visible_cr4();
    if cr4 & (1 << 4) != 0 && pde & (1 << 7) != 0 {
        // 4 MiB page; PSE-36 extension folds bits [20:13] of the PDE into
        // the upper physical address bits.
        let base_high = (pde >> 13) & 0xFF;
        let base = (pde & 0xFFC0_0000) | (base_high << 32);
        return WalkResult::Translated(base + (gva & 0x3F_FFFF));
    }

    let pte_addr = (pde & !0xFFF) + ((gva >> 12) & 0x3FF) * 4;
    let pte = match read_dword(read_qword, pte_addr) {
        Some(v) => v,
        None => return WalkResult::GuestPageTableUnreadable,
    };
    if pte & 1 == 0 {
        return fault(false, access, cpl, false, false);
    }
    let user_bit = user_bit_pde && (pte & (1 << 2) != 0);
    if cpl == 3 && !user_bit {
        return fault(true, access, cpl, false, false);
    }
    if access.contains(Access::W) && pte & (1 << 1) == 0 {
        let cr0 = gcpu.visible_cr0();
        if cpl == 3 || cr0 & (1 << 16) != 0 {
            return fault(true, access, cpl, false, false);
        }
    }
    smap_check(gcpu, cpl, user_bit, access)
        .unwrap_or(WalkResult::Translated((pte & 0xFFFF_F000) + (gva & 0xFFF)))
}

/// PAE (3-level) or IA-32e (4-level) walk, sharing the per-entry check
/// logic since both use 8-byte entries.
fn walk_long_or_pae(
    gcpu: &Gcpu,
    gva: u64,
    access: Access,
    cpl: u8,
    read_qword: &impl Fn(u64) -> Option<u64>,
    is_long_mode: bool,
) -> WalkResult {
    let cr3 = gcpu.vmcs.read(x86::vmx::vmcs::guest::CR3, crate::vmcs::Level::Merged);
    let nxe = {
        let efer = gcpu.vmcs.read(x86::vmx::vmcs::guest::IA32_EFER_FULL, crate::vmcs::Level::Merged);
        efer & (1 << 11) != 0
    };

    // Reserved bits above the implemented physical-address width (SDM §4.9,
    // Table 4-8 and friends): this walker assumes a 52-bit MAXPHYADDR, the
    // architectural ceiling, so bits 62:52 of every PAE/IA-32e entry must be
    // zero.
    const RESERVED_ABOVE_MAXPHYADDR: u64 = 0x7FF0_0000_0000_0000;

    let levels: &[u32] = if is_long_mode { &[39, 30, 21, 12] } else { &[30, 21, 12] };
    let mut table_base = cr3 & !0xFFF;
    let mut effective_user = true;

    for (depth, &shift) in levels.iter().enumerate() {
        let is_last_addressable_level = depth == levels.len() - 1;
        let index = (gva >> shift) & 0x1FF;
        let entry_addr = table_base + index * 8;
        let entry = match read_qword(entry_addr) {
            Some(v) => v,
            None => return WalkResult::GuestPageTableUnreadable,
        };

        if entry & 1 == 0 {
            return fault(false, access, cpl, false, false);
        }

        // PS must be 0 at the PML4 level (SDM §4.5 Table 4-15): IA-32e
        // defines no 512 GiB leaf, so a guest setting it is a reserved-bit
        // violation, not a huge-page request.
        if is_long_mode && depth == 0 && entry & (1 << 7) != 0 {
            return fault(true, access, cpl, true, false);
        }
        if entry & RESERVED_ABOVE_MAXPHYADDR != 0 {
            return fault(true, access, cpl, true, false);
        }

        let nx_bit_set = entry & (1u64 << 63) != 0;
        if nx_bit_set && !nxe {
            return fault(true, access, cpl, true, false);
        }

        effective_user &= entry & (1 << 2) != 0;
        if cpl == 3 && !effective_user {
            return fault(true, access, cpl, false, false);
        }
        if access.contains(Access::W) && entry & (1 << 1) == 0 {
            let cr0 = gcpu.visible_cr0();
            if cpl == 3 || cr0 & (1 << 16) != 0 {
                return fault(true, access, cpl, false, false);
            }
        }

        let is_leaf = is_last_addressable_level || (depth != 0 && entry & (1 << 7) != 0);
        if is_leaf {
            let page_shift = shift;
            let page_mask = (1u64 << page_shift) - 1;
            let frame = entry & 0x000F_FFFF_FFFF_F000 & !page_mask;
            if nx_bit_set {
                return fault(true, access, cpl, true, true);
            }
            if is_long_mode {
                let key = ((entry >> 59) & 0xF) as u8;
                if pkru_denies(gcpu, cpl, access, effective_user, key) {
                    return pk_fault(true, access, cpl);
                }
            }
            return smap_check(gcpu, cpl, effective_user, access)
                .unwrap_or(WalkResult::Translated(frame + (gva & page_mask)));
        }

        table_base = entry & 0x000F_FFFF_FFFF_F000;
    }

    unreachable!("the last level is always marked is_last_addressable_level")
}

/// Protection-key check (SDM §4.6.1): denies a user-mode access to a
/// user-accessible page when its key's access-disable bit is set, or its
/// write-disable bit is set for a write. Only IA-32e paging carries a key
/// field, and only CPL3 accesses are subject to it.
fn pkru_denies(gcpu: &Gcpu, cpl: u8, access: Access, is_user_page: bool, key: u8) -> bool {
    const PKE: u64 = 1 << 22;
    let cr4 = gcpu.visible_cr4();
    if cr4 & PKE == 0 || cpl != 3 || !is_user_page {
        return false;
    }
    let pkru = crate::x86_instructions::rdpkru();
    let ad = pkru & (1 << (2 * key)) != 0;
    let wd = pkru & (1 << (2 * key + 1)) != 0;
    ad || (access.contains(Access::W) && wd)
}

fn smap_check(gcpu: &Gcpu, cpl: u8, is_user_page: bool, access: Access) -> Option<WalkResult> {
    let cr4 = gcpu.visible_cr4();
    const SMAP: u64 = 1 << 21;
    if cr4 & SMAP == 0 || cpl == 3 || !is_user_page {
        return None;
    }
    let rflags = gcpu.vmcs.read(x86::vmx::vmcs::guest::RFLAGS, crate::vmcs::Level::Merged);
    const AC: u64 = 1 << 18;
    if rflags & AC != 0 {
        return None;
    }
    // Supervisor access to a user page with AC=0: denied regardless of R/W
    // (§4.F step 6, scenario 3).
    let mut ec = PfErrorCode::P;
    if access.contains(Access::W) {
        ec |= PfErrorCode::W;
    }
    Some(WalkResult::PageFault(ec))
}

fn read_dword(read_qword: &impl Fn(u64) -> Option<u64>, addr: u64) -> Option<u64> {
    // The walker only has a qword-granular guest-memory reader available;
    // for 32-bit entries it reads the aligned qword and extracts the half
    // the address falls in.
    let aligned = addr & !0x7;
    let qword = read_qword(aligned)?;
    if addr & 0x7 == 0 {
        Some(qword & 0xFFFF_FFFF)
    } else {
        Some(qword >> 32)
    }
}

fn fault(present: bool, access: Access, cpl: u8, reserved: bool, nx: bool) -> WalkResult {
    let check = LevelCheck { present, reserved_violation: reserved, nx_violation: nx, pk_violation: false };
    WalkResult::PageFault(compose_fault(&check, access, cpl))
}

fn pk_fault(present: bool, access: Access, cpl: u8) -> WalkResult {
    let check = LevelCheck { present, reserved_violation: false, nx_violation: false, pk_violation: true };
    WalkResult::PageFault(compose_fault(&check, access, cpl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_composes_present_and_write_bits() {
        let ec = compose_fault(
            &LevelCheck { present: true, reserved_violation: false, nx_violation: false, pk_violation: false },
            Access::W,
            3,
        );
        assert!(ec.contains(PfErrorCode::P));
        assert!(ec.contains(PfErrorCode::W));
        assert!(ec.contains(PfErrorCode::U));
        assert!(!ec.contains(PfErrorCode::RSVD));
    }

    #[test]
    fn pk_fault_sets_pk_bit_alongside_present() {
        let ec = compose_fault(
            &LevelCheck { present: true, reserved_violation: false, nx_violation: false, pk_violation: true },
            Access::R,
            3,
        );
        assert!(ec.contains(PfErrorCode::PK));
        assert!(ec.contains(PfErrorCode::P));
        assert!(!ec.contains(PfErrorCode::RSVD));
    }

    #[test]
    fn not_present_fault_has_p_clear() {
        let ec = compose_fault(
            &LevelCheck { present: false, reserved_violation: false, nx_violation: false, pk_violation: false },
            Access::R,
            0,
        );
        assert!(!ec.contains(PfErrorCode::P));
        assert!(!ec.contains(PfErrorCode::U));
    }

    #[test]
    fn read_dword_picks_correct_half_of_aligned_qword() {
        let backing = 0x1122_3344_5566_7788u64;
        let reader = |_addr: u64| Some(backing);
        assert_eq!(read_dword(&reader, 0x1000), Some(0x5566_7788));
        assert_eq!(read_dword(&reader, 0x1004), Some(0x1122_3344));
    }
}
