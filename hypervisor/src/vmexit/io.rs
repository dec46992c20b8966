//! I/O-Port Monitor (§4.K).

use crate::config::MAX_IO_HANDLERS;
use crate::gcpu::Gcpu;
use crate::injection::reflect_exception;

/// 64 KiB bitmap split into the two 4 KiB pages the VMCS's
/// `IO_BITMAP_A`/`IO_BITMAP_B` fields each point at (§4.K, §6 "two
/// contiguous 4 KiB pages").
pub(crate) struct IoBitmap {
    a: alloc::boxed::Box<[u8; 0x1000]>,
    b: alloc::boxed::Box<[u8; 0x1000]>,
}

impl IoBitmap {
    pub(crate) fn new() -> Self {
        Self { a: alloc::boxed::Box::new([0; 0x1000]), b: alloc::boxed::Box::new([0; 0x1000]) }
    }

    pub(crate) fn a_hpa(&self) -> u64 {
        (self.a.as_ref() as *const [u8; 0x1000]) as u64
    }

    pub(crate) fn b_hpa(&self) -> u64 {
        (self.b.as_ref() as *const [u8; 0x1000]) as u64
    }

    /// Sets the intercept bit for `port` (a port `>= 0x8000` lands in the
    /// second bitmap page, per the architectural split).
    pub(crate) fn intercept(&mut self, port: u16, enable: bool) {
        let (page, bit_offset) = if port < 0x8000 { (&mut self.a, port) } else { (&mut self.b, port - 0x8000) };
        let byte = (bit_offset / 8) as usize;
        let bit = bit_offset % 8;
        if enable {
            page[byte] |= 1 << bit;
        } else {
            page[byte] &= !(1 << bit);
        }
    }
}

impl Default for IoBitmap {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type ReadHandler = fn(&mut Gcpu, port: u16, size: u8) -> u32;
pub(crate) type WriteHandler = fn(&mut Gcpu, port: u16, size: u8, value: u32);

#[derive(Clone, Copy)]
struct Registration {
    port: u16,
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
}

/// Per-guest registration table; an unregistered port is pass-through
/// (§4.K).
pub(crate) struct IoMonitor {
    pub(crate) bitmap: IoBitmap,
    registrations: [Option<Registration>; MAX_IO_HANDLERS],
    len: usize,
}

impl IoMonitor {
    pub(crate) fn new() -> Self {
        Self { bitmap: IoBitmap::new(), registrations: [None; MAX_IO_HANDLERS], len: 0 }
    }

    pub(crate) fn register(
        &mut self,
        port: u16,
        read: Option<ReadHandler>,
        write: Option<WriteHandler>,
    ) -> crate::error::MonResult<()> {
        if self.len >= MAX_IO_HANDLERS {
            return Err(crate::error::MonError::PoolExhausted);
        }
        self.bitmap.intercept(port, true);
        self.registrations[self.len] = Some(Registration { port, read, write });
        self.len += 1;
        Ok(())
    }

    fn find(&self, port: u16) -> Option<Registration> {
        self.registrations[..self.len].iter().flatten().find(|r| r.port == port).copied()
    }
}

impl Default for IoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded I/O-exit qualification (§4.K step 1).
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoQualification {
    pub(crate) port: u16,
    pub(crate) size: u8,
    pub(crate) is_in: bool,
    pub(crate) is_string: bool,
    pub(crate) is_rep: bool,
}

/// Guest mode the architectural pre-checks branch on (§4.K step 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GuestMode {
    Real,
    V8086,
    Protected,
    Ia32e,
}

/// Architectural string-I/O pre-check result: either the access may
/// proceed, or a specific fault must be injected (§4.K step 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PreCheckResult {
    Ok,
    GeneralProtectionFault,
    StackFault,
    AlignmentCheckFault,
}

/// Runs the architectural string-I/O pre-checks in the order the guest
/// mode requires (§4.K step 2). `segment_present`, `segment_writable`, and
/// `within_limit` summarize the decoded segment the string access targets;
/// `canonical` and `aligned` summarize the effective address.
#[allow(clippy::too_many_arguments)]
pub(crate) fn string_io_precheck(
    mode: GuestMode,
    is_in: bool,
    segment_present: bool,
    segment_writable: bool,
    within_limit: bool,
    canonical: bool,
    aligned: bool,
) -> PreCheckResult {
    match mode {
        GuestMode::Real => {
            if !within_limit {
                return PreCheckResult::GeneralProtectionFault;
            }
            PreCheckResult::Ok
        }
        GuestMode::V8086 => {
            if !aligned {
                return PreCheckResult::AlignmentCheckFault;
            }
            PreCheckResult::Ok
        }
        GuestMode::Protected => {
            if !segment_present {
                return PreCheckResult::GeneralProtectionFault;
            }
            if !within_limit {
                return PreCheckResult::StackFault;
            }
            if is_in && !segment_writable {
                return PreCheckResult::GeneralProtectionFault;
            }
            if !aligned {
                return PreCheckResult::AlignmentCheckFault;
            }
            PreCheckResult::Ok
        }
        GuestMode::Ia32e => {
            if !canonical {
                return PreCheckResult::GeneralProtectionFault;
            }
            if !aligned {
                return PreCheckResult::AlignmentCheckFault;
            }
            PreCheckResult::Ok
        }
    }
}

/// Maximum bytes moved per `REP` chunk before re-checking interruptibility
/// (§4.K step 4, "chunks <= 512 bytes").
pub(crate) const MAX_REP_CHUNK: usize = 512;

/// Dispatches one I/O VMExit through the registration table or, for
/// unregistered ports, transparent passthrough, then advances `RIP`.
/// `cpl` and `read_guest_qword` are forwarded to the page walker for string
/// I/O's GVA-to-GPA translation (§4.F); `gpa_to_hva` resolves a translated
/// GPA to the host memory the actual port transfer copies to/from.
pub(crate) fn handle_io_exit(
    gcpu: &mut Gcpu,
    monitor: &IoMonitor,
    q: IoQualification,
    cpl: u8,
    read_guest_qword: impl Fn(u64) -> Option<u64>,
    gpa_to_hva: impl Fn(u64) -> Option<u64>,
) {
    if q.is_string {
        handle_string_io(gcpu, monitor, q, cpl, read_guest_qword, gpa_to_hva);
    } else if q.is_in {
        let value = match monitor.find(q.port).and_then(|r| r.read) {
            Some(handler) => handler(gcpu, q.port, q.size),
            None => crate::x86_instructions::inl(q.port),
        };
        gcpu.gp.rax = (gcpu.gp.rax & !mask_for_size(q.size)) | (u64::from(value) & mask_for_size(q.size));
    } else {
        let value = (gcpu.gp.rax & mask_for_size(q.size)) as u32;
        match monitor.find(q.port).and_then(|r| r.write) {
            Some(handler) => handler(gcpu, q.port, q.size, value),
            None => crate::x86_instructions::outl(q.port, value),
        }
    }
    gcpu.skip_instruction();
}

fn mask_for_size(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Which guest mode a VMCS's CR0/RFLAGS/EFER currently describe, for the
/// string-I/O pre-check's mode dispatch (§4.K step 2).
fn select_guest_mode(gcpu: &Gcpu) -> GuestMode {
    let cr0 = gcpu.visible_cr0();
    if cr0 & 1 == 0 {
        return GuestMode::Real;
    }
    let rflags = gcpu.vmcs.read(x86::vmx::vmcs::guest::RFLAGS, crate::vmcs::Level::Merged);
    if rflags & (1 << 17) != 0 {
        return GuestMode::V8086;
    }
    let cr4 = gcpu.visible_cr4();
    let efer = gcpu.vmcs.read(x86::vmx::vmcs::guest::IA32_EFER_FULL, crate::vmcs::Level::Merged);
    if cr4 & (1 << 5) != 0 && efer & (1 << 8) != 0 {
        GuestMode::Ia32e
    } else {
        GuestMode::Protected
    }
}

fn is_canonical(addr: u64) -> bool {
    (((addr as i64) << 16) >> 16) as u64 == addr
}

fn port_in(monitor: &IoMonitor, gcpu: &mut Gcpu, port: u16, size: u8) -> u32 {
    match monitor.find(port).and_then(|r| r.read) {
        Some(handler) => handler(gcpu, port, size),
        None => match size {
            1 => u32::from(crate::x86_instructions::inb(port)),
            2 => u32::from(crate::x86_instructions::inw(port)),
            _ => crate::x86_instructions::inl(port),
        },
    }
}

fn port_out(monitor: &IoMonitor, gcpu: &mut Gcpu, port: u16, size: u8, value: u32) {
    match monitor.find(port).and_then(|r| r.write) {
        Some(handler) => handler(gcpu, port, size, value),
        None => match size {
            1 => crate::x86_instructions::outb(port, value as u8),
            2 => crate::x86_instructions::outw(port, value as u16),
            _ => crate::x86_instructions::outl(port, value),
        },
    }
}

/// Safety: `hva` must point at a live mapping of at least `size` bytes.
unsafe fn read_sized(hva: u64, size: u8) -> u32 {
    match size {
        1 => u32::from(unsafe { core::ptr::read_unaligned(hva as *const u8) }),
        2 => u32::from(unsafe { core::ptr::read_unaligned(hva as *const u16) }),
        _ => unsafe { core::ptr::read_unaligned(hva as *const u32) },
    }
}

/// Safety: `hva` must point at a live mapping of at least `size` bytes.
unsafe fn write_sized(hva: u64, size: u8, value: u32) {
    match size {
        1 => unsafe { core::ptr::write_unaligned(hva as *mut u8, value as u8) },
        2 => unsafe { core::ptr::write_unaligned(hva as *mut u16, value as u16) },
        _ => unsafe { core::ptr::write_unaligned(hva as *mut u32, value) },
    }
}

/// `REP INS`/`OUTS` emulation: runs the architectural pre-checks once up
/// front (§4.K step 2), then iterates in chunks of at most
/// [`MAX_REP_CHUNK`] bytes, honoring `RFLAGS.DF` for direction, surfacing a
/// `#PF` with `CR2` set to the faulting GVA the moment a chunk's page walk
/// misses (§4.K step 4, scenario 5). INS's destination segment is always
/// `ES`; OUTS's source segment is `DS` (this monitor does not decode
/// segment-override prefixes).
fn handle_string_io(
    gcpu: &mut Gcpu,
    monitor: &IoMonitor,
    q: IoQualification,
    cpl: u8,
    read_guest_qword: impl Fn(u64) -> Option<u64>,
    gpa_to_hva: impl Fn(u64) -> Option<u64>,
) {
    let rflags = gcpu.vmcs.read(x86::vmx::vmcs::guest::RFLAGS, crate::vmcs::Level::Merged);
    let direction: i64 = if rflags & (1 << 10) != 0 { -1 } else { 1 };
    let count = if q.is_rep { gcpu.gp.rcx } else { 1 };
    let access = if q.is_in { crate::page_walker::Access::W } else { crate::page_walker::Access::R };

    let mut gva = if q.is_in { gcpu.gp.rdi } else { gcpu.gp.rsi };

    let mode = select_guest_mode(gcpu);
    let (limit_field, access_rights_field) = if q.is_in {
        (x86::vmx::vmcs::guest::ES_LIMIT, x86::vmx::vmcs::guest::ES_ACCESS_RIGHTS)
    } else {
        (x86::vmx::vmcs::guest::DS_LIMIT, x86::vmx::vmcs::guest::DS_ACCESS_RIGHTS)
    };
    let limit = gcpu.vmcs.read(limit_field, crate::vmcs::Level::Merged);
    let access_rights = gcpu.vmcs.read(access_rights_field, crate::vmcs::Level::Merged);
    let segment_present = access_rights & (1 << 7) != 0 && access_rights & (1 << 16) == 0;
    let segment_writable = access_rights & (1 << 1) != 0;
    let within_limit = gva.checked_add(u64::from(q.size)).is_some_and(|end| end <= limit + 1);
    let canonical = is_canonical(gva);
    let aligned = gva % u64::from(q.size) == 0;

    let precheck =
        string_io_precheck(mode, q.is_in, segment_present, segment_writable, within_limit, canonical, aligned);
    let fault_vector = match precheck {
        PreCheckResult::Ok => None,
        PreCheckResult::GeneralProtectionFault => Some(13),
        PreCheckResult::StackFault => Some(12),
        PreCheckResult::AlignmentCheckFault => Some(17),
    };
    if let Some(vector) = fault_vector {
        reflect_exception(gcpu, vector, Some(0), None);
        return;
    }

    let mut remaining = count;
    let mut moved = 0u64;

    while remaining > 0 && moved < MAX_REP_CHUNK as u64 {
        let gpa = match crate::page_walker::gva_to_gpa(gcpu, gva, access, cpl, &read_guest_qword) {
            crate::page_walker::WalkResult::Translated(gpa) => gpa,
            crate::page_walker::WalkResult::PageFault(ec) => {
                reflect_exception(gcpu, 14, Some(ec.bits()), Some(gva));
                return;
            }
            crate::page_walker::WalkResult::GuestPageTableUnreadable => {
                crate::error::vmm_deadloop!("guest page table unreadable during string I/O");
            }
        };
        let hva = gpa_to_hva(gpa)
            .unwrap_or_else(|| crate::error::vmm_deadloop!("string I/O GPA {gpa:#x} has no backing HVA"));

        if q.is_in {
            let value = port_in(monitor, gcpu, q.port, q.size);
            // Safety: `hva` was resolved through this guest's own GPM/EPT.
            unsafe { write_sized(hva, q.size, value) };
        } else {
            // Safety: `hva` was resolved through this guest's own GPM/EPT.
            let value = unsafe { read_sized(hva, q.size) };
            port_out(monitor, gcpu, q.port, q.size, value);
        }

        gva = (gva as i64 + direction * i64::from(q.size)) as u64;
        remaining -= 1;
        moved += u64::from(q.size);
    }

    if q.is_in {
        gcpu.gp.rdi = gva;
    } else {
        gcpu.gp.rsi = gva;
    }
    if q.is_rep {
        gcpu.gp.rcx = remaining;
    }
    gcpu.skip_instruction();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_intercept_sets_correct_page_and_bit() {
        let mut bm = IoBitmap::new();
        bm.intercept(0x20, true);
        assert_eq!(bm.a[4] & 0b1, 0b1);
        bm.intercept(0x8005, true);
        assert_eq!(bm.b[0] & (1 << 5), 1 << 5);
    }

    #[test]
    fn protected_mode_precheck_order_matches_spec() {
        assert_eq!(
            string_io_precheck(GuestMode::Protected, true, false, true, true, true, true),
            PreCheckResult::GeneralProtectionFault
        );
        assert_eq!(
            string_io_precheck(GuestMode::Protected, true, true, true, false, true, true),
            PreCheckResult::StackFault
        );
        assert_eq!(
            string_io_precheck(GuestMode::Protected, true, true, false, true, true, true),
            PreCheckResult::GeneralProtectionFault
        );
        assert_eq!(
            string_io_precheck(GuestMode::Protected, false, true, true, true, true, false),
            PreCheckResult::AlignmentCheckFault
        );
        assert_eq!(
            string_io_precheck(GuestMode::Protected, false, true, true, true, true, true),
            PreCheckResult::Ok
        );
    }

    #[test]
    fn ia32e_precheck_checks_canonicality_before_alignment() {
        assert_eq!(
            string_io_precheck(GuestMode::Ia32e, false, true, true, true, false, false),
            PreCheckResult::GeneralProtectionFault
        );
    }
}
