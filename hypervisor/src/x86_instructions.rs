//! The module containing wrapper functions for x86 instructions.
//!
//! Those instructions provided by the `x86` crate as `unsafe` functions, due to
//! the fact that those require certain preconditions. The wrappers provided by
//! this module encapsulate those `unsafe`-ness since this project always
//! satisfies the preconditions and safe to call them at any context.

use core::arch::asm;
use x86::{
    controlregs::{Cr0, Cr4},
    current::rflags::RFlags,
    dtables::DescriptorTablePointer,
};

/// Returns the timestamp counter value.
pub(crate) fn rdtsc() -> u64 {
    // Safety: this project runs at CPL0.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads an MSR.
pub(crate) fn rdmsr(msr: u32) -> u64 {
    // Safety: this project runs at CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub(crate) fn wrmsr(msr: u32, value: u64) {
    // Safety: this project runs at CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub(crate) fn cr0() -> Cr0 {
    // Safety: this project runs at CPL0.
    unsafe { x86::controlregs::cr0() }
}

/// Writes a value to the CR0 register.
pub(crate) fn cr0_write(val: Cr0) {
    // Safety: this project runs at CPL0.
    unsafe { x86::controlregs::cr0_write(val) };
}

/// Reads the CR3 register.
pub(crate) fn cr3() -> u64 {
    // Safety: this project runs at CPL0.
    unsafe { x86::controlregs::cr3() }
}

/// Reads the CR4 register.
pub(crate) fn cr4() -> Cr4 {
    // Safety: this project runs at CPL0.
    unsafe { x86::controlregs::cr4() }
}

/// Writes a value to the CR4 register.
pub(crate) fn cr4_write(val: Cr4) {
    // Safety: this project runs at CPL0.
    unsafe { x86::controlregs::cr4_write(val) };
}

/// Disables maskable interrupts.
pub(crate) fn cli() {
    // Safety: this project runs at CPL0.
    unsafe { x86::irq::disable() };
}

/// Halts execution of the processor.
pub(crate) fn hlt() {
    // Safety: this project runs at CPL0.
    unsafe { x86::halt() };
}

/// Reads 8-bits from an IO port.
pub(crate) fn inb(port: u16) -> u8 {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub(crate) fn outb(port: u16, val: u8) {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::outb(port, val) };
}

/// Reads 16-bits from an IO port.
pub(crate) fn inw(port: u16) -> u16 {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::inw(port) }
}

/// Writes 16-bits to an IO port.
pub(crate) fn outw(port: u16, val: u16) {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::outw(port, val) };
}

/// Reads 32-bits from an IO port.
pub(crate) fn inl(port: u16) -> u32 {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::inl(port) }
}

/// Writes 32-bits to an IO port.
pub(crate) fn outl(port: u16, val: u32) {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::outl(port, val) };
}

/// Reads the IDTR register.
pub(crate) fn sidt<T>(idtr: &mut DescriptorTablePointer<T>) {
    // Safety: this project runs at CPL0.
    unsafe { x86::dtables::sidt(idtr) };
}

/// Reads the GDTR.
pub(crate) fn sgdt<T>(gdtr: &mut DescriptorTablePointer<T>) {
    // Safety: this project runs at CPL0.
    unsafe { x86::dtables::sgdt(gdtr) };
}

/// Reads the Task Register via the `STR` instruction.
pub(crate) fn str() -> u16 {
    let selector: u16;
    // Safety: `STR` has no preconditions beyond CPL0, which this project
    // always satisfies.
    unsafe { asm!("str {0:x}", out(reg) selector, options(nomem, nostack, preserves_flags)) };
    selector
}

/// Reads the LDTR via the `SLDT` instruction.
pub(crate) fn sldt() -> u16 {
    let selector: u16;
    // Safety: `SLDT` has no preconditions beyond CPL0, which this project
    // always satisfies.
    unsafe { asm!("sldt {0:x}", out(reg) selector, options(nomem, nostack, preserves_flags)) };
    selector
}

/// Writes back and invalidates the CPU cache.
pub(crate) fn wbinvd() {
    // Safety: this project runs at CPL0.
    unsafe { asm!("wbinvd", options(nomem, nostack)) };
}

/// The INVEPT descriptor (SDM Figure 31-1).
#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}
const _: () = assert!(core::mem::size_of::<InveptDescriptor>() == 16);

/// Single-context INVEPT: invalidates every cached mapping tagged with
/// `eptp`, per SDM §29.4.3.1.
const INVEPT_SINGLE_CONTEXT: u64 = 1;

/// Invalidates cached EPT translations tagged with `eptp` (single-context
/// scope). Every EPT mutation must be followed by this, or a guest that
/// remaps then immediately accesses memory can observe stale translations.
pub(crate) fn invept(eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    let flags: u64;
    // Safety: `descriptor` is a valid stack-local INVEPT descriptor and VMX
    // operation is active whenever EPT mappings are mutated.
    unsafe {
        asm!(
            "invept {0}, [{1}]",
            "pushfq",
            "pop {2}",
            in(reg) INVEPT_SINGLE_CONTEXT,
            in(reg) &descriptor,
            lateout(reg) flags,
        );
    }
    let flags = RFlags::from_raw(flags);
    if flags.contains(RFlags::FLAGS_ZF) || flags.contains(RFlags::FLAGS_CF) {
        crate::error::vmm_deadloop!("INVEPT failed for eptp {eptp:#x}");
    }
}

/// Reads the protection-key rights register (PKRU, SDM §4.6.1): per-key
/// access-disable/write-disable bits `walk_long_or_pae`'s protection-key
/// check consults. Only valid to call once CR4.PKE is set.
pub(crate) fn rdpkru() -> u32 {
    let pkru: u32;
    // Safety: `RDPKRU` requires ECX=0, which this always supplies; callers
    // only invoke this after confirming CR4.PKE is set.
    unsafe {
        asm!(
            "xor ecx, ecx",
            "rdpkru",
            out("eax") pkru,
            out("edx") _,
            out("ecx") _,
            options(nomem, nostack),
        );
    }
    pkru
}

/// Executes Bochs magic breakpoint. Noop outside Bochs.
///
/// Set "magic_break: enabled=1" in the Bochs configuration file.
// inline_always: to avoid having to step through to `RET` to the caller.
// doc_markdown: clippy confused with "magic_break".
// dead_code: ad-hoc debug support code. Normally not used.
#[allow(clippy::inline_always, clippy::doc_markdown, dead_code)]
#[inline(always)]
pub(crate) fn bochs_breakpoint() {
    unsafe { asm!("xchg %bx, %bx", options(att_syntax, nomem, nostack)) };
}
