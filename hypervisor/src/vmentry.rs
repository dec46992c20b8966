//! The VMLAUNCH/VMRESUME trampoline (§4.G: "the asm trampoline saves and
//! restores the guest's GP and XMM registers around a VM-entry/VM-exit
//! round trip").
//!
//! This generalizes the usual single-`GuestRegisters`-struct trampoline to
//! two structs, since [`Gcpu`](crate::gcpu::Gcpu) separates the always-hot
//! GP set from the rarely-touched XMM set. `HOST_RSP`/`HOST_RIP` are
//! reprogrammed on every call rather than once at VMCS setup time, since a
//! single host stack is reused across every guest this core ever runs.

use crate::error::{MonError, MonResult};
use crate::gcpu::{GpRegisters, XmmRegisters};
use core::arch::asm;
use x86::vmx::vmcs;

/// Runs the guest once: restores `gp`/`xmm` into the real registers,
/// executes VMLAUNCH (`launched == false`) or VMRESUME (`launched ==
/// true`), and on VM-exit captures the guest's registers back into `gp`/
/// `xmm` in place.
///
/// Returns `Ok(())` after a normal VM-exit. Returns
/// [`MonError::VmEntryFailed`] if VMLAUNCH/VMRESUME itself failed
/// synchronously (`CF=1` or `ZF=1`) — the caller should then read
/// `vmcs::ro::VM_INSTRUCTION_ERROR` and, for an invalid-guest-state
/// failure, run [`crate::vmenter_check`].
///
/// # Safety
/// The current VMCS must already be the active one (via VMPTRLD), and its
/// host-state area's segment/CR/MSR fields must already be programmed —
/// only `HOST_RSP`/`HOST_RIP` are (re)written here, on every call.
pub(crate) unsafe fn run(gp: &mut GpRegisters, xmm: &mut XmmRegisters, launched: bool) -> MonResult<()> {
    let host_rip_field = vmcs::host::RIP;
    let host_rsp_field = vmcs::host::RSP;
    let launched = u64::from(launched);
    let flags: u64;

    // Safety: the caller upholds the VMCS-state precondition; register
    // usage below is fully enumerated via `out`/`lateout`/`clobber_abi`.
    unsafe {
        asm!(
            // Callee-saved registers we clobber below and restore by hand,
            // so the compiler doesn't need to treat them as clobbered.
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            // Stash the two output pointers where the VM-exit path (label
            // 2, reached only via HOST_RIP, not by falling through) can
            // recover them regardless of what the guest did to rdi/rsi.
            "push rsi",
            "push rdi",

            "lea rax, [rip + 2f]",
            "vmwrite r8, rax",
            "mov rax, rsp",
            "vmwrite r9, rax",

            // Restore the guest's XMM state; rsi (xmm*) is still intact.
            "movdqu xmm0, [rsi + 0x00]",
            "movdqu xmm1, [rsi + 0x10]",
            "movdqu xmm2, [rsi + 0x20]",
            "movdqu xmm3, [rsi + 0x30]",
            "movdqu xmm4, [rsi + 0x40]",
            "movdqu xmm5, [rsi + 0x50]",
            "movdqu xmm6, [rsi + 0x60]",
            "movdqu xmm7, [rsi + 0x70]",
            "movdqu xmm8, [rsi + 0x80]",
            "movdqu xmm9, [rsi + 0x90]",
            "movdqu xmm10, [rsi + 0xa0]",
            "movdqu xmm11, [rsi + 0xb0]",
            "movdqu xmm12, [rsi + 0xc0]",
            "movdqu xmm13, [rsi + 0xd0]",
            "movdqu xmm14, [rsi + 0xe0]",
            "movdqu xmm15, [rsi + 0xf0]",

            "test rdx, rdx",
            "jnz 3f",

            // VMLAUNCH path: restore GP state from `gp` (rdi), rdi/rsi last.
            "mov rax, [rdi + 0x00]",
            "mov rbx, [rdi + 0x08]",
            "mov rcx, [rdi + 0x10]",
            "mov rbp, [rdi + 0x20]",
            "mov r8,  [rdi + 0x38]",
            "mov r9,  [rdi + 0x40]",
            "mov r10, [rdi + 0x48]",
            "mov r11, [rdi + 0x50]",
            "mov r12, [rdi + 0x58]",
            "mov r13, [rdi + 0x60]",
            "mov r14, [rdi + 0x68]",
            "mov r15, [rdi + 0x70]",
            "mov rsi, [rdi + 0x28]",
            "mov rdx, [rdi + 0x18]",
            "mov rdi, [rdi + 0x30]",
            "vmlaunch",
            "jmp 4f",

            "3:",
            // VMRESUME path: identical restore sequence.
            "mov rax, [rdi + 0x00]",
            "mov rbx, [rdi + 0x08]",
            "mov rcx, [rdi + 0x10]",
            "mov rbp, [rdi + 0x20]",
            "mov r8,  [rdi + 0x38]",
            "mov r9,  [rdi + 0x40]",
            "mov r10, [rdi + 0x48]",
            "mov r11, [rdi + 0x50]",
            "mov r12, [rdi + 0x58]",
            "mov r13, [rdi + 0x60]",
            "mov r14, [rdi + 0x68]",
            "mov r15, [rdi + 0x70]",
            "mov rsi, [rdi + 0x28]",
            "mov rdx, [rdi + 0x18]",
            "mov rdi, [rdi + 0x30]",
            "vmresume",

            "4:",
            // VMLAUNCH/VMRESUME returned control normally: it failed
            // synchronously. Capture RFLAGS for the caller and unwind.
            "pushfq",
            "pop rax",
            "add rsp, 16",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            "jmp 5f",

            // VM-exit lands here (HOST_RIP); rax..r15 hold the guest's
            // final register values. RSP == the value set above, so
            // [rsp+0]=gp*, [rsp+8]=xmm*, with the callee-saved pushes
            // beneath those untouched.
            "2:",
            "mov [rsp - 8], r15",
            "mov r15, [rsp]",
            "mov [r15 + 0x00], rax",
            "mov [r15 + 0x08], rbx",
            "mov [r15 + 0x10], rcx",
            "mov [r15 + 0x18], rdx",
            "mov [r15 + 0x20], rbp",
            "mov [r15 + 0x28], rsi",
            "mov [r15 + 0x30], rdi",
            "mov [r15 + 0x38], r8",
            "mov [r15 + 0x40], r9",
            "mov [r15 + 0x48], r10",
            "mov [r15 + 0x50], r11",
            "mov [r15 + 0x58], r12",
            "mov [r15 + 0x60], r13",
            "mov [r15 + 0x68], r14",
            "mov rax, [rsp - 8]",
            "mov [r15 + 0x70], rax",
            "mov rax, cr2",
            "mov [r15 + 0x78], rax",
            "mov rsi, [rsp + 8]",
            "movdqu [rsi + 0x00], xmm0",
            "movdqu [rsi + 0x10], xmm1",
            "movdqu [rsi + 0x20], xmm2",
            "movdqu [rsi + 0x30], xmm3",
            "movdqu [rsi + 0x40], xmm4",
            "movdqu [rsi + 0x50], xmm5",
            "movdqu [rsi + 0x60], xmm6",
            "movdqu [rsi + 0x70], xmm7",
            "movdqu [rsi + 0x80], xmm8",
            "movdqu [rsi + 0x90], xmm9",
            "movdqu [rsi + 0xa0], xmm10",
            "movdqu [rsi + 0xb0], xmm11",
            "movdqu [rsi + 0xc0], xmm12",
            "movdqu [rsi + 0xd0], xmm13",
            "movdqu [rsi + 0xe0], xmm14",
            "movdqu [rsi + 0xf0], xmm15",
            "add rsp, 16",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            "xor rax, rax",

            "5:",

            inout("rdi") gp.as_mut_ptr() => _,
            inout("rsi") xmm.as_mut_ptr() => _,
            inout("rdx") launched => _,
            inout("r8") u64::from(host_rip_field) => _,
            inout("r9") u64::from(host_rsp_field) => _,
            lateout("rax") flags,
            lateout("rcx") _,
            lateout("r10") _,
            lateout("r11") _,
            out("xmm0") _, out("xmm1") _, out("xmm2") _, out("xmm3") _,
            out("xmm4") _, out("xmm5") _, out("xmm6") _, out("xmm7") _,
            out("xmm8") _, out("xmm9") _, out("xmm10") _, out("xmm11") _,
            out("xmm12") _, out("xmm13") _, out("xmm14") _, out("xmm15") _,
        );
    }

    if flags & 0x1 != 0 || flags & 0x40 != 0 {
        Err(MonError::VmEntryFailed)
    } else {
        Ok(())
    }
}

impl GpRegisters {
    fn as_mut_ptr(&mut self) -> *mut GpRegisters {
        core::ptr::from_mut(self)
    }
}

impl XmmRegisters {
    fn as_mut_ptr(&mut self) -> *mut XmmRegisters {
        core::ptr::from_mut(self)
    }
}
