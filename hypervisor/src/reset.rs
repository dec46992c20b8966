//! 0xCF9 reset monitor (§4.M "0xCF9 monitor").
//!
//! Armed only when the platform is independently detected as running under
//! a KVM L0 host, since the workaround has no purpose (and no tested
//! correctness story) on bare metal (§9 Open Question (b)).

use crate::vmcs::vmxoff;
use core::ffi::c_void;

const SYS_RST: u32 = 1 << 1;
const RST_CPU: u32 = 1 << 2;

/// Detects a KVM L0 host via the hypervisor-present bit and the
/// `"KVMKVMKVM\0\0\0"` signature at CPUID leaf `0x4000_0000` (§9 "the
/// 0xCF8 pass-through-but-monitor workaround is specifically scoped to
/// KVM-host detection").
pub(crate) fn running_under_kvm_host() -> bool {
    if !cfg!(feature = "kvm_host_workarounds") {
        return false;
    }
    // Safety: CPUID is always available on any CPU this project targets.
    let features = unsafe { core::arch::x86_64::__cpuid(1) };
    if features.ecx & (1 << 31) == 0 {
        return false;
    }
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x4000_0000) };
    let mut sig = [0u8; 12];
    sig[0..4].copy_from_slice(&leaf.ebx.to_le_bytes());
    sig[4..8].copy_from_slice(&leaf.ecx.to_le_bytes());
    sig[8..12].copy_from_slice(&leaf.edx.to_le_bytes());
    &sig == b"KVMKVMKVM\0\0\0"
}

/// Whether a guest write of `value` to I/O port `0xCF9` is a full-reset
/// request this monitor must intercept.
pub(crate) fn is_reset_request(value: u8) -> bool {
    let value = u32::from(value);
    value & SYS_RST != 0 && value & RST_CPU != 0
}

/// Clears every VMCS pointer on this CPU's vCPU chain and executes
/// `VMXOFF`, leaving VMX operation cleanly (§4.M, reusing the teardown step
/// the S3 suspend path also performs).
pub(crate) fn clear_vmx_on_this_cpu(guests: &mut [crate::guest::Guest], host_cpu_id: u32) {
    for guest in guests {
        if let Some(gcpu) = guest.vcpu_mut(host_cpu_id) {
            gcpu.vmcs.clr_ptr();
        }
    }
    vmxoff();
}

extern "efiapi" fn clear_vmx_ipc_trampoline(_argument: *mut c_void) {
    // The real per-CPU guest table lives behind global state (§9 "Global
    // mutable state"); the IPC trampoline signature is fixed by UEFI's
    // `MpServices::startup_all_aps`, so it cannot carry a typed closure and
    // instead reaches through the same global accessor the dispatcher uses.
    crate::global_state::with_global(|global| {
        let host_cpu_id = global.current_host_cpu_id();
        clear_vmx_on_this_cpu(&mut global.guests, host_cpu_id);
    });
}

/// Handles a guest write to port `0xCF9` that requested a full reset:
/// broadcasts the clear-VMX procedure to every other host CPU, then runs it
/// on this one, before the caller forwards the write to the real port
/// (§4.M "broadcast ... then do the same on self before forwarding").
pub(crate) fn handle_reset_write(host_cpu_id: u32) {
    crate::ipc::exec_on_all_other_cpus(clear_vmx_ipc_trampoline, core::ptr::null_mut());
    crate::global_state::with_global(|global| {
        clear_vmx_on_this_cpu(&mut global.guests, host_cpu_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_request_requires_both_bits() {
        assert!(is_reset_request(0b0110));
        assert!(!is_reset_request(0b0010));
        assert!(!is_reset_request(0b0100));
        assert!(!is_reset_request(0));
    }
}
