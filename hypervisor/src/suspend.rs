//! ACPI S3 suspend/resume (§4.M "S3 suspend", "S3 resume").
//!
//! The actual resume trampoline is a real-mode assembly stub executed by
//! the firmware at the SIPI vector; that stub is boot-time image layout,
//! an external collaborator per §1, and lives outside this crate's tree
//! the same way the teacher's UEFI loader glue does. This module owns the
//! decisions: detecting the guest's S3 write, coordinating the broadcast
//! teardown, and raising `EVENT_RESUME_FROM_S3` once every CPU is back.

use crate::event::{ResumeFromS3Event, RESUME_FROM_S3_BUS};
use crate::vmcs::vmxoff;
use crate::x86_instructions::wbinvd;
use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

/// The parsed `(SLP_TYPa, SLP_TYPb)` pair this platform's DSDT declares for
/// the S3 state, established once at init from [`crate::acpi::find_s3_sleep_types`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct S3SleepTypes {
    pub(crate) typ_a: u8,
    pub(crate) typ_b: u8,
}

const SLP_EN: u16 = 1 << 13;
const SLP_TYP_SHIFT: u16 = 10;
const SLP_TYP_MASK: u16 = 0b111;

/// Whether a guest write of `pm1_control` to the ACPI PM1 control block
/// requests entry into S3 under this platform's sleep-type pair (§4.M "S3
/// suspend": "detect via ACPI PM1 control block write matching the parsed
/// SLP_TYPa/b for S3 with SLP_EN=1").
pub(crate) fn is_s3_entry_request(pm1_control: u16, types: S3SleepTypes) -> bool {
    if pm1_control & SLP_EN == 0 {
        return false;
    }
    let slp_typ = ((pm1_control >> SLP_TYP_SHIFT) & SLP_TYP_MASK) as u8;
    slp_typ == types.typ_a || slp_typ == types.typ_b
}

/// Number of application processors that have reported `slept=1`, reset to
/// 0 at the start of every suspend sequence.
static SLEPT_AP_COUNT: AtomicU32 = AtomicU32::new(0);

/// Runs on every AP during the broadcast: clears VMCS pointers, executes
/// `VMXOFF`, then marks itself asleep for the BSP's spin-wait (§4.M
/// "broadcast prepare_s3_percpu (clear VMCS ptrs, vmxoff, APs halt setting
/// slept=1)").
extern "efiapi" fn prepare_s3_percpu(_argument: *mut c_void) {
    crate::global_state::with_global(|global| {
        let host_cpu_id = global.current_host_cpu_id();
        crate::reset::clear_vmx_on_this_cpu(&mut global.guests, host_cpu_id);
    });
    SLEPT_AP_COUNT.fetch_add(1, Ordering::SeqCst);
    crate::x86_instructions::hlt();
}

/// Drives the BSP side of S3 entry (§4.M "S3 suspend"): arms every AP via
/// the IPC broadcast, spins until all of them report `slept=1`, writes the
/// resume vector into the firmware waking-vector field, then `WBINVD`s
/// before letting the platform's own ACPI write complete the transition.
///
/// `ap_count` is the number of APs expected to report in;
/// `write_waking_vector` stores `resume_sipi_page` into the FACS waking
/// vector field, an ACPI-table-format detail this module treats as an
/// external collaborator's job (§1).
pub(crate) fn enter_s3(ap_count: u32, resume_sipi_page: u32, write_waking_vector: impl FnOnce(u32)) {
    SLEPT_AP_COUNT.store(0, Ordering::SeqCst);
    crate::ipc::exec_on_all_other_cpus(prepare_s3_percpu, core::ptr::null_mut());

    while SLEPT_AP_COUNT.load(Ordering::SeqCst) < ap_count {
        core::hint::spin_loop();
    }

    write_waking_vector(resume_sipi_page);
    wbinvd();
}

/// Runs on resume, once every AP has reloaded its own VMX state (§4.M "S3
/// resume": "re-runs vmx_on, vmptrld, clears launched, re-emits reset
/// guest state"). `vmxon_region_hpa` and `revision_id` are this CPU's own
/// pre-allocated VMXON region, set up identically to first boot.
pub(crate) fn resume_vcpu_after_s3(gcpu: &mut crate::gcpu::Gcpu, vmxon_region_hpa: u64) {
    crate::vmcs::vmxon(vmxon_region_hpa);
    gcpu.vmcs.clear_launched();
}

/// Raises `EVENT_RESUME_FROM_S3` once every CPU is confirmed back (§4.M
/// "Finally raises EVENT_RESUME_FROM_S3 (VT-d re-activates here) and
/// resumes the vCPU"). VT-d's own subscriber re-runs
/// [`crate::vtd::VtdSubsystem::activate_all`].
pub(crate) fn signal_resume_complete(waking_vector: u32) {
    RESUME_FROM_S3_BUS.lock().dispatch(&ResumeFromS3Event { waking_vector });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_entry_requires_slp_en_and_matching_type() {
        let types = S3SleepTypes { typ_a: 5, typ_b: 7 };
        let matching_a = (5u16 << SLP_TYP_SHIFT) | SLP_EN;
        let matching_b = (7u16 << SLP_TYP_SHIFT) | SLP_EN;
        let wrong_type = (3u16 << SLP_TYP_SHIFT) | SLP_EN;
        let no_slp_en = 5u16 << SLP_TYP_SHIFT;

        assert!(is_s3_entry_request(matching_a, types));
        assert!(is_s3_entry_request(matching_b, types));
        assert!(!is_s3_entry_request(wrong_type, types));
        assert!(!is_s3_entry_request(no_slp_en, types));
    }
}
