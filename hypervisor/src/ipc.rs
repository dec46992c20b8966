//! IPC broadcast service (§3 "(e) an IPC broadcast service to run a closure
//! on every other host CPU"), built on the UEFI `MpServices` protocol the
//! same way `main.rs` already uses it to start every AP.

use crate::system_table::system_table_unsafe;
use core::ffi::c_void;
use uefi::proto::pi::mp::MpServices;
use uefi::table::boot::{OpenProtocolAttributes, OpenProtocolParams};

/// Runs `procedure` on every host CPU other than the caller, passing
/// `argument` as its context, and blocks until every one of them has
/// returned (§5 "IPC broadcast ... sends IPIs that cause a brief
/// interruption of the target CPU's current vCPU to run `fn`").
pub(crate) fn exec_on_all_other_cpus(procedure: extern "efiapi" fn(*mut c_void), argument: *mut c_void) {
    // Safety: called only after `init_system_table`, from a single-threaded
    // bootstrap context per CPU (the dispatcher never reenters this call).
    let st = unsafe { system_table_unsafe() };
    let bs = st.boot_services();
    let Ok(handle) = bs.get_handle_for_protocol::<MpServices>() else { return };
    let Ok(mp) = (unsafe {
        bs.open_protocol::<MpServices>(
            OpenProtocolParams { handle, agent: bs.image_handle(), controller: None },
            OpenProtocolAttributes::GetProtocol,
        )
    }) else {
        return;
    };
    let _ = mp.startup_all_aps(true, procedure, argument, None);
}
