#![doc = include_str!("../README.md")]
#![no_main]
#![no_std]
#![feature(core_intrinsics)]
#![feature(new_uninit)]
#![feature(panic_info_message)]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]
#![allow(missing_docs)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod accountant;
mod acpi;
mod allocator;
mod config;
mod debug;
mod device_block;
mod ept;
mod error;
mod event;
mod gcpu;
mod global_state;
mod gpm;
mod guest;
mod guest_state;
mod hmm;
mod host_state;
mod hypervisor;
mod injection;
mod ipc;
mod logger;
mod mam;
mod page_walker;
mod panic;
mod pci;
mod reset;
mod suspend;
mod sync;
mod system_table;
mod vmcs;
mod vmcs_init;
mod vmenter_check;
mod vmentry;
mod vmexit;
mod vtd;
mod x86_instructions;

use crate::{
    event::{Handled, ResumeFromS3Event, RESUME_FROM_S3_BUS},
    global_state::{AcpiSingletons, GlobalState},
    logger::init_uart_logger,
    suspend::S3SleepTypes,
    system_table::{init_system_table, system_table},
};
use alloc::vec::Vec;
use core::ffi::c_void;
use hypervisor::start_hypervisor;
use log::{error, info, warn};
use system_table::system_table_unsafe;
use uefi::{
    prelude::*,
    proto::{loaded_image::LoadedImage, pi::mp::MpServices},
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// The entry point of the program.
#[no_mangle]
extern "efiapi" fn efi_main(image: Handle, system_table: SystemTable<Boot>) -> Status {
    init_uart_logger();
    info!("vmxcore loaded");

    init_system_table(system_table, image);
    print_image_info();

    let acpi = match discover_platform() {
        Ok(acpi) => acpi,
        Err(err) => {
            error!("ACPI platform discovery failed: {err}");
            return Status::LOAD_ERROR;
        }
    };

    device_block::init();
    let _ = RESUME_FROM_S3_BUS.lock().subscribe(on_resume_from_s3);

    let vtd_domain = vtd::new_domain(0, mam::Level::L2);
    let vtd = match vtd::VtdSubsystem::discover(acpi.rsdp_addr, vtd_domain, false) {
        Ok(vtd) => {
            if let Err(err) = vtd.activate_all() {
                warn!("VT-d activation failed, continuing without DMA remapping: {err}");
            }
            Some(vtd)
        }
        Err(err) => {
            info!("no VT-d remapping engines found on this platform: {err}");
            None
        }
    };

    global_state::init(GlobalState {
        guests: Vec::with_capacity(config::MAX_GUESTS),
        vtd,
        pci_block_guest: Vec::new(),
        acpi: acpi.singletons,
    });

    start_hypervisor_on_all_processors()
}

/// Reacts to the ACPI S3 resume signal (§4.F "wbinvd/VT-d re-activation on
/// S3 resume") by bringing every discovered VT-d engine back up; its
/// register state does not survive the sleep transition.
fn on_resume_from_s3(_event: &ResumeFromS3Event) -> Handled {
    global_state::with_global(|global| {
        if let Some(vtd) = &global.vtd {
            if let Err(err) = vtd.activate_all() {
                warn!("VT-d reactivation after S3 resume failed: {err}");
            }
        }
    });
    Handled::Continue
}

/// The platform facts this monitor needs before any core can be virtualized:
/// where VT-d's DMAR table lives (if any) and the fixed ACPI singletons
/// [`global_state::AcpiSingletons`] tracks.
struct PlatformAcpi {
    rsdp_addr: u64,
    singletons: AcpiSingletons,
}

fn discover_platform() -> Result<PlatformAcpi, crate::error::MonError> {
    let rsdp_addr = acpi::locate_rsdp()?;
    let fadt_addr = acpi::find_fadt(rsdp_addr)?;
    let (pm1a_control_port, pm1b_control_port) = acpi::pm1_control_ports(fadt_addr);
    let dsdt_addr = acpi::dsdt_addr_from_fadt(fadt_addr);
    let (typ_a, typ_b) = acpi::find_s3_sleep_types(dsdt_addr)?;

    Ok(PlatformAcpi {
        rsdp_addr,
        singletons: AcpiSingletons {
            pm1a_control_port,
            pm1b_control_port,
            s3_sleep_types: S3SleepTypes { typ_a, typ_b },
        },
    })
}

/// Starts [`start_hypervisor`] on every logical processor.
fn start_hypervisor_on_all_processors() -> ! {
    // Safety: code is single threaded at this point in the DXE phase.
    let st = unsafe { system_table_unsafe() };
    let bs = st.boot_services();
    let mp = unsafe {
        bs.open_protocol::<MpServices>(
            OpenProtocolParams {
                handle: bs.get_handle_for_protocol::<MpServices>().unwrap(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    };

    if let Ok(mp) = mp {
        // NOTE: we lose the current processor. EFI_MP_SERVICES_STARTUP_ALL_APS
        // cannot be used in non-blocking mode this early, and `start_hypervisor`
        // never returns, so this call never returns either: the BSP stays
        // parked in it forever.
        mp.startup_all_aps(false, start_hypervisor_on_ap, core::ptr::null_mut(), None).unwrap();
        panic!("should not return from startup_all_aps()");
    }

    // Uniprocessor platform: no MpServices protocol to hand APs off to.
    start_hypervisor(0)
}

/// Wraps the call to [`start_hypervisor`] for an AP entry via `MpServices`.
extern "efiapi" fn start_hypervisor_on_ap(_context: *mut c_void) {
    start_hypervisor(crate::logger::apic_id());
}

/// Debug prints the address of this module.
fn print_image_info() {
    let st = system_table();
    let bs = st.boot_services();
    // Safety: the protocol and handle remain valid indefinitely.
    let loaded_image = unsafe {
        bs.open_protocol::<LoadedImage>(
            OpenProtocolParams {
                handle: bs.image_handle(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
        .unwrap()
    };
    let (image_base, image_size) = loaded_image.info();
    info!("vmxcore image range {:#x} - {:#x}", image_base as u64, image_base as u64 + image_size);
}

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address, but
// very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    fn new() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

/// Computes how many pages are needed for the given bytes.
fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}
