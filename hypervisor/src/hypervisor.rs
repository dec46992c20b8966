//! The monitor's per-core entry point and steady-state VM-exit loop (§4.M,
//! §4.N, §9 "MON main loop").
//!
//! Replaces the teacher's snapshot-fuzzing loop (`start_hypervisor`/
//! `start_vm`/`handle_nested_page_fault`) with a late-launch monitor: each
//! core virtualizes whatever was already running on it (no guest image is
//! booted from reset), then serves VM-exits forever. Grounded in the
//! teacher's `Vmx::enable`/`Vmx::initialize` bring-up sequence and its
//! `VmExitReason`-dispatch `match` in `hypervisor.rs`, generalized from one
//! fixed fuzzing dispatch to the table-driven [`crate::vmexit::dispatch`].

use crate::error::vmm_deadloop;
use crate::event::{EptViolationEvent, EPT_VIOLATION_BUS};
use crate::gcpu::{GpIndex, GpRegisters};
use crate::global_state;
use crate::guest::Guest;
use crate::host_state::HostState;
use crate::mam::Level as MamLevel;
use crate::vmcs::{self, Level};
use crate::vmcs_init;
use crate::vmenter_check;
use crate::vmexit::io::{self, IoQualification};
use crate::vmexit::{self, Classifier, ExitReasonEntry, HandlerOutcome};
use crate::x86_instructions::{outb, outw, rdmsr};
use crate::{gcpu::Gcpu, reset, suspend};
use alloc::boxed::Box;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};
use log::info;
use x86::msr;
use x86::vmx::vmcs as raw;

/// Attribute word used for this monitor's flat identity map: read, write,
/// execute, write-back memory type (§9 "identity-mapped GPA space"). The
/// same six-bit encoding is valid for both [`crate::gpm::Gpm`] and
/// [`crate::ept::Ept`] leaves.
const IDENTITY_MAP_ATTR: u64 = 0x37;

/// Low 512 GiB, mapped with 1 GiB EPT leaves (`Level::L3`). Covers every
/// physical address a UEFI platform in this class is expected to use;
/// anything above it traps as an (unresolved) EPT violation rather than
/// silently working, which is the conservative choice here.
const IDENTITY_MAP_SIZE: u64 = 0x80_0000_0000;

const EXIT_REASON_VMCALL: u16 = 18;

/// One flag per supported core, latching whether `start_hypervisor` has
/// already built and launched this core's vCPU. Sized to
/// [`crate::config::MAX_GUESTS`]; a platform with more logical processors
/// than that is outside this monitor's supported range (§1 Non-goal: no
/// dynamic CPU hot-add).
static ALREADY_VIRTUALIZED: [AtomicBool; crate::config::MAX_GUESTS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

/// A VMXON region: revision ID in the first four bytes, the rest reserved
/// (SDM §25.11.5). Leaked for the life of the core, exactly like every
/// other hardware-visible structure in this crate (§4.A design note).
#[repr(C, align(4096))]
struct VmxonRegion {
    revision_id: u32,
    _reserved: [u8; 0x1000 - 4],
}

impl VmxonRegion {
    fn new(revision_id: u32) -> Self {
        Self { revision_id, _reserved: [0; 0x1000 - 4] }
    }
}

/// Captures the full host register file plus `(rip, rsp, rflags)` at
/// exactly this point in execution, writing the registers into `regs`
/// (§4.M "late-launch"). The tuple names the *continuation point*: once
/// this core's first `VMLAUNCH` succeeds, the processor resumes here a
/// second time with every register restored to what was captured, making
/// this call indistinguishable from an ordinary return to its caller.
///
/// Field offsets match [`crate::vmentry::run`]'s `GpRegisters` layout.
///
/// # Safety
/// Must run with interrupts disabled and must not be inlined: the `lea`
/// capturing `rip` must name the instruction immediately following this
/// function's own call site, not some inlined copy of it.
#[inline(never)]
unsafe fn capture_launch_context(regs: &mut GpRegisters) -> (u64, u64, u64) {
    let rip: u64;
    let rsp: u64;
    let rflags: u64;
    asm!(
        "mov [{regs} + 0x00], rax",
        "mov [{regs} + 0x08], rbx",
        "mov [{regs} + 0x10], rcx",
        "mov [{regs} + 0x18], rdx",
        "mov [{regs} + 0x20], rbp",
        "mov [{regs} + 0x28], rsi",
        "mov [{regs} + 0x30], rdi",
        "mov [{regs} + 0x38], r8",
        "mov [{regs} + 0x40], r9",
        "mov [{regs} + 0x48], r10",
        "mov [{regs} + 0x50], r11",
        "mov [{regs} + 0x58], r12",
        "mov [{regs} + 0x60], r13",
        "mov [{regs} + 0x68], r14",
        "mov [{regs} + 0x70], r15",
        "lea {rip}, [rip + 2f]",
        "mov {rsp}, rsp",
        "pushfq",
        "pop {rflags}",
        "2:",
        regs = in(reg) core::ptr::addr_of_mut!(*regs),
        rip = out(reg) rip,
        rsp = out(reg) rsp,
        rflags = out(reg) rflags,
    );
    (rip, rsp, rflags)
}

fn identity_map_guest(guest: &Guest) {
    guest.map(0, 0, IDENTITY_MAP_SIZE, IDENTITY_MAP_ATTR);
}

fn handle_cf9_write(gcpu: &mut Gcpu, port: u16, _size: u8, value: u32) {
    if reset::is_reset_request(value as u8) && reset::running_under_kvm_host() {
        reset::handle_reset_write(gcpu.host_cpu_id);
        return;
    }
    outb(port, value as u8);
}

fn handle_pm1_control_write(_gcpu: &mut Gcpu, port: u16, size: u8, value: u32) {
    global_state::with_global(|global| {
        if suspend::is_s3_entry_request(value as u16, global.acpi.s3_sleep_types) {
            let ap_count = global.guests.len().saturating_sub(1) as u32;
            // The waking vector is platform firmware's job to supply; this
            // monitor only needs to know resume happened, not where it
            // resumes to.
            suspend::enter_s3(ap_count, 0, |_waking_vector| {});
        }
    });
    if size == 2 {
        outw(port, value as u16);
    } else {
        outb(port, value as u8);
    }
}

/// Registers this core's guest, identity-maps it, and wires the fixed I/O
/// port monitors every guest carries (0xCF9 reset, PM1 control blocks).
/// Runs once under the global lock; returns raw pointers this core keeps
/// for the rest of its life so the VM-exit fast path never locks
/// `GlobalState` again.
fn bring_up_vcpu(
    host_cpu_id: u32,
    host_state: &'static HostState,
    rip: u64,
    rsp: u64,
    rflags: u64,
    launch_regs: GpRegisters,
) -> (*mut Guest, *mut Gcpu) {
    global_state::with_global(|global| {
        assert!(global.guests.len() < crate::config::MAX_GUESTS, "guest pool exhausted");

        let mut guest = Guest::create(host_cpu_id, MamLevel::L3, true, 0);
        identity_map_guest(&guest);

        let _ = guest.io_monitor.register(0xCF9, None, Some(handle_cf9_write));
        let acpi = &global.acpi;
        if acpi.pm1a_control_port != 0 {
            let _ = guest.io_monitor.register(acpi.pm1a_control_port, None, Some(handle_pm1_control_write));
        }
        if acpi.pm1b_control_port != 0 {
            let _ = guest.io_monitor.register(acpi.pm1b_control_port, None, Some(handle_pm1_control_write));
        }

        let mut gcpu =
            Box::new(vmcs_init::create_gcpu(host_cpu_id, host_cpu_id, host_state, &guest.ept, rip, rsp, rflags));
        gcpu.gp = launch_regs;
        guest.add_vcpu(gcpu);

        global.guests.push(guest);
        // Safety: `global.guests` was allocated with capacity `MAX_GUESTS`
        // by the caller of `global_state::init` and never exceeds it (the
        // assert above), so this element's address is stable for the life
        // of the monitor — no later push can move it.
        let guest_ptr: *mut Guest = global.guests.last_mut().unwrap();
        let gcpu_ptr = unsafe { &mut *guest_ptr }.vcpu_mut(host_cpu_id).expect("just-pushed vCPU") as *mut Gcpu;
        (guest_ptr, gcpu_ptr)
    })
}

/// Brings this core into VMX operation and either launches its vCPU for the
/// first time or, on the resumed "second coming" after a successful
/// `VMLAUNCH`, falls straight through into [`run_guest_forever`].
pub(crate) fn start_hypervisor(host_cpu_id: u32) -> ! {
    info!("bringing CPU {host_cpu_id} into VMX operation");

    vmcs_init::adjust_feature_control_msr();
    vmcs_init::adjust_host_cr0();

    let vmxon_region = Box::leak(Box::new(VmxonRegion::new(vmcs::vmcs_revision_id())));
    crate::vmcs::vmxon(core::ptr::addr_of!(*vmxon_region) as u64);

    let host_state: &'static HostState = Box::leak(Box::new(HostState::build_from_current()));

    let mut launch_regs = GpRegisters::default();
    // Safety: interrupts are already off in the UEFI DXE phase this runs
    // in, and this call is the late-launch continuation point described
    // on `capture_launch_context`.
    let (rip, rsp, rflags) = unsafe { capture_launch_context(&mut launch_regs) };

    if !ALREADY_VIRTUALIZED[host_cpu_id as usize].swap(true, Ordering::SeqCst) {
        let (_guest_ptr, gcpu_ptr) = bring_up_vcpu(host_cpu_id, host_state, rip, rsp, rflags, launch_regs);
        // Safety: `gcpu_ptr` names this core's own just-created vCPU.
        if unsafe { (*gcpu_ptr).enter() }.is_err() {
            // Safety: same pointer as above.
            let error = unsafe { (*gcpu_ptr).vmcs.read(raw::ro::VM_INSTRUCTION_ERROR, Level::Level0) };
            vmm_deadloop!("initial VMLAUNCH failed synchronously: error {error}");
        }
        // A successful VMLAUNCH never returns to this call: the processor
        // resumes in guest mode at `rip`, i.e. right where
        // `capture_launch_context` returned above, with
        // `ALREADY_VIRTUALIZED` already latched true. This line is only
        // ever reached via a synchronous VMLAUNCH failure, handled above.
        unreachable!("VMLAUNCH either failed above or resumed execution at the captured RIP");
    }

    let (guest_ptr, gcpu_ptr) = global_state::with_global(|global| {
        let guest = global.guests.iter_mut().find(|g| g.id == host_cpu_id).expect("this core's guest must exist");
        let guest_ptr = guest as *mut Guest;
        let gcpu_ptr = guest.vcpu_mut(host_cpu_id).expect("this core's vCPU must exist") as *mut Gcpu;
        (guest_ptr, gcpu_ptr)
    });

    run_guest_forever(guest_ptr, gcpu_ptr)
}

fn max_phys_addr() -> u8 {
    // Safety: CPUID leaf 0x8000_0008 is available on every CPU VMX is
    // available on.
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0008) };
    (leaf.eax & 0xFF) as u8
}

/// Maps an x86 general-register encoding (Intel SDM Table 27-3: 0=RAX
/// through 7=RDI, 8=R8 through 15=R15) to its current value, used to decode
/// `MOV CRn, reg` / `MOV reg, CRn` exit qualifications.
fn read_cr_access_register(gcpu: &Gcpu, encoding: u8) -> u64 {
    match encoding {
        0 => gcpu.gp.rax,
        1 => gcpu.gp.rcx,
        2 => gcpu.gp.rdx,
        3 => gcpu.gp.rbx,
        4 => gcpu.read_gp(GpIndex::Rsp),
        5 => gcpu.gp.rbp,
        6 => gcpu.gp.rsi,
        7 => gcpu.gp.rdi,
        8 => gcpu.gp.r8,
        9 => gcpu.gp.r9,
        10 => gcpu.gp.r10,
        11 => gcpu.gp.r11,
        12 => gcpu.gp.r12,
        13 => gcpu.gp.r13,
        14 => gcpu.gp.r14,
        _ => gcpu.gp.r15,
    }
}

fn write_cr_access_register(gcpu: &mut Gcpu, encoding: u8, value: u64) {
    match encoding {
        0 => gcpu.gp.rax = value,
        1 => gcpu.gp.rcx = value,
        2 => gcpu.gp.rdx = value,
        3 => gcpu.gp.rbx = value,
        4 => gcpu.set_gp(GpIndex::Rsp, value),
        5 => gcpu.gp.rbp = value,
        6 => gcpu.gp.rsi = value,
        7 => gcpu.gp.rdi = value,
        8 => gcpu.gp.r8 = value,
        9 => gcpu.gp.r9 = value,
        10 => gcpu.gp.r10 = value,
        11 => gcpu.gp.r11 = value,
        12 => gcpu.gp.r12 = value,
        13 => gcpu.gp.r13 = value,
        14 => gcpu.gp.r14 = value,
        _ => gcpu.gp.r15 = value,
    }
}

/// `MOV CRn, reg` / `MOV reg, CRn` (reason 28). CR8 is deliberately absent:
/// this monitor never intercepts it (Open Question resolved in DESIGN.md —
/// TPR access is left to the guest).
fn handle_cr_access(gcpu: &mut Gcpu) -> HandlerOutcome {
    let qual = gcpu.vmcs.read(raw::ro::EXIT_QUALIFICATION, Level::Merged);
    let cr_number = (qual & 0xF) as u8;
    let access_type = (qual >> 4) & 0b11;
    let gp_encoding = ((qual >> 8) & 0xF) as u8;

    match (cr_number, access_type) {
        (0, 0) => gcpu.write_cr0(read_cr_access_register(gcpu, gp_encoding)),
        (0, 1) => {
            let value = gcpu.visible_cr0();
            write_cr_access_register(gcpu, gp_encoding, value);
        }
        (4, 0) => gcpu.write_cr4(read_cr_access_register(gcpu, gp_encoding)),
        (4, 1) => {
            let value = gcpu.visible_cr4();
            write_cr_access_register(gcpu, gp_encoding, value);
        }
        (3, 0) => {
            let value = read_cr_access_register(gcpu, gp_encoding);
            gcpu.vmcs.write(raw::guest::CR3, value, Level::Merged);
        }
        (3, 1) => {
            let value = gcpu.vmcs.read(raw::guest::CR3, Level::Merged);
            write_cr_access_register(gcpu, gp_encoding, value);
        }
        _ => return HandlerOutcome::NotHandled,
    }
    gcpu.skip_instruction();
    HandlerOutcome::Handled
}

fn handle_cpuid(gcpu: &mut Gcpu) -> HandlerOutcome {
    // Safety: CPUID has no preconditions beyond CPL0.
    let result = unsafe { core::arch::x86_64::__cpuid_count(gcpu.gp.rax as u32, gcpu.gp.rcx as u32) };
    gcpu.gp.rax = u64::from(result.eax);
    gcpu.gp.rbx = u64::from(result.ebx);
    gcpu.gp.rcx = u64::from(result.ecx);
    gcpu.gp.rdx = u64::from(result.edx);
    gcpu.skip_instruction();
    HandlerOutcome::Handled
}

fn handle_rdmsr(gcpu: &mut Gcpu) -> HandlerOutcome {
    let value = rdmsr(gcpu.gp.rcx as u32);
    gcpu.gp.rax = value & 0xFFFF_FFFF;
    gcpu.gp.rdx = value >> 32;
    gcpu.skip_instruction();
    HandlerOutcome::Handled
}

fn handle_wrmsr(gcpu: &mut Gcpu) -> HandlerOutcome {
    let msr_index = gcpu.gp.rcx as u32;
    let value = (gcpu.gp.rdx << 32) | (gcpu.gp.rax & 0xFFFF_FFFF);
    crate::x86_instructions::wrmsr(msr_index, value);
    gcpu.skip_instruction();
    HandlerOutcome::Handled
}

fn handle_hlt(gcpu: &mut Gcpu) -> HandlerOutcome {
    gcpu.skip_instruction();
    HandlerOutcome::Handled
}

fn build_exit_reason_table() -> [ExitReasonEntry; vmexit::EXIT_REASON_TABLE_LEN] {
    let mut table =
        [ExitReasonEntry { classifier: Classifier::BottomUp, handler: None }; vmexit::EXIT_REASON_TABLE_LEN];
    table[28] = ExitReasonEntry { classifier: Classifier::BottomUp, handler: Some(handle_cr_access) };
    table[10] = ExitReasonEntry { classifier: Classifier::BottomUp, handler: Some(handle_cpuid) };
    table[31] = ExitReasonEntry { classifier: Classifier::BottomUp, handler: Some(handle_rdmsr) };
    table[32] = ExitReasonEntry { classifier: Classifier::BottomUp, handler: Some(handle_wrmsr) };
    table[12] = ExitReasonEntry { classifier: Classifier::BottomUp, handler: Some(handle_hlt) };
    table
}

fn gpa_to_hva(guest: &Guest, gpa: u64) -> Option<u64> {
    let (hpa, _, present) = guest.gpm.get_mapping(gpa & !0xFFF);
    present.then_some(hpa | (gpa & 0xFFF))
}

/// EPT violation (reason 48). This monitor's GPM/EPT are built fully
/// populated at guest-creation time (§9), so a violation here only ever
/// means a device-block VMCALL retargeted a range the EPT hadn't caught up
/// with yet, or a genuinely unmapped access.
fn handle_ept_violation(guest: &mut Guest, gcpu: &mut Gcpu) {
    let qualification = gcpu.vmcs.read(raw::ro::EXIT_QUALIFICATION, Level::Merged);
    let gpa = gcpu.vmcs.read(raw::ro::GUEST_PHYSICAL_ADDR_FULL, Level::Merged);
    let read = qualification & 0b1 != 0;
    let write = qualification & 0b10 != 0;
    let execute = qualification & 0b100 != 0;

    EPT_VIOLATION_BUS.lock().dispatch(&EptViolationEvent { guest_id: guest.id, gpa, read, write, execute });

    let (hpa, attr, present) = guest.gpm.get_mapping(gpa & !0xFFF);
    if present {
        guest.ept.set_mapping(gpa & !0xFFF, hpa, 0x1000, attr);
    } else {
        vmm_deadloop!("EPT violation at unmapped GPA {gpa:#x}");
    }
}

/// I/O instruction (reason 30): decodes the exit qualification (SDM Table
/// 27-5) and routes it to the guest's [`IoMonitor`].
fn handle_io_instruction(guest: &mut Guest, gcpu: &mut Gcpu) {
    let qualification = gcpu.vmcs.read(raw::ro::EXIT_QUALIFICATION, Level::Merged);
    let size = match qualification & 0b111 {
        0 => 1,
        1 => 2,
        _ => 4,
    };
    let is_in = qualification & (1 << 3) != 0;
    let is_string = qualification & (1 << 4) != 0;
    let is_rep = qualification & (1 << 5) != 0;
    let port = (qualification >> 16) as u16;
    let q = IoQualification { port, size, is_in, is_string, is_rep };

    let ss_access_rights = gcpu.vmcs.read(raw::guest::SS_ACCESS_RIGHTS, Level::Merged);
    let cpl = ((ss_access_rights >> 5) & 0b11) as u8;

    let guest_ref: &Guest = guest;
    let read_guest_qword = |gpa: u64| -> Option<u64> {
        gpa_to_hva(guest_ref, gpa & !0x7).map(|hva| {
            // Safety: `hva` resolved through this guest's own GPM, which
            // only ever maps identity-mapped, host-owned physical memory.
            unsafe { core::ptr::read_unaligned(hva as *const u64) }
        })
    };

    let gpa_to_hva_fn = |gpa: u64| gpa_to_hva(guest_ref, gpa);
    io::handle_io_exit(gcpu, &guest.io_monitor, q, cpl, read_guest_qword, gpa_to_hva_fn);
}

fn handle_vmcall(guest: &mut Guest, gcpu: &mut Gcpu) {
    let leaf = gcpu.gp.rax;
    if leaf == crate::guest::EPT_UPDATE_VMCALL_LEAF {
        guest.handle_ept_update_vmcall(gcpu);
        gcpu.gp.rax = 0;
        gcpu.skip_instruction();
    } else if let Some(handler) = guest.find_vmcall(leaf) {
        gcpu.gp.rax = handler(gcpu);
        gcpu.skip_instruction();
    } else {
        crate::injection::reflect_exception(gcpu, 6, None, None); // #UD
    }
}

/// The steady-state per-core loop: `VMRESUME`, classify the exit, dispatch,
/// repeat. `guest_ptr`/`gcpu_ptr` are this core's own, captured once at
/// `bring_up_vcpu` time; nothing here touches `GlobalState`'s lock.
fn run_guest_forever(guest_ptr: *mut Guest, gcpu_ptr: *mut Gcpu) -> ! {
    let table = build_exit_reason_table();
    let max_phys_addr = max_phys_addr();
    let cr0_fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let cr0_fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
    let cr4_fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
    let cr4_fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);

    loop {
        // Safety: `guest_ptr`/`gcpu_ptr` are this core's own, never shared
        // or moved after `bring_up_vcpu` created them.
        let (guest, gcpu) = unsafe { (&mut *guest_ptr, &mut *gcpu_ptr) };

        if gcpu.enter().is_err() {
            let error = gcpu.vmcs.read(raw::ro::VM_INSTRUCTION_ERROR, Level::Level0);
            vmm_deadloop!("VMRESUME failed synchronously: error {error}");
        }

        let raw_reason = gcpu.vmcs.read(raw::ro::EXIT_REASON, Level::Level0);
        if raw_reason & (1 << 31) != 0 {
            vmenter_check::audit_and_deadloop(gcpu, cr0_fixed0, cr0_fixed1, cr4_fixed0, cr4_fixed1, max_phys_addr);
        }
        let reason = (raw_reason & 0xFFFF) as u16;

        match reason {
            vmexit::EXIT_REASON_EPT_VIOLATION => {
                vmexit::run_with_cache_discipline(gcpu, reason, false, false, |gcpu| {
                    handle_ept_violation(guest, gcpu);
                });
            }
            vmexit::analyzer::EXIT_REASON_IO_INSTRUCTION => {
                vmexit::run_with_cache_discipline(gcpu, reason, false, false, |gcpu| {
                    handle_io_instruction(guest, gcpu);
                });
            }
            EXIT_REASON_VMCALL => {
                vmexit::run_with_cache_discipline(gcpu, reason, false, false, |gcpu| {
                    handle_vmcall(guest, gcpu);
                });
            }
            _ => {
                let read_guest_byte =
                    |gpa: u64| -> Option<u8> { gpa_to_hva(guest, gpa).map(|hva| unsafe { *(hva as *const u8) }) };
                vmexit::run_with_cache_discipline(gcpu, reason, false, false, |gcpu| {
                    let _ = vmexit::dispatch(gcpu, &table, reason, None, None, None, None, None, &read_guest_byte);
                });
            }
        }
    }
}
