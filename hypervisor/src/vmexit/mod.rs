//! VMExit Dispatcher (§4.I).

pub(crate) mod analyzer;
pub(crate) mod io;

use crate::gcpu::Gcpu;
use crate::injection::reflect_exception;
use crate::vmcs::Level;
use analyzer::ExitReason;
use x86::vmx::vmcs;

/// Which guest level the dispatcher should resume after this exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NextGuestLevel {
    L1,
    L2,
}

/// What an L0 handler decided about one VMExit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    /// The handler fully serviced the exit; resume L2 (or L1 if there is no
    /// nested guest).
    Handled,
    /// The handler does not own this reason; let the dispatcher consult the
    /// analyzer / reflect to the guest.
    NotHandled,
    /// The handler explicitly wants to descend back into L2 even though an
    /// L1 guest is active (§4.I "Top-down ... may return
    /// HANDLED_RESUME_LEVEL2 to explicitly descend").
    HandledResumeLevel2,
}

pub(crate) type ExitHandler = fn(&mut Gcpu) -> HandlerOutcome;

/// Classification policy an exit reason's table entry selects (§4.I
/// "dispatch through a 60-entry table mapping each reason to one of two
/// classifiers").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Classifier {
    BottomUp,
    TopDown,
}

/// One row of the exit-reason table (§6 "60 reasons (0..59)").
#[derive(Clone, Copy)]
pub(crate) struct ExitReasonEntry {
    pub(crate) classifier: Classifier,
    pub(crate) handler: Option<ExitHandler>,
}

pub(crate) const EXIT_REASON_TABLE_LEN: usize = 60;

/// Reads the bit for `port` out of L1's I/O-bitmap page named by the
/// `IO_BITMAP_{A,B}_FULL` GPA (§4.I analyzer, "I/O checks bitmap"):
/// `read_guest_byte` resolves one guest-physical byte through the GPM the
/// same way [`crate::vmexit::io::IoBitmap`] is read on the L0 side.
fn read_io_bitmap_bit(bitmap_gpa: u64, port: u16, read_guest_byte: &impl Fn(u64) -> Option<u8>) -> bool {
    let gpa = bitmap_gpa + u64::from(port / 8);
    read_guest_byte(gpa).is_some_and(|b| b & (1 << (port % 8)) != 0)
}

/// Reads the bit for `msr` out of L1's MSR-bitmap page named by
/// `MSR_BITMAPS_FULL` (SDM §25.6.9: 4x1024-bit regions — read-low,
/// read-high, write-low, write-high).
fn read_msr_bitmap_bit(bitmap_gpa: u64, msr: u32, is_write: bool, read_guest_byte: &impl Fn(u64) -> Option<u8>) -> bool {
    let (region_offset, bit_index) = if msr <= 0x1FFF {
        (0, msr)
    } else {
        (0x400, msr - 0xC000_0000)
    };
    let region_offset = region_offset + if is_write { 0x800 } else { 0 };
    let gpa = bitmap_gpa + region_offset + u64::from(bit_index / 8);
    read_guest_byte(gpa).is_some_and(|b| b & (1 << (bit_index % 8)) != 0)
}

/// Runs `handler` (or the release-mode default) for `reason`, then resolves
/// whether L1 or L2 should be resumed (§4.I steps 6, "Bottom-up"/"Top-down").
///
/// `exception_info` is forwarded to the analyzer only when `reason` is the
/// exception-or-NMI exit; it carries the vector and, for `#PF`, its error
/// code, matching the analyzer's own exception-bitmap+mask/match check.
/// `read_guest_byte` lets the analyzer inspect L1's I/O/MSR bitmap content
/// through the GPM without the dispatcher itself owning a GPM reference.
#[allow(clippy::too_many_arguments)]
pub(crate) fn dispatch(
    gcpu: &mut Gcpu,
    table: &[ExitReasonEntry; EXIT_REASON_TABLE_LEN],
    reason: ExitReason,
    exception_info: Option<(u8, Option<u32>)>,
    cr_access: Option<analyzer::CrAccessQualification>,
    new_cr3: Option<u64>,
    io_port: Option<u16>,
    msr: Option<(u32, bool)>,
    read_guest_byte: impl Fn(u64) -> Option<u8>,
) -> NextGuestLevel {
    let entry = table.get(usize::from(reason)).copied();
    let running_l2 = gcpu.running_level1 && gcpu.vmcs.nested_active();
    let classifier = entry.map_or(Classifier::BottomUp, |e| e.classifier);

    let l1_wants_exit = |gcpu: &Gcpu| {
        analyzer::l1_wants_exit(
            gcpu,
            reason,
            cr_access,
            new_cr3,
            io_port,
            msr,
            exception_info,
            |bitmap, port| read_io_bitmap_bit(bitmap, port, &read_guest_byte),
            |bitmap, msr, is_write| read_msr_bitmap_bit(bitmap, msr, is_write, &read_guest_byte),
        )
    };

    // Top-down reasons must have L1 ownership decided before any L0 handler
    // runs: its side effects (register writes, `skip_instruction`) must not
    // happen if this exit turns out to belong to L1 (§4.I "Top-down").
    if classifier == Classifier::TopDown && running_l2 && l1_wants_exit(gcpu) {
        return NextGuestLevel::L1;
    }

    let outcome = match entry.and_then(|e| e.handler) {
        Some(handler) => handler(gcpu),
        None => default_handler(gcpu, reason),
    };

    if outcome == HandlerOutcome::HandledResumeLevel2 {
        return NextGuestLevel::L2;
    }
    if outcome == HandlerOutcome::Handled && !running_l2 {
        return NextGuestLevel::L1;
    }

    match classifier {
        Classifier::BottomUp => {
            if outcome == HandlerOutcome::Handled {
                return NextGuestLevel::L2;
            }
            if running_l2 && l1_wants_exit(gcpu) {
                NextGuestLevel::L1
            } else {
                if let Some((vector, ec)) = exception_info {
                    reflect_exception(gcpu, vector, ec, None);
                }
                NextGuestLevel::L2
            }
        }
        Classifier::TopDown => NextGuestLevel::L2,
    }
}

/// Release-mode default for a reason with no registered handler: inject
/// `#GP(0)` and resume; DEBUG builds deadloop instead (§6 "New reasons
/// default to `default_handler` (deadloop in DEBUG; inject #GP(0) and
/// resume in release)").
fn default_handler(gcpu: &mut Gcpu, reason: ExitReason) -> HandlerOutcome {
    if cfg!(debug_assertions) {
        crate::error::vmm_deadloop!("unhandled VMExit reason {reason}");
    } else {
        reflect_exception(gcpu, 13, Some(0), None);
        HandlerOutcome::Handled
    }
}

/// Exit-qualification 7-bit class 0 is an EPT violation (§4.I step 4,
/// "unless the exit was EPT-violation (7-bit qualification class 0)").
pub(crate) const EXIT_REASON_EPT_VIOLATION: ExitReason = 48;

/// Runs the fixed per-exit preamble (§4.I steps 1, 4, 5) around a caller
/// supplied `body` that performs steps 2/3/6. Returns whatever `body`
/// returns.
///
/// `mtf_follow_up` and `fast_view_switch_active` let the caller short
/// circuit steps 2/3 without this function needing to know about MTF or
/// fast-view-switch bookkeeping itself.
pub(crate) fn run_with_cache_discipline<T>(
    gcpu: &mut Gcpu,
    reason: ExitReason,
    mtf_follow_up: bool,
    fast_view_switch_active: bool,
    mut body: impl FnMut(&mut Gcpu) -> T,
) -> Option<T> {
    gcpu.vmcs.disable_cache();

    if mtf_follow_up {
        gcpu.vmcs.enable_cache();
        return None;
    }
    if fast_view_switch_active {
        // Fast-view-switch servicing happens in `body` itself when the
        // caller recognizes the guest used it; this hook only documents
        // the step-3 hand-off point named by the dispatcher's preamble.
    }

    let result = body(gcpu);

    if reason != EXIT_REASON_EPT_VIOLATION {
        gcpu.vmcs.enable_cache();
    }

    let _ = gcpu.vmcs.read(vmcs::ro::EXIT_REASON, Level::Level0);
    Some(result)
}
