//! The module containing the [`MonError`] type and the [`vmm_deadloop`] macro.
//!
//! Error kinds follow the four categories of the design: injectable guest
//! faults never appear here (they flow through [`crate::injection`]
//! instead), recoverable monitor errors are represented by [`MonError`],
//! fatal invariant violations call [`vmm_deadloop`], and platform teardown
//! (§4.M) is infallible by construction.

use core::fmt;

/// Errors a host-side (pre-guest or setup-time) operation can report
/// without resorting to a fatal deadloop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonError {
    /// A GPM lookup did not find a mapping for the requested GPA.
    GpmMiss,
    /// An ACPI table (RSDP/FADT/DSDT/DMAR) could not be located or failed
    /// its checksum.
    AcpiTableNotFound,
    /// A VT-d remapping engine rejected an activation sequence (GSTS bit
    /// never set).
    VtdEngineNotReady,
    /// A guest-page-table read during a page walk could not be resolved to
    /// a host virtual address (GPM miss while walking guest paging
    /// structures specifically).
    GuestPageTableUnreadable,
    /// The requested resource pool (guests, handlers, PCI devices) is full.
    PoolExhausted,
    /// VMLAUNCH/VMRESUME failed synchronously (`CF=1` or `ZF=1`); the
    /// caller should consult `vmcs::ro::VM_INSTRUCTION_ERROR` and, for a
    /// failed VM-entry specifically, run the consistency checker.
    VmEntryFailed,
}

impl fmt::Display for MonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::GpmMiss => "no GPA -> HPA mapping present",
            Self::AcpiTableNotFound => "ACPI table not found or checksum mismatch",
            Self::VtdEngineNotReady => "VT-d remapping engine failed to activate",
            Self::GuestPageTableUnreadable => "guest page-table read missed the GPM",
            Self::PoolExhausted => "fixed-size resource pool exhausted",
            Self::VmEntryFailed => "VMLAUNCH/VMRESUME failed synchronously",
        };
        f.write_str(msg)
    }
}

/// Convenience alias for host-side fallible operations.
pub(crate) type MonResult<T> = Result<T, MonError>;

/// Logs a fatal-invariant message and halts the current processor forever
/// with interrupts disabled.
///
/// This is the target of every "fatal invariants" error kind in the design:
/// MAM alignment violations, accountant counter underflow, EPT
/// misconfiguration, triple fault, an unknown VMExit reason in debug builds,
/// and VM-entry validation failures after the consistency-checker sweep all
/// route here. There is no return.
macro_rules! vmm_deadloop {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        $crate::x86_instructions::cli();
        loop {
            $crate::x86_instructions::hlt();
        }
    }};
}

pub(crate) use vmm_deadloop;
