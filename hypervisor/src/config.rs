//! The module containing various constants that may be modified by developers.

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// Maximum number of guests the monitor manages. Guests are allocated once
/// at init and never destroyed (see the data model's guest lifecycle).
pub(crate) const MAX_GUESTS: usize = 8;

/// Maximum number of CR0/CR4 write-handler registrations per guest (data
/// model: "a small fixed number").
pub(crate) const MAX_CR_WRITE_HANDLERS: usize = 4;

/// Maximum number of I/O-port monitor registrations per guest.
pub(crate) const MAX_IO_HANDLERS: usize = 64;

/// Maximum number of PCI devices a single guest may have hidden via
/// device-block.
pub(crate) const MAX_PCI_DEVICES: usize = 32;

/// Maximum outstanding-request count tracked per VMCS control bit before
/// saturating (accountant counters are one byte, §4.H).
pub(crate) const ACCOUNTANT_COUNTER_MAX: u8 = 255;

/// Number of preallocated nested (EPT) paging structures per guest, used to
/// build GPA -> HPA translations on the fly.
pub(crate) const EPT_STRUCTURE_POOL_SIZE: usize = 4096;

/// Number of preallocated VT-d second-level paging structures per domain.
pub(crate) const VTD_STRUCTURE_POOL_SIZE: usize = 4096;
