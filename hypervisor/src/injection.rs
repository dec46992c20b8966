//! Event-Injection FSM (§4.J).
//!
//! Turns a pending guest fault or interrupt into a VM-entry
//! interruption-information write, replaying IDT-vectoring state across
//! VMExits per the architectural vector-class resolution table.

use crate::gcpu::Gcpu;

/// VM-entry interruption-information "type" subfield (bits [10:8]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InterruptType {
    External = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    Other = 7,
}

/// One event a caller asks [`inject_event`] to deliver.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingEvent {
    pub(crate) vector: u8,
    pub(crate) ty: InterruptType,
    pub(crate) error_code: Option<u32>,
    pub(crate) instr_len: Option<u32>,
    /// Set when this event replaces one whose VM-exit reported NMI
    /// unblocking due to IRET, so the re-injected event's own entry must
    /// re-arm NMI blocking (§4.J re-arm rule).
    pub(crate) nmi_unblocking_due_to_iret: bool,
}

/// Outcome of an injection attempt. Never a `Result`: a guest fault is not
/// an error the monitor failed to handle, it is the intended outcome
/// (§ error-handling design, "injectable guest faults").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Inject,
    BlockedArmWindow,
}

/// Architectural vector classes used by the 4x4 IDT-vectoring resolution
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VectorClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

/// Classifies a vector into its architectural fault class (SDM §6.15
/// double-fault rules): #DE,#TS,#NP,#SS,#GP are contributory; #PF is its
/// own class; #DF is its own class; everything else is benign.
pub(crate) fn classify(vector: u8) -> VectorClass {
    match vector {
        8 => VectorClass::DoubleFault,
        14 => VectorClass::PageFault,
        0 | 10 | 11 | 12 | 13 => VectorClass::Contributory,
        _ => VectorClass::Benign,
    }
}

/// What the 4x4 table resolves a (prior, new) vector-class pair to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    InjectNew,
    MakeDoubleFault,
    TearDown,
}

/// The §4.J reflection table, indexed `[prior][new]`.
const RESOLUTION_TABLE: [[Resolution; 4]; 4] = {
    use Resolution::{InjectNew as I, MakeDoubleFault as D, TearDown as T};
    // columns: benign, contributory, #PF, #DF
    [
        [I, I, I, T], // prior: benign
        [I, D, I, T], // prior: contributory
        [I, D, D, T], // prior: #PF
        [T, T, T, T], // prior: #DF
    ]
};

fn class_index(c: VectorClass) -> usize {
    match c {
        VectorClass::Benign => 0,
        VectorClass::Contributory => 1,
        VectorClass::PageFault => 2,
        VectorClass::DoubleFault => 3,
    }
}

/// Looks up the §4.J resolution for a pending IDT-vectoring event of class
/// `prior` receiving a new exception of class `new`.
pub(crate) fn resolve(prior: VectorClass, new: VectorClass) -> Resolution {
    RESOLUTION_TABLE[class_index(prior)][class_index(new)]
}

/// Vectors for which an error code is architecturally pushed (§4.J:
/// "#DF/#TS/#NP/#SS/#GP/#PF/#AC").
fn vector_carries_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
}

/// Attempts to inject `event` into `gcpu`. Returns `BlockedArmWindow` if an
/// IDT-vectoring event is already outstanding or guest interruptibility
/// forbids immediate delivery; the caller is then responsible for arming
/// the appropriate exit-on-unblock request via the accountant (done by
/// [`crate::gcpu::Gcpu::arm_injection_window`], not here, to keep this
/// function free of accountant access).
pub(crate) fn inject_event(gcpu: &mut Gcpu, event: PendingEvent) -> DispatchOutcome {
    if gcpu.idt_vectoring_outstanding() {
        return DispatchOutcome::BlockedArmWindow;
    }
    if !gcpu.interruptibility_allows(event.ty) {
        return DispatchOutcome::BlockedArmWindow;
    }

    let unrestricted_guest = gcpu.unrestricted_guest_enabled();
    let protected_mode = gcpu.cr0_pe();
    let error_code = if vector_carries_error_code(event.vector) && (!unrestricted_guest || protected_mode) {
        event.error_code
    } else {
        None
    };

    gcpu.write_entry_interruption(
        event.vector,
        event.ty,
        error_code,
        event.instr_len,
        event.nmi_unblocking_due_to_iret,
    );
    DispatchOutcome::Inject
}

/// Reflects an exception VMExit back into the guest, consulting the 4x4
/// table against whatever IDT-vectoring class was already pending. For
/// `#PF`, `cr2` is the exit-qualification-sourced faulting address.
pub(crate) fn reflect_exception(gcpu: &mut Gcpu, new_vector: u8, new_error_code: Option<u32>, cr2: Option<u64>) {
    let new_class = classify(new_vector);
    let rearm_nmi = gcpu.nmi_unblocking_due_to_iret();

    let resolution = match gcpu.prior_idt_vector_class() {
        Some(prior_class) => resolve(prior_class, new_class),
        None => Resolution::InjectNew,
    };

    match resolution {
        Resolution::InjectNew => {
            if new_class == VectorClass::PageFault {
                if let Some(cr2) = cr2 {
                    gcpu.set_cr2(cr2);
                }
            }
            let event = PendingEvent {
                vector: new_vector,
                ty: InterruptType::HardwareException,
                error_code: new_error_code,
                instr_len: None,
                nmi_unblocking_due_to_iret: rearm_nmi,
            };
            let _ = inject_event(gcpu, event);
        }
        Resolution::MakeDoubleFault => {
            let event = PendingEvent {
                vector: 8,
                ty: InterruptType::HardwareException,
                error_code: Some(0),
                instr_len: None,
                nmi_unblocking_due_to_iret: rearm_nmi,
            };
            let _ = inject_event(gcpu, event);
        }
        Resolution::TearDown => {
            crate::error::vmm_deadloop!("triple fault: unrecoverable IDT-vectoring chain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_sdm_groups() {
        assert_eq!(classify(0), VectorClass::Contributory); // #DE
        assert_eq!(classify(13), VectorClass::Contributory); // #GP
        assert_eq!(classify(14), VectorClass::PageFault);
        assert_eq!(classify(8), VectorClass::DoubleFault);
        assert_eq!(classify(6), VectorClass::Benign); // #UD
    }

    #[test]
    fn resolution_table_matches_spec() {
        use VectorClass::*;
        assert_eq!(resolve(Benign, Benign), Resolution::InjectNew);
        assert_eq!(resolve(Benign, DoubleFault), Resolution::TearDown);
        assert_eq!(resolve(Contributory, Contributory), Resolution::MakeDoubleFault);
        assert_eq!(resolve(Contributory, PageFault), Resolution::InjectNew);
        assert_eq!(resolve(PageFault, Contributory), Resolution::MakeDoubleFault);
        assert_eq!(resolve(PageFault, PageFault), Resolution::MakeDoubleFault);
        assert_eq!(resolve(DoubleFault, Benign), Resolution::TearDown);
    }

    #[test]
    fn error_code_vectors_are_exactly_the_architectural_set() {
        for v in 0u8..=31 {
            let expect = matches!(v, 8 | 10 | 11 | 12 | 13 | 14 | 17);
            assert_eq!(vector_carries_error_code(v), expect, "vector {v}");
        }
    }
}
