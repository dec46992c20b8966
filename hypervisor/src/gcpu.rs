//! Guest-CPU (vCPU) state model (§3 "Guest-CPU", §4.G).

use crate::accountant::ControlGroup;
use crate::event::{Handled, SetCr2Event, SET_CR2_BUS};
use crate::injection::{InterruptType, VectorClass};
use crate::vmcs::{Level, Vmcs};
use derivative::Derivative;
use x86::vmx::vmcs;

/// The 16 GP registers plus 16 XMM registers the VMExit asm trampoline
/// saves/restores, matching the teacher's `GuestRegisters` generalized from
/// 18 fields (no XMM) to the full SDM-visible set this spec's data model
/// calls for.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct GpRegisters {
    pub(crate) rax: u64,
    pub(crate) rbx: u64,
    pub(crate) rcx: u64,
    pub(crate) rdx: u64,
    pub(crate) rbp: u64,
    pub(crate) rsi: u64,
    pub(crate) rdi: u64,
    pub(crate) r8: u64,
    pub(crate) r9: u64,
    pub(crate) r10: u64,
    pub(crate) r11: u64,
    pub(crate) r12: u64,
    pub(crate) r13: u64,
    pub(crate) r14: u64,
    pub(crate) r15: u64,
    pub(crate) cr2: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C, align(16))]
pub(crate) struct XmmRegisters {
    pub(crate) regs: [u128; 16],
}

/// 256-bit pending-interrupt bitmap stored as 8x32, with bit 0 of group 0
/// serving as the "any group non-empty" summary (§3, §4.G).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PendingInterruptBitmap {
    groups: [u32; 8],
}

impl PendingInterruptBitmap {
    pub(crate) fn set(&mut self, vector: u8) {
        let group = (vector >> 5) as usize;
        let bit = vector & 0x1F;
        self.groups[group] |= 1 << bit;
        self.groups[0] |= 1 << group;
    }

    pub(crate) fn clear(&mut self, vector: u8) {
        let group = (vector >> 5) as usize;
        let bit = vector & 0x1F;
        self.groups[group] &= !(1 << bit);
        if group != 0 && self.groups[group] == 0 {
            self.groups[0] &= !(1 << group);
        }
    }

    /// Returns the highest pending vector, or `None` if empty
    /// (`bsr(group0)*32 + bsr(group_N)`, §4.G `get()`).
    pub(crate) fn highest(&self) -> Option<u8> {
        if self.groups[0] == 0 {
            return None;
        }
        let group = 31 - self.groups[0].leading_zeros();
        let bits = self.groups[group as usize];
        if bits == 0 {
            return None;
        }
        let bit = 31 - bits.leading_zeros();
        Some((group * 32 + bit) as u8)
    }
}

/// One registration of a CR0/CR4 write handler (data model: "up to a small
/// fixed number").
#[derive(Clone, Copy)]
pub(crate) struct CrWriteHandler {
    pub(crate) mask: u64,
    pub(crate) callback: fn(&mut Gcpu, old: u64, new: u64),
}

/// Outstanding IDT-vectoring state replayed across a VMExit (§4.J).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IdtVectoringState {
    pub(crate) vector: Option<u8>,
}

/// Per-vCPU VMCS-control bookkeeping: one [`ControlGroup`] per accounted
/// field (§4.H).
pub(crate) struct VmexitSetup {
    pub(crate) pin_based: ControlGroup,
    pub(crate) proc_based_primary: ControlGroup,
    pub(crate) proc_based_secondary: ControlGroup,
    pub(crate) exception_bitmap: ControlGroup,
    pub(crate) exit_controls: ControlGroup,
    pub(crate) entry_controls: ControlGroup,
    pub(crate) cr0_mask: ControlGroup,
    pub(crate) cr4_mask: ControlGroup,
}

/// A virtual CPU (§3 "Guest-CPU").
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Gcpu {
    #[derivative(Debug = "ignore")]
    pub(crate) vmcs: Vmcs,
    pub(crate) gp: GpRegisters,
    #[derivative(Debug = "ignore")]
    pub(crate) xmm: XmmRegisters,
    pub(crate) pending_interrupts: PendingInterruptBitmap,
    pub(crate) cr_write_handlers: [Option<CrWriteHandler>; crate::config::MAX_CR_WRITE_HANDLERS],
    pub(crate) idt_vectoring: IdtVectoringState,
    #[derivative(Debug = "ignore")]
    pub(crate) vmexit_setup: VmexitSetup,
    pub(crate) guest_id: u32,
    pub(crate) host_cpu_id: u32,
    /// Software shadow of CR0/CR4 bits the accountant's masks hide from the
    /// guest (§4.G "visible-vs-true shadowing").
    pub(crate) cr0_shadow: u64,
    pub(crate) cr4_shadow: u64,
    pub(crate) running_level1: bool,
}

impl Gcpu {
    pub(crate) fn read_gp(&self, index: GpIndex) -> u64 {
        match index {
            GpIndex::Rax => self.gp.rax,
            GpIndex::Rbx => self.gp.rbx,
            GpIndex::Rcx => self.gp.rcx,
            GpIndex::Rdx => self.gp.rdx,
            GpIndex::Rsi => self.gp.rsi,
            GpIndex::Rdi => self.gp.rdi,
            GpIndex::Rbp => self.gp.rbp,
            GpIndex::Rsp => self.vmcs.read(vmcs::guest::RSP, Level::Merged),
        }
    }

    pub(crate) fn set_gp(&mut self, index: GpIndex, value: u64) {
        match index {
            GpIndex::Rax => self.gp.rax = value,
            GpIndex::Rbx => self.gp.rbx = value,
            GpIndex::Rcx => self.gp.rcx = value,
            GpIndex::Rdx => self.gp.rdx = value,
            GpIndex::Rsi => self.gp.rsi = value,
            GpIndex::Rdi => self.gp.rdi = value,
            GpIndex::Rbp => self.gp.rbp = value,
            GpIndex::Rsp => self.vmcs.write(vmcs::guest::RSP, value, Level::Merged),
        }
    }

    /// `(vmcs.cr0 & !mask) | (shadow & mask)` (§4.G visible-CR0).
    pub(crate) fn visible_cr0(&self) -> u64 {
        let real = self.vmcs.read(vmcs::guest::CR0, Level::Merged);
        let mask = self.vmcs.read(vmcs::control::CR0_GUEST_HOST_MASK, Level::Merged);
        (real & !mask) | (self.cr0_shadow & mask)
    }

    pub(crate) fn visible_cr4(&self) -> u64 {
        let real = self.vmcs.read(vmcs::guest::CR4, Level::Merged);
        let mask = self.vmcs.read(vmcs::control::CR4_GUEST_HOST_MASK, Level::Merged);
        (real & !mask) | (self.cr4_shadow & mask)
    }

    /// Writes a new guest-visible CR0 value: mask-cleared bits update the
    /// real VMCS field, masked bits update the shadow, atomically with
    /// respect to any reader of `visible_cr0`.
    pub(crate) fn write_cr0(&mut self, new_value: u64) {
        let mask = self.vmcs.read(vmcs::control::CR0_GUEST_HOST_MASK, Level::Merged);
        let old_real = self.vmcs.read(vmcs::guest::CR0, Level::Merged);
        let new_real = (old_real & mask) | (new_value & !mask);
        self.vmcs.write(vmcs::guest::CR0, new_real, Level::Merged);
        self.cr0_shadow = (self.cr0_shadow & !mask) | (new_value & mask);
        self.run_cr_handlers(0, old_real, new_value);
        self.update_guest_mode();
    }

    pub(crate) fn write_cr4(&mut self, new_value: u64) {
        let mask = self.vmcs.read(vmcs::control::CR4_GUEST_HOST_MASK, Level::Merged);
        let old_real = self.vmcs.read(vmcs::guest::CR4, Level::Merged);
        let new_real = (old_real & mask) | (new_value & !mask);
        self.vmcs.write(vmcs::guest::CR4, new_real, Level::Merged);
        self.cr4_shadow = (self.cr4_shadow & !mask) | (new_value & mask);
        self.run_cr_handlers(4, old_real, new_value);
        self.update_guest_mode();
    }

    fn run_cr_handlers(&mut self, which_cr: u8, old: u64, new: u64) {
        let handlers = self.cr_write_handlers;
        for handler in handlers.into_iter().flatten() {
            let _ = which_cr;
            (handler.callback)(self, old, new);
        }
    }

    /// After a CR0.PG or EFER.LME write, sets EFER.LMA and the
    /// IA32e-mode-guest entry control iff both are 1, clears both
    /// otherwise (§4.G "guest-mode update").
    pub(crate) fn update_guest_mode(&mut self) {
        let cr0 = self.vmcs.read(vmcs::guest::CR0, Level::Merged);
        let paging_enabled = cr0 & (1 << 31) != 0;
        let efer = self.vmcs.read(vmcs::guest::IA32_EFER_FULL, Level::Merged);
        let lme = efer & (1 << 8) != 0;

        let ia32e = paging_enabled && lme;
        let new_efer = if ia32e { efer | (1 << 10) } else { efer & !(1 << 10) };
        self.vmcs.write(vmcs::guest::IA32_EFER_FULL, new_efer, Level::Merged);

        let entry_controls = self.vmcs.read(vmcs::control::VMENTRY_CONTROLS, Level::Merged);
        const IA32E_MODE_GUEST: u64 = 1 << 9;
        let new_entry_controls =
            if ia32e { entry_controls | IA32E_MODE_GUEST } else { entry_controls & !IA32E_MODE_GUEST };
        self.vmcs.write(vmcs::control::VMENTRY_CONTROLS, new_entry_controls, Level::Merged);
    }

    /// Reads `VMCS_EXIT_INSTR_LEN` and advances `RIP` past the emulated
    /// instruction (§4.G `skip_instruction`).
    pub(crate) fn skip_instruction(&mut self) {
        let len = self.vmcs.read(vmcs::ro::VMEXIT_INSTRUCTION_LEN, Level::Merged);
        let rip = self.vmcs.read(vmcs::guest::RIP, Level::Merged);
        self.vmcs.write(vmcs::guest::RIP, rip + len, Level::Merged);
    }

    pub(crate) fn cr0_pe(&self) -> bool {
        self.visible_cr0() & 1 != 0
    }

    pub(crate) fn unrestricted_guest_enabled(&self) -> bool {
        const UNRESTRICTED_GUEST: u64 = 1 << 7;
        self.vmcs.read(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, Level::Merged)
            & UNRESTRICTED_GUEST
            != 0
    }

    pub(crate) fn idt_vectoring_outstanding(&self) -> bool {
        self.idt_vectoring.vector.is_some()
    }

    pub(crate) fn prior_idt_vector_class(&self) -> Option<VectorClass> {
        self.idt_vectoring.vector.map(crate::injection::classify)
    }

    /// Whether the current guest interruptibility state (VMCS
    /// `GUEST_INTERRUPTIBILITY_INFO`) permits delivering `ty` right now.
    pub(crate) fn interruptibility_allows(&self, ty: InterruptType) -> bool {
        let state = self.vmcs.read(vmcs::guest::INTERRUPTIBILITY_STATE, Level::Merged);
        const BLOCK_BY_STI: u64 = 1 << 0;
        const BLOCK_BY_MOV_SS: u64 = 1 << 1;
        const BLOCK_BY_NMI: u64 = 1 << 3;
        if state & BLOCK_BY_MOV_SS != 0 {
            return false;
        }
        match ty {
            InterruptType::Nmi => state & BLOCK_BY_NMI == 0,
            InterruptType::External => {
                let rflags = self.vmcs.read(vmcs::guest::RFLAGS, Level::Merged);
                const IF: u64 = 1 << 9;
                rflags & IF != 0 && state & BLOCK_BY_STI == 0
            }
            _ => true,
        }
    }

    /// Whether the VM-exit just handled reports NMI unblocking due to IRET
    /// (IDT-vectoring-information field bit 12, valid per bit 31): the prior
    /// event being delivered was an IRET that itself faulted. Re-injecting
    /// that fault must re-arm NMI blocking on entry, or a second NMI could
    /// slip in before the guest's IRET actually retires (§4.J re-arm rule).
    pub(crate) fn nmi_unblocking_due_to_iret(&self) -> bool {
        const VALID: u64 = 1 << 31;
        const NMI_UNBLOCKING_DUE_TO_IRET: u64 = 1 << 12;
        let info = self.vmcs.read(vmcs::ro::IDT_VECTORING_INFO, Level::Merged);
        info & VALID != 0 && info & NMI_UNBLOCKING_DUE_TO_IRET != 0
    }

    /// Raises `EVENT_SET_CR2` before writing; a subscriber vetoing with
    /// `Handled::Stop` suppresses the write entirely (§9 Open Question:
    /// "first write wins" resolved as first-subscriber-veto-wins).
    pub(crate) fn set_cr2(&mut self, value: u64) {
        let event = SetCr2Event { guest_id: self.guest_id, value };
        if SET_CR2_BUS.lock().dispatch(&event) == Handled::Stop {
            return;
        }
        self.gp.cr2 = value;
    }

    /// Writes the VM-entry interruption-information field plus error-code
    /// and instruction-length fields (§4.J "on inject").
    pub(crate) fn write_entry_interruption(
        &mut self,
        vector: u8,
        ty: InterruptType,
        error_code: Option<u32>,
        instr_len: Option<u32>,
        nmi_unblocking_due_to_iret: bool,
    ) {
        let mut info: u32 = u32::from(vector);
        info |= (ty as u32) << 8;
        if error_code.is_some() {
            info |= 1 << 11;
        }
        if nmi_unblocking_due_to_iret {
            info |= 1 << 12;
        }
        info |= 1 << 31; // valid

        self.vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, u64::from(info), Level::Merged);
        if let Some(ec) = error_code {
            self.vmcs.write(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, u64::from(ec), Level::Merged);
        }
        if let Some(len) = instr_len {
            self.vmcs.write(vmcs::control::VMENTRY_INSTRUCTION_LEN, u64::from(len), Level::Merged);
        }
        self.idt_vectoring.vector = Some(vector);
    }

    /// Arms "exit-on-interrupt-unblock" via the accountant when injection
    /// was blocked (§4.J "when blocked").
    pub(crate) fn arm_injection_window(&mut self, ty: InterruptType) {
        match ty {
            InterruptType::Nmi => {
                const NMI_WINDOW_EXITING: u32 = 1 << 22;
                self.vmexit_setup.proc_based_primary.setup_only(NMI_WINDOW_EXITING, NMI_WINDOW_EXITING);
            }
            _ => {
                const INTERRUPT_WINDOW_EXITING: u32 = 1 << 2;
                self.vmexit_setup
                    .proc_based_primary
                    .setup_only(INTERRUPT_WINDOW_EXITING, INTERRUPT_WINDOW_EXITING);
            }
        }
    }

    /// Runs this vCPU once: VMLAUNCHes on its first entry, VMRESUMEs every
    /// time after, and records the reason on a synchronous VM-instruction
    /// failure (§4.G, §4.N).
    pub(crate) fn enter(&mut self) -> crate::error::MonResult<()> {
        let launched = self.vmcs.launched();
        // Safety: caller already made this vCPU's VMCS current via
        // `set_ptr`, and its host-state area is fully programmed.
        let result = unsafe { crate::vmentry::run(&mut self.gp, &mut self.xmm, launched) };
        if result.is_ok() {
            self.vmcs.set_launched();
        }
        self.vmcs.invalidate_cache();
        result
    }
}

/// Which general-purpose register a VMExit handler wants to read/write.
/// `Rsp` is proxied to the VMCS rather than the GP save area (§4.G).
#[derive(Clone, Copy, Debug)]
pub(crate) enum GpIndex {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_interrupt_bitmap_tracks_highest_vector() {
        let mut bitmap = PendingInterruptBitmap::default();
        bitmap.set(3);
        bitmap.set(200);
        bitmap.set(65);
        assert_eq!(bitmap.highest(), Some(200));
        bitmap.clear(200);
        assert_eq!(bitmap.highest(), Some(65));
        bitmap.clear(65);
        assert_eq!(bitmap.highest(), Some(3));
        bitmap.clear(3);
        assert_eq!(bitmap.highest(), None);
    }

    #[test]
    fn set_then_clear_same_vector_is_empty() {
        let mut bitmap = PendingInterruptBitmap::default();
        bitmap.set(42);
        bitmap.clear(42);
        assert_eq!(bitmap.highest(), None);
    }
}
