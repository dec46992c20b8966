//! The [`Guest`] type (§3 "Guest").

use crate::ept::Ept;
use crate::gcpu::Gcpu;
use crate::gpm::Gpm;
use crate::pci::PciBlockList;
use crate::vmexit::io::IoMonitor;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// One registered VMCALL handler (data model: "an intrusive list of
/// I/O-monitor and VMCALL registrations").
pub(crate) struct VmcallRegistration {
    pub(crate) leaf: u64,
    pub(crate) handler: fn(&mut Gcpu) -> u64,
}

/// A guest (§3): an identifier, a list of vCPUs, a GPM, CR0/CR4
/// write-handler registrations (tracked per-vCPU on [`Gcpu`] itself, since
/// the accountant and shadow state they interact with are per-vCPU), an EPT
/// policy word, an EPTP, and I/O-monitor / VMCALL registrations. Created
/// during early init and never destroyed.
pub(crate) struct Guest {
    pub(crate) id: u32,
    pub(crate) vcpus: Vec<Box<Gcpu>>,
    pub(crate) gpm: Gpm,
    pub(crate) ept: Ept,
    /// EPT policy flags this guest's EPT tree honors (e.g. whether
    /// execute-only leaves are permitted). Opaque to every module but the
    /// one that built the tree's attribute encoding.
    pub(crate) ept_policy: u64,
    pub(crate) io_monitor: IoMonitor,
    pub(crate) pci_block_list: PciBlockList,
    vmcalls: Vec<VmcallRegistration>,
}

impl Guest {
    pub(crate) fn create(id: u32, max_leaf_level: crate::mam::Level, supports_wb: bool, ept_policy: u64) -> Self {
        Self {
            id,
            vcpus: Vec::new(),
            gpm: Gpm::create(id),
            ept: Ept::create(max_leaf_level, supports_wb),
            ept_policy,
            io_monitor: IoMonitor::new(),
            pci_block_list: PciBlockList::new(),
            vmcalls: Vec::new(),
        }
    }

    pub(crate) fn add_vcpu(&mut self, gcpu: Box<Gcpu>) {
        self.vcpus.push(gcpu);
    }

    /// Installs a GPM mapping and mirrors it into this guest's EPT.
    ///
    /// `Gpm::set_mapping` also raises `EVENT_GPM_SET` for any other
    /// observer, but EPT mirroring happens directly here rather than through
    /// that bus: the only caller today (guest bring-up) runs inside the
    /// global-state lock before this guest is registered in
    /// `GlobalState::guests`, so a bus subscriber that needed to look this
    /// guest up globally would deadlock against its own caller.
    pub(crate) fn map(&self, gpa: u64, hpa: u64, size: u64, attr: u64) {
        self.gpm.set_mapping(gpa, hpa, size, attr);
        self.ept.set_mapping(gpa, hpa, size, attr);
    }

    pub(crate) fn vcpu_mut(&mut self, host_cpu_id: u32) -> Option<&mut Gcpu> {
        self.vcpus.iter_mut().map(Box::as_mut).find(|g| g.host_cpu_id == host_cpu_id)
    }

    pub(crate) fn register_vmcall(&mut self, leaf: u64, handler: fn(&mut Gcpu) -> u64) {
        self.vmcalls.push(VmcallRegistration { leaf, handler });
    }

    pub(crate) fn find_vmcall(&self, leaf: u64) -> Option<fn(&mut Gcpu) -> u64> {
        self.vmcalls.iter().find(|r| r.leaf == leaf).map(|r| r.handler)
    }

    /// `RAX=0x65707501, RDI=start, RSI=size, RDX=action, RCX=flush_all_cpus`
    /// (§6 "VMCALL convention for EPT-update").
    pub(crate) fn handle_ept_update_vmcall(&self, gcpu: &Gcpu) {
        const ADD: u64 = 0;
        const REMOVE: u64 = 1;
        let start = gcpu.gp.rdi;
        let size = gcpu.gp.rsi;
        match gcpu.gp.rdx {
            ADD => self.ept.set_mapping(start, start, size, 0b111),
            REMOVE => self.ept.remove_mapping(start, size),
            _ => {}
        }
    }
}

pub(crate) const EPT_UPDATE_VMCALL_LEAF: u64 = 0x6570_7501;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcall_registration_round_trips() {
        fn handler(_gcpu: &mut Gcpu) -> u64 {
            42
        }
        let mut guest = Guest::create(0, crate::mam::Level::L1, true, 0);
        guest.register_vmcall(EPT_UPDATE_VMCALL_LEAF, handler);
        let found = guest.find_vmcall(EPT_UPDATE_VMCALL_LEAF).expect("registered leaf must resolve");
        assert_eq!(found as usize, handler as usize);
        assert!(guest.find_vmcall(0xDEAD).is_none());
    }
}
