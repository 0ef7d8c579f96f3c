//! VMX execution controls and backend capabilities.
//!
//! Capabilities are queried once when a [`VirtualMachine`] is built and passed by reference to
//! every vCPU setup; nothing here is process-global.
//!
//! [`VirtualMachine`]: crate::VirtualMachine

/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROC_BASED_CTLS.
pub const IA32_VMX_PROC_BASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_PROC_BASED_CTLS2.
pub const IA32_VMX_PROC_BASED_CTLS2: u32 = 0x48B;

bitflags::bitflags! {
    /// Table 25-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// Non-maskable interrupts cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; NMI blocking becomes virtual.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in VMX non-root operation.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Table 25-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// A VM exit occurs at the beginning of any instruction if RFLAGS.IF = 1 and
        /// there are no other blocking of interrupts.
        const INTRWINEXIT = 1 << 2;
        /// RDTSC and friends return a value modified by the TSC offset field.
        const USETSCOFF = 1 << 3;
        /// Executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// Executions of INVLPG cause VM exits.
        const INVLPGEXIT = 1 << 9;
        /// Executions of MWAIT cause VM exits.
        const MWAITEXIT = 1 << 10;
        /// Executions of RDTSC and RDTSCP cause VM exits.
        const RDTSCEXIT = 1 << 12;
        /// Executions of MOV to CR3 cause VM exits.
        const CR3LOADEXIT = 1 << 15;
        /// Executions of MOV from CR3 cause VM exits.
        const CR3STOREXIT = 1 << 16;
        /// A VM exit occurs at the beginning of any instruction if there is no virtual NMI blocking.
        const NMIWINEXIT = 1 << 22;
        /// Every I/O instruction causes a VM exit.
        const UNCONDIOEXIT = 1 << 24;
        /// I/O bitmaps restrict which I/O instructions exit.
        const USEIOBMP = 1 << 25;
        /// The monitor trap flag debugging feature is enabled.
        const MTF = 1 << 27;
        /// MSR bitmaps restrict which RDMSR/WRMSR exit.
        const USEMSRBMP = 1 << 28;
        /// Executions of MONITOR cause VM exits.
        const MONITOREXIT = 1 << 29;
        /// Executions of PAUSE cause VM exits.
        const PAUSEEXIT = 1 << 30;
        /// The secondary processor-based VM-execution controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 25-7. Definitions of Secondary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// Accesses to the APIC-access page are virtualized.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Executions of LGDT, LIDT, LLDT, LTR, SGDT, SIDT, SLDT and STR cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// Executions of RDTSCP do not cause #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Cached translations of linear addresses are tagged with a VPID.
        const ENABLE_VPID = 1 << 5;
        /// Guest software may run in unpaged protected mode or in real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Table 25-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on VM entry.
        const LOAD_DEBUG_CTL = 1 << 2;
        /// The logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// IA32_PAT is loaded on VM entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on VM entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Table 25-13. Definitions of Primary VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on VM exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The logical processor is in 64-bit mode after the next VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// The processor acknowledges the interrupt controller on an external-interrupt exit.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// IA32_EFER is saved on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
    }
}

/// Allowed settings of one VM-execution control word.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Appendix A.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCapability {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

impl ControlCapability {
    /// Decode a capability MSR value: allowed-0 in bits 31:0, allowed-1 in bits 63:32.
    #[inline]
    pub const fn from_msr(v: u64) -> Self {
        Self {
            allowed0: v as u32,
            allowed1: (v >> 32) as u32,
        }
    }

    /// Control word that enables `desired` as far as supported, plus every mandatory bit.
    #[inline]
    pub const fn adjust(&self, desired: u32) -> u32 {
        (desired | self.allowed0) & self.allowed1
    }

    /// Whether every bit of `bits` may be set.
    #[inline]
    pub const fn supports(&self, bits: u32) -> bool {
        self.allowed1 & bits == bits
    }
}

/// VT-x capability MSRs exposed by a control-field capable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCapabilities {
    /// IA32_VMX_PINBASED_CTLS.
    pub pinbased: ControlCapability,
    /// IA32_VMX_PROC_BASED_CTLS.
    pub procbased: ControlCapability,
    /// IA32_VMX_PROC_BASED_CTLS2.
    pub procbased2: ControlCapability,
    /// IA32_VMX_EXIT_CTLS.
    pub exit: ControlCapability,
    /// IA32_VMX_ENTRY_CTLS.
    pub entry: ControlCapability,
    /// IA32_VMX_CR0_FIXED0.
    pub cr0_fixed0: u64,
    /// IA32_VMX_CR0_FIXED1.
    pub cr0_fixed1: u64,
    /// IA32_VMX_CR4_FIXED0.
    pub cr4_fixed0: u64,
    /// IA32_VMX_CR4_FIXED1.
    pub cr4_fixed1: u64,
}

impl VmxCapabilities {
    /// Build the capabilities from a reader of the capability MSRs.
    pub fn from_msrs<E>(mut read: impl FnMut(u32) -> Result<u64, E>) -> Result<Self, E> {
        Ok(Self {
            pinbased: ControlCapability::from_msr(read(IA32_VMX_PINBASED_CTLS)?),
            procbased: ControlCapability::from_msr(read(IA32_VMX_PROC_BASED_CTLS)?),
            procbased2: ControlCapability::from_msr(read(IA32_VMX_PROC_BASED_CTLS2)?),
            exit: ControlCapability::from_msr(read(IA32_VMX_EXIT_CTLS)?),
            entry: ControlCapability::from_msr(read(IA32_VMX_ENTRY_CTLS)?),
            cr0_fixed0: read(IA32_VMX_CR0_FIXED0)?,
            cr0_fixed1: read(IA32_VMX_CR0_FIXED1)?,
            cr4_fixed0: read(IA32_VMX_CR4_FIXED0)?,
            cr4_fixed1: read(IA32_VMX_CR4_FIXED1)?,
        })
    }

    /// Whether the processor can run the guest in real mode without paging.
    #[inline]
    pub fn unrestricted_guest(&self) -> bool {
        self.procbased.supports(VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits())
            && self
                .procbased2
                .supports(VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST.bits())
    }
}

/// What a hypervisor backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum number of vCPUs per VM.
    pub max_vcpus: usize,
    /// Whether `protect_memory` is available, which dirty-page tracking needs.
    pub memory_protection: bool,
    /// VT-x control capabilities, when the backend exposes control fields.
    pub vmx: Option<VmxCapabilities>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_vcpus: 1,
            memory_protection: false,
            vmx: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_forces_mandatory_bits_and_drops_unsupported_ones() {
        // allowed0 = 0x16, allowed1 = 0xff
        let cap = ControlCapability::from_msr(0x0000_00ff_0000_0016);
        assert_eq!(cap.adjust(0x101), 0x17);
        assert!(cap.supports(0x80));
        assert!(!cap.supports(0x100));
    }

    #[test]
    fn unrestricted_guest_needs_both_controls() {
        let none = ControlCapability::from_msr(0);
        let all = ControlCapability::from_msr(0xffff_ffff_0000_0000);
        let mut caps = VmxCapabilities::from_msrs::<()>(|_| Ok(0)).unwrap();
        assert!(!caps.unrestricted_guest());
        caps.procbased = all;
        caps.procbased2 = none;
        assert!(!caps.unrestricted_guest());
        caps.procbased2 = all;
        assert!(caps.unrestricted_guest());
    }
}
