//! Virtual-Machine Control Structure (VMCS) fields and exit-record decoding.
//!
//! The monitor never executes VMREAD/VMWRITE itself; a control-field capable backend exposes them
//! through [`VcpuBackend::read_field`] and [`VcpuBackend::write_field`]. This module names the
//! fields it needs and decodes the values read from them.
//!
//! [`VcpuBackend::read_field`]: crate::backend::VcpuBackend::read_field
//! [`VcpuBackend::write_field`]: crate::backend::VcpuBackend::write_field
use crate::{
    backend::{BackendError, VcpuBackend},
    registers::{Register, Registers, Segment},
    vm_control::Capabilities,
    x86::{AccessRights, Cr0, Efer, Rflags, SegmentIndex},
    VmmError,
};
use num_enum::TryFromPrimitive;

/// VMCS field encodings.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Appendix B. FIELD
/// ENCODING IN VMCS.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash)]
#[repr(u32)]
pub enum Field {
    // 64-bit guest-state fields.
    /// VMCS link pointer.
    GuestLinkPointer = 0x2800,
    /// Guest IA32_EFER.
    GuestIa32Efer = 0x2806,

    // 64-bit read-only data fields.
    /// Guest-physical address.
    GuestPhysicalAddr = 0x2400,

    // 32-bit control fields.
    /// Pin-based VM-execution controls.
    PinBasedExecControls = 0x4000,
    /// Primary processor-based VM-execution controls.
    ProcessorBasedVmexecControls = 0x4002,
    /// Exception bitmap.
    ExceptionBitmap = 0x4004,
    /// VM-exit controls.
    VmexitControls = 0x400C,
    /// VM-entry controls.
    VmentryControls = 0x4012,
    /// VM-entry interruption-information field.
    VmentryInterruptionInfo = 0x4016,
    /// VM-entry exception error code.
    VmentryExceptionErrCode = 0x4018,
    /// VM-entry instruction length.
    VmentryInstructionLength = 0x401A,
    /// Secondary processor-based VM-execution controls.
    SecondaryVmexecControls = 0x401E,

    // 32-bit read-only data fields.
    /// VM-instruction error.
    InstructionError = 0x4400,
    /// Exit reason.
    VmexitReason = 0x4402,
    /// VM-exit interruption information.
    VmexitInterruptionInfo = 0x4404,
    /// VM-exit interruption error code.
    VmexitInterruptionErrCode = 0x4406,
    /// VM-exit instruction length.
    VmexitInstructionLength = 0x440C,
    /// VM-exit instruction information.
    VmexitInstructionInfo = 0x440E,

    // 32-bit guest-state fields.
    /// Guest interruptibility state.
    GuestInterruptibilityState = 0x4824,
    /// Guest activity state.
    GuestActivityState = 0x4826,

    // Natural-width read-only data fields.
    /// Exit qualification.
    VmexitQualification = 0x6400,
    /// Guest-linear address.
    GuestLinearAddr = 0x640A,
}

/// Raw values of the exit-information fields after one VM-exit.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 25.9 VM-EXIT INFORMATION
/// FIELDS.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitRecord {
    pub reason: u32,
    pub qualification: u64,
    pub interruption_info: u32,
    pub interruption_error_code: u32,
    pub instruction_length: u32,
    pub instruction_info: u32,
    pub guest_physical_address: u64,
    pub guest_linear_address: u64,
}

impl VmxExitRecord {
    /// Read every exit-information field of `vcpu`.
    pub fn capture<V: VcpuBackend + ?Sized>(vcpu: &mut V) -> Result<Self, BackendError> {
        Ok(Self {
            reason: vcpu.read_field(Field::VmexitReason)? as u32,
            qualification: vcpu.read_field(Field::VmexitQualification)?,
            interruption_info: vcpu.read_field(Field::VmexitInterruptionInfo)? as u32,
            interruption_error_code: vcpu.read_field(Field::VmexitInterruptionErrCode)? as u32,
            instruction_length: vcpu.read_field(Field::VmexitInstructionLength)? as u32,
            instruction_info: vcpu.read_field(Field::VmexitInstructionInfo)? as u32,
            guest_physical_address: vcpu.read_field(Field::GuestPhysicalAddr)?,
            guest_linear_address: vcpu.read_field(Field::GuestLinearAddr)?,
        })
    }

    /// Decoded exit reason.
    #[inline]
    pub fn exit_reason(&self) -> ExitReason {
        ExitReason::from_raw(self.reason)
    }
}

/// Basic exit reasons handled by the monitor.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Appendix C. VMX BASIC EXIT
/// REASONS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0x0,
    ExternalInt = 0x1,
    TripleFault = 0x2,
    InterruptWindow = 0x7,
    Cpuid = 0xA,
    Hlt = 0xC,
    Vmcall = 0x12,
    IoInstruction = 0x1E,
    Rdmsr = 0x1F,
    Wrmsr = 0x20,
    EntfailGuestState = 0x21,
    EntfailMsrLoading = 0x22,
    EntfailMachineChk = 0x29,
    EptViolation = 0x30,
    EptMisconfig = 0x31,
}

/// Decoded exit reason field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReason {
    /// Bits 15:0.
    pub basic: u16,
    /// Bit 31: the VM-entry itself failed.
    pub entry_failure: bool,
}

impl ExitReason {
    /// Decode a raw exit reason value.
    #[inline]
    pub const fn from_raw(v: u32) -> Self {
        Self {
            basic: v as u16,
            entry_failure: v & (1 << 31) != 0,
        }
    }

    /// The basic reason, if the monitor has a case for it.
    #[inline]
    pub fn basic_reason(&self) -> Option<BasicExitReason> {
        BasicExitReason::try_from(self.basic).ok()
    }
}

bitflags::bitflags! {
    /// Exit qualification of an EPT violation.
    ///
    /// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 28-7. Exit
    /// Qualification for EPT Violations.
    pub struct EptViolationQualification: u64 {
        /// The access causing the violation was a data read.
        const READ = 1 << 0;
        /// The access causing the violation was a data write.
        const WRITE = 1 << 1;
        /// The access causing the violation was an instruction fetch.
        const FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writable.
        const WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const GLA_VALID = 1 << 7;
        /// The access was to the translated linear address, not to a paging structure.
        const GLA_TRANSLATED = 1 << 8;
        /// NMI unblocking due to IRET.
        const NMI_UNBLOCKING = 1 << 12;
    }
}

/// Exit qualification of an I/O instruction.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 28-5. Exit
/// Qualification for I/O Instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQualification {
    /// Access size in bytes: 1, 2 or 4.
    pub size: u8,
    /// IN or INS.
    pub is_in: bool,
    /// INS or OUTS.
    pub string: bool,
    /// REP prefixed.
    pub rep: bool,
    /// The port was an immediate operand.
    pub immediate: bool,
    pub port: u16,
}

impl From<u64> for IoQualification {
    fn from(v: u64) -> Self {
        Self {
            size: (v & 0b111) as u8 + 1,
            is_in: v & (1 << 3) != 0,
            string: v & (1 << 4) != 0,
            rep: v & (1 << 5) != 0,
            immediate: v & (1 << 6) != 0,
            port: (v >> 16) as u16,
        }
    }
}

/// VM-exit instruction information of INS and OUTS.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 28-8. Format of the
/// VM-Exit Instruction-Information Field as Used for INS and OUTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringIoInfo {
    /// Address size in bytes: 2, 4 or 8.
    pub address_size: u8,
    /// Segment of the source operand. Meaningless for INS, which always writes to ES.
    pub segment: Segment,
}

impl StringIoInfo {
    /// Decode the instruction-information field. `None` on a reserved address size or segment.
    pub fn decode(v: u32) -> Option<Self> {
        let address_size = match (v >> 7) & 0b111 {
            0 => 2,
            1 => 4,
            2 => 8,
            _ => return None,
        };
        let segment = SegmentIndex::try_from(((v >> 15) & 0b111) as u8).ok()?;
        Some(Self {
            address_size,
            segment: segment.into(),
        })
    }

    /// Mask selecting the bits an index register uses at this address size.
    #[inline]
    pub const fn address_mask(&self) -> u64 {
        match self.address_size {
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => u64::MAX,
        }
    }
}

/// Interruption type of an interruption-information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum InterruptionType {
    ExternalInt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivSoftwareException = 5,
    SoftwareException = 6,
}

/// VM-exit or VM-entry interruption information.
///
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 25-17. Format of the
/// VM-Exit Interruption-Information Field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionInfo {
    pub vector: u8,
    pub interruption_type: InterruptionType,
    pub error_code_valid: bool,
}

impl InterruptionInfo {
    const VALID: u32 = 1 << 31;

    /// Decode a raw field; `None` if the valid bit is clear or the type is reserved.
    pub fn decode(v: u32) -> Option<Self> {
        if v & Self::VALID == 0 {
            return None;
        }
        Some(Self {
            vector: v as u8,
            interruption_type: InterruptionType::try_from(((v >> 8) & 0b111) as u8).ok()?,
            error_code_valid: v & (1 << 11) != 0,
        })
    }

    /// Encode as a valid field value.
    #[inline]
    pub const fn encode(&self) -> u32 {
        self.vector as u32
            | (self.interruption_type as u32) << 8
            | (self.error_code_valid as u32) << 11
            | Self::VALID
    }
}

type GuestStateCheck = fn(&Registers, &Capabilities) -> Result<bool, VmmError>;

// A subset of "26.3.1 Checks on the Guest State Area" that a freshly initialized guest can fail.
const GUEST_STATE_CHECKS: &[(&str, GuestStateCheck)] = &[
    ("RFLAGS reserved bits must be clear and bit 1 set", |r, _| {
        let raw = r.get(Register::Rflags)?;
        Ok(raw & Rflags::RESERVED == 0 && raw & Rflags::_1.bits() != 0)
    }),
    ("CR0.PG requires CR0.PE", |r, _| {
        let cr0 = r.cr0()?;
        Ok(!cr0.contains(Cr0::PG) || cr0.contains(Cr0::PE))
    }),
    ("CR0 violates the VMX fixed bits", |r, caps| {
        let Some(vmx) = caps.vmx else {
            return Ok(true);
        };
        let cr0 = r.get(Register::Cr0)?;
        let mut fixed0 = vmx.cr0_fixed0;
        if vmx.unrestricted_guest() {
            fixed0 &= !(Cr0::PE | Cr0::PG).bits();
        }
        Ok(cr0 & fixed0 == fixed0 && cr0 & !vmx.cr0_fixed1 == 0)
    }),
    ("CR4 violates the VMX fixed bits", |r, caps| {
        let Some(vmx) = caps.vmx else {
            return Ok(true);
        };
        let cr4 = r.get(Register::Cr4)?;
        Ok(cr4 & vmx.cr4_fixed0 == vmx.cr4_fixed0 && cr4 & !vmx.cr4_fixed1 == 0)
    }),
    ("IA32_EFER.LMA must equal IA32_EFER.LME while paging", |r, _| {
        let efer = r.efer()?;
        Ok(!r.cr0()?.contains(Cr0::PG)
            || efer.contains(Efer::LMA) == efer.contains(Efer::LME))
    }),
    ("CS must be a present code segment", |r, _| {
        let ar = r.segment(Segment::Cs)?.access_rights;
        Ok(ar.contains(AccessRights::P | AccessRights::S)
            && !ar.contains(AccessRights::UNUSABLE)
            && (ar.contains(AccessRights::CODE) || r.is_real_mode()?))
    }),
    ("TR must be a present busy TSS", |r, _| {
        let ar = r.segment(Segment::Tr)?.access_rights;
        Ok(ar.contains(AccessRights::P)
            && !ar.contains(AccessRights::UNUSABLE | AccessRights::S)
            && matches!(ar.segment_type(), 3 | 11))
    }),
    ("LDTR must be unusable or a present LDT", |r, _| {
        let ar = r.segment(Segment::Ldtr)?.access_rights;
        Ok(ar.contains(AccessRights::UNUSABLE)
            || (ar.contains(AccessRights::P)
                && !ar.contains(AccessRights::S)
                && ar.segment_type() == 2))
    }),
    ("RIP must fit in 32 bits outside of 64-bit mode", |r, _| {
        let long = r.efer()?.contains(Efer::LMA)
            && r.segment(Segment::Cs)?.access_rights.contains(AccessRights::L);
        Ok(long || r.rip()? >> 32 == 0)
    }),
];

/// Check `regs` against the guest-state rules a VM-entry enforces.
///
/// Every register must have been fetched.
pub fn validate_guest_state(regs: &Registers, caps: &Capabilities) -> Result<(), VmmError> {
    for (what, check) in GUEST_STATE_CHECKS {
        if !check(regs, caps)? {
            tracing::warn!(?regs, "guest state rejected: {what}");
            return Err(VmmError::InvalidGuestState(what));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_qualification_decodes_every_field() {
        // rep outsw to port 0x3f8 (dx)
        let q = IoQualification::from(0x03f8_0031);
        assert_eq!(
            q,
            IoQualification {
                size: 2,
                is_in: false,
                string: true,
                rep: true,
                immediate: false,
                port: 0x3f8,
            }
        );
        let q = IoQualification::from(0x0060_0048);
        assert!(q.is_in && q.immediate && !q.string);
        assert_eq!((q.size, q.port), (1, 0x60));
    }

    #[test]
    fn string_io_info() {
        // 32-bit addressing, DS.
        let info = StringIoInfo::decode(1 << 7 | 3 << 15).unwrap();
        assert_eq!(info.address_size, 4);
        assert_eq!(info.segment, Segment::Ds);
        assert_eq!(info.address_mask(), 0xffff_ffff);
        assert!(StringIoInfo::decode(3 << 7).is_none());
        assert!(StringIoInfo::decode(7 << 15).is_none());
    }

    #[test]
    fn interruption_info_round_trips_and_rejects_invalid() {
        let info = InterruptionInfo {
            vector: crate::x86::vector::GP,
            interruption_type: InterruptionType::HardwareException,
            error_code_valid: true,
        };
        assert_eq!(info.encode(), 0x8000_0b0d);
        assert_eq!(InterruptionInfo::decode(info.encode()), Some(info));
        assert_eq!(InterruptionInfo::decode(0x0000_0b0d), None);
    }

    #[test]
    fn exit_reason_flags_entry_failure() {
        let r = ExitReason::from_raw(0x8000_0021);
        assert!(r.entry_failure);
        assert_eq!(r.basic_reason(), Some(BasicExitReason::EntfailGuestState));
        assert_eq!(ExitReason::from_raw(0x3f).basic_reason(), None);
    }
}
