//! Portable VM-exits and the classifier producing them.
//!
//! [`classify`] turns one raw exit into either a [`VmExit`] for the caller's handler, an MMIO
//! access for the instruction emulator, or nothing at all when the exit was bookkeeping the
//! monitor resolved by itself (a first write to a clean page, a spurious fault, an exhausted
//! `REP` count).
use crate::{
    backend::{DecodedExit, MemoryPermissions, RawExit, VcpuBackend},
    memory::{Gpa, MemoryRegionTable},
    probe::Probe,
    registers::{RegisterCache, RegisterSet, Segment},
    vmcs::{
        BasicExitReason, EptViolationQualification, InterruptionInfo, InterruptionType,
        IoQualification, StringIoInfo, VmxExitRecord,
    },
    x86::Rflags,
    VmmError,
};

/// Width of a port or MMIO read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRead {
    Byte,
    Word,
    Dword,
    Qword,
}

impl DataRead {
    /// The width of `bytes` bytes.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        Some(match bytes {
            1 => Self::Byte,
            2 => Self::Word,
            4 => Self::Dword,
            8 => Self::Qword,
            _ => return None,
        })
    }

    /// Size in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
}

/// Data of a port or MMIO access, tagged with its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWrite {
    Byte(u8),
    Word(u16),
    Dword(u32),
    Qword(u64),
}

impl DataWrite {
    /// The low `width` bytes of `value`.
    #[inline]
    pub const fn new(width: DataRead, value: u64) -> Self {
        match width {
            DataRead::Byte => Self::Byte(value as u8),
            DataRead::Word => Self::Word(value as u16),
            DataRead::Dword => Self::Dword(value as u32),
            DataRead::Qword => Self::Qword(value),
        }
    }

    /// Little-endian decode of `bytes`, which must be 1, 2, 4 or 8 bytes long.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let width = DataRead::from_bytes(bytes.len() as u64)?;
        let mut raw = [0; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(Self::new(width, u64::from_le_bytes(raw)))
    }

    /// The width of this value.
    #[inline]
    pub const fn width(&self) -> DataRead {
        match self {
            Self::Byte(_) => DataRead::Byte,
            Self::Word(_) => DataRead::Word,
            Self::Dword(_) => DataRead::Dword,
            Self::Qword(_) => DataRead::Qword,
        }
    }

    /// The value, zero extended.
    #[inline]
    pub const fn value(&self) -> u64 {
        match *self {
            Self::Byte(v) => v as u64,
            Self::Word(v) => v as u64,
            Self::Dword(v) => v as u64,
            Self::Qword(v) => v,
        }
    }

    /// Little-endian bytes, `width().bytes()` long.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.value().to_le_bytes()[..self.width().bytes()].to_vec()
    }
}

/// Kind of a guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    Read,
    Write,
    Execute,
}

impl MemoryAccess {
    /// The permission this access needs.
    pub const fn required(self) -> MemoryPermissions {
        match self {
            Self::Read => MemoryPermissions::READ,
            Self::Write => MemoryPermissions::WRITE,
            Self::Execute => MemoryPermissions::EXECUTE,
        }
    }
}

/// Why a VM-entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFailure {
    /// Basic exit reason, or the platform's failure code.
    pub reason: u64,
    /// Exit qualification, zero when not reported.
    pub qualification: u64,
}

/// Why a vCPU stopped, in terms the device model understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    /// An exit the monitor has no portable description for. The classifier never hands these
    /// to a handler; unrecognized codes stop the vCPU with [`VmmError::UnsupportedExit`].
    Unknown(u32),
    /// A guest exception intercepted through the exception bitmap.
    Exception { vector: u8, error_code: Option<u32> },
    /// Port input. Answer with [`VcpuContext::set_in`]; unanswered reads return all ones.
    ///
    /// [`VcpuContext::set_in`]: crate::vcpu::VcpuContext::set_in
    IoIn { port: u16, width: DataRead },
    /// Port output.
    IoOut { port: u16, data: DataWrite },
    /// Load from an address outside guest RAM. Answer with [`VcpuContext::set_in`].
    ///
    /// [`VcpuContext::set_in`]: crate::vcpu::VcpuContext::set_in
    MmioRead { gpa: Gpa, width: DataRead },
    /// Store to an address outside guest RAM.
    MmioWrite { gpa: Gpa, data: DataWrite },
    /// HLT with nothing to deliver.
    Halt,
    /// The guest shut down, e.g. on a triple fault.
    Shutdown,
    /// The VM-entry failed.
    EntryFailed(EntryFailure),
    /// The host interrupted the run.
    Interrupt,
    /// A guest access the memory map does not allow.
    MemoryViolation {
        access: MemoryAccess,
        perms: MemoryPermissions,
        gpa: Gpa,
        gla: Option<u64>,
    },
    /// The guest can take an interrupt and none is pending.
    IrqWindowOpen,
    /// A platform-specific system event.
    SystemEvent { kind: u32 },
    /// CPUID; RIP is already past the instruction. Write the results into RAX-RDX.
    Cpuid { leaf: u32, subleaf: u32 },
    /// RDMSR; RIP is already past the instruction. Write the result into EDX:EAX.
    Rdmsr { msr: u32 },
    /// WRMSR; RIP is already past the instruction.
    Wrmsr { msr: u32, value: u64 },
    /// VMCALL; RIP is already past the instruction.
    Hypercall { nr: u64 },
}

/// Where the answer to an input exit goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRead {
    /// Into AL, AX or EAX.
    Accumulator(DataRead),
    /// Into guest memory, for INS.
    Memory { gpa: Gpa, width: DataRead },
    /// Back to a decoding backend.
    Backend(DataRead),
}

impl PendingRead {
    pub(crate) fn width(&self) -> DataRead {
        match *self {
            Self::Accumulator(w) | Self::Memory { width: w, .. } | Self::Backend(w) => w,
        }
    }
}

/// Internally resolved exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// First guest write to a clean page.
    DirtyPage(Gpa),
    /// A fault on an access the memory map allows.
    Spurious(Gpa),
    /// `REP` string I/O with a zero count.
    EmptyRep,
}

/// Result of classifying one raw exit.
#[derive(Debug)]
pub(crate) enum Classified {
    /// Hand `exit` to the caller; `pending` is where an input value goes.
    Exit {
        exit: VmExit,
        pending: Option<PendingRead>,
    },
    /// An access outside guest RAM, to complete with the instruction emulator.
    Mmio {
        gpa: Gpa,
        gla: Option<u64>,
        access: MemoryAccess,
    },
    /// Nothing for the caller to do.
    Resolved(Resolution),
}

impl Classified {
    fn exit(exit: VmExit) -> Self {
        Self::Exit {
            exit,
            pending: None,
        }
    }
}

/// Classify one raw exit.
///
/// Instruction exits the monitor completes (HLT, CPUID, MSR accesses, port I/O, VMCALL) leave RIP
/// past the instruction in `regs`. Exit reasons without a case are an error.
pub(crate) fn classify<V: VcpuBackend>(
    raw: RawExit,
    regs: &mut RegisterCache<V>,
    memory: &MemoryRegionTable,
) -> Result<Classified, VmmError> {
    match raw {
        RawExit::Vmx(record) => classify_vmx(record, regs, memory),
        RawExit::Decoded(exit) => classify_decoded(exit),
    }
}

fn classify_decoded(exit: DecodedExit) -> Result<Classified, VmmError> {
    Ok(match exit {
        DecodedExit::IoIn { port, width } => Classified::Exit {
            exit: VmExit::IoIn { port, width },
            pending: Some(PendingRead::Backend(width)),
        },
        DecodedExit::IoOut { port, data } => Classified::exit(VmExit::IoOut { port, data }),
        DecodedExit::MmioRead { gpa, width } => Classified::Exit {
            exit: VmExit::MmioRead { gpa, width },
            pending: Some(PendingRead::Backend(width)),
        },
        DecodedExit::MmioWrite { gpa, data } => Classified::exit(VmExit::MmioWrite { gpa, data }),
        DecodedExit::Hlt => Classified::exit(VmExit::Halt),
        DecodedExit::Shutdown => Classified::exit(VmExit::Shutdown),
        DecodedExit::FailEntry { reason } => Classified::exit(VmExit::EntryFailed(EntryFailure {
            reason,
            qualification: 0,
        })),
        DecodedExit::Interrupted => Classified::exit(VmExit::Interrupt),
        DecodedExit::IrqWindowOpen => Classified::exit(VmExit::IrqWindowOpen),
        DecodedExit::SystemEvent { kind } => Classified::exit(VmExit::SystemEvent { kind }),
        DecodedExit::Exception { vector, error_code } => {
            Classified::exit(VmExit::Exception { vector, error_code })
        }
        DecodedExit::Unknown(code) => return Err(VmmError::UnsupportedExit(code)),
    })
}

fn classify_vmx<V: VcpuBackend>(
    record: VmxExitRecord,
    regs: &mut RegisterCache<V>,
    memory: &MemoryRegionTable,
) -> Result<Classified, VmmError> {
    let reason = record.exit_reason();
    if reason.entry_failure {
        return Ok(Classified::exit(VmExit::EntryFailed(EntryFailure {
            reason: reason.basic as u64,
            qualification: record.qualification,
        })));
    }
    let basic = reason
        .basic_reason()
        .ok_or(VmmError::UnsupportedExit(record.reason))?;
    let len = record.instruction_length as u64;
    Ok(match basic {
        BasicExitReason::ExceptionOrNmi => {
            let info = InterruptionInfo::decode(record.interruption_info)
                .ok_or(VmmError::UnsupportedExit(record.reason))?;
            Classified::exit(VmExit::Exception {
                vector: info.vector,
                error_code: info
                    .error_code_valid
                    .then_some(record.interruption_error_code),
            })
        }
        BasicExitReason::ExternalInt => Classified::exit(VmExit::Interrupt),
        BasicExitReason::TripleFault => Classified::exit(VmExit::Shutdown),
        BasicExitReason::InterruptWindow => Classified::exit(VmExit::IrqWindowOpen),
        BasicExitReason::Hlt => {
            regs.advance_rip(len)?;
            Classified::exit(VmExit::Halt)
        }
        BasicExitReason::Cpuid => {
            let r = regs.fetch(RegisterSet::RAX | RegisterSet::RCX)?;
            let exit = VmExit::Cpuid {
                leaf: r.eax()? as u32,
                subleaf: r.ecx()? as u32,
            };
            regs.advance_rip(len)?;
            Classified::exit(exit)
        }
        BasicExitReason::Rdmsr => {
            let msr = regs.fetch(RegisterSet::RCX)?.ecx()? as u32;
            regs.advance_rip(len)?;
            Classified::exit(VmExit::Rdmsr { msr })
        }
        BasicExitReason::Wrmsr => {
            let r = regs.fetch(RegisterSet::RAX | RegisterSet::RCX | RegisterSet::RDX)?;
            let exit = VmExit::Wrmsr {
                msr: r.ecx()? as u32,
                value: r.edx()? << 32 | r.eax()?,
            };
            regs.advance_rip(len)?;
            Classified::exit(exit)
        }
        BasicExitReason::Vmcall => {
            let nr = regs.fetch(RegisterSet::RAX)?.rax()?;
            regs.advance_rip(len)?;
            Classified::exit(VmExit::Hypercall { nr })
        }
        BasicExitReason::IoInstruction => classify_io(&record, regs, memory)?,
        BasicExitReason::EptViolation => classify_ept_violation(&record, memory)?,
        // A misconfigured entry is never guest RAM; let the emulator sort out the access.
        BasicExitReason::EptMisconfig => Classified::Mmio {
            gpa: Gpa::new(record.guest_physical_address),
            gla: None,
            access: MemoryAccess::Read,
        },
        BasicExitReason::EntfailGuestState
        | BasicExitReason::EntfailMsrLoading
        | BasicExitReason::EntfailMachineChk => {
            Classified::exit(VmExit::EntryFailed(EntryFailure {
                reason: reason.basic as u64,
                qualification: record.qualification,
            }))
        }
    })
}

fn classify_io<V: VcpuBackend>(
    record: &VmxExitRecord,
    regs: &mut RegisterCache<V>,
    memory: &MemoryRegionTable,
) -> Result<Classified, VmmError> {
    let q = IoQualification::from(record.qualification);
    let width = DataRead::from_bytes(q.size as u64).ok_or(VmmError::UnsupportedExit(record.reason))?;
    let len = record.instruction_length as u64;

    if !q.string {
        let classified = if q.is_in {
            Classified::Exit {
                exit: VmExit::IoIn {
                    port: q.port,
                    width,
                },
                pending: Some(PendingRead::Accumulator(width)),
            }
        } else {
            let rax = regs.fetch(RegisterSet::RAX)?.rax()?;
            Classified::exit(VmExit::IoOut {
                port: q.port,
                data: DataWrite::new(width, rax),
            })
        };
        regs.advance_rip(len)?;
        return Ok(classified);
    }

    // INS and OUTS.
    let info = StringIoInfo::decode(record.instruction_info)
        .ok_or(VmmError::UnsupportedExit(record.reason))?;
    let mask = info.address_mask();
    let r = regs.fetch(
        RegisterSet::RFLAGS
            | RegisterSet::RCX
            | RegisterSet::RSI
            | RegisterSet::RDI
            | RegisterSet::CR0
            | RegisterSet::CS
            | RegisterSet::DS
            | RegisterSet::ES
            | RegisterSet::FS
            | RegisterSet::GS
            | RegisterSet::SS,
    )?;
    let rcx = r.rcx()?;
    if q.rep && rcx & mask == 0 {
        regs.advance_rip(len)?;
        return Ok(Classified::Resolved(Resolution::EmptyRep));
    }

    let step = width.bytes() as u64;
    let backwards = r.rflags()?.contains(Rflags::DF);
    let (segment, index) = if q.is_in {
        (Segment::Es, r.rdi()?)
    } else {
        (info.segment, r.rsi()?)
    };
    let gpa = memory.gva2gpa(r, segment, index & mask)?;
    let classified = if q.is_in {
        Classified::Exit {
            exit: VmExit::IoIn {
                port: q.port,
                width,
            },
            pending: Some(PendingRead::Memory { gpa, width }),
        }
    } else {
        let mut bytes = vec![0; width.bytes()];
        memory.read_guest(gpa, &mut bytes)?;
        let data = DataWrite::from_le_bytes(&bytes).ok_or(VmmError::UnsupportedExit(record.reason))?;
        Classified::exit(VmExit::IoOut { port: q.port, data })
    };

    let moved = if backwards {
        index.wrapping_sub(step)
    } else {
        index.wrapping_add(step)
    };
    let index = (index & !mask) | (moved & mask);
    if q.is_in {
        regs.set_rdi(index)?;
    } else {
        regs.set_rsi(index)?;
    }
    // A REP instruction is re-executed until its count runs out.
    let done = if q.rep {
        let count = (rcx & mask).wrapping_sub(1) & mask;
        regs.set_rcx((rcx & !mask) | count)?;
        count == 0
    } else {
        true
    };
    if done {
        regs.advance_rip(len)?;
    }
    Ok(classified)
}

fn classify_ept_violation(
    record: &VmxExitRecord,
    memory: &MemoryRegionTable,
) -> Result<Classified, VmmError> {
    let q = EptViolationQualification::from_bits_truncate(record.qualification);
    let access = if q.contains(EptViolationQualification::WRITE) {
        MemoryAccess::Write
    } else if q.contains(EptViolationQualification::FETCH) {
        MemoryAccess::Execute
    } else {
        MemoryAccess::Read
    };
    let gpa = Gpa::new(record.guest_physical_address);
    let gla = q
        .contains(EptViolationQualification::GLA_VALID)
        .then_some(record.guest_linear_address);

    let Some(region) = memory.find(gpa) else {
        return Ok(Classified::Mmio { gpa, gla, access });
    };
    let perms = region.permissions(gpa).unwrap_or(MemoryPermissions::empty());
    if !perms.contains(access.required()) {
        return Ok(Classified::exit(VmExit::MemoryViolation {
            access,
            perms,
            gpa,
            gla,
        }));
    }
    Ok(match access {
        MemoryAccess::Write if region.mark_dirty(gpa)? => {
            Classified::Resolved(Resolution::DirtyPage(gpa.page_down()))
        }
        _ => Classified::Resolved(Resolution::Spurious(gpa)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockHypervisor, MockVcpu};
    use crate::backend::HypervisorBackend;
    use crate::registers::SegmentRegister;
    use crate::vmcs::BasicExitReason as R;
    use crate::x86::{AccessRights, Cr0};
    use std::sync::Arc;

    struct Fixture {
        hv: Arc<MockHypervisor>,
        regs: RegisterCache<MockVcpu>,
        memory: MemoryRegionTable,
    }

    fn fixture() -> Fixture {
        let hv = Arc::new(MockHypervisor::new());
        let mut regs = RegisterCache::new(hv.create_vcpu().unwrap());
        regs.set_cr0(Cr0::ET | Cr0::NE).unwrap();
        regs.set_rflags(Rflags::_1).unwrap();
        regs.set_rip(0x100).unwrap();
        for seg in [Segment::Cs, Segment::Ds, Segment::Es, Segment::Fs, Segment::Gs, Segment::Ss] {
            regs.set_segment(seg, SegmentRegister::real_mode(0, AccessRights::P | AccessRights::S))
                .unwrap();
        }
        let memory = MemoryRegionTable::new(hv.clone(), true);
        Fixture { hv, regs, memory }
    }

    fn vmx(reason: BasicExitReason, qualification: u64) -> RawExit {
        RawExit::Vmx(VmxExitRecord {
            reason: reason as u32,
            qualification,
            instruction_length: 1,
            ..Default::default()
        })
    }

    #[test]
    fn in_al_advances_rip_and_expects_accumulator() {
        let mut f = fixture();
        let c = classify(vmx(R::IoInstruction, 0x0060_0048), &mut f.regs, &f.memory).unwrap();
        match c {
            Classified::Exit { exit, pending } => {
                assert_eq!(
                    exit,
                    VmExit::IoIn {
                        port: 0x60,
                        width: DataRead::Byte
                    }
                );
                assert_eq!(pending, Some(PendingRead::Accumulator(DataRead::Byte)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.regs.rip().unwrap(), 0x101);
    }

    #[test]
    fn out_dx_ax_reads_the_accumulator() {
        let mut f = fixture();
        f.regs.set_rax(0xffff_1234).unwrap();
        let c = classify(vmx(R::IoInstruction, 0x03f8_0001), &mut f.regs, &f.memory).unwrap();
        assert!(matches!(
            c,
            Classified::Exit {
                exit: VmExit::IoOut {
                    port: 0x3f8,
                    data: DataWrite::Word(0x1234)
                },
                pending: None
            }
        ));
    }

    #[test]
    fn rep_outsb_walks_si_and_counts_down() {
        let mut f = fixture();
        let region = f.memory.add(Gpa::new(0x1000), 0x1000, false).unwrap();
        region.load_binary(b"hi", 0x10).unwrap();
        f.regs.set_rsi(0x1010).unwrap();
        f.regs.set_rdi(0).unwrap();
        f.regs.set_rcx(2).unwrap();
        // rep outsb, 16-bit addressing, DS.
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::IoInstruction as u32,
            qualification: 0x03f8_0030,
            instruction_length: 2,
            instruction_info: 3 << 15,
            ..Default::default()
        });
        let c = classify(raw.clone(), &mut f.regs, &f.memory).unwrap();
        assert!(matches!(
            c,
            Classified::Exit {
                exit: VmExit::IoOut {
                    data: DataWrite::Byte(b'h'),
                    ..
                },
                ..
            }
        ));
        assert_eq!((f.regs.rsi().unwrap(), f.regs.rcx().unwrap()), (0x1011, 1));
        assert_eq!(f.regs.rip().unwrap(), 0x100);

        let c = classify(raw.clone(), &mut f.regs, &f.memory).unwrap();
        assert!(matches!(
            c,
            Classified::Exit {
                exit: VmExit::IoOut {
                    data: DataWrite::Byte(b'i'),
                    ..
                },
                ..
            }
        ));
        assert_eq!(f.regs.rcx().unwrap(), 0);
        assert_eq!(f.regs.rip().unwrap(), 0x102);

        let c = classify(raw, &mut f.regs, &f.memory).unwrap();
        assert!(matches!(c, Classified::Resolved(Resolution::EmptyRep)));
        assert_eq!(f.regs.rip().unwrap(), 0x104);
    }

    #[test]
    fn reserved_string_io_info_is_an_unsupported_exit() {
        let mut f = fixture();
        f.regs.set_rcx(1).unwrap();
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::IoInstruction as u32,
            qualification: 0x03f8_0030,
            instruction_length: 2,
            instruction_info: 3 << 7,
            ..Default::default()
        });
        assert!(matches!(
            classify(raw, &mut f.regs, &f.memory),
            Err(VmmError::UnsupportedExit(r)) if r == R::IoInstruction as u32
        ));
        assert_eq!(f.regs.rip().unwrap(), 0x100);
    }

    #[test]
    fn unknown_decoded_exit_is_an_error() {
        let mut f = fixture();
        let err = classify(RawExit::Decoded(DecodedExit::Unknown(0x77)), &mut f.regs, &f.memory)
            .unwrap_err();
        assert!(matches!(err, VmmError::UnsupportedExit(0x77)));
        assert_eq!(err.kind(), crate::ErrorKind::Unrecognized);
    }

    #[test]
    fn insw_with_direction_flag_writes_backwards() {
        let mut f = fixture();
        f.memory.add(Gpa::new(0x2000), 0x1000, false).unwrap();
        f.regs.set_rflags(Rflags::_1 | Rflags::DF).unwrap();
        f.regs.set_rdi(0x2100).unwrap();
        f.regs.set_rsi(0).unwrap();
        f.regs.set_rcx(0).unwrap();
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::IoInstruction as u32,
            qualification: 0x0071_0019,
            instruction_length: 1,
            ..Default::default()
        });
        let c = classify(raw, &mut f.regs, &f.memory).unwrap();
        match c {
            Classified::Exit { pending, .. } => assert_eq!(
                pending,
                Some(PendingRead::Memory {
                    gpa: Gpa::new(0x2100),
                    width: DataRead::Word
                })
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.regs.rdi().unwrap(), 0x20fe);
        assert_eq!(f.regs.rip().unwrap(), 0x101);
    }

    #[test]
    fn ept_write_to_clean_page_is_resolved() {
        let mut f = fixture();
        let region = f.memory.add(Gpa::new(0x1000), 0x2000, false).unwrap();
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::EptViolation as u32,
            qualification: (EptViolationQualification::WRITE | EptViolationQualification::READABLE)
                .bits(),
            guest_physical_address: 0x2008,
            ..Default::default()
        });
        let c = classify(raw.clone(), &mut f.regs, &f.memory).unwrap();
        assert!(matches!(
            c,
            Classified::Resolved(Resolution::DirtyPage(gpa)) if gpa == Gpa::new(0x2000)
        ));
        assert!(region.is_dirty(Gpa::new(0x2008)));
        // A second fault on the same page is a stale one.
        let c = classify(raw, &mut f.regs, &f.memory).unwrap();
        assert!(matches!(c, Classified::Resolved(Resolution::Spurious(_))));
        assert_eq!(f.hv.protections().len(), 1);
    }

    #[test]
    fn ept_read_inside_ram_is_spurious_and_outside_is_mmio() {
        let mut f = fixture();
        f.memory.add(Gpa::new(0x1000), 0x1000, false).unwrap();
        let read = |gpa| {
            RawExit::Vmx(VmxExitRecord {
                reason: R::EptViolation as u32,
                qualification: (EptViolationQualification::READ
                    | EptViolationQualification::GLA_VALID)
                    .bits(),
                guest_physical_address: gpa,
                guest_linear_address: gpa,
                ..Default::default()
            })
        };
        assert!(matches!(
            classify(read(0x1800), &mut f.regs, &f.memory).unwrap(),
            Classified::Resolved(Resolution::Spurious(_))
        ));
        assert!(matches!(
            classify(read(0xfee0_0000), &mut f.regs, &f.memory).unwrap(),
            Classified::Mmio {
                access: MemoryAccess::Read,
                gla: Some(0xfee0_0000),
                ..
            }
        ));
    }

    #[test]
    fn ept_write_to_rom_is_a_violation() {
        let mut f = fixture();
        f.memory.add(Gpa::new(0xf0000), 0x10000, true).unwrap();
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::EptViolation as u32,
            qualification: EptViolationQualification::WRITE.bits(),
            guest_physical_address: 0xf0010,
            ..Default::default()
        });
        assert!(matches!(
            classify(raw, &mut f.regs, &f.memory).unwrap(),
            Classified::Exit {
                exit: VmExit::MemoryViolation {
                    access: MemoryAccess::Write,
                    gla: None,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn triple_fault_entry_failure_and_unknown_reasons() {
        let mut f = fixture();
        assert!(matches!(
            classify(vmx(R::TripleFault, 0), &mut f.regs, &f.memory).unwrap(),
            Classified::Exit {
                exit: VmExit::Shutdown,
                ..
            }
        ));
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: 0x8000_0021,
            ..Default::default()
        });
        assert!(matches!(
            classify(raw, &mut f.regs, &f.memory).unwrap(),
            Classified::Exit {
                exit: VmExit::EntryFailed(EntryFailure { reason: 0x21, .. }),
                ..
            }
        ));
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: 0x3f,
            ..Default::default()
        });
        assert!(matches!(
            classify(raw, &mut f.regs, &f.memory),
            Err(VmmError::UnsupportedExit(0x3f))
        ));
    }

    #[test]
    fn exceptions_carry_their_error_code() {
        let mut f = fixture();
        let raw = RawExit::Vmx(VmxExitRecord {
            reason: R::ExceptionOrNmi as u32,
            interruption_info: 0x8000_0b0e,
            interruption_error_code: 6,
            ..Default::default()
        });
        assert!(matches!(
            classify(raw, &mut f.regs, &f.memory).unwrap(),
            Classified::Exit {
                exit: VmExit::Exception {
                    vector: crate::x86::vector::PF,
                    error_code: Some(6)
                },
                ..
            }
        ));
    }

    #[test]
    fn wrmsr_combines_edx_eax() {
        let mut f = fixture();
        f.regs.set_rcx(0x1b).unwrap();
        f.regs.set_rdx(0xfee).unwrap();
        f.regs.set_rax(0xdead_0900).unwrap();
        let c = classify(vmx(R::Wrmsr, 0), &mut f.regs, &f.memory).unwrap();
        assert!(matches!(
            c,
            Classified::Exit {
                exit: VmExit::Wrmsr {
                    msr: 0x1b,
                    value: 0xfee_dead_0900
                },
                ..
            }
        ));
        assert_eq!(f.regs.rip().unwrap(), 0x101);
    }

    #[test]
    fn decoded_exits_map_directly() {
        let mut f = fixture();
        let raw = RawExit::Decoded(DecodedExit::MmioRead {
            gpa: Gpa::new(0xd0000),
            width: DataRead::Dword,
        });
        match classify(raw, &mut f.regs, &f.memory).unwrap() {
            Classified::Exit { exit, pending } => {
                assert_eq!(
                    exit,
                    VmExit::MmioRead {
                        gpa: Gpa::new(0xd0000),
                        width: DataRead::Dword
                    }
                );
                assert_eq!(pending, Some(PendingRead::Backend(DataRead::Dword)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn data_write_bytes() {
        assert_eq!(DataWrite::new(DataRead::Word, 0x1_2345), DataWrite::Word(0x2345));
        assert_eq!(DataWrite::Dword(0x0403_0201).to_le_bytes(), vec![1, 2, 3, 4]);
        assert_eq!(DataWrite::from_le_bytes(&[1, 2, 3]), None);
    }

    proptest::proptest! {
        #[test]
        fn data_keeps_the_low_bytes_of_its_width(value in proptest::prelude::any::<u64>(), shift in 0usize..4) {
            let width = [DataRead::Byte, DataRead::Word, DataRead::Dword, DataRead::Qword][shift];
            let data = DataWrite::new(width, value);
            let mask = u64::MAX >> (64 - 8 * width.bytes());
            proptest::prop_assert_eq!(data.width(), width);
            proptest::prop_assert_eq!(data.value(), value & mask);
            proptest::prop_assert_eq!(DataWrite::from_le_bytes(&data.to_le_bytes()), Some(data));
        }
    }
}
