//! MMIO instruction emulator.
//!
//! When the guest touches a guest-physical address no region backs, the hardware only reports the
//! address. The emulator fetches the faulting instruction, decodes it, performs the load or store
//! through the device model's [`MmioHandler`], and retires the instruction.
//!
//! Only real-address mode and the `MOV` forms devices are accessed with in practice are handled:
//!
//! | Form | Example |
//! |------|---------|
//! | accumulator to/from absolute offset | `mov al, [0x1234]`, `mov [0x1234], eax` |
//! | register to/from absolute address   | `mov bx, [0x1234]`, `mov [0x1234], cl` |
//! | immediate to absolute address       | `mov dword [0x1234], 0x1` |
//!
//! Anything else is [`VmmError::UnsupportedInstruction`].
use crate::{
    backend::VcpuBackend,
    memory::Gpa,
    probe::Probe,
    registers::{Register, RegisterCache, RegisterSet, Segment},
    vmexits::{DataRead, DataWrite, VmExit},
    x86::AccessRights,
    VmmError,
};
use iced_x86::{Code, Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, OpKind};

/// Every intel instruction is at most 15 bytes.
const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Device model behind guest-physical addresses without RAM.
pub trait MmioHandler: Send {
    /// Load `width` bytes at `gpa`.
    fn read(&mut self, gpa: Gpa, width: DataRead) -> Result<DataWrite, VmmError>;

    /// Store `data` at `gpa`.
    fn write(&mut self, gpa: Gpa, data: DataWrite) -> Result<(), VmmError>;
}

/// A general purpose register slice: `AH` is `(Rax, 8, Byte)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GprSlice {
    reg: Register,
    shift: u32,
    width: DataRead,
}

impl GprSlice {
    fn of(reg: iced_x86::Register) -> Option<Self> {
        use iced_x86::Register as I;
        use DataRead::*;
        let (reg, shift, width) = match reg {
            I::AL => (Register::Rax, 0, Byte),
            I::CL => (Register::Rcx, 0, Byte),
            I::DL => (Register::Rdx, 0, Byte),
            I::BL => (Register::Rbx, 0, Byte),
            I::AH => (Register::Rax, 8, Byte),
            I::CH => (Register::Rcx, 8, Byte),
            I::DH => (Register::Rdx, 8, Byte),
            I::BH => (Register::Rbx, 8, Byte),
            I::AX => (Register::Rax, 0, Word),
            I::CX => (Register::Rcx, 0, Word),
            I::DX => (Register::Rdx, 0, Word),
            I::BX => (Register::Rbx, 0, Word),
            I::SP => (Register::Rsp, 0, Word),
            I::BP => (Register::Rbp, 0, Word),
            I::SI => (Register::Rsi, 0, Word),
            I::DI => (Register::Rdi, 0, Word),
            I::EAX => (Register::Rax, 0, Dword),
            I::ECX => (Register::Rcx, 0, Dword),
            I::EDX => (Register::Rdx, 0, Dword),
            I::EBX => (Register::Rbx, 0, Dword),
            I::ESP => (Register::Rsp, 0, Dword),
            I::EBP => (Register::Rbp, 0, Dword),
            I::ESI => (Register::Rsi, 0, Dword),
            I::EDI => (Register::Rdi, 0, Dword),
            _ => return None,
        };
        Some(Self { reg, shift, width })
    }

    #[inline]
    fn mask(&self) -> u64 {
        match self.width {
            DataRead::Qword => u64::MAX,
            w => (1 << (w.bytes() * 8)) - 1,
        }
    }

    fn read<V: VcpuBackend>(&self, regs: &mut RegisterCache<V>) -> Result<u64, VmmError> {
        let v = regs.fetch(self.reg.set())?.get(self.reg)?;
        Ok((v >> self.shift) & self.mask())
    }

    // Outside 64-bit mode every write merges, 32-bit ones included.
    fn write<V: VcpuBackend>(&self, regs: &mut RegisterCache<V>, v: u64) -> Result<(), VmmError> {
        let old = regs.fetch(self.reg.set())?.get(self.reg)?;
        let mask = self.mask() << self.shift;
        regs.set(self.reg, (old & !mask) | ((v << self.shift) & mask))
    }
}

enum Operation {
    Load(GprSlice),
    StoreRegister(GprSlice),
    StoreImmediate(DataRead, u64),
}

/// The MMIO instruction emulator.
pub struct InstructionEmulator;

impl InstructionEmulator {
    /// Complete the access to `gpa` that made the guest fault, and retire the instruction.
    ///
    /// Returns the access performed, as a [`VmExit::MmioRead`] or [`VmExit::MmioWrite`].
    pub fn emulate<V, P>(
        regs: &mut RegisterCache<V>,
        probe: &P,
        gpa: Gpa,
        handler: &mut dyn MmioHandler,
    ) -> Result<VmExit, VmmError>
    where
        V: VcpuBackend,
        P: Probe + ?Sized,
    {
        let r = regs.fetch(RegisterSet::RIP | RegisterSet::CR0 | RegisterSet::CS)?;
        let rip = r.rip()?;
        let bitness = if r.segment(Segment::Cs)?.access_rights.contains(AccessRights::D_B) {
            32
        } else {
            16
        };
        let code_gpa = probe.gva2gpa(r, Segment::Cs, rip)?;

        let len = probe
            .contiguous_len(code_gpa)
            .min(MAX_INSTRUCTION_LENGTH as u64) as usize;
        if len == 0 {
            // Executing from MMIO space.
            return Err(VmmError::UnsupportedInstruction {
                rip,
                bytes: Vec::new(),
            });
        }
        let mut bytes = [0; MAX_INSTRUCTION_LENGTH];
        probe.read_guest(code_gpa, &mut bytes[..len])?;

        let insn = Decoder::with_ip(bitness, &bytes[..len], rip, DecoderOptions::NONE).decode();
        let unsupported = || VmmError::UnsupportedInstruction {
            rip,
            bytes: bytes[..len].to_vec(),
        };
        if insn.is_invalid() {
            tracing::warn!(rip, bytes = ?&bytes[..len], "undecodable instruction on mmio access");
            return Err(unsupported());
        }
        let op = Self::operation(&insn).ok_or_else(|| {
            let mut text = String::new();
            IntelFormatter::new().format(&insn, &mut text);
            tracing::warn!(rip, %gpa, "unsupported instruction on mmio access: {text}");
            unsupported()
        })?;

        let access = match op {
            Operation::Load(dst) => {
                let data = handler.read(gpa, dst.width)?;
                dst.write(regs, data.value())?;
                VmExit::MmioRead {
                    gpa,
                    width: dst.width,
                }
            }
            Operation::StoreRegister(src) => {
                let data = DataWrite::new(src.width, src.read(regs)?);
                handler.write(gpa, data)?;
                VmExit::MmioWrite { gpa, data }
            }
            Operation::StoreImmediate(width, imm) => {
                let data = DataWrite::new(width, imm);
                handler.write(gpa, data)?;
                VmExit::MmioWrite { gpa, data }
            }
        };

        let ip_mask = if bitness == 16 { 0xffff } else { 0xffff_ffff };
        let next = rip.wrapping_add(insn.len() as u64);
        regs.set_rip((rip & !ip_mask) | (next & ip_mask))?;
        tracing::trace!(rip, ?access, "mmio access emulated");
        Ok(access)
    }

    fn operation(insn: &Instruction) -> Option<Operation> {
        use DataRead::*;
        let absolute = (0..insn.op_count()).any(|i| insn.op_kind(i) == OpKind::Memory)
            && insn.memory_base() == iced_x86::Register::None
            && insn.memory_index() == iced_x86::Register::None;
        if !absolute {
            return None;
        }
        Some(match insn.code() {
            Code::Mov_AL_moffs8
            | Code::Mov_AX_moffs16
            | Code::Mov_EAX_moffs32
            | Code::Mov_r8_rm8
            | Code::Mov_r16_rm16
            | Code::Mov_r32_rm32 => Operation::Load(GprSlice::of(insn.op0_register())?),
            Code::Mov_moffs8_AL
            | Code::Mov_moffs16_AX
            | Code::Mov_moffs32_EAX
            | Code::Mov_rm8_r8
            | Code::Mov_rm16_r16
            | Code::Mov_rm32_r32 => Operation::StoreRegister(GprSlice::of(insn.op1_register())?),
            Code::Mov_rm8_imm8 => Operation::StoreImmediate(Byte, insn.immediate(1)),
            Code::Mov_rm16_imm16 => Operation::StoreImmediate(Word, insn.immediate(1)),
            Code::Mov_rm32_imm32 => Operation::StoreImmediate(Dword, insn.immediate(1)),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockHypervisor, MockVcpu};
    use crate::backend::HypervisorBackend;
    use crate::memory::MemoryRegionTable;
    use crate::registers::SegmentRegister;
    use crate::x86::Cr0;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        reads: Vec<(Gpa, DataRead)>,
        writes: Vec<(Gpa, DataWrite)>,
        value: u64,
    }

    impl MmioHandler for Recorder {
        fn read(&mut self, gpa: Gpa, width: DataRead) -> Result<DataWrite, VmmError> {
            self.reads.push((gpa, width));
            Ok(DataWrite::new(width, self.value))
        }

        fn write(&mut self, gpa: Gpa, data: DataWrite) -> Result<(), VmmError> {
            self.writes.push((gpa, data));
            Ok(())
        }
    }

    // Code at 0x1000:0x0000 (linear 0x10000).
    fn setup(code: &[u8]) -> (RegisterCache<MockVcpu>, MemoryRegionTable) {
        let hv = Arc::new(MockHypervisor::new());
        let mut regs = RegisterCache::new(hv.create_vcpu().unwrap());
        regs.set_cr0(Cr0::ET).unwrap();
        regs.set_rip(0).unwrap();
        regs.set_segment(
            Segment::Cs,
            SegmentRegister::real_mode(0x1000, AccessRights::P | AccessRights::S | AccessRights::CODE),
        )
        .unwrap();
        let mut memory = MemoryRegionTable::new(hv, false);
        memory
            .add(Gpa::new(0x10000), 0x1000, false)
            .unwrap()
            .load_binary(code, 0)
            .unwrap();
        (regs, memory)
    }

    #[test]
    fn moffs_load_into_al() {
        // mov al, [0x0010]
        let (mut regs, memory) = setup(&[0xa0, 0x10, 0x00]);
        regs.set_rax(0x1234_5678).unwrap();
        let mut dev = Recorder {
            value: 0xab,
            ..Default::default()
        };
        let access =
            InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0010), &mut dev).unwrap();
        assert_eq!(
            access,
            VmExit::MmioRead {
                gpa: Gpa::new(0xd0010),
                width: DataRead::Byte
            }
        );
        assert_eq!(regs.rax().unwrap(), 0x1234_56ab);
        assert_eq!(regs.rip().unwrap(), 3);
    }

    #[test]
    fn register_store_to_absolute_address() {
        // mov [0x0020], bh
        let (mut regs, memory) = setup(&[0x88, 0x3e, 0x20, 0x00]);
        regs.set_rbx(0x4200).unwrap();
        let mut dev = Recorder::default();
        InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0020), &mut dev).unwrap();
        assert_eq!(dev.writes, vec![(Gpa::new(0xd0020), DataWrite::Byte(0x42))]);
        assert_eq!(regs.rip().unwrap(), 4);
    }

    #[test]
    fn immediate_dword_store() {
        // mov dword [0x0004], 0xdeadbeef
        let (mut regs, memory) = setup(&[0x66, 0xc7, 0x06, 0x04, 0x00, 0xef, 0xbe, 0xad, 0xde]);
        let mut dev = Recorder::default();
        InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0004), &mut dev).unwrap();
        assert_eq!(dev.writes, vec![(Gpa::new(0xd0004), DataWrite::Dword(0xdead_beef))]);
        assert_eq!(regs.rip().unwrap(), 9);
    }

    #[test]
    fn word_load_into_register() {
        // mov cx, [0x0100]
        let (mut regs, memory) = setup(&[0x8b, 0x0e, 0x00, 0x01]);
        regs.set_rcx(0xffff_0000).unwrap();
        let mut dev = Recorder {
            value: 0xbeef,
            ..Default::default()
        };
        InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0100), &mut dev).unwrap();
        assert_eq!(regs.rcx().unwrap(), 0xffff_beef);
        assert_eq!(dev.reads, vec![(Gpa::new(0xd0100), DataRead::Word)]);
    }

    #[test]
    fn register_indirect_access_is_unsupported() {
        // mov al, [bx]
        let (mut regs, memory) = setup(&[0x8a, 0x07]);
        let mut dev = Recorder::default();
        let err = InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0000), &mut dev)
            .unwrap_err();
        assert!(matches!(
            err,
            VmmError::UnsupportedInstruction { rip: 0, ref bytes } if bytes.starts_with(&[0x8a, 0x07])
        ));
        assert!(dev.reads.is_empty());
        assert_eq!(regs.rip().unwrap(), 0);
    }

    #[test]
    fn fetch_from_unbacked_code_is_unsupported() {
        let (mut regs, memory) = setup(&[0xa0, 0x10, 0x00]);
        regs.set_segment(
            Segment::Cs,
            SegmentRegister::real_mode(0xe000, AccessRights::P | AccessRights::S | AccessRights::CODE),
        )
        .unwrap();
        let mut dev = Recorder::default();
        let err = InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xe0000), &mut dev)
            .unwrap_err();
        assert!(matches!(err, VmmError::UnsupportedInstruction { rip: 0, ref bytes } if bytes.is_empty()));
        assert!(dev.reads.is_empty() && dev.writes.is_empty());
    }

    #[test]
    fn protected_mode_fails_loudly() {
        let (mut regs, memory) = setup(&[0xa0, 0x10, 0x00]);
        regs.set_cr0(Cr0::PE | Cr0::ET).unwrap();
        let mut dev = Recorder::default();
        assert!(matches!(
            InstructionEmulator::emulate(&mut regs, &memory, Gpa::new(0xd0010), &mut dev),
            Err(VmmError::UnsupportedAddressTranslation)
        ));
    }
}
