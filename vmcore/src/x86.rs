//! x86 architectural register layouts.

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        ///
        /// Set to respond to maskable hardware interrupts; cleared to inhibit them.
        /// An interrupt is only injected into the guest while this flag is set.
        const IF = 1 << 9;
        /// Direction Flag
        ///
        /// When set, string instructions decrement the index registers.
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Nested task
        const NT = 1 << 14;
        /// Resume
        const RF = 1 << 16;
        /// Virtual-8086 mode
        const VM = 1 << 17;
        /// Alignment check or access control
        const AC = 1 << 18;
        /// Virtual Interrupt
        const VIF = 1 << 19;
        /// Virtual interrupt pending
        const VIP = 1 << 20;
        /// Identification.
        const ID = 1 << 21;
    }
}

impl Rflags {
    /// Bits that must be zero.
    pub const RESERVED: u64 = !(Self::all().bits());
}

bitflags::bitflags! {
    /// Cr0 Register.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protected mode enable.
        const PE = 1 << 0;
        /// Monitor co-processor.
        const MP = 1 << 1;
        /// x87 FPU emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type.
        const ET = 1 << 4;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not-write through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Cr4 Register.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        /// Virtual 8086 mode extensions.
        const VME = 1 << 0;
        /// Protected-mode virtual interrupts.
        const PVI = 1 << 1;
        /// Time stamp disable.
        const TSD = 1 << 2;
        /// Debugging extensions.
        const DE = 1 << 3;
        /// Page size extension.
        const PSE = 1 << 4;
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine check exception.
        const MCE = 1 << 6;
        /// Page global enabled.
        const PGE = 1 << 7;
        /// Performance-monitoring counter enable.
        const PCE = 1 << 8;
        /// OS support for FXSAVE and FXRSTOR.
        const OSFXSR = 1 << 9;
        /// OS support for unmasked SIMD floating-point exceptions.
        const OSXMMEXCPT = 1 << 10;
        /// User-mode instruction prevention.
        const UMIP = 1 << 11;
        /// Virtual machine extensions enable.
        const VMXE = 1 << 13;
        /// Safer mode extensions enable.
        const SMXE = 1 << 14;
        /// PCID enable.
        const PCIDE = 1 << 17;
        /// XSAVE and processor extended states enable.
        const OSXSAVE = 1 << 18;
        /// Supervisor mode execution protection enable.
        const SMEP = 1 << 20;
        /// Supervisor mode access prevention enable.
        const SMAP = 1 << 21;
    }
}

bitflags::bitflags! {
    /// IA32_EFER.
    #[repr(transparent)]
    pub struct Efer: u64 {
        /// System call extensions.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active.
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }
}

bitflags::bitflags! {
    /// Segment access rights in the VMCS layout.
    ///
    /// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 25-2.
    /// Format of Access Rights.
    #[repr(transparent)]
    pub struct AccessRights: u32 {
        /// Accessed.
        const A = 1 << 0;
        /// Writable (data) / Readable (code).
        const WR = 1 << 1;
        /// Expand-down (data) / Conforming (code).
        const EC = 1 << 2;
        /// Code segment.
        const CODE = 1 << 3;
        /// Descriptor type (0 = system; 1 = code or data).
        const S = 1 << 4;
        /// Segment present.
        const P = 1 << 7;
        /// Available for use by system software.
        const AVL = 1 << 12;
        /// 64-bit code segment.
        const L = 1 << 13;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment).
        const D_B = 1 << 14;
        /// Granularity.
        const G = 1 << 15;
        /// Segment unusable.
        const UNUSABLE = 1 << 16;
    }
}

impl AccessRights {
    /// Segment type field (bits 3:0).
    #[inline]
    pub fn segment_type(&self) -> u32 {
        self.bits() & 0xf
    }

    /// Descriptor privilege level (bits 6:5).
    #[inline]
    pub fn dpl(&self) -> u32 {
        (self.bits() >> 5) & 3
    }
}

/// Segment registers, numbered as in VM-exit instruction information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum SegmentIndex {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// Exception vectors the monitor refers to by name.
pub mod vector {
    /// Divide error.
    pub const DE: u8 = 0;
    /// Non-maskable interrupt.
    pub const NMI: u8 = 2;
    /// Invalid opcode.
    pub const UD: u8 = 6;
    /// Double fault.
    pub const DF: u8 = 8;
    /// General protection.
    pub const GP: u8 = 13;
    /// Page fault.
    pub const PF: u8 = 14;
}
