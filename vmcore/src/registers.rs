//! Lazily fetched, write-back register cache.
//!
//! Every call into the hypervisor costs a round trip, so a vCPU never reads a register it was not
//! asked for. [`RegisterCache::fetch`] pulls the requested registers in one batched call per
//! hardware register group, writes are kept locally until [`RegisterCache::flush`], and the whole
//! cache is dropped by [`RegisterCache::invalidate`] after each VM-entry.
//!
//! Reading a register that was never fetched is an error ([`VmmError::UnfetchedRegister`]), not
//! a stale or zero value. Full-width writes never need a prior fetch; narrow writes (for example
//! `AL`) do, because the cache must own the other bits to merge them.
use crate::{
    backend::VcpuBackend,
    x86::{AccessRights, Cr0, Cr4, Efer, Rflags},
    VmmError,
};

bitflags::bitflags! {
    /// A set of architectural registers.
    pub struct RegisterSet: u64 {
        const RAX = 1 << 0;
        const RBX = 1 << 1;
        const RCX = 1 << 2;
        const RDX = 1 << 3;
        const RSI = 1 << 4;
        const RDI = 1 << 5;
        const RSP = 1 << 6;
        const RBP = 1 << 7;
        const R8 = 1 << 8;
        const R9 = 1 << 9;
        const R10 = 1 << 10;
        const R11 = 1 << 11;
        const R12 = 1 << 12;
        const R13 = 1 << 13;
        const R14 = 1 << 14;
        const R15 = 1 << 15;
        const RIP = 1 << 16;
        const RFLAGS = 1 << 17;
        const CR0 = 1 << 18;
        const CR2 = 1 << 19;
        const CR3 = 1 << 20;
        const CR4 = 1 << 21;
        const EFER = 1 << 22;
        const CS = 1 << 23;
        const DS = 1 << 24;
        const ES = 1 << 25;
        const FS = 1 << 26;
        const GS = 1 << 27;
        const SS = 1 << 28;
        const TR = 1 << 29;
        const LDTR = 1 << 30;
        const GDTR = 1 << 31;
        const IDTR = 1 << 32;

        /// General purpose registers, RIP and RFLAGS.
        const GENERAL = (1 << 18) - 1;
        /// Control registers and EFER.
        const CONTROL = Self::CR0.bits() | Self::CR2.bits() | Self::CR3.bits()
            | Self::CR4.bits() | Self::EFER.bits();
        /// Segment and descriptor-table registers.
        const SEGMENT = Self::CS.bits() | Self::DS.bits() | Self::ES.bits() | Self::FS.bits()
            | Self::GS.bits() | Self::SS.bits() | Self::TR.bits() | Self::LDTR.bits()
            | Self::GDTR.bits() | Self::IDTR.bits();
        /// Every register.
        const ALL = Self::GENERAL.bits() | Self::CONTROL.bits() | Self::SEGMENT.bits();
    }
}

/// Hardware register groups; the backend is called once per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// General purpose registers, RIP and RFLAGS.
    General,
    /// Control registers.
    Control,
    /// Segment and descriptor-table registers.
    Segment,
}

impl RegisterGroup {
    const ALL: [RegisterGroup; 3] = [Self::General, Self::Control, Self::Segment];

    /// Registers of this group.
    pub const fn set(self) -> RegisterSet {
        match self {
            Self::General => RegisterSet::GENERAL,
            Self::Control => RegisterSet::CONTROL,
            Self::Segment => RegisterSet::SEGMENT,
        }
    }
}

macro_rules! registers {
    ($($name:ident => $set:ident,)*) => {
        /// A single 64-bit value the backend can read or write.
        ///
        /// Segment registers are split in their selector, base, limit and access rights, as the
        /// control-field layout stores them.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Register {
            $($name,)*
        }

        impl Register {
            /// Every register, in index order.
            pub const ALL: &'static [Register] = &[$(Register::$name,)*];

            /// The member of [`RegisterSet`] this value belongs to.
            pub const fn set(self) -> RegisterSet {
                match self {
                    $(Register::$name => RegisterSet::$set,)*
                }
            }
        }
    };
}

registers! {
    Rax => RAX,
    Rbx => RBX,
    Rcx => RCX,
    Rdx => RDX,
    Rsi => RSI,
    Rdi => RDI,
    Rsp => RSP,
    Rbp => RBP,
    R8 => R8,
    R9 => R9,
    R10 => R10,
    R11 => R11,
    R12 => R12,
    R13 => R13,
    R14 => R14,
    R15 => R15,
    Rip => RIP,
    Rflags => RFLAGS,
    Cr0 => CR0,
    Cr2 => CR2,
    Cr3 => CR3,
    Cr4 => CR4,
    Efer => EFER,
    CsSelector => CS,
    CsBase => CS,
    CsLimit => CS,
    CsAccessRights => CS,
    DsSelector => DS,
    DsBase => DS,
    DsLimit => DS,
    DsAccessRights => DS,
    EsSelector => ES,
    EsBase => ES,
    EsLimit => ES,
    EsAccessRights => ES,
    FsSelector => FS,
    FsBase => FS,
    FsLimit => FS,
    FsAccessRights => FS,
    GsSelector => GS,
    GsBase => GS,
    GsLimit => GS,
    GsAccessRights => GS,
    SsSelector => SS,
    SsBase => SS,
    SsLimit => SS,
    SsAccessRights => SS,
    TrSelector => TR,
    TrBase => TR,
    TrLimit => TR,
    TrAccessRights => TR,
    LdtrSelector => LDTR,
    LdtrBase => LDTR,
    LdtrLimit => LDTR,
    LdtrAccessRights => LDTR,
    GdtrBase => GDTR,
    GdtrLimit => GDTR,
    IdtrBase => IDTR,
    IdtrLimit => IDTR,
}

const REGISTER_COUNT: usize = Register::ALL.len();

impl Register {
    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    const fn bit(self) -> u64 {
        1 << self.index()
    }

    /// The hardware group this register is transferred with.
    pub fn group(self) -> RegisterGroup {
        let set = self.set();
        if RegisterSet::GENERAL.contains(set) {
            RegisterGroup::General
        } else if RegisterSet::CONTROL.contains(set) {
            RegisterGroup::Control
        } else {
            RegisterGroup::Segment
        }
    }

    /// Mask over register indices covering every member of `set`.
    fn mask_of(set: RegisterSet) -> u64 {
        Register::ALL
            .iter()
            .filter(|r| set.contains(r.set()))
            .fold(0, |m, r| m | r.bit())
    }
}

/// Segment registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
}

impl Segment {
    /// Selector, base, limit and access rights of this segment.
    pub const fn fields(self) -> [Register; 4] {
        use Register::*;
        match self {
            Self::Cs => [CsSelector, CsBase, CsLimit, CsAccessRights],
            Self::Ds => [DsSelector, DsBase, DsLimit, DsAccessRights],
            Self::Es => [EsSelector, EsBase, EsLimit, EsAccessRights],
            Self::Fs => [FsSelector, FsBase, FsLimit, FsAccessRights],
            Self::Gs => [GsSelector, GsBase, GsLimit, GsAccessRights],
            Self::Ss => [SsSelector, SsBase, SsLimit, SsAccessRights],
            Self::Tr => [TrSelector, TrBase, TrLimit, TrAccessRights],
            Self::Ldtr => [LdtrSelector, LdtrBase, LdtrLimit, LdtrAccessRights],
        }
    }

    /// The member of [`RegisterSet`] for this segment.
    pub const fn set(self) -> RegisterSet {
        self.fields()[0].set()
    }
}

impl From<crate::x86::SegmentIndex> for Segment {
    fn from(idx: crate::x86::SegmentIndex) -> Self {
        use crate::x86::SegmentIndex;
        match idx {
            SegmentIndex::Es => Self::Es,
            SegmentIndex::Cs => Self::Cs,
            SegmentIndex::Ss => Self::Ss,
            SegmentIndex::Ds => Self::Ds,
            SegmentIndex::Fs => Self::Fs,
            SegmentIndex::Gs => Self::Gs,
        }
    }
}

/// Hidden and visible parts of a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: AccessRights,
}

impl SegmentRegister {
    /// A real-mode segment: base is `selector << 4`, limit 64 KiB.
    pub const fn real_mode(selector: u16, access_rights: AccessRights) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            access_rights,
        }
    }
}

/// GDTR or IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Snapshot of the registers known to a vCPU.
///
/// Every accessor fails with [`VmmError::UnfetchedRegister`] if the register was not fetched.
#[derive(Clone, PartialEq, Eq)]
pub struct Registers {
    values: [Option<u64>; REGISTER_COUNT],
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            values: [None; REGISTER_COUNT],
        }
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for reg in Register::ALL {
            if let Some(v) = self.values[reg.index()] {
                map.entry(reg, &format_args!("{v:#x}"));
            }
        }
        map.finish()
    }
}

macro_rules! full_accessors {
    ($($get:ident, $reg:ident;)*) => {
        $(
            #[doc = concat!("Read ", stringify!($get), ".")]
            #[inline]
            pub fn $get(&self) -> Result<u64, VmmError> {
                self.get(Register::$reg)
            }
        )*
    };
}

macro_rules! narrow_accessors {
    ($($get:ident, $reg:ident, $shift:expr, $mask:expr;)*) => {
        $(
            #[doc = concat!("Read ", stringify!($get), ".")]
            #[inline]
            pub fn $get(&self) -> Result<u64, VmmError> {
                Ok((self.get(Register::$reg)? >> $shift) & $mask)
            }
        )*
    };
}

impl Registers {
    /// Read a raw register value.
    #[inline]
    pub fn get(&self, reg: Register) -> Result<u64, VmmError> {
        self.values[reg.index()].ok_or(VmmError::UnfetchedRegister(reg.set()))
    }

    /// Members of `RegisterSet` whose every value is known.
    pub fn fetched(&self) -> RegisterSet {
        let missing = Register::ALL
            .iter()
            .filter(|r| self.values[r.index()].is_none())
            .fold(RegisterSet::empty(), |s, r| s | r.set());
        RegisterSet::ALL - missing
    }

    /// Check that every member of `set` is known.
    pub fn require(&self, set: RegisterSet) -> Result<(), VmmError> {
        let missing = set - self.fetched();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(VmmError::UnfetchedRegister(missing))
        }
    }

    full_accessors! {
        rax, Rax; rbx, Rbx; rcx, Rcx; rdx, Rdx;
        rsi, Rsi; rdi, Rdi; rsp, Rsp; rbp, Rbp;
        r8, R8; r9, R9; r10, R10; r11, R11;
        r12, R12; r13, R13; r14, R14; r15, R15;
        rip, Rip; cr2, Cr2; cr3, Cr3;
    }

    narrow_accessors! {
        al, Rax, 0, 0xff; ah, Rax, 8, 0xff; ax, Rax, 0, 0xffff; eax, Rax, 0, 0xffff_ffff;
        bl, Rbx, 0, 0xff; bh, Rbx, 8, 0xff; bx, Rbx, 0, 0xffff; ebx, Rbx, 0, 0xffff_ffff;
        cl, Rcx, 0, 0xff; ch, Rcx, 8, 0xff; cx, Rcx, 0, 0xffff; ecx, Rcx, 0, 0xffff_ffff;
        dl, Rdx, 0, 0xff; dh, Rdx, 8, 0xff; dx, Rdx, 0, 0xffff; edx, Rdx, 0, 0xffff_ffff;
        si, Rsi, 0, 0xffff; esi, Rsi, 0, 0xffff_ffff;
        di, Rdi, 0, 0xffff; edi, Rdi, 0, 0xffff_ffff;
        sp, Rsp, 0, 0xffff; esp, Rsp, 0, 0xffff_ffff;
        bp, Rbp, 0, 0xffff; ebp, Rbp, 0, 0xffff_ffff;
        ip, Rip, 0, 0xffff; eip, Rip, 0, 0xffff_ffff;
    }

    /// Read RFLAGS.
    #[inline]
    pub fn rflags(&self) -> Result<Rflags, VmmError> {
        self.get(Register::Rflags).map(Rflags::from_bits_truncate)
    }

    /// Read CR0.
    #[inline]
    pub fn cr0(&self) -> Result<Cr0, VmmError> {
        self.get(Register::Cr0).map(Cr0::from_bits_truncate)
    }

    /// Read CR4.
    #[inline]
    pub fn cr4(&self) -> Result<Cr4, VmmError> {
        self.get(Register::Cr4).map(Cr4::from_bits_truncate)
    }

    /// Read IA32_EFER.
    #[inline]
    pub fn efer(&self) -> Result<Efer, VmmError> {
        self.get(Register::Efer).map(Efer::from_bits_truncate)
    }

    /// Read a segment register.
    pub fn segment(&self, seg: Segment) -> Result<SegmentRegister, VmmError> {
        let [selector, base, limit, ar] = seg.fields();
        Ok(SegmentRegister {
            selector: self.get(selector)? as u16,
            base: self.get(base)?,
            limit: self.get(limit)? as u32,
            access_rights: AccessRights::from_bits_truncate(self.get(ar)? as u32),
        })
    }

    /// Read GDTR.
    pub fn gdtr(&self) -> Result<DescriptorTable, VmmError> {
        Ok(DescriptorTable {
            base: self.get(Register::GdtrBase)?,
            limit: self.get(Register::GdtrLimit)? as u16,
        })
    }

    /// Read IDTR.
    pub fn idtr(&self) -> Result<DescriptorTable, VmmError> {
        Ok(DescriptorTable {
            base: self.get(Register::IdtrBase)?,
            limit: self.get(Register::IdtrLimit)? as u16,
        })
    }

    /// Whether the guest runs in real-address mode.
    #[inline]
    pub fn is_real_mode(&self) -> Result<bool, VmmError> {
        Ok(!self.cr0()?.contains(Cr0::PE))
    }
}

/// The register cache of one vCPU.
///
/// The cache owns the backend vCPU handle until it is frozen; after [`RegisterCache::freeze`]
/// every register stays readable and every write is rejected.
pub struct RegisterCache<V: VcpuBackend> {
    regs: Registers,
    // Bit `i` is set when `Register::ALL[i]` was written and not flushed yet.
    dirty: u64,
    backend: Option<V>,
}

macro_rules! full_setters {
    ($($set:ident, $reg:ident;)*) => {
        $(
            #[doc = concat!("Write the full register behind `", stringify!($set), "`.")]
            #[inline]
            pub fn $set(&mut self, v: u64) -> Result<(), VmmError> {
                self.set(Register::$reg, v)
            }
        )*
    };
}

macro_rules! narrow_setters {
    ($($set:ident, $reg:ident, $shift:expr, $mask:expr;)*) => {
        $(
            #[doc = concat!("Merge into the register behind `", stringify!($set), "`.")]
            ///
            /// The register must have been fetched.
            #[inline]
            pub fn $set(&mut self, v: u64) -> Result<(), VmmError> {
                self.merge(Register::$reg, $shift, $mask, v)
            }
        )*
    };
}

impl<V: VcpuBackend> RegisterCache<V> {
    /// Create an empty cache over `backend`.
    pub fn new(backend: V) -> Self {
        Self {
            regs: Registers::default(),
            dirty: 0,
            backend: Some(backend),
        }
    }

    /// Known register values.
    #[inline]
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Registers written but not yet flushed.
    pub fn dirty(&self) -> RegisterSet {
        Register::ALL
            .iter()
            .filter(|r| self.dirty & r.bit() != 0)
            .fold(RegisterSet::empty(), |s, r| s | r.set())
    }

    /// Whether the cache was detached from its backend.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.backend.is_none()
    }

    /// The backend vCPU handle.
    #[inline]
    pub fn backend_mut(&mut self) -> Result<&mut V, VmmError> {
        self.backend.as_mut().ok_or(VmmError::RegisterCacheFrozen)
    }

    /// Make every member of `set` readable.
    ///
    /// Members already cached are left untouched; the rest are read with one backend call per
    /// register group.
    pub fn fetch(&mut self, set: RegisterSet) -> Result<&Registers, VmmError> {
        let wanted = Register::mask_of(set);
        for group in RegisterGroup::ALL {
            let missing = Register::ALL
                .iter()
                .copied()
                .filter(|r| {
                    wanted & r.bit() != 0
                        && r.group() == group
                        && self.regs.values[r.index()].is_none()
                })
                .collect::<Vec<_>>();
            if missing.is_empty() {
                continue;
            }
            let backend = self.backend.as_mut().ok_or(VmmError::RegisterCacheFrozen)?;
            let mut values = vec![0; missing.len()];
            backend.read_registers(&missing, &mut values)?;
            for (reg, v) in missing.into_iter().zip(values) {
                self.regs.values[reg.index()] = Some(v);
            }
        }
        Ok(&self.regs)
    }

    /// Write every dirty register back to the backend, one call per register group.
    pub fn flush(&mut self) -> Result<(), VmmError> {
        if self.dirty == 0 {
            return Ok(());
        }
        let backend = self.backend.as_mut().ok_or(VmmError::RegisterCacheFrozen)?;
        for group in RegisterGroup::ALL {
            let writes = Register::ALL
                .iter()
                .copied()
                .filter(|r| self.dirty & r.bit() != 0 && r.group() == group)
                .filter_map(|r| self.regs.values[r.index()].map(|v| (r, v)))
                .collect::<Vec<_>>();
            if !writes.is_empty() {
                backend.write_registers(&writes)?;
            }
        }
        self.dirty = 0;
        Ok(())
    }

    /// Forget every cached value.
    ///
    /// Called after each VM-entry, since the hardware may have changed anything. A frozen cache
    /// keeps its values.
    pub fn invalidate(&mut self) {
        if self.is_frozen() {
            return;
        }
        if self.dirty != 0 {
            tracing::warn!(dirty = ?self.dirty(), "dropping unflushed register writes");
        }
        self.regs = Registers::default();
        self.dirty = 0;
    }

    /// Fetch every register and detach the cache from its backend.
    ///
    /// Returns the backend handle so the caller can destroy it; `None` if already frozen.
    pub fn freeze(&mut self) -> Result<Option<V>, VmmError> {
        if self.is_frozen() {
            return Ok(None);
        }
        self.flush()?;
        self.fetch(RegisterSet::ALL)?;
        Ok(self.backend.take())
    }

    /// Detach the backend without fetching, for teardown after a backend failure.
    pub fn detach(&mut self) -> Option<V> {
        self.backend.take()
    }

    /// Write a full register value. No prior fetch is needed.
    pub fn set(&mut self, reg: Register, v: u64) -> Result<(), VmmError> {
        if self.is_frozen() {
            return Err(VmmError::RegisterCacheFrozen);
        }
        self.regs.values[reg.index()] = Some(v);
        self.dirty |= reg.bit();
        Ok(())
    }

    fn merge(&mut self, reg: Register, shift: u32, mask: u64, v: u64) -> Result<(), VmmError> {
        let old = self.regs.get(reg)?;
        let new = (old & !(mask << shift)) | ((v & mask) << shift);
        self.set(reg, new)
    }

    full_setters! {
        set_rax, Rax; set_rbx, Rbx; set_rcx, Rcx; set_rdx, Rdx;
        set_rsi, Rsi; set_rdi, Rdi; set_rsp, Rsp; set_rbp, Rbp;
        set_r8, R8; set_r9, R9; set_r10, R10; set_r11, R11;
        set_r12, R12; set_r13, R13; set_r14, R14; set_r15, R15;
        set_rip, Rip; set_cr2, Cr2; set_cr3, Cr3;
    }

    narrow_setters! {
        set_al, Rax, 0, 0xff; set_ah, Rax, 8, 0xff; set_ax, Rax, 0, 0xffff;
        set_bl, Rbx, 0, 0xff; set_bh, Rbx, 8, 0xff; set_bx, Rbx, 0, 0xffff;
        set_cl, Rcx, 0, 0xff; set_ch, Rcx, 8, 0xff; set_cx, Rcx, 0, 0xffff;
        set_dl, Rdx, 0, 0xff; set_dh, Rdx, 8, 0xff; set_dx, Rdx, 0, 0xffff;
        set_si, Rsi, 0, 0xffff; set_di, Rdi, 0, 0xffff;
        set_sp, Rsp, 0, 0xffff; set_bp, Rbp, 0, 0xffff;
        set_ip, Rip, 0, 0xffff;
    }

    /// Write EAX, clearing the upper half of RAX as a 32-bit write does in 64-bit mode.
    #[inline]
    pub fn set_eax(&mut self, v: u32) -> Result<(), VmmError> {
        self.set(Register::Rax, v as u64)
    }

    /// Write RFLAGS.
    #[inline]
    pub fn set_rflags(&mut self, v: Rflags) -> Result<(), VmmError> {
        self.set(Register::Rflags, v.bits())
    }

    /// Write CR0.
    #[inline]
    pub fn set_cr0(&mut self, v: Cr0) -> Result<(), VmmError> {
        self.set(Register::Cr0, v.bits())
    }

    /// Write CR4.
    #[inline]
    pub fn set_cr4(&mut self, v: Cr4) -> Result<(), VmmError> {
        self.set(Register::Cr4, v.bits())
    }

    /// Write IA32_EFER.
    #[inline]
    pub fn set_efer(&mut self, v: Efer) -> Result<(), VmmError> {
        self.set(Register::Efer, v.bits())
    }

    /// Write a whole segment register.
    pub fn set_segment(&mut self, seg: Segment, v: SegmentRegister) -> Result<(), VmmError> {
        let [selector, base, limit, ar] = seg.fields();
        self.set(selector, v.selector as u64)?;
        self.set(base, v.base)?;
        self.set(limit, v.limit as u64)?;
        self.set(ar, v.access_rights.bits() as u64)
    }

    /// Write GDTR.
    pub fn set_gdtr(&mut self, v: DescriptorTable) -> Result<(), VmmError> {
        self.set(Register::GdtrBase, v.base)?;
        self.set(Register::GdtrLimit, v.limit as u64)
    }

    /// Write IDTR.
    pub fn set_idtr(&mut self, v: DescriptorTable) -> Result<(), VmmError> {
        self.set(Register::IdtrBase, v.base)?;
        self.set(Register::IdtrLimit, v.limit as u64)
    }

    /// Move RIP forward by `len` bytes.
    pub fn advance_rip(&mut self, len: u64) -> Result<(), VmmError> {
        let rip = self.fetch(RegisterSet::RIP)?.rip()?;
        self.set_rip(rip.wrapping_add(len))
    }
}

impl<V: VcpuBackend> core::ops::Deref for RegisterCache<V> {
    type Target = Registers;

    fn deref(&self) -> &Self::Target {
        &self.regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockHypervisor, MockVcpu};
    use crate::backend::HypervisorBackend;
    use proptest::prelude::*;

    fn cache() -> (RegisterCache<MockVcpu>, MockHypervisor) {
        let hv = MockHypervisor::new();
        let vcpu = hv.create_vcpu().unwrap();
        (RegisterCache::new(vcpu), hv)
    }

    #[test]
    fn unfetched_read_is_rejected() {
        let (cache, _hv) = cache();
        assert!(matches!(
            cache.rax(),
            Err(VmmError::UnfetchedRegister(s)) if s == RegisterSet::RAX
        ));
    }

    #[test]
    fn fetch_batches_per_group_and_is_idempotent() {
        let (mut cache, hv) = cache();
        hv.set_register(0, Register::Rbx, 0x1234);
        hv.set_register(0, Register::Cr3, 0x9000);
        cache
            .fetch(RegisterSet::RBX | RegisterSet::RCX | RegisterSet::CR3)
            .unwrap();
        assert_eq!(cache.rbx().unwrap(), 0x1234);
        assert_eq!(cache.cr3().unwrap(), 0x9000);
        assert_eq!(hv.trace(0).read_calls.len(), 2);

        // Overlapping request: only RDX is missing.
        cache.fetch(RegisterSet::RBX | RegisterSet::RDX).unwrap();
        let trace = hv.trace(0);
        assert_eq!(trace.read_calls.len(), 3);
        assert_eq!(trace.read_calls[2], vec![Register::Rdx]);
    }

    #[test]
    fn flush_writes_once_per_dirty_group() {
        let (mut cache, hv) = cache();
        cache.set_rax(1).unwrap();
        cache.set_rbx(2).unwrap();
        cache.set_cr0(Cr0::PE | Cr0::NE).unwrap();
        assert_eq!(cache.dirty(), RegisterSet::RAX | RegisterSet::RBX | RegisterSet::CR0);
        cache.flush().unwrap();
        assert!(cache.dirty().is_empty());

        let trace = hv.trace(0);
        assert_eq!(trace.write_calls.len(), 2);
        assert_eq!(
            trace.write_calls[0],
            vec![(Register::Rax, 1), (Register::Rbx, 2)]
        );
        assert_eq!(hv.register(0, Register::Cr0), (Cr0::PE | Cr0::NE).bits());

        // Nothing dirty, nothing written.
        cache.flush().unwrap();
        assert_eq!(hv.trace(0).write_calls.len(), 2);
    }

    #[test]
    fn narrow_write_needs_the_full_register() {
        let (mut cache, hv) = cache();
        assert!(matches!(
            cache.set_al(0x12),
            Err(VmmError::UnfetchedRegister(_))
        ));
        hv.set_register(0, Register::Rax, 0xdead_beef);
        cache.fetch(RegisterSet::RAX).unwrap();
        cache.set_al(0x12).unwrap();
        cache.set_ah(0x34).unwrap();
        assert_eq!(cache.rax().unwrap(), 0xdead_3412);
        assert_eq!(cache.ax().unwrap(), 0x3412);
        assert_eq!(cache.ah().unwrap(), 0x34);
    }

    #[test]
    fn invalidate_forgets_and_freeze_keeps() {
        let (mut cache, hv) = cache();
        hv.set_register(0, Register::Rip, 0xfff0);
        cache.fetch(RegisterSet::RIP).unwrap();
        cache.invalidate();
        assert!(cache.rip().is_err());

        let backend = cache.freeze().unwrap();
        assert!(backend.is_some());
        assert!(cache.is_frozen());
        assert_eq!(cache.rip().unwrap(), 0xfff0);
        assert_eq!(cache.fetched(), RegisterSet::ALL);
        cache.invalidate();
        assert_eq!(cache.rip().unwrap(), 0xfff0);
        assert!(matches!(cache.set_rip(0), Err(VmmError::RegisterCacheFrozen)));
        assert!(cache.fetch(RegisterSet::ALL).is_ok());
    }

    #[test]
    fn segment_round_trip() {
        let (mut cache, _hv) = cache();
        let cs = SegmentRegister::real_mode(0xf000, AccessRights::P | AccessRights::S);
        cache.set_segment(Segment::Cs, cs).unwrap();
        assert_eq!(cache.segment(Segment::Cs).unwrap(), cs);
        assert_eq!(cs.base, 0xf0000);
    }

    proptest! {
        #[test]
        fn fetch_returns_backend_values(values in proptest::collection::vec(any::<u64>(), REGISTER_COUNT)) {
            let (mut cache, hv) = cache();
            for (reg, v) in Register::ALL.iter().zip(&values) {
                hv.set_register(0, *reg, *v);
            }
            let regs = cache.fetch(RegisterSet::ALL).unwrap();
            for (reg, v) in Register::ALL.iter().zip(&values) {
                prop_assert_eq!(regs.get(*reg).unwrap(), *v);
            }
        }
    }
}
