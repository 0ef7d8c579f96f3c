//! The hypervisor interface.
//!
//! A backend wraps one platform hypervisor API. The monitor needs surprisingly little from it:
//! create and destroy the VM, map guest memory, create vCPUs, move register values, and run a vCPU
//! until the next exit. Backends come in two flavors, distinguished by what [`VcpuBackend::run_once`]
//! returns:
//!
//! - control-field backends expose raw VT-x exit records ([`RawExit::Vmx`]) and VMCS fields; the
//!   monitor decodes everything itself.
//! - decoding backends report exits already decoded by the platform ([`RawExit::Decoded`]).
use crate::{
    memory::Gpa,
    registers::Register,
    vcpu::InjectedInterrupt,
    vm_control::{Capabilities, VmcsProcBasedVmexecCtl},
    vmcs::{Field, InterruptionInfo, VmxExitRecord},
    vmexits::{DataRead, DataWrite},
};

pub mod mock;

/// Errors reported by a hypervisor backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A platform call failed.
    #[error("{op} failed with status {code:#x}")]
    Call { op: &'static str, code: i64 },
    /// The operation is not available on this backend.
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    /// The VM or vCPU was already destroyed.
    #[error("backend object already destroyed")]
    Destroyed,
}

bitflags::bitflags! {
    /// Guest access rights of a guest-physical range.
    pub struct MemoryPermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Guest-physical memory management of a backend.
///
/// Split from [`HypervisorBackend`] so memory regions can unmap themselves through a trait object.
pub trait MemoryBackend: Send + Sync {
    /// Map `size` bytes of host memory at `host` into the guest at `gpa`.
    ///
    /// # Safety
    /// `host` must stay valid for reads and writes of `size` bytes until the range is unmapped.
    unsafe fn map_memory(
        &self,
        gpa: Gpa,
        host: *mut u8,
        size: u64,
        perms: MemoryPermissions,
    ) -> Result<(), BackendError>;

    /// Remove a mapping created by [`MemoryBackend::map_memory`].
    fn unmap_memory(&self, gpa: Gpa, size: u64) -> Result<(), BackendError>;

    /// Change the permissions of a mapped range.
    fn protect_memory(
        &self,
        _gpa: Gpa,
        _size: u64,
        _perms: MemoryPermissions,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("protect_memory"))
    }
}

/// A hypervisor able to run one VM.
pub trait HypervisorBackend: MemoryBackend + 'static {
    /// The per-vCPU handle. It never leaves the thread that created it.
    type Vcpu: VcpuBackend;

    /// What this backend can do. Queried once per VM.
    fn capabilities(&self) -> Result<Capabilities, BackendError>;

    /// Create the VM. Called once, before any other VM operation.
    fn create_vm(&self) -> Result<(), BackendError>;

    /// Destroy the VM. Must tolerate being called more than once.
    fn destroy_vm(&self) -> Result<(), BackendError>;

    /// Create a vCPU bound to the calling thread.
    fn create_vcpu(&self) -> Result<Self::Vcpu, BackendError>;
}

/// One vCPU of a [`HypervisorBackend`].
pub trait VcpuBackend: 'static {
    /// Read one register.
    fn read_register(&mut self, reg: Register) -> Result<u64, BackendError>;

    /// Write one register.
    fn write_register(&mut self, reg: Register, value: u64) -> Result<(), BackendError>;

    /// Read several registers of the same group at once.
    ///
    /// The register cache issues exactly one call per group; override this when the platform has
    /// a bulk accessor.
    fn read_registers(&mut self, regs: &[Register], values: &mut [u64]) -> Result<(), BackendError> {
        for (reg, v) in regs.iter().zip(values.iter_mut()) {
            *v = self.read_register(*reg)?;
        }
        Ok(())
    }

    /// Write several registers of the same group at once.
    fn write_registers(&mut self, values: &[(Register, u64)]) -> Result<(), BackendError> {
        for (reg, v) in values {
            self.write_register(*reg, *v)?;
        }
        Ok(())
    }

    /// Read a VMCS field.
    fn read_field(&mut self, _field: Field) -> Result<u64, BackendError> {
        Err(BackendError::Unsupported("read_field"))
    }

    /// Write a VMCS field.
    fn write_field(&mut self, _field: Field, _value: u64) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("write_field"))
    }

    /// Enter the guest and run until the next VM-exit.
    fn run_once(&mut self) -> Result<RawExit, BackendError>;

    /// Arrange for `irq` to be delivered on the next VM-entry.
    fn inject_interrupt(&mut self, irq: InjectedInterrupt) -> Result<(), BackendError> {
        let info = InterruptionInfo::from(irq);
        if info.error_code_valid {
            self.write_field(Field::VmentryExceptionErrCode, irq.error_code as u64)?;
        }
        self.write_field(Field::VmentryInterruptionInfo, info.encode() as u64)
    }

    /// Request (or stop requesting) an exit as soon as the guest can take an interrupt.
    fn set_interrupt_window(&mut self, enabled: bool) -> Result<(), BackendError> {
        let mut ctl = VmcsProcBasedVmexecCtl::from_bits_truncate(
            self.read_field(Field::ProcessorBasedVmexecControls)? as u32,
        );
        ctl.set(VmcsProcBasedVmexecCtl::INTRWINEXIT, enabled);
        self.write_field(Field::ProcessorBasedVmexecControls, ctl.bits() as u64)
    }

    /// Hand the result of an I/O or MMIO read back to a decoding backend.
    fn complete_read(&mut self, _data: DataWrite) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("complete_read"))
    }

    /// Destroy the vCPU.
    fn destroy(self) -> Result<(), BackendError>
    where
        Self: Sized;
}

/// The result of one [`VcpuBackend::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawExit {
    /// A VT-x exit record.
    Vmx(VmxExitRecord),
    /// An exit the platform already decoded.
    Decoded(DecodedExit),
}

/// Exits reported by decoding backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedExit {
    /// Port input; complete with [`VcpuBackend::complete_read`].
    IoIn { port: u16, width: DataRead },
    /// Port output.
    IoOut { port: u16, data: DataWrite },
    /// Load from an unmapped guest-physical address; complete with
    /// [`VcpuBackend::complete_read`].
    MmioRead { gpa: Gpa, width: DataRead },
    /// Store to an unmapped guest-physical address.
    MmioWrite { gpa: Gpa, data: DataWrite },
    /// HLT, with RIP already past the instruction.
    Hlt,
    /// The guest shut down, e.g. on a triple fault.
    Shutdown,
    /// The VM-entry failed.
    FailEntry { reason: u64 },
    /// The run was interrupted by the host.
    Interrupted,
    /// The guest can take an interrupt now.
    IrqWindowOpen,
    /// A platform-specific system event.
    SystemEvent { kind: u32 },
    /// A guest exception intercepted by the platform.
    Exception { vector: u8, error_code: Option<u32> },
    /// Anything else; the platform's raw reason code.
    Unknown(u32),
}
