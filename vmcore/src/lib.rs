//! A virtual machine monitor core.
//!
//! `vmcore` drives virtual CPUs on top of a hardware virtualization extension and hands the
//! embedding device model a portable, typed description of every VM-exit. The hypervisor itself
//! is reached through a narrow interface ([`backend::HypervisorBackend`]); everything above it is
//! written once:
//!
//! - [`memory`]: the guest-physical memory map, with per-page dirty tracking.
//! - [`registers`]: a write-back cache over the backend's register API.
//! - [`vmexits`]: the classifier turning raw exit records into [`vmexits::VmExit`] values.
//! - [`emulator`]: a small instruction emulator that completes MMIO loads and stores.
//! - [`vcpu`]: the per-vCPU state machine and run loop, one OS thread per vCPU.
//! - [`vm`]: the virtual machine lifecycle.
//!
//! ## Lifecycle
//! ```text
//! VirtualMachine::new ─► add_memory ─► add_vcpu ─► set handlers ─► start ─► ... ─► shutdown
//! ```
//!
//! Each vCPU thread runs
//! ```text
//! Setup ─► WaitingToStart ─► Running ⇄ (internally resolved exit) ─► ShuttingDown ─► Shutdown
//! ```
//! and every iteration of `Running` does: inject pending interrupt, flush dirty registers,
//! VM-entry, invalidate the register cache, classify the exit, then either resolve it
//! internally or pass it to the caller's handler.
//!
//! ## Errors
//! Every failure is a returned [`VmmError`]. The library never terminates the process; the
//! embedding application decides whether an [`ErrorKind::Unrecognized`] failure is fatal.

pub mod backend;
pub mod emulator;
pub mod memory;
pub mod probe;
pub mod registers;
pub mod vcpu;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;
pub mod x86;

pub use backend::{BackendError, HypervisorBackend, VcpuBackend};
pub use emulator::{InstructionEmulator, MmioHandler};
pub use memory::{Gpa, MemoryRegion, MemoryRegionTable};
pub use probe::Probe;
pub use registers::{Register, RegisterCache, RegisterSet, Registers};
pub use vcpu::{
    InjectedInterrupt, InterruptKind, VCpu, VcpuContext, VcpuOutcome, VcpuStatus, VmExitHandler,
};
pub use vm::{VirtualMachine, VmBuilder};
pub use vm_control::Capabilities;
pub use vmexits::{DataRead, DataWrite, VmExit};

/// Size of a guest page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Broad category of a [`VmmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// VM, vCPU or memory creation failed.
    Setup,
    /// The hypervisor backend failed a register, field or entry operation.
    Backend,
    /// The embedding application broke the API contract.
    Contract,
    /// The hardware reported something this core has no case for.
    Unrecognized,
    /// A vCPU did not reach `Shutdown` in time.
    Shutdown,
    /// A device model (exit or MMIO handler) failed.
    Device,
}

/// Possible errors of the monitor.
#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    /// The backend reported a failure.
    #[error("hypervisor backend failure")]
    Backend(#[from] BackendError),
    /// A memory region is empty, not page aligned, or a span does not lie in one region.
    #[error("invalid memory region at {gpa} (size {size:#x})")]
    InvalidMemoryRegion { gpa: Gpa, size: u64 },
    /// A new memory region overlaps an existing one.
    #[error("memory region at {gpa} (size {size:#x}) overlaps an existing region")]
    OverlappingMemoryRegion { gpa: Gpa, size: u64 },
    /// Host memory for a region could not be allocated.
    #[error("cannot allocate {size:#x} bytes of host memory for the region at {gpa}")]
    OutOfMemory { gpa: Gpa, size: u64 },
    /// The backend refuses more vCPUs.
    #[error("vcpu limit of {0} reached")]
    TooManyVcpus(usize),
    /// A register was read (or partially written) before being fetched.
    #[error("register(s) {0:?} read before being fetched")]
    UnfetchedRegister(RegisterSet),
    /// A register was written after the vCPU shut down.
    #[error("register cache is frozen")]
    RegisterCacheFrozen,
    /// `set_in` was called outside of an input exit, or the input was already answered.
    #[error("no input access is waiting for data")]
    NoPendingRead,
    /// `start` was called in a state other than `WaitingToStart`.
    #[error("vcpu is not waiting to start (status {0:?})")]
    NotWaitingToStart(VcpuStatus),
    /// An exit reason this core has no case for.
    #[error("unsupported vm exit reason {0:#x}")]
    UnsupportedExit(u32),
    /// An instruction the emulator cannot decode.
    #[error("unsupported instruction at rip {rip:#x}: {bytes:02x?}")]
    UnsupportedInstruction { rip: u64, bytes: Vec<u8> },
    /// Guest linear addresses can only be translated in real mode.
    #[error("guest address translation outside of real mode is not implemented")]
    UnsupportedAddressTranslation,
    /// The guest-entry state failed validation.
    #[error("invalid guest state: {0}")]
    InvalidGuestState(&'static str),
    /// A vCPU did not reach `Shutdown` within the configured timeout.
    #[error("vcpu did not shut down in time")]
    ShutdownTimedOut,
    /// The vCPU thread could not be spawned.
    #[error("failed to spawn vcpu thread")]
    Thread(#[source] std::io::Error),
    /// A handler reported a device-model failure.
    #[error("device error: {0}")]
    Device(String),
}

impl VmmError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(_) => ErrorKind::Backend,
            Self::InvalidMemoryRegion { .. }
            | Self::OverlappingMemoryRegion { .. }
            | Self::NoPendingRead
            | Self::UnfetchedRegister(_)
            | Self::RegisterCacheFrozen
            | Self::NotWaitingToStart(_) => ErrorKind::Contract,
            Self::UnsupportedExit(_)
            | Self::UnsupportedInstruction { .. }
            | Self::UnsupportedAddressTranslation
            | Self::InvalidGuestState(_) => ErrorKind::Unrecognized,
            Self::TooManyVcpus(_) | Self::OutOfMemory { .. } | Self::Thread(_) => {
                ErrorKind::Setup
            }
            Self::Device(_) => ErrorKind::Device,
            Self::ShutdownTimedOut => ErrorKind::Shutdown,
        }
    }
}
