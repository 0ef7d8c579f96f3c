//! Virtual CPU.
//!
//! Every vCPU runs on a dedicated OS thread, created by [`VirtualMachine::add_vcpu`]. The thread
//! creates the backend vCPU, puts it in the architectural reset state, validates that state and
//! parks until [`VCpu::start`]:
//!
//! ```text
//! Setup ─► WaitingToStart ─► Running ─► ShuttingDown ─► Shutdown
//!                  └──────────────────────────┘ (shutdown before start)
//! ```
//!
//! While `Running`, each loop iteration injects the pending interrupt (or asks for an interrupt
//! window), flushes dirty registers, enters the guest, invalidates the register cache and
//! classifies the exit. Exits the monitor can resolve by itself never reach the caller's
//! [`VmExitHandler`].
//!
//! The only state shared with other threads is the status, the pending-interrupt slot and the
//! shutdown flag. Shutdown is honored between two VM-entries; a guest that never exits keeps its
//! vCPU thread busy.
//!
//! [`VirtualMachine::add_vcpu`]: crate::VirtualMachine::add_vcpu
use crate::{
    backend::{BackendError, HypervisorBackend, MemoryPermissions, VcpuBackend},
    emulator::{InstructionEmulator, MmioHandler},
    memory::MemoryRegionTable,
    probe::Probe,
    registers::{
        DescriptorTable, Register, RegisterCache, RegisterSet, Registers, Segment, SegmentRegister,
    },
    vm_control::{
        Capabilities, VmcsEntryCtl, VmcsExitCtl, VmcsPinBasedVmexecCtl,
        VmcsProcBasedSecondaryVmexecCtl, VmcsProcBasedVmexecCtl, VmxCapabilities,
    },
    vmcs::{validate_guest_state, Field, InterruptionInfo, InterruptionType},
    vmexits::{classify, Classified, DataRead, DataWrite, PendingRead, VmExit},
    x86::{vector, AccessRights, Cr0, Cr4, Rflags},
    VmmError,
};
use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Lifecycle state of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuStatus {
    /// The thread is creating and initializing the backend vCPU.
    Setup,
    /// Initialized; parked until started.
    WaitingToStart,
    /// Running the guest.
    Running,
    /// Leaving the run loop and tearing the backend vCPU down.
    ShuttingDown,
    /// The backend vCPU is destroyed and the registers are frozen.
    Shutdown,
}

/// Kind of an injected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// A maskable external interrupt, delivered only while RFLAGS.IF is set.
    External,
    /// A non-maskable interrupt.
    Nmi,
    /// A hardware exception.
    HardwareException,
}

/// An event to deliver on the next VM-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedInterrupt {
    pub vector: u8,
    pub kind: InterruptKind,
    pub deliver_error_code: bool,
    /// Pushed when `deliver_error_code` is set.
    pub error_code: u32,
}

impl InjectedInterrupt {
    /// A maskable interrupt.
    pub const fn external(vector: u8) -> Self {
        Self {
            vector,
            kind: InterruptKind::External,
            deliver_error_code: false,
            error_code: 0,
        }
    }

    /// A non-maskable interrupt.
    pub const fn nmi() -> Self {
        Self {
            vector: vector::NMI,
            kind: InterruptKind::Nmi,
            deliver_error_code: false,
            error_code: 0,
        }
    }

    /// A hardware exception, with its error code if the vector has one.
    pub const fn exception(vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            kind: InterruptKind::HardwareException,
            deliver_error_code: error_code.is_some(),
            error_code: match error_code {
                Some(code) => code,
                None => 0,
            },
        }
    }

    /// Whether RFLAGS.IF gates delivery.
    #[inline]
    pub const fn maskable(&self) -> bool {
        matches!(self.kind, InterruptKind::External)
    }
}

impl From<InjectedInterrupt> for InterruptionInfo {
    fn from(irq: InjectedInterrupt) -> Self {
        Self {
            vector: irq.vector,
            interruption_type: match irq.kind {
                InterruptKind::External => InterruptionType::ExternalInt,
                InterruptKind::Nmi => InterruptionType::Nmi,
                InterruptKind::HardwareException => InterruptionType::HardwareException,
            },
            error_code_valid: irq.deliver_error_code,
        }
    }
}

/// Handles the exits the monitor does not resolve by itself.
///
/// Returns `true` to stop the vCPU. An error stops it as well and is reported through the
/// [`VcpuOutcome`].
pub type VmExitHandler<B> =
    Box<dyn FnMut(&mut VcpuContext<B>, VmExit) -> Result<bool, VmmError> + Send>;

/// Called once on the vCPU thread after the backend vCPU is destroyed.
pub type CompletionHandler = Box<dyn FnOnce(&VcpuOutcome) + Send>;

/// How a vCPU thread ended.
#[derive(Debug)]
pub struct VcpuOutcome {
    pub id: usize,
    /// Number of VM-exits taken, internally resolved ones included.
    pub exit_count: u64,
    /// Every register at the time of shutdown, unless they could not be read back.
    pub registers: Option<Registers>,
    /// Why the vCPU stopped, if not on request.
    pub error: Option<VmmError>,
}

/// Per-vCPU settings, from the [`VmBuilder`](crate::VmBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct VcpuConfig {
    pub exception_bitmap: u32,
    pub shutdown_timeout: Duration,
}

struct Handlers<B: HypervisorBackend> {
    exit: Option<VmExitHandler<B>>,
    completion: Option<CompletionHandler>,
    mmio: Option<Box<dyn MmioHandler>>,
}

impl<B: HypervisorBackend> Default for Handlers<B> {
    fn default() -> Self {
        Self {
            exit: None,
            completion: None,
            mmio: None,
        }
    }
}

struct State<B: HypervisorBackend> {
    status: VcpuStatus,
    pending_irq: Option<InjectedInterrupt>,
    handlers: Handlers<B>,
    final_registers: Option<Registers>,
    error: Option<VmmError>,
}

struct Shared<B: HypervisorBackend> {
    id: usize,
    state: Mutex<State<B>>,
    changed: Condvar,
    shutdown_requested: AtomicBool,
    unparker: Unparker,
    exit_count: AtomicU64,
}

impl<B: HypervisorBackend> Shared<B> {
    fn status(&self) -> VcpuStatus {
        self.state.lock().status
    }

    fn set_status(&self, status: VcpuStatus) {
        self.state.lock().status = status;
        self.changed.notify_all();
        tracing::debug!(?status, "vcpu status changed");
    }

    fn take_handlers(&self) -> Handlers<B> {
        core::mem::take(&mut self.state.lock().handlers)
    }

    fn finish(&self, mut outcome: VcpuOutcome, completion: Option<CompletionHandler>) {
        if let Some(completion) = completion {
            completion(&outcome);
        }
        let mut state = self.state.lock();
        state.final_registers = outcome.registers.take();
        state.error = outcome.error.take();
        state.status = VcpuStatus::Shutdown;
        drop(state);
        self.changed.notify_all();
        tracing::debug!(exits = outcome.exit_count, "vcpu shut down");
    }
}

/// A virtual CPU, as seen by the thread owning the [`VirtualMachine`](crate::VirtualMachine).
pub struct VCpu<B: HypervisorBackend> {
    shared: Arc<Shared<B>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl<B: HypervisorBackend> VCpu<B> {
    /// Spawn the vCPU thread and wait until it is ready to start.
    ///
    /// Fails with the setup error if the backend vCPU could not be created or initialized.
    pub(crate) fn spawn(
        id: usize,
        backend: Arc<B>,
        memory: Arc<RwLock<MemoryRegionTable>>,
        caps: Capabilities,
        config: VcpuConfig,
    ) -> Result<Self, VmmError> {
        let parker = Parker::new();
        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(State {
                status: VcpuStatus::Setup,
                pending_irq: None,
                handlers: Handlers::default(),
                final_registers: None,
                error: None,
            }),
            changed: Condvar::new(),
            shutdown_requested: AtomicBool::new(false),
            unparker: parker.unparker().clone(),
            exit_count: AtomicU64::new(0),
        });
        let handle = thread::Builder::new()
            .name(format!("vcpu#{id}"))
            .spawn({
                let shared = shared.clone();
                move || vcpu_thread_work(shared, parker, backend, memory, caps, config)
            })
            .map_err(VmmError::Thread)?;

        let mut state = shared.state.lock();
        while state.status == VcpuStatus::Setup {
            shared.changed.wait(&mut state);
        }
        if state.status != VcpuStatus::WaitingToStart {
            let error = state.error.take();
            drop(state);
            if handle.join().is_err() {
                tracing::warn!(id, "vcpu thread panicked during setup");
            }
            return Err(error.unwrap_or(VmmError::NotWaitingToStart(VcpuStatus::Shutdown)));
        }
        drop(state);

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Index of this vCPU in its VM.
    #[inline]
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> VcpuStatus {
        self.shared.status()
    }

    /// Number of VM-exits taken so far.
    pub fn exit_count(&self) -> u64 {
        self.shared.exit_count.load(Ordering::Relaxed)
    }

    fn with_handlers(&self, f: impl FnOnce(&mut Handlers<B>)) -> Result<(), VmmError> {
        let mut state = self.shared.state.lock();
        if state.status != VcpuStatus::WaitingToStart {
            return Err(VmmError::NotWaitingToStart(state.status));
        }
        f(&mut state.handlers);
        Ok(())
    }

    /// Install the exit handler. Only before [`VCpu::start`].
    ///
    /// Without one, the first exit not resolved internally stops the vCPU.
    pub fn set_vm_exit_handler(
        &self,
        handler: impl FnMut(&mut VcpuContext<B>, VmExit) -> Result<bool, VmmError> + Send + 'static,
    ) -> Result<(), VmmError> {
        self.with_handlers(|h| h.exit = Some(Box::new(handler)))
    }

    /// Install the completion handler. Only before [`VCpu::start`].
    pub fn set_completion_handler(
        &self,
        handler: impl FnOnce(&VcpuOutcome) + Send + 'static,
    ) -> Result<(), VmmError> {
        self.with_handlers(|h| h.completion = Some(Box::new(handler)))
    }

    /// Install the device model completing MMIO accesses. Only before [`VCpu::start`].
    ///
    /// Without one, accesses outside guest RAM surface as [`VmExit::MemoryViolation`], or as
    /// [`VmExit::MmioRead`]/[`VmExit::MmioWrite`] on decoding backends.
    pub fn set_mmio_handler(&self, handler: impl MmioHandler + 'static) -> Result<(), VmmError> {
        self.with_handlers(|h| h.mmio = Some(Box::new(handler)))
    }

    /// Let the vCPU run.
    pub fn start(&self) -> Result<(), VmmError> {
        let mut state = self.shared.state.lock();
        if state.status != VcpuStatus::WaitingToStart
            || self.shared.shutdown_requested.load(Ordering::Acquire)
        {
            return Err(VmmError::NotWaitingToStart(state.status));
        }
        state.status = VcpuStatus::Running;
        drop(state);
        self.shared.changed.notify_all();
        self.shared.unparker.unpark();
        Ok(())
    }

    /// Stop the vCPU and wait until it reaches [`VcpuStatus::Shutdown`].
    ///
    /// Idempotent. Fails with [`VmmError::ShutdownTimedOut`] if the vCPU does not get there
    /// within the configured timeout; it still stops at its next VM-exit.
    pub fn shutdown(&self) -> Result<(), VmmError> {
        self.shared.shutdown_requested.store(true, Ordering::Release);
        self.shared.unparker.unpark();

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut state = self.shared.state.lock();
        while state.status != VcpuStatus::Shutdown {
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.status != VcpuStatus::Shutdown
            {
                tracing::warn!(id = self.id(), status = ?state.status, "vcpu shutdown timed out");
                return Err(VmmError::ShutdownTimedOut);
            }
        }
        drop(state);

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(id = self.id(), "vcpu thread panicked");
            }
        }
        Ok(())
    }

    /// Set the pending interrupt, replacing any interrupt queued earlier.
    pub fn queue(&self, irq: InjectedInterrupt) {
        queue_irq(&self.shared, irq);
    }

    /// Drop the pending interrupt, if any.
    pub fn clear_pending_irq(&self) {
        self.shared.state.lock().pending_irq = None;
    }

    /// The interrupt waiting for injection.
    pub fn pending_irq(&self) -> Option<InjectedInterrupt> {
        self.shared.state.lock().pending_irq
    }

    /// Registers at the time of shutdown.
    pub fn final_registers(&self) -> Option<Registers> {
        self.shared.state.lock().final_registers.clone()
    }

    /// Registers in `set`, once the vCPU is shut down.
    pub fn read_registers(&self, set: RegisterSet) -> Result<Registers, VmmError> {
        let regs = self
            .final_registers()
            .ok_or(VmmError::UnfetchedRegister(set))?;
        regs.require(set)?;
        Ok(regs)
    }

    /// The error that stopped the vCPU, if any. Taken once.
    pub fn take_error(&self) -> Option<VmmError> {
        self.shared.state.lock().error.take()
    }
}

impl<B: HypervisorBackend> Drop for VCpu<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(id = self.id(), error = %e, "dropping a vcpu that is still running");
        }
    }
}

fn queue_irq<B: HypervisorBackend>(shared: &Shared<B>, irq: InjectedInterrupt) {
    if let Some(old) = shared.state.lock().pending_irq.replace(irq) {
        tracing::debug!(old = old.vector, new = irq.vector, "pending interrupt replaced");
    }
}

/// The vCPU as seen from its own thread, handed to the [`VmExitHandler`].
pub struct VcpuContext<B: HypervisorBackend> {
    id: usize,
    registers: RegisterCache<B::Vcpu>,
    memory: Arc<RwLock<MemoryRegionTable>>,
    shared: Arc<Shared<B>>,
    pending_read: Option<PendingRead>,
    mmio: Option<Box<dyn MmioHandler>>,
    window_requested: bool,
}

impl<B: HypervisorBackend> VcpuContext<B> {
    /// Index of this vCPU in its VM.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The register cache. Writes are flushed before the next VM-entry.
    #[inline]
    pub fn registers(&mut self) -> &mut RegisterCache<B::Vcpu> {
        &mut self.registers
    }

    /// Make `set` readable and return the registers.
    pub fn fetch(&mut self, set: RegisterSet) -> Result<&Registers, VmmError> {
        self.registers.fetch(set)
    }

    /// Guest memory.
    pub fn memory(&self) -> RwLockReadGuard<'_, MemoryRegionTable> {
        self.memory.read()
    }

    /// Answer the current [`VmExit::IoIn`] or [`VmExit::MmioRead`].
    ///
    /// `data` is truncated or zero extended to the width of the access.
    pub fn set_in(&mut self, data: DataWrite) -> Result<(), VmmError> {
        let pending = self.pending_read.take().ok_or(VmmError::NoPendingRead)?;
        self.complete_read(pending, data)
    }

    /// Set the pending interrupt, replacing any interrupt queued earlier.
    pub fn queue(&self, irq: InjectedInterrupt) {
        queue_irq(&self.shared, irq);
    }

    /// Leave the run loop after the current exit.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
    }

    fn setup(
        shared: Arc<Shared<B>>,
        backend: &B,
        memory: Arc<RwLock<MemoryRegionTable>>,
        caps: &Capabilities,
        config: &VcpuConfig,
    ) -> Result<Self, VmmError> {
        let vcpu = backend.create_vcpu()?;
        let mut ctx = Self {
            id: shared.id,
            registers: RegisterCache::new(vcpu),
            memory,
            shared,
            pending_read: None,
            mmio: None,
            window_requested: false,
        };
        if let Err(e) = ctx.initialize(caps, config) {
            if let Some(vcpu) = ctx.registers.detach() {
                if let Err(destroy) = vcpu.destroy() {
                    tracing::warn!(error = %destroy, "failed to destroy vcpu after setup error");
                }
            }
            return Err(e);
        }
        Ok(ctx)
    }

    fn initialize(&mut self, caps: &Capabilities, config: &VcpuConfig) -> Result<(), VmmError> {
        if let Some(vmx) = &caps.vmx {
            self.program_controls(vmx, config)?;
        }
        self.reset_registers(caps)?;
        self.registers.flush()?;
        validate_guest_state(self.registers.fetch(RegisterSet::ALL)?, caps)
    }

    // Every control is `(wanted | must-be-one) & may-be-one`, from the capability MSRs.
    fn program_controls(&mut self, vmx: &VmxCapabilities, config: &VcpuConfig) -> Result<(), VmmError> {
        let pin = vmx.pinbased.adjust(
            (VmcsPinBasedVmexecCtl::EXTERNAL_INTERRUPT_EXITING | VmcsPinBasedVmexecCtl::NMI_EXITING)
                .bits(),
        );
        let mut wanted = VmcsProcBasedVmexecCtl::HLT_EXITING | VmcsProcBasedVmexecCtl::UNCONDIOEXIT;
        if vmx
            .procbased
            .supports(VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits())
        {
            wanted |= VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL;
        }
        let proc = vmx.procbased.adjust(wanted.bits());
        let mut wanted2 = VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT;
        if vmx.unrestricted_guest() {
            wanted2 |= VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST;
        }
        let proc2 = vmx.procbased2.adjust(wanted2.bits());
        let exit = vmx.exit.adjust(
            (VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE
                | VmcsExitCtl::SAVE_IA32_EFER
                | VmcsExitCtl::LOAD_IA32_EFER)
                .bits(),
        );
        let entry = vmx.entry.adjust(VmcsEntryCtl::LOAD_IA32_EFER.bits());
        tracing::debug!(
            pin,
            proc,
            proc2,
            exit,
            entry,
            "programming vm-execution controls"
        );

        let vcpu = self.registers.backend_mut()?;
        vcpu.write_field(Field::PinBasedExecControls, pin as u64)?;
        vcpu.write_field(Field::ProcessorBasedVmexecControls, proc as u64)?;
        if proc & VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL.bits() != 0 {
            vcpu.write_field(Field::SecondaryVmexecControls, proc2 as u64)?;
        }
        vcpu.write_field(Field::VmexitControls, exit as u64)?;
        vcpu.write_field(Field::VmentryControls, entry as u64)?;
        vcpu.write_field(Field::ExceptionBitmap, config.exception_bitmap as u64)?;
        vcpu.write_field(Field::GuestLinkPointer, u64::MAX)?;
        vcpu.write_field(Field::GuestActivityState, 0)?;
        vcpu.write_field(Field::GuestInterruptibilityState, 0)?;
        vcpu.write_field(Field::GuestIa32Efer, 0)?;
        Ok(())
    }

    // Power-on state, executing the reset vector at f000:fff0 in real mode.
    fn reset_registers(&mut self, caps: &Capabilities) -> Result<(), VmmError> {
        let code = AccessRights::P
            | AccessRights::S
            | AccessRights::CODE
            | AccessRights::WR
            | AccessRights::A;
        let data = AccessRights::P | AccessRights::S | AccessRights::WR | AccessRights::A;

        let mut cr0 = Cr0::ET | Cr0::NE;
        let mut cr4 = Cr4::empty();
        if let Some(vmx) = &caps.vmx {
            // PE and PG stay clear; without unrestricted guests validation rejects this state.
            let fixed0 = vmx.cr0_fixed0 & !(Cr0::PE | Cr0::PG).bits();
            cr0 = Cr0::from_bits_truncate((cr0.bits() | fixed0) & vmx.cr0_fixed1);
            cr4 = Cr4::from_bits_truncate((Cr4::VMXE.bits() | vmx.cr4_fixed0) & vmx.cr4_fixed1);
        }

        let regs = &mut self.registers;
        for reg in &Register::ALL[..Register::Rip as usize] {
            regs.set(*reg, 0)?;
        }
        regs.set_rip(0xfff0)?;
        regs.set_rflags(Rflags::_1)?;
        regs.set_cr0(cr0)?;
        regs.set_cr2(0)?;
        regs.set_cr3(0)?;
        regs.set_cr4(cr4)?;
        regs.set(Register::Efer, 0)?;
        regs.set_segment(Segment::Cs, SegmentRegister::real_mode(0xf000, code))?;
        for seg in [Segment::Ds, Segment::Es, Segment::Fs, Segment::Gs, Segment::Ss] {
            regs.set_segment(seg, SegmentRegister::real_mode(0, data))?;
        }
        regs.set_segment(
            Segment::Tr,
            SegmentRegister::real_mode(0, AccessRights::P | AccessRights::from_bits_truncate(11)),
        )?;
        regs.set_segment(
            Segment::Ldtr,
            SegmentRegister::real_mode(0, AccessRights::P | AccessRights::from_bits_truncate(2)),
        )?;
        let table = DescriptorTable {
            base: 0,
            limit: 0xffff,
        };
        regs.set_gdtr(table)?;
        regs.set_idtr(table)
    }

    fn run(&mut self, mut handler: Option<VmExitHandler<B>>) -> Result<(), VmmError> {
        if self.memory.read().is_empty() {
            tracing::warn!("starting a vcpu without any guest memory");
        }
        loop {
            if self.shared.shutdown_requested.load(Ordering::Acquire) {
                tracing::debug!("shutdown requested");
                return Ok(());
            }
            self.inject_pending_interrupt()?;
            self.registers.flush()?;
            let raw = self.registers.backend_mut()?.run_once()?;
            self.registers.invalidate();
            self.shared.exit_count.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(?raw, "vm exit");

            let classified = {
                let memory = self.memory.read();
                classify(raw, &mut self.registers, &memory)?
            };
            let (exit, pending) = match classified {
                Classified::Resolved(resolution) => {
                    tracing::trace!(?resolution, "exit resolved");
                    continue;
                }
                Classified::Mmio { gpa, gla, access } => match self.mmio.as_mut() {
                    Some(mmio) => {
                        let memory = self.memory.read();
                        InstructionEmulator::emulate(&mut self.registers, &*memory, gpa, &mut **mmio)?;
                        continue;
                    }
                    None => (
                        VmExit::MemoryViolation {
                            access,
                            perms: MemoryPermissions::empty(),
                            gpa,
                            gla,
                        },
                        None,
                    ),
                },
                Classified::Exit { exit, pending } => (exit, pending),
            };
            if self.resolve_internally(&exit, pending)? {
                continue;
            }

            self.pending_read = pending;
            let stop = match handler.as_mut() {
                Some(handler) => handler(self, exit)?,
                None => {
                    tracing::debug!(?exit, "no exit handler installed");
                    true
                }
            };
            if let Some(pending) = self.pending_read.take() {
                // Nobody answered: an unclaimed bus reads all ones.
                self.complete_read(pending, DataWrite::new(pending.width(), u64::MAX))?;
            }
            if stop {
                return Ok(());
            }
        }
    }

    fn resolve_internally(
        &mut self,
        exit: &VmExit,
        pending: Option<PendingRead>,
    ) -> Result<bool, VmmError> {
        match *exit {
            VmExit::Interrupt => Ok(true),
            VmExit::IrqWindowOpen if self.window_requested => Ok(true),
            VmExit::Halt => self.irq_deliverable(),
            VmExit::MmioRead { gpa, width } => match (self.mmio.as_mut(), pending) {
                (Some(mmio), Some(pending)) => {
                    let data = mmio.read(gpa, width)?;
                    self.complete_read(pending, data)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            VmExit::MmioWrite { gpa, data } => match self.mmio.as_mut() {
                Some(mmio) => {
                    mmio.write(gpa, data)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    fn irq_deliverable(&mut self) -> Result<bool, VmmError> {
        let Some(irq) = self.shared.state.lock().pending_irq else {
            return Ok(false);
        };
        Ok(!irq.maskable()
            || self
                .registers
                .fetch(RegisterSet::RFLAGS)?
                .rflags()?
                .contains(Rflags::IF))
    }

    fn inject_pending_interrupt(&mut self) -> Result<(), VmmError> {
        if !self.irq_deliverable()? {
            let pending = self.shared.state.lock().pending_irq.is_some();
            return self.set_interrupt_window(pending);
        }
        // The slot may have been replaced meanwhile; deliver whatever is there now.
        let Some(irq) = self.shared.state.lock().pending_irq.take() else {
            return Ok(());
        };
        if irq.maskable() && !self.registers.rflags()?.contains(Rflags::IF) {
            queue_irq(&self.shared, irq);
            return self.set_interrupt_window(true);
        }
        self.registers.backend_mut()?.inject_interrupt(irq)?;
        tracing::debug!(vector = irq.vector, kind = ?irq.kind, "interrupt injected");
        self.set_interrupt_window(false)
    }

    fn set_interrupt_window(&mut self, enabled: bool) -> Result<(), VmmError> {
        if self.window_requested == enabled {
            return Ok(());
        }
        match self.registers.backend_mut()?.set_interrupt_window(enabled) {
            Ok(()) => {
                self.window_requested = enabled;
                Ok(())
            }
            Err(BackendError::Unsupported(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn complete_read(&mut self, pending: PendingRead, data: DataWrite) -> Result<(), VmmError> {
        let data = DataWrite::new(pending.width(), data.value());
        match pending {
            PendingRead::Accumulator(width) => {
                self.registers.fetch(RegisterSet::RAX)?;
                match width {
                    DataRead::Byte => self.registers.set_al(data.value()),
                    DataRead::Word => self.registers.set_ax(data.value()),
                    DataRead::Dword => self.registers.set_eax(data.value() as u32),
                    DataRead::Qword => self.registers.set_rax(data.value()),
                }
            }
            PendingRead::Memory { gpa, .. } => self.memory.read().write_guest(gpa, &data.to_le_bytes()),
            PendingRead::Backend(_) => Ok(self.registers.backend_mut()?.complete_read(data)?),
        }
    }

    fn teardown(mut self, result: Result<(), VmmError>) -> VcpuOutcome {
        let mut error = result.err();
        if let Some(e) = &error {
            tracing::warn!(error = %e, kind = ?e.kind(), "vcpu stopped on error");
        }
        let registers = match self.registers.freeze() {
            Ok(vcpu) => {
                if let Some(Err(e)) = vcpu.map(VcpuBackend::destroy) {
                    error.get_or_insert(e.into());
                }
                Some(self.registers.registers().clone())
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read back registers");
                if let Some(vcpu) = self.registers.detach() {
                    if let Err(destroy) = vcpu.destroy() {
                        tracing::warn!(error = %destroy, "failed to destroy vcpu");
                    }
                }
                error.get_or_insert(e);
                None
            }
        };
        VcpuOutcome {
            id: self.id,
            exit_count: self.shared.exit_count.load(Ordering::Relaxed),
            registers,
            error,
        }
    }
}

fn vcpu_thread_work<B: HypervisorBackend>(
    shared: Arc<Shared<B>>,
    parker: Parker,
    backend: Arc<B>,
    memory: Arc<RwLock<MemoryRegionTable>>,
    caps: Capabilities,
    config: VcpuConfig,
) {
    let span = tracing::info_span!("vcpu", id = shared.id);
    let _enter = span.enter();

    let mut ctx = match VcpuContext::setup(shared.clone(), &*backend, memory, &caps, &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(error = %e, "vcpu setup failed");
            let outcome = VcpuOutcome {
                id: shared.id,
                exit_count: 0,
                registers: None,
                error: Some(e),
            };
            shared.finish(outcome, None);
            return;
        }
    };
    shared.set_status(VcpuStatus::WaitingToStart);

    // Binary semaphore: `start` and `shutdown` both unpark.
    while !shared.shutdown_requested.load(Ordering::Acquire)
        && shared.status() != VcpuStatus::Running
    {
        parker.park();
    }

    let handlers = shared.take_handlers();
    let result = if shared.status() == VcpuStatus::Running {
        ctx.mmio = handlers.mmio;
        ctx.run(handlers.exit)
    } else {
        Ok(())
    };
    shared.set_status(VcpuStatus::ShuttingDown);
    let outcome = ctx.teardown(result);
    shared.finish(outcome, handlers.completion);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_interrupts_encode_as_entry_info() {
        let info = InterruptionInfo::from(InjectedInterrupt::external(0x20));
        assert_eq!(info.encode(), 0x8000_0020);
        let info = InterruptionInfo::from(InjectedInterrupt::nmi());
        assert_eq!(info.encode(), 0x8000_0202);
        let info = InterruptionInfo::from(InjectedInterrupt::exception(vector::GP, Some(0)));
        assert_eq!(info.encode(), 0x8000_0b0d);
        assert!(!InjectedInterrupt::exception(vector::UD, None).deliver_error_code);
    }

    #[test]
    fn only_external_interrupts_are_maskable() {
        assert!(InjectedInterrupt::external(8).maskable());
        assert!(!InjectedInterrupt::nmi().maskable());
        assert!(!InjectedInterrupt::exception(vector::DE, None).maskable());
    }
}
