//! A scripted, in-process backend.
//!
//! [`MockHypervisor`] keeps guest registers and control fields in plain maps and answers
//! [`VcpuBackend::run_once`] from a per-vCPU script of [`MockStep`]s. Every register transfer,
//! VM-entry and memory-map change is recorded, so tests can check what the monitor asked the
//! hypervisor to do. Once a script runs dry the vCPU reports host interruptions until it is shut
//! down.
use super::{
    BackendError, DecodedExit, HypervisorBackend, MemoryBackend, MemoryPermissions, RawExit,
    VcpuBackend,
};
use crate::{
    memory::Gpa,
    registers::Register,
    vm_control::{Capabilities, ControlCapability, VmcsProcBasedVmexecCtl, VmxCapabilities},
    vmcs::{Field, InterruptionInfo},
    vmexits::DataWrite,
    x86::{Cr0, Cr4},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

/// A guest-physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockMapping {
    /// Host address, as an integer.
    pub host: usize,
    pub size: u64,
    pub perms: MemoryPermissions,
}

/// One VM-entry, as seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockEntry {
    /// The event delivered on this entry.
    pub injected: Option<InterruptionInfo>,
    /// Whether interrupt-window exiting was on.
    pub interrupt_window: bool,
    pub rip: u64,
}

/// What a mock vCPU was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockVcpuTrace {
    /// Registers of every `read_registers`/`read_register` call.
    pub read_calls: Vec<Vec<Register>>,
    /// Values of every `write_registers`/`write_register` call.
    pub write_calls: Vec<Vec<(Register, u64)>>,
    pub entries: Vec<MockEntry>,
    /// Data handed back through `complete_read`.
    pub completed_reads: Vec<DataWrite>,
    pub destroyed: bool,
}

/// One scripted VM-exit.
#[derive(Debug, Clone)]
pub struct MockStep {
    /// Registers the guest changed before exiting.
    pub registers: Vec<(Register, u64)>,
    pub exit: RawExit,
}

impl MockStep {
    pub fn exit(exit: RawExit) -> Self {
        Self {
            registers: Vec::new(),
            exit,
        }
    }

    pub fn decoded(exit: DecodedExit) -> Self {
        Self::exit(RawExit::Decoded(exit))
    }

    /// Let the guest set `reg` to `value` before this exit.
    pub fn with_register(mut self, reg: Register, value: u64) -> Self {
        self.registers.push((reg, value));
        self
    }
}

#[derive(Default)]
struct MockVcpuState {
    registers: HashMap<Register, u64>,
    fields: HashMap<Field, u64>,
    script: VecDeque<MockStep>,
    trace: MockVcpuTrace,
}

#[derive(Default)]
struct MockState {
    vms_created: usize,
    vms_destroyed: usize,
    vcpus_destroyed: usize,
    mappings: BTreeMap<u64, MockMapping>,
    protections: Vec<(Gpa, u64, MemoryPermissions)>,
    fail_map_at: Option<Gpa>,
    fail_create_vcpu: bool,
    next_vcpu: usize,
    vcpus: Vec<MockVcpuState>,
}

impl MockState {
    fn vcpu(&mut self, id: usize) -> &mut MockVcpuState {
        if self.vcpus.len() <= id {
            self.vcpus.resize_with(id + 1, MockVcpuState::default);
        }
        &mut self.vcpus[id]
    }
}

struct Inner {
    caps: Capabilities,
    state: Mutex<MockState>,
}

/// The scripted hypervisor. Clones share state.
#[derive(Clone)]
pub struct MockHypervisor {
    inner: Arc<Inner>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// A VT-x style backend allowing every control, with unrestricted guests, memory
    /// protection and up to 8 vCPUs.
    pub fn new() -> Self {
        let any = ControlCapability {
            allowed0: 0,
            allowed1: u32::MAX,
        };
        Self::with_capabilities(Capabilities {
            max_vcpus: 8,
            memory_protection: true,
            vmx: Some(VmxCapabilities {
                pinbased: any,
                procbased: any,
                procbased2: any,
                exit: any,
                entry: any,
                cr0_fixed0: (Cr0::PE | Cr0::NE | Cr0::PG).bits(),
                cr0_fixed1: 0xffff_ffff,
                cr4_fixed0: Cr4::VMXE.bits(),
                cr4_fixed1: 0x0037_27ff,
            }),
        })
    }

    /// A backend that cannot change memory permissions.
    pub fn without_memory_protection() -> Self {
        let mut caps = Self::new().inner.caps;
        caps.memory_protection = false;
        Self::with_capabilities(caps)
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            inner: Arc::new(Inner {
                caps,
                state: Mutex::new(MockState::default()),
            }),
        }
    }

    /// Current mappings, by guest-physical start.
    pub fn mappings(&self) -> BTreeMap<u64, MockMapping> {
        self.inner.state.lock().mappings.clone()
    }

    /// Every `protect_memory` call, in order.
    pub fn protections(&self) -> Vec<(Gpa, u64, MemoryPermissions)> {
        self.inner.state.lock().protections.clone()
    }

    /// Fail the next mapping starting at `gpa`.
    pub fn fail_map_at(&self, gpa: Gpa) {
        self.inner.state.lock().fail_map_at = Some(gpa);
    }

    /// Fail every later `create_vcpu`.
    pub fn fail_create_vcpu(&self) {
        self.inner.state.lock().fail_create_vcpu = true;
    }

    pub fn vms_created(&self) -> usize {
        self.inner.state.lock().vms_created
    }

    pub fn vms_destroyed(&self) -> usize {
        self.inner.state.lock().vms_destroyed
    }

    /// `destroy` calls over all vCPUs, including rejected ones.
    pub fn vcpus_destroyed(&self) -> usize {
        self.inner.state.lock().vcpus_destroyed
    }

    /// Set a register of vCPU `id` behind the monitor's back.
    pub fn set_register(&self, id: usize, reg: Register, value: u64) {
        self.inner.state.lock().vcpu(id).registers.insert(reg, value);
    }

    /// A register of vCPU `id`, as last written by the monitor or the script.
    pub fn register(&self, id: usize, reg: Register) -> u64 {
        self.inner
            .state
            .lock()
            .vcpu(id)
            .registers
            .get(&reg)
            .copied()
            .unwrap_or(0)
    }

    /// A control field of vCPU `id`.
    pub fn field(&self, id: usize, field: Field) -> Option<u64> {
        self.inner.state.lock().vcpu(id).fields.get(&field).copied()
    }

    /// Append exits to the script of vCPU `id`.
    pub fn push_script(&self, id: usize, steps: impl IntoIterator<Item = MockStep>) {
        self.inner.state.lock().vcpu(id).script.extend(steps);
    }

    pub fn trace(&self, id: usize) -> MockVcpuTrace {
        self.inner.state.lock().vcpu(id).trace.clone()
    }
}

impl MemoryBackend for MockHypervisor {
    unsafe fn map_memory(
        &self,
        gpa: Gpa,
        host: *mut u8,
        size: u64,
        perms: MemoryPermissions,
    ) -> Result<(), BackendError> {
        let mut state = self.inner.state.lock();
        if state.fail_map_at == Some(gpa) {
            state.fail_map_at = None;
            return Err(BackendError::Call {
                op: "map_memory",
                code: -1,
            });
        }
        state.mappings.insert(
            gpa.into_u64(),
            MockMapping {
                host: host as usize,
                size,
                perms,
            },
        );
        Ok(())
    }

    fn unmap_memory(&self, gpa: Gpa, _size: u64) -> Result<(), BackendError> {
        self.inner
            .state
            .lock()
            .mappings
            .remove(&gpa.into_u64())
            .map(|_| ())
            .ok_or(BackendError::Call {
                op: "unmap_memory",
                code: -1,
            })
    }

    fn protect_memory(
        &self,
        gpa: Gpa,
        size: u64,
        perms: MemoryPermissions,
    ) -> Result<(), BackendError> {
        if !self.inner.caps.memory_protection {
            return Err(BackendError::Unsupported("protect_memory"));
        }
        let mut state = self.inner.state.lock();
        state.protections.push((gpa, size, perms));
        if let Some(mapping) = state.mappings.get_mut(&gpa.into_u64()) {
            if mapping.size == size {
                mapping.perms = perms;
            }
        }
        Ok(())
    }
}

impl HypervisorBackend for MockHypervisor {
    type Vcpu = MockVcpu;

    fn capabilities(&self) -> Result<Capabilities, BackendError> {
        Ok(self.inner.caps)
    }

    fn create_vm(&self) -> Result<(), BackendError> {
        self.inner.state.lock().vms_created += 1;
        Ok(())
    }

    fn destroy_vm(&self) -> Result<(), BackendError> {
        self.inner.state.lock().vms_destroyed += 1;
        Ok(())
    }

    fn create_vcpu(&self) -> Result<MockVcpu, BackendError> {
        let mut state = self.inner.state.lock();
        if state.fail_create_vcpu {
            return Err(BackendError::Call {
                op: "create_vcpu",
                code: -1,
            });
        }
        let id = state.next_vcpu;
        state.next_vcpu += 1;
        state.vcpu(id);
        Ok(MockVcpu {
            id,
            inner: self.inner.clone(),
        })
    }
}

/// A vCPU of [`MockHypervisor`].
pub struct MockVcpu {
    id: usize,
    inner: Arc<Inner>,
}

impl MockVcpu {
    fn with<R>(&self, f: impl FnOnce(&mut MockVcpuState) -> R) -> Result<R, BackendError> {
        let mut state = self.inner.state.lock();
        let vcpu = state.vcpu(self.id);
        if vcpu.trace.destroyed {
            return Err(BackendError::Destroyed);
        }
        Ok(f(vcpu))
    }
}

impl VcpuBackend for MockVcpu {
    fn read_register(&mut self, reg: Register) -> Result<u64, BackendError> {
        self.with(|v| {
            v.trace.read_calls.push(vec![reg]);
            v.registers.get(&reg).copied().unwrap_or(0)
        })
    }

    fn write_register(&mut self, reg: Register, value: u64) -> Result<(), BackendError> {
        self.with(|v| {
            v.trace.write_calls.push(vec![(reg, value)]);
            v.registers.insert(reg, value);
        })
    }

    fn read_registers(&mut self, regs: &[Register], values: &mut [u64]) -> Result<(), BackendError> {
        self.with(|v| {
            v.trace.read_calls.push(regs.to_vec());
            for (reg, out) in regs.iter().zip(values.iter_mut()) {
                *out = v.registers.get(reg).copied().unwrap_or(0);
            }
        })
    }

    fn write_registers(&mut self, values: &[(Register, u64)]) -> Result<(), BackendError> {
        self.with(|v| {
            v.trace.write_calls.push(values.to_vec());
            v.registers.extend(values.iter().copied());
        })
    }

    fn read_field(&mut self, field: Field) -> Result<u64, BackendError> {
        self.with(|v| v.fields.get(&field).copied().unwrap_or(0))
    }

    fn write_field(&mut self, field: Field, value: u64) -> Result<(), BackendError> {
        self.with(|v| {
            v.fields.insert(field, value);
        })
    }

    fn run_once(&mut self) -> Result<RawExit, BackendError> {
        let step = self.with(|v| {
            // Entry consumes the event injection field.
            let injected = v
                .fields
                .insert(Field::VmentryInterruptionInfo, 0)
                .and_then(|info| InterruptionInfo::decode(info as u32));
            let controls = v
                .fields
                .get(&Field::ProcessorBasedVmexecControls)
                .copied()
                .unwrap_or(0);
            let entry = MockEntry {
                injected,
                interrupt_window: controls & VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64 != 0,
                rip: v.registers.get(&Register::Rip).copied().unwrap_or(0),
            };
            v.trace.entries.push(entry);
            let step = v.script.pop_front();
            if let Some(step) = &step {
                v.registers.extend(step.registers.iter().copied());
            }
            step
        })?;
        match step {
            Some(step) => Ok(step.exit),
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(RawExit::Decoded(DecodedExit::Interrupted))
            }
        }
    }

    fn complete_read(&mut self, data: DataWrite) -> Result<(), BackendError> {
        self.with(|v| v.trace.completed_reads.push(data))
    }

    fn destroy(self) -> Result<(), BackendError> {
        self.inner.state.lock().vcpus_destroyed += 1;
        self.with(|v| v.trace.destroyed = true)
    }
}
