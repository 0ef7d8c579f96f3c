//! Virtual machine interface.
use crate::{
    backend::{HypervisorBackend, MemoryBackend},
    memory::{Gpa, MemoryRegion, MemoryRegionTable},
    vcpu::{VCpu, VcpuConfig},
    vm_control::Capabilities,
    VmmError,
};
use parking_lot::{RwLock, RwLockReadGuard};
use std::{sync::Arc, time::Duration};

/// How long [`VCpu::shutdown`] waits by default.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

/// Builder factory to build a virtual machine.
pub struct VmBuilder<B: HypervisorBackend> {
    backend: Arc<B>,
    exception_bitmap: u32,
    shutdown_timeout: Duration,
    dirty_tracking: bool,
    max_vcpus: Option<usize>,
}

impl<B: HypervisorBackend> VmBuilder<B> {
    /// Get a builder object to create a new vm on `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            exception_bitmap: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dirty_tracking: true,
            max_vcpus: None,
        }
    }

    /// Exceptions that cause a VM-exit, one bit per vector.
    #[inline]
    pub fn exception_bitmap(mut self, en: u32) -> Self {
        self.exception_bitmap = en;
        self
    }

    /// How long a vCPU shutdown may take.
    #[inline]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Track dirty pages of writable regions. Ignored if the backend cannot change permissions.
    #[inline]
    pub fn dirty_tracking(mut self, en: bool) -> Self {
        self.dirty_tracking = en;
        self
    }

    /// Lower the vCPU limit below the backend's.
    #[inline]
    pub fn max_vcpus(mut self, n: usize) -> Self {
        self.max_vcpus = Some(n);
        self
    }

    /// Create the VM.
    pub fn build(self) -> Result<VirtualMachine<B>, VmmError> {
        let mut caps = self.backend.capabilities()?;
        if let Some(n) = self.max_vcpus {
            caps.max_vcpus = caps.max_vcpus.min(n);
        }
        let dirty_tracking = self.dirty_tracking && caps.memory_protection;
        if self.dirty_tracking && !caps.memory_protection {
            tracing::info!("backend cannot protect memory; dirty page tracking disabled");
        }
        self.backend.create_vm()?;
        tracing::debug!(?caps, dirty_tracking, "vm created");

        let memory_backend: Arc<dyn MemoryBackend> = self.backend.clone();
        Ok(VirtualMachine {
            memory: Arc::new(RwLock::new(MemoryRegionTable::new(
                memory_backend,
                dirty_tracking,
            ))),
            vcpus: Vec::new(),
            backend: self.backend,
            caps,
            config: VcpuConfig {
                exception_bitmap: self.exception_bitmap,
                shutdown_timeout: self.shutdown_timeout,
            },
        })
    }
}

/// The virtual machine.
///
/// Owns the guest memory map and the vCPUs. Dropping it shuts every vCPU down, unmaps the
/// memory and destroys the backend VM, in this order.
pub struct VirtualMachine<B: HypervisorBackend> {
    // Dropped in declaration order, before `backend` goes away.
    vcpus: Vec<VCpu<B>>,
    memory: Arc<RwLock<MemoryRegionTable>>,
    backend: Arc<B>,
    caps: Capabilities,
    config: VcpuConfig,
}

impl<B: HypervisorBackend> VirtualMachine<B> {
    /// Create a VM with the default settings.
    pub fn new(backend: B) -> Result<Self, VmmError> {
        VmBuilder::new(backend).build()
    }

    /// What the backend reported, after the builder's limits.
    #[inline]
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// The hypervisor backend.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Add a writable (or read-only) region of `size` bytes at `gpa`.
    pub fn add_memory(
        &self,
        gpa: Gpa,
        size: u64,
        read_only: bool,
    ) -> Result<Arc<MemoryRegion>, VmmError> {
        self.memory.write().add(gpa, size, read_only)
    }

    /// Add a region made of consecutive sub-regions, each with its own permissions later.
    pub fn add_memory_with_layout(
        &self,
        gpa: Gpa,
        sizes: &[u64],
        read_only: bool,
    ) -> Result<Arc<MemoryRegion>, VmmError> {
        self.memory.write().add_with_layout(gpa, sizes, read_only)
    }

    /// The guest memory map.
    pub fn memory(&self) -> RwLockReadGuard<'_, MemoryRegionTable> {
        self.memory.read()
    }

    /// See [`MemoryRegionTable::set_protection`].
    pub fn set_protection(
        &self,
        gpa: Gpa,
        size: u64,
        readable: bool,
        writable: bool,
    ) -> Result<(), VmmError> {
        self.memory
            .read()
            .set_protection(gpa, size, readable, writable)
    }

    /// Create the next vCPU and wait until it is ready to start.
    ///
    /// Nothing is registered on failure.
    pub fn add_vcpu(&mut self) -> Result<&VCpu<B>, VmmError> {
        if self.vcpus.len() >= self.caps.max_vcpus {
            return Err(VmmError::TooManyVcpus(self.caps.max_vcpus));
        }
        let vcpu = VCpu::spawn(
            self.vcpus.len(),
            self.backend.clone(),
            self.memory.clone(),
            self.caps,
            self.config,
        )?;
        tracing::debug!(id = vcpu.id(), "vcpu added");
        self.vcpus.push(vcpu);
        Ok(&self.vcpus[self.vcpus.len() - 1])
    }

    /// Get vcpu #idx.
    #[inline]
    pub fn vcpu(&self, idx: usize) -> Option<&VCpu<B>> {
        self.vcpus.get(idx)
    }

    /// Every vCPU, by index.
    #[inline]
    pub fn vcpus(&self) -> &[VCpu<B>] {
        &self.vcpus
    }

    /// Shut every vCPU down. Returns the first failure after trying all of them.
    pub fn shutdown(&self) -> Result<(), VmmError> {
        let mut result = Ok(());
        for vcpu in &self.vcpus {
            if let Err(e) = vcpu.shutdown() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl<B: HypervisorBackend> Drop for VirtualMachine<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "vcpus still running while destroying the vm");
        }
        self.vcpus.clear();
        self.memory.write().clear();
        if let Err(e) = self.backend.destroy_vm() {
            tracing::warn!(error = %e, "failed to destroy the vm");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockHypervisor;

    #[test]
    fn builder_disables_tracking_without_protection() {
        let hv = MockHypervisor::without_memory_protection();
        let vm = VmBuilder::new(hv).build().unwrap();
        assert!(!vm.memory().dirty_tracking());

        let vm = VmBuilder::new(MockHypervisor::new()).build().unwrap();
        assert!(vm.memory().dirty_tracking());
        let vm = VmBuilder::new(MockHypervisor::new())
            .dirty_tracking(false)
            .build()
            .unwrap();
        assert!(!vm.memory().dirty_tracking());
    }

    #[test]
    fn drop_unmaps_then_destroys() {
        let hv = MockHypervisor::new();
        let probe = hv.clone();
        let vm = VmBuilder::new(hv).max_vcpus(1).build().unwrap();
        assert_eq!(vm.capabilities().max_vcpus, 1);
        vm.add_memory(Gpa::new(0), 0x10000, false).unwrap();
        assert_eq!(probe.mappings().len(), 1);
        assert_eq!(probe.vms_created(), 1);
        drop(vm);
        assert!(probe.mappings().is_empty());
        assert_eq!(probe.vms_destroyed(), 1);
    }
}
