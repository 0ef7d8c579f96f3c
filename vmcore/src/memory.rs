//! Guest-physical memory.
//!
//! Guest RAM is a handful of [`MemoryRegion`]s, each backed by one page-aligned host allocation
//! and mapped into the guest as one or more sub-regions. A writable region optionally tracks which
//! pages the guest wrote: its pages start out mapped without write access, and the first write to
//! a page faults, marks the page dirty and lifts the write protection of that page.
use crate::{
    backend::{MemoryBackend, MemoryPermissions},
    VmmError, PAGE_SIZE,
};
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Default)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// The address of the page containing this address.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Add `off`, failing on overflow.
    #[inline]
    pub const fn checked_add(self, off: u64) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = u64;

            fn sub(self, other: $t) -> u64 {
                self.0 - other.0
            }
        }
    };
}

impl_arith!(Gpa);

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// One backend-level mapping of a region.
#[derive(Debug)]
pub struct SubRegion {
    gpa: Gpa,
    size: u64,
    perms: AtomicU8,
}

impl SubRegion {
    /// First guest-physical address.
    #[inline]
    pub fn guest_address(&self) -> Gpa {
        self.gpa
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Access rights granted to the guest, ignoring dirty tracking.
    #[inline]
    pub fn permissions(&self) -> MemoryPermissions {
        MemoryPermissions::from_bits_truncate(self.perms.load(Ordering::Acquire))
    }

    #[inline]
    fn contains(&self, gpa: Gpa) -> bool {
        gpa >= self.gpa && gpa - self.gpa < self.size
    }
}

/// A contiguous range of guest RAM.
pub struct MemoryRegion {
    gpa: Gpa,
    size: u64,
    read_only: bool,
    host: NonNull<u8>,
    layout: Layout,
    sub_regions: Vec<SubRegion>,
    // One bit per page; present only on writable, tracked regions.
    dirty: Option<Box<[AtomicU64]>>,
    mapped: AtomicBool,
    backend: Arc<dyn MemoryBackend>,
}

// SAFETY: `host` is an owned allocation living as long as the region. Concurrent guest and host
// accesses to the bytes are not synchronized by this type, as for any guest RAM.
unsafe impl Send for MemoryRegion {}
// SAFETY: see above. Every shared mutable field is atomic.
unsafe impl Sync for MemoryRegion {}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("gpa", &self.gpa)
            .field("size", &format_args!("{:#x}", self.size))
            .field("read_only", &self.read_only)
            .field("sub_regions", &self.sub_regions)
            .finish()
    }
}

impl MemoryRegion {
    /// Allocate and map a region made of `layout.len()` consecutive sub-regions.
    fn new(
        backend: Arc<dyn MemoryBackend>,
        gpa: Gpa,
        sizes: &[u64],
        read_only: bool,
        dirty_tracking: bool,
    ) -> Result<Self, VmmError> {
        let size = sizes.iter().try_fold(0u64, |acc, s| acc.checked_add(*s));
        let size = match size {
            Some(size)
                if size != 0
                    && gpa.is_page_aligned()
                    && gpa.checked_add(size).is_some()
                    && sizes.iter().all(|s| *s != 0 && s % PAGE_SIZE == 0) =>
            {
                size
            }
            _ => {
                return Err(VmmError::InvalidMemoryRegion {
                    gpa,
                    size: size.unwrap_or(u64::MAX),
                })
            }
        };
        let layout = usize::try_from(size)
            .ok()
            .and_then(|s| Layout::from_size_align(s, PAGE_SIZE as usize).ok())
            .ok_or(VmmError::InvalidMemoryRegion { gpa, size })?;
        // SAFETY: `layout` has a non-zero size.
        let host = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(VmmError::OutOfMemory { gpa, size })?;

        let perms = if read_only {
            MemoryPermissions::READ | MemoryPermissions::EXECUTE
        } else {
            MemoryPermissions::RWX
        };
        let mut offset = 0;
        let sub_regions = sizes
            .iter()
            .map(|s| {
                let sub = SubRegion {
                    gpa: gpa + offset,
                    size: *s,
                    perms: AtomicU8::new(perms.bits()),
                };
                offset += s;
                sub
            })
            .collect();
        let pages = (size / PAGE_SIZE) as usize;
        let region = Self {
            gpa,
            size,
            read_only,
            host,
            layout,
            sub_regions,
            dirty: (dirty_tracking && !read_only)
                .then(|| (0..(pages + 63) / 64).map(|_| AtomicU64::new(0)).collect()),
            // Set before mapping so a partial failure unmaps what was mapped.
            mapped: AtomicBool::new(true),
            backend,
        };
        region.map_all()?;
        Ok(region)
    }

    fn map_all(&self) -> Result<(), VmmError> {
        for (i, sub) in self.sub_regions.iter().enumerate() {
            let host = self.host_ptr(sub.gpa);
            let perms = self.mapped_permissions(sub, sub.gpa);
            // SAFETY: the allocation outlives the mapping; `Drop` unmaps before freeing.
            let result = unsafe { self.backend.map_memory(sub.gpa, host, sub.size, perms) };
            if let Err(e) = result {
                for done in &self.sub_regions[..i] {
                    let _ = self.backend.unmap_memory(done.gpa, done.size);
                }
                self.mapped.store(false, Ordering::Release);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// First guest-physical address.
    #[inline]
    pub fn guest_address(&self) -> Gpa {
        self.gpa
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the guest may never write this region.
    #[inline]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this region tracks dirty pages.
    #[inline]
    pub fn tracks_dirty_pages(&self) -> bool {
        self.dirty.is_some()
    }

    /// Backend-level mappings of this region.
    #[inline]
    pub fn sub_regions(&self) -> &[SubRegion] {
        &self.sub_regions
    }

    /// Whether `gpa` lies in this region.
    #[inline]
    pub fn contains(&self, gpa: Gpa) -> bool {
        gpa >= self.gpa && gpa - self.gpa < self.size
    }

    fn sub_region(&self, gpa: Gpa) -> Option<&SubRegion> {
        self.sub_regions.iter().find(|s| s.contains(gpa))
    }

    /// Access rights the guest has at `gpa`, ignoring dirty tracking.
    pub fn permissions(&self, gpa: Gpa) -> Option<MemoryPermissions> {
        self.sub_region(gpa).map(SubRegion::permissions)
    }

    #[inline]
    fn host_ptr(&self, gpa: Gpa) -> *mut u8 {
        // SAFETY: callers pass an address inside the region.
        unsafe { self.host.as_ptr().add((gpa - self.gpa) as usize) }
    }

    /// Host pointer to `len` bytes at `gpa`, if the whole span lies in this region.
    pub fn translate(&self, gpa: Gpa, len: u64) -> Option<*mut u8> {
        let end = gpa.checked_add(len.max(1))?;
        (self.contains(gpa) && end - self.gpa <= self.size).then(|| self.host_ptr(gpa))
    }

    fn span(&self, offset: u64, len: usize) -> Result<*mut u8, VmmError> {
        self.gpa
            .checked_add(offset)
            .and_then(|gpa| self.translate(gpa, len as u64))
            .ok_or(VmmError::InvalidMemoryRegion {
                gpa: self.gpa + offset.min(self.size),
                size: len as u64,
            })
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn load_binary(&self, bytes: &[u8], offset: u64) -> Result<(), VmmError> {
        self.write_bytes(offset, bytes)
    }

    /// Copy `buf.len()` bytes from `offset` into `buf`.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), VmmError> {
        let src = self.span(offset, buf.len())?;
        // SAFETY: the span was bounds-checked against the allocation.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `buf` into the region at `offset`. Host writes do not mark pages dirty.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<(), VmmError> {
        let dst = self.span(offset, buf.len())?;
        // SAFETY: the span was bounds-checked against the allocation.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) };
        Ok(())
    }

    #[inline]
    fn page_index(&self, gpa: Gpa) -> usize {
        ((gpa - self.gpa) / PAGE_SIZE) as usize
    }

    /// Whether the page containing `gpa` was written by the guest.
    pub fn is_dirty(&self, gpa: Gpa) -> bool {
        match &self.dirty {
            Some(bitmap) if self.contains(gpa) => {
                let page = self.page_index(gpa);
                bitmap[page / 64].load(Ordering::Acquire) & (1 << (page % 64)) != 0
            }
            _ => false,
        }
    }

    /// Every dirty page, in address order.
    pub fn dirty_pages(&self) -> Vec<Gpa> {
        (0..self.size / PAGE_SIZE)
            .map(|i| self.gpa + i * PAGE_SIZE)
            .filter(|gpa| self.is_dirty(*gpa))
            .collect()
    }

    /// Record a guest write to the page containing `gpa` and give the guest write access to it.
    ///
    /// Returns whether the page was clean before. Does nothing on read-only or untracked
    /// regions, or where the guest may not write.
    pub fn mark_dirty(&self, gpa: Gpa) -> Result<bool, VmmError> {
        let (Some(bitmap), Some(sub)) = (&self.dirty, self.sub_region(gpa)) else {
            return Ok(false);
        };
        if !sub.permissions().contains(MemoryPermissions::WRITE) {
            return Ok(false);
        }
        let page = self.page_index(gpa);
        let bit = 1 << (page % 64);
        if bitmap[page / 64].fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Ok(false);
        }
        self.backend
            .protect_memory(gpa.page_down(), PAGE_SIZE, sub.permissions())?;
        tracing::trace!(%gpa, "page dirtied");
        Ok(true)
    }

    // What the backend maps at `gpa`: the sub-region rights, minus write on clean tracked pages.
    fn mapped_permissions(&self, sub: &SubRegion, gpa: Gpa) -> MemoryPermissions {
        let mut perms = sub.permissions();
        if self.dirty.is_some() && !self.is_dirty(gpa) {
            perms.remove(MemoryPermissions::WRITE);
        }
        perms
    }

    fn apply_protection(&self, sub: &SubRegion) -> Result<(), VmmError> {
        if self.dirty.is_none() || !sub.permissions().contains(MemoryPermissions::WRITE) {
            self.backend
                .protect_memory(sub.gpa, sub.size, sub.permissions())?;
            return Ok(());
        }
        // Coalesce runs of pages sharing the same dirty state.
        let mut run_start = sub.gpa;
        let mut run_perms = self.mapped_permissions(sub, sub.gpa);
        let end = sub.gpa + sub.size;
        let mut page = sub.gpa + PAGE_SIZE;
        while page <= end {
            let perms = (page < end).then(|| self.mapped_permissions(sub, page));
            if perms != Some(run_perms) {
                self.backend
                    .protect_memory(run_start, page - run_start, run_perms)?;
                if let Some(p) = perms {
                    run_start = page;
                    run_perms = p;
                }
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Remove every sub-region from the guest. Idempotent.
    pub(crate) fn unmap(&self) {
        if self.mapped.swap(false, Ordering::AcqRel) {
            for sub in &self.sub_regions {
                if let Err(e) = self.backend.unmap_memory(sub.gpa, sub.size) {
                    tracing::warn!(gpa = %sub.gpa, error = %e, "failed to unmap guest memory");
                }
            }
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // The backend must stop using the memory before it is released.
        self.unmap();
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.host.as_ptr(), self.layout) };
    }
}

/// The guest-physical memory map of a VM.
///
/// Regions never overlap, so [`MemoryRegionTable::find`] returns at most one region for any
/// address.
pub struct MemoryRegionTable {
    backend: Arc<dyn MemoryBackend>,
    dirty_tracking: bool,
    regions: Vec<Arc<MemoryRegion>>,
}

impl MemoryRegionTable {
    /// Create an empty table mapping through `backend`.
    pub fn new(backend: Arc<dyn MemoryBackend>, dirty_tracking: bool) -> Self {
        Self {
            backend,
            dirty_tracking,
            regions: Vec::new(),
        }
    }

    /// Whether new writable regions track dirty pages.
    #[inline]
    pub fn dirty_tracking(&self) -> bool {
        self.dirty_tracking
    }

    /// Allocate, map and register a region of one sub-region.
    pub fn add(&mut self, gpa: Gpa, size: u64, read_only: bool) -> Result<Arc<MemoryRegion>, VmmError> {
        self.add_with_layout(gpa, &[size], read_only)
    }

    /// Allocate, map and register a region made of consecutive sub-regions of the given sizes.
    ///
    /// On failure nothing is registered and nothing stays mapped.
    pub fn add_with_layout(
        &mut self,
        gpa: Gpa,
        sizes: &[u64],
        read_only: bool,
    ) -> Result<Arc<MemoryRegion>, VmmError> {
        let size = sizes.iter().fold(0u64, |acc, s| acc.saturating_add(*s));
        if let Some(end) = gpa.checked_add(size) {
            if self
                .regions
                .iter()
                .any(|r| gpa < r.gpa + r.size && r.gpa < end)
            {
                return Err(VmmError::OverlappingMemoryRegion { gpa, size });
            }
        }
        let region = Arc::new(MemoryRegion::new(
            self.backend.clone(),
            gpa,
            sizes,
            read_only,
            self.dirty_tracking,
        )?);
        tracing::debug!(%gpa, size, read_only, "memory region added");
        self.regions.push(region.clone());
        Ok(region)
    }

    /// The region containing `gpa`.
    pub fn find(&self, gpa: Gpa) -> Option<&Arc<MemoryRegion>> {
        self.regions.iter().find(|r| r.contains(gpa))
    }

    /// Every region, in insertion order.
    pub fn regions(&self) -> impl Iterator<Item = &Arc<MemoryRegion>> {
        self.regions.iter()
    }

    /// Whether no region was added.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Host pointer to `len` bytes at `gpa`. The span must lie in a single region.
    pub fn translate(&self, gpa: Gpa, len: u64) -> Result<*mut u8, VmmError> {
        self.find(gpa)
            .and_then(|r| r.translate(gpa, len))
            .ok_or(VmmError::InvalidMemoryRegion { gpa, size: len })
    }

    /// See [`MemoryRegion::mark_dirty`]. Addresses outside every region are ignored.
    pub fn mark_dirty(&self, gpa: Gpa) -> Result<bool, VmmError> {
        match self.find(gpa) {
            Some(region) => region.mark_dirty(gpa),
            None => Ok(false),
        }
    }

    /// Change the guest access rights of one sub-region.
    ///
    /// `gpa` and `size` must match the bounds of an existing sub-region exactly. A read-only
    /// region cannot be made writable.
    pub fn set_protection(
        &self,
        gpa: Gpa,
        size: u64,
        readable: bool,
        writable: bool,
    ) -> Result<(), VmmError> {
        let invalid = VmmError::InvalidMemoryRegion { gpa, size };
        let region = self.find(gpa).ok_or(invalid)?;
        let sub = region
            .sub_regions
            .iter()
            .find(|s| s.gpa == gpa && s.size == size)
            .ok_or(VmmError::InvalidMemoryRegion { gpa, size })?;
        if writable && region.read_only {
            return Err(VmmError::InvalidMemoryRegion { gpa, size });
        }
        let mut perms = MemoryPermissions::EXECUTE;
        perms.set(MemoryPermissions::READ, readable);
        perms.set(MemoryPermissions::WRITE, writable);
        sub.perms.store(perms.bits(), Ordering::Release);
        region.apply_protection(sub)?;
        tracing::debug!(%gpa, size, ?perms, "sub-region protection changed");
        Ok(())
    }

    /// Unmap every region and forget them. Host memory is released with the last handle.
    pub fn clear(&mut self) {
        for region in self.regions.drain(..) {
            region.unmap();
        }
    }
}

impl Drop for MemoryRegionTable {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockHypervisor;
    use proptest::prelude::*;

    fn table(tracking: bool) -> (MemoryRegionTable, Arc<MockHypervisor>) {
        let hv = Arc::new(MockHypervisor::new());
        (MemoryRegionTable::new(hv.clone(), tracking), hv)
    }

    #[test]
    fn add_rejects_bad_regions_without_registering() {
        let (mut t, hv) = table(false);
        assert!(matches!(
            t.add(Gpa::new(0x1001), 0x1000, false),
            Err(VmmError::InvalidMemoryRegion { .. })
        ));
        assert!(matches!(
            t.add(Gpa::new(0x1000), 0x800, false),
            Err(VmmError::InvalidMemoryRegion { .. })
        ));
        assert!(matches!(
            t.add(Gpa::new(0x1000), 0, false),
            Err(VmmError::InvalidMemoryRegion { .. })
        ));
        t.add(Gpa::new(0x1000), 0x2000, false).unwrap();
        assert!(matches!(
            t.add(Gpa::new(0x2000), 0x1000, true),
            Err(VmmError::OverlappingMemoryRegion { .. })
        ));
        assert_eq!(t.regions().count(), 1);
        assert_eq!(hv.mappings().len(), 1);
    }

    #[test]
    fn failed_map_leaves_nothing_behind() {
        let (mut t, hv) = table(false);
        hv.fail_map_at(Gpa::new(0x3000));
        let err = t.add_with_layout(Gpa::new(0x1000), &[0x2000, 0x1000], false);
        assert!(matches!(err, Err(VmmError::Backend(_))));
        assert!(t.is_empty());
        assert!(hv.mappings().is_empty());
    }

    #[test]
    fn find_and_translate() {
        let (mut t, _hv) = table(false);
        let region = t.add(Gpa::new(0x1000), 0x2000, false).unwrap();
        region.load_binary(&[0xf4, 0x90], 0x10).unwrap();
        assert!(t.find(Gpa::new(0xfff)).is_none());
        assert!(t.find(Gpa::new(0x3000)).is_none());
        assert!(Arc::ptr_eq(t.find(Gpa::new(0x2fff)).unwrap(), &region));

        let p = t.translate(Gpa::new(0x1010), 2).unwrap();
        // SAFETY: two bytes inside the region.
        assert_eq!(unsafe { core::slice::from_raw_parts(p, 2) }, &[0xf4, 0x90]);
        assert!(t.translate(Gpa::new(0x2fff), 2).is_err());
        assert!(t.translate(Gpa::new(0x8000), 1).is_err());
    }

    #[test]
    fn write_faults_dirty_pages_once() {
        let (mut t, hv) = table(true);
        let region = t.add(Gpa::new(0x1000), 0x3000, false).unwrap();
        assert_eq!(
            hv.mappings()[&0x1000].perms,
            MemoryPermissions::READ | MemoryPermissions::EXECUTE
        );
        assert!(t.mark_dirty(Gpa::new(0x2004)).unwrap());
        assert!(!t.mark_dirty(Gpa::new(0x2ff0)).unwrap());
        assert!(region.is_dirty(Gpa::new(0x2000)));
        assert!(!region.is_dirty(Gpa::new(0x1000)));
        assert_eq!(region.dirty_pages(), vec![Gpa::new(0x2000)]);
        assert_eq!(
            hv.protections(),
            vec![(Gpa::new(0x2000), PAGE_SIZE, MemoryPermissions::RWX)]
        );
    }

    #[test]
    fn read_only_regions_never_get_dirty() {
        let (mut t, _hv) = table(true);
        let rom = t.add(Gpa::new(0xf0000), 0x10000, true).unwrap();
        assert!(!rom.tracks_dirty_pages());
        assert!(!t.mark_dirty(Gpa::new(0xf0000)).unwrap());
        assert!(rom.dirty_pages().is_empty());
    }

    #[test]
    fn set_protection_needs_exact_sub_region() {
        let (mut t, hv) = table(false);
        t.add_with_layout(Gpa::new(0x10000), &[0x1000, 0x2000], false)
            .unwrap();
        assert!(t
            .set_protection(Gpa::new(0x11000), 0x1000, true, false)
            .is_err());
        t.set_protection(Gpa::new(0x11000), 0x2000, true, false)
            .unwrap();
        let region = t.find(Gpa::new(0x11000)).unwrap();
        assert_eq!(
            region.permissions(Gpa::new(0x12000)),
            Some(MemoryPermissions::READ | MemoryPermissions::EXECUTE)
        );
        assert_eq!(
            region.permissions(Gpa::new(0x10000)),
            Some(MemoryPermissions::RWX)
        );
        assert_eq!(hv.protections().len(), 1);
    }

    #[test]
    fn host_allocation_failure_is_returned() {
        let (mut t, hv) = table(false);
        let err = t.add(Gpa::new(0), 1 << 62, false).unwrap_err();
        assert!(matches!(err, VmmError::OutOfMemory { size, .. } if size == 1 << 62));
        assert_eq!(err.kind(), crate::ErrorKind::Setup);
        assert!(t.find(Gpa::new(0)).is_none());
        assert!(hv.mappings().is_empty());
    }

    #[test]
    fn tracked_protection_keeps_dirty_pages_writable() {
        let (mut t, hv) = table(true);
        t.add_with_layout(Gpa::new(0x10000), &[0x1000, 0x4000], false)
            .unwrap();
        assert!(t.mark_dirty(Gpa::new(0x12345)).unwrap());
        let before = hv.protections().len();

        t.set_protection(Gpa::new(0x11000), 0x4000, true, false)
            .unwrap();
        t.set_protection(Gpa::new(0x11000), 0x4000, true, true)
            .unwrap();
        let rx = MemoryPermissions::READ | MemoryPermissions::EXECUTE;
        assert_eq!(
            hv.protections()[before..],
            [
                (Gpa::new(0x11000), 0x4000, rx),
                (Gpa::new(0x11000), 0x1000, rx),
                (Gpa::new(0x12000), 0x1000, MemoryPermissions::RWX),
                (Gpa::new(0x13000), 0x2000, rx),
            ]
        );
    }

    #[test]
    fn clear_unmaps_before_release() {
        let (mut t, hv) = table(false);
        let region = t.add(Gpa::new(0x1000), 0x1000, false).unwrap();
        t.clear();
        assert!(hv.mappings().is_empty());
        // The handle still owns readable host memory.
        region.write_bytes(0, &[1, 2, 3]).unwrap();
        let mut buf = [0; 3];
        region.read_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    proptest! {
        #[test]
        fn regions_partition_the_address_space(
            requests in proptest::collection::vec((0u64..32, 1u64..6), 1..8),
            probes in proptest::collection::vec(0u64..40 * PAGE_SIZE, 32),
        ) {
            let (mut t, _hv) = table(false);
            for (page, pages) in requests {
                let _ = t.add(Gpa::new(page * PAGE_SIZE), pages * PAGE_SIZE, false);
            }
            for gpa in probes.into_iter().map(Gpa::new) {
                let holders = t.regions().filter(|r| r.contains(gpa)).count();
                prop_assert!(holders <= 1);
                prop_assert_eq!(t.find(gpa).is_some(), holders == 1);
            }
        }

        #[test]
        fn dirty_pages_stay_dirty(writes in proptest::collection::vec(0u64..8 * PAGE_SIZE, 1..32)) {
            let (mut t, _hv) = table(true);
            let region = t.add(Gpa::new(0x10000), 8 * PAGE_SIZE, false).unwrap();
            let mut seen = Vec::new();
            for offset in writes {
                let gpa = Gpa::new(0x10000 + offset);
                t.mark_dirty(gpa).unwrap();
                seen.push(gpa);
                for gpa in &seen {
                    prop_assert!(region.is_dirty(*gpa));
                }
            }
        }
    }
}
