use crate::{
    memory::{Gpa, MemoryRegionTable},
    registers::{Registers, Segment},
    VmmError, PAGE_SIZE,
};

/// Traits to probe guest memory.
pub trait Probe {
    /// Translate `len` bytes at a guest physical address to a host virtual address.
    fn gpa2hva(&self, gpa: Gpa, len: u64) -> Option<*mut u8>;

    /// Number of bytes backed contiguously from `gpa` on; zero if `gpa` is unbacked.
    fn contiguous_len(&self, gpa: Gpa) -> u64;

    /// Record a guest write to `gpa`.
    fn note_guest_write(&self, _gpa: Gpa) -> Result<(), VmmError> {
        Ok(())
    }

    /// Translate a segment-relative guest address to a guest physical address.
    ///
    /// Only real-address mode is implemented: the result is the cached segment base plus
    /// `offset`. Any other mode fails with [`VmmError::UnsupportedAddressTranslation`].
    fn gva2gpa(&self, regs: &Registers, segment: Segment, offset: u64) -> Result<Gpa, VmmError> {
        if !regs.is_real_mode()? {
            return Err(VmmError::UnsupportedAddressTranslation);
        }
        let base = regs.segment(segment)?.base;
        Ok(Gpa::new(base.wrapping_add(offset) & 0xffff_ffff))
    }

    /// Copy guest memory at `gpa` into `buf`.
    fn read_guest(&self, gpa: Gpa, buf: &mut [u8]) -> Result<(), VmmError> {
        let src = self
            .gpa2hva(gpa, buf.len() as u64)
            .ok_or(VmmError::InvalidMemoryRegion {
                gpa,
                size: buf.len() as u64,
            })?;
        // SAFETY: `gpa2hva` checked that the span is backed.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `buf` into guest memory at `gpa`, on behalf of the guest.
    fn write_guest(&self, gpa: Gpa, buf: &[u8]) -> Result<(), VmmError> {
        let dst = self
            .gpa2hva(gpa, buf.len() as u64)
            .ok_or(VmmError::InvalidMemoryRegion {
                gpa,
                size: buf.len() as u64,
            })?;
        // SAFETY: `gpa2hva` checked that the span is backed.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) };
        let mut page = gpa.page_down();
        while page < gpa + buf.len() as u64 {
            self.note_guest_write(page)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

impl Probe for MemoryRegionTable {
    fn gpa2hva(&self, gpa: Gpa, len: u64) -> Option<*mut u8> {
        self.translate(gpa, len).ok()
    }

    fn contiguous_len(&self, gpa: Gpa) -> u64 {
        self.find(gpa)
            .map(|r| r.size() - (gpa - r.guest_address()))
            .unwrap_or(0)
    }

    fn note_guest_write(&self, gpa: Gpa) -> Result<(), VmmError> {
        self.mark_dirty(gpa).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockHypervisor;
    use crate::registers::{RegisterCache, SegmentRegister};
    use crate::x86::{AccessRights, Cr0};
    use crate::HypervisorBackend;
    use std::sync::Arc;

    #[test]
    fn real_mode_translation_uses_the_segment_base() {
        let hv = MockHypervisor::new();
        let mut cache = RegisterCache::new(hv.create_vcpu().unwrap());
        cache.set_cr0(Cr0::ET).unwrap();
        cache
            .set_segment(Segment::Cs, SegmentRegister::real_mode(0xf000, AccessRights::P))
            .unwrap();
        let table = MemoryRegionTable::new(Arc::new(MockHypervisor::new()), false);
        assert_eq!(
            table.gva2gpa(&cache, Segment::Cs, 0xfff0).unwrap(),
            Gpa::new(0xffff0)
        );

        cache.set_cr0(Cr0::PE | Cr0::ET).unwrap();
        assert!(matches!(
            table.gva2gpa(&cache, Segment::Cs, 0xfff0),
            Err(VmmError::UnsupportedAddressTranslation)
        ));
    }

    #[test]
    fn guest_writes_mark_every_touched_page() {
        let hv = Arc::new(MockHypervisor::new());
        let mut table = MemoryRegionTable::new(hv, true);
        let region = table.add(Gpa::new(0x1000), 0x3000, false).unwrap();
        table.write_guest(Gpa::new(0x1ffe), &[1, 2, 3, 4]).unwrap();
        assert_eq!(region.dirty_pages(), vec![Gpa::new(0x1000), Gpa::new(0x2000)]);
        assert_eq!(table.contiguous_len(Gpa::new(0x3ff0)), 0x10);
        assert_eq!(table.contiguous_len(Gpa::new(0x4000)), 0);

        let mut buf = [0; 4];
        table.read_guest(Gpa::new(0x1ffe), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
