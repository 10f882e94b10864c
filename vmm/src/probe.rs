//! Access to guest memory from the host.
use crate::{
    addressing::{Gpa, Gva, Hva},
    memory::{AddressSpaceId, MemoryMap},
    slots::SlotManager,
    vmcs::{ActiveVmcs, Field},
    VmError,
};
use abyss::x86_64::{Cr0, Cr4, Efer};

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_HUGE: u64 = 1 << 7;
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Traits to probe vcpu internal state.
///
/// Only [`Probe::gpa2hva`] is mandatory; guest page walks and byte
/// accesses are built on top of it.
pub trait Probe {
    /// Translate guest physical address to host virtual address.
    fn gpa2hva(&self, vmcs: &ActiveVmcs, gpa: Gpa) -> Option<Hva>;

    /// Translate guest virtual address to guest physical address by walking
    /// the guest page tables of the current paging mode.
    fn gva2gpa(&self, vmcs: &ActiveVmcs, gva: Gva) -> Result<Gpa, VmError> {
        let va = gva.into_u64();
        let cr0 = Cr0::from_bits_truncate(vmcs.read(Field::GuestCr0)?);
        if !cr0.contains(Cr0::PG) {
            return Ok(Gpa::new(va));
        }
        let cr3 = vmcs.read(Field::GuestCr3)?;
        let cr4 = Cr4::from_bits_truncate(vmcs.read(Field::GuestCr4)?);
        let efer = Efer::from_bits_truncate(vmcs.read(Field::GuestIa32Efer)?);
        let not_present = || VmError::UnmappedGuestMemory(va);

        let read_entry = |gpa: u64, wide: bool| -> Result<u64, VmError> {
            if wide {
                let mut b = [0u8; 8];
                self.read_phys(vmcs, Gpa::new(gpa), &mut b)?;
                Ok(u64::from_le_bytes(b))
            } else {
                let mut b = [0u8; 4];
                self.read_phys(vmcs, Gpa::new(gpa), &mut b)?;
                Ok(u32::from_le_bytes(b) as u64)
            }
        };

        // Table base and the shifts left to walk.
        let (mut table, shifts): (u64, &[u32]) = if efer.contains(Efer::LMA) {
            if cr4.contains(Cr4::LA57) {
                (cr3 & ENTRY_ADDR_MASK, &[48, 39, 30, 21, 12][..])
            } else {
                (cr3 & ENTRY_ADDR_MASK, &[39, 30, 21, 12][..])
            }
        } else if cr4.contains(Cr4::PAE) {
            let field = [
                Field::GuestIa32Pdpte0,
                Field::GuestIa32Pdpte1,
                Field::GuestIa32Pdpte2,
                Field::GuestIa32Pdpte3,
            ][((va >> 30) & 3) as usize];
            let pdpte = vmcs.read(field)?;
            if pdpte & ENTRY_PRESENT == 0 {
                return Err(not_present());
            }
            (pdpte & ENTRY_ADDR_MASK, &[21, 12][..])
        } else {
            // 32-bit paging.
            let va = va & 0xffff_ffff;
            let pde = read_entry((cr3 & 0xffff_f000) + ((va >> 22) & 0x3ff) * 4, false)?;
            if pde & ENTRY_PRESENT == 0 {
                return Err(not_present());
            }
            if cr4.contains(Cr4::PSE) && pde & ENTRY_HUGE != 0 {
                let base = (pde & 0xffc0_0000) | (((pde >> 13) & 0xff) << 32);
                return Ok(Gpa::new(base | (va & 0x3f_ffff)));
            }
            let pte = read_entry((pde & 0xffff_f000) + ((va >> 12) & 0x3ff) * 4, false)?;
            if pte & ENTRY_PRESENT == 0 {
                return Err(not_present());
            }
            return Ok(Gpa::new((pte & 0xffff_f000) | (va & 0xfff)));
        };

        for &shift in shifts {
            let entry = read_entry(table + ((va >> shift) & 0x1ff) * 8, true)?;
            if entry & ENTRY_PRESENT == 0 {
                return Err(not_present());
            }
            let page_mask = (1u64 << shift) - 1;
            if (shift == 21 || shift == 30) && entry & ENTRY_HUGE != 0 {
                return Ok(Gpa::new((entry & ENTRY_ADDR_MASK & !page_mask) | (va & page_mask)));
            }
            table = entry & ENTRY_ADDR_MASK;
        }
        Ok(Gpa::new(table | (va & 0xfff)))
    }

    /// Translate guest virtual address to host virtual address.
    fn gva2hva(&self, vmcs: &ActiveVmcs, gva: Gva) -> Result<Hva, VmError> {
        let gpa = self.gva2gpa(vmcs, gva)?;
        self.gpa2hva(vmcs, gpa)
            .ok_or(VmError::UnmappedGuestMemory(gpa.into_u64()))
    }

    /// Read guest physical memory.
    fn read_phys(&self, vmcs: &ActiveVmcs, gpa: Gpa, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = gpa + done as u64;
            let len = chunk(cur.into_u64(), buf.len() - done);
            let hva = self
                .gpa2hva(vmcs, cur)
                .ok_or(VmError::UnmappedGuestMemory(cur.into_u64()))?;
            // SAFETY: gpa2hva only hands out addresses of live guest memory
            // and the chunk does not cross a page.
            unsafe {
                std::ptr::copy_nonoverlapping(hva.as_mut_ptr(), buf[done..].as_mut_ptr(), len);
            }
            done += len;
        }
        Ok(())
    }

    /// Write guest physical memory.
    fn write_phys(&self, vmcs: &ActiveVmcs, gpa: Gpa, buf: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = gpa + done as u64;
            let len = chunk(cur.into_u64(), buf.len() - done);
            let hva = self
                .gpa2hva(vmcs, cur)
                .ok_or(VmError::UnmappedGuestMemory(cur.into_u64()))?;
            // SAFETY: as in read_phys.
            unsafe {
                std::ptr::copy_nonoverlapping(buf[done..].as_ptr(), hva.as_mut_ptr(), len);
            }
            done += len;
        }
        Ok(())
    }

    /// Read guest virtual memory.
    fn read_virt(&self, vmcs: &ActiveVmcs, gva: Gva, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = gva + done as u64;
            let len = chunk(cur.into_u64(), buf.len() - done);
            let gpa = self.gva2gpa(vmcs, cur)?;
            self.read_phys(vmcs, gpa, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Write guest virtual memory.
    fn write_virt(&self, vmcs: &ActiveVmcs, gva: Gva, buf: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = gva + done as u64;
            let len = chunk(cur.into_u64(), buf.len() - done);
            let gpa = self.gva2gpa(vmcs, cur)?;
            self.write_phys(vmcs, gpa, &buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }
}

// Bytes left in the page of `addr`, at most `len`.
#[inline]
fn chunk(addr: u64, len: usize) -> usize {
    (abyss::PAGE_SIZE - (addr as usize & abyss::PAGE_MASK)).min(len)
}

/// Guest memory as seen by a vcpu holding the device lock.
///
/// Host pointers come from the slot table. Byte accesses go through the
/// physical address space, so ROM and device memory are reachable too.
pub struct GuestMemory<'a> {
    slots: &'a SlotManager,
    map: &'a MemoryMap,
    space: AddressSpaceId,
}

impl<'a> GuestMemory<'a> {
    pub fn new(slots: &'a SlotManager, map: &'a MemoryMap, space: AddressSpaceId) -> Self {
        Self { slots, map, space }
    }
}

impl Probe for GuestMemory<'_> {
    fn gpa2hva(&self, _vmcs: &ActiveVmcs, gpa: Gpa) -> Option<Hva> {
        self.slots.translate(gpa)
    }

    fn read_phys(&self, _vmcs: &ActiveVmcs, gpa: Gpa, buf: &mut [u8]) -> Result<(), VmError> {
        if self.map.rw(self.space, gpa.into_u64(), buf, false) {
            Ok(())
        } else {
            Err(VmError::UnmappedGuestMemory(gpa.into_u64()))
        }
    }

    fn write_phys(&self, _vmcs: &ActiveVmcs, gpa: Gpa, buf: &[u8]) -> Result<(), VmError> {
        let mut copy = buf.to_vec();
        if self.map.rw(self.space, gpa.into_u64(), &mut copy, true) {
            Ok(())
        } else {
            Err(VmError::UnmappedGuestMemory(gpa.into_u64()))
        }
    }
}
