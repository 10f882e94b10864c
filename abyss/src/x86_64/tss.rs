//! Task-state segment

use core::ops::Range;

/// 32bit task state segment.
///
/// See Intel (R) 64 and IA-32 Architectures Software Developer’s Manual, Volume
/// 3A: System Programming Guide, Part 1 Figure 7-2.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TaskStateSegment32 {
    pub prev_tss: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

impl TaskStateSegment32 {
    /// Size of the image in guest memory.
    pub const SIZE: usize = 104;
    /// Smallest descriptor limit of a valid 32-bit TSS.
    pub const MIN_LIMIT: u64 = 0x67;
    /// Offset of the back link.
    pub const PREV_TSS_OFFSET: usize = 0;
    /// Bytes written back to the outgoing task: the dynamic fields from EIP up
    /// to, but excluding, the LDT selector.
    pub const DYNAMIC_FIELDS: Range<usize> = 0x20..0x60;

    /// Parse the little-endian image read from guest memory.
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        let d = |off: usize| u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]]);
        let w = |off: usize| u16::from_le_bytes([b[off], b[off + 1]]);
        Self {
            prev_tss: d(0x00),
            esp0: d(0x04),
            ss0: d(0x08),
            esp1: d(0x0c),
            ss1: d(0x10),
            esp2: d(0x14),
            ss2: d(0x18),
            cr3: d(0x1c),
            eip: d(0x20),
            eflags: d(0x24),
            eax: d(0x28),
            ecx: d(0x2c),
            edx: d(0x30),
            ebx: d(0x34),
            esp: d(0x38),
            ebp: d(0x3c),
            esi: d(0x40),
            edi: d(0x44),
            es: d(0x48),
            cs: d(0x4c),
            ss: d(0x50),
            ds: d(0x54),
            fs: d(0x58),
            gs: d(0x5c),
            ldt: d(0x60),
            trap: w(0x64),
            iomap_base: w(0x66),
        }
    }

    /// Serialize into the little-endian guest image.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        let dwords = [
            self.prev_tss,
            self.esp0,
            self.ss0,
            self.esp1,
            self.ss1,
            self.esp2,
            self.ss2,
            self.cr3,
            self.eip,
            self.eflags,
            self.eax,
            self.ecx,
            self.edx,
            self.ebx,
            self.esp,
            self.ebp,
            self.esi,
            self.edi,
            self.es,
            self.cs,
            self.ss,
            self.ds,
            self.fs,
            self.gs,
            self.ldt,
        ];
        for (i, v) in dwords.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        b[0x64..0x66].copy_from_slice(&self.trap.to_le_bytes());
        b[0x66..0x68].copy_from_slice(&self.iomap_base.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(core::mem::size_of::<TaskStateSegment32>(), TaskStateSegment32::SIZE);
        let tss = TaskStateSegment32 {
            eip: 0xdead_beef,
            ldt: 0x28,
            iomap_base: 0x68,
            ..Default::default()
        };
        let b = tss.to_bytes();
        assert_eq!(&b[0x20..0x24], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&b[0x60..0x64], &0x28u32.to_le_bytes());
        assert_eq!(&b[0x66..0x68], &0x68u16.to_le_bytes());
        assert_eq!(TaskStateSegment32::from_bytes(&b), tss);
    }
}
