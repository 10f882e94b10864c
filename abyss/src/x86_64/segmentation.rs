//! Segmentation.

use super::PrivilegeLevel;

bitflags::bitflags! {
    /// Access permission bits of a legacy segment descriptor.
    pub struct SegmentAccess: u64 {
        /// Granularity
        const G = 1 << 55;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment)
        const D_B = 1 << 54;
        /// 64-bit code segment (IA-32e mode only)
        const L = 1 << 53;
        /// Available for use by system software
        const AVL = 1 << 52;

        /// Segment present
        const P = 1 << 47;
        /// Descriptor type  (0 = system; 1 = code or data).
        const S = 1 << 44;
        /// Data or Code
        const CODE = 1 << 43;
        /// Expand_down/Conforming.
        const EC = 1 << 42;
        /// Writable/Readable. For a TSS descriptor, the busy bit.
        const WR = 1 << 41;
        /// Accessed.
        const A = 1 << 40;
    }
}

impl SegmentAccess {
    const BASE_31_24_SHIFT: u64 = 56;
    const SEG_LIMIT_SHIFT: u64 = 48;
    const DPL_SHIFT: u64 = 45;
    const BASE_23_0_SHIFT: u64 = 16;
    const TYPE_SHIFT: u64 = 40;
}

/// System descriptor types that matter for task switching.
pub mod system_type {
    /// Available 16-bit TSS.
    pub const TSS16_AVAILABLE: u8 = 0x1;
    /// Busy 16-bit TSS.
    pub const TSS16_BUSY: u8 = 0x3;
    /// Task gate.
    pub const TASK_GATE: u8 = 0x5;
    /// Available 32-bit TSS.
    pub const TSS32_AVAILABLE: u8 = 0x9;
    /// Busy 32-bit TSS.
    pub const TSS32_BUSY: u8 = 0xb;
    /// Set in the type of every 32-bit system descriptor.
    pub const SIZE_32: u8 = 0x8;
    /// Busy bit of a TSS descriptor type.
    pub const BUSY: u8 = 0x2;
}

/// Legacy (8-byte) segment descriptor as stored in a guest GDT or LDT.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// Create a null segment.
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Create a new segment.
    #[inline]
    pub const fn new(base: u64, limit: u64, access: SegmentAccess, dpl: PrivilegeLevel) -> Self {
        let (limit_15_0, base_23_0, access, dpl, limit_19_16, base_31_24) = (
            limit & 0xffff,
            base & 0xff_ffff,
            access.bits(),
            dpl as u64,
            (limit >> 16) & 0xf,
            (base >> 24) & 0xff,
        );

        Self(
            limit_15_0
                | base_23_0 << SegmentAccess::BASE_23_0_SHIFT
                | access
                | dpl << SegmentAccess::DPL_SHIFT
                | limit_19_16 << SegmentAccess::SEG_LIMIT_SHIFT
                | base_31_24 << SegmentAccess::BASE_31_24_SHIFT,
        )
    }

    /// Create a new system segment of `ty` (e.g. [`system_type::TSS32_AVAILABLE`]).
    #[inline]
    pub const fn new_system(base: u64, limit: u64, ty: u8, dpl: PrivilegeLevel) -> Self {
        let d = Self::new(base, limit, SegmentAccess::P, dpl);
        Self(d.0 | ((ty as u64 & 0xf) << SegmentAccess::TYPE_SHIFT))
    }

    /// Reinterpret a raw descriptor read from guest memory.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw descriptor.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Linear base address.
    #[inline]
    pub const fn base(self) -> u64 {
        ((self.0 >> SegmentAccess::BASE_23_0_SHIFT) & 0xff_ffff)
            | (((self.0 >> SegmentAccess::BASE_31_24_SHIFT) & 0xff) << 24)
    }

    /// Raw 20-bit limit field.
    #[inline]
    pub const fn raw_limit(self) -> u64 {
        (self.0 & 0xffff) | (((self.0 >> SegmentAccess::SEG_LIMIT_SHIFT) & 0xf) << 16)
    }

    /// Limit in bytes, scaled by the granularity bit.
    #[inline]
    pub const fn limit(self) -> u64 {
        let limit = self.raw_limit();
        if self.0 & SegmentAccess::G.bits() != 0 {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    /// Four-bit type field.
    #[inline]
    pub const fn ty(self) -> u8 {
        ((self.0 >> SegmentAccess::TYPE_SHIFT) & 0xf) as u8
    }

    /// Descriptor privilege level.
    #[inline]
    pub const fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_bits(self.0 >> SegmentAccess::DPL_SHIFT)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & SegmentAccess::P.bits() != 0
    }

    /// Code or data descriptor (S = 1).
    #[inline]
    pub const fn is_code_or_data(self) -> bool {
        self.0 & SegmentAccess::S.bits() != 0
    }

    /// Set or clear the busy bit of a TSS descriptor.
    #[inline]
    pub fn set_busy(&mut self, busy: bool) {
        let bit = (system_type::BUSY as u64) << SegmentAccess::TYPE_SHIFT;
        if busy {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Access rights in the layout used by VMCS guest segment fields.
    #[inline]
    pub const fn vmx_access_rights(self) -> u32 {
        ((self.0 >> SegmentAccess::TYPE_SHIFT) & 0xf0ff) as u32
    }
}

/// X86_64's segment selector.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl core::fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("ldt", &self.is_local())
            .field("rpl", &self.rpl())
            .finish()
    }
}

impl SegmentSelector {
    /// Create a new GDT SegmentSelector from the index and rpl.
    #[inline]
    pub const fn new(index: u16, rpl: PrivilegeLevel) -> Self {
        Self((index << 3) | rpl as u16)
    }

    /// Reinterpret a raw selector value.
    #[inline]
    pub const fn from_raw(v: u16) -> Self {
        Self(v)
    }

    /// Pack the SegmentSelector into a word.
    #[inline]
    pub const fn pack(self) -> u16 {
        self.0
    }

    /// Get index of the SegmentSelector.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Whether the selector refers to the LDT.
    #[inline]
    pub const fn is_local(self) -> bool {
        self.0 & 4 != 0
    }

    /// Byte offset of the descriptor inside its table.
    #[inline]
    pub const fn table_offset(self) -> u64 {
        (self.0 & !7) as u64
    }

    /// Get the requested privilege level.
    #[inline]
    pub const fn rpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_bits(self.0 as u64)
    }
}

/// Segment registers of the guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SegmentRegister {
    /// Extra Segment.
    Es,
    /// Code Segment.
    Cs,
    /// Stack Segment.
    Ss,
    /// Data Segment.
    Ds,
    /// Extra Segment (E -> F).
    Fs,
    /// Extra Segment (F -> G).
    Gs,
    /// Local descriptor table.
    Ldtr,
    /// Task register.
    Tr,
}

impl SegmentRegister {
    /// Every segment register, in the order of the x86 encoding followed by
    /// the system segments.
    pub const ALL: [SegmentRegister; 8] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
    ];
}
