//! Register file of a guest processor.

/// X86_64 general purpose registers
///
/// Unlike the hardware's own frame layout, the fields follow the instruction
/// encoding order so that a register number taken from an exit qualification
/// or a ModR/M byte can be used with [`GeneralPurposeRegisters::get`] directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GeneralPurposeRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralPurposeRegisters {
    fn slot(&mut self, index: usize) -> &mut u64 {
        match index & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        }
    }

    /// Read a register by its encoding number (0 = rax .. 15 = r15).
    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        let mut copy = *self;
        *copy.slot(index)
    }

    /// Write a register by its encoding number (0 = rax .. 15 = r15).
    #[inline]
    pub fn set(&mut self, index: usize, v: u64) {
        *self.slot(index) = v;
    }

    /// Write the low `size` bytes of a register, preserving the rest.
    ///
    /// 4-byte writes zero the upper half as the processor does in 64-bit
    /// mode.
    pub fn set_sized(&mut self, index: usize, size: usize, v: u64) {
        let slot = self.slot(index);
        *slot = match size {
            1 => (*slot & !0xff) | (v & 0xff),
            2 => (*slot & !0xffff) | (v & 0xffff),
            4 => v & 0xffff_ffff,
            _ => v,
        };
    }
}
