//! Interrupt.

use num_enum::TryFromPrimitive;

/// Exception vector enumeration of the x86_64.
///
/// See Intel 64 and IA-32 Architectures Software Developer’s Manual, Volume
/// 3A: System Programming Guide, Part 1, Chapter 6.15.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionVector {
    /// Interrupt 0 - Divide Error Exception (#DE)
    DivideError = 0,
    /// Interrupt 1 - Debug Exception (#DB)
    Debug = 1,
    /// Interrupt 2 - NonMaskableInterrupt Interrupt
    NonMaskableInterrupt = 2,
    /// Interrupt 3 - Breakpoint Exception (#BP)
    Breakpoint = 3,
    /// Interrupt 4 - Overflow Exception (#OF)
    OverflowException = 4,
    /// Interrupt 5 - Bound Range Exceeded Exception (#BR)
    BoundRangeExceeded = 5,
    /// Interrupt 6 - Invalid Opcode Exception (#UD)
    InvalidOpcode = 6,
    /// Interrupt 7 - Device Not Available Exception (#NM)
    DeviceNotAvailable = 7,
    /// Interrupt 8 - Double Fault Exception (#DF)
    DoubleFault = 8,
    /// Interrupt 9 - Coprocessor Segment Overrun
    CoprocessorSegmentOverrun = 9,
    /// Interrupt 10 - Invalid TSS Exception (#TS)
    InvalidTss = 10,
    /// Interrupt 11 - Segment Not Present (#NP)
    SegmentNotPresent = 11,
    /// Interrupt 12 - Stack Fault Exception (#SS)
    StackFault = 12,
    /// Interrupt 13 - General Protection Exception (#GP)
    GeneralProtection = 13,
    /// Interrupt 14 - Page-Fault Exception (#PF)
    PageFault = 14,
    /// Interrupt 16 - x87 FPU Floating-Point Error (#MF)
    X87FpuFloatingPointError = 16,
    /// Interrupt 17 - Alignment Check Exception (#AC)
    AlignmentCheckException = 17,
    /// Interrupt 18 - Machine-Check Exception (#MC)
    MachineCheckException = 18,
    /// Interrupt 19 - SIMD Floating-Point Exception (#XM)
    SimdFloatingPointException = 19,
    /// Interrupt 20 - Virtualization Exception (#VE)
    VirtualizationException = 20,
}

impl ExceptionVector {
    /// Whether the processor pushes an error code for this exception.
    pub const fn has_error_code(self) -> bool {
        matches!(
            self,
            Self::DoubleFault
                | Self::InvalidTss
                | Self::SegmentNotPresent
                | Self::StackFault
                | Self::GeneralProtection
                | Self::PageFault
                | Self::AlignmentCheckException
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn vector_decode() {
        assert_eq!(ExceptionVector::try_from(3), Ok(ExceptionVector::Breakpoint));
        assert!(ExceptionVector::try_from(15).is_err());
        assert!(ExceptionVector::GeneralProtection.has_error_code());
        assert!(!ExceptionVector::Breakpoint.has_error_code());
    }
}
