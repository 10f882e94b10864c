//! Instruction emulation for exits the hardware cannot complete.
//!
//! Accesses to device memory and string port I/O end up here. The
//! instruction at guest rip is decoded with `iced_x86`, its memory operands
//! are resolved against the guest's segments and page tables, and the access
//! is replayed against the address spaces of the vm.
use crate::{
    addressing::Gva,
    vcpu::GenericVCpuState,
    vmcs::Field,
    vmexit::pio::port_io,
    Probe, VmError,
};
use abyss::x86_64::{segmentation::SegmentRegister, Rflags};
use iced_x86::{Instruction, MemorySize, Mnemonic, OpKind, Register};

/// Decoder and executor of guest instructions.
pub trait Emulator: Send {
    /// Decode the instruction at guest rip.
    fn decode<P: Probe>(
        &mut self,
        p: &P,
        state: &GenericVCpuState,
    ) -> Result<Instruction, VmError> {
        state.vmcs.get_instruction(p)
    }

    /// Execute `insn` on behalf of the guest and move rip past it.
    fn emulate<P: Probe>(
        &mut self,
        insn: &Instruction,
        p: &P,
        state: &mut GenericVCpuState,
    ) -> Result<(), VmError>;
}

/// An interpreter for the data-movement and arithmetic instructions that
/// guests use on device memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreter;

impl Emulator for Interpreter {
    fn emulate<P: Probe>(
        &mut self,
        insn: &Instruction,
        p: &P,
        state: &mut GenericVCpuState,
    ) -> Result<(), VmError> {
        log::trace!("emulate {:?} at {:#x}", insn.code(), insn.ip());
        match insn.mnemonic() {
            Mnemonic::Mov => {
                let size = operand_size(insn, 0)?;
                let v = read_operand(insn, 1, p, state)?;
                write_operand(insn, 0, size, v, p, state)?;
            }
            Mnemonic::Movzx => {
                let size = operand_size(insn, 0)?;
                let v = read_operand(insn, 1, p, state)?;
                write_operand(insn, 0, size, v, p, state)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let size = operand_size(insn, 0)?;
                let from = operand_size(insn, 1)?;
                let v = sign_extend(read_operand(insn, 1, p, state)?, from);
                write_operand(insn, 0, size, v, p, state)?;
            }
            Mnemonic::Xchg => {
                let size = operand_size(insn, 0)?;
                let a = read_operand(insn, 0, p, state)?;
                let b = read_operand(insn, 1, p, state)?;
                write_operand(insn, 0, size, b, p, state)?;
                write_operand(insn, 1, size, a, p, state)?;
            }
            m @ (Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::Cmp
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Test) => {
                let size = operand_size(insn, 0)?;
                let a = read_operand(insn, 0, p, state)?;
                let b = read_operand(insn, 1, p, state)?;
                let (result, flags) = alu(m, a, b, size);
                if !matches!(m, Mnemonic::Cmp | Mnemonic::Test) {
                    write_operand(insn, 0, size, result, p, state)?;
                }
                let rflags = state.vmcs.read(Field::GuestRflags)?;
                state
                    .vmcs
                    .write(Field::GuestRflags, (rflags & !ALU_FLAGS.bits()) | flags.bits())?;
            }
            Mnemonic::Stosb
            | Mnemonic::Stosw
            | Mnemonic::Stosd
            | Mnemonic::Stosq
            | Mnemonic::Lodsb
            | Mnemonic::Lodsw
            | Mnemonic::Lodsd
            | Mnemonic::Lodsq
            | Mnemonic::Movsb
            | Mnemonic::Movsw
            | Mnemonic::Movsq
            | Mnemonic::Insb
            | Mnemonic::Insw
            | Mnemonic::Insd
            | Mnemonic::Outsb
            | Mnemonic::Outsw
            | Mnemonic::Outsd => string_op(insn, p, state)?,
            // movsd shares its mnemonic with the SSE move.
            Mnemonic::Movsd if insn.op0_kind() == OpKind::MemoryESDI
                || insn.op0_kind() == OpKind::MemoryESEDI
                || insn.op0_kind() == OpKind::MemoryESRDI =>
            {
                string_op(insn, p, state)?
            }
            Mnemonic::In => {
                let size = operand_size(insn, 0)?;
                let port = read_operand(insn, 1, p, state)? as u16;
                let mut v = 0;
                port_io(state, port, size as u8, &mut v, false)?;
                write_operand(insn, 0, size, v, p, state)?;
            }
            Mnemonic::Out => {
                let size = operand_size(insn, 1)?;
                let port = read_operand(insn, 0, p, state)? as u16;
                let mut v = read_operand(insn, 1, p, state)?;
                port_io(state, port, size as u8, &mut v, true)?;
            }
            m => return Err(VmError::UnsupportedInstruction(format!("{:?}", m))),
        }
        state
            .vmcs
            .set_rip(state.exit.rip.wrapping_add(insn.len() as u64))
    }
}

const ALU_FLAGS: Rflags = Rflags::from_bits_truncate(
    Rflags::CF.bits()
        | Rflags::PF.bits()
        | Rflags::AF.bits()
        | Rflags::ZF.bits()
        | Rflags::SF.bits()
        | Rflags::OF.bits(),
);

#[inline]
fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1 << (size * 8)) - 1
    }
}

fn sign_extend(v: u64, size: usize) -> u64 {
    match size {
        1 => v as u8 as i8 as i64 as u64,
        2 => v as u16 as i16 as i64 as u64,
        4 => v as u32 as i32 as i64 as u64,
        _ => v,
    }
}

/// Result and arithmetic flags of a two-operand ALU instruction.
fn alu(m: Mnemonic, a: u64, b: u64, size: usize) -> (u64, Rflags) {
    let msk = mask(size);
    let sign = 1u64 << (size * 8 - 1);
    let (a, b) = (a & msk, b & msk);
    let mut flags = Rflags::empty();
    let result = match m {
        Mnemonic::Add => {
            let r = a.wrapping_add(b) & msk;
            flags.set(Rflags::CF, r < a);
            flags.set(Rflags::OF, (a ^ r) & (b ^ r) & sign != 0);
            flags.set(Rflags::AF, (a ^ b ^ r) & 0x10 != 0);
            r
        }
        Mnemonic::Sub | Mnemonic::Cmp => {
            let r = a.wrapping_sub(b) & msk;
            flags.set(Rflags::CF, a < b);
            flags.set(Rflags::OF, (a ^ b) & (a ^ r) & sign != 0);
            flags.set(Rflags::AF, (a ^ b ^ r) & 0x10 != 0);
            r
        }
        Mnemonic::And | Mnemonic::Test => a & b,
        Mnemonic::Or => a | b,
        _ => a ^ b,
    };
    flags.set(Rflags::ZF, result == 0);
    flags.set(Rflags::SF, result & sign != 0);
    flags.set(Rflags::PF, (result as u8).count_ones() % 2 == 0);
    (result, flags)
}

// Low byte, word, dword and qword names of each register, in encoding order.
const GPR_NAMES: [[Register; 4]; 16] = [
    [Register::AL, Register::AX, Register::EAX, Register::RAX],
    [Register::CL, Register::CX, Register::ECX, Register::RCX],
    [Register::DL, Register::DX, Register::EDX, Register::RDX],
    [Register::BL, Register::BX, Register::EBX, Register::RBX],
    [Register::SPL, Register::SP, Register::ESP, Register::RSP],
    [Register::BPL, Register::BP, Register::EBP, Register::RBP],
    [Register::SIL, Register::SI, Register::ESI, Register::RSI],
    [Register::DIL, Register::DI, Register::EDI, Register::RDI],
    [Register::R8L, Register::R8W, Register::R8D, Register::R8],
    [Register::R9L, Register::R9W, Register::R9D, Register::R9],
    [Register::R10L, Register::R10W, Register::R10D, Register::R10],
    [Register::R11L, Register::R11W, Register::R11D, Register::R11],
    [Register::R12L, Register::R12W, Register::R12D, Register::R12],
    [Register::R13L, Register::R13W, Register::R13D, Register::R13],
    [Register::R14L, Register::R14W, Register::R14D, Register::R14],
    [Register::R15L, Register::R15W, Register::R15D, Register::R15],
];

/// Encoding number, size in bytes and bit offset of a general purpose
/// register.
fn locate(reg: Register) -> Option<(usize, usize, u32)> {
    match reg {
        Register::AH => return Some((0, 1, 8)),
        Register::CH => return Some((1, 1, 8)),
        Register::DH => return Some((2, 1, 8)),
        Register::BH => return Some((3, 1, 8)),
        _ => (),
    }
    GPR_NAMES.iter().enumerate().find_map(|(idx, names)| {
        names
            .iter()
            .position(|&r| r == reg)
            .map(|w| (idx, 1 << w, 0))
    })
}

fn read_register(state: &GenericVCpuState, reg: Register) -> Result<u64, VmError> {
    let (idx, size, shift) = locate(reg)
        .ok_or_else(|| VmError::UnsupportedInstruction(format!("register {:?}", reg)))?;
    Ok((state.gprs.get(idx) >> shift) & mask(size))
}

fn write_register(state: &mut GenericVCpuState, reg: Register, v: u64) -> Result<(), VmError> {
    match locate(reg) {
        Some((idx, 1, 8)) => {
            let old = state.gprs.get(idx);
            state.gprs.set(idx, (old & !0xff00) | ((v & 0xff) << 8));
        }
        Some((idx, size, _)) => state.gprs.set_sized(idx, size, v),
        None => return Err(VmError::UnsupportedInstruction(format!("register {:?}", reg))),
    }
    Ok(())
}

fn memory_size(size: MemorySize) -> Result<usize, VmError> {
    Ok(match size {
        MemorySize::UInt8 | MemorySize::Int8 => 1,
        MemorySize::UInt16 | MemorySize::Int16 | MemorySize::WordOffset => 2,
        MemorySize::UInt32 | MemorySize::Int32 | MemorySize::DwordOffset => 4,
        MemorySize::UInt64 | MemorySize::Int64 | MemorySize::QwordOffset => 8,
        s => return Err(VmError::UnsupportedInstruction(format!("operand size {:?}", s))),
    })
}

fn operand_size(insn: &Instruction, op: u32) -> Result<usize, VmError> {
    match insn.op_kind(op) {
        OpKind::Register => locate(insn.op_register(op))
            .map(|(_, size, _)| size)
            .ok_or_else(|| {
                VmError::UnsupportedInstruction(format!("register {:?}", insn.op_register(op)))
            }),
        OpKind::Immediate8 => Ok(1),
        OpKind::Immediate16 | OpKind::Immediate8to16 => Ok(2),
        OpKind::Immediate32 | OpKind::Immediate8to32 => Ok(4),
        _ => memory_size(insn.memory_size()),
    }
}

fn segment_of(reg: Register) -> SegmentRegister {
    match reg {
        Register::ES => SegmentRegister::Es,
        Register::CS => SegmentRegister::Cs,
        Register::SS => SegmentRegister::Ss,
        Register::FS => SegmentRegister::Fs,
        Register::GS => SegmentRegister::Gs,
        _ => SegmentRegister::Ds,
    }
}

/// Linear address of the explicit memory operand.
fn effective_address(insn: &Instruction, state: &GenericVCpuState) -> Result<Gva, VmError> {
    let base = insn.memory_base();
    let index = insn.memory_index();
    let offset = if base == Register::RIP || base == Register::EIP {
        insn.memory_displacement64()
    } else {
        let mut ea = insn.memory_displacement64();
        // The address size follows the width of the registers used.
        let mut width = 0;
        if base != Register::None {
            ea = ea.wrapping_add(read_register(state, base)?);
            width = locate(base).map_or(0, |(_, size, _)| size);
        }
        if index != Register::None {
            ea = ea.wrapping_add(read_register(state, index)?.wrapping_mul(insn.memory_index_scale() as u64));
            width = locate(index).map_or(width, |(_, size, _)| size);
        }
        if width == 0 {
            width = match state.vmcs.code_bitness()? {
                64 => 8,
                32 => 4,
                _ => 2,
            };
        }
        ea & mask(width)
    };
    state
        .vmcs
        .linear_address(segment_of(insn.memory_segment()), offset)
}

/// Access guest virtual memory through the address spaces of the vm.
///
/// Unassigned bytes read as zero and drop writes.
fn access_virt<P: Probe>(
    p: &P,
    state: &GenericVCpuState,
    gva: Gva,
    buf: &mut [u8],
    is_write: bool,
) -> Result<(), VmError> {
    let mut done = 0;
    while done < buf.len() {
        let cur = gva + done as u64;
        let len = (abyss::PAGE_SIZE - (cur.into_u64() as usize & abyss::PAGE_MASK))
            .min(buf.len() - done);
        let gpa = p.gva2gpa(&state.vmcs, cur)?;
        if !state.memory.rw(
            state.vm.memory_space(),
            gpa.into_u64(),
            &mut buf[done..done + len],
            is_write,
        ) {
            log::debug!(
                "unassigned {} at {} ({} bytes)",
                if is_write { "write" } else { "read" },
                gpa,
                len
            );
        }
        done += len;
    }
    Ok(())
}

fn read_memory<P: Probe>(
    p: &P,
    state: &GenericVCpuState,
    gva: Gva,
    size: usize,
) -> Result<u64, VmError> {
    let mut b = [0u8; 8];
    access_virt(p, state, gva, &mut b[..size], false)?;
    Ok(u64::from_le_bytes(b))
}

fn write_memory<P: Probe>(
    p: &P,
    state: &GenericVCpuState,
    gva: Gva,
    size: usize,
    v: u64,
) -> Result<(), VmError> {
    let mut b = v.to_le_bytes();
    access_virt(p, state, gva, &mut b[..size], true)
}

fn read_operand<P: Probe>(
    insn: &Instruction,
    op: u32,
    p: &P,
    state: &GenericVCpuState,
) -> Result<u64, VmError> {
    Ok(match insn.op_kind(op) {
        OpKind::Register => read_register(state, insn.op_register(op))?,
        OpKind::Memory => {
            let size = memory_size(insn.memory_size())?;
            read_memory(p, state, effective_address(insn, state)?, size)?
        }
        OpKind::Immediate8 => insn.immediate8() as u64,
        OpKind::Immediate16 => insn.immediate16() as u64,
        OpKind::Immediate32 => insn.immediate32() as u64,
        OpKind::Immediate64 => insn.immediate64(),
        OpKind::Immediate8to16 => insn.immediate8to16() as u16 as u64,
        OpKind::Immediate8to32 => insn.immediate8to32() as u32 as u64,
        OpKind::Immediate8to64 => insn.immediate8to64() as u64,
        OpKind::Immediate32to64 => insn.immediate32to64() as u64,
        k => return Err(VmError::UnsupportedInstruction(format!("operand {:?}", k))),
    })
}

fn write_operand<P: Probe>(
    insn: &Instruction,
    op: u32,
    size: usize,
    v: u64,
    p: &P,
    state: &mut GenericVCpuState,
) -> Result<(), VmError> {
    match insn.op_kind(op) {
        OpKind::Register => write_register(state, insn.op_register(op), v),
        OpKind::Memory => {
            let gva = effective_address(insn, state)?;
            write_memory(p, state, gva, size, v)
        }
        k => Err(VmError::UnsupportedInstruction(format!("operand {:?}", k))),
    }
}

/// Address width in bytes of a string instruction's implicit operand.
fn string_address_size(kind: OpKind) -> Option<usize> {
    match kind {
        OpKind::MemorySegSI | OpKind::MemoryESDI => Some(2),
        OpKind::MemorySegESI | OpKind::MemoryESEDI => Some(4),
        OpKind::MemorySegRSI | OpKind::MemoryESRDI => Some(8),
        _ => None,
    }
}

/// STOS, LODS, MOVS, INS and OUTS with an optional REP prefix.
fn string_op<P: Probe>(
    insn: &Instruction,
    p: &P,
    state: &mut GenericVCpuState,
) -> Result<(), VmError> {
    const RCX: usize = 1;
    const RSI: usize = 6;
    const RDI: usize = 7;

    let width = (0..insn.op_count())
        .find_map(|op| string_address_size(insn.op_kind(op)))
        .ok_or_else(|| VmError::UnsupportedInstruction(format!("{:?}", insn.code())))?;
    let amask = mask(width);
    let size = memory_size(insn.memory_size())?;
    let down = Rflags::from_bits_truncate(state.vmcs.read(Field::GuestRflags)?).contains(Rflags::DF);
    let step = |v: u64| {
        if down {
            v.wrapping_sub(size as u64) & amask
        } else {
            v.wrapping_add(size as u64) & amask
        }
    };
    let advance = |gprs: &mut abyss::interrupt::GeneralPurposeRegisters, idx: usize| {
        let v = step(gprs.get(idx) & amask);
        gprs.set(idx, (gprs.get(idx) & !amask) | v);
    };
    let rep = insn.has_rep_prefix() || insn.has_repe_prefix() || insn.has_repne_prefix();
    let mut count = if rep {
        state.gprs.get(RCX) & amask
    } else {
        1
    };
    let src_seg = segment_of(insn.memory_segment());
    let port = state.gprs.rdx as u16;

    while count != 0 {
        let si = state.vmcs.linear_address(src_seg, state.gprs.get(RSI) & amask)?;
        let di = state
            .vmcs
            .linear_address(SegmentRegister::Es, state.gprs.get(RDI) & amask)?;
        match insn.mnemonic() {
            Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq => {
                write_memory(p, state, di, size, state.gprs.rax)?;
                advance(state.gprs, RDI);
            }
            Mnemonic::Lodsb | Mnemonic::Lodsw | Mnemonic::Lodsd | Mnemonic::Lodsq => {
                let v = read_memory(p, state, si, size)?;
                state.gprs.set_sized(0, size, v);
                advance(state.gprs, RSI);
            }
            Mnemonic::Insb | Mnemonic::Insw | Mnemonic::Insd => {
                let mut v = 0;
                port_io(state, port, size as u8, &mut v, false)?;
                write_memory(p, state, di, size, v)?;
                advance(state.gprs, RDI);
            }
            Mnemonic::Outsb | Mnemonic::Outsw | Mnemonic::Outsd => {
                let mut v = read_memory(p, state, si, size)?;
                port_io(state, port, size as u8, &mut v, true)?;
                advance(state.gprs, RSI);
            }
            _ => {
                let v = read_memory(p, state, si, size)?;
                write_memory(p, state, di, size, v)?;
                advance(state.gprs, RSI);
                advance(state.gprs, RDI);
            }
        }
        count -= 1;
        if rep {
            let rcx = state.gprs.get(RCX);
            state.gprs.set(RCX, (rcx & !amask) | count);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alu_flags() {
        let (r, f) = alu(Mnemonic::Add, 0xff, 1, 1);
        assert_eq!(r, 0);
        assert!(f.contains(Rflags::CF | Rflags::ZF | Rflags::AF | Rflags::PF));
        assert!(!f.contains(Rflags::OF));

        let (r, f) = alu(Mnemonic::Add, 0x7fff_ffff, 1, 4);
        assert_eq!(r, 0x8000_0000);
        assert!(f.contains(Rflags::OF | Rflags::SF));
        assert!(!f.contains(Rflags::CF));

        let (r, f) = alu(Mnemonic::Cmp, 1, 2, 2);
        assert_eq!(r, 0xffff);
        assert!(f.contains(Rflags::CF | Rflags::SF));

        let (r, f) = alu(Mnemonic::Test, 0xf0, 0x0f, 1);
        assert_eq!(r, 0);
        assert!(f.contains(Rflags::ZF));
        assert!(!f.intersects(Rflags::CF | Rflags::OF));
    }

    #[test]
    fn register_names() {
        assert_eq!(locate(Register::EAX), Some((0, 4, 0)));
        assert_eq!(locate(Register::BH), Some((3, 1, 8)));
        assert_eq!(locate(Register::R13W), Some((13, 2, 0)));
        assert_eq!(locate(Register::RSP), Some((4, 8, 0)));
        assert_eq!(locate(Register::XMM0), None);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0x80, 1), 0xffff_ffff_ffff_ff80);
        assert_eq!(sign_extend(0x7fff, 2), 0x7fff);
        assert_eq!(sign_extend(0x8000_0000, 4) & mask(4), 0x8000_0000);
    }
}
