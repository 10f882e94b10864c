//! Port-mapped IO exits.
//!
//! Single `in`/`out` transfers are served straight from the exit
//! qualification. String forms go through the instruction emulator, which
//! calls back into [`port_io`] once per element.
use crate::{
    emulate::Emulator,
    vcpu::{GenericVCpuState, VmexitResult},
    vmcs::IoQualification,
    Probe, VmError,
};

/// First port of the guest agent.
pub const AGENT_PORT_BASE: u16 = 0x1850;
/// Number of guest agent ports, one per 32-bit word.
pub const AGENT_PORT_COUNT: u16 = 4;

/// Handler of the guest agent ports.
///
/// The ports carry a request/response protocol between the guest and a
/// helper of the embedding program. Accesses to them never reach the I/O
/// address space.
pub trait GuestAgent: Send {
    /// Read from agent port `channel` (0-3).
    fn read(&mut self, channel: usize, size: u8) -> u64;
    /// Write to agent port `channel` (0-3).
    fn write(&mut self, channel: usize, size: u8, value: u64);
}

/// An agent that reads zeros and drops writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAgent;

impl GuestAgent for NullAgent {
    fn read(&mut self, _channel: usize, _size: u8) -> u64 {
        0
    }

    fn write(&mut self, _channel: usize, _size: u8, _value: u64) {}
}

/// Agent channel of `port`, if it is one of the agent ports.
pub const fn agent_channel(port: u16) -> Option<usize> {
    if port >= AGENT_PORT_BASE
        && port < AGENT_PORT_BASE + AGENT_PORT_COUNT * 4
        && port & 3 == 0
    {
        Some(((port - AGENT_PORT_BASE) / 4) as usize)
    } else {
        None
    }
}

/// Perform one port access of `size` bytes.
///
/// Reads from ports nobody claims return all ones.
pub fn port_io(
    state: &mut GenericVCpuState,
    port: u16,
    size: u8,
    value: &mut u64,
    is_write: bool,
) -> Result<(), VmError> {
    if let Some(channel) = agent_channel(port) {
        if is_write {
            state.agent.write(channel, size, *value);
        } else {
            *value = state.agent.read(channel, size);
        }
        return Ok(());
    }

    let mut buf = value.to_le_bytes();
    let len = (size as usize).min(buf.len());
    let accepted = state
        .memory
        .rw(state.vm.io_space(), port as u64, &mut buf[..len], is_write);
    if !accepted {
        log::trace!(
            "unassigned port {} {:#x} ({} bytes)",
            if is_write { "write" } else { "read" },
            port,
            size
        );
    }
    if !is_write {
        *value = if accepted {
            u64::from_le_bytes(buf)
        } else {
            u64::MAX >> (64 - len * 8)
        };
    }
    Ok(())
}

/// Handle an I/O instruction exit.
pub fn handle<E: Emulator, P: Probe>(
    emulator: &mut E,
    io: IoQualification,
    p: &mut P,
    state: &mut GenericVCpuState,
) -> Result<VmexitResult, VmError> {
    if !io.is_string {
        if io.is_in {
            let mut v = 0;
            port_io(state, io.port, io.size, &mut v, false)?;
            match io.size {
                1 | 2 => state.gprs.set_sized(0, io.size as usize, v),
                _ => state.gprs.rax = v as u32 as u64,
            }
        } else {
            let mut v = state.gprs.rax;
            port_io(state, io.port, io.size, &mut v, true)?;
        }
        state.vmcs.forward_rip()?;
        return Ok(VmexitResult::Ok);
    }

    let insn = emulator.decode(p, state)?;
    if insn.len() as u64 != state.exit.instruction_length {
        return Err(VmError::InstructionLengthMismatch {
            decoded: insn.len(),
            reported: state.exit.instruction_length as usize,
        });
    }
    emulator.emulate(&insn, p, state)?;
    Ok(VmexitResult::Ok)
}
