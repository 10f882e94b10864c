//! Emulation of hardware task switches.
//!
//! VMX always exits on a task switch. The switch is replayed here on the
//! guest's descriptor tables and 32-bit task state segments:
//!
//! 1. Both TSS descriptors are read and the new one is validated.
//! 2. Busy bits are updated according to what initiated the switch.
//! 3. The outgoing register file is stored in the old TSS and the incoming
//!    one loaded from the new TSS.
//! 4. CR0.TS is set and TR is reloaded.
//!
//! Segment registers are loaded by selector only; their descriptor caches
//! keep the values of the outgoing task.
use crate::{
    addressing::Gva,
    regs::DescriptorTable,
    vcpu::GenericVCpuState,
    vmcs::{
        ActiveVmcs, Field, InterruptionType, SegmentCache, SegmentFields, TaskSwitchQualification,
        TaskSwitchSource,
    },
    Probe, VmError,
};
use abyss::x86_64::{
    segmentation::{system_type, SegmentDescriptor, SegmentRegister, SegmentSelector},
    tss::TaskStateSegment32,
    Cr0, Rflags,
};

/// Smallest limit of any TSS, 16-bit ones included.
const MIN_TSS16_LIMIT: u64 = 0x2b;

/// Data segments saved to and loaded from a 32-bit TSS, in image order.
const TSS_SEGMENTS: [SegmentRegister; 6] = [
    SegmentRegister::Es,
    SegmentRegister::Cs,
    SegmentRegister::Ss,
    SegmentRegister::Ds,
    SegmentRegister::Fs,
    SegmentRegister::Gs,
];

fn descriptor_table(vmcs: &ActiveVmcs, sel: SegmentSelector) -> Result<DescriptorTable, VmError> {
    Ok(if sel.is_local() {
        let ldtr = vmcs.read_segment(SegmentRegister::Ldtr)?;
        DescriptorTable {
            base: ldtr.base,
            limit: ldtr.limit,
        }
    } else {
        DescriptorTable {
            base: vmcs.read(Field::GuestGdtrBase)?,
            limit: vmcs.read(Field::GuestGdtrLimit)? as u32,
        }
    })
}

/// Linear address of the descriptor `sel` refers to.
fn descriptor_address(vmcs: &ActiveVmcs, sel: SegmentSelector) -> Result<Gva, VmError> {
    let table = descriptor_table(vmcs, sel)?;
    if sel.table_offset() + 7 > table.limit as u64 {
        return Err(VmError::InvalidTss(sel.pack()));
    }
    Ok(Gva::new(table.base + sel.table_offset()))
}

fn read_descriptor<P: Probe>(
    p: &P,
    vmcs: &ActiveVmcs,
    sel: SegmentSelector,
) -> Result<SegmentDescriptor, VmError> {
    let mut raw = [0u8; 8];
    p.read_virt(vmcs, descriptor_address(vmcs, sel)?, &mut raw)?;
    Ok(SegmentDescriptor::from_raw(u64::from_le_bytes(raw)))
}

fn write_descriptor<P: Probe>(
    p: &P,
    vmcs: &ActiveVmcs,
    sel: SegmentSelector,
    desc: SegmentDescriptor,
) -> Result<(), VmError> {
    p.write_virt(vmcs, descriptor_address(vmcs, sel)?, &desc.raw().to_le_bytes())
}

/// The IDT gate of `vector`.
fn read_gate<P: Probe>(p: &P, vmcs: &ActiveVmcs, vector: u8) -> Result<SegmentDescriptor, VmError> {
    let base = vmcs.read(Field::GuestIdtrBase)?;
    let mut raw = [0u8; 8];
    p.read_virt(vmcs, Gva::new(base + vector as u64 * 8), &mut raw)?;
    Ok(SegmentDescriptor::from_raw(u64::from_le_bytes(raw)))
}

/// Replay the task switch described by `q`.
pub fn handle_task_switch<P: Probe>(
    q: TaskSwitchQualification,
    p: &P,
    state: &mut GenericVCpuState,
) -> Result<(), VmError> {
    let vmcs = state.vmcs;
    let new_sel = SegmentSelector::from_raw(q.selector);
    let tr = vmcs.read_segment(SegmentRegister::Tr)?;
    let old_sel = SegmentSelector::from_raw(tr.selector);

    let mut next = read_descriptor(p, &vmcs, new_sel)?;
    let mut curr = read_descriptor(p, &vmcs, old_sel)?;

    // INT n through a task gate is subject to the gate's privilege.
    let idt = state.exit.idt_vectoring;
    let software = idt.is_valid()
        && idt
            .interruption_type()
            .map_or(false, InterruptionType::is_software);
    if q.source == TaskSwitchSource::IdtGate && software {
        let dpl = read_gate(p, &vmcs, idt.vector())?.dpl();
        let cs = SegmentSelector::from_raw(vmcs.read_segment(SegmentRegister::Cs)?.selector);
        if new_sel.rpl() > dpl || cs.rpl() > dpl {
            return Err(VmError::TaskSwitchFault(q.selector));
        }
    }

    let limit = next.limit();
    if !next.is_present()
        || next.is_code_or_data()
        || (limit < TaskStateSegment32::MIN_LIMIT && next.ty() & system_type::SIZE_32 != 0)
        || limit < MIN_TSS16_LIMIT
    {
        return Err(VmError::InvalidTss(q.selector));
    }
    if next.ty() & system_type::SIZE_32 == 0 {
        return Err(VmError::TaskSwitch16);
    }

    if matches!(q.source, TaskSwitchSource::Iret | TaskSwitchSource::Jmp) {
        curr.set_busy(false);
        write_descriptor(p, &vmcs, old_sel, curr)?;
    }
    let mut rflags = Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?);
    if q.source == TaskSwitchSource::Iret {
        rflags.remove(Rflags::NT);
    }
    let nested = matches!(q.source, TaskSwitchSource::Call | TaskSwitchSource::IdtGate);
    if q.source != TaskSwitchSource::Iret {
        next.set_busy(true);
        write_descriptor(p, &vmcs, new_sel, next)?;
    }

    // The outgoing task resumes after the instruction that left it, unless
    // a hardware event interrupted it.
    let eip = if q.source == TaskSwitchSource::IdtGate && !software {
        state.exit.rip
    } else {
        state.exit.rip + state.exit.instruction_length
    };
    let old_base = Gva::new(tr.base);
    let new_base = Gva::new(next.base());
    task_switch_32(
        p,
        state,
        old_base,
        new_base,
        eip as u32,
        rflags,
        nested.then(|| old_sel),
    )?;

    let cr0_mask = vmcs.read(Field::Cr0GuestHostMask)?;
    let cr0 = (vmcs.read(Field::GuestCr0)? & !cr0_mask) | (vmcs.read(Field::Cr0ReadShadow)? & cr0_mask);
    vmcs.set_cr0(cr0 | Cr0::TS.bits(), p)?;
    vmcs.write_segment(
        SegmentRegister::Tr,
        &SegmentCache {
            selector: q.selector,
            base: next.base(),
            limit: next.limit() as u32,
            access_rights: next.vmx_access_rights() | system_type::BUSY as u32,
        },
    )?;

    let hw = vmcs.handle();
    hw.invalidate_tlb()?;
    hw.flush()
}

fn task_switch_32<P: Probe>(
    p: &P,
    state: &mut GenericVCpuState,
    old_base: Gva,
    new_base: Gva,
    eip: u32,
    rflags: Rflags,
    back_link: Option<SegmentSelector>,
) -> Result<(), VmError> {
    let vmcs = state.vmcs;
    let gprs = &mut *state.gprs;

    // Save the outgoing task. CR3 and the LDT selector stay untouched.
    let mut image = [0u8; TaskStateSegment32::SIZE];
    p.read_virt(&vmcs, old_base, &mut image)?;
    let mut tss = TaskStateSegment32::from_bytes(&image);
    tss.eip = eip;
    tss.eflags = rflags.bits() as u32;
    tss.eax = gprs.rax as u32;
    tss.ecx = gprs.rcx as u32;
    tss.edx = gprs.rdx as u32;
    tss.ebx = gprs.rbx as u32;
    tss.esp = gprs.rsp as u32;
    tss.ebp = gprs.rbp as u32;
    tss.esi = gprs.rsi as u32;
    tss.edi = gprs.rdi as u32;
    let mut selectors = [0u32; 6];
    for (sel, seg) in selectors.iter_mut().zip(TSS_SEGMENTS) {
        *sel = vmcs.read(SegmentFields::of(seg).selector)? as u32;
    }
    [tss.es, tss.cs, tss.ss, tss.ds, tss.fs, tss.gs] = selectors;
    let dynamic = TaskStateSegment32::DYNAMIC_FIELDS;
    p.write_virt(
        &vmcs,
        old_base + dynamic.start as u64,
        &tss.to_bytes()[dynamic],
    )?;

    // Load the incoming one.
    p.read_virt(&vmcs, new_base, &mut image)?;
    let tss = TaskStateSegment32::from_bytes(&image);
    let mut eflags = Rflags::from_bits_truncate(tss.eflags as u64) | Rflags::_1;
    if let Some(old) = back_link {
        let off = TaskStateSegment32::PREV_TSS_OFFSET as u64;
        p.write_virt(&vmcs, new_base + off, &(old.pack() as u32).to_le_bytes())?;
        eflags |= Rflags::NT;
    }

    vmcs.write(Field::GuestCr3, tss.cr3 as u64)?;
    vmcs.set_rip(tss.eip as u64)?;
    vmcs.write(Field::GuestRflags, eflags.bits())?;
    gprs.rax = tss.eax as u64;
    gprs.rcx = tss.ecx as u64;
    gprs.rdx = tss.edx as u64;
    gprs.rbx = tss.ebx as u64;
    gprs.rsp = tss.esp as u64;
    gprs.rbp = tss.ebp as u64;
    gprs.rsi = tss.esi as u64;
    gprs.rdi = tss.edi as u64;

    vmcs.write(SegmentFields::of(SegmentRegister::Ldtr).selector, tss.ldt as u16 as u64)?;
    for (seg, sel) in TSS_SEGMENTS
        .into_iter()
        .zip([tss.es, tss.cs, tss.ss, tss.ds, tss.fs, tss.gs])
    {
        vmcs.write(SegmentFields::of(seg).selector, sel as u16 as u64)?;
    }
    Ok(())
}
