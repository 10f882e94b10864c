mod common;

use abyss::{
    interrupt::GeneralPurposeRegisters,
    x86_64::{
        segmentation::{system_type, SegmentDescriptor, SegmentRegister},
        tss::TaskStateSegment32,
        PrivilegeLevel,
    },
};
use common::{
    add_ram, flat32, machine, read_guest, reason, write_guest, Exit, MockHypervisor, Recorder,
};
use parking_lot::Mutex;
use std::sync::Arc;
use vmm::{
    hypervisor::Register,
    memory::MemoryRegion,
    regs::DescriptorTable,
    vcpu::{GenericVCpuState, VCpu, VmexitResult},
    vm::{Vm, VmBuilder},
    vmcs::{BasicExitReason, ExitReason, Field, SegmentCache},
    vmexit::{Controller, CpuidEntry, CpuidTable, GuestAgent, Hypercall},
    vmexits::VmexitController,
    Probe, VmError,
};

fn exec(vm: &Vm, vcpu: &mut VCpu) -> Result<VmexitResult, VmError> {
    let mut devices = vm.lock_devices();
    vcpu.exec(vm, &mut devices, &mut Controller::new())
}

/// A bsp in flat protected mode with 64KiB of RAM at 0.
fn booted() -> (Arc<MockHypervisor>, Arc<Vm>, VCpu) {
    let (hv, vm) = machine(1);
    add_ram(&vm, 0, 0x1_0000);
    let mut vcpu = VCpu::new(&vm, 0).unwrap();
    flat32(&mut vcpu);
    (hv, vm, vcpu)
}

type AgentLog = Arc<Mutex<Vec<(usize, u8, Option<u64>)>>>;

struct Agent(AgentLog);

impl GuestAgent for Agent {
    fn read(&mut self, channel: usize, size: u8) -> u64 {
        self.0.lock().push((channel, size, None));
        0x1122_3344_5566_7788 + channel as u64
    }

    fn write(&mut self, channel: usize, size: u8, value: u64) {
        self.0.lock().push((channel, size, Some(value)));
    }
}

fn io(port: u16, size: u64, is_in: bool) -> Exit {
    let q = ((port as u64) << 16) | (size - 1) | if is_in { 1 << 3 } else { 0 };
    Exit::new(reason::IO).qualification(q).len(1)
}

#[test]
fn port_io_reaches_agent_and_devices() {
    let hv = MockHypervisor::new();
    let log = AgentLog::default();
    let vm = VmBuilder::new(hv.clone(), 1)
        .cpuid(CpuidTable::new())
        .guest_agent(Box::new(Agent(log.clone())))
        .finalize()
        .unwrap();
    let dev = Recorder::default();
    let region = MemoryRegion::new_io("ports", 0x10, Box::new(dev.clone()));
    vm.lock_devices()
        .memory
        .add_child(vm.io_root(), 0x1850, &region)
        .unwrap();
    let mut vcpu = VCpu::new(&vm, 0).unwrap();
    flat32(&mut vcpu);
    vcpu.synchronize().unwrap().gprs.rax = 0xaabb_ccdd;

    let cpu = hv.cpu(0);
    cpu.push(io(0x1854, 4, false));
    cpu.push(io(0x1851, 1, false));
    cpu.push(io(0x1858, 4, true));
    cpu.push(io(0x1850, 1, true));
    cpu.push(io(0x60, 2, true));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    assert_eq!(
        *log.lock(),
        vec![(1, 4, Some(0xaabb_ccdd)), (2, 4, None), (0, 1, None)]
    );
    // Only the unaligned port went to the device.
    assert_eq!(*dev.log.lock(), vec![(1, 1, Some(0xdd))]);
    // 0x5566778a from channel 2, low byte 0x88 from channel 0, then all
    // ones from the unassigned port.
    assert_eq!(cpu.register(Register::Rax), 0x5566_ffff);
    assert_eq!(cpu.field(Field::GuestRip), 0x1005);
}

#[test]
fn string_port_output_is_emulated() {
    let (hv, vm, mut vcpu) = booted();
    let dev = Recorder::default();
    let region = MemoryRegion::new_io("serial", 8, Box::new(dev.clone()));
    vm.lock_devices()
        .memory
        .add_child(vm.io_root(), 0x3f8, &region)
        .unwrap();
    // rep outsb
    write_guest(&vm, 0x1000, &[0xf3, 0x6e]);
    write_guest(&vm, 0x3000, b"abc");
    let st = vcpu.synchronize().unwrap();
    st.gprs.rsi = 0x3000;
    st.gprs.rcx = 3;
    st.gprs.rdx = 0x3f8;

    let cpu = hv.cpu(0);
    cpu.push(
        Exit::new(reason::IO)
            .qualification((0x3f8 << 16) | (1 << 4) | (1 << 5))
            .len(2),
    );
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    assert_eq!(
        *dev.log.lock(),
        vec![
            (0, 1, Some(b'a' as u64)),
            (0, 1, Some(b'b' as u64)),
            (0, 1, Some(b'c' as u64)),
        ]
    );
    assert_eq!(cpu.register(Register::Rsi), 0x3003);
    assert_eq!(cpu.register(Register::Rcx), 0);
    assert_eq!(cpu.field(Field::GuestRip), 0x1002);
}

#[test]
fn string_port_length_must_match() {
    let (hv, vm, mut vcpu) = booted();
    // outsb
    write_guest(&vm, 0x1000, &[0x6e]);
    vcpu.synchronize().unwrap().gprs.rdx = 0x3f8;
    hv.cpu(0).push(
        Exit::new(reason::IO)
            .qualification((0x3f8 << 16) | (1 << 4))
            .len(2),
    );
    assert!(matches!(
        exec(&vm, &mut vcpu),
        Err(VmError::InstructionLengthMismatch {
            decoded: 1,
            reported: 2
        })
    ));
}

#[test]
fn cr8_is_the_task_priority() {
    let (hv, vm, mut vcpu) = booted();
    vcpu.synchronize().unwrap().gprs.rcx = 5;
    let cpu = hv.cpu(0);

    // mov cr8, rcx
    cpu.push(Exit::new(reason::MOV_CR).qualification(0x108).len(4));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(vm.vcpu(0).unwrap().apic().tpr(), 5);
    assert_eq!(cpu.field(Field::GuestRip), 0x1004);

    // mov rax, cr8
    cpu.push(Exit::new(reason::MOV_CR).qualification(0x18).len(4));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(cpu.register(Register::Tpr), 0x50);
    assert_eq!(cpu.register(Register::Rax), 5);
    assert_eq!(cpu.field(Field::GuestRip), 0x1008);
}

#[test]
fn xsetbv_only_writes_xcr0() {
    let (hv, vm, mut vcpu) = booted();
    let st = vcpu.synchronize().unwrap();
    st.gprs.rcx = 1;
    st.gprs.rax = 7;
    let cpu = hv.cpu(0);
    cpu.push(Exit::new(reason::XSETBV).len(3));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Xcr0), 1);
    assert_eq!(cpu.field(Field::GuestRip), 0x1003);

    vcpu.synchronize().unwrap().gprs.rcx = 0;
    cpu.push(Exit::new(reason::XSETBV).len(3));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Xcr0), 7);
    assert_eq!(cpu.field(Field::GuestRip), 0x1006);
}

#[test]
fn mmio_store_is_emulated() {
    let (hv, vm, mut vcpu) = booted();
    let dev = Recorder::default();
    let region = MemoryRegion::new_io("mmio", 0x1000, Box::new(dev.clone()));
    vm.lock_devices()
        .memory
        .add_child(vm.memory_root(), 0xd000_0000, &region)
        .unwrap();
    // mov [ebx], eax
    write_guest(&vm, 0x1000, &[0x89, 0x03]);
    let st = vcpu.synchronize().unwrap();
    st.gprs.rbx = 0xd000_0010;
    st.gprs.rax = 0xdead_beef;

    let cpu = hv.cpu(0);
    cpu.push(
        Exit::new(reason::EPT_VIOLATION)
            .qualification(0x182)
            .field(Field::GuestPhysicalAddr, 0xd000_0010),
    );
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    assert_eq!(*dev.log.lock(), vec![(0x10, 4, Some(0xdead_beef))]);
    assert_eq!(cpu.field(Field::GuestRip), 0x1002);
}

#[test]
fn rom_store_reaches_the_device() {
    let (hv, vm, mut vcpu) = booted();
    let dev = Recorder::default();
    let rom = MemoryRegion::new_rom("bios", 0x1000, Box::new(dev.clone()));
    vm.lock_devices()
        .memory
        .add_child(vm.memory_root(), 0xf_0000, &rom)
        .unwrap();
    // mov [ebx], eax
    write_guest(&vm, 0x1000, &[0x89, 0x03]);
    let st = vcpu.synchronize().unwrap();
    st.gprs.rbx = 0xf_0010;
    st.gprs.rax = 0xdead_beef;

    let cpu = hv.cpu(0);
    cpu.push(
        Exit::new(reason::EPT_VIOLATION)
            .qualification(0x182)
            .field(Field::GuestPhysicalAddr, 0xf_0010),
    );
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    assert_eq!(*dev.log.lock(), vec![(0x10, 4, Some(0xdead_beef))]);
    // The contents stay as they were.
    assert_eq!(read_guest(&vm, 0xf_0010, 4), vec![0; 4]);
    assert_eq!(cpu.field(Field::GuestRip), 0x1002);
}

#[test]
fn mmio_load_is_emulated() {
    let (hv, vm, mut vcpu) = booted();
    let dev = Recorder {
        value: 0x1234_5678,
        ..Default::default()
    };
    let region = MemoryRegion::new_io("mmio", 0x1000, Box::new(dev.clone()));
    vm.lock_devices()
        .memory
        .add_child(vm.memory_root(), 0xd000_0000, &region)
        .unwrap();
    // movzx ecx, word [ebx+4]
    write_guest(&vm, 0x1000, &[0x0f, 0xb7, 0x4b, 0x04]);
    vcpu.synchronize().unwrap().gprs.rbx = 0xd000_0000;

    let cpu = hv.cpu(0);
    cpu.push(
        Exit::new(reason::EPT_VIOLATION)
            .qualification(0x181)
            .field(Field::GuestPhysicalAddr, 0xd000_0004),
    );
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();

    assert_eq!(*dev.log.lock(), vec![(4, 2, None)]);
    assert_eq!(cpu.register(Register::Rcx), 0x5678);
    assert_eq!(cpu.field(Field::GuestRip), 0x1004);
}

#[test]
fn hlt_waits_for_an_event() {
    let (hv, vm, mut vcpu) = booted();
    let cpu = hv.cpu(0);
    cpu.push(Exit::new(reason::HLT).len(1));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Halted);
    assert!(vcpu.is_halted());
    assert_eq!(cpu.field(Field::GuestRip), 0x1001);

    // Nothing pending: the guest is not entered again.
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Halted);
    assert_eq!(*cpu.runs.lock(), 1);

    vm.raise_nmi(0).unwrap();
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert!(!vcpu.is_halted());
}

#[test]
fn nmi_is_injected() {
    let (hv, vm, mut vcpu) = booted();
    let cpu = hv.cpu(0);
    vm.raise_nmi(0).unwrap();
    // The kick is seen before the guest is entered.
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(*cpu.runs.lock(), 0);

    cpu.push(Exit::new(reason::EXTERNAL_INT));
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(*cpu.injected.lock(), vec![0x8000_0202]);
}

#[test]
fn external_interrupt_is_injected() {
    let (hv, vm, mut vcpu) = booted();
    vcpu.synchronize().unwrap().rflags = 0x202;
    let cpu = hv.cpu(0);
    vm.raise_irq(0, 0x41).unwrap();
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(*cpu.injected.lock(), vec![0x8000_0041]);
    assert_eq!(vm.vcpu(0).unwrap().apic().highest_irr(), None);
}

#[test]
fn back_to_back_interrupts_are_both_delivered() {
    let (hv, vm, mut vcpu) = booted();
    vcpu.synchronize().unwrap().rflags = 0x202;
    let cpu = hv.cpu(0);
    vm.raise_irq(0, 0x30).unwrap();
    vm.raise_irq(0, 0x31).unwrap();
    // 0x31 is queued, then the kick is seen before the guest is entered.
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(*cpu.runs.lock(), 0);

    cpu.push(Exit::new(reason::EXTERNAL_INT));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(*cpu.injected.lock(), vec![0x8000_0031, 0x8000_0030]);
    assert_eq!(vm.vcpu(0).unwrap().apic().highest_irr(), None);
}

#[test]
fn queued_nmi_is_not_replaced_by_an_interrupt() {
    let (hv, vm, mut vcpu) = booted();
    vcpu.synchronize().unwrap().rflags = 0x202;
    let cpu = hv.cpu(0);
    vm.raise_nmi(0).unwrap();
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    vm.raise_irq(0, 0x41).unwrap();
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);
    assert_eq!(*cpu.runs.lock(), 0);
    assert_eq!(cpu.field(Field::VmentryInterruptionInfo), 0x8000_0202);

    cpu.push(Exit::new(reason::EXTERNAL_INT));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(*cpu.injected.lock(), vec![0x8000_0202, 0x8000_0041]);
}

#[test]
fn masked_interrupt_arms_tpr_threshold() {
    let (hv, vm, mut vcpu) = booted();
    vcpu.synchronize().unwrap().rflags = 0x202;
    vm.vcpu(0).unwrap().apic().set_tpr(5);
    vm.raise_irq(0, 0x41).unwrap();
    assert_eq!(exec(&vm, &mut vcpu).unwrap(), VmexitResult::Interrupt);

    let cpu = hv.cpu(0);
    assert_eq!(cpu.register(Register::Tpr), 0x50);
    assert_eq!(cpu.field(Field::TprThreshold), 4);
    assert_eq!(cpu.field(Field::VmentryInterruptionInfo), 0);
    assert_eq!(vm.vcpu(0).unwrap().apic().highest_irr(), Some(0x41));
}

#[test]
fn interrupts_wait_for_if() {
    let (hv, vm, mut vcpu) = booted();
    vm.raise_irq(0, 0x30).unwrap();
    exec(&vm, &mut vcpu).unwrap();
    let cpu = hv.cpu(0);
    assert_eq!(cpu.field(Field::VmentryInterruptionInfo), 0);
    // Interrupt-window exiting is requested instead.
    assert_ne!(cpu.field(Field::ProcessorBasedVmexecControls) & (1 << 2), 0);
}

#[test]
fn cpuid_reports_the_apic_id() {
    let hv = MockHypervisor::new();
    let mut table = CpuidTable::new();
    table.insert(
        1,
        0,
        CpuidEntry {
            eax: 0x806ec,
            ebx: 0x0000_0800,
            ecx: 0,
            edx: 0x178b_fbff,
        },
    );
    let vm = VmBuilder::new(hv.clone(), 2).cpuid(table).finalize().unwrap();
    add_ram(&vm, 0, 0x1_0000);
    let mut ap = VCpu::new(&vm, 0).and_then(|_| VCpu::new(&vm, 1)).unwrap();
    let cpu = hv.cpu(1);

    // Application processors wait for a startup IPI.
    assert_eq!(exec(&vm, &mut ap).unwrap(), VmexitResult::Halted);
    vm.send_sipi(1, 0x10).unwrap();
    assert_eq!(exec(&vm, &mut ap).unwrap(), VmexitResult::Interrupt);
    assert_eq!(cpu.field(Field::GuestCsBase), 0x1_0000);
    assert_eq!(cpu.field(Field::GuestRip), 0);

    ap.synchronize().unwrap().gprs.rax = 1;
    cpu.push(Exit::new(reason::CPUID).len(2));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut ap).unwrap();
    assert_eq!(cpu.register(Register::Rax), 0x806ec);
    assert_eq!(cpu.register(Register::Rbx), 0x0100_0800);
    assert_eq!(cpu.register(Register::Rcx), 1 << 31);
    assert_eq!(cpu.register(Register::Rdx), 0x178b_fbff);
    assert_eq!(cpu.field(Field::GuestRip), 2);
}

#[test]
fn rdpmc_reads_zero() {
    let (hv, vm, mut vcpu) = booted();
    let st = vcpu.synchronize().unwrap();
    st.gprs.rax = 0x55;
    st.gprs.rdx = 0x66;
    let cpu = hv.cpu(0);
    cpu.push(Exit::new(reason::RDPMC).len(2));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Rax), 0);
    assert_eq!(cpu.register(Register::Rdx), 0);
    assert_eq!(cpu.field(Field::GuestRip), 0x1002);
}

#[test]
fn msrs_are_modeled() {
    let (hv, vm, mut vcpu) = booted();
    let cpu = hv.cpu(0);

    // rdmsr IA32_PAT
    vcpu.synchronize().unwrap().gprs.rcx = 0x277;
    cpu.push(Exit::new(reason::RDMSR).len(2));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Rax), 0x0007_0406);
    assert_eq!(cpu.register(Register::Rdx), 0x0007_0406);

    // wrmsr IA32_PAT, then read it back
    let st = vcpu.synchronize().unwrap();
    st.gprs.rax = 0x0606_0606;
    st.gprs.rdx = 0x0505_0505;
    cpu.push(Exit::new(reason::WRMSR).len(2));
    cpu.push(Exit::new(reason::RDMSR).len(2));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Rax), 0x0606_0606);
    assert_eq!(cpu.register(Register::Rdx), 0x0505_0505);
    assert_eq!(cpu.field(Field::GuestRip), 0x1006);
}

#[test]
fn unknown_exit_is_fatal() {
    let (hv, vm, mut vcpu) = booted();
    hv.cpu(0).push(Exit::new(reason::INIT));
    assert!(matches!(
        exec(&vm, &mut vcpu),
        Err(VmError::HandleVmexitFailed(ExitReason::BasicExitReason(
            BasicExitReason::InitSignal
        )))
    ));
}

struct Increment;

impl Hypercall for Increment {
    fn handle(
        &mut self,
        _vcpu: usize,
        _vmcs: &vmm::vmcs::ActiveVmcs,
        gprs: &mut GeneralPurposeRegisters,
    ) -> Result<(), VmError> {
        gprs.rax = gprs.rbx + 1;
        Ok(())
    }
}

#[test]
fn vmcall_reaches_the_hypercall_handler() {
    let hv = MockHypervisor::new();
    let vm = VmBuilder::new(hv.clone(), 1)
        .cpuid(CpuidTable::new())
        .hypercall(Box::new(Increment))
        .finalize()
        .unwrap();
    add_ram(&vm, 0, 0x1_0000);
    let mut vcpu = VCpu::new(&vm, 0).unwrap();
    flat32(&mut vcpu);
    vcpu.synchronize().unwrap().gprs.rbx = 41;

    let cpu = hv.cpu(0);
    cpu.push(Exit::new(reason::VMCALL).len(3));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();
    assert_eq!(cpu.register(Register::Rax), 42);
    assert_eq!(cpu.field(Field::GuestRip), 0x1003);
}

const GDT: u64 = 0x8000;
const TSS_A: u64 = 0x9000;
const TSS_B: u64 = 0x9100;
const SEL_A: u16 = 0x18;
const SEL_B: u16 = 0x20;
const SEL_TSS16: u16 = 0x28;
const SEL_ABSENT: u16 = 0x30;

fn tss32(base: u64, ty: u8) -> SegmentDescriptor {
    SegmentDescriptor::new_system(base, 0x67, ty, PrivilegeLevel::Ring0)
}

fn descriptor(vm: &Vm, sel: u16) -> SegmentDescriptor {
    let raw = read_guest(vm, GDT + sel as u64, 8);
    SegmentDescriptor::from_raw(u64::from_le_bytes(raw.try_into().unwrap()))
}

fn dword(vm: &Vm, gpa: u64) -> u32 {
    u32::from_le_bytes(read_guest(vm, gpa, 4).try_into().unwrap())
}

/// Running on task A with task B ready to be switched to.
fn two_tasks() -> (Arc<MockHypervisor>, Arc<Vm>, VCpu) {
    let (hv, vm, mut vcpu) = booted();
    let absent = tss32(0x9300, system_type::TSS32_AVAILABLE).raw() & !(1 << 47);
    let gdt = [
        0,
        0x00cf_9b00_0000_ffff,
        0x00cf_9300_0000_ffff,
        tss32(TSS_A, system_type::TSS32_BUSY).raw(),
        tss32(TSS_B, system_type::TSS32_AVAILABLE).raw(),
        SegmentDescriptor::new_system(0x9200, 0x2b, system_type::TSS16_AVAILABLE, PrivilegeLevel::Ring0)
            .raw(),
        absent,
    ];
    let bytes: Vec<u8> = gdt.iter().flat_map(|d: &u64| d.to_le_bytes()).collect();
    write_guest(&vm, GDT, &bytes);

    let next = TaskStateSegment32 {
        cr3: 0x5000,
        eip: 0x2000,
        eflags: 0x2,
        eax: 0x1111,
        ebx: 0x2222,
        esp: 0x7000,
        es: 0x10,
        cs: 0x8,
        ss: 0x10,
        ds: 0x23,
        fs: 0x10,
        gs: 0x10,
        ..Default::default()
    };
    write_guest(&vm, TSS_B, &next.to_bytes());

    let st = vcpu.synchronize().unwrap();
    st.gdtr = DescriptorTable {
        base: GDT,
        limit: gdt.len() as u32 * 8 - 1,
    };
    *st.segment_mut(SegmentRegister::Tr) = SegmentCache {
        selector: SEL_A,
        base: TSS_A,
        limit: 0x67,
        access_rights: 0x8b,
    };
    st.gprs.rax = 0xaaaa;
    st.gprs.rsp = 0x6000;
    (hv, vm, vcpu)
}

fn task_switch(sel: u16, source: u64, len: u64) -> Exit {
    Exit::new(reason::TASK_SWITCH)
        .qualification(sel as u64 | (source << 30))
        .len(len)
}

#[test]
fn jmp_to_task() {
    let (hv, vm, mut vcpu) = two_tasks();
    let cpu = hv.cpu(0);
    // jmp far 0x20:0
    cpu.push(task_switch(SEL_B, 2, 7));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();

    // The outgoing task resumes after the jump.
    assert_eq!(dword(&vm, TSS_A + 0x20), 0x1007);
    assert_eq!(dword(&vm, TSS_A + 0x28), 0xaaaa);
    assert_eq!(dword(&vm, TSS_A + 0x38), 0x6000);
    assert_eq!(dword(&vm, TSS_A + 0x4c), 0x8);
    assert_eq!(dword(&vm, TSS_A + 0x54), 0x10);

    assert_eq!(descriptor(&vm, SEL_A).ty(), system_type::TSS32_AVAILABLE);
    assert_eq!(descriptor(&vm, SEL_B).ty(), system_type::TSS32_BUSY);
    // No back-link for a jump.
    assert_eq!(dword(&vm, TSS_B), 0);

    assert_eq!(cpu.field(Field::GuestRip), 0x2000);
    assert_eq!(cpu.field(Field::GuestRflags), 0x2);
    assert_eq!(cpu.field(Field::GuestCr3), 0x5000);
    assert_eq!(cpu.field(Field::GuestRsp), 0x7000);
    assert_eq!(cpu.register(Register::Rax), 0x1111);
    assert_eq!(cpu.register(Register::Rbx), 0x2222);
    assert_eq!(cpu.field(Field::GuestDsSelector), 0x23);

    assert_eq!(cpu.field(Field::GuestTrSelector), SEL_B as u64);
    assert_eq!(cpu.field(Field::GuestTrBase), TSS_B);
    assert_eq!(cpu.field(Field::GuestTrLimit), 0x67);
    assert_eq!(cpu.field(Field::GuestTrAccessRights), 0x8b);
    // CR0.TS
    assert_ne!(cpu.field(Field::Cr0ReadShadow) & 0x8, 0);
}

#[test]
fn call_to_task_nests() {
    let (hv, vm, mut vcpu) = two_tasks();
    let cpu = hv.cpu(0);
    // call far 0x20:0
    cpu.push(task_switch(SEL_B, 0, 7));
    cpu.push(Exit::new(reason::EXTERNAL_INT));
    exec(&vm, &mut vcpu).unwrap();

    assert_eq!(descriptor(&vm, SEL_A).ty(), system_type::TSS32_BUSY);
    assert_eq!(descriptor(&vm, SEL_B).ty(), system_type::TSS32_BUSY);
    assert_eq!(dword(&vm, TSS_B), SEL_A as u32);
    // NT
    assert_eq!(cpu.field(Field::GuestRflags), 0x4002);
    assert_eq!(cpu.field(Field::GuestRip), 0x2000);
}

#[test]
fn task_switch_rejects_bad_targets() {
    let (hv, vm, mut vcpu) = two_tasks();
    hv.cpu(0).push(task_switch(SEL_TSS16, 2, 7));
    assert!(matches!(exec(&vm, &mut vcpu), Err(VmError::TaskSwitch16)));

    let (hv, vm, mut vcpu) = two_tasks();
    hv.cpu(0).push(task_switch(SEL_ABSENT, 2, 7));
    assert!(matches!(
        exec(&vm, &mut vcpu),
        Err(VmError::InvalidTss(SEL_ABSENT))
    ));
    // Nothing was touched.
    assert_eq!(descriptor(&vm, SEL_A).ty(), system_type::TSS32_BUSY);
}

struct ExitOnVmcall;

impl VmexitController for ExitOnVmcall {
    fn handle<P: Probe>(
        &mut self,
        reason: ExitReason,
        _p: &mut P,
        _generic_vcpu_state: &mut GenericVCpuState,
    ) -> Result<VmexitResult, VmError> {
        match reason {
            ExitReason::BasicExitReason(BasicExitReason::Vmcall) => Ok(VmexitResult::Exited(7)),
            reason => Err(VmError::HandleVmexitFailed(reason)),
        }
    }
}

#[test]
fn vcpu_threads_report_the_exit_code() {
    let (hv, vm) = machine(1);
    hv.script(
        0,
        vec![
            Exit::new(reason::CPUID).len(2),
            Exit::new(reason::VMCALL).len(3),
        ],
    );
    vm.start(|_| ExitOnVmcall).unwrap();
    assert_eq!(vm.join().unwrap(), 7);
    assert!(vm.exited());
    // The built-in controller answered CPUID.
    assert_eq!(hv.cpu(0).field(Field::GuestRip), 0xfff2);
}

#[test]
fn fatal_exit_aborts_the_vm() {
    let (hv, vm) = machine(1);
    hv.script(0, vec![Exit::new(reason::INIT)]);
    vm.start(|_| ()).unwrap();
    // The error that stopped the vcpu is the one reported.
    assert!(matches!(
        vm.join(),
        Err(VmError::HandleVmexitFailed(ExitReason::BasicExitReason(
            BasicExitReason::InitSignal
        )))
    ));
    assert!(vm.exited());
}
