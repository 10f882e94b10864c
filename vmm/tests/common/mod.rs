//! A scripted hardware backend for the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use vmm::{
    addressing::{Gpa, Hva},
    hypervisor::{Hypervisor, MemoryFlags, Register, VCpuHandle},
    memory::{MemoryOps, MemoryRegion},
    vcpu::VCpu,
    vm::{Vm, VmBuilder},
    vmcs::{interruption_info, Field, SegmentCache},
    vmexit::CpuidTable,
    VmError,
};
use abyss::x86_64::segmentation::SegmentRegister;

pub mod reason {
    pub const EXTERNAL_INT: u64 = 0x1;
    pub const INIT: u64 = 0x3;
    pub const TASK_SWITCH: u64 = 0x9;
    pub const CPUID: u64 = 0xa;
    pub const HLT: u64 = 0xc;
    pub const RDPMC: u64 = 0xf;
    pub const VMCALL: u64 = 0x12;
    pub const MOV_CR: u64 = 0x1c;
    pub const IO: u64 = 0x1e;
    pub const RDMSR: u64 = 0x1f;
    pub const WRMSR: u64 = 0x20;
    pub const EPT_VIOLATION: u64 = 0x30;
    pub const XSETBV: u64 = 0x37;
}

/// A vm exit the mock reports on the next run.
#[derive(Debug, Clone)]
pub struct Exit {
    fields: Vec<(Field, u64)>,
}

impl Exit {
    pub fn new(reason: u64) -> Self {
        Self {
            fields: vec![
                (Field::VmexitReason, reason),
                (Field::VmexitQualification, 0),
                (Field::VmexitInstructionLength, 0),
                (Field::IdtVectoringInfo, 0),
            ],
        }
    }

    pub fn qualification(self, q: u64) -> Self {
        self.field(Field::VmexitQualification, q)
    }

    pub fn len(self, len: u64) -> Self {
        self.field(Field::VmexitInstructionLength, len)
    }

    pub fn field(mut self, field: Field, v: u64) -> Self {
        self.fields.push((field, v));
        self
    }
}

/// State of one mocked vcpu, shared between the handle and the test.
#[derive(Default)]
pub struct MockCpu {
    pub fields: Mutex<HashMap<Field, u64>>,
    pub registers: Mutex<HashMap<Register, u64>>,
    pub msrs: Mutex<HashMap<u32, u64>>,
    pub exits: Mutex<VecDeque<Exit>>,
    /// Events the vcpu entered the guest with.
    pub injected: Mutex<Vec<u64>>,
    pub runs: Mutex<usize>,
}

impl MockCpu {
    pub fn push(&self, exit: Exit) {
        self.exits.lock().push_back(exit);
    }

    pub fn field(&self, field: Field) -> u64 {
        self.fields.lock().get(&field).copied().unwrap_or(0)
    }

    pub fn register(&self, reg: Register) -> u64 {
        self.registers.lock().get(&reg).copied().unwrap_or(0)
    }

    pub fn set_register(&self, reg: Register, v: u64) {
        self.registers.lock().insert(reg, v);
    }
}

pub struct MockVCpu {
    id: u64,
    cpu: Arc<MockCpu>,
}

impl VCpuHandle for MockVCpu {
    fn read_vmcs(&self, field: Field) -> Result<u64, VmError> {
        Ok(self.cpu.field(field))
    }

    fn write_vmcs(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.cpu.fields.lock().insert(field, v);
        Ok(())
    }

    fn read_register(&self, reg: Register) -> Result<u64, VmError> {
        Ok(self.cpu.register(reg))
    }

    fn write_register(&self, reg: Register, v: u64) -> Result<(), VmError> {
        self.cpu.set_register(reg, v);
        Ok(())
    }

    fn read_msr(&self, index: u32) -> Result<u64, VmError> {
        Ok(self.cpu.msrs.lock().get(&index).copied().unwrap_or(0))
    }

    fn write_msr(&self, index: u32, v: u64) -> Result<(), VmError> {
        self.cpu.msrs.lock().insert(index, v);
        Ok(())
    }

    fn read_capability(&self, _msr: u32) -> Result<u64, VmError> {
        // Every control may be set, none is required.
        Ok(0xffff_ffff << 32)
    }

    fn run(&self) -> Result<(), VmError> {
        *self.cpu.runs.lock() += 1;
        let exit = self
            .cpu
            .exits
            .lock()
            .pop_front()
            .ok_or(VmError::HypervisorFailure { op: "run", code: 1 })?;
        let mut fields = self.cpu.fields.lock();
        let event = fields.insert(Field::VmentryInterruptionInfo, 0).unwrap_or(0);
        if event & interruption_info::VALID != 0 {
            self.cpu.injected.lock().push(event);
        }
        for (field, v) in exit.fields {
            fields.insert(field, v);
        }
        Ok(())
    }

    fn invalidate_tlb(&self) -> Result<(), VmError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), VmError> {
        Ok(())
    }

    fn set_apic_address(&self, _gpa: Gpa) -> Result<(), VmError> {
        Ok(())
    }

    fn hw_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapCall {
    Map { gpa: u64, size: u64, hva: usize },
    Unmap { gpa: u64, size: u64 },
}

#[derive(Default)]
pub struct MockHypervisor {
    pub cpus: Mutex<Vec<Arc<MockCpu>>>,
    /// Exits queued for vcpus that are not created yet, by creation order.
    pub scripts: Mutex<HashMap<usize, Vec<Exit>>>,
    pub calls: Mutex<Vec<MapCall>>,
    pub interrupts: Mutex<Vec<u64>>,
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, id: usize, exits: Vec<Exit>) {
        self.scripts.lock().insert(id, exits);
    }

    pub fn cpu(&self, id: usize) -> Arc<MockCpu> {
        self.cpus.lock()[id].clone()
    }

    /// Map calls for guest memory, leaving out the APIC pages.
    pub fn ram_calls(&self) -> Vec<MapCall> {
        self.calls
            .lock()
            .iter()
            .copied()
            .filter(|c| !matches!(c, MapCall::Map { gpa: 0xfee0_0000, .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl Hypervisor for MockHypervisor {
    fn create_vcpu(&self) -> Result<Box<dyn VCpuHandle>, VmError> {
        let mut cpus = self.cpus.lock();
        let id = cpus.len();
        let cpu = Arc::new(MockCpu::default());
        if let Some(exits) = self.scripts.lock().remove(&id) {
            cpu.exits.lock().extend(exits);
        }
        cpus.push(cpu.clone());
        Ok(Box::new(MockVCpu { id: id as u64, cpu }))
    }

    fn map(&self, hva: Hva, gpa: Gpa, size: u64, _flags: MemoryFlags) -> Result<(), VmError> {
        self.calls.lock().push(MapCall::Map {
            gpa: gpa.into_u64(),
            size,
            hva: hva.into_usize(),
        });
        Ok(())
    }

    fn unmap(&self, gpa: Gpa, size: u64) -> Result<(), VmError> {
        self.calls.lock().push(MapCall::Unmap {
            gpa: gpa.into_u64(),
            size,
        });
        Ok(())
    }

    fn interrupt(&self, hw_ids: &[u64]) -> Result<(), VmError> {
        self.interrupts.lock().extend_from_slice(hw_ids);
        Ok(())
    }
}

/// A device that records every access and answers reads with `value`.
#[derive(Clone, Default)]
pub struct Recorder {
    pub log: Arc<Mutex<Vec<(u64, u8, Option<u64>)>>>,
    pub value: u64,
}

impl MemoryOps for Recorder {
    fn read(&mut self, addr: u64, width: u8) -> Option<u64> {
        self.log.lock().push((addr, width, None));
        Some(self.value)
    }

    fn write(&mut self, addr: u64, width: u8, value: u64) -> bool {
        self.log.lock().push((addr, width, Some(value)));
        true
    }
}

/// A vm with `vcpus` vcpus on a fresh mock and an empty CPUID table.
pub fn machine(vcpus: usize) -> (Arc<MockHypervisor>, Arc<Vm>) {
    let hv = MockHypervisor::new();
    let vm = VmBuilder::new(hv.clone(), vcpus)
        .cpuid(CpuidTable::new())
        .finalize()
        .unwrap();
    (hv, vm)
}

/// Plug `size` bytes of RAM at `gpa`.
pub fn add_ram(vm: &Vm, gpa: u64, size: u64) -> Arc<MemoryRegion> {
    let ram = MemoryRegion::new_ram("ram", size);
    vm.lock_devices()
        .memory
        .add_child(vm.memory_root(), gpa, &ram)
        .unwrap();
    ram
}

pub fn write_guest(vm: &Vm, gpa: u64, bytes: &[u8]) {
    let mut buf = bytes.to_vec();
    let devices = vm.lock_devices();
    assert!(devices.memory.rw(vm.memory_space(), gpa, &mut buf, true));
}

pub fn read_guest(vm: &Vm, gpa: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    let devices = vm.lock_devices();
    assert!(devices.memory.rw(vm.memory_space(), gpa, &mut buf, false));
    buf
}

/// Put the vcpu in flat 32-bit protected mode at rip 0x1000, interrupts
/// disabled.
pub fn flat32(vcpu: &mut VCpu) {
    let st = vcpu.synchronize().unwrap();
    st.cr0 = 0x11;
    st.rip = 0x1000;
    st.rflags = 0x2;
    *st.segment_mut(SegmentRegister::Cs) = SegmentCache {
        selector: 0x8,
        base: 0,
        limit: 0xffff_ffff,
        access_rights: 0xc09b,
    };
    for seg in [
        SegmentRegister::Ds,
        SegmentRegister::Es,
        SegmentRegister::Ss,
        SegmentRegister::Fs,
        SegmentRegister::Gs,
    ] {
        *st.segment_mut(seg) = SegmentCache {
            selector: 0x10,
            base: 0,
            limit: 0xffff_ffff,
            access_rights: 0xc093,
        };
    }
}
