//! Virtual machine interface.
//!
//! A [`Vm`] ties the vcpus to the state they share: the address spaces, the
//! slot table, the CPUID table and the device handlers. Everything a vcpu
//! touches while handling an exit sits behind one lock, [`Devices`].
use crate::{
    hypervisor::Hypervisor,
    memory::{AddressSpaceId, MemoryListener, MemoryMap, MemoryRegion},
    regs::CpuState,
    slots::SlotManager,
    vcpu::{InterruptRequest, SharedVCpu, VCpu, VmexitResult},
    vmexit::{self, CpuidTable, GuestAgent, Hypercall, NullAgent},
    vmexits::VmexitController,
    VmError,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    sync::{mpsc, Arc},
    thread::JoinHandle,
};

/// Size of the port I/O space.
pub const IO_SPACE_SIZE: u64 = 0x1_0000;

/// State that exit handlers mutate. Guarded by the vm's device lock.
pub struct Devices {
    /// Address spaces of the guest.
    pub memory: MemoryMap,
    /// Handler of the guest agent ports.
    pub agent: Box<dyn GuestAgent>,
    /// Handler of VMCALL, if any.
    pub hypercall: Option<Box<dyn Hypercall>>,
}

/// The virtual machine.
pub struct Vm {
    hv: Arc<dyn Hypervisor>,
    devices: Mutex<Devices>,
    slots: Arc<SlotManager>,
    memory_root: Arc<MemoryRegion>,
    io_root: Arc<MemoryRegion>,
    memory_space: AddressSpaceId,
    io_space: AddressSpaceId,
    vcpus: Vec<Arc<SharedVCpu>>,
    cpuid: CpuidTable,
    exception_bitmap: u32,
    exit_code: Mutex<Option<i32>>,
    error: Mutex<Option<VmError>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Vm {
    /// Take the device lock.
    #[inline]
    pub fn lock_devices(&self) -> MutexGuard<'_, Devices> {
        self.devices.lock()
    }

    /// Root container of the guest-physical space.
    #[inline]
    pub fn memory_root(&self) -> &Arc<MemoryRegion> {
        &self.memory_root
    }

    /// Root container of the port I/O space.
    #[inline]
    pub fn io_root(&self) -> &Arc<MemoryRegion> {
        &self.io_root
    }

    #[inline]
    pub fn memory_space(&self) -> AddressSpaceId {
        self.memory_space
    }

    #[inline]
    pub fn io_space(&self) -> AddressSpaceId {
        self.io_space
    }

    #[inline]
    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    #[inline]
    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hv
    }

    #[inline]
    pub fn cpuid(&self) -> &CpuidTable {
        &self.cpuid
    }

    #[inline]
    pub fn exception_bitmap(&self) -> u32 {
        self.exception_bitmap
    }

    /// Get vcpu #id.
    #[inline]
    pub fn vcpu(&self, id: usize) -> Option<&Arc<SharedVCpu>> {
        self.vcpus.get(id)
    }

    #[inline]
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    fn get(&self, id: usize) -> Result<&Arc<SharedVCpu>, VmError> {
        self.vcpus
            .get(id)
            .ok_or_else(|| VmError::VCpuError(format!("vcpu#{} not exists", id).into()))
    }

    /// Post `req` to vcpu #id and make it look.
    pub fn interrupt(&self, id: usize, req: InterruptRequest) -> Result<(), VmError> {
        self.get(id)?.set_requests(req);
        self.kick_vcpu(id)
    }

    /// Raise a maskable interrupt on vcpu #id.
    pub fn raise_irq(&self, id: usize, vector: u8) -> Result<(), VmError> {
        self.get(id)?.apic().set_irr(vector);
        self.interrupt(id, InterruptRequest::HARD)
    }

    /// Raise an NMI on vcpu #id. NMIs do not queue: raising one while
    /// another is pending delivers a single NMI.
    pub fn raise_nmi(&self, id: usize) -> Result<(), VmError> {
        self.interrupt(id, InterruptRequest::NMI)
    }

    /// Send INIT to vcpu #id. The vcpu resets on its own thread.
    pub fn send_init(&self, id: usize) -> Result<(), VmError> {
        self.interrupt(id, InterruptRequest::INIT)
    }

    /// Start an application processor at `vector << 12`.
    pub fn send_sipi(&self, id: usize, vector: u8) -> Result<(), VmError> {
        self.get(id)?.set_sipi_vector(vector);
        self.interrupt(id, InterruptRequest::SIPI)
    }

    /// Kick the vcpu out of the guest or out of its sleep.
    pub fn kick_vcpu(&self, id: usize) -> Result<(), VmError> {
        let vcpu = self.get(id)?;
        if !vcpu.is_started() {
            log::warn!("vcpu#{}: kicking a vcpu that is not running", id);
        }
        if let Some(hw_id) = vcpu.kick() {
            self.hv.interrupt(&[hw_id])?;
        }
        Ok(())
    }

    /// Run `f` on the register state of vcpu #id from the vcpu's own thread.
    pub fn async_run_on_cpu<F>(&self, id: usize, f: F) -> Result<(), VmError>
    where
        F: FnOnce(&mut CpuState) + Send + 'static,
    {
        self.get(id)?.push_work(Box::new(f));
        self.kick_vcpu(id)
    }

    /// Run `f` on vcpu #id and wait for its result.
    ///
    /// Must not be called from the thread of vcpu #id.
    pub fn run_on_cpu<F, R>(&self, id: usize, f: F) -> Result<R, VmError>
    where
        F: FnOnce(&mut CpuState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.async_run_on_cpu(id, move |st| {
            let _ = tx.send(f(st));
        })?;
        rx.recv()
            .map_err(|e| VmError::VCpuError(Box::new(e)))
    }

    /// Put every vcpu back in its power-on state.
    pub fn request_reset(&self) -> Result<(), VmError> {
        log::info!("system reset requested");
        for id in 0..self.vcpus.len() {
            self.send_init(id)?;
        }
        Ok(())
    }

    /// Stop the vm with `exit_code`. The first code wins.
    pub fn exit(&self, exit_code: i32) {
        {
            let mut code = self.exit_code.lock();
            if code.is_some() {
                return;
            }
            log::info!("vm exits with {}", exit_code);
            *code = Some(exit_code);
        }
        for id in 0..self.vcpus.len() {
            if let Err(e) = self.kick_vcpu(id) {
                log::warn!("vcpu#{}: failed to kick: {}", id, e);
            }
        }
    }

    /// Stop the vm because a vcpu failed with `e`. The first error is the
    /// one [`Vm::join`] reports.
    pub fn abort(&self, e: VmError) {
        {
            let mut error = self.error.lock();
            if error.is_none() {
                *error = Some(e);
            }
        }
        self.exit(-1);
    }

    /// Whether [`Vm::exit`] was called.
    #[inline]
    pub fn exited(&self) -> bool {
        self.exit_code.lock().is_some()
    }

    /// Spawn one thread per vcpu.
    ///
    /// Each vcpu asks the controller made by `factory` first and falls back
    /// to the built-in [`vmexit::Controller`].
    pub fn start<C, F>(self: &Arc<Self>, factory: F) -> Result<(), VmError>
    where
        C: VmexitController + Send + 'static,
        F: Fn(usize) -> C,
    {
        let mut threads = self.threads.lock();
        for id in 0..self.vcpus.len() {
            let vm = self.clone();
            let controller = (factory(id), vmexit::Controller::new());
            let handle = std::thread::Builder::new()
                .name(format!("vcpu#{}", id))
                .spawn(move || Self::vcpu_thread_work(vm, id, controller))
                .map_err(|e| VmError::VCpuError(Box::new(e)))?;
            threads.push(handle);
        }
        Ok(())
    }

    /// The main loop of a VCpu.
    fn vcpu_thread_work<C: VmexitController>(vm: Arc<Vm>, id: usize, mut controller: C) {
        let mut vcpu = match VCpu::new(&vm, id) {
            Ok(vcpu) => vcpu,
            Err(e) => {
                log::error!("vcpu#{}: failed to create: {}", id, e);
                vm.abort(e);
                return;
            }
        };
        log::info!("vcpu#{}: started", id);

        while !vm.exited() {
            let result = {
                let mut devices = vm.lock_devices();
                vcpu.exec(&vm, &mut devices, &mut controller)
            };
            match result {
                Ok(VmexitResult::Exited(code)) => vm.exit(code),
                Ok(VmexitResult::Halted) => vcpu.shared().wait(|| vm.exited()),
                Ok(VmexitResult::Ok | VmexitResult::Interrupt) => (),
                Err(e) => {
                    log::error!("vcpu#{}: {}", id, e);
                    vcpu.dump();
                    vm.abort(e);
                }
            }
        }
        log::debug!("vcpu#{}: stopped", id);
    }

    /// Wait for every vcpu thread and return the exit code, or the error
    /// that stopped the vm.
    pub fn join(&self) -> Result<i32, VmError> {
        let threads = std::mem::take(&mut *self.threads.lock());
        let mut failed = 0;
        for th in threads {
            if th.join().is_err() {
                failed += 1;
            }
        }
        if let Some(e) = self.error.lock().take() {
            return Err(e);
        }
        if failed != 0 {
            return Err(VmError::VCpuError(
                format!("{} vcpu thread(s) aborted", failed).into(),
            ));
        }
        Ok(self.exit_code.lock().unwrap_or(0))
    }
}

/// Builder factory to build a virtual machine.
pub struct VmBuilder {
    hv: Arc<dyn Hypervisor>,
    vcpus: usize,
    exception_bitmap: u32,
    cpuid: Option<CpuidTable>,
    agent: Box<dyn GuestAgent>,
    hypercall: Option<Box<dyn Hypercall>>,
}

impl VmBuilder {
    /// Get a builder object to create a new vm.
    ///
    /// The vm has `vcpus` numbers of virtual CPU.
    pub fn new(hv: Arc<dyn Hypervisor>, vcpus: usize) -> Self {
        assert!(vcpus > 0);
        Self {
            hv,
            vcpus,
            exception_bitmap: 0,
            cpuid: None,
            agent: Box::new(NullAgent),
            hypercall: None,
        }
    }

    /// Add a exception bitmap to the builder.
    #[inline]
    pub fn exception_bitmap(mut self, en: u32) -> Self {
        self.exception_bitmap = en;
        self
    }

    /// Use `table` instead of the host's CPUID.
    #[inline]
    pub fn cpuid(mut self, table: CpuidTable) -> Self {
        self.cpuid = Some(table);
        self
    }

    #[inline]
    pub fn guest_agent(mut self, agent: Box<dyn GuestAgent>) -> Self {
        self.agent = agent;
        self
    }

    #[inline]
    pub fn hypercall(mut self, hypercall: Box<dyn Hypercall>) -> Self {
        self.hypercall = Some(hypercall);
        self
    }

    /// Finalize this builder.
    pub fn finalize(self) -> Result<Arc<Vm>, VmError> {
        let Self {
            hv,
            vcpus,
            exception_bitmap,
            cpuid,
            agent,
            hypercall,
        } = self;

        let slots = Arc::new(SlotManager::new(hv.clone()));
        let memory_root = MemoryRegion::new_container("memory", u64::MAX);
        let io_root = MemoryRegion::new_container("io", IO_SPACE_SIZE);
        let mut memory = MemoryMap::new();
        let memory_space = memory.add_address_space("memory", memory_root.clone())?;
        let io_space = memory.add_address_space("I/O", io_root.clone())?;
        // Ports are never backed by guest-physical memory.
        let listener: Arc<dyn MemoryListener> = slots.clone();
        memory.register_listener(listener, memory_space)?;

        Ok(Arc::new(Vm {
            hv,
            devices: Mutex::new(Devices {
                memory,
                agent,
                hypercall,
            }),
            slots,
            memory_root,
            io_root,
            memory_space,
            io_space,
            vcpus: (0..vcpus).map(|id| Arc::new(SharedVCpu::new(id))).collect(),
            cpuid: cpuid.unwrap_or_else(CpuidTable::host),
            exception_bitmap,
            exit_code: Mutex::new(None),
            error: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }))
    }
}
