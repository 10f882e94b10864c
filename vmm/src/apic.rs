//! Interrupt state of a virtual local APIC.
//!
//! Only what the exit loop consumes is modeled: the pending vectors, the
//! task priority and the base MSR. Register-level emulation of the APIC page
//! belongs to the device model mapped behind it.
use abyss::x86_64::msr::apic_base;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Pending interrupts and priority of one vcpu.
///
/// Any thread may raise an interrupt; only the owning vcpu acknowledges.
#[derive(Debug)]
pub struct VirtualApic {
    irr: [AtomicU64; 4],
    // Priority class, as in CR8.
    tpr: AtomicU8,
    base: AtomicU64,
}

impl VirtualApic {
    pub fn new(bsp: bool) -> Self {
        let apic = Self {
            irr: Default::default(),
            tpr: AtomicU8::new(0),
            base: AtomicU64::new(0),
        };
        apic.reset(bsp);
        apic
    }

    /// Drop pending interrupts and restore the power-on base.
    pub fn reset(&self, bsp: bool) {
        for word in self.irr.iter() {
            word.store(0, Ordering::SeqCst);
        }
        self.tpr.store(0, Ordering::SeqCst);
        let mut base = apic_base::DEFAULT_BASE | apic_base::ENABLE;
        if bsp {
            base |= apic_base::BSP;
        }
        self.base.store(base, Ordering::SeqCst);
    }

    /// Mark `vector` pending.
    pub fn set_irr(&self, vector: u8) {
        self.irr[(vector / 64) as usize].fetch_or(1 << (vector % 64), Ordering::SeqCst);
    }

    /// The highest pending vector.
    pub fn highest_irr(&self) -> Option<u8> {
        self.irr
            .iter()
            .enumerate()
            .rev()
            .find_map(|(idx, word)| match word.load(Ordering::SeqCst) {
                0 => None,
                v => Some((idx * 64 + 63 - v.leading_zeros() as usize) as u8),
            })
    }

    /// Whether the highest pending vector beats the task priority.
    pub fn has_deliverable(&self) -> bool {
        self.highest_irr()
            .map_or(false, |v| (v >> 4) > self.tpr())
    }

    /// Take the highest pending vector if it beats the task priority.
    pub fn ack(&self) -> Option<u8> {
        let vector = self.highest_irr().filter(|v| (v >> 4) > self.tpr())?;
        self.irr[(vector / 64) as usize].fetch_and(!(1 << (vector % 64)), Ordering::SeqCst);
        Some(vector)
    }

    /// Task priority class (0-15).
    #[inline]
    pub fn tpr(&self) -> u8 {
        self.tpr.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_tpr(&self, tpr: u8) {
        self.tpr.store(tpr & 0xf, Ordering::SeqCst);
    }

    /// Value of IA32_APIC_BASE.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base.load(Ordering::SeqCst)
    }

    /// Update IA32_APIC_BASE. The BSP flag is read-only.
    pub fn set_base(&self, v: u64) {
        let bsp = self.base() & apic_base::BSP;
        self.base
            .store((v & !apic_base::BSP) | bsp, Ordering::SeqCst);
    }
}
