//! The small slice of SMP support the engine needs at run time: knowing
//! which core it is on, and kicking parked cores out of their halt with
//! an NMI. CPU discovery and AP startup belong to the boot code.

use engine::system::MAX_CPUS;

/// Local APIC register offsets, in u32 units.
const APIC_ICR_LOW: usize = 0x300 / 4;
const APIC_ICR_HIGH: usize = 0x310 / 4;

/// ICR delivery mode NMI, level asserted.
const ICR_NMI_ASSERT: u32 = (0b100 << 8) | (1 << 14);

pub struct LocalApic {
    base: *mut u32,
    /// APIC ID of each core, by core ordinal.
    apic_ids: [u32; MAX_CPUS],
    num_cpus: usize,
}

// The APIC MMIO window is a shared hardware resource; every register
// write here is a self-contained u32 store.
unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

impl LocalApic {
    /// # Safety
    ///
    /// base must be the mapped local APIC MMIO window.
    pub unsafe fn new(base: usize, apic_ids: &[u32]) -> Self {
        let mut ids = [0; MAX_CPUS];
        let num_cpus = apic_ids.len().min(MAX_CPUS);
        ids[..num_cpus].copy_from_slice(&apic_ids[..num_cpus]);
        Self { base: base as *mut u32, apic_ids: ids, num_cpus }
    }

    /// Sends a non-maskable interrupt to the core with the given ordinal
    /// number, waking it from a barrier halt.
    pub fn send_nmi(&self, cpu: usize) {
        if cpu >= self.num_cpus {
            return;
        }
        let apic_id = self.apic_ids[cpu];
        unsafe {
            self.base.add(APIC_ICR_HIGH).write_volatile(apic_id << 24);
            self.base.add(APIC_ICR_LOW).write_volatile(ICR_NMI_ASSERT);
        }
        // Wait for the delivery-pending bit to clear.
        while unsafe { self.base.add(APIC_ICR_LOW).read_volatile() } & (1 << 12) != 0 {
            core::hint::spin_loop();
        }
    }

    /// The ordinal number of the calling core, from its APIC ID.
    pub fn current_cpu(&self) -> usize {
        let apic_id = current_apic_id();
        self.apic_ids[..self.num_cpus].iter().position(|&id| id == apic_id).unwrap_or(0)
    }
}

fn current_apic_id() -> u32 {
    x86::cpuid::CpuId::new()
        .get_feature_info()
        .map(|features| features.initial_local_apic_id() as u32)
        .unwrap_or(0)
}
