//! The boot shim: global initialisation, AP join, and the relocation
//! trampoline.
//!
//! The engine proper is position independent and its state lives on the
//! heap, outside both load sites. All the shim has to do when the driver
//! asks for a relocation is copy the image to the alternate site, let
//! every core rendezvous, and re-enter the run loop through the copy.

use crate::heap;
use crate::smp::LocalApic;
use crate::system::X86System;
use crate::vmem::{VirtualMemory, WindowTables};
use core::sync::atomic::{AtomicUsize, Ordering};
use engine::config::RunConfig;
use engine::driver::ProgramImage;
use engine::pmem::{PhysMemMap, PmRange, MAX_MEM_RANGES};
use engine::system::{System, MAX_CPUS};
use engine::ui::Ui;
use engine::{Engine, LoadSite, RunExit};
use once_cell::race::OnceBox;

/// Everything the bootloader hands over. Lives in permanently mapped
/// memory; the shim maps the parts that need it and never looks back.
#[repr(C)]
pub struct BootInfo {
    /// Where the program image currently sits, and how big it is
    /// including per-CPU stacks.
    pub image_base: usize,
    pub image_size: usize,

    pub heap_base: usize,
    pub heap_size: usize,

    pub mem_ranges: [PmRange; MAX_MEM_RANGES],
    pub num_mem_ranges: usize,

    pub apic_base: usize,
    pub apic_ids: [u32; MAX_CPUS],
    pub num_cpus: usize,

    /// The page directories reserved for the test window and device
    /// regions (see [`WindowTables`]).
    pub window_tables: *mut WindowTables,

    pub tsc_hz: u64,

    /// Highest addressable physical page, from CPUID.
    pub max_phys_pages: usize,
    pub nx_supported: bool,
}

static ENGINE: OnceBox<Engine<X86System>> = OnceBox::new();

/// Where the running image currently starts. Travels with the image on
/// relocation, like every other static.
static IMAGE_BASE: AtomicUsize = AtomicUsize::new(0);

/// Image size in testwords, fixed at boot.
static IMAGE_WORDS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn engine() -> Option<&'static Engine<X86System>> {
    ENGINE.get()
}

/// Entry point for the bootstrap processor, called once paging, the
/// serial console and the trap stubs are up. The display surface is
/// provided by the external TUI crate.
///
/// # Safety
///
/// boot_info must describe the live platform truthfully; all APs must
/// still be parked.
pub unsafe fn firmware_main(
    boot_info: &'static BootInfo,
    config: RunConfig,
    ui: &'static dyn Ui,
) -> ! {
    com_logger::builder().filter(log::LevelFilter::Info).setup();
    log::info!("memory diagnostic starting");

    heap::init(boot_info.heap_base, boot_info.heap_size);
    IMAGE_BASE.store(boot_info.image_base, Ordering::Relaxed);
    IMAGE_WORDS.store(boot_info.image_size / core::mem::size_of::<usize>(), Ordering::Relaxed);

    let vmem = VirtualMemory::new(
        &mut *boot_info.window_tables,
        boot_info.nx_supported,
        boot_info.max_phys_pages,
    );
    let apic = LocalApic::new(boot_info.apic_base, &boot_info.apic_ids[..boot_info.num_cpus]);
    let ecc_polling = config.enable_ecc_polling;
    let sys = X86System::new(vmem, apic, boot_info.tsc_hz, ecc_polling);

    let pm_map = match PhysMemMap::new(&boot_info.mem_ranges[..boot_info.num_mem_ranges]) {
        Ok(map) => map,
        Err(err) => {
            log::error!("bad memory map: {}", err);
            crate::hwctrl::reboot();
        }
    };
    log::info!("{} GiB of physical memory in {} ranges", pm_map.total_size_in_gb(), pm_map.get_ranges().len());

    let program = ProgramImage { base: boot_info.image_base, size: boot_info.image_size };
    let engine = match Engine::new(sys, ui, config, pm_map, boot_info.num_cpus, program) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("cannot start: {}", err);
            crate::hwctrl::reboot();
        }
    };

    let engine = ENGINE.get_or_init(|| engine);

    // The boot code releases the APs into ap_main once this returns
    // control to it conceptually; here they are already spinning on
    // ENGINE becoming available.
    shim_loop(engine, 0);
}

/// Entry point for each application processor once started by the boot
/// code.
pub fn ap_main() -> ! {
    let engine = loop {
        if let Some(engine) = ENGINE.get() {
            break engine;
        }
        core::hint::spin_loop();
    };

    let my_cpu = engine.sys.current_cpu();
    log::trace!("AP {} joined", my_cpu);
    shim_loop(engine, my_cpu);
}

fn shim_loop(engine: &'static Engine<X86System>, my_cpu: usize) -> ! {
    loop {
        match engine.run(my_cpu) {
            RunExit::NeedsRelocate(site) => relocate(engine, my_cpu, site),
            RunExit::Complete => {
                log::info!("run complete");
                engine.sys.reboot();
            }
        }
    }
}

/// Copies the program image to the alternate load site and continues
/// execution from the copy. Every core arrives here together (the driver
/// rendezvouses before returning), so nobody is left executing code in
/// the source image while it is being overwritten by the next window.
fn relocate(engine: &'static Engine<X86System>, my_cpu: usize, site: LoadSite) {
    let old_base = IMAGE_BASE.load(Ordering::Relaxed);
    let new_base = engine.load_addr(site);

    if my_cpu == 0 {
        log::trace!("relocating image {:#x} -> {:#x}", old_base, new_base);
        unsafe {
            engine.sys.copy_words(
                new_base as *mut usize,
                old_base as *const usize,
                IMAGE_WORDS.load(Ordering::Relaxed),
            );
        }
        engine.sys.fence();
        engine.set_load_site(site);
        // The copy carries this static along; fix it up in the copy.
        let moved = new_base + (&IMAGE_BASE as *const _ as usize - old_base);
        unsafe { &*(moved as *const AtomicUsize) }.store(new_base, Ordering::Relaxed);
    }

    // Nobody jumps before the copy is complete.
    engine.rendezvous(my_cpu);

    // Resume at the same point in the copied image. The per-CPU stacks
    // sit at the end of the image and were copied with it; the jump
    // target re-derives everything else from the heap-resident engine.
    unsafe {
        let resume = resume_after_relocation as usize - old_base + new_base;
        let resume: extern "C" fn(usize) -> ! = core::mem::transmute(resume);
        resume(my_cpu);
    }
}

extern "C" fn resume_after_relocation(my_cpu: usize) -> ! {
    let engine = ENGINE.get().expect("engine state lives on the heap, outside the image");
    shim_loop(engine, my_cpu)
}
