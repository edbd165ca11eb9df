//! The pass driver and process lifecycle: sweeps every enabled test over
//! every memory window, elects masters, calibrates progress budgets with a
//! dummy pass, and hands relocation requests up to the boot shim.
//!
//! Because tests 1, 2, 6 and 7 occasionally require the program to move
//! itself between its two load sites, the driver cannot be written as a
//! set of nested loops. It is a single flat loop; the loop nesting state
//! lives in a handful of flags so execution can resume exactly where it
//! left off after a relocation re-enters [`Engine::run`].

use crate::config::{CpuMode, CpuState, RunConfig};
use crate::patterns::{NUM_TEST_PATTERNS, TEST_LIST};
use crate::pmem::PhysMemMap;
use crate::report::{ReportCtx, Reporter};
use crate::sync::Barrier;
use crate::system::{System, MAX_CPUS};
use crate::testword::{Testword, PAGE_SHIFT, PAGE_SIZE};
use crate::ui::{Ui, UiEvent};
use crate::window::{VmMap, LOW_LOAD_LIMIT_PAGES, VM_PINNED_PAGES, VM_WINDOW_PAGES};
use alloc::boxed::Box;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use elain::Align;
use snafu::Snafu;
use spin::RwLock;

/// The lowest address the program may be loaded at. The first page is
/// left to the BIOS data area.
const MIN_LOAD_ADDR: usize = 0x1000;

const LOW_LOAD_LIMIT: usize = LOW_LOAD_LIMIT_PAGES << PAGE_SHIFT;
const HIGH_LOAD_LIMIT: usize = VM_PINNED_PAGES << PAGE_SHIFT;

pub const NUM_PASS_KINDS: usize = 2;

/// The 0th pass of every run uses reduced iteration counts; its tick
/// budget is calibrated separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Fast = 0,
    Full = 1,
}

impl PassKind {
    pub fn of(pass_num: usize) -> Self {
        if pass_num == 0 {
            PassKind::Fast
        } else {
            PassKind::Full
        }
    }
}

/// One of the two alternate program load sites. The low site sits below
/// 4 MiB and is used while testing every window except window 0, which
/// covers low memory and therefore requires the high site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSite {
    Low = 0,
    High = 1,
}

/// Why [`Engine::run`] returned. `NeedsRelocate` asks the boot shim to
/// copy the program image to the other load site and re-enter; every core
/// returns it together, after a rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    NeedsRelocate(LoadSite),
    Complete,
}

/// Where the program image currently lives, as told by the boot shim.
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage {
    pub base: usize,
    pub size: usize,
}

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("physical memory map is empty, unordered or too large"))]
    InvalidMemoryMap,

    #[snafu(display("insufficient free space in range {lower:#x} to {upper:#x}"))]
    InsufficientLoadSpace { lower: usize, upper: usize },

    #[snafu(display("no enabled CPU cores"))]
    NoEnabledCpus,
}

bitflags! {
    struct DriverFlags: u32 {
        const START_RUN  = 1 << 0;
        const START_PASS = 1 << 1;
        const START_TEST = 1 << 2;
        const RERUN_TEST = 1 << 3;
        const DUMMY_RUN  = 1 << 4;
    }
}

/// State owned exclusively by one worker, spaced out so two workers never
/// share a cache line.
#[repr(C)]
pub(crate) struct PerCpu {
    /// The address this worker is currently testing, for parity-error
    /// attribution.
    pub test_addr: AtomicUsize,
    _spacing: Align<64>,
}

impl PerCpu {
    const INIT: PerCpu = PerCpu { test_addr: AtomicUsize::new(0), _spacing: Align::NEW };
}

/// Shared driver state. The scalar fields are written only by the
/// bookkeeping CPU (or the current master) between barriers and read by
/// everyone after, which is why relaxed atomics are sufficient: the
/// barriers provide the ordering.
pub(crate) struct DriverState {
    flags: AtomicU32,

    bail: AtomicBool,
    restart: AtomicBool,
    complete: AtomicBool,

    pass_num: AtomicUsize,
    test_num: AtomicUsize,
    window_num: AtomicUsize,
    test_stage: AtomicUsize,

    master_cpu: AtomicUsize,
    num_active_cpus: AtomicUsize,
    num_enabled_cpus: AtomicUsize,
    num_available_cpus: AtomicUsize,

    window_start: AtomicUsize,
    window_end: AtomicUsize,
    num_pages_to_test: AtomicUsize,

    current_site: AtomicU8,

    /// The last bit-fade stage that ran, so a stage re-entered after a
    /// relocation does not sleep twice.
    pub bit_fade_last_stage: AtomicIsize,

    ticks_per_pass: [AtomicUsize; NUM_PASS_KINDS],
    ticks_per_test: [[AtomicUsize; NUM_TEST_PATTERNS]; NUM_PASS_KINDS],

    test_ticks: AtomicUsize,
    pass_ticks: AtomicUsize,
}

impl DriverState {
    fn new(site: LoadSite) -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        const TEST_ZEROS: [AtomicUsize; NUM_TEST_PATTERNS] = [ZERO; NUM_TEST_PATTERNS];
        Self {
            flags: AtomicU32::new((DriverFlags::START_RUN | DriverFlags::DUMMY_RUN).bits()),
            bail: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            pass_num: ZERO,
            test_num: ZERO,
            window_num: ZERO,
            test_stage: ZERO,
            master_cpu: ZERO,
            num_active_cpus: AtomicUsize::new(1),
            num_enabled_cpus: AtomicUsize::new(1),
            num_available_cpus: AtomicUsize::new(1),
            window_start: ZERO,
            window_end: ZERO,
            num_pages_to_test: ZERO,
            current_site: AtomicU8::new(site as u8),
            bit_fade_last_stage: AtomicIsize::new(-1),
            ticks_per_pass: [ZERO; NUM_PASS_KINDS],
            ticks_per_test: [TEST_ZEROS; NUM_PASS_KINDS],
            test_ticks: ZERO,
            pass_ticks: ZERO,
        }
    }

    fn flags(&self) -> DriverFlags {
        DriverFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    fn store_flags(&self, flags: DriverFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    fn dummy_run(&self) -> bool {
        self.flags().contains(DriverFlags::DUMMY_RUN)
    }

    pub fn bail(&self) -> bool {
        self.bail.load(Ordering::Relaxed)
    }

    pub fn pass_num(&self) -> usize {
        self.pass_num.load(Ordering::Relaxed)
    }

    pub fn test_num(&self) -> usize {
        self.test_num.load(Ordering::Relaxed)
    }

    pub fn window_num(&self) -> usize {
        self.window_num.load(Ordering::Relaxed)
    }

    pub fn test_stage(&self) -> usize {
        self.test_stage.load(Ordering::Relaxed)
    }

    pub fn master_cpu(&self) -> usize {
        self.master_cpu.load(Ordering::Relaxed)
    }

    pub fn num_active_cpus(&self) -> usize {
        self.num_active_cpus.load(Ordering::Relaxed)
    }

    pub fn num_pages_to_test(&self) -> usize {
        self.num_pages_to_test.load(Ordering::Relaxed)
    }

    fn current_site(&self) -> LoadSite {
        if self.current_site.load(Ordering::Relaxed) == 0 {
            LoadSite::Low
        } else {
            LoadSite::High
        }
    }
}

pub struct Engine<S: System> {
    pub sys: S,
    pub ui: &'static dyn Ui,
    pub config: RwLock<RunConfig>,
    pub pm_map: PhysMemMap,
    pub reporter: Reporter,

    pub(crate) start_barrier: Barrier,
    pub(crate) run_barrier: Barrier,
    pub(crate) vm_map: RwLock<VmMap>,
    pub(crate) per_cpu: [PerCpu; MAX_CPUS],
    pub(crate) chunk_index: [AtomicU8; MAX_CPUS],
    pub(crate) state: DriverState,

    low_load_addr: usize,
    high_load_addr: usize,
}

impl<S: System> Engine<S> {
    /// Performs the global initialisation: counts the enabled cores,
    /// assigns chunk indices, picks the two program load sites and arms
    /// the barriers. APs must not have been started yet.
    pub fn new(
        sys: S,
        ui: &'static dyn Ui,
        config: RunConfig,
        pm_map: PhysMemMap,
        num_available_cpus: usize,
        program: ProgramImage,
    ) -> Result<Box<Self>, EngineError> {
        const CHUNK_ZERO: AtomicU8 = AtomicU8::new(0);

        let chunk_index = [CHUNK_ZERO; MAX_CPUS];
        let mut num_enabled = 0;
        for i in 0..num_available_cpus.min(MAX_CPUS) {
            if config.cpu_state[i] == CpuState::Enabled {
                chunk_index[i].store(num_enabled as u8, Ordering::Relaxed);
                num_enabled += 1;
            }
        }
        if num_enabled == 0 {
            return Err(EngineError::NoEnabledCpus);
        }

        let (low_load_addr, high_load_addr) = Self::pick_load_addresses(&pm_map, &program)?;
        log::trace!("program size {}kB", program.size / 1024);
        log::trace!(" low_load_addr {:#x}", low_load_addr);
        log::trace!("high_load_addr {:#x}", high_load_addr);
        for range in pm_map.get_ranges() {
            log::trace!("pm {:#x} - {:#x}", range.start, range.end);
        }

        let site = if program.base < LOW_LOAD_LIMIT { LoadSite::Low } else { LoadSite::High };

        let engine = Box::new(Self {
            sys,
            ui,
            start_barrier: Barrier::new(num_enabled),
            run_barrier: Barrier::new(1),
            vm_map: RwLock::new(VmMap::default()),
            per_cpu: [PerCpu::INIT; MAX_CPUS],
            chunk_index,
            state: DriverState::new(site),
            reporter: Reporter::new(),
            low_load_addr,
            high_load_addr,
            config: RwLock::new(config),
            pm_map,
        });

        engine.state.num_enabled_cpus.store(num_enabled, Ordering::Relaxed);
        engine.state.num_available_cpus.store(num_available_cpus, Ordering::Relaxed);
        engine.state.num_pages_to_test.store(engine.compute_pages_to_test(), Ordering::Relaxed);

        Ok(engine)
    }

    /// Finds a load address for the program in each of the two load
    /// windows, preferring the address it already occupies.
    fn pick_load_addresses(
        pm_map: &PhysMemMap,
        program: &ProgramImage,
    ) -> Result<(usize, usize), EngineError> {
        let mut addrs = [0; 2];
        for (slot, (lower_limit, upper_limit)) in
            [(MIN_LOAD_ADDR, LOW_LOAD_LIMIT), (LOW_LOAD_LIMIT, HIGH_LOAD_LIMIT)]
                .into_iter()
                .enumerate()
        {
            addrs[slot] = Self::set_load_addr(pm_map, program, lower_limit, upper_limit)
                .ok_or(EngineError::InsufficientLoadSpace {
                    lower: lower_limit,
                    upper: upper_limit,
                })?;
        }
        Ok((addrs[0], addrs[1]))
    }

    fn set_load_addr(
        pm_map: &PhysMemMap,
        program: &ProgramImage,
        lower_limit: usize,
        upper_limit: usize,
    ) -> Option<usize> {
        if program.base >= lower_limit && program.base + program.size <= upper_limit {
            return Some(program.base);
        }

        for range in pm_map.get_ranges() {
            let mut try_start = range.start << PAGE_SHIFT;
            let try_limit = range.end << PAGE_SHIFT;
            if try_start < lower_limit {
                try_start = lower_limit;
            }
            let try_end = try_start + program.size;
            if try_end > try_limit {
                continue;
            }
            if try_start >= upper_limit {
                break;
            }
            return Some(try_start);
        }
        None
    }

    pub fn load_addr(&self, site: LoadSite) -> usize {
        match site {
            LoadSite::Low => self.low_load_addr,
            LoadSite::High => self.high_load_addr,
        }
    }

    /// Records that the boot shim has moved execution to the given site.
    pub fn set_load_site(&self, site: LoadSite) {
        self.state.current_site.store(site as u8, Ordering::Relaxed);
    }

    /// Requests a restart from a fresh dummy pass, as after a
    /// configuration change.
    pub fn request_restart(&self) {
        self.state.restart.store(true, Ordering::Relaxed);
    }

    /// The total number of pages that will be touched per window sweep,
    /// given the configured limits.
    fn compute_pages_to_test(&self) -> usize {
        let config = self.config.read();
        self.pm_map
            .get_ranges()
            .iter()
            .map(|r| {
                let start = r.start.max(config.pm_limit_lower);
                let end = r.end.min(config.pm_limit_upper);
                end.saturating_sub(start)
            })
            .sum()
    }

    pub(crate) fn is_master(&self, worker: Option<usize>) -> bool {
        worker == Some(self.state.master_cpu())
    }

    pub(crate) fn test_enabled(&self, test: usize) -> bool {
        self.config.read().test_enabled[test]
    }

    fn report_ctx(&self) -> ReportCtx<'_> {
        let config = self.config.read();
        ReportCtx {
            ui: self.ui,
            mode: config.error_mode,
            pass_num: self.state.pass_num(),
            test_num: self.state.test_num(),
            cpu: self.sys.current_cpu(),
            big_status: config.enable_big_status,
        }
    }

    pub(crate) fn addr_error(
        &self,
        addr1: *const Testword,
        _addr2: *const Testword,
        good: Testword,
        bad: Testword,
    ) {
        let page = self.sys.page_of(addr1);
        let offset = addr1 as usize & (PAGE_SIZE - 1);
        self.reporter.addr_error(&self.report_ctx(), page, offset, addr1 as usize, good, bad);
    }

    pub(crate) fn data_error(
        &self,
        addr: *const Testword,
        good: Testword,
        bad: Testword,
        use_for_badram: bool,
    ) {
        let page = self.sys.page_of(addr);
        let offset = addr as usize & (PAGE_SIZE - 1);
        self.reporter.data_error(
            &self.report_ctx(),
            page,
            offset,
            addr as usize,
            good,
            bad,
            use_for_badram,
        );
    }

    /// Reports the mismatching lanes of a vector-wide compare.
    pub(crate) fn data_error_wide(
        &self,
        base: *const Testword,
        good: &[Testword],
        bad: &[Testword],
        use_for_badram: bool,
    ) {
        for (i, (g, b)) in good.iter().zip(bad.iter()).enumerate() {
            if g != b {
                self.data_error(unsafe { base.add(i) }, *g, *b, use_for_badram);
            }
        }
    }

    /// Advances progress accounting, polls the memory controller and the
    /// keyboard. Called by every worker once per SPIN_SIZE block; only the
    /// master does the serial bookkeeping.
    pub(crate) fn tick(&self, worker: Option<usize>) {
        let Some(w) = worker else { return };
        if w != self.state.master_cpu() {
            return;
        }

        if !self.state.dummy_run() {
            let kind = PassKind::of(self.state.pass_num()) as usize;
            let test = self.state.test_num();

            let test_ticks = self.state.test_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            let pass_ticks = self.state.pass_ticks.fetch_add(1, Ordering::Relaxed) + 1;

            let test_budget = self.state.ticks_per_test[kind][test].load(Ordering::Relaxed).max(1);
            let pass_budget = self.state.ticks_per_pass[kind].load(Ordering::Relaxed).max(1);
            self.ui.progress(
                (test_ticks * 1000 / test_budget).min(1000),
                (pass_ticks * 1000 / pass_budget).min(1000),
            );
        }

        if self.config.read().enable_ecc_polling {
            if let Some(status) = self.sys.poll_ecc() {
                self.reporter.ecc_error(&self.report_ctx(), status);
            }
        }

        match self.ui.check_input() {
            UiEvent::Restart => self.state.restart.store(true, Ordering::Relaxed),
            UiEvent::Reboot => self.sys.reboot(),
            UiEvent::None => {}
        }
    }

    /// Reports a parity error against the last address this core touched.
    pub fn parity_error(&self) {
        let cpu = self.sys.current_cpu();
        let last = self.per_cpu[cpu].test_addr.load(Ordering::Relaxed);
        self.reporter.parity_error(&self.report_ctx(), last);
    }

    fn short_barrier(&self, my_cpu: usize) {
        #[cfg(feature = "trace-barriers")]
        log::trace!("cpu {}: start barrier wait", my_cpu);

        if self.config.read().power_save < crate::config::PowerSave::High {
            self.start_barrier.spin_wait(&self.sys);
        } else {
            self.start_barrier.halt_wait(&self.sys, my_cpu);
        }
    }

    fn long_barrier(&self, my_cpu: usize) {
        #[cfg(feature = "trace-barriers")]
        log::trace!("cpu {}: start barrier wait (long)", my_cpu);

        if self.config.read().power_save > crate::config::PowerSave::Off {
            self.start_barrier.halt_wait(&self.sys, my_cpu);
        } else {
            self.start_barrier.spin_wait(&self.sys);
        }
    }

    /// The main loop, entered by every enabled core (the BSP and all APs).
    /// Returns when the boot shim must relocate the image, or when the
    /// configured pass limit is reached.
    pub fn run(&self, my_cpu: usize) -> RunExit {
        loop {
            self.short_barrier(my_cpu);
            if self.state.complete.load(Ordering::Relaxed) {
                return RunExit::Complete;
            }

            if my_cpu == 0 {
                self.start_of_round();
            }
            self.short_barrier(my_cpu);

            let test_num = self.state.test_num();
            if self.test_enabled(test_num) {
                if let Some(exit) = self.test_all_windows(my_cpu) {
                    return exit;
                }
            }
            self.short_barrier(my_cpu);

            if my_cpu != 0 {
                continue;
            }
            if let Some(exit) = self.end_of_round() {
                if exit == RunExit::Complete {
                    // Let the other cores observe completion at the next
                    // rendezvous before we leave.
                    continue;
                }
            }
        }
    }

    /// Bookkeeping performed by CPU 0 at the top of each round, while the
    /// other cores hold between the barriers.
    fn start_of_round(&self) {
        let dummy = self.state.dummy_run();
        let mut flags = self.state.flags();

        if flags.contains(DriverFlags::START_RUN) {
            self.state.pass_num.store(0, Ordering::Relaxed);
            self.state.num_pages_to_test.store(self.compute_pages_to_test(), Ordering::Relaxed);
            flags.insert(DriverFlags::START_PASS);
            if !dummy {
                self.ui.start_run();
                self.reporter.reset();
            }
        }
        if flags.contains(DriverFlags::START_PASS) {
            self.state.test_num.store(0, Ordering::Relaxed);
            flags.insert(DriverFlags::START_TEST);
            let kind = PassKind::of(self.state.pass_num()) as usize;
            if dummy {
                self.state.ticks_per_pass[kind].store(0, Ordering::Relaxed);
            } else {
                self.ui.start_pass(self.state.pass_num());
                self.state.pass_ticks.store(0, Ordering::Relaxed);
            }
        }
        if flags.contains(DriverFlags::START_TEST) {
            let test = self.state.test_num();
            log::trace!("start test {}", test);
            self.state.test_stage.store(0, Ordering::Relaxed);
            self.state.bit_fade_last_stage.store(-1, Ordering::Relaxed);
            flags.insert(DriverFlags::RERUN_TEST);
            let kind = PassKind::of(self.state.pass_num()) as usize;
            if dummy {
                self.state.ticks_per_test[kind][test].store(0, Ordering::Relaxed);
            } else if self.test_enabled(test) {
                self.ui.start_test(test, TEST_LIST[test].description);
                self.state.test_ticks.store(0, Ordering::Relaxed);
            }
            self.state.bail.store(false, Ordering::Relaxed);
        }
        if flags.contains(DriverFlags::RERUN_TEST) {
            self.state.window_num.store(0, Ordering::Relaxed);
            self.state.window_start.store(0, Ordering::Relaxed);
            self.state.window_end.store(0, Ordering::Relaxed);
        }

        flags.remove(
            DriverFlags::START_RUN
                | DriverFlags::START_PASS
                | DriverFlags::START_TEST
                | DriverFlags::RERUN_TEST,
        );
        self.state.store_flags(flags);
    }

    /// Bookkeeping performed by CPU 0 at the end of each round: stage and
    /// master advancement, test and pass roll-over.
    fn end_of_round(&self) -> Option<RunExit> {
        match self.ui.check_input() {
            UiEvent::Restart => self.state.restart.store(true, Ordering::Relaxed),
            UiEvent::Reboot => self.sys.reboot(),
            UiEvent::None => {}
        }

        if self.state.restart.swap(false, Ordering::Relaxed) {
            // The configuration has been changed; start over.
            self.state.master_cpu.store(0, Ordering::Relaxed);
            self.state.num_pages_to_test.store(self.compute_pages_to_test(), Ordering::Relaxed);
            self.state.store_flags(DriverFlags::START_RUN | DriverFlags::DUMMY_RUN);
            return None;
        }

        let dummy = self.state.dummy_run();
        if !dummy {
            self.reporter.refresh(&self.report_ctx());
        }

        let test = self.state.test_num();
        if self.test_enabled(test) {
            let stage = self.state.test_stage() + 1;
            if stage < TEST_LIST[test].stages {
                self.state.test_stage.store(stage, Ordering::Relaxed);
                let mut flags = self.state.flags();
                flags.insert(DriverFlags::RERUN_TEST);
                self.state.store_flags(flags);
                return None;
            }
            self.state.test_stage.store(0, Ordering::Relaxed);

            let cpu_mode = self.config.read().cpu_mode;
            let rerun = match cpu_mode {
                CpuMode::Parallel => {
                    if TEST_LIST[test].cpu_mode == CpuMode::Sequential {
                        self.select_next_master();
                        self.state.master_cpu() != 0
                    } else {
                        false
                    }
                }
                CpuMode::One => {
                    self.select_next_master();
                    false
                }
                CpuMode::Sequential => {
                    self.select_next_master();
                    self.state.master_cpu() != 0
                }
            };
            if rerun {
                let mut flags = self.state.flags();
                flags.insert(DriverFlags::RERUN_TEST);
                self.state.store_flags(flags);
                return None;
            }
        }

        let kind = PassKind::of(self.state.pass_num()) as usize;
        if dummy {
            let test_ticks = self.state.ticks_per_test[kind][test].load(Ordering::Relaxed);
            self.state.ticks_per_pass[kind].fetch_add(test_ticks, Ordering::Relaxed);
        }

        let mut flags = self.state.flags();
        flags.insert(DriverFlags::START_TEST);

        let test = test + 1;
        self.state.test_num.store(test, Ordering::Relaxed);
        if test < NUM_TEST_PATTERNS {
            self.state.store_flags(flags);
            return None;
        }

        let pass = self.state.pass_num() + 1;
        self.state.pass_num.store(pass, Ordering::Relaxed);

        if dummy && pass == NUM_PASS_KINDS {
            // Calibration is complete; start the real run.
            flags.insert(DriverFlags::START_RUN);
            flags.remove(DriverFlags::DUMMY_RUN);
            self.state.store_flags(flags);
            return None;
        }

        flags.insert(DriverFlags::START_PASS);
        self.state.store_flags(flags);

        if !dummy {
            self.ui.pass_count(pass);
            if self.reporter.error_count() == 0 {
                self.ui.status("Pass   ");
                if self.config.read().enable_big_status {
                    self.ui.big_status(true);
                }
            }

            if let Some(limit) = self.config.read().pass_limit {
                if pass >= limit {
                    self.state.complete.store(true, Ordering::Relaxed);
                    return Some(RunExit::Complete);
                }
            }
        }
        None
    }

    /// Walks the selected test across every memory window. Returns Some
    /// when the whole run loop must unwind (relocation).
    fn test_all_windows(&self, my_cpu: usize) -> Option<RunExit> {
        let dummy = self.state.dummy_run();
        let test = self.state.test_num();
        let i_am_master = my_cpu == self.state.master_cpu();

        let parallel_test = !dummy
            && self.config.read().cpu_mode == CpuMode::Parallel
            && TEST_LIST[test].cpu_mode == CpuMode::Parallel;
        let i_am_active = i_am_master || parallel_test;

        if i_am_master {
            let num_active = if parallel_test {
                self.state.num_enabled_cpus.load(Ordering::Relaxed)
            } else {
                1
            };
            self.state.num_active_cpus.store(num_active, Ordering::Relaxed);
            self.run_barrier.reset(num_active);
        }

        let mut iterations = TEST_LIST[test].iterations;
        if self.state.pass_num() == 0 {
            // Reduce iterations for a faster first pass.
            iterations /= 3;
        }

        let config_limit_lower = self.config.read().pm_limit_lower;

        loop {
            self.long_barrier(my_cpu);
            if self.state.bail() {
                break;
            }

            if i_am_master {
                if self.state.window_num() == 0 && TEST_LIST[test].stages > 1 {
                    // A multi-stage test runs through all the windows at
                    // each stage; a relocation in between would disrupt it.
                    self.state.window_num.store(1, Ordering::Relaxed);
                }
                if self.state.window_num() == 0 && config_limit_lower >= LOW_LOAD_LIMIT_PAGES {
                    // Nothing to test below the low load site, so skip the
                    // relocation dance.
                    self.state.window_num.store(1, Ordering::Relaxed);
                }
            }
            self.short_barrier(my_cpu);

            // Relocate if necessary: window 0 covers the low site, so it
            // is tested while running from the high site, and vice versa.
            if !dummy {
                let needed =
                    if self.state.window_num() > 0 { LoadSite::Low } else { LoadSite::High };
                if self.state.current_site() != needed {
                    // Nobody may execute code in the block being copied,
                    // so every core rendezvouses before unwinding.
                    self.long_barrier(my_cpu);
                    return Some(RunExit::NeedsRelocate(needed));
                }
            }

            if i_am_master {
                let (win_start, win_end) = match self.state.window_num() {
                    0 => (0, LOW_LOAD_LIMIT_PAGES),
                    1 => (LOW_LOAD_LIMIT_PAGES, VM_WINDOW_PAGES),
                    _ => {
                        let end = self.state.window_end.load(Ordering::Relaxed);
                        (end, end + VM_WINDOW_PAGES)
                    }
                };
                self.state.window_start.store(win_start, Ordering::Relaxed);
                self.state.window_end.store(win_end, Ordering::Relaxed);

                let config = self.config.read();
                *self.vm_map.write() = VmMap::setup(
                    &self.sys,
                    &self.pm_map,
                    win_start,
                    win_end,
                    config.pm_limit_lower,
                    config.pm_limit_upper,
                );
            }
            self.short_barrier(my_cpu);

            if i_am_active {
                let (mapped_pages, window_base) = {
                    let vm_map = self.vm_map.read();
                    let base = vm_map.entries.first().map(|e| e.pm_base_addr).unwrap_or(0);
                    (vm_map.mapped_pages, base)
                };

                if mapped_pages == 0 {
                    // No memory to test in this window.
                    if i_am_master {
                        self.state.window_num.fetch_add(1, Ordering::Relaxed);
                    }
                } else if dummy {
                    if i_am_master {
                        let stage = self.state.test_stage();
                        let ticks = self.run_test(None, test, stage, iterations);
                        let kind = PassKind::of(self.state.pass_num()) as usize;
                        self.state.ticks_per_test[kind][test].fetch_add(ticks, Ordering::Relaxed);
                        self.state.window_num.fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    if !self.sys.map_window(window_base) {
                        // The platform cannot address this range.
                        log::warn!("cannot map window at page {:#x}", window_base);
                        break;
                    }
                    let stage = self.state.test_stage();
                    self.run_test(Some(my_cpu), test, stage, iterations);
                    if i_am_master {
                        self.state.window_num.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if self.state.window_end.load(Ordering::Relaxed) >= self.pm_map.end_page() {
                break;
            }
        }
        None
    }

    /// A plain rendezvous of all enabled cores, for the boot shim to
    /// order the image copy against the re-entry jumps.
    pub fn rendezvous(&self, my_cpu: usize) {
        self.short_barrier(my_cpu);
    }

    /// Advances the master to the next enabled core.
    fn select_next_master(&self) {
        let available = self.state.num_available_cpus.load(Ordering::Relaxed);
        let config = self.config.read();
        let mut master = self.state.master_cpu();
        loop {
            master = (master + 1) % available;
            if config.cpu_state[master] != CpuState::Disabled {
                break;
            }
        }
        self.state.master_cpu.store(master, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl<S: System> Engine<S> {
    /// Points the engine at a prebuilt VM map and marks calibration as
    /// done, so unit tests can invoke the primitives directly.
    pub(crate) fn prime_for_direct_tests(&self, entries: &[crate::window::VmMapEntry]) {
        let mut vm_map = self.vm_map.write();
        vm_map.entries.clear();
        let mut words = 0;
        for entry in entries {
            words += (entry.end as usize - entry.start as usize) / core::mem::size_of::<Testword>() + 1;
            vm_map.entries.push(*entry);
        }
        vm_map.mapped_pages = (words * core::mem::size_of::<Testword>()).div_ceil(PAGE_SIZE);
        drop(vm_map);

        self.state.store_flags(DriverFlags::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerSave;
    use crate::patterns::NUM_TEST_PATTERNS;
    use crate::pmem::PmRange;
    use crate::sim::{run_engine, sim_set_cpu, SimSystem, TestBench};
    use core::sync::atomic::AtomicUsize;

    fn run_config(tests: &[usize]) -> RunConfig {
        let mut config = RunConfig::default();
        config.pass_limit = Some(1);
        config.power_save = PowerSave::Off;
        config.test_enabled = [false; NUM_TEST_PATTERNS];
        for &test in tests {
            config.test_enabled[test] = true;
        }
        config
    }

    #[test]
    fn load_addresses_prefer_the_current_image_location() {
        let pm_map = PhysMemMap::new(&[PmRange { start: 0, end: 0x500 }]).unwrap();
        let program = ProgramImage { base: 0x2000, size: 0x20000 };

        let (low, high) = Engine::<SimSystem>::pick_load_addresses(&pm_map, &program).unwrap();
        assert_eq!(low, 0x2000);
        assert_eq!(high, LOW_LOAD_LIMIT);
    }

    #[test]
    fn too_small_memory_cannot_host_the_high_image() {
        // One megabyte of RAM leaves nowhere above 4 MiB to relocate to.
        let pm_map = PhysMemMap::new(&[PmRange { start: 0, end: 0x100 }]).unwrap();
        let program = ProgramImage { base: 0x2000, size: 0x20000 };

        let err = Engine::<SimSystem>::pick_load_addresses(&pm_map, &program).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientLoadSpace { .. }));
    }

    /// A complete two-core run over a small simulated machine: dummy
    /// calibration, one real pass of a test mix covering relocation,
    /// multi-stage tests and parallel chunked tests, ending cleanly.
    #[test]
    fn full_run_with_relocations_completes_cleanly() {
        const CPUS: usize = 2;

        let bench = TestBench::new(0x500);
        let engine = run_engine(&bench, CPUS, run_config(&[1, 2, 3, 7, 10]));
        let relocations = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for cpu in 0..CPUS {
                let engine = &engine;
                let relocations = &relocations;
                scope.spawn(move || {
                    sim_set_cpu(cpu);
                    loop {
                        match engine.run(cpu) {
                            RunExit::NeedsRelocate(site) => {
                                if cpu == 0 {
                                    // Copying the image must leave the
                                    // fault record and run counters alone.
                                    let before = (
                                        engine.reporter.error_count(),
                                        engine.reporter.fault_stats().bad_bits,
                                        engine.state.pass_num(),
                                        engine.state.test_num(),
                                        engine.state.window_num(),
                                    );
                                    engine.set_load_site(site);
                                    let after = (
                                        engine.reporter.error_count(),
                                        engine.reporter.fault_stats().bad_bits,
                                        engine.state.pass_num(),
                                        engine.state.test_num(),
                                        engine.state.window_num(),
                                    );
                                    assert_eq!(before, after);
                                    relocations.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            RunExit::Complete => break,
                        }
                    }
                });
            }
        });

        assert_eq!(engine.reporter.error_count(), 0);
        // Tests 1 and 3 and 7 swing between the load sites; test 1 does it
        // once per elected master.
        assert_eq!(relocations.load(Ordering::Relaxed), 8);
        // The bit-fade stages slept once each, at first-pass length.
        assert_eq!(bench.sleep_count(), 160);
        // A clean pass raises the PASS banner.
        assert_eq!(bench.ui().big_statuses(), vec![true]);
    }

    #[test]
    fn restart_request_rewinds_to_a_fresh_dummy_pass() {
        let bench = TestBench::new(0x500);
        let engine = run_engine(&bench, 1, run_config(&[3]));

        // Ask for a restart mid-run; the driver must go back to
        // calibration and still complete the configured single pass.
        bench.ui().push_event(crate::ui::UiEvent::Restart);

        sim_set_cpu(0);
        loop {
            match engine.run(0) {
                RunExit::NeedsRelocate(site) => engine.set_load_site(site),
                RunExit::Complete => break,
            }
        }

        assert_eq!(engine.reporter.error_count(), 0);
    }
}

