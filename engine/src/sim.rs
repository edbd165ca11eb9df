//! A simulated system and display for the unit tests: owned memory
//! buffers standing in for physical RAM, optional fault injection, and
//! counters for the side effects the tests assert on.

#![cfg(test)]

use crate::config::{CpuState, ErrorMode, RunConfig};
use crate::driver::{Engine, ProgramImage};
use crate::pmem::{PhysMemMap, PmRange};
use crate::system::System;
use crate::testword::{Testword, PAGE_SIZE};
use crate::ui::{Ui, UiEvent};
use crate::window::VmMapEntry;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const WORD: usize = std::mem::size_of::<Testword>();

thread_local! {
    static SIM_CPU: Cell<usize> = const { Cell::new(0) };
}

/// Assigns this thread's CPU number for [`System::current_cpu`].
pub fn sim_set_cpu(cpu: usize) {
    SIM_CPU.with(|c| c.set(cpu));
}

struct SimShared {
    base: usize,
    words: usize,
    read_xor: Option<(usize, Testword)>,
    write_drop: Option<usize>,
    vector_words: usize,

    sleeps: AtomicUsize,
    vector_fills: AtomicUsize,
    timestamp: AtomicU64,
}

/// A simulated memory model. Reads and writes go to the test bench's
/// buffer, with an optional stuck-bit XOR applied on read and an optional
/// dropped-write address.
#[derive(Clone)]
pub struct SimSystem {
    shared: Arc<SimShared>,
}

impl SimSystem {
    /// A standalone system over its own leaked buffer, for tests that do
    /// not need the full bench (barriers, map arithmetic).
    pub fn new(pages: usize) -> Self {
        let bench = TestBench::new(pages.max(1));
        let sys = bench.sys();
        std::mem::forget(bench);
        sys
    }
}

impl System for SimSystem {
    unsafe fn read_word(&self, p: *const Testword) -> Testword {
        let mut value = core::ptr::read_volatile(p);
        if let Some((addr, xor)) = self.shared.read_xor {
            if p as usize == self.shared.base + addr {
                value ^= xor;
            }
        }
        value
    }

    unsafe fn write_word(&self, p: *mut Testword, v: Testword) {
        if let Some(addr) = self.shared.write_drop {
            if p as usize == self.shared.base + addr {
                return;
            }
        }
        core::ptr::write_volatile(p, v);
    }

    fn vector_words(&self) -> usize {
        self.shared.vector_words
    }

    unsafe fn fill_vector(&self, p: *mut Testword, v: Testword, nt: bool) {
        self.shared.vector_fills.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.vector_words() {
            if nt {
                self.write_word_nt(p.add(i), v);
            } else {
                self.write_word(p.add(i), v);
            }
        }
    }

    unsafe fn read_vector(&self, p: *const Testword, out: &mut [Testword]) {
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.read_word(p.add(i));
        }
    }

    fn map_window(&self, _start_page: usize) -> bool {
        true
    }

    fn first_word_mapping(&self, page: usize) -> *mut Testword {
        (self.shared.base + page * PAGE_SIZE) as *mut Testword
    }

    fn last_word_mapping(&self, page: usize) -> *mut Testword {
        (self.shared.base + page * PAGE_SIZE + PAGE_SIZE - WORD) as *mut Testword
    }

    fn page_of(&self, addr: *const Testword) -> usize {
        (addr as usize - self.shared.base) / PAGE_SIZE
    }

    fn current_cpu(&self) -> usize {
        SIM_CPU.with(|c| c.get())
    }

    fn timestamp(&self) -> u64 {
        self.shared.timestamp.fetch_add(1, Ordering::Relaxed)
    }

    fn sleep_secs(&self, secs: usize) {
        self.shared.sleeps.fetch_add(secs, Ordering::Relaxed);
    }

    fn reboot(&self) -> ! {
        panic!("simulated system asked to reboot");
    }
}

#[derive(Default)]
struct SimUiInner {
    scrolled: Vec<(usize, String)>,
    big_status: Vec<bool>,
    events: VecDeque<UiEvent>,
}

/// A recording display surface.
pub struct SimUi {
    inner: Mutex<SimUiInner>,
    scrolls: AtomicUsize,
    check_inputs: AtomicUsize,
}

impl SimUi {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimUiInner::default()),
            scrolls: AtomicUsize::new(0),
            check_inputs: AtomicUsize::new(0),
        }
    }

    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::Relaxed)
    }

    pub fn check_input_count(&self) -> usize {
        self.check_inputs.load(Ordering::Relaxed)
    }

    pub fn big_statuses(&self) -> Vec<bool> {
        self.inner.lock().unwrap().big_status.clone()
    }

    pub fn push_event(&self, event: UiEvent) {
        self.inner.lock().unwrap().events.push_back(event);
    }
}

impl Ui for SimUi {
    fn scrolled_message(&self, col: usize, text: &str) -> usize {
        self.inner.lock().unwrap().scrolled.push((col, text.to_string()));
        col + text.len()
    }

    fn scroll(&self) {
        self.scrolls.fetch_add(1, Ordering::Relaxed);
    }

    fn big_status(&self, pass: bool) {
        self.inner.lock().unwrap().big_status.push(pass);
    }

    fn check_input(&self) -> UiEvent {
        self.check_inputs.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().events.pop_front().unwrap_or(UiEvent::None)
    }
}

/// An owned slab of "physical" memory plus the injection knobs, shared by
/// a [`SimSystem`] handed to the engine under test.
pub struct TestBench {
    // Keeps the aligned allocation alive for the bench's lifetime.
    _buffer: Vec<Testword>,
    shared: Arc<SimShared>,
    ui: &'static SimUi,
    pages: usize,
    error_mode: ErrorMode,
}

impl TestBench {
    /// Allocates `pages` pages of zeroed memory, aligned to its own
    /// power-of-two size so address-line masks behave like they do on a
    /// naturally aligned physical window.
    pub fn new(pages: usize) -> Self {
        let bytes = pages * PAGE_SIZE;
        let align = bytes.next_power_of_two();
        let mut buffer = vec![0 as Testword; (bytes + align) / WORD];
        let raw = buffer.as_mut_ptr() as usize;
        let base = (raw + align - 1) & !(align - 1);

        let shared = Arc::new(SimShared {
            base,
            words: bytes / WORD,
            read_xor: None,
            write_drop: None,
            vector_words: 1,
            sleeps: AtomicUsize::new(0),
            vector_fills: AtomicUsize::new(0),
            timestamp: AtomicU64::new(1),
        });

        Self {
            _buffer: buffer,
            shared,
            ui: Box::leak(Box::new(SimUi::new())),
            pages,
            error_mode: ErrorMode::Summary,
        }
    }

    fn shared_mut(&mut self) -> &mut SimShared {
        Arc::get_mut(&mut self.shared).expect("bench must be configured before use")
    }

    /// Applies a stuck-bit model: reads at this byte offset return the
    /// stored value XORed with `xor`.
    pub fn with_read_xor(mut self, offset: usize, xor: Testword) -> Self {
        self.shared_mut().read_xor = Some((offset, xor));
        self
    }

    /// Drops every write to the word at this byte offset.
    pub fn with_write_drop(mut self, offset: usize) -> Self {
        self.shared_mut().write_drop = Some(offset);
        self
    }

    /// Limits the test segment to the first `words` words.
    pub fn with_words(mut self, words: usize) -> Self {
        self.shared_mut().words = words;
        self
    }

    /// Pretends the system supports `vw`-word vector stores.
    pub fn with_vector_words(mut self, vw: usize) -> Self {
        self.shared_mut().vector_words = vw;
        self
    }

    pub fn with_address_mode(mut self) -> Self {
        self.error_mode = ErrorMode::Address;
        self
    }

    pub fn sys(&self) -> SimSystem {
        SimSystem { shared: self.shared.clone() }
    }

    pub fn ui(&self) -> &'static SimUi {
        self.ui
    }

    pub fn words(&self) -> usize {
        self.shared.words
    }

    pub fn addr_of(&self, offset: usize) -> usize {
        self.shared.base + offset
    }

    pub fn base_ptr(&self) -> *mut Testword {
        self.shared.base as *mut Testword
    }

    pub fn end_ptr(&self) -> *mut Testword {
        (self.shared.base + (self.shared.words - 1) * WORD) as *mut Testword
    }

    pub fn word_at(&self, offset: usize) -> Testword {
        unsafe { core::ptr::read_volatile((self.shared.base + offset) as *const Testword) }
    }

    pub fn poke(&self, offset: usize, value: Testword) {
        unsafe { core::ptr::write_volatile((self.shared.base + offset) as *mut Testword, value) };
    }

    pub fn snapshot(&self) -> Vec<Testword> {
        (0..self.shared.words).map(|i| self.word_at(i * WORD)).collect()
    }

    pub fn sleep_count(&self) -> usize {
        self.shared.sleeps.load(Ordering::Relaxed)
    }

    pub fn vector_fills(&self) -> usize {
        self.shared.vector_fills.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> RunConfig {
        RunConfig { error_mode: self.error_mode, ..RunConfig::default() }
    }

    /// A physical map reaching past the high load site, so load-address
    /// selection has somewhere to put the alternate image.
    pub fn pm_map(&self) -> PhysMemMap {
        PhysMemMap::new(&[PmRange { start: 0, end: 0x500.max(self.pages) }]).unwrap()
    }

    pub fn program(&self) -> ProgramImage {
        ProgramImage { base: 0x2000, size: 0x20000 }
    }
}

/// Builds an engine wired to the bench with a single live worker and the
/// VM map already pointing at the bench's memory, so tests can invoke the
/// primitives directly.
pub fn test_engine(bench: &TestBench) -> Box<Engine<SimSystem>> {
    let engine = Engine::new(
        bench.sys(),
        bench.ui() as &'static dyn Ui,
        bench.config(),
        bench.pm_map(),
        1,
        bench.program(),
    )
    .unwrap();

    engine.prime_for_direct_tests(&[VmMapEntry {
        pm_base_addr: 0,
        start: bench.base_ptr(),
        end: bench.end_ptr(),
    }]);

    engine
}

/// Builds an engine for a full multi-core driver run over the bench.
pub fn run_engine(bench: &TestBench, cpus: usize, config: RunConfig) -> Box<Engine<SimSystem>> {
    let mut config = config;
    for state in config.cpu_state.iter_mut().skip(cpus) {
        *state = CpuState::Disabled;
    }
    Engine::new(
        bench.sys(),
        bench.ui() as &'static dyn Ui,
        config,
        bench.pm_map(),
        cpus,
        bench.program(),
    )
    .unwrap()
}
