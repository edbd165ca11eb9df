//! Applies the selected error-reporting mode: updates the fault record,
//! bumps the counters, latches pass/fail and renders to the display.

pub mod badram;
pub mod pages;
pub mod stats;

use crate::config::ErrorMode;
use crate::patterns::NUM_TEST_PATTERNS;
use crate::system::EccStatus;
use crate::testword::{Testword, PAGE_SIZE, TESTWORD_DIGITS};
use crate::ui::Ui;
use alloc::format;
use badram::PatternList;
use core::sync::atomic::{AtomicU64, Ordering};
use pages::BadPageList;
use spin::Mutex;
use stats::FaultStats;

/// Uncorrectable errors saturate here. The value fits the error-count
/// display column.
pub const ERROR_LIMIT: u64 = 999_999_999_999;

/// Correctable ECC events saturate much earlier; their display column is
/// narrower. Deliberately different from ERROR_LIMIT.
const CECC_LIMIT: u64 = 999_999;

/// Errors at these addresses are skipped: some BIOSes use this scratch
/// area for USB legacy keyboard support, so writes there are overwritten
/// behind our back and the odds of masking a real fault are very low.
const USB_WORKAROUND_ADDRS: [usize; 2] = [0x410, 0x4e0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Addr,
    Data,
    Parity,
    Cecc,
}

/// Everything the reporter needs to know about the current run state.
/// Built by the engine at each entry point.
pub struct ReportCtx<'a> {
    pub ui: &'a dyn Ui,
    pub mode: ErrorMode,
    pub pass_num: usize,
    pub test_num: usize,
    pub cpu: usize,
    pub big_status: bool,
}

struct ReportState {
    stats: FaultStats,
    patterns: PatternList,
    pages: BadPageList,
    last_mode: Option<ErrorMode>,
}

pub struct Reporter {
    state: Mutex<ReportState>,
    error_count: AtomicU64,
    error_count_cecc: AtomicU64,
    /// The event count carried by the ECC status being reported, staged
    /// here by ecc_error for the counting step under the report lock.
    pending_cecc: AtomicU64,
    test_errors: [AtomicU64; NUM_TEST_PATTERNS],
}

impl Reporter {
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            state: Mutex::new(ReportState {
                stats: FaultStats::new(),
                patterns: PatternList::new(),
                pages: BadPageList::new(),
                last_mode: None,
            }),
            error_count: ZERO,
            error_count_cecc: ZERO,
            pending_cecc: ZERO,
            test_errors: [ZERO; NUM_TEST_PATTERNS],
        }
    }

    /// Clears the fault record and all counters. Called at the start of
    /// each run.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.stats.reset();
        state.patterns.reset();
        state.pages.reset();
        state.last_mode = None;

        self.error_count.store(0, Ordering::Relaxed);
        self.error_count_cecc.store(0, Ordering::Relaxed);
        self.pending_cecc.store(0, Ordering::Relaxed);
        for counter in &self.test_errors {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn cecc_count(&self) -> u64 {
        self.error_count_cecc.load(Ordering::Relaxed)
    }

    pub fn test_error_count(&self, test: usize) -> u64 {
        self.test_errors[test].load(Ordering::Relaxed)
    }

    /// A snapshot of the per-run statistics.
    pub fn fault_stats(&self) -> FaultStats {
        self.state.lock().stats
    }

    pub fn badram_args(&self) -> alloc::string::String {
        self.state.lock().patterns.badram_args()
    }

    pub fn memmap_args(&self) -> alloc::string::String {
        self.state.lock().patterns.memmap_args()
    }

    pub fn pages_args(&self) -> alloc::string::String {
        self.state.lock().patterns.pages_args()
    }

    /// The sorted bad-page list, rendered for the OS block-out surface.
    pub fn bad_pages_args(&self) -> alloc::string::String {
        self.state.lock().pages.args()
    }

    #[cfg(test)]
    pub(crate) fn pattern_count(&self) -> usize {
        self.state.lock().patterns.patterns().len()
    }

    /// An address-decoding fault: writing through addr2 disturbed the
    /// value previously written through addr1.
    pub fn addr_error(
        &self,
        ctx: &ReportCtx,
        page: usize,
        offset: usize,
        addr: usize,
        good: Testword,
        bad: Testword,
    ) {
        self.common_err(ctx, ErrorKind::Addr, page, offset, addr, good, bad, false);
    }

    /// A data miscompare at a single testword.
    pub fn data_error(
        &self,
        ctx: &ReportCtx,
        page: usize,
        offset: usize,
        addr: usize,
        good: Testword,
        bad: Testword,
        use_for_badram: bool,
    ) {
        if USB_WORKAROUND_ADDRS.contains(&addr) {
            return;
        }
        self.common_err(ctx, ErrorKind::Data, page, offset, addr, good, bad, use_for_badram);
    }

    /// An error reported by the memory controller. Correctable events are
    /// counted separately and do not fail the run.
    pub fn ecc_error(&self, ctx: &ReportCtx, status: EccStatus) {
        let page = status.addr >> crate::testword::PAGE_SHIFT;
        let offset = status.addr & (PAGE_SIZE - 1);
        let kind = if status.correctable { ErrorKind::Cecc } else { ErrorKind::Data };
        self.pending_cecc.store(status.count, Ordering::Relaxed);
        self.common_err(ctx, kind, page, offset, status.addr, 0, 0, false);
    }

    /// A parity error. The faulting address is unknown; the caller passes
    /// the last address the affected core published.
    pub fn parity_error(&self, ctx: &ReportCtx, last_addr: usize) {
        let page = last_addr >> crate::testword::PAGE_SHIFT;
        let offset = last_addr & (PAGE_SIZE - 1);
        self.common_err(ctx, ErrorKind::Parity, page, offset, last_addr, 0, 0, false);
    }

    #[allow(clippy::too_many_arguments)]
    fn common_err(
        &self,
        ctx: &ReportCtx,
        kind: ErrorKind,
        page: usize,
        offset: usize,
        addr: usize,
        good: Testword,
        bad: Testword,
        use_for_badram: bool,
    ) {
        let mut state = self.state.lock();

        ctx.ui.restore_big_status();

        let first_error = self.error_count() == 0 && self.cecc_count() == 0;
        let new_header = first_error || state.last_mode != Some(ctx.mode);
        if new_header {
            ctx.ui.clear_message_area();
            state.patterns.reset();
            state.pages.reset();
        }
        state.last_mode = Some(ctx.mode);

        let xor = good ^ bad;
        let below_limit = self.error_count() < ERROR_LIMIT;

        let new_stats = match kind {
            ErrorKind::Addr => state.stats.update(page, offset, addr, 0, below_limit),
            ErrorKind::Data => state.stats.update(page, offset, addr, xor, below_limit),
            _ => false,
        };

        let mut new_badram = false;
        if ctx.mode.uses_patterns() && use_for_badram {
            new_badram = state.patterns.insert(ctx.mode, page, offset);
            state.pages.insert(page);
        }

        // Bump the counters, saturating rather than wrapping.
        if kind == ErrorKind::Cecc {
            let count = self.pending_cecc.load(Ordering::Relaxed);
            if self.cecc_count() + count < CECC_LIMIT {
                self.error_count_cecc.fetch_add(count, Ordering::Relaxed);
            }
        } else {
            if below_limit {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            }
            self.test_errors[ctx.test_num].fetch_add(1, Ordering::Relaxed);
        }

        match ctx.mode {
            ErrorMode::Summary => {
                if kind != ErrorKind::Parity {
                    if new_header {
                        self.draw_summary_header(ctx);
                    }
                    if new_stats {
                        self.draw_summary_stats(ctx, &state.stats);
                    }
                }
            }

            ErrorMode::Address => {
                // Skip duplicates: consecutive identical (addr, xor)
                // reports collapse into one line.
                let duplicate =
                    !new_header && addr == state.stats.last_addr && xor == state.stats.last_xor;
                if !duplicate {
                    if new_header {
                        self.draw_address_header(ctx);
                    }
                    self.draw_address_line(ctx, kind, page, offset, good, bad, xor);
                }
            }

            ErrorMode::BadRam | ErrorMode::MemMap | ErrorMode::Pages => {
                if new_badram {
                    self.draw_pattern_list(ctx, &state);
                }
            }

            ErrorMode::None => {}
        }

        if kind != ErrorKind::Parity && kind != ErrorKind::Cecc {
            state.stats.last_addr = addr;
            state.stats.last_xor = xor;
        }
    }

    /// Re-renders after the operator changed the error mode mid-run, and
    /// refreshes the counters, the status line and the FAIL banner. Called
    /// by the master between tests.
    pub fn refresh(&self, ctx: &ReportCtx) {
        if self.error_count() == 0 && self.cecc_count() == 0 {
            return;
        }

        {
            let mut state = self.state.lock();
            if state.last_mode != Some(ctx.mode) {
                ctx.ui.clear_message_area();
                state.patterns.reset();
                state.pages.reset();
                state.last_mode = Some(ctx.mode);
                if ctx.mode == ErrorMode::Summary {
                    self.draw_summary_header(ctx);
                    self.draw_summary_stats(ctx, &state.stats);
                }
            } else if ctx.mode == ErrorMode::Summary {
                let errors = self.test_error_count(ctx.test_num);
                if errors > 0 {
                    ctx.ui.pinned_message(
                        1 + ctx.test_num,
                        69,
                        &format!("{:10}", errors.min(ERROR_LIMIT)),
                    );
                }
            }
        }

        ctx.ui.error_counts(self.error_count(), self.cecc_count());

        // Only fail the run on uncorrected errors.
        if self.error_count() > 0 {
            ctx.ui.status("Failed!");
            if self.error_count() == 1 && ctx.big_status {
                ctx.ui.big_status(false);
            }
        }
    }

    fn draw_summary_header(&self, ctx: &ReportCtx) {
        ctx.ui.pinned_message(0, 1, "  Lowest Error Address:");
        ctx.ui.pinned_message(1, 1, " Highest Error Address:");
        ctx.ui.pinned_message(2, 1, "    Bits in Error Mask:");
        ctx.ui.pinned_message(3, 1, " Bits in Error - Total:");
        ctx.ui.pinned_message(4, 1, " Max Contiguous Errors:");

        ctx.ui.pinned_message(0, 64, "Test  Errors");
        for i in 0..NUM_TEST_PATTERNS {
            ctx.ui.pinned_message(1 + i, 65, &format!("{:2}:", i));
        }
    }

    fn draw_summary_stats(&self, ctx: &ReportCtx, stats: &FaultStats) {
        ctx.ui.pinned_message(
            0,
            25,
            &format!(
                "{:09x}{:03x} ({} MB)",
                stats.min_addr.page,
                stats.min_addr.offset,
                stats.min_addr.page >> 8
            ),
        );
        ctx.ui.pinned_message(
            1,
            25,
            &format!(
                "{:09x}{:03x} ({} MB)",
                stats.max_addr.page,
                stats.max_addr.offset,
                stats.max_addr.page >> 8
            ),
        );
        ctx.ui.pinned_message(2, 25, &format!("{:0width$x}", stats.bad_bits, width = TESTWORD_DIGITS));

        let error_count = self.error_count().max(1);
        ctx.ui.pinned_message(
            3,
            25,
            &format!(
                " {:2} Min: {:2} Max: {:2} Avg: {:2}",
                stats.bad_bits.count_ones(),
                stats.min_bits,
                stats.max_bits,
                stats.total_bits / error_count
            ),
        );
        ctx.ui.pinned_message(4, 25, &format!("{}", stats.max_run));

        for i in 0..NUM_TEST_PATTERNS {
            let errors = self.test_error_count(i);
            if errors > 0 {
                ctx.ui.pinned_message(1 + i, 69, &format!("{:10}", errors));
            }
        }

        ctx.ui.error_counts(self.error_count(), self.cecc_count());
    }

    fn draw_address_header(&self, ctx: &ReportCtx) {
        cfg_if::cfg_if! {
            if #[cfg(target_pointer_width = "64")] {
                ctx.ui.pinned_message(0, 0, "pCPU  Pass  Test  Failing Address        Expected          Found           ");
                ctx.ui.pinned_message(1, 0, "----  ----  ----  ---------------------  ----------------  ----------------");
            } else {
                ctx.ui.pinned_message(0, 0, "pCPU  Pass  Test  Failing Address        Expected  Found     Err Bits");
                ctx.ui.pinned_message(1, 0, "----  ----  ----  ---------------------  --------  --------  --------");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_address_line(
        &self,
        ctx: &ReportCtx,
        kind: ErrorKind,
        page: usize,
        offset: usize,
        good: Testword,
        bad: Testword,
        xor: Testword,
    ) {
        ctx.ui.scroll();

        ctx.ui.scrolled_message(
            0,
            &format!(
                " {:2}   {:4}   {:2}   {:09x}{:03x} ({} MB)",
                ctx.cpu, ctx.pass_num, ctx.test_num, page, offset, page >> 8
            ),
        );

        match kind {
            ErrorKind::Parity => {
                ctx.ui.scrolled_message(41, "Parity error detected near this address");
            }
            ErrorKind::Cecc => {
                ctx.ui.scrolled_message(41, "Correctable ECC Error");
            }
            _ => {
                cfg_if::cfg_if! {
                    if #[cfg(target_pointer_width = "64")] {
                        let _ = xor;
                        ctx.ui.scrolled_message(41, &format!("{:016x}  {:016x}", good, bad));
                    } else {
                        ctx.ui.scrolled_message(
                            41,
                            &format!("{:08x}  {:08x}  {:08x}  {}", good, bad, xor, self.error_count()),
                        );
                    }
                }
            }
        }

        ctx.ui.error_counts(self.error_count(), self.cecc_count());
    }

    /// Redraws the compact pattern list after an insert changed it.
    fn draw_pattern_list(&self, ctx: &ReportCtx, state: &ReportState) {
        ctx.ui.clear_message_area();

        let (title, text) = match ctx.mode {
            ErrorMode::BadRam => {
                ("BadRAM Patterns (excludes test 0 and test 7)", state.patterns.badram_args())
            }
            ErrorMode::MemMap => {
                ("Linux memmap (excludes test 0 and test 7)", state.patterns.memmap_args())
            }
            _ => ("Bad pages (excludes test 0 and test 7)", state.patterns.pages_args()),
        };

        ctx.ui.pinned_message(0, 0, title);
        ctx.ui.pinned_message(1, 0, &"-".repeat(title.len()));

        // Wrap the single logical line into screen-width pieces.
        const WIDTH: usize = 80;
        let mut rest = text.as_str();
        while !rest.is_empty() {
            let take = rest.len().min(WIDTH);
            ctx.ui.scroll();
            ctx.ui.scrolled_message(0, &rest[..take]);
            rest = &rest[take..];
        }

        ctx.ui.error_counts(self.error_count(), self.cecc_count());
    }
}
