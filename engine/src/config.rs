//! The run configuration shared with the external menu.
//!
//! The engine only reads this; the menu writes it and then raises
//! [`crate::ui::UiEvent::Restart`] so the driver picks the changes up at a
//! clean boundary.

use crate::patterns::NUM_TEST_PATTERNS;
use crate::system::MAX_CPUS;
use crate::testword::PAGE_SHIFT;

/// Selects how miscompares are condensed and displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    None,
    Summary,
    Address,
    BadRam,
    MemMap,
    Pages,
}

impl ErrorMode {
    /// True for the modes backed by the address-pattern list.
    pub fn uses_patterns(self) -> bool {
        matches!(self, ErrorMode::BadRam | ErrorMode::MemMap | ErrorMode::Pages)
    }
}

/// How the enabled cores cooperate on a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// All enabled cores run parallel-capable tests together.
    Parallel,
    /// One core at a time runs the whole test; the master advances between
    /// tests.
    Sequential,
    /// Round-robin: the master advances by one core per test invocation.
    One,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerSave {
    Off,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuState {
    Disabled,
    #[default]
    Enabled,
    Running,
}

#[derive(Clone)]
pub struct RunConfig {
    pub error_mode: ErrorMode,
    pub cpu_mode: CpuMode,
    pub power_save: PowerSave,

    /// Inclusive lower / exclusive upper physical page limits for testing.
    pub pm_limit_lower: usize,
    pub pm_limit_upper: usize,

    pub cpu_state: [CpuState; MAX_CPUS],
    pub exclude_ecores: bool,
    pub enable_smt: bool,
    pub smp_enabled: bool,

    /// Per-test enable overrides for the fixed catalog.
    pub test_enabled: [bool; NUM_TEST_PATTERNS],

    pub enable_big_status: bool,
    pub enable_temperature: bool,
    pub enable_trace: bool,
    pub enable_tty: bool,
    pub enable_ecc_polling: bool,
    pub enable_nontemporal: bool,
    pub pause_at_start: bool,

    /// Stop after this many completed passes. None runs forever, which is
    /// the interactive default.
    pub pass_limit: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut test_enabled = [false; NUM_TEST_PATTERNS];
        for (enabled, pattern) in test_enabled.iter_mut().zip(crate::patterns::TEST_LIST.iter()) {
            *enabled = pattern.enabled;
        }

        Self {
            error_mode: ErrorMode::Summary,
            cpu_mode: CpuMode::Parallel,
            power_save: PowerSave::Low,
            pm_limit_lower: 0,
            pm_limit_upper: usize::MAX >> PAGE_SHIFT,
            cpu_state: [CpuState::Enabled; MAX_CPUS],
            exclude_ecores: false,
            enable_smt: true,
            smp_enabled: true,
            test_enabled,
            enable_big_status: true,
            enable_temperature: false,
            enable_trace: false,
            enable_tty: false,
            enable_ecc_polling: false,
            enable_nontemporal: true,
            pause_at_start: false,
            pass_limit: None,
        }
    }
}
