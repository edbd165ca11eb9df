//! The fixed catalog of memory-stressing algorithms and the dispatcher
//! that runs them.

use crate::config::{CpuMode, PowerSave};
use crate::driver::Engine;
use crate::system::System;
use crate::testword::{prsg, Testword, TESTWORD_WIDTH};

mod addr_walk;
mod bit_fade;
mod block_move;
mod modulo_n;
mod mov_inv_fixed;
mod mov_inv_random;
mod mov_inv_walk;
mod own_addr;
mod row_hammer;

pub const NUM_TEST_PATTERNS: usize = 12;

/// The block size (in testwords) processed between updates of the progress
/// bars and spinners. This also bounds how quickly a worker notices the
/// bail flag and how stale its published parity-error address can be.
pub const SPIN_SIZE: usize = 1 << 27;

pub const MODULO_N: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct TestPattern {
    pub enabled: bool,
    /// The test's natural mode. A sequential test runs one core at a time
    /// even when the global CPU mode is parallel.
    pub cpu_mode: CpuMode,
    pub stages: usize,
    pub iterations: usize,
    pub description: &'static str,
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        const MOV_INV_WALK_DESC: &str = "[Moving inversions, 64 bit pattern]    ";
    } else {
        const MOV_INV_WALK_DESC: &str = "[Moving inversions, 32 bit pattern]    ";
    }
}

#[rustfmt::skip]
pub const TEST_LIST: [TestPattern; NUM_TEST_PATTERNS] = [
    TestPattern { enabled: true,  cpu_mode: CpuMode::Sequential, stages: 1, iterations:   6, description: "[Address test, walking ones, no cache] " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Sequential, stages: 1, iterations:   6, description: "[Address test, own address in window]  " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Sequential, stages: 2, iterations:   6, description: "[Address test, own address + window]   " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:   6, description: "[Moving inversions, 1s & 0s]           " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:   3, description: "[Moving inversions, 8 bit pattern]     " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:  30, description: "[Moving inversions, random pattern]    " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:   3, description: MOV_INV_WALK_DESC },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:  81, description: "[Block move]                           " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:  48, description: "[Random number sequence]               " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::Parallel,   stages: 1, iterations:   6, description: "[Modulo 20, random pattern]            " },
    TestPattern { enabled: true,  cpu_mode: CpuMode::One,        stages: 6, iterations: 240, description: "[Bit fade test, 2 patterns]            " },
    TestPattern { enabled: false, cpu_mode: CpuMode::Parallel,   stages: 1, iterations:   2, description: "[Row hammer test]                      " },
];

impl<S: System> Engine<S> {
    /// Runs one invocation of the selected test over the current VM map.
    /// A worker of None is the dummy run: same control flow, no memory
    /// traffic, honest tick accounting.
    pub(crate) fn run_test(
        &self,
        worker: Option<usize>,
        test: usize,
        stage: usize,
        iterations: usize,
    ) -> usize {
        if self.is_master(worker) {
            {
                let mut vm_map = self.vm_map.write();
                if self.state.window_num() == 0 && !vm_map.entries.is_empty() {
                    // The first window starts at the configured lower limit,
                    // raised above the BIOS keyboard scratch area.
                    let floor = 0x500 as *mut Testword;
                    if vm_map.entries[0].start < floor {
                        vm_map.entries[0].start = floor;
                    }
                }
            }

            let vm_map = self.vm_map.read();
            if let (Some(first), Some(last)) = (vm_map.entries.first(), vm_map.entries.last()) {
                let pb = first.pm_base_addr as u64;
                let pe = self.sys.page_of(last.end) as u64 + 1;
                self.ui.test_addresses(pb << 2, pe << 2, (self.state.num_pages_to_test() << 2) as u64);
            }
        }
        self.test_barrier(worker);

        let mut ticks = 0;

        match test {
            // Address test, walking ones.
            0 => {
                if worker.is_some() {
                    self.sys.cache_off();
                }
                ticks += self.test_addr_walk(worker);
                if worker.is_some() {
                    self.sys.cache_on();
                }
            }

            // Address test, own address in window.
            1 => {
                ticks += self.test_own_addr1(worker);
            }

            // Address test, own address + window.
            2 => {
                ticks += self.test_own_addr2(worker, stage);
            }

            // Moving inversions, all ones and zeros.
            3 => {
                let pattern1: Testword = 0;
                let pattern2 = !pattern1;

                self.test_barrier(worker);
                ticks += self.test_mov_inv_fixed(worker, iterations, pattern1, pattern2);
                if self.state.bail() {
                    return ticks;
                }

                self.test_barrier(worker);
                ticks += self.test_mov_inv_fixed(worker, iterations, pattern2, pattern1);
            }

            // Moving inversions, 8 bit walking ones and zeros.
            4 => {
                let mut pattern1 = {
                    let mut p: Testword = 0;
                    for i in 0..(TESTWORD_WIDTH / 8) {
                        p |= 0x80 << (8 * i);
                    }
                    p
                };
                for _ in 0..8 {
                    let pattern2 = !pattern1;

                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_fixed(worker, iterations, pattern1, pattern2);
                    if self.state.bail() {
                        return ticks;
                    }

                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_fixed(worker, iterations, pattern2, pattern1);
                    if self.state.bail() {
                        return ticks;
                    }

                    pattern1 >>= 1;
                }
            }

            // Moving inversions, fixed random pattern.
            5 => {
                let mut prsg_state = self.random_seed(0x1234_5678);

                for _ in 0..iterations {
                    prsg_state = prsg(prsg_state);

                    let pattern1 = prsg_state;
                    let pattern2 = !pattern1;

                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_fixed(worker, 2, pattern1, pattern2);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }

            // Moving inversions, 32/64 bit shifting pattern.
            6 => {
                for offset in 0..TESTWORD_WIDTH as usize {
                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_walk1(worker, iterations, offset, false);
                    if self.state.bail() {
                        return ticks;
                    }

                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_walk1(worker, iterations, offset, true);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }

            // Block move.
            7 => {
                ticks += self.test_block_move(worker, iterations);
            }

            // Moving inversions, fully random patterns.
            8 => {
                for _ in 0..iterations {
                    self.test_barrier(worker);
                    ticks += self.test_mov_inv_random(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }

            // Modulo 20 check, fixed random pattern.
            9 => {
                let mut prsg_state = self.random_seed(0x8765_4321);

                for _ in 0..iterations {
                    for offset in 0..MODULO_N {
                        prsg_state = prsg(prsg_state);

                        let pattern1 = prsg_state;
                        let pattern2 = !pattern1;

                        self.test_barrier(worker);
                        ticks += self.test_modulo_n(worker, 2, pattern1, pattern2, MODULO_N, offset);
                        if self.state.bail() {
                            return ticks;
                        }

                        self.test_barrier(worker);
                        ticks += self.test_modulo_n(worker, 2, pattern2, pattern1, MODULO_N, offset);
                        if self.state.bail() {
                            return ticks;
                        }
                    }
                }
            }

            // Bit fade test.
            10 => {
                ticks += self.test_bit_fade(worker, stage, iterations);
            }

            // Row hammer test.
            11 => {
                ticks += self.test_row_hammer(worker, iterations);
            }

            _ => {}
        }

        ticks
    }

    /// Seeds the pseudo-random tests from the timestamp counter, falling
    /// back to the pass number on platforms without one.
    fn random_seed(&self, multiplier: Testword) -> Testword {
        let base = match self.sys.timestamp() {
            0 => 1 + self.state.pass_num() as u64,
            tsc => tsc,
        };
        (base as Testword).wrapping_mul(multiplier)
    }

    /// The rendezvous used inside tests, spinning or halting according to
    /// the power-save level. Dummy runs skip barriers entirely.
    pub(crate) fn test_barrier(&self, worker: Option<usize>) {
        let Some(my_cpu) = worker else { return };

        #[cfg(feature = "trace-barriers")]
        log::trace!("cpu {}: run barrier wait", my_cpu);

        if self.config.read().power_save < PowerSave::High {
            self.run_barrier.spin_wait(&self.sys);
        } else {
            self.run_barrier.halt_wait(&self.sys, my_cpu);
        }
    }

    /// Flushes the CPU caches between the fill and check phases of a test,
    /// synchronising the workers before and after so the flush covers all
    /// freshly written data.
    pub(crate) fn flush_caches(&self, worker: Option<usize>) {
        if worker.is_none() {
            return;
        }
        self.test_barrier(worker);
        if self.is_master(worker) {
            self.sys.cache_flush();
        }
        self.test_barrier(worker);
    }

    /// Burns the given number of ticks without touching memory, so a core
    /// skipping an undersized chunk stays in lockstep with the others.
    /// Returns the ticks consumed (fewer if the bail flag was raised).
    pub(crate) fn skip_range(&self, worker: Option<usize>, num_ticks: usize) -> usize {
        let mut ticks = 0;
        if worker.is_some() {
            for _ in 0..num_ticks {
                ticks += 1;
                self.tick(worker);
                if self.state.bail() {
                    break;
                }
            }
        } else {
            ticks = num_ticks;
        }
        ticks
    }

    /// Publishes the address a worker is about to touch, for parity-error
    /// attribution.
    pub(crate) fn publish_addr(&self, worker: Option<usize>, p: *const Testword) {
        if let Some(w) = worker {
            self.per_cpu[w].test_addr.store(p as usize, core::sync::atomic::Ordering::Relaxed);
        }
    }

    /// The chunk of the segment owned by this worker. The dummy run walks
    /// the first worker's chunk.
    pub(crate) fn chunk_for(
        &self,
        seg: &crate::window::VmMapEntry,
        worker: Option<usize>,
        chunk_align: usize,
    ) -> (*mut Testword, *mut Testword) {
        let idx = worker
            .map(|w| self.chunk_index[w].load(core::sync::atomic::Ordering::Relaxed) as usize)
            .unwrap_or(0);
        crate::chunk::calculate_chunk(seg, idx, self.state.num_active_cpus(), chunk_align)
    }
}

/// One SPIN_SIZE-bounded block of a chunk walk: the first word pointer and
/// the number of words in the block.
pub(crate) struct SpinBlock {
    pub start: *mut Testword,
    pub words: usize,
}

/// Splits the inclusive word range [start, end] into SPIN_SIZE blocks.
/// Iterating in reverse yields the blocks top-down for the backward test
/// phases.
pub(crate) fn spin_blocks(start: *mut Testword, end: *mut Testword) -> SpinBlocks {
    let total = if (end as usize) < (start as usize) {
        0
    } else {
        (end as usize - start as usize) / core::mem::size_of::<Testword>() + 1
    };
    let blocks = total.div_ceil(SPIN_SIZE);
    SpinBlocks { start, total, front: 0, back: blocks }
}

pub(crate) struct SpinBlocks {
    start: *mut Testword,
    total: usize,
    front: usize,
    back: usize,
}

impl SpinBlocks {
    fn block(&self, index: usize) -> SpinBlock {
        let done = index * SPIN_SIZE;
        SpinBlock {
            start: unsafe { self.start.add(done) },
            words: (self.total - done).min(SPIN_SIZE),
        }
    }
}

impl Iterator for SpinBlocks {
    type Item = SpinBlock;

    fn next(&mut self) -> Option<SpinBlock> {
        if self.front == self.back {
            return None;
        }
        let block = self.block(self.front);
        self.front += 1;
        Some(block)
    }
}

impl DoubleEndedIterator for SpinBlocks {
    fn next_back(&mut self) -> Option<SpinBlock> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        Some(self.block(self.back))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_matches_the_documented_shape() {
        assert_eq!(TEST_LIST.len(), NUM_TEST_PATTERNS);
        // The two multi-stage tests.
        assert_eq!(TEST_LIST[2].stages, 2);
        assert_eq!(TEST_LIST[10].stages, 6);
        // Address-walk and own-address run sequential-per-core.
        for test in [0, 1, 2] {
            assert_eq!(TEST_LIST[test].cpu_mode, CpuMode::Sequential);
        }
    }

    #[test]
    fn spin_blocks_cover_the_range_once() {
        let base = 0x1000 as *mut Testword;
        let end = unsafe { base.add(99) };
        let blocks: Vec<_> = spin_blocks(base, end).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].words, 100);

        // An inverted range is empty.
        assert_eq!(spin_blocks(end, base).count(), 0);
    }
}
