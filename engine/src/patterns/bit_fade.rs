//! Test 10: bit fade (retention) test.
//!
//! Fill with all-zeros, wait, verify; then the same with all-ones. The
//! stages are driven by the pass driver so the whole memory map is filled
//! before the wait begins. A stage re-entered after a relocation must not
//! sleep again, so the wait happens exactly once per stage transition.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;
use core::sync::atomic::Ordering;

impl<S: System> Engine<S> {
    pub(crate) fn test_bit_fade(
        &self,
        worker: Option<usize>,
        stage: usize,
        sleep_secs: usize,
    ) -> usize {
        let all_zero: Testword = 0;
        let all_ones = !all_zero;

        let last_stage = self.state.bit_fade_last_stage.load(Ordering::Relaxed);
        let ticks = match stage {
            0 => self.fade_fill(worker, all_zero),
            1 if last_stage != 1 => self.fade_delay(worker, sleep_secs),
            2 => self.fade_check(worker, all_zero),
            3 => self.fade_fill(worker, all_ones),
            4 if last_stage != 4 => self.fade_delay(worker, sleep_secs),
            5 => self.fade_check(worker, all_ones),
            _ => 0,
        };
        self.state.bit_fade_last_stage.store(stage as isize, Ordering::Relaxed);

        ticks
    }

    fn fade_fill(&self, worker: Option<usize>, pattern: Testword) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_value(pattern);
        }

        let vm_map = self.vm_map.read();
        for seg in vm_map.entries.iter() {
            for block in spin_blocks(seg.start, seg.end) {
                ticks += 1;
                if worker.is_none() {
                    continue;
                }
                self.publish_addr(worker, block.start);
                for i in 0..block.words {
                    unsafe { self.sys.write_word(block.start.add(i), pattern) };
                }
                self.tick(worker);
                if self.state.bail() {
                    return ticks;
                }
            }
        }
        drop(vm_map);

        self.flush_caches(worker);

        ticks
    }

    fn fade_check(&self, worker: Option<usize>, pattern: Testword) -> usize {
        let mut ticks = 0;

        let vm_map = self.vm_map.read();
        for seg in vm_map.entries.iter() {
            for block in spin_blocks(seg.start, seg.end) {
                ticks += 1;
                if worker.is_none() {
                    continue;
                }
                self.publish_addr(worker, block.start);
                for i in 0..block.words {
                    unsafe {
                        let p = block.start.add(i);
                        let actual = self.sys.read_word(p);
                        if actual != pattern {
                            self.data_error(p, pattern, actual, true);
                        }
                    }
                }
                self.tick(worker);
                if self.state.bail() {
                    return ticks;
                }
            }
        }

        ticks
    }

    fn fade_delay(&self, worker: Option<usize>, sleep_secs: usize) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.stage_description("fading");
        }
        for _ in 0..sleep_secs {
            ticks += 1;
            if worker.is_none() {
                continue;
            }
            self.sys.sleep_secs(1);
            self.tick(worker);
            if self.state.bail() {
                return ticks;
            }
        }

        ticks
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn full_stage_sequence_round_trips() {
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        for stage in 0..6 {
            engine.test_bit_fade(Some(0), stage, 2);
        }
        assert_eq!(engine.reporter.error_count(), 0);
        assert_eq!(bench.sleep_count(), 4);
    }

    #[test]
    fn reentered_sleep_stage_sleeps_only_once() {
        // The pass driver re-enters a stage when a relocation interrupts
        // the window walk; the wait must not repeat.
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        engine.test_bit_fade(Some(0), 0, 3);
        engine.test_bit_fade(Some(0), 1, 3);
        engine.test_bit_fade(Some(0), 1, 3);
        assert_eq!(bench.sleep_count(), 3);
    }

    #[test]
    fn faded_bits_are_reported() {
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        engine.test_bit_fade(Some(0), 3, 0);
        bench.poke(0x40, !0 ^ 0x4);
        engine.test_bit_fade(Some(0), 5, 0);
        assert_eq!(engine.reporter.error_count(), 1);
        assert_eq!(engine.reporter.fault_stats().bad_bits, 0x4);
    }
}
