//! Test 6: moving inversions with a walking bit.
//!
//! The pattern starts as a single set (or clear) bit and is rotated left
//! at every successive address, so the moving bit sweeps both the bit and
//! the address dimensions.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;

const WORD: usize = core::mem::size_of::<Testword>();

impl<S: System> Engine<S> {
    pub(crate) fn test_mov_inv_walk1(
        &self,
        worker: Option<usize>,
        iterations: usize,
        offset: usize,
        inverse: bool,
    ) -> usize {
        let mut ticks = 0;

        let start_pattern = |inv: bool| -> Testword {
            let p = (1 as Testword) << offset;
            if inv {
                !p
            } else {
                p
            }
        };

        let mut pattern = start_pattern(inverse);

        if self.is_master(worker) {
            self.ui.test_pattern_value(pattern);
        }

        // Initialize memory with the initial pattern.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, WORD);
                if (end as usize) < (start as usize) {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        continue;
                    }
                    self.publish_addr(worker, block.start);
                    for i in 0..block.words {
                        unsafe { self.sys.write_word(block.start.add(i), pattern) };
                        pattern = pattern.rotate_left(1);
                    }
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        // Check for the current pattern and write the complement, testing
        // from the bottom up and then from the top down.
        for _ in 0..iterations {
            pattern = start_pattern(inverse);

            self.flush_caches(worker);

            {
                let vm_map = self.vm_map.read();
                for seg in vm_map.entries.iter() {
                    let (start, end) = self.chunk_for(seg, worker, WORD);
                    if (end as usize) < (start as usize) {
                        ticks += self.skip_range(worker, 1);
                        continue;
                    }

                    for block in spin_blocks(start, end) {
                        ticks += 1;
                        if worker.is_none() {
                            continue;
                        }
                        self.publish_addr(worker, block.start);
                        for i in 0..block.words {
                            unsafe {
                                let p = block.start.add(i);
                                let expect = pattern;
                                let actual = self.sys.read_word(p);
                                if actual != expect {
                                    self.data_error(p, expect, actual, true);
                                }
                                self.sys.write_word(p, !expect);
                            }
                            pattern = pattern.rotate_left(1);
                        }
                        self.tick(worker);
                        if self.state.bail() {
                            return ticks;
                        }
                    }
                }
            }

            pattern = !pattern;

            self.flush_caches(worker);

            {
                let vm_map = self.vm_map.read();
                for seg in vm_map.entries.iter().rev() {
                    let (start, end) = self.chunk_for(seg, worker, WORD);
                    if (end as usize) < (start as usize) {
                        ticks += self.skip_range(worker, 1);
                        continue;
                    }

                    for block in spin_blocks(start, end).rev() {
                        ticks += 1;
                        if worker.is_none() {
                            continue;
                        }
                        self.publish_addr(worker, block.start);
                        for i in (0..block.words).rev() {
                            pattern = pattern.rotate_right(1);
                            unsafe {
                                let p = block.start.add(i);
                                let expect = pattern;
                                let actual = self.sys.read_word(p);
                                if actual != expect {
                                    self.data_error(p, expect, actual, true);
                                }
                                self.sys.write_word(p, !expect);
                            }
                        }
                        self.tick(worker);
                        if self.state.bail() {
                            return ticks;
                        }
                    }
                }
            }
        }

        ticks
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{test_engine, TestBench};
    use crate::testword::Testword;

    #[test]
    fn round_trips_clean_memory() {
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        for offset in [0usize, 7, 63 % Testword::BITS as usize] {
            engine.test_mov_inv_walk1(Some(0), 2, offset, false);
            engine.test_mov_inv_walk1(Some(0), 2, offset, true);
        }
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn dummy_run_counts_the_same_ticks() {
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        // The dummy run must return exactly the number of tick calls the
        // real run makes, so the progress bars stay linear.
        let real = engine.test_mov_inv_walk1(Some(0), 3, 5, false);
        assert_eq!(bench.ui().check_input_count(), real);

        let dummy = engine.test_mov_inv_walk1(None, 3, 5, false);
        assert_eq!(real, dummy);
        assert_eq!(bench.ui().check_input_count(), real);
    }
}
