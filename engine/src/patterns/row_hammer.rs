//! Test 11: row hammer.
//!
//! Rows are laid out as aggressor/victim/aggressor triples of one page
//! each. The aggressor rows are read repeatedly with their cache lines
//! evicted in between, trying to disturb the victim row, which is then
//! verified.

use crate::driver::Engine;
use crate::system::System;
use crate::testword::{round_down, round_up, Testword, PAGE_SIZE};

const WORD: usize = core::mem::size_of::<Testword>();

const ROW_BYTES: usize = PAGE_SIZE;
const ROW_WORDS: usize = ROW_BYTES / WORD;
const TRIPLE_WORDS: usize = 3 * ROW_WORDS;

const HAMMER_READS: usize = 10_000;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        const AGGRESSOR: Testword = 0x5555_5555_5555_5555;
    } else {
        const AGGRESSOR: Testword = 0x5555_5555;
    }
}
const VICTIM: Testword = !AGGRESSOR;

impl<S: System> Engine<S> {
    pub(crate) fn test_row_hammer(&self, worker: Option<usize>, iterations: usize) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_name("row hammer");
        }

        let vm_map = self.vm_map.read();
        for seg in vm_map.entries.iter() {
            let (chunk_start, chunk_end) = self.chunk_for(seg, worker, ROW_BYTES);

            let aligned_start = round_up(chunk_start as usize, ROW_BYTES);
            let aligned_end = round_down((chunk_end as usize).wrapping_add(WORD), ROW_BYTES);

            if aligned_end <= aligned_start
                || (aligned_end - aligned_start) / WORD < TRIPLE_WORDS
            {
                ticks += self.skip_range(worker, 1);
                continue;
            }

            let start = aligned_start as *mut Testword;
            let triples = ((aligned_end - aligned_start) / WORD) / TRIPLE_WORDS;

            // Initialize the rows with alternating aggressor/victim
            // patterns.
            for t in 0..triples {
                ticks += 1;
                if worker.is_none() {
                    continue;
                }
                let row = unsafe { start.add(t * TRIPLE_WORDS) };
                self.publish_addr(worker, row);

                for w in 0..ROW_WORDS {
                    unsafe {
                        self.sys.write_word(row.add(w), AGGRESSOR);
                        self.sys.write_word(row.add(ROW_WORDS + w), VICTIM);
                        self.sys.write_word(row.add(2 * ROW_WORDS + w), AGGRESSOR);
                    }
                }

                self.tick(worker);
                if self.state.bail() {
                    return ticks;
                }
            }

            // Hammer the aggressor rows to induce flips in the victims.
            for _ in 0..iterations {
                for t in 0..triples {
                    ticks += 1;
                    if worker.is_none() {
                        continue;
                    }
                    let row = unsafe { start.add(t * TRIPLE_WORDS) };
                    self.publish_addr(worker, unsafe { row.add(ROW_WORDS) });

                    let aggressor1 = row;
                    let aggressor2 = unsafe { row.add(2 * ROW_WORDS) };
                    for _ in 0..HAMMER_READS {
                        unsafe {
                            self.sys.read_word(aggressor1);
                            self.sys.read_word(aggressor2);
                            self.sys.flush_cache_line(aggressor1);
                            self.sys.flush_cache_line(aggressor2);
                        }
                    }

                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }

            self.flush_caches(worker);

            // Verify the victim rows retained their pattern.
            for t in 0..triples {
                ticks += 1;
                if worker.is_none() {
                    continue;
                }
                let victim = unsafe { start.add(t * TRIPLE_WORDS + ROW_WORDS) };
                self.publish_addr(worker, victim);

                for w in 0..ROW_WORDS {
                    unsafe {
                        let p = victim.add(w);
                        let actual = self.sys.read_word(p);
                        if actual != VICTIM {
                            self.data_error(p, VICTIM, actual, true);
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
}

#[cfg(test)]
mod tests {
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn stable_rows_pass() {
        let bench = TestBench::new(6);
        let engine = test_engine(&bench);
        engine.test_row_hammer(Some(0), 1);
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn segment_smaller_than_a_triple_is_skipped() {
        let bench = TestBench::new(2);
        let engine = test_engine(&bench);
        let before = bench.snapshot();
        assert_eq!(engine.test_row_hammer(Some(0), 4), 1);
        assert_eq!(before, bench.snapshot());
    }
}
