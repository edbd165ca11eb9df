//! Tests 3, 4 and 5: moving inversions with a fixed pattern.
//!
//! Fill forward with the pattern, then repeatedly read-and-invert forward
//! followed by read-and-invert backward. The widened paths broadcast the
//! pattern into a vector register and process 256-byte lines with aligned
//! (optionally non-temporal) stores, falling back to the scalar loop for
//! chunks too short to hold one line.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;

const WORD: usize = core::mem::size_of::<Testword>();

/// The vector paths process lines of this many bytes per unrolled step.
const SIMD_STRIDE: usize = 256;
const STRIDE_WORDS: usize = SIMD_STRIDE / WORD;

impl<S: System> Engine<S> {
    pub(crate) fn test_mov_inv_fixed(
        &self,
        worker: Option<usize>,
        iterations: usize,
        pattern1: Testword,
        pattern2: Testword,
    ) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_value(pattern1);
        }

        let nt = self.config.read().enable_nontemporal;
        let chunk_align = if self.sys.vector_words() > 1 { SIMD_STRIDE } else { WORD };

        // Initialize memory with the initial pattern.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, chunk_align);
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
                    unsafe { self.fill_words(block.start, block.words, pattern1, nt) };
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        // Check for the current pattern and write the inverse, sweeping
        // bottom-up and then top-down.
        for _ in 0..iterations {
            self.flush_caches(worker);

            {
                let vm_map = self.vm_map.read();
                for seg in vm_map.entries.iter() {
                    let (start, end) = self.chunk_for(seg, worker, chunk_align);
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
                        unsafe {
                            self.check_and_invert(
                                block.start,
                                block.words,
                                pattern1,
                                pattern2,
                                nt,
                                false,
                            )
                        };
                        self.tick(worker);
                        if self.state.bail() {
                            return ticks;
                        }
                    }
                }
            }

            self.flush_caches(worker);

            {
                let vm_map = self.vm_map.read();
                for seg in vm_map.entries.iter().rev() {
                    let (start, end) = self.chunk_for(seg, worker, chunk_align);
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
                        unsafe {
                            self.check_and_invert(
                                block.start,
                                block.words,
                                pattern2,
                                pattern1,
                                nt,
                                true,
                            )
                        };
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

    /// Fills words with a single pattern, using the vector path when the
    /// range holds at least one full line.
    pub(super) unsafe fn fill_words(
        &self,
        p: *mut Testword,
        words: usize,
        pattern: Testword,
        nt: bool,
    ) {
        let vw = self.sys.vector_words();
        let vector_ok = vw > 1 && words >= STRIDE_WORDS;
        let main = if vector_ok { words - words % STRIDE_WORDS } else { 0 };

        let mut i = 0;
        while i < main {
            self.sys.fill_vector(p.add(i), pattern, nt);
            i += vw;
        }
        while i < words {
            if nt {
                self.sys.write_word_nt(p.add(i), pattern);
            } else {
                self.sys.write_word(p.add(i), pattern);
            }
            i += 1;
        }

        if vector_ok || nt {
            self.sys.fence();
        }
    }

    /// Reads each word expecting `expect`, reports any mismatch, and
    /// overwrites it with `write`. Walks the range backward when `reverse`.
    unsafe fn check_and_invert(
        &self,
        p: *mut Testword,
        words: usize,
        expect: Testword,
        write: Testword,
        nt: bool,
        reverse: bool,
    ) {
        let vw = self.sys.vector_words();
        let vector_ok = vw > 1 && words >= STRIDE_WORDS;
        let main = if vector_ok { words - words % STRIDE_WORDS } else { 0 };

        let mut lanes = [0 as Testword; 8];
        let expected = [expect; 8];

        let scalar = |i: usize| unsafe {
            let p = p.add(i);
            let actual = self.sys.read_word(p);
            if actual != expect {
                self.data_error(p, expect, actual, true);
            }
            if nt {
                self.sys.write_word_nt(p, write);
            } else {
                self.sys.write_word(p, write);
            }
        };

        if reverse {
            for i in (main..words).rev() {
                scalar(i);
            }
            let mut i = main;
            while i > 0 {
                i -= vw;
                self.sys.read_vector(p.add(i), &mut lanes[..vw]);
                if lanes[..vw] != expected[..vw] {
                    self.data_error_wide(p.add(i), &expected[..vw], &lanes[..vw], true);
                }
                self.sys.fill_vector(p.add(i), write, nt);
            }
        } else {
            let mut i = 0;
            while i < main {
                self.sys.read_vector(p.add(i), &mut lanes[..vw]);
                if lanes[..vw] != expected[..vw] {
                    self.data_error_wide(p.add(i), &expected[..vw], &lanes[..vw], true);
                }
                self.sys.fill_vector(p.add(i), write, nt);
                i += vw;
            }
            for i in main..words {
                scalar(i);
            }
        }

        if vector_ok || nt {
            self.sys.fence();
        }
    }

    /// Walks the map once comparing every word against `expect`, leaving
    /// memory unchanged. Test support only.
    #[cfg(test)]
    pub(crate) fn mov_inv_check_only(&self, expect: Testword) {
        let vm_map = self.vm_map.read();
        for seg in vm_map.entries.iter() {
            let (start, end) = self.chunk_for(seg, Some(0), WORD);
            for block in spin_blocks(start, end) {
                unsafe { self.check_and_invert(block.start, block.words, expect, expect, false, false) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn fault_free_memory_ends_holding_the_final_pattern() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);

        let pattern1: Testword = 0;
        let pattern2 = !pattern1;
        engine.test_mov_inv_fixed(Some(0), 2, pattern1, pattern2);

        assert_eq!(engine.reporter.error_count(), 0);
        for i in 0..bench.words() {
            assert_eq!(bench.word_at(i * WORD), pattern1);
        }
    }

    #[test]
    fn detects_a_poked_word() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);

        // Fill only, via a zero-iteration run, then corrupt one word and
        // check with one iteration.
        engine.test_mov_inv_fixed(Some(0), 0, 0xaa, !0xaa);
        bench.poke(0x80, 0x1aa);
        engine.mov_inv_check_only(0xaa);
        assert!(engine.reporter.error_count() >= 1);
        let stats = engine.reporter.fault_stats();
        assert_eq!(stats.bad_bits, 0x100);
    }

    #[test]
    fn short_chunk_takes_the_scalar_path_with_identical_ticks() {
        // Twelve words is less than one 256-byte vector line, so the
        // widened system and the scalar system must walk the same blocks
        // and consume identical ticks.
        let scalar_bench = TestBench::new(1).with_words(12);
        let scalar_engine = test_engine(&scalar_bench);
        let scalar_ticks = scalar_engine.test_mov_inv_fixed(Some(0), 2, 0x55, !0x55);

        let simd_bench = TestBench::new(1).with_words(12).with_vector_words(4);
        let simd_engine = test_engine(&simd_bench);
        let simd_ticks = simd_engine.test_mov_inv_fixed(Some(0), 2, 0x55, !0x55);

        assert_eq!(scalar_ticks, simd_ticks);
        assert_eq!(simd_engine.reporter.error_count(), 0);
        assert_eq!(simd_bench.vector_fills(), 0);
    }

    #[test]
    fn long_chunk_uses_the_vector_path() {
        let bench = TestBench::new(8).with_vector_words(4);
        let engine = test_engine(&bench);

        engine.test_mov_inv_fixed(Some(0), 1, 0x33, !0x33);
        assert_eq!(engine.reporter.error_count(), 0);
        assert!(bench.vector_fills() > 0);
        for i in 0..bench.words() {
            assert_eq!(bench.word_at(i * WORD), 0x33);
        }
    }
}
