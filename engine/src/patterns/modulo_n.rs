//! Test 9: modulo-N interaction test.
//!
//! Every Nth word receives the test pattern; all the other words are then
//! repeatedly overwritten with its complement. Only the every-Nth words
//! are verified, which exposes interactions between nearby cells that the
//! purely sequential tests cannot see.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;

const WORD: usize = core::mem::size_of::<Testword>();

impl<S: System> Engine<S> {
    pub(crate) fn test_modulo_n(
        &self,
        worker: Option<usize>,
        iterations: usize,
        pattern1: Testword,
        pattern2: Testword,
        n: usize,
        offset: usize,
    ) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_value(pattern1);
        }

        // Write every nth location with pattern1.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, WORD);
                if chunk_words(start, end) < n {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                let mut next = offset;
                let mut base = 0;
                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        base += block.words;
                        continue;
                    }
                    self.publish_addr(worker, block.start);
                    while next < base + block.words {
                        unsafe { self.sys.write_word(start.add(next), pattern1) };
                        next += n;
                    }
                    base += block.words;
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        // Write the rest of memory "iterations" times with pattern2.
        for _ in 0..iterations {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, WORD);
                if chunk_words(start, end) < n {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                let mut base = 0;
                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        base += block.words;
                        continue;
                    }
                    self.publish_addr(worker, block.start);
                    for i in 0..block.words {
                        let pos = base + i;
                        if pos % n != offset {
                            unsafe { self.sys.write_word(start.add(pos), pattern2) };
                        }
                    }
                    base += block.words;
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        self.flush_caches(worker);

        // Now check every nth location.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, WORD);
                if chunk_words(start, end) < n {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                let mut next = offset;
                let mut base = 0;
                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        base += block.words;
                        continue;
                    }
                    self.publish_addr(worker, block.start);
                    while next < base + block.words {
                        unsafe {
                            let p = start.add(next);
                            let actual = self.sys.read_word(p);
                            if actual != pattern1 {
                                self.data_error(p, pattern1, actual, true);
                            }
                        }
                        next += n;
                    }
                    base += block.words;
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        ticks
    }
}

fn chunk_words(start: *mut Testword, end: *mut Testword) -> usize {
    if (end as usize) < (start as usize) {
        0
    } else {
        (end as usize - start as usize) / WORD + 1
    }
}

#[cfg(test)]
mod tests {
    use crate::patterns::MODULO_N;
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn every_nth_word_survives_the_smother() {
        let bench = TestBench::new(4);
        let engine = test_engine(&bench);

        for offset in [0, 1, MODULO_N - 1] {
            engine.test_modulo_n(Some(0), 2, 0x5a5a, !0x5a5a, MODULO_N, offset);
        }
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn a_cell_clobbered_by_neighbour_writes_is_caught() {
        // Dropped writes leave the victim word holding the smother
        // pattern instead of the test pattern.
        let offset = 3;
        let victim = (offset + MODULO_N) * core::mem::size_of::<usize>();
        let bench = TestBench::new(4).with_write_drop(victim);
        let engine = test_engine(&bench);

        engine.test_modulo_n(Some(0), 2, 0x77, !0x77, MODULO_N, offset);
        assert!(engine.reporter.error_count() > 0);
    }
}
