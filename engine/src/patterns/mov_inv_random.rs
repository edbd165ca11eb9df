//! Test 8: moving inversions over a reproducible pseudo-random sequence.
//!
//! Fill with a PRSG stream, then twice re-walk the stream comparing and
//! writing the complement. The second walk therefore expects the inverted
//! stream.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::{prsg, Testword};

const WORD: usize = core::mem::size_of::<Testword>();

impl<S: System> Engine<S> {
    pub(crate) fn test_mov_inv_random(&self, worker: Option<usize>) -> usize {
        let mut ticks = 0;

        let seed = self.random_seed(0x8765_4321);

        if self.is_master(worker) {
            self.ui.test_pattern_value(seed);
        }

        // Initialize memory with the random stream.
        let mut prsg_state = seed;
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
                        prsg_state = prsg(prsg_state);
                        unsafe { self.sys.write_word(block.start.add(i), prsg_state) };
                    }
                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }

        // Check the stream and write the inverse at each location. Repeat,
        // expecting the inverted stream.
        let mut invert: Testword = 0;
        for _ in 0..2 {
            self.flush_caches(worker);

            prsg_state = seed;
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
                        prsg_state = prsg(prsg_state);
                        unsafe {
                            let p = block.start.add(i);
                            let expect = prsg_state ^ invert;
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
            drop(vm_map);
            invert = !invert;
        }

        ticks
    }
}
