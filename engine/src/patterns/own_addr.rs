//! Tests 1 and 2: every location is filled with its own address, then
//! checked. Test 2 adds the window offset so the stored value equals the
//! physical address, which catches aliasing between windows; it runs in
//! two stages so the data must survive the relocation in between.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;
use crate::window::window_offset;

impl<S: System> Engine<S> {
    pub(crate) fn test_own_addr1(&self, worker: Option<usize>) -> usize {
        let mut ticks = 0;

        ticks += self.own_addr_fill_check(worker, 0, true);
        ticks += self.own_addr_fill_check(worker, 0, false);

        ticks
    }

    pub(crate) fn test_own_addr2(&self, worker: Option<usize>, stage: usize) -> usize {
        // The offset between the virtual addresses in the window and the
        // physical addresses they map to.
        let offset = {
            let vm_map = self.vm_map.read();
            match vm_map.entries.first() {
                Some(first) => window_offset(first.pm_base_addr),
                None => 0,
            }
        };

        self.own_addr_fill_check(worker, offset, stage == 0)
    }

    fn own_addr_fill_check(&self, worker: Option<usize>, offset: Testword, fill: bool) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_name("own address");
        }

        let nontemporal = self.config.read().enable_nontemporal;

        let vm_map = self.vm_map.read();
        for seg in vm_map.entries.iter() {
            for block in spin_blocks(seg.start, seg.end) {
                ticks += 1;
                let Some(_) = worker else { continue };
                self.publish_addr(worker, block.start);

                let p = block.start;
                if fill {
                    if nontemporal {
                        for i in 0..block.words {
                            unsafe {
                                let p = p.add(i);
                                self.sys.write_word_nt(p, (p as Testword).wrapping_add(offset));
                            }
                        }
                        self.sys.fence();
                    } else {
                        for i in 0..block.words {
                            unsafe {
                                let p = p.add(i);
                                self.sys.write_word(p, (p as Testword).wrapping_add(offset));
                            }
                        }
                    }
                } else {
                    for i in 0..block.words {
                        unsafe {
                            let p = p.add(i);
                            let expect = (p as Testword).wrapping_add(offset);
                            let actual = self.sys.read_word(p);
                            if actual != expect {
                                self.data_error(p, expect, actual, true);
                            }
                        }
                    }
                }

                self.tick(worker);
                if self.state.bail() {
                    return ticks;
                }
            }
        }
        drop(vm_map);

        if fill {
            self.flush_caches(worker);
        }

        ticks
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn fill_then_check_round_trips() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);

        let fill_ticks = engine.test_own_addr1(Some(0));
        assert!(fill_ticks > 0);
        assert_eq!(engine.reporter.error_count(), 0);

        // Every word now holds its own address.
        let base = bench.addr_of(0);
        for i in 0..8 * 512 {
            assert_eq!(bench.word_at(i * 8), base + i * 8);
        }
    }

    #[test]
    fn stage_split_checks_what_stage_zero_wrote() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);

        // Stage 0 fills, stage 1 checks; nothing in between disturbed the
        // memory, so the check is clean.
        engine.test_own_addr2(Some(0), 0);
        engine.test_own_addr2(Some(0), 1);
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn corruption_between_stages_is_detected() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);

        engine.test_own_addr2(Some(0), 0);
        bench.poke(0x100, 0xdead_beef);
        engine.test_own_addr2(Some(0), 1);
        assert_eq!(engine.reporter.error_count(), 1);
    }
}
