//! Test 0: walking ones across the address lines, caches disabled.
//!
//! For each pair of power-of-two offsets within a segment, write a value
//! derived from the first address, write the complement of a value derived
//! from the second, and re-read the first. Any mismatch means the two
//! addresses decode onto the same cells.

use crate::driver::Engine;
use crate::system::System;
use crate::testword::Testword;

const WORD: usize = core::mem::size_of::<Testword>();

impl<S: System> Engine<S> {
    pub(crate) fn test_addr_walk(&self, worker: Option<usize>) -> usize {
        let mut ticks = 0;

        // There isn't a meaningful address for this test.
        self.publish_addr(worker, core::ptr::null());

        let mut invert: Testword = 0;
        for _ in 0..2 {
            if self.is_master(worker) {
                self.ui.test_pattern_value(invert);
            }
            ticks += 1;
            if worker.is_none() {
                invert = !invert;
                continue;
            }

            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let pb = seg.start as usize;
                let pe = seg.end as usize;

                // Walking one on our first address.
                let mut mask1 = WORD;
                loop {
                    let p1 = (pb | mask1) as *mut Testword;
                    mask1 = mask1.wrapping_shl(1);
                    if p1 as usize > pe {
                        break;
                    }
                    let expect = invert ^ p1 as Testword;
                    unsafe { self.sys.write_word(p1, expect) };

                    // Walking one on our second address.
                    let mut mask2 = WORD;
                    loop {
                        let p2 = (pb | mask2) as *mut Testword;
                        mask2 = mask2.wrapping_shl(1);
                        if p2 != p1 {
                            if p2 as usize > pe {
                                break;
                            }
                            unsafe { self.sys.write_word(p2, !invert ^ p2 as Testword) };

                            let actual = unsafe { self.sys.read_word(p1) };
                            if actual != expect {
                                self.addr_error(p1, p2, expect, actual);
                                // Recover so later pairs test p1 again.
                                unsafe { self.sys.write_word(p1, expect) };
                            }
                        }
                        if mask2 == 0 {
                            break;
                        }
                    }

                    if mask1 == 0 {
                        break;
                    }
                }
            }

            invert = !invert;

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
    fn clean_memory_reports_nothing() {
        let bench = TestBench::new(16);
        let engine = test_engine(&bench);
        engine.test_addr_walk(Some(0));
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn stuck_bit_is_reported_as_an_address_error() {
        // A memory model that forces bit 4 of the value read at offset
        // 0x2000 must produce address-error reports naming that address
        // with an XOR of 0x10. In address mode consecutive repeats of the
        // same (addr, xor) pair collapse into a single scrolled line.
        let bench = TestBench::new(16).with_read_xor(0x2000, 0x10).with_address_mode();
        let engine = test_engine(&bench);

        engine.test_addr_walk(Some(0));

        assert!(engine.reporter.error_count() > 0);
        let stats = engine.reporter.fault_stats();
        assert_eq!(stats.last_addr, bench.addr_of(0x2000));
        assert_eq!(stats.last_xor, 0x10);
        assert_eq!(bench.ui().scroll_count(), 1);
    }
}
