//! Test 7: block move.
//!
//! Memory is initialised with a rotating 16-word stripe template, then
//! shuffled with overlapping bulk copies: the first half of each block to
//! the second half, the second half (less 64 bytes) back to the first half
//! plus 64 bytes, and the remaining 64 bytes to the start. After the
//! moves, every even/odd word pair must still be equal.

use crate::driver::Engine;
use crate::patterns::spin_blocks;
use crate::system::System;
use crate::testword::Testword;

const WORD: usize = core::mem::size_of::<Testword>();

/// The wrap distance of the shuffle, in words (64 bytes on 64-bit).
const MOVE_TAIL_WORDS: usize = 64 / WORD;

impl<S: System> Engine<S> {
    pub(crate) fn test_block_move(&self, worker: Option<usize>, iterations: usize) -> usize {
        let mut ticks = 0;

        if self.is_master(worker) {
            self.ui.test_pattern_name("block move");
        }

        let chunk_align = 16 * WORD;

        // Initialize memory with the stripe template.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, chunk_align);
                if chunk_words(start, end) < 16 {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        continue;
                    }
                    self.publish_addr(worker, block.start);

                    let mut pattern1: Testword = 1;
                    let mut i = 0;
                    while i + 16 <= block.words {
                        let pattern2 = !pattern1;
                        const STRIPES: [bool; 16] = [
                            false, false, false, false, true, true, false, false, false, false,
                            true, true, false, false, true, true,
                        ];
                        for (j, &inverted) in STRIPES.iter().enumerate() {
                            let value = if inverted { pattern2 } else { pattern1 };
                            unsafe { self.sys.write_word(block.start.add(i + j), value) };
                        }
                        pattern1 = pattern1.rotate_left(1);
                        i += 16;
                    }

                    self.tick(worker);
                    if self.state.bail() {
                        return ticks;
                    }
                }
            }
        }
        self.flush_caches(worker);

        // Now move the data around. First move the data up half of the
        // block size, then move it back down with a 64-byte displacement,
        // wrapping the tail to the start.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, chunk_align);
                if chunk_words(start, end) < 16 {
                    ticks += self.skip_range(worker, iterations);
                    continue;
                }

                for block in spin_blocks(start, end) {
                    let half_words = block.words / 2;
                    let mid = unsafe { block.start.add(half_words) };

                    for _ in 0..iterations {
                        ticks += 1;
                        if worker.is_none() {
                            continue;
                        }
                        self.publish_addr(worker, block.start);

                        unsafe {
                            // First half up to the midpoint.
                            self.sys.copy_words(mid, block.start, half_words);
                            // Second half, less the tail, down to start + tail.
                            self.sys.copy_words(
                                block.start.add(MOVE_TAIL_WORDS),
                                mid,
                                half_words - MOVE_TAIL_WORDS,
                            );
                            // The remaining tail wraps to the start.
                            self.sys.copy_words(
                                block.start,
                                mid.add(half_words - MOVE_TAIL_WORDS),
                                MOVE_TAIL_WORDS,
                            );
                        }

                        self.tick(worker);
                        if self.state.bail() {
                            return ticks;
                        }
                    }
                }
            }
        }
        self.flush_caches(worker);

        // Now check the data. The error checking is rather crude: we just
        // require that adjacent words match.
        {
            let vm_map = self.vm_map.read();
            for seg in vm_map.entries.iter() {
                let (start, end) = self.chunk_for(seg, worker, chunk_align);
                if chunk_words(start, end) < 16 {
                    ticks += self.skip_range(worker, 1);
                    continue;
                }

                for block in spin_blocks(start, end) {
                    ticks += 1;
                    if worker.is_none() {
                        continue;
                    }
                    self.publish_addr(worker, block.start);

                    let mut i = 0;
                    while i + 2 <= block.words {
                        unsafe {
                            let p = block.start.add(i);
                            let p0 = self.sys.read_word(p);
                            let p1 = self.sys.read_word(p.add(1));
                            if p0 != p1 {
                                self.data_error(p, p0, p1, false);
                            }
                        }
                        i += 2;
                    }

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
    use crate::sim::{test_engine, TestBench};

    #[test]
    fn shuffled_stripes_still_pair_up() {
        let bench = TestBench::new(8);
        let engine = test_engine(&bench);
        engine.test_block_move(Some(0), 3);
        assert_eq!(engine.reporter.error_count(), 0);
    }

    #[test]
    fn undersized_segment_is_skipped_in_lockstep() {
        let bench = TestBench::new(1).with_words(12);
        let engine = test_engine(&bench);

        // Three phases, three skip ticks (the move phase charges one per
        // iteration), and no memory traffic at all.
        let before = bench.snapshot();
        let ticks = engine.test_block_move(Some(0), 5);
        assert_eq!(ticks, 1 + 5 + 1);
        assert_eq!(before, bench.snapshot());
        assert_eq!(engine.reporter.error_count(), 0);
    }
}
