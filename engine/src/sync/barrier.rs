//! An N-thread rendezvous with spin and halt-and-IPI wait variants.
//!
//! The barrier is sense-reversing: arrivals count up on `count`, and the
//! last arrival resets the count and bumps `generation`, which releases
//! everyone blocked on the old generation. A waiter that uses the halt
//! variant publishes a per-core parked flag first; the releaser clears the
//! flags and sends an NMI to each parked core. A core that was released
//! before it managed to halt sees the generation change on the next loop
//! iteration, so a lost wakeup can only strand a core for the duration of
//! one spurious interrupt (the platform NMI handler additionally skips
//! over a halt instruction it finds the core sitting on).

use crate::system::{System, MAX_CPUS};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use elain::Align;

/// A per-core flag, spaced out so each flag occupies its own cache line.
#[repr(C)]
struct CoreFlag {
    flag: AtomicBool,
    _spacing: Align<64>,
}

const_assert_eq!(core::mem::size_of::<CoreFlag>(), 64);

impl CoreFlag {
    const INIT: CoreFlag = CoreFlag { flag: AtomicBool::new(false), _spacing: Align::NEW };
}

pub struct Barrier {
    target: AtomicUsize,
    count: AtomicUsize,
    generation: AtomicUsize,
    parked: [CoreFlag; MAX_CPUS],
}

impl Barrier {
    /// Creates a new barrier blocking the specified number of threads.
    pub fn new(num_threads: usize) -> Self {
        Self {
            target: AtomicUsize::new(num_threads),
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            parked: [CoreFlag::INIT; MAX_CPUS],
        }
    }

    /// Rearms the barrier for the specified number of threads. Must only
    /// be called while no thread is waiting on the barrier.
    pub fn reset(&self, num_threads: usize) {
        self.target.store(num_threads, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Waits for all threads to arrive at the barrier, spinning in an
    /// idle loop.
    ///
    /// Every memory operation issued before this call happens-before every
    /// memory operation issued by any participant after it returns.
    pub fn spin_wait<S: System>(&self, sys: &S) {
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrive() {
            self.release(sys);
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                sys.pause();
            }
        }
    }

    /// Waits for all threads to arrive at the barrier, halting while
    /// waiting. The last arrival wakes the others with an NMI.
    pub fn halt_wait<S: System>(&self, sys: &S, my_cpu: usize) {
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrive() {
            self.release(sys);
            return;
        }

        self.parked[my_cpu].flag.store(true, Ordering::Release);
        while self.generation.load(Ordering::Acquire) == generation {
            sys.park();
        }
        self.parked[my_cpu].flag.store(false, Ordering::Release);
    }

    /// Counts this thread in. Returns true if it was the last arrival.
    fn arrive(&self) -> bool {
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        arrived == self.target.load(Ordering::Relaxed)
    }

    /// Opens the barrier and kicks every parked core.
    fn release<S: System>(&self, sys: &S) {
        self.count.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);

        for (cpu, parked) in self.parked.iter().enumerate() {
            if parked.flag.swap(false, Ordering::AcqRel) {
                sys.wake(cpu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn spin_barrier_orders_phases() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 500;

        let barrier = Arc::new(Barrier::new(THREADS));
        let sys = Arc::new(SimSystem::new(1));
        let phase_sum = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = barrier.clone();
                let sys = sys.clone();
                let phase_sum = phase_sum.clone();
                std::thread::spawn(move || {
                    for round in 0..ROUNDS {
                        phase_sum.fetch_add(1, Ordering::Relaxed);
                        barrier.spin_wait(&*sys);
                        // Between two barriers every thread observes the
                        // full phase contribution of all the others.
                        assert_eq!(phase_sum.load(Ordering::Relaxed), (round + 1) * THREADS);
                        barrier.spin_wait(&*sys);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn halt_barrier_releases_all_waiters() {
        const THREADS: usize = 3;

        let barrier = Arc::new(Barrier::new(THREADS));
        let sys = Arc::new(SimSystem::new(1));

        let handles: Vec<_> = (0..THREADS)
            .map(|cpu| {
                let barrier = barrier.clone();
                let sys = sys.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        barrier.halt_wait(&*sys, cpu);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn single_thread_barrier_never_blocks() {
        let barrier = Barrier::new(1);
        let sys = SimSystem::new(1);
        for _ in 0..10 {
            barrier.spin_wait(&sys);
            barrier.halt_wait(&sys, 0);
        }
    }
}
