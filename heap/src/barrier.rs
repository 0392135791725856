use parking_lot::{Condvar, Mutex};

/// A reusable barrier that puts collector threads to sleep until every
/// participant of the pause has arrived.
#[derive(Debug)]
pub struct SenseBarrier {
    /// (arrived, current sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
    parties: usize,
}

impl SenseBarrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
            parties,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Blocks until all parties have called `wait`. Returns `true` on the
    /// thread that arrived last.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;

        if state.0 == self.parties {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
            true
        } else {
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn barrier_is_reusable_and_elects_one_releaser() {
        let barrier = SenseBarrier::new(4);
        let arrived = AtomicUsize::new(0);
        let releasers = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 0..3 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            releasers.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(
                            arrived.load(Ordering::SeqCst) >= (round + 1) * 4,
                            "nobody leaves before everyone arrived"
                        );
                        barrier.wait();
                    }
                });
            }
        });

        assert_eq!(releasers.load(Ordering::SeqCst), 3, "one releaser per round");
    }
}
