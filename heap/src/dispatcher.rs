//! Stop-the-world task dispatch over a fixed set of collector threads.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::SenseBarrier;

/// What a task sees of the thread running it.
pub struct WorkerEnv<'d> {
    pub id: usize,
    pub threads: usize,
    barrier: &'d SenseBarrier,
}

impl WorkerEnv<'_> {
    #[inline(always)]
    pub fn is_main(&self) -> bool {
        self.id == 0
    }

    /// Blocks until every thread of the task arrives. Returns `true` on
    /// exactly one of them.
    pub fn synchronize_gc_threads(&self) -> bool {
        self.barrier.wait()
    }

    /// This worker's share of `0..len`.
    pub fn partition(&self, len: usize) -> Range<usize> {
        partition(len, self.id, self.threads)
    }
}

#[inline]
pub fn partition(len: usize, id: usize, threads: usize) -> Range<usize> {
    let chunk = len.div_ceil(threads.max(1));
    let start = (id * chunk).min(len);
    start..(start + chunk).min(len)
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    threads: usize,
}

impl Dispatcher {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "dispatcher needs at least one thread");
        Self { threads }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `task` on every collector thread, the calling thread acting as
    /// worker 0, and returns the results ordered by worker id.
    pub fn run<F, R>(&self, task: F) -> Vec<R>
    where
        F: Fn(&WorkerEnv<'_>) -> R + Sync,
        R: Send,
    {
        let barrier = SenseBarrier::new(self.threads);
        let task = &task;
        let barrier = &barrier;
        std::thread::scope(|s| {
            let handles: Vec<_> = (1..self.threads)
                .map(|id| {
                    std::thread::Builder::new()
                        .name(format!("gc-worker-{id}"))
                        .spawn_scoped(s, move || {
                            task(&WorkerEnv {
                                id,
                                threads: self.threads,
                                barrier,
                            })
                        })
                })
                .collect();

            let mut results = Vec::with_capacity(self.threads);
            results.push(task(&WorkerEnv {
                id: 0,
                threads: self.threads,
                barrier,
            }));
            for handle in handles {
                match handle {
                    Ok(handle) => match handle.join() {
                        Ok(result) => results.push(result),
                        Err(panic) => std::panic::resume_unwind(panic),
                    },
                    Err(e) => panic!("failed to spawn gc worker: {e}"),
                }
            }
            results
        })
    }
}

/// Shared overflow pool for work-list draining with termination detection.
///
/// Workers keep a private stack and only touch the pool to donate surplus or
/// to refill when they run dry.
pub struct WorkPool<T> {
    shared: Mutex<Vec<T>>,
    active: AtomicUsize,
}

const DONATE_THRESHOLD: usize = 64;
const REFILL_BATCH: usize = 32;

impl<T: Send> WorkPool<T> {
    pub fn new(threads: usize) -> Self {
        Self {
            shared: Mutex::new(Vec::new()),
            active: AtomicUsize::new(threads),
        }
    }

    pub fn push_all(&self, items: impl IntoIterator<Item = T>) {
        self.shared.lock().extend(items);
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }

    /// Re-arms termination detection for another drain over `threads`.
    pub fn reset(&self, threads: usize) {
        self.active.store(threads, Ordering::Release);
    }

    fn refill(&self, local: &mut Vec<T>) -> bool {
        let mut shared = self.shared.lock();
        let take = shared.len().min(REFILL_BATCH);
        let at = shared.len() - take;
        local.extend(shared.drain(at..));
        take > 0
    }

    /// Processes items until every participating worker is out of work.
    /// `process` may push further items onto the stack it is given.
    pub fn drain(&self, local: &mut Vec<T>, mut process: impl FnMut(T, &mut Vec<T>)) {
        loop {
            while let Some(item) = local.pop() {
                process(item, local);
                if local.len() > DONATE_THRESHOLD {
                    let mut shared = self.shared.lock();
                    if shared.is_empty() {
                        let half = local.len() / 2;
                        shared.extend(local.drain(..half));
                    }
                }
            }
            if self.refill(local) {
                continue;
            }

            self.active.fetch_sub(1, Ordering::AcqRel);
            loop {
                if !self.shared.lock().is_empty() {
                    self.active.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                if self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_everything_once() {
        let parts: Vec<_> = (0..3).map(|id| partition(10, id, 3)).collect();
        assert_eq!(parts, vec![0..4, 4..8, 8..10]);
        assert_eq!(partition(2, 2, 3), 2..2, "idle workers get empty ranges");
    }

    #[test]
    fn barrier_orders_phases() {
        let dispatcher = Dispatcher::new(4);
        let phase_one = AtomicUsize::new(0);
        let seen = dispatcher.run(|env| {
            phase_one.fetch_add(1, Ordering::SeqCst);
            env.synchronize_gc_threads();
            phase_one.load(Ordering::SeqCst)
        });
        assert_eq!(seen, vec![4; 4], "every worker sees phase one complete");
    }

    #[test]
    fn drain_processes_generated_work_once() {
        let dispatcher = Dispatcher::new(4);
        let pool = WorkPool::new(4);
        pool.push_all(0..16u32);
        let processed = AtomicUsize::new(0);
        dispatcher.run(|_| {
            let mut local = Vec::new();
            pool.drain(&mut local, |n, local| {
                processed.fetch_add(1, Ordering::Relaxed);
                if n < 1000 {
                    local.push(n * 2 + 1000);
                }
            });
        });
        assert_eq!(processed.load(Ordering::Relaxed), 32);
    }
}
