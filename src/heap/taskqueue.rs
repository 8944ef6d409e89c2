use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::{
    distributions::{Distribution, Uniform},
    thread_rng,
};

/// Termination detection for a fixed group of workers.
///
/// A worker that runs out of work offers termination. The phase ends once every worker
/// has offered at the same time; a worker that wakes up to find the count non-zero takes
/// its offer back and looks for work again.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            match result {
                Ok(_) => {
                    // Somebody is still busy; go look for work again.
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}

/// The shared half of a set of work-stealing deques: a stealer per worker plus a global
/// injector. The owning halves are handed out by [`WorkQueueSet::new`] and moved into
/// the worker jobs.
pub struct WorkQueueSet<T> {
    stealers: Vec<Stealer<T>>,
    injector: Injector<T>,
}

impl<T> WorkQueueSet<T> {
    pub fn new(nworkers: usize) -> (Self, Vec<Worker<T>>) {
        let mut workers = Vec::with_capacity(nworkers);
        let mut stealers = Vec::with_capacity(nworkers);

        for _ in 0..nworkers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(w);
        }

        (
            Self {
                stealers,
                injector: Injector::new(),
            },
            workers,
        )
    }

    pub fn nworkers(&self) -> usize {
        self.stealers.len()
    }

    pub fn injector(&self) -> &Injector<T> {
        &self.injector
    }

    pub fn push_global(&self, task: T) {
        self.injector.push(task);
    }

    pub fn pop_global(&self, worker: &Worker<T>) -> Option<T> {
        loop {
            match self.injector.steal_batch_and_pop(worker) {
                Steal::Empty => return None,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }
    }

    /// Steals from randomly chosen peers of `task_id`.
    pub fn steal(&self, task_id: usize, worker: &Worker<T>) -> Option<T> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = task_id;

            while stealer_id == task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(worker) {
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// True if no task is visible in the injector or any deque.
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(|s| s.is_empty())
    }
}
