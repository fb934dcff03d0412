//! The worker pool, per `spec.md` §4.3.
//!
//! Rule bodies are ordinary blocking Rust calls (no async), so
//! "suspending" a worker that is waiting on a dependency really does
//! block its OS thread. To still bound *concurrently executing* rule
//! bodies to a fixed width, a rule body only runs while holding a
//! permit from a counting semaphore, and releases it before parking to
//! wait on a dependency (tracked via a thread-local flag so
//! `crate::apply` doesn't need to thread a permit handle through
//! `Action`), which is how cooperative suspension is implemented
//! without an async runtime. Concurrency among a single `apply` call's
//! keys comes from `std::thread::scope` in `crate::apply`; the
//! scheduler only gates how many of those threads may be inside a rule
//! body at once.

use std::cell::Cell;
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex};

/// A counting semaphore built from `parking_lot` primitives, the way
/// the teacher builds `RevisionGuard` directly out of `lock_api`
/// primitives rather than reaching for a dedicated crate.
struct Permits {
    available: Mutex<usize>,
    released: Condvar,
}

impl Permits {
    fn new(capacity: usize) -> Self {
        Permits {
            available: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.released.notify_one();
    }
}

thread_local! {
    /// Whether the current OS thread is holding a scheduler permit
    /// right now. Set for the duration of `run_with_permit`'s job, and
    /// restored (not just cleared) on return so a thread that calls
    /// `run_with_permit` reentrantly — building one key, suspending,
    /// building another — always leaves this accurate for its caller.
    static HOLDS_PERMIT: Cell<bool> = const { Cell::new(false) };
}

/// Bounds the number of rule bodies executing at once.
pub struct Scheduler {
    permits: Arc<Permits>,
}

impl Scheduler {
    /// Creates a pool bounding concurrent rule-body execution to `width`.
    pub fn new(width: usize) -> Self {
        Scheduler {
            permits: Arc::new(Permits::new(width.max(1))),
        }
    }

    /// Runs `job` on the current thread, but only after acquiring a
    /// permit (blocking until the pool has a free slot). Marks this
    /// thread as a permit holder for the duration, restoring whatever
    /// it was beforehand on return, so nested calls (a rule body that
    /// itself suspends and resumes while building a dependency) don't
    /// lose track of whether the outer invocation held one.
    pub fn run_with_permit<T>(&self, job: impl FnOnce() -> T) -> T {
        self.permits.acquire();
        trace!("admitted to the worker pool");
        let was_holding = HOLDS_PERMIT.with(|h| h.replace(true));
        let result = job();
        HOLDS_PERMIT.with(|h| h.set(was_holding));
        self.permits.release();
        trace!("released the worker pool slot");
        result
    }

    /// Runs `wait`, releasing this thread's permit first if it holds
    /// one and reacquiring it afterwards — the "a worker relinquishes
    /// its slot for the duration of the suspension" contract from
    /// `spec.md` §4.3. Called from the root dispatcher (which holds no
    /// permit) this is a plain pass-through.
    pub fn suspend_while<T>(&self, wait: impl FnOnce() -> T) -> T {
        let held = HOLDS_PERMIT.with(|h| h.get());
        if held {
            trace!("parking: releasing permit for the duration of a wait");
            self.permits.release();
        }
        let result = wait();
        if held {
            self.permits.acquire();
            trace!("resumed: reacquired permit after waiting");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn run_with_permit_bounds_scoped_threads() {
        let scheduler = Scheduler::new(2);
        let concurrent = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    scheduler.run_with_permit(|| {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        });
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn run_with_permit_is_reentrant_across_suspension() {
        let scheduler = Scheduler::new(1);
        scheduler.run_with_permit(|| {
            scheduler.suspend_while(|| {
                // Released this thread's only permit; another call
                // could acquire it here without deadlocking.
                scheduler.run_with_permit(|| {});
            });
            assert!(HOLDS_PERMIT.with(|h| h.get()), "outer permit should be held again");
        });
    }

    #[test]
    fn suspend_while_frees_a_slot_for_another_job() {
        let scheduler = Arc::new(Scheduler::new(1));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let ran_second = Arc::new(AtomicUsize::new(0));
        let ran_second2 = ran_second.clone();

        let s1 = scheduler.clone();
        let first = std::thread::spawn(move || {
            s1.run_with_permit(|| {
                s1.suspend_while(|| rx.recv().unwrap());
            });
        });

        // Give `first` a chance to acquire and then release its permit
        // via `suspend_while` before `second` tries to acquire it.
        std::thread::sleep(Duration::from_millis(20));

        let s2 = scheduler.clone();
        let second = std::thread::spawn(move || {
            s2.run_with_permit(|| {
                ran_second2.store(1, Ordering::SeqCst);
            });
        });
        second.join().unwrap();
        assert_eq!(ran_second.load(Ordering::SeqCst), 1);
        tx.send(()).unwrap();
        first.join().unwrap();
    }
}
