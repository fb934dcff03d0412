//! Build-wide coordination shared by every worker: the current run
//! number and staunch-mode error collection (`spec.md` §4.3, §6).
//!
//! Unlike the teacher's `Runtime`/`SharedState`, this does not carry a
//! cross-thread `DependencyGraph` for cycle detection: `spec.md` §9
//! calls for checking the *caller's own stack*, which is threaded
//! through `Local` and requires no shared state at all (see
//! `crate::apply`). What's left here is strictly build-wide
//! bookkeeping: a fresh [`Run`], the shutdown flag, and (in staunch
//! mode) the bag of errors collected along the way.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Error;
use crate::key::{Run, RunCounter};

/// Shared, build-wide state threaded through [`crate::context::Global`].
pub struct Runtime {
    current_run: Run,
    /// Set once a failure occurs in non-staunch mode, or once the
    /// build-wide timeout expires: tells workers not to start any new
    /// rule body (`spec.md` §4.3, "Cancellation").
    shutting_down: AtomicBool,
    /// Errors collected in staunch mode, reported together at the end
    /// of the build (`spec.md` §4.3, §7).
    staunch_errors: Mutex<Vec<Error>>,
}

impl Runtime {
    /// Starts a new run, advancing the counter past whatever run number
    /// the on-disk database last recorded.
    pub fn new(last_persisted_run: Run) -> Self {
        let current_run = RunCounter::starting_after(last_persisted_run).advance();
        Runtime {
            current_run,
            shutting_down: AtomicBool::new(false),
            staunch_errors: Mutex::new(Vec::new()),
        }
    }

    /// The run number every entry built during this build is stamped with.
    pub fn current_run(&self) -> Run {
        self.current_run
    }

    /// Whether the build has entered cancellation mode.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Enters cancellation mode: no further rule bodies should start.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Records a staunch-mode error; staunch builds keep running after
    /// failures instead of entering shutdown.
    pub fn record_staunch_error(&self, error: Error) {
        self.staunch_errors.lock().push(error);
    }

    /// Every error collected in staunch mode, in the order recorded.
    pub fn take_staunch_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.staunch_errors.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_run_advances_past_persisted() {
        let runtime = Runtime::new(Run::from_u64(5));
        assert_eq!(runtime.current_run().as_u64(), 6);
    }
}
