//! The Execution Context: the per-rule scoped state threaded through
//! every rule body (`spec.md` §4.1).
//!
//! `Global` is read-only and shared across every rule execution in a
//! build; `Local` is per-rule and copy-on-branch the way the teacher's
//! `ActiveQuery` is pushed/popped per query invocation (`runtime.rs`).
//! Scoped operations restore `Local` on every exit path via `Drop`
//! guards, mirroring the teacher's `PanicGuard`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::key::ErasedKey;
use crate::lint::LintState;
use crate::options::{Options, Verbosity};
use crate::registry::{ErasedValue, Registry};
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// One time-stamped span recorded by [`Action::traced`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Trace {
    /// The message passed to `traced`.
    pub command: String,
    /// Seconds since build start when the span began.
    pub start: f64,
    /// Seconds since build start when the span ended.
    pub stop: f64,
}

/// `(Verbosity, String) -> ()`, the output sink from `spec.md` §4.1.
pub type OutputSink = Arc<dyn Fn(Verbosity, &str) + Send + Sync>;

/// `() -> f64`, seconds since build start — the injectable timestamp
/// source from `spec.md` §4.1 / §6 (`Options::now`).
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Read-only state shared across every rule execution in a build.
pub struct Global {
    pub(crate) options: Arc<Options>,
    pub(crate) db: Arc<Database>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) sink: OutputSink,
    pub(crate) clock: ClockFn,
    build_start: Instant,
    progress_done: std::sync::atomic::AtomicUsize,
    progress_total: std::sync::atomic::AtomicUsize,
    after_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    cleanup: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    pub(crate) lint: LintState,
}

impl Global {
    pub(crate) fn new(
        options: Arc<Options>,
        db: Arc<Database>,
        registry: Arc<Registry>,
        runtime: Arc<Runtime>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let sink = options.sink.clone();
        let clock = options.clock.clone();
        let lint = LintState::new(options.lint);
        Global {
            options,
            db,
            registry,
            runtime,
            scheduler,
            sink,
            clock,
            build_start: Instant::now(),
            progress_done: std::sync::atomic::AtomicUsize::new(0),
            progress_total: std::sync::atomic::AtomicUsize::new(0),
            after_hooks: Mutex::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
            lint,
        }
    }

    /// Seconds elapsed since the build started, via the injected clock.
    pub fn now(&self) -> f64 {
        (self.clock)()
    }

    pub(crate) fn default_now(build_start: Instant) -> f64 {
        build_start.elapsed().as_secs_f64()
    }

    pub(crate) fn set_progress_total(&self, total: usize) {
        self.progress_total
            .store(total, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn bump_progress_done(&self) {
        self.progress_done
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fraction of wanted keys resolved so far, `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        let total = self.progress_total.load(std::sync::atomic::Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let done = self.progress_done.load(std::sync::atomic::Ordering::SeqCst);
        done as f64 / total as f64
    }

    /// Prepends `hook` to the after-hooks list (atomic prepend, so the
    /// most recently registered hook runs first, per `spec.md` §4.1's
    /// "reverse-registration order").
    pub fn run_after(&self, hook: impl FnOnce() + Send + 'static) {
        self.after_hooks.lock().insert(0, Box::new(hook));
    }

    pub(crate) fn run_after_hooks(&self) {
        let hooks = std::mem::take(&mut *self.after_hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn register_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanup.lock().push(Box::new(cleanup));
    }

    pub(crate) fn run_cleanup(&self) {
        let cleanups = std::mem::take(&mut *self.cleanup.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }

    pub(crate) fn build_start(&self) -> Instant {
        self.build_start
    }
}

/// Per-rule mutable state. Copy-on-branch: scoped operations clone the
/// relevant field, run the scoped action against the clone, then
/// restore the original on every exit path.
#[derive(Clone, Default)]
pub struct Local {
    /// Keys currently being built, innermost (self) last.
    pub(crate) stack: Vec<ErasedKey>,
    /// Dependency groups in `apply` call order (`spec.md` §4.1).
    pub(crate) dependencies: Vec<Vec<ErasedKey>>,
    pub(crate) traces: Vec<Trace>,
    pub(crate) verbosity: Option<Verbosity>,
    pub(crate) block_apply_reason: Option<String>,
    pub(crate) lint_allow: Vec<std::sync::Arc<dyn Fn(&ErasedKey) -> bool + Send + Sync>>,
}

impl Local {
    pub(crate) fn for_key(stack: Vec<ErasedKey>) -> Self {
        Local {
            stack,
            ..Local::default()
        }
    }

    /// Flattens the dependency groups into the stored `depends` order,
    /// deduplicated by first occurrence: a key requested twice (once
    /// directly, once through a later group) is recorded once, at the
    /// position it was first depended upon (`spec.md` §3, "declaration
    /// order").
    pub(crate) fn flat_dependencies(&self) -> Vec<ErasedKey> {
        self.dependencies
            .iter()
            .flatten()
            .cloned()
            .collect::<indexmap::IndexSet<_>>()
            .into_iter()
            .collect()
    }
}

/// The façade passed to every rule body: `Global` by shared reference,
/// `Local` by exclusive reference, matching `spec.md` §4.1's "Global by
/// shared read-only reference; Local as a per-task owned struct".
pub struct Action<'a> {
    pub(crate) global: &'a Global,
    pub(crate) local: &'a mut Local,
}

impl<'a> Action<'a> {
    pub(crate) fn new(global: &'a Global, local: &'a mut Local) -> Self {
        Action { global, local }
    }

    /// Returns the build's options, invariant across the build.
    pub fn get_options(&self) -> &Options {
        &self.global.options
    }

    /// Samples the shared progress source.
    pub fn get_progress(&self) -> f64 {
        self.global.progress()
    }

    /// Registers `io` to run after the build completes successfully, in
    /// reverse-registration order.
    pub fn run_after(&self, io: impl FnOnce() + Send + 'static) {
        self.global.run_after(io);
    }

    /// Dependency stack of the currently executing rule, most recently
    /// pushed last.
    pub fn stack(&self) -> &[ErasedKey] {
        &self.local.stack
    }

    /// The key this rule is currently building, if any.
    pub fn current_key(&self) -> Option<&ErasedKey> {
        self.local.stack.last()
    }

    /// Scoped: if `act` fails, `cleanup` runs exactly once; if `act`
    /// succeeds, `cleanup` does not run.
    pub fn action_on_exception<T>(
        &mut self,
        act: impl FnOnce(&mut Action<'_>) -> Result<T>,
        cleanup: impl FnOnce(),
    ) -> Result<T> {
        match act(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                cleanup();
                Err(e)
            }
        }
    }

    /// Scoped: `cleanup` runs exactly once on both the success and
    /// failure paths. The register/run pair cannot be skipped by a
    /// panic unwinding through `act`, because it is driven by `Drop`.
    pub fn action_finally<T>(
        &mut self,
        act: impl FnOnce(&mut Action<'_>) -> Result<T>,
        cleanup: impl FnOnce(),
    ) -> Result<T> {
        struct RunOnDrop<F: FnOnce()> {
            cleanup: Option<F>,
        }
        impl<F: FnOnce()> Drop for RunOnDrop<F> {
            fn drop(&mut self) {
                if let Some(cleanup) = self.cleanup.take() {
                    cleanup();
                }
            }
        }
        let guard = RunOnDrop {
            cleanup: Some(cleanup),
        };
        let result = act(self);
        drop(guard);
        result
    }

    /// Scoped override of the local verbosity; restored on any exit path.
    pub fn with_verbosity<T>(
        &mut self,
        verbosity: Verbosity,
        act: impl FnOnce(&mut Action<'_>) -> T,
    ) -> T {
        let previous = self.local.verbosity;
        self.local.verbosity = Some(verbosity);
        let result = act(self);
        self.local.verbosity = previous;
        result
    }

    /// Equivalent to `with_verbosity(Quiet, act)`.
    pub fn quietly<T>(&mut self, act: impl FnOnce(&mut Action<'_>) -> T) -> T {
        self.with_verbosity(Verbosity::Quiet, act)
    }

    fn effective_verbosity(&self) -> Verbosity {
        self.local.verbosity.unwrap_or(self.global.options.verbosity)
    }

    /// Emits `msg` via the output sink iff the local verbosity is at
    /// least `v`. Emissions from different rules are serialised by the
    /// sink itself (`spec.md` §4.1).
    pub fn put_when(&self, v: Verbosity, msg: &str) {
        if self.effective_verbosity() >= v {
            (self.global.sink)(v, msg);
        }
    }

    /// Runs `io`, capturing a time-stamped span. Emits one info message
    /// at `Normal` verbosity (suppressed under `quietly`, per the Open
    /// Question resolution in `SPEC_FULL.md` §9) and appends the span to
    /// `Local.traces` regardless of whether the message was suppressed.
    pub fn traced<T>(&mut self, msg: &str, io: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = self.global.now();
        let result = io();
        let stop = self.global.now();

        let top = self
            .current_key()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "<top level>".to_string());
        self.put_when(Verbosity::Normal, &format!("# {msg} (for {top})"));

        self.local.traces.push(Trace {
            command: msg.to_string(),
            start,
            stop,
        });

        result
    }

    /// Scoped: inside `act`, `apply` fails with `BlockedApply(reason)`.
    pub fn block_apply<T>(
        &mut self,
        reason: impl Into<String>,
        act: impl FnOnce(&mut Action<'_>) -> T,
    ) -> T {
        let previous = self.local.block_apply_reason.take();
        self.local.block_apply_reason = Some(reason.into());
        let result = act(self);
        self.local.block_apply_reason = previous;
        result
    }

    /// Scoped: clears any `blockApply` in effect for the duration of `act`.
    pub fn unsafe_allow_apply<T>(&mut self, act: impl FnOnce(&mut Action<'_>) -> T) -> T {
        let previous = self.local.block_apply_reason.take();
        let result = act(self);
        self.local.block_apply_reason = previous;
        result
    }

    /// The dependency resolver: requests `keys`, blocking until every
    /// one of them is resolved. See `crate::apply` for the algorithm.
    pub fn apply(&mut self, keys: &[ErasedKey]) -> Result<Vec<ErasedValue>> {
        if let Some(reason) = self.local.block_apply_reason.clone() {
            return Err(Error::BlockedApply { reason });
        }
        crate::apply::apply(self.global, self.local, keys)
    }

    /// Declares a read of `key` for lint-mode auditing
    /// (`spec.md` §4.5). A no-op unless `Options::lint` is enabled.
    pub fn lint_track_read(&mut self, keys: &[ErasedKey]) {
        crate::lint::track_read(self.global, self.local, keys);
    }

    /// Declares a write of `key` for lint-mode auditing (`spec.md` §4.5).
    pub fn lint_track_write(&mut self, keys: &[ErasedKey]) {
        crate::lint::track_write(self.global, self.local, keys);
    }

    /// Scoped: reads of keys matching `predicate` are allowed without
    /// being `apply`-ed or owned, for the duration of `act`.
    pub fn lint_track_allow<T>(
        &mut self,
        predicate: impl Fn(&ErasedKey) -> bool + Send + Sync + 'static,
        act: impl FnOnce(&mut Action<'_>) -> T,
    ) -> T {
        self.local.lint_allow.push(std::sync::Arc::new(predicate));
        let result = act(self);
        self.local.lint_allow.pop();
        result
    }
}
