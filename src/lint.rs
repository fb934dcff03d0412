//! Lint-mode auditing: tracked reads/writes and the deferred
//! "depended upon after being used" check, per `spec.md` §4.5.
//!
//! The access log shape is the same idea as a dataflow node's recorded
//! reads and writes: a flat, ordered list of [`Access`] entries that a
//! checker walks after the fact rather than a live set that's
//! maintained incrementally.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::key::ErasedKey;

/// A single tracked access to a key, recorded in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// The rule read the named key's value without depending on it via
    /// `apply` (or is double-checking a value it already depends on).
    Read(ErasedKey),
    /// The rule produced or modified the named key outside of the
    /// normal build-one-key-per-rule-invocation path.
    Write(ErasedKey),
}

impl Access {
    /// The key this access refers to, regardless of kind.
    pub fn key(&self) -> &ErasedKey {
        match self {
            Access::Read(k) | Access::Write(k) => k,
        }
    }
}

/// The ordered accesses recorded for one rule invocation. Most rules
/// read a handful of keys directly, if any, so the common case stays
/// inline rather than heap-allocated.
#[derive(Debug, Clone, Default)]
pub struct AccessLog(SmallVec<[Access; 4]>);

impl AccessLog {
    /// An empty log.
    pub fn new() -> Self {
        AccessLog(SmallVec::new())
    }

    fn push(&mut self, access: Access) {
        self.0.push(access);
    }

    /// Every recorded access, in order.
    pub fn as_slice(&self) -> &[Access] {
        &self.0
    }

    /// `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a lint-mode audit rejected a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintViolation {
    /// A rule read a key's value without going through `apply` and
    /// without an explicit `lintTrackAllow` exemption.
    UntrackedRead {
        /// The rule whose audit failed.
        rule: ErasedKey,
        /// The key read without being declared a dependency.
        key: ErasedKey,
    },
    /// A rule wrote to a key it does not own.
    UntrackedWrite {
        /// The rule whose audit failed.
        rule: ErasedKey,
        /// The key written without authorization.
        key: ErasedKey,
    },
    /// A key was depended upon (via `apply`) after this rule had
    /// already read it directly, earlier in the same invocation — the
    /// dependency was declared too late to be useful (condition 4,
    /// `spec.md` §4.5).
    DependedUponAfterUse {
        /// The rule whose audit failed.
        rule: ErasedKey,
        /// The key in question.
        key: ErasedKey,
    },
}

impl fmt::Display for LintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintViolation::UntrackedRead { rule, key } => {
                write!(f, "{rule} read {key} without declaring it as a dependency")
            }
            LintViolation::UntrackedWrite { rule, key } => {
                write!(f, "{rule} wrote {key} without authorization")
            }
            LintViolation::DependedUponAfterUse { rule, key } => {
                write!(
                    f,
                    "{rule} depended on {key} after already having read it directly"
                )
            }
        }
    }
}

impl std::error::Error for LintViolation {}

/// Per-build lint bookkeeping, shared across every worker thread.
///
/// Deferred checks (condition 4) cannot be resolved until the rule
/// invocation that performed the early read has itself finished and its
/// full dependency list is known, so violations already found are
/// buffered here rather than raised immediately.
pub struct LintState {
    level: crate::options::Lint,
    /// Reads/writes recorded per currently-in-flight rule invocation,
    /// keyed by the rule's own key.
    in_flight: Mutex<FxHashMap<ErasedKey, AccessLog>>,
    /// Violations discovered by deferred checks, collected for staunch
    /// reporting at the end of the build.
    deferred: Mutex<Vec<LintViolation>>,
}

impl LintState {
    /// Creates lint state at the given audit level (`spec.md` §4.5,
    /// §6). `Lint::Basic` tracks reads/writes but never inspects
    /// dependency shape, so condition 4 is skipped even though the
    /// same access log is recorded; `Lint::Change` additionally runs
    /// it.
    pub fn new(level: crate::options::Lint) -> Self {
        LintState {
            level,
            in_flight: Mutex::new(FxHashMap::default()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Whether auditing is turned on at all.
    pub fn enabled(&self) -> bool {
        !matches!(self.level, crate::options::Lint::None)
    }

    /// Starts tracking a fresh invocation of `rule`.
    pub fn begin(&self, rule: &ErasedKey) {
        if !self.enabled() {
            return;
        }
        self.in_flight.lock().insert(rule.clone(), AccessLog::new());
    }

    /// Records a read, unless `allow` exempts it.
    pub fn track_read(&self, rule: &ErasedKey, keys: &[ErasedKey], allow: &[Arc<dyn Fn(&ErasedKey) -> bool + Send + Sync>]) {
        if !self.enabled() {
            return;
        }
        let mut in_flight = self.in_flight.lock();
        let Some(log) = in_flight.get_mut(rule) else {
            return;
        };
        for key in keys {
            if allow.iter().any(|p| p(key)) {
                continue;
            }
            log.push(Access::Read(key.clone()));
        }
    }

    /// Records a write, unless `allow` exempts it.
    pub fn track_write(&self, rule: &ErasedKey, keys: &[ErasedKey], allow: &[Arc<dyn Fn(&ErasedKey) -> bool + Send + Sync>]) {
        if !self.enabled() {
            return;
        }
        let mut in_flight = self.in_flight.lock();
        let Some(log) = in_flight.get_mut(rule) else {
            return;
        };
        for key in keys {
            if allow.iter().any(|p| p(key)) {
                continue;
            }
            log.push(Access::Write(key.clone()));
        }
    }

    /// Finishes tracking `rule`, checking its recorded accesses against
    /// the dependency groups it actually declared via `apply`.
    ///
    /// Condition 4 ("depended upon after being used") is checked here,
    /// once the rule's final, flattened dependency list is known — this
    /// is the "deferred" part of the check. A tracked read of `k` is
    /// justified only if `k` both ends up declared as a dependency and
    /// is itself a source key (no dependencies of its own); a declared
    /// dependency that has dependencies of its own was, by definition,
    /// read before the `apply` that was supposed to authorise it, since
    /// a non-source key can only have been read directly by cheating the
    /// database rather than going through `apply` first. `has_own_deps`
    /// answers that per key from the already-resolved entry, since a
    /// declared dependency is always resolved by the time its owning
    /// rule finishes.
    pub fn finish(
        &self,
        rule: &ErasedKey,
        declared_dependencies: &[ErasedKey],
        has_own_deps: impl Fn(&ErasedKey) -> bool,
    ) -> Result<(), LintViolation> {
        if !self.enabled() {
            return Ok(());
        }
        let Some(log) = self.in_flight.lock().remove(rule) else {
            return Ok(());
        };
        let check_condition_4 = matches!(self.level, crate::options::Lint::Change);
        let declared: FxHashSet<&ErasedKey> = declared_dependencies.iter().collect();
        for access in log.as_slice() {
            match access {
                Access::Read(key) => {
                    if key == rule {
                        // Condition 1: a rule reading its own output
                        // needs no authorisation (`spec.md` §4.5),
                        // mirroring the write arm below.
                        continue;
                    }
                    if !declared.contains(key) {
                        let violation = LintViolation::UntrackedRead {
                            rule: rule.clone(),
                            key: key.clone(),
                        };
                        self.deferred.lock().push(violation.clone());
                        return Err(violation);
                    }
                    if check_condition_4 && has_own_deps(key) {
                        let violation = LintViolation::DependedUponAfterUse {
                            rule: rule.clone(),
                            key: key.clone(),
                        };
                        self.deferred.lock().push(violation.clone());
                        return Err(violation);
                    }
                }
                Access::Write(key) => {
                    if key != rule {
                        let violation = LintViolation::UntrackedWrite {
                            rule: rule.clone(),
                            key: key.clone(),
                        };
                        self.deferred.lock().push(violation.clone());
                        return Err(violation);
                    }
                }
            }
        }
        Ok(())
    }

    /// Every violation found so far, for staunch-mode end-of-build
    /// reporting.
    pub fn violations(&self) -> Vec<LintViolation> {
        self.deferred.lock().clone()
    }
}

/// Declares a read for the rule currently on top of `local.stack`.
///
/// Free function (rather than a method on [`Action`]) so `context.rs`
/// can call it without a circular borrow of `Action` itself.
pub(crate) fn track_read(global: &crate::context::Global, local: &mut crate::context::Local, keys: &[ErasedKey]) {
    let Some(rule) = local.stack.last().cloned() else {
        return;
    };
    // Condition 2 (`spec.md` §4.5) is checked here, immediately, rather
    // than deferred to `LintState::finish`: a key this rule has already
    // `apply`-ed earlier in the same invocation is justified the moment
    // it is read, regardless of whether it has dependencies of its own.
    // Only a read of a key *not yet* applied is genuinely unresolved at
    // this point, so only those are handed to `finish` for the deferred
    // check.
    let already_applied: FxHashSet<&ErasedKey> = local.dependencies.iter().flatten().collect();
    let unresolved: Vec<ErasedKey> = keys.iter().filter(|k| !already_applied.contains(k)).cloned().collect();
    if unresolved.is_empty() {
        return;
    }
    global.lint.track_read(&rule, &unresolved, &local.lint_allow);
}

/// Declares a write for the rule currently on top of `local.stack`.
pub(crate) fn track_write(global: &crate::context::Global, local: &mut crate::context::Local, keys: &[ErasedKey]) {
    let Some(rule) = local.stack.last().cloned() else {
        return;
    };
    global.lint.track_write(&rule, keys, &local.lint_allow);
}
