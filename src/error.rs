//! Error kinds raised by the engine, per `spec.md` §7.

use std::fmt;

use crate::key::ErasedKey;

/// An opaque application-level error raised from within a rule body.
pub type UserError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every error kind the engine can report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A rule body raised an application-level failure.
    #[error("{stack}rule failed: {source}")]
    User {
        /// The dependency stack, most-recent-first, rendered for the user.
        stack: StackPrefix,
        /// The underlying error the rule body raised.
        #[source]
        source: UserError,
    },

    /// A dependency cycle was detected before any participant ran twice.
    #[error("dependency cycle detected: {}", render_cycle(.cycle))]
    Cycle {
        /// The stack up to and including the repeated key.
        cycle: Vec<ErasedKey>,
    },

    /// No registered rule's match function claimed this key.
    #[error("no rule matches key: {key}")]
    MissingRule {
        /// The unmatched key.
        key: ErasedKey,
    },

    /// A lint-mode audit found an unrecorded read or write.
    #[error("lint violation: {0}")]
    LintViolation(#[from] crate::lint::LintViolation),

    /// `apply` was called from inside a `blockApply` scope.
    #[error("apply blocked: {reason}")]
    BlockedApply {
        /// The reason string passed to `blockApply`.
        reason: String,
    },

    /// The on-disk database failed to decode.
    #[error("database corrupt: {0} (delete the database file to recover)")]
    DatabaseCorrupt(String),

    /// The build entered shutdown mode (a prior failure, non-staunch)
    /// before this key's rule body got a chance to start.
    #[error("build cancelled before {key} could start")]
    Cancelled {
        /// The key that was about to start building.
        key: ErasedKey,
    },

    /// An invariant the engine relies on did not hold. Never expected.
    #[error("internal engine error: {0}")]
    Internal(String),

    /// The build-wide timeout (`Options::timeout`) elapsed. Checked only
    /// at the outermost wait, not per rule (`spec.md` §5).
    #[error("build timed out after {elapsed:.3}s (limit {limit:.3}s)")]
    Timeout {
        /// Seconds elapsed since the build started.
        elapsed: f64,
        /// The configured `Options::timeout`, in seconds.
        limit: f64,
    },

    /// Staunch mode collected more than one independent failure; every
    /// one of them is reported together (`spec.md` §7, "summary report
    /// lists each unique error once").
    #[error("{} errors occurred:\n{}", .0.len(), render_multiple(.0))]
    Multiple(Vec<Error>),
}

fn render_cycle(cycle: &[ErasedKey]) -> String {
    cycle
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_multiple(errors: &[Error]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

/// The dependency stack (most-recent-first) prefixed onto user errors,
/// per `spec.md` §7: "User-facing errors are prefixed with the
/// dependency stack... so the user can locate the failing rule."
#[derive(Debug, Clone, Default)]
pub struct StackPrefix(Vec<ErasedKey>);

impl StackPrefix {
    /// Builds a prefix from a stack, most-recent-first.
    pub fn new(stack: Vec<ErasedKey>) -> Self {
        StackPrefix(stack)
    }
}

impl fmt::Display for StackPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "[")?;
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " <- ")?;
            }
            write!(f, "{key}")?;
        }
        write!(f, "] ")
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
