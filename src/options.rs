//! Build options, per `spec.md` §6. Intentionally independent of any
//! CLI flag parser — option parsing is out of scope (`spec.md` §1).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{ClockFn, OutputSink};

/// How verbose the output sink should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verbosity {
    /// No output at all.
    Silent,
    /// Only warnings and errors.
    Quiet,
    /// The default: info-level messages (`traced` spans, rule progress).
    Normal,
    /// Verbose progress output.
    Loud,
    /// Everything, including internal scheduling diagnostics.
    Diagnostic,
}

/// Lint-mode audit level, per `spec.md` §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lint {
    /// No auditing.
    None,
    /// Audit tracked reads/writes but do not inspect dependency shape.
    Basic,
    /// Additionally check "depended upon after being used".
    Change,
}

/// Which signal a rule's staleness decision is based on, per `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// Only consult the rule's modification-time-style comparator.
    ModtimeOnly,
    /// Consult modification time first, falling back to a content digest.
    ModtimeAndDigest,
    /// Always consult the content digest comparator.
    DigestOnly,
}

/// Build-wide options (`spec.md` §6).
pub struct Options {
    /// Worker pool size. Defaults to the available parallelism.
    pub parallelism: usize,
    /// If `true`, continue past failures and report all of them at the
    /// end (`spec.md` §4.3, §7).
    pub staunch: bool,
    /// Lint-mode audit level.
    pub lint: Lint,
    /// Default output verbosity.
    pub verbosity: Verbosity,
    /// Where to write the profile report JSON, if anywhere.
    pub report_file: Option<PathBuf>,
    /// Where the on-disk database lives.
    pub db_file: Option<PathBuf>,
    /// Build-wide timeout, applied at the outermost wait.
    pub timeout: Option<Duration>,
    /// Which staleness signal rules should prefer.
    pub change_mode: ChangeMode,
    /// The `(Verbosity, String) -> ()` output sink.
    pub sink: OutputSink,
    /// `() -> f64`, seconds since build start.
    pub clock: ClockFn,
}

impl Options {
    /// Options with every default except for `wants`, which callers
    /// supply separately to [`crate::run`].
    pub fn new() -> Self {
        Options::default()
    }

    /// Builder-style setter for `parallelism`.
    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    /// Builder-style setter for `staunch`.
    pub fn with_staunch(mut self, staunch: bool) -> Self {
        self.staunch = staunch;
        self
    }

    /// Builder-style setter for `lint`.
    pub fn with_lint(mut self, lint: Lint) -> Self {
        self.lint = lint;
        self
    }

    /// Builder-style setter for `verbosity`.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Builder-style setter for `report_file`.
    pub fn with_report_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_file = Some(path.into());
        self
    }

    /// Builder-style setter for `db_file`.
    pub fn with_db_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_file = Some(path.into());
        self
    }

    /// Builder-style setter for `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder-style setter for `change_mode`.
    pub fn with_change_mode(mut self, mode: ChangeMode) -> Self {
        self.change_mode = mode;
        self
    }

    /// Overrides the output sink.
    pub fn with_sink(mut self, sink: impl Fn(Verbosity, &str) + Send + Sync + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Overrides the timestamp source (for deterministic tests).
    pub fn with_clock(mut self, clock: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            staunch: false,
            lint: Lint::None,
            verbosity: Verbosity::Normal,
            report_file: None,
            db_file: None,
            timeout: None,
            change_mode: ChangeMode::ModtimeAndDigest,
            sink: Arc::new(|verbosity, msg| {
                log::info!("{msg}");
                if verbosity >= Verbosity::Normal {
                    println!("{msg}");
                }
            }),
            clock: {
                let start = std::time::Instant::now();
                Arc::new(move || start.elapsed().as_secs_f64())
            },
        }
    }
}
