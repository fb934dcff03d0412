#![warn(rust_2018_idioms)]

//! `kiln` is a demand-driven, dependency-tracking build engine core.
//!
//! Rules are registered against a [`Registry`], keyed by an opaque,
//! type-erased [`ErasedKey`]; [`run`] resolves a set of wanted keys by
//! recursively `apply`-ing their dependencies, rebuilding only what a
//! [`Database`]-backed staleness check says has actually gone stale
//! since the last run. There is no file-path layer, no command runner,
//! and no option parser baked in — those belong to whatever embeds this
//! crate (`spec.md` §1).

mod apply;
pub mod context;
pub mod database;
pub mod debug;
pub mod error;
mod key;
pub mod lint;
pub mod options;
pub mod registry;
pub mod report;
mod runtime;
mod scheduler;

pub use context::{Action, Trace};
pub use database::{Database, Entry};
pub use error::{Error, Result, UserError};
pub use key::{ErasedKey, Run, TypeTag};
pub use lint::LintViolation;
pub use options::{ChangeMode, Lint, Options, Verbosity};
pub use registry::{BuildFn, ChangeResult, CompareFn, DecodeFn, ErasedValue, MatchFn, RuleDef, Registry};
pub use report::Report;

use std::sync::Arc;

use crate::context::Global;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// Resolves every key in `wants` against `rules`, per `spec.md` §6.
///
/// Loads the database named by `options.db_file` (if any), builds or
/// validates each wanted key and its transitive dependencies using a
/// pool of `options.parallelism` workers, checkpoints the database, and
/// (if `options.report_file` is set) writes the profile report.
///
/// In staunch mode (`options.staunch`), a failing key does not abort
/// the remaining top-level wants; every error collected is returned
/// together once the build settles.
pub fn run(options: Options, registry: Registry, wants: &[ErasedKey]) -> Result<Report> {
    let options = Arc::new(options);
    let registry = Arc::new(registry);

    let db = Arc::new(Database::load(options.db_file.as_deref())?);
    let runtime = Arc::new(Runtime::new(db.last_persisted_run()));
    let scheduler = Arc::new(Scheduler::new(options.parallelism));
    let global = Global::new(options.clone(), db.clone(), registry, runtime.clone(), scheduler.clone());
    global.set_progress_total(wants.len());

    let mut local = context::Local::for_key(Vec::new());
    let mut first_error = None;

    for want in wants {
        // The build-wide timeout is only ever checked at this outermost
        // wait, between top-level wants — never inside a single `apply`
        // (`spec.md` §5, "no per-rule timeouts in the core").
        if let Some(limit) = options.timeout {
            let elapsed = global.now();
            if elapsed >= limit.as_secs_f64() {
                let timeout_err = Error::Timeout {
                    elapsed,
                    limit: limit.as_secs_f64(),
                };
                if options.staunch {
                    runtime.record_staunch_error(timeout_err);
                    break;
                } else {
                    first_error = Some(timeout_err);
                    break;
                }
            }
        }
        let outcome = {
            let mut action = Action::new(&global, &mut local);
            action.apply(std::slice::from_ref(want))
        };
        match outcome {
            Ok(_) => global.bump_progress_done(),
            Err(e) => {
                if options.staunch {
                    runtime.record_staunch_error(e);
                } else {
                    first_error = Some(e);
                    break;
                }
            }
        }
    }

    global.run_after_hooks();
    global.run_cleanup();

    db.checkpoint(runtime.current_run())?;
    let report = Report::from_database(&db, runtime.current_run());
    if let Some(path) = &options.report_file {
        report
            .write_to(path)
            .map_err(|e| Error::Internal(format!("writing report: {e}")))?;
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    let mut staunch_errors = runtime.take_staunch_errors();
    match staunch_errors.len() {
        0 => {}
        1 => return Err(staunch_errors.remove(0)),
        _ => return Err(Error::Multiple(staunch_errors)),
    }

    Ok(report)
}
