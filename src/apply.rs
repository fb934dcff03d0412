//! The Dependency Resolver: `apply`, per `spec.md` §4.2.
//!
//! Cycle detection walks the caller's own stack rather than a shared
//! graph (`spec.md` §9): a key is only ever "in progress" on the one
//! lineage of calls that put it there, and that lineage is exactly
//! what `stack` carries from parent to child as work is spawned.

use log::debug;

use crate::context::{Action, Global, Local};
use crate::database::{Entry, Ownership};
use crate::error::{Error, Result};
use crate::key::ErasedKey;
use crate::registry::{ChangeResult, ErasedValue};

/// Resolves `keys`, blocking until every one of them is settled for
/// this run. On the first failure, returns the first one in input
/// order; the caller's remaining dependencies are not retried
/// (`spec.md` §4.1, §4.2).
///
/// `keys` are resolved concurrently, not one at a time: a rule that
/// `apply`s several independent keys in one call (`spec.md` §8, S6)
/// must see them start together, not queue behind each other. The
/// calling thread relinquishes its own scheduler permit for the
/// duration (via `suspend_while`) since it is blocked here rather than
/// running a rule body itself.
pub(crate) fn apply(global: &Global, local: &mut Local, keys: &[ErasedKey]) -> Result<Vec<ErasedValue>> {
    let stack = local.stack.clone();

    let resolved: Vec<Result<Entry>> = global.scheduler.suspend_while(|| match keys {
        [] => Vec::new(),
        [key] => vec![resolve_one(global, &stack, key)],
        _ => std::thread::scope(|scope| {
            let handles: Vec<_> = keys
                .iter()
                .map(|key| scope.spawn(|| resolve_one(global, &stack, key)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Error::Internal("rule body thread panicked".into()))))
                .collect()
        }),
    });

    let mut values = Vec::with_capacity(keys.len());
    for result in resolved {
        values.push(result?.value);
    }
    local.dependencies.push(keys.to_vec());
    Ok(values)
}

fn resolve_one(global: &Global, stack: &[ErasedKey], key: &ErasedKey) -> Result<Entry> {
    if stack.contains(key) {
        let mut cycle = stack.to_vec();
        cycle.push(key.clone());
        debug!("cycle detected: {cycle:?}");
        return Err(Error::Cycle { cycle });
    }

    loop {
        match global.db.begin(key) {
            Ownership::Resolved(entry) => return Ok(entry),
            Ownership::Failed => {
                return Err(Error::Internal(format!(
                    "{key} failed to build earlier in this run"
                )))
            }
            Ownership::Wait(outcome) => {
                global.scheduler.suspend_while(|| {
                    let (lock, cvar) = &*outcome;
                    let mut done = lock.lock();
                    while done.is_none() {
                        cvar.wait(&mut done);
                    }
                });
            }
            Ownership::Build { previous } => return build_key(global, stack, key, previous),
        }
    }
}

fn build_key(global: &Global, stack: &[ErasedKey], key: &ErasedKey, previous: Option<Entry>) -> Result<Entry> {
    let Some(rule) = global.registry.find(key) else {
        global.db.fail(key);
        return Err(Error::MissingRule { key: key.clone() });
    };

    let mut stack_with_self = stack.to_vec();
    stack_with_self.push(key.clone());

    if let Some(prev) = &previous {
        match validate(global, &stack_with_self, prev) {
            // Fresh by dependency: bump built_run to the current run
            // without re-running the rule; changed_run is left alone
            // since the value itself didn't change (spec.md §4.2).
            Ok(true) => {
                debug!("{key}: fresh by dependency, reusing prior value");
                let value = rule.decode(prev.value.bytes());
                let entry = Entry {
                    key: key.clone(),
                    value,
                    built_run: global.runtime.current_run(),
                    changed_run: prev.changed_run,
                    dependencies: prev.dependencies.clone(),
                    execution_time: prev.execution_time,
                    traces: prev.traces.clone(),
                };
                global.db.finish(key, entry.clone());
                return Ok(entry);
            }
            Ok(false) => {}
            Err(e) => {
                global.db.fail(key);
                return Err(e);
            }
        }
    }

    // A prior failure elsewhere (non-staunch) put the build in shutdown
    // mode: in-flight rule bodies finish naturally, but no new one
    // starts (`spec.md` §5, "Cancellation").
    if global.runtime.is_shutting_down() {
        debug!("{key}: build is shutting down, refusing to start");
        global.db.fail(key);
        return Err(Error::Cancelled { key: key.clone() });
    }

    global.lint.begin(key);
    let mut nested_local = Local::for_key(stack_with_self);
    let start = global.now();
    let built = global.scheduler.run_with_permit(|| {
        let mut action = Action::new(global, &mut nested_local);
        rule.build(&mut action, key)
    });
    let stop = global.now();

    match built {
        Ok(new_value) => {
            let declared = nested_local.flat_dependencies();
            let has_own_deps = |dep_key: &ErasedKey| {
                global
                    .db
                    .peek_resolved(dep_key)
                    .is_some_and(|e| !e.dependencies.is_empty())
            };
            if let Err(violation) = global.lint.finish(key, &declared, has_own_deps) {
                global.db.fail(key);
                if !global.options.staunch {
                    global.runtime.begin_shutdown();
                }
                return Err(Error::LintViolation(violation));
            }

            let current_run = global.runtime.current_run();
            let old_decoded = previous.as_ref().map(|p| rule.decode(p.value.bytes()));
            let change = match &old_decoded {
                Some(old) => rule.compare(old, &new_value, global.options.change_mode),
                None => ChangeResult::Changed,
            };
            let changed_run = match (change, &previous) {
                (ChangeResult::Changed, _) => current_run,
                (_, Some(prev)) => prev.changed_run,
                (_, None) => current_run,
            };

            let entry = Entry {
                key: key.clone(),
                value: new_value,
                built_run: current_run,
                changed_run,
                dependencies: declared,
                execution_time: stop - start,
                traces: nested_local.traces,
            };
            global.db.finish(key, entry.clone());
            Ok(entry)
        }
        Err(source) => {
            global.db.fail(key);
            if !global.options.staunch {
                debug!("{key}: failed, entering shutdown (non-staunch)");
                global.runtime.begin_shutdown();
            }
            Err(Error::User {
                stack: crate::error::StackPrefix::new(nested_local.stack),
                source,
            })
        }
    }
}

/// Checks whether `prev` is still up to date: every dependency it
/// recorded last time is itself re-validated (recursively), and `prev`
/// is current iff none of them changed since `prev` was built
/// (`spec.md` §4.2, §4.4).
fn validate(global: &Global, stack_with_self: &[ErasedKey], prev: &Entry) -> Result<bool> {
    for dep in &prev.dependencies {
        let dep_entry = resolve_one(global, stack_with_self, dep)?;
        if dep_entry.changed_run > prev.built_run {
            return Ok(false);
        }
    }
    Ok(true)
}
