//! Lint-mode auditing: untracked reads/writes, and the condition-4
//! "depended upon after being used" check, gated on `Lint::Change` vs
//! `Lint::Basic`.

mod support;

use kiln::{Error, Lint, LintViolation, Options};

use support::{dep, key, Rules};

#[test]
fn untracked_read_is_rejected_even_under_basic() {
    support::init_logging();
    let rules = Rules::new();
    rules.set_const("leaf", "L");
    rules.set("top", |action| {
        // Reads "leaf" directly without ever `apply`-ing it.
        action.lint_track_read(&[key("leaf")]);
        Ok("T".to_string())
    });

    let result = kiln::run(Options::new().with_lint(Lint::Basic), rules.registry(), &[key("top")]);
    match result {
        Err(Error::LintViolation(LintViolation::UntrackedRead { key, .. })) => {
            assert_eq!(key.to_string(), "leaf");
        }
        other => panic!("expected UntrackedRead, got {other:?}"),
    }
}

#[test]
fn reading_a_source_key_before_applying_it_is_fine_under_change() {
    support::init_logging();
    let rules = Rules::new();
    rules.set_const("leaf", "L");
    rules.set("top", |action| {
        // "leaf" has no dependencies of its own, so reading it directly
        // ahead of the `apply` that authorises it is harmless.
        action.lint_track_read(&[key("leaf")]);
        dep(action, "leaf")
    });

    let report = kiln::run(Options::new().with_lint(Lint::Change), rules.registry(), &[key("top")]).unwrap();
    assert!(report.entries.iter().any(|e| e.name == "top"));
}

#[test]
fn depending_on_a_non_source_key_already_read_is_rejected_under_change() {
    support::init_logging();
    let rules = Rules::new();
    rules.set_const("leaf", "L");
    rules.set("mid", |action| dep(action, "leaf"));
    rules.set("top", |action| {
        // "mid" itself depends on "leaf", so it is not a source key;
        // reading it directly and then declaring it via `apply` is the
        // exact shape condition 4 rejects.
        action.lint_track_read(&[key("mid")]);
        dep(action, "mid")
    });

    let result = kiln::run(Options::new().with_lint(Lint::Change), rules.registry(), &[key("top")]);
    match result {
        Err(Error::LintViolation(LintViolation::DependedUponAfterUse { key, .. })) => {
            assert_eq!(key.to_string(), "mid");
        }
        other => panic!("expected DependedUponAfterUse, got {other:?}"),
    }
}

#[test]
fn same_shape_is_allowed_under_basic_since_it_skips_condition_4() {
    support::init_logging();
    let rules = Rules::new();
    rules.set_const("leaf", "L");
    rules.set("mid", |action| dep(action, "leaf"));
    rules.set("top", |action| {
        action.lint_track_read(&[key("mid")]);
        dep(action, "mid")
    });

    let report = kiln::run(Options::new().with_lint(Lint::Basic), rules.registry(), &[key("top")]).unwrap();
    assert!(report.entries.iter().any(|e| e.name == "top"));
}

#[test]
fn reading_an_already_applied_non_source_key_is_fine_regardless_of_order() {
    support::init_logging();
    let rules = Rules::new();
    rules.set_const("leaf", "L");
    rules.set("mid", |action| dep(action, "leaf"));
    rules.set("top", |action| {
        // "mid" is depended upon *first*, then read directly — the
        // mirror image of the rejected shape above. Condition 2 grants
        // this immediately, at read time, regardless of "mid" having
        // dependencies of its own.
        dep(action, "mid")?;
        action.lint_track_read(&[key("mid")]);
        Ok("T".to_string())
    });

    let report = kiln::run(Options::new().with_lint(Lint::Change), rules.registry(), &[key("top")]).unwrap();
    assert!(report.entries.iter().any(|e| e.name == "top"));
}

#[test]
fn a_rule_reading_its_own_key_is_not_an_untracked_read() {
    support::init_logging();
    let rules = Rules::new();
    rules.set("top", |action| {
        // Condition 1: the rule reading the very key it is building.
        action.lint_track_read(&[key("top")]);
        Ok("T".to_string())
    });

    let report = kiln::run(Options::new().with_lint(Lint::Basic), rules.registry(), &[key("top")]).unwrap();
    assert!(report.entries.iter().any(|e| e.name == "top"));
}

#[test]
fn untracked_write_is_rejected() {
    support::init_logging();
    let rules = Rules::new();
    rules.set("top", |action| {
        action.lint_track_write(&[key("someone-elses-key")]);
        Ok("T".to_string())
    });

    let result = kiln::run(Options::new().with_lint(Lint::Basic), rules.registry(), &[key("top")]);
    match result {
        Err(Error::LintViolation(LintViolation::UntrackedWrite { key, .. })) => {
            assert_eq!(key.to_string(), "someone-elses-key");
        }
        other => panic!("expected UntrackedWrite, got {other:?}"),
    }
}

#[test]
fn lint_is_a_no_op_when_disabled() {
    support::init_logging();
    let rules = Rules::new();
    rules.set("top", |action| {
        // Would be flagged under any lint level; with lint off this
        // must simply succeed.
        action.lint_track_read(&[key("nonexistent")]);
        Ok("T".to_string())
    });

    let report = kiln::run(Options::new().with_lint(Lint::None), rules.registry(), &[key("top")]).unwrap();
    assert!(report.entries.iter().any(|e| e.name == "top"));
}
