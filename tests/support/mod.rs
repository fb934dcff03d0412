//! Shared harness for the integration tests: a single rule type, keyed
//! by name, whose build function is looked up at call time from a
//! shared table. Lets each scenario register its rules as plain
//! closures without inventing a new `TypeTag` per test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kiln::{Action, BuildFn, CompareFn, ErasedKey, ErasedValue, MatchFn, Registry, RuleDef, TypeTag, UserError};

const NAMED: &str = "kiln-test::named";

type Builder = Arc<dyn Fn(&mut Action<'_>) -> Result<String, UserError> + Send + Sync>;

/// A registry of named string-valued rules, swappable between runs
/// (tests that replay a build with a changed source mutate this table
/// between `kiln::run` calls).
#[derive(Clone, Default)]
pub struct Rules(Arc<Mutex<HashMap<String, Builder>>>);

impl Rules {
    pub fn new() -> Self {
        Rules::default()
    }

    pub fn set(&self, name: &str, build: impl Fn(&mut Action<'_>) -> Result<String, UserError> + Send + Sync + 'static) {
        self.0.lock().unwrap().insert(name.to_string(), Arc::new(build));
    }

    /// A rule that returns a fixed string, ignoring dependencies.
    pub fn set_const(&self, name: &str, value: &str) {
        let value = value.to_string();
        self.set(name, move |_action| Ok(value.clone()));
    }

    pub fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        registry.register(self.rule_def());
        registry
    }

    /// Like [`Rules::registry`], but with the rule's comparator
    /// overridden — used by tests that need a non-default change
    /// detector (`spec.md` §4.4).
    pub fn registry_with_compare(&self, compare: CompareFn) -> Registry {
        let mut registry = Registry::new();
        registry.register(self.rule_def().with_compare(compare));
        registry
    }

    fn rule_def(&self) -> RuleDef {
        let rules = self.0.clone();
        let matcher: MatchFn = Arc::new(|key| key.tag().name() == NAMED);
        let build: BuildFn = Arc::new(move |action, key| {
            let name = key_name(key);
            let builder = rules
                .lock()
                .unwrap()
                .get(&name)
                .cloned()
                .ok_or_else(|| -> UserError { format!("no rule registered for {name}").into() })?;
            let value = builder(action)?;
            Ok(ErasedValue::new(value.clone().into_bytes(), value))
        });
        let decode: kiln::DecodeFn = Arc::new(|bytes| {
            let s = String::from_utf8(bytes.to_vec()).expect("test keys are always utf-8 names");
            Arc::new(s)
        });
        RuleDef::new(TypeTag::new(NAMED), matcher, build).with_decode(decode)
    }
}

/// Routes the engine's `debug!`/`trace!` instrumentation through the
/// test harness; safe to call from every test since `try_init` is a
/// no-op after the first call. Run with `RUST_LOG=kiln=trace` to see it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(name: &str) -> ErasedKey {
    ErasedKey::new(TypeTag::new(NAMED), name.as_bytes().to_vec(), name.to_string())
}

fn key_name(key: &ErasedKey) -> String {
    String::from_utf8(key.bytes().to_vec()).expect("test keys are always utf-8 names")
}

/// Depends on `name`, returning its string value. For use inside a rule
/// body passed to [`Rules::set`].
pub fn dep(action: &mut Action<'_>, name: &str) -> Result<String, UserError> {
    let values = action.apply(&[key(name)])?;
    Ok(values[0].downcast::<String>().expect("named rules always produce String").clone())
}
