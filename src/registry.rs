//! The Value Registry: a process-scoped, type-indexed map from rule-type
//! tag to rule definition (`spec.md` §2.1).

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::context::Action;
use crate::error::UserError;
use crate::key::{ErasedKey, TypeTag};
use crate::options::ChangeMode;

/// The three-way result of comparing an old and newly-computed value,
/// per `spec.md` §3 ("Rule Definition") and §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    /// The new value is indistinguishable from the old one.
    Equal,
    /// The new value differs from the old one.
    Changed,
    /// The rule re-executed (because its inputs looked stale) but
    /// produced an equivalent value; dependents do not need to rebuild.
    RebuiltButEquivalent,
}

/// An opaque payload produced by a rule.
///
/// Carries both a live, typed handle (so callers of `apply` get back the
/// concrete value they asked for) and a byte encoding used by the
/// default comparator and by database persistence.
#[derive(Clone)]
pub struct ErasedValue {
    bytes: Arc<[u8]>,
    any: Arc<dyn std::any::Any + Send + Sync>,
}

impl ErasedValue {
    /// Builds an erased value from its byte encoding and a typed handle.
    pub fn new<T: std::any::Any + Send + Sync>(bytes: impl Into<Arc<[u8]>>, value: T) -> Self {
        ErasedValue {
            bytes: bytes.into(),
            any: Arc::new(value),
        }
    }

    /// Rebuilds an erased value from persisted bytes alone, using the
    /// owning rule's [`DecodeFn`] to recover a typed handle.
    ///
    /// Used when a database entry is found up to date without
    /// re-running its rule (`spec.md` §4.2, §4.6): the bytes on disk
    /// are authoritative, but something still needs to hand dependents
    /// a concrete value.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, decode: &DecodeFn) -> Self {
        let bytes = bytes.into();
        let any = decode(&bytes);
        ErasedValue { bytes, any }
    }

    /// The byte encoding used for persistence and default comparison.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Downcasts back to the rule's concrete value type.
    pub fn downcast<T: std::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.any.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ErasedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedValue")
            .field("bytes_len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// A rule's build function: given the context and the matched key,
/// produce a value or fail with an opaque application error. The
/// engine itself attaches the dependency-stack prefix (`spec.md` §7);
/// rule bodies never construct `crate::error::Error` themselves.
pub type BuildFn = Arc<dyn Fn(&mut Action<'_>, &ErasedKey) -> std::result::Result<ErasedValue, UserError> + Send + Sync>;

/// A rule's match function: does this key belong to this rule?
pub type MatchFn = Arc<dyn Fn(&ErasedKey) -> bool + Send + Sync>;

/// A rule's comparator, the default being byte-equality (`spec.md` §4.4).
pub type CompareFn = Arc<dyn Fn(&ErasedValue, &ErasedValue) -> ChangeResult + Send + Sync>;

/// Rebuilds a typed handle from persisted bytes alone, so a key can be
/// resolved without re-running its rule when the database finds it
/// already up to date (`spec.md` §4.2, §4.6).
///
/// The default decodes to `Vec<u8>`; rule types whose `Value` is not
/// raw bytes must register their own via [`RuleDef::with_decode`] for
/// cross-process reuse of unchanged values to work.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Arc<dyn std::any::Any + Send + Sync> + Send + Sync>;

/// Default comparator: byte-equal values are `Equal`, else `Changed`.
pub fn default_compare() -> CompareFn {
    Arc::new(|old, new| {
        if old.bytes() == new.bytes() {
            ChangeResult::Equal
        } else {
            ChangeResult::Changed
        }
    })
}

fn default_decode() -> DecodeFn {
    Arc::new(|bytes| Arc::new(bytes.to_vec()))
}

/// `{ TypeTag, MatchFn, BuildFn, Comparator }` as described in
/// `spec.md` §3.
pub struct RuleDef {
    tag: TypeTag,
    /// Higher priority rules are preferred when more than one rule
    /// registered under the same tag matches a key ("explicit
    /// priority/override policy", `spec.md` §3).
    priority: i32,
    matcher: MatchFn,
    build: BuildFn,
    compare: CompareFn,
    /// A cheaper comparator consulted first under `ChangeMode::ModtimeOnly`
    /// and `ChangeMode::ModtimeAndDigest` (`spec.md` §6's `changeMode`).
    /// Rules that register only one comparator strategy have nothing for
    /// `Options::change_mode` to select between, so this falls back to
    /// `compare` whenever it is unset.
    modtime_compare: Option<CompareFn>,
    decode: DecodeFn,
}

impl RuleDef {
    /// Builds a rule definition with the default (byte-equality)
    /// comparator, default (`Vec<u8>`) decoder, and priority zero.
    pub fn new(tag: TypeTag, matcher: MatchFn, build: BuildFn) -> Self {
        RuleDef {
            tag,
            priority: 0,
            matcher,
            build,
            compare: default_compare(),
            modtime_compare: None,
            decode: default_decode(),
        }
    }

    /// Overrides the (digest-style) comparator consulted under
    /// `ChangeMode::DigestOnly`, and as the fallback for every other mode.
    pub fn with_compare(mut self, compare: CompareFn) -> Self {
        self.compare = compare;
        self
    }

    /// Registers a second, cheaper comparator strategy consulted under
    /// `ChangeMode::ModtimeOnly`/`ModtimeAndDigest` (`spec.md` §6). A rule
    /// with no modtime comparator always falls back to the digest one,
    /// regardless of `Options::change_mode`.
    pub fn with_modtime_compare(mut self, compare: CompareFn) -> Self {
        self.modtime_compare = Some(compare);
        self
    }

    /// Overrides the decoder used to recover a typed value from
    /// persisted bytes without re-running the rule.
    pub fn with_decode(mut self, decode: DecodeFn) -> Self {
        self.decode = decode;
        self
    }

    /// Overrides the priority used to resolve ambiguous matches.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn matches(&self, key: &ErasedKey) -> bool {
        (self.matcher)(key)
    }

    pub(crate) fn build(&self, action: &mut Action<'_>, key: &ErasedKey) -> std::result::Result<ErasedValue, UserError> {
        (self.build)(action, key)
    }

    /// Compares `old` and `new`, honoring `Options::change_mode`'s choice
    /// of comparator strategy. `DigestOnly` always consults the primary
    /// comparator; `ModtimeOnly` consults the modtime comparator if one
    /// was registered; `ModtimeAndDigest` consults it first and only
    /// falls back to the digest comparator when it doesn't report
    /// `Equal`. A rule with no `modtime_compare` registered always uses
    /// the primary comparator, regardless of mode.
    pub(crate) fn compare(&self, old: &ErasedValue, new: &ErasedValue, mode: ChangeMode) -> ChangeResult {
        match (mode, &self.modtime_compare) {
            (ChangeMode::DigestOnly, _) | (_, None) => (self.compare)(old, new),
            (ChangeMode::ModtimeOnly, Some(modtime)) => modtime(old, new),
            (ChangeMode::ModtimeAndDigest, Some(modtime)) => match modtime(old, new) {
                ChangeResult::Equal => ChangeResult::Equal,
                _ => (self.compare)(old, new),
            },
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> ErasedValue {
        ErasedValue::from_bytes(bytes.to_vec(), &self.decode)
    }
}

/// The process-scoped registry of rule definitions, populated once
/// during the registration phase before any `apply` call is made
/// (`spec.md` §6, "evaluates the rule-registration phase").
#[derive(Default)]
pub struct Registry {
    rules: FxHashMap<TypeTag, Vec<Arc<RuleDef>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Installs a rule definition.
    pub fn register(&mut self, rule: RuleDef) {
        self.rules.entry(rule.tag).or_default().push(Arc::new(rule));
    }

    /// Finds the highest-priority rule whose matcher claims `key`.
    ///
    /// Ties are broken by registration order (first registered wins),
    /// which is the "explicit... policy" `spec.md` §3 calls for.
    pub fn find(&self, key: &ErasedKey) -> Option<Arc<RuleDef>> {
        let candidates = self.rules.get(&key.tag())?;
        candidates
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(key))
            // `max_by_key` returns the *last* equally-maximal element, so
            // break ties on the registration index reversed: the earliest
            // registered rule then compares greatest among equal priorities.
            .max_by_key(|(index, rule)| (rule.priority, std::cmp::Reverse(*index)))
            .map(|(_, rule)| rule.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches_anything() -> MatchFn {
        Arc::new(|_key| true)
    }

    fn noop_build() -> BuildFn {
        Arc::new(|_action, key| Ok(ErasedValue::new(Vec::new(), key.clone())))
    }

    #[test]
    fn find_breaks_same_priority_ties_by_first_registered() {
        let tag = TypeTag::new("registry-tests::tag");
        let mut registry = Registry::new();
        registry.register(RuleDef::new(tag.clone(), matches_anything(), noop_build()).with_priority(5));
        let second = Arc::new(RuleDef::new(tag.clone(), matches_anything(), noop_build()).with_priority(5));
        registry.rules.get_mut(&tag).unwrap().push(second.clone());

        let key = ErasedKey::new(tag, Vec::new(), "k".to_string());
        let found = registry.find(&key).unwrap();
        assert!(!Arc::ptr_eq(&found, &second), "first registered rule of equal priority should win");
    }

    #[test]
    fn find_prefers_higher_priority_regardless_of_order() {
        let tag = TypeTag::new("registry-tests::priority");
        let mut registry = Registry::new();
        registry.register(RuleDef::new(tag.clone(), matches_anything(), noop_build()).with_priority(0));
        registry.register(RuleDef::new(tag.clone(), matches_anything(), noop_build()).with_priority(10));

        let key = ErasedKey::new(tag, Vec::new(), "k".to_string());
        let found = registry.find(&key).unwrap();
        assert_eq!(found.priority, 10);
    }

    fn value(b: &[u8]) -> ErasedValue {
        ErasedValue::new(b.to_vec(), b.to_vec())
    }

    #[test]
    fn change_mode_digest_only_ignores_modtime_comparator() {
        let rule = RuleDef::new(TypeTag::new("registry-tests::change-mode"), matches_anything(), noop_build())
            .with_modtime_compare(Arc::new(|_, _| ChangeResult::Equal));
        // The byte-equality default comparator sees these as different.
        let changed = rule.compare(&value(b"a"), &value(b"b"), ChangeMode::DigestOnly);
        assert_eq!(changed, ChangeResult::Changed);
    }

    #[test]
    fn change_mode_modtime_only_trusts_the_modtime_comparator() {
        let rule = RuleDef::new(TypeTag::new("registry-tests::change-mode"), matches_anything(), noop_build())
            .with_modtime_compare(Arc::new(|_, _| ChangeResult::Equal));
        let result = rule.compare(&value(b"a"), &value(b"b"), ChangeMode::ModtimeOnly);
        assert_eq!(result, ChangeResult::Equal);
    }

    #[test]
    fn change_mode_modtime_and_digest_falls_back_when_modtime_says_changed() {
        let rule = RuleDef::new(TypeTag::new("registry-tests::change-mode"), matches_anything(), noop_build())
            .with_modtime_compare(Arc::new(|_, _| ChangeResult::Changed));
        let result = rule.compare(&value(b"same"), &value(b"same"), ChangeMode::ModtimeAndDigest);
        // Modtime alone says "changed", but the digest comparator sees
        // identical bytes, so the overall verdict is Equal.
        assert_eq!(result, ChangeResult::Equal);
    }

    #[test]
    fn missing_modtime_comparator_always_falls_back_to_digest() {
        let rule = RuleDef::new(TypeTag::new("registry-tests::change-mode"), matches_anything(), noop_build());
        let result = rule.compare(&value(b"a"), &value(b"a"), ChangeMode::ModtimeOnly);
        assert_eq!(result, ChangeResult::Equal);
    }
}
