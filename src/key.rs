//! Type-erased keys and the monotonic run counter.
//!
//! A [`Key`] is whatever a rule-type chooses it to be (a file path, an
//! oracle query, a directory listing...); the engine itself only ever
//! sees the erased form, [`ErasedKey`], so that the database, scheduler
//! and resolver are homogeneous over every rule type registered with the
//! [`crate::registry::Registry`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHasher;

/// Identifies a rule-type within the [`crate::registry::Registry`].
///
/// Stable across a process's lifetime: the name is whatever string the
/// rule was registered under, the hash pins down the encoding so that
/// two rule types that happen to share a name (a programming error) do
/// not silently alias.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag {
    name: &'static str,
    hash: u64,
}

impl TypeTag {
    /// Creates a tag for a rule-type registered under `name`.
    pub fn new(name: &'static str) -> Self {
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        TypeTag {
            name,
            hash: hasher.finish(),
        }
    }

    /// The rule-type name this tag was created from.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

/// A key with its originating type erased to bytes.
///
/// `bytes` is the rule-type's own serialization of its typed key; the
/// core never interprets it except to hash, compare and print it (via
/// `display`, produced by the rule-type's match function at
/// registration time).
/// `display` is excluded from identity: two keys built from the same
/// `(tag, bytes)` are the same key regardless of how a rule-type chose
/// to render them (`spec.md` §3 defines a key's erased identity as
/// `(TypeTag, Bytes)` alone).
#[derive(Clone)]
pub struct ErasedKey {
    tag: TypeTag,
    bytes: Box<[u8]>,
    display: Box<str>,
}

impl PartialEq for ErasedKey {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.bytes == other.bytes
    }
}

impl Eq for ErasedKey {}

impl Hash for ErasedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.bytes.hash(state);
    }
}

impl ErasedKey {
    /// Builds an erased key from a rule-type tag, its byte encoding, and
    /// a human-readable rendering used in error messages and reports.
    pub fn new(tag: TypeTag, bytes: impl Into<Box<[u8]>>, display: impl Into<Box<str>>) -> Self {
        ErasedKey {
            tag,
            bytes: bytes.into(),
            display: display.into(),
        }
    }

    /// The rule-type tag this key belongs to.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The rule-type's raw byte encoding of the key.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ErasedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

impl fmt::Display for ErasedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

/// The on-disk encoding of an [`ErasedKey`] (`spec.md` §4.6).
///
/// `TypeTag` carries a `&'static str`, which cannot be deserialized
/// directly; the rule-type name is interned (leaked) once per process
/// on load instead, the same tradeoff the teacher's own intern tables
/// make for long-lived keys.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedKey {
    type_name: String,
    bytes: Vec<u8>,
    display: String,
}

impl From<&ErasedKey> for PersistedKey {
    fn from(key: &ErasedKey) -> Self {
        PersistedKey {
            type_name: key.tag.name().to_string(),
            bytes: key.bytes.to_vec(),
            display: key.display.to_string(),
        }
    }
}

impl From<PersistedKey> for ErasedKey {
    fn from(persisted: PersistedKey) -> Self {
        let name: &'static str = Box::leak(persisted.type_name.into_boxed_str());
        ErasedKey::new(TypeTag::new(name), persisted.bytes, persisted.display)
    }
}

/// A monotonically increasing build counter.
///
/// Every touched [`crate::database::Entry`] records the `Run` at which
/// it last executed (`built`) and the `Run` at which its value last
/// differed (`changed`), per `spec.md` §3.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Run(u64);

impl Run {
    /// The run before any build has happened.
    pub const ZERO: Run = Run(0);

    /// Returns the next run in sequence.
    pub fn next(self) -> Run {
        Run(self.0 + 1)
    }

    /// The raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Wraps a raw counter value (used when deserializing a persisted DB).
    pub fn from_u64(v: u64) -> Self {
        Run(v)
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run({})", self.0)
    }
}

/// Shared, process-wide source of fresh [`Run`] numbers.
#[derive(Debug, Default)]
pub struct RunCounter(AtomicU64);

impl RunCounter {
    /// Creates a counter starting immediately after `initial`.
    pub fn starting_after(initial: Run) -> Self {
        RunCounter(AtomicU64::new(initial.as_u64()))
    }

    /// Atomically advances to the next run and returns it.
    pub fn advance(&self) -> Run {
        Run(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn keys_with_same_tag_and_bytes_are_equal_despite_different_display() {
        let tag = TypeTag::new("key-tests::tag");
        let a = ErasedKey::new(tag, vec![1, 2, 3], "a-rendering");
        let b = ErasedKey::new(tag, vec![1, 2, 3], "a-different-rendering");
        assert_eq!(a, b);

        let mut set = FxHashSet::default();
        set.insert(a);
        assert!(set.contains(&b), "equal keys must hash the same regardless of display");
    }

    #[test]
    fn keys_with_different_bytes_are_not_equal() {
        let tag = TypeTag::new("key-tests::tag");
        let a = ErasedKey::new(tag, vec![1], "k");
        let b = ErasedKey::new(tag, vec![2], "k");
        assert_ne!(a, b);
    }
}
