//! The Persistent Database, per `spec.md` §3, §4.2, §4.6.
//!
//! Combines two things that the teacher keeps conceptually separate
//! but structurally close (`derived/slot.rs`'s `Slot<Q, MP>` wrapping a
//! `QueryState` plus a `Memo`): the schema-versioned on-disk record of
//! the last successful value for each key, and the in-memory state
//! machine (`Absent` / `Running` / `Resolved`) coordinating concurrent
//! access to a key during the current run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::context::Trace;
use crate::error::Error;
use crate::key::{ErasedKey, PersistedKey, Run};
use crate::registry::ErasedValue;

const SCHEMA_VERSION: u32 = 1;

/// One key's full record: its value, the runs it was built/changed at,
/// the dependencies it declared, and its execution trace — the fields
/// the profile report and the database file both draw from
/// (`spec.md` §3, §6).
#[derive(Clone)]
pub struct Entry {
    pub key: ErasedKey,
    pub value: ErasedValue,
    pub built_run: Run,
    pub changed_run: Run,
    pub dependencies: Vec<ErasedKey>,
    pub execution_time: f64,
    pub traces: Vec<Trace>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedEntry {
    key: PersistedKey,
    bytes: Vec<u8>,
    built: u64,
    changed: u64,
    dependencies: Vec<PersistedKey>,
    execution_time: f64,
    traces: Vec<Trace>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct DbFile {
    schema_version: u32,
    runs: u64,
    entries: Vec<PersistedEntry>,
}

/// A waiter's rendez-vous point: `None` while the owning worker is
/// still building the key, `Some(true)` once it resolved, `Some(false)`
/// once it failed.
type Outcome = Arc<(Mutex<Option<bool>>, Condvar)>;

enum SlotState {
    /// Never built this run; `persisted` is the last run's record, used
    /// as the staleness baseline (`spec.md` §4.2, "Absent or stale").
    Absent { persisted: Option<Entry> },
    /// Some worker is building this key; anyone else waits on `outcome`.
    Running { outcome: Outcome },
    /// Settled for the remainder of this run.
    Resolved(Entry),
    /// The owning worker failed to build this key this run.
    Failed,
}

struct Slot {
    state: RwLock<SlotState>,
}

/// What `begin`-ing a key tells the caller to do next.
pub enum Ownership {
    /// Already resolved this run.
    Resolved(Entry),
    /// This call now owns building `key`; `previous` is last run's
    /// entry, used to decide whether a rebuild is even necessary.
    Build { previous: Option<Entry> },
    /// Some other worker owns `key`; wait on this rendez-vous, then
    /// call `begin` again.
    Wait(Outcome),
    /// Some other worker already failed to build `key` this run.
    Failed,
}

/// The Persistent Database.
pub struct Database {
    path: Option<PathBuf>,
    last_persisted_run: Run,
    slots: RwLock<FxHashMap<ErasedKey, Arc<Slot>>>,
    /// Commit order: the order entries were finalized in this run. This
    /// becomes the index space the profile report's `depends` arrays
    /// reference (`spec.md` §6); it is guarded separately from `slots`
    /// so readers never see a slot marked `Resolved` before it is
    /// actually appended here.
    committed: Mutex<Vec<ErasedKey>>,
    save_lock: Mutex<()>,
}

impl Database {
    /// Loads the database from `path`, or starts empty if `path` is
    /// `None` or does not yet exist.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let (last_persisted_run, entries) = match path {
            Some(path) if path.exists() => {
                let contents = fs::read(path)
                    .map_err(|e| Error::DatabaseCorrupt(format!("reading {}: {e}", path.display())))?;
                let file: DbFile = serde_json::from_slice(&contents)
                    .map_err(|e| Error::DatabaseCorrupt(format!("decoding {}: {e}", path.display())))?;
                if file.schema_version != SCHEMA_VERSION {
                    return Err(Error::DatabaseCorrupt(format!(
                        "schema version {} unsupported (expected {})",
                        file.schema_version, SCHEMA_VERSION
                    )));
                }
                (Run::from_u64(file.runs), file.entries)
            }
            _ => (Run::ZERO, Vec::new()),
        };

        let mut slots = FxHashMap::default();
        for persisted in entries {
            let key: ErasedKey = persisted.key.into();
            let entry = Entry {
                key: key.clone(),
                value: ErasedValue::new(persisted.bytes.clone(), persisted.bytes),
                built_run: Run::from_u64(persisted.built),
                changed_run: Run::from_u64(persisted.changed),
                dependencies: persisted.dependencies.into_iter().map(ErasedKey::from).collect(),
                execution_time: persisted.execution_time,
                traces: persisted.traces,
            };
            slots.insert(
                key,
                Arc::new(Slot {
                    state: RwLock::new(SlotState::Absent {
                        persisted: Some(entry),
                    }),
                }),
            );
        }

        Ok(Database {
            path: path.map(Path::to_path_buf),
            last_persisted_run,
            slots: RwLock::new(slots),
            committed: Mutex::new(Vec::new()),
            save_lock: Mutex::new(()),
        })
    }

    /// The run number recorded in the file this database was loaded
    /// from (`Run::ZERO` for a fresh database).
    pub fn last_persisted_run(&self) -> Run {
        self.last_persisted_run
    }

    fn slot_for(&self, key: &ErasedKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: RwLock::new(SlotState::Absent { persisted: None }),
                })
            })
            .clone()
    }

    /// Looks at `key`'s current state without blocking. See
    /// [`Ownership`] for what each outcome means to the caller.
    pub fn begin(&self, key: &ErasedKey) -> Ownership {
        let slot = self.slot_for(key);
        let mut state = slot.state.write();
        match &*state {
            SlotState::Resolved(entry) => {
                debug!("{key}: already resolved this run, reusing entry");
                Ownership::Resolved(entry.clone())
            }
            SlotState::Failed => {
                debug!("{key}: already failed this run");
                Ownership::Failed
            }
            SlotState::Running { outcome } => {
                debug!("{key}: owned by another worker, parking");
                Ownership::Wait(outcome.clone())
            }
            SlotState::Absent { persisted } => {
                let previous = persisted.clone();
                debug!("{key}: granting build ownership, persisted={}", previous.is_some());
                *state = SlotState::Running {
                    outcome: Arc::new((Mutex::new(None), Condvar::new())),
                };
                Ownership::Build { previous }
            }
        }
    }

    /// Commits a successfully built entry, waking anyone waiting on it.
    pub fn finish(&self, key: &ErasedKey, entry: Entry) {
        let slot = self.slot_for(key);
        let mut state = slot.state.write();
        let outcome = match &*state {
            SlotState::Running { outcome } => outcome.clone(),
            _ => return,
        };
        *state = SlotState::Resolved(entry);
        drop(state);
        self.committed.lock().push(key.clone());
        debug!("{key}: resolved, waking waiters");
        let (lock, cvar) = &*outcome;
        *lock.lock() = Some(true);
        cvar.notify_all();
    }

    /// Marks `key` as failed for the rest of this run, waking anyone
    /// waiting on it.
    pub fn fail(&self, key: &ErasedKey) {
        let slot = self.slot_for(key);
        let mut state = slot.state.write();
        let outcome = match &*state {
            SlotState::Running { outcome } => outcome.clone(),
            _ => return,
        };
        *state = SlotState::Failed;
        drop(state);
        debug!("{key}: failed, waking waiters");
        let (lock, cvar) = &*outcome;
        *lock.lock() = Some(false);
        cvar.notify_all();
    }

    /// `key`'s entry if it has already been resolved this run, without
    /// taking build ownership. Used by the lint condition-4 check to
    /// tell whether a depended-upon key is itself a source key
    /// (`spec.md` §4.5).
    pub fn peek_resolved(&self, key: &ErasedKey) -> Option<Entry> {
        let slot = self.slots.read().get(key)?.clone();
        match &*slot.state.read() {
            SlotState::Resolved(entry) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Every entry resolved this run, in commit order — the order the
    /// profile report's `depends` indices are computed against
    /// (`spec.md` §6).
    pub fn resolved_in_commit_order(&self) -> Vec<Entry> {
        let committed = self.committed.lock();
        let slots = self.slots.read();
        committed
            .iter()
            .filter_map(|key| {
                let slot = slots.get(key)?;
                match &*slot.state.read() {
                    SlotState::Resolved(entry) => Some(entry.clone()),
                    _ => None,
                }
            })
            .collect()
    }

    /// Writes every resolved entry back to the database file, under a
    /// lock that serializes concurrent checkpoints (`spec.md` §4.6).
    pub fn checkpoint(&self, current_run: Run) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();

        let entries = self.resolved_in_commit_order();
        let file = DbFile {
            schema_version: SCHEMA_VERSION,
            runs: current_run.as_u64(),
            entries: entries
                .iter()
                .map(|e| PersistedEntry {
                    key: PersistedKey::from(&e.key),
                    bytes: e.value.bytes().to_vec(),
                    built: e.built_run.as_u64(),
                    changed: e.changed_run.as_u64(),
                    dependencies: e.dependencies.iter().map(PersistedKey::from).collect(),
                    execution_time: e.execution_time,
                    traces: e.traces.clone(),
                })
                .collect(),
        };

        let encoded = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::Internal(format!("encoding database: {e}")))?;
        write_atomically(path, &encoded).map_err(|e| {
            Error::DatabaseCorrupt(format!("writing {}: {e}", path.display()))
        })
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TypeTag;

    fn key(n: u8) -> ErasedKey {
        ErasedKey::new(TypeTag::new("test"), vec![n], format!("k{n}"))
    }

    #[test]
    fn begin_on_fresh_key_grants_build_ownership() {
        let db = Database::load(None).unwrap();
        match db.begin(&key(1)) {
            Ownership::Build { previous } => assert!(previous.is_none()),
            _ => panic!("expected Build"),
        }
    }

    #[test]
    fn begin_again_while_running_yields_wait() {
        let db = Database::load(None).unwrap();
        let k = key(1);
        let _ = db.begin(&k);
        match db.begin(&k) {
            Ownership::Wait(_) => {}
            _ => panic!("expected Wait"),
        }
    }

    #[test]
    fn finish_resolves_and_wakes_waiters() {
        let db = Database::load(None).unwrap();
        let k = key(1);
        let _ = db.begin(&k);
        let entry = Entry {
            key: k.clone(),
            value: ErasedValue::new(vec![1u8], vec![1u8]),
            built_run: Run::from_u64(1),
            changed_run: Run::from_u64(1),
            dependencies: Vec::new(),
            execution_time: 0.0,
            traces: Vec::new(),
        };
        db.finish(&k, entry);
        match db.begin(&k) {
            Ownership::Resolved(e) => assert_eq!(e.value.bytes(), &[1u8]),
            _ => panic!("expected Resolved"),
        }
        assert_eq!(db.resolved_in_commit_order().len(), 1);
    }

    #[test]
    fn checkpoint_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let db = Database::load(Some(&path)).unwrap();
        let k = key(7);
        let _ = db.begin(&k);
        db.finish(
            &k,
            Entry {
                key: k.clone(),
                value: ErasedValue::new(vec![9u8], vec![9u8]),
                built_run: Run::from_u64(1),
                changed_run: Run::from_u64(1),
                dependencies: Vec::new(),
                execution_time: 0.5,
                traces: Vec::new(),
            },
        );
        db.checkpoint(Run::from_u64(1)).unwrap();

        let reloaded = Database::load(Some(&path)).unwrap();
        assert_eq!(reloaded.last_persisted_run().as_u64(), 1);
        match reloaded.begin(&k) {
            Ownership::Build { previous: Some(entry) } => {
                assert_eq!(entry.value.bytes(), &[9u8]);
            }
            _ => panic!("expected a persisted baseline"),
        }
    }
}
