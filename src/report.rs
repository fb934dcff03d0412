//! The profile report: a bit-exact JSON rendering of the database's
//! commit-ordered entries, per `spec.md` §6.
//!
//! Grounded on the same shape as a dataflow run report (`executed`
//! nodes each carrying their resource dependencies) but flattened to
//! match the field names `spec.md` §6 fixes exactly.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::database::{Database, Entry};
use crate::key::{ErasedKey, Run};

/// One entry's row in the profile report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportEntry {
    /// The key's human-readable rendering.
    pub name: String,
    /// The run this entry was last (re)built at.
    pub built: u64,
    /// The run this entry's value last differed at.
    pub changed: u64,
    /// Indices, into this same array, of the entries this one depends on.
    pub depends: Vec<usize>,
    /// Wall-clock seconds the rule body took.
    pub execution: f64,
    /// Traced command spans recorded during the build.
    pub traces: Vec<ReportTrace>,
}

/// One `traced` span, per `spec.md` §6.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportTrace {
    pub command: String,
    pub start: f64,
    pub stop: f64,
}

/// The full profile report: one row per entry resolved this run, in
/// commit order (`spec.md` §4.6, §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    pub entries: Vec<ReportEntry>,
}

impl Report {
    /// Builds a report from the database's commit-ordered entries.
    ///
    /// `built`/`changed` are rendered relative to `current_run`, not as
    /// raw run counters: the most recent run's entries get `0`, older
    /// ones get larger values the further back they were last touched.
    /// The external viewer this schema feeds relies on `built == 0`
    /// meaning "built this time" (`spec.md` §6).
    pub fn from_database(db: &Database, current_run: Run) -> Self {
        let resolved = db.resolved_in_commit_order();
        let index_of: HashMap<ErasedKey, usize> = resolved
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect();

        let entries = resolved
            .iter()
            .map(|entry| to_report_entry(entry, &index_of, current_run))
            .collect();

        Report { entries }
    }

    /// Serializes the report as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the report to `path` as JSON.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

fn to_report_entry(entry: &Entry, index_of: &HashMap<ErasedKey, usize>, current_run: Run) -> ReportEntry {
    ReportEntry {
        name: entry.key.to_string(),
        built: current_run.as_u64() - entry.built_run.as_u64(),
        changed: current_run.as_u64() - entry.changed_run.as_u64(),
        depends: entry
            .dependencies
            .iter()
            .filter_map(|dep| index_of.get(dep).copied())
            .collect(),
        execution: entry.execution_time,
        traces: entry
            .traces
            .iter()
            .map(|t| ReportTrace {
                command: t.command.clone(),
                start: t.start,
                stop: t.stop,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Run, TypeTag};
    use crate::registry::ErasedValue;

    fn key(n: u8) -> ErasedKey {
        ErasedKey::new(TypeTag::new("test"), vec![n], format!("k{n}"))
    }

    #[test]
    fn depends_reference_commit_order_indices() {
        let db = Database::load(None).unwrap();

        let a = key(1);
        let _ = db.begin(&a);
        db.finish(
            &a,
            Entry {
                key: a.clone(),
                value: ErasedValue::new(vec![1u8], vec![1u8]),
                built_run: Run::from_u64(1),
                changed_run: Run::from_u64(1),
                dependencies: Vec::new(),
                execution_time: 0.1,
                traces: Vec::new(),
            },
        );

        let b = key(2);
        let _ = db.begin(&b);
        db.finish(
            &b,
            Entry {
                key: b.clone(),
                value: ErasedValue::new(vec![2u8], vec![2u8]),
                built_run: Run::from_u64(1),
                changed_run: Run::from_u64(1),
                dependencies: vec![a.clone()],
                execution_time: 0.2,
                traces: Vec::new(),
            },
        );

        let report = Report::from_database(&db, Run::from_u64(1));
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[1].depends, vec![0]);
        assert_eq!(report.entries[0].built, 0);
        assert_eq!(report.entries[1].built, 0);
    }
}
