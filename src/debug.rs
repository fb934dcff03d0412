//! Human-readable debug formatting, kept separate from the
//! machine-readable profile report (`crate::report`).

use std::fmt;

use crate::database::{Database, Entry};

/// Helper type for [`Entry::debug`].
pub struct EntryDebug<'a>(&'a Entry);

impl fmt::Debug for EntryDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.0.key.to_string())
            .field("built", &self.0.built_run.as_u64())
            .field("changed", &self.0.changed_run.as_u64())
            .field(
                "dependencies",
                &self.0.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>(),
            )
            .field("execution_time", &self.0.execution_time)
            .finish()
    }
}

impl Entry {
    /// Returns a type that gives a user-readable debug output.
    /// Use like `println!("{:?}", entry.debug())`.
    pub fn debug(&self) -> EntryDebug<'_> {
        EntryDebug(self)
    }
}

/// Dumps every entry resolved so far this run, in commit order.
pub fn dump_resolved(db: &Database) -> String {
    db.resolved_in_commit_order()
        .iter()
        .map(|e| format!("{:?}", e.debug()))
        .collect::<Vec<_>>()
        .join("\n")
}
