//! The per-call execution context command handlers receive: the keyspace,
//! the executing client's selected database, the current wall-clock second,
//! and the hash zipmap watermarks threaded from config.

use ember_core::{Database, HashLimits, Keyspace};

/// Execution context for one command invocation. Lives only for the
/// duration of a single `dispatch` call — the engine thread reconstructs
/// one per request, since it alone owns `Keyspace` (SPEC_FULL.md §1).
pub struct ExecCtx<'a> {
    pub keyspace: &'a mut Keyspace,
    pub db_index: usize,
    /// Absolute Unix seconds, sampled once per command so a single `EXPIRE`
    /// evaluation is internally consistent.
    pub now: i64,
    pub hash_limits: HashLimits,
    /// Incremented by every handler that mutates the keyspace; the
    /// dispatcher diffs this before/after to decide whether to feed the
    /// journal and replicas (spec §4.E).
    pub dirty: u64,
}

impl<'a> ExecCtx<'a> {
    pub fn db(&self) -> &Database {
        self.keyspace.db(self.db_index).expect("db_index validated at SELECT time")
    }

    pub fn db_mut(&mut self) -> &mut Database {
        self.keyspace.db_mut(self.db_index).expect("db_index validated at SELECT time")
    }

    pub fn mark_dirty(&mut self) {
        self.dirty += 1;
    }
}
