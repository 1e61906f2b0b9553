//! `MULTI`/`EXEC`/`DISCARD` queuing state (spec §4.K "Transactions"). The
//! state machine itself has no engine dependency — it just accumulates
//! argument vectors — so it lives alongside the other command primitives and
//! is driven by the per-connection task in `connection.rs`.

use bytes::Bytes;

/// One client connection's transaction-queuing state.
#[derive(Debug, Default)]
pub struct TransactionState {
    queue: Option<Vec<Vec<Bytes>>>,
}

impl TransactionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.queue.is_some()
    }

    /// `MULTI`: starts queuing. Redis itself treats a nested `MULTI` as an
    /// error; mirrored here by returning `false`.
    pub fn begin(&mut self) -> bool {
        if self.queue.is_some() {
            false
        } else {
            self.queue = Some(Vec::new());
            true
        }
    }

    /// Queues one command's argument vector while a transaction is active.
    /// Callers must check `is_active` first.
    pub fn queue(&mut self, args: Vec<Bytes>) {
        if let Some(q) = &mut self.queue {
            q.push(args);
        }
    }

    /// `DISCARD`: drops the queue, returning whether one was active.
    pub fn discard(&mut self) -> bool {
        self.queue.take().is_some()
    }

    /// `EXEC`: takes the queued commands for the caller to run in order,
    /// returning `None` if no `MULTI` was active.
    pub fn take_for_exec(&mut self) -> Option<Vec<Vec<Bytes>>> {
        self.queue.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_rejects_nested_multi() {
        let mut t = TransactionState::new();
        assert!(t.begin());
        assert!(!t.begin());
    }

    #[test]
    fn queue_accumulates_in_order() {
        let mut t = TransactionState::new();
        t.begin();
        t.queue(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]);
        t.queue(vec![Bytes::from_static(b"INCR"), Bytes::from_static(b"a")]);
        let cmds = t.take_for_exec().unwrap();
        assert_eq!(cmds.len(), 2);
        assert!(!t.is_active());
    }

    #[test]
    fn discard_clears_without_executing() {
        let mut t = TransactionState::new();
        t.begin();
        t.queue(vec![Bytes::from_static(b"PING")]);
        assert!(t.discard());
        assert!(t.take_for_exec().is_none());
    }
}
