//! Parked clients waiting on a list push (spec §4.K "Blocking Ops").
//!
//! Grounded on spec §9 Design Notes: "treat blocked-on-list-push and
//! waiting-for-page-load as distinct reasons a client is parked but members
//! of the same design pattern" — a per-db map `key -> waiters` plus a
//! client-side back-reference; a blocked-on-push wait and a waiting-for-
//! page-load wait are unified only at the connection layer
//! (`network::connection`), which awaits whichever receiver set
//! `EngineOutcome`/`BlockingPopOutcome` hands back, since the two wake
//! conditions are otherwise independent.
//!
//! The engine thread owns this map exclusively (SPEC_FULL.md §1): `BLPOP`/
//! `BRPOP` register a waiter here instead of blocking the calling task, and
//! a `push` call drains waiters in FIFO order, handing each the element
//! directly rather than storing it.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;

/// One client's registration on a single key. `notify` fires at most once:
/// either with the delivered `(key, element)` pair, or never (the caller's
/// own deadline timer handles the nil-timeout case by dropping its
/// registration and racing the oneshot).
struct Waiter {
    client_id: u64,
    notify: oneshot::Sender<(Bytes, Bytes)>,
}

/// Per-database blocked-on-key waiter queues (spec §3 "blocked-on-key").
#[derive(Default)]
pub struct BlockingManager {
    /// One FIFO of waiters per (db, key). A client waiting on several keys
    /// (`BLPOP k1 k2 k3 timeout`) registers once per key; whichever key is
    /// pushed to first wins and the registration is cancelled on the other
    /// tracked lists by `client_id`.
    waiters: HashMap<(usize, Bytes), VecDeque<Waiter>>,
}

impl BlockingManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client_id` as waiting on `db`/`key`, returning the
    /// receiver half it should await alongside its deadline timer.
    pub fn park(&mut self, db: usize, key: Bytes, client_id: u64) -> oneshot::Receiver<(Bytes, Bytes)> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry((db, key)).or_default().push_back(Waiter { client_id, notify: tx });
        rx
    }

    /// Removes every registration for `client_id` across `keys` — called
    /// when a wait is satisfied on one key (so the client isn't woken
    /// twice) or when its deadline lapses.
    pub fn unpark(&mut self, db: usize, keys: &[Bytes], client_id: u64) {
        for key in keys {
            if let Some(q) = self.waiters.get_mut(&(db, key.clone())) {
                q.retain(|w| w.client_id != client_id);
                if q.is_empty() {
                    self.waiters.remove(&(db, key.clone()));
                }
            }
        }
    }

    /// Whether any client is parked on `db`/`key` — consulted by `LPUSH`/
    /// `RPUSH` before falling back to a normal in-keyspace push (spec §4.K:
    /// "the pusher's element is delivered to the oldest waiter ... instead
    /// of being stored").
    #[must_use]
    pub fn has_waiter(&self, db: usize, key: &[u8]) -> bool {
        self.waiters.get(&(db, Bytes::copy_from_slice(key))).is_some_and(|q| !q.is_empty())
    }

    /// Delivers one pushed `element` to the oldest waiter on `db`/`key`, if
    /// any. Returns `false` (meaning: store it normally instead) if nobody
    /// is waiting, or if the oldest waiter's receiver has already been
    /// dropped (its deadline raced the push) — in which case the next
    /// waiter in the queue is tried.
    pub fn deliver(&mut self, db: usize, key: &Bytes, element: Bytes) -> bool {
        let Some(q) = self.waiters.get_mut(&(db, key.clone())) else { return false };
        while let Some(waiter) = q.pop_front() {
            if waiter.notify.send((key.clone(), element.clone())).is_ok() {
                if q.is_empty() {
                    self.waiters.remove(&(db, key.clone()));
                }
                return true;
            }
        }
        self.waiters.remove(&(db, key.clone()));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_waiter_means_normal_push() {
        let mgr = BlockingManager::new();
        assert!(!mgr.has_waiter(0, b"mylist"));
    }

    #[test]
    fn deliver_wakes_oldest_waiter_fifo() {
        let mut mgr = BlockingManager::new();
        let mut rx1 = mgr.park(0, Bytes::from_static(b"mylist"), 1);
        let mut rx2 = mgr.park(0, Bytes::from_static(b"mylist"), 2);
        assert!(mgr.deliver(0, &Bytes::from_static(b"mylist"), Bytes::from_static(b"hello")));
        assert_eq!(
            rx1.try_recv().unwrap(),
            (Bytes::from_static(b"mylist"), Bytes::from_static(b"hello"))
        );
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn deliver_with_no_waiters_reports_false() {
        let mut mgr = BlockingManager::new();
        assert!(!mgr.deliver(0, &Bytes::from_static(b"mylist"), Bytes::from_static(b"x")));
    }

    #[test]
    fn unpark_removes_registration_across_multiple_keys() {
        let mut mgr = BlockingManager::new();
        let _rx = mgr.park(0, Bytes::from_static(b"a"), 1);
        let _rx2 = mgr.park(0, Bytes::from_static(b"b"), 1);
        mgr.unpark(0, &[Bytes::from_static(b"a"), Bytes::from_static(b"b")], 1);
        assert!(!mgr.has_waiter(0, b"a"));
        assert!(!mgr.has_waiter(0, b"b"));
    }

    #[test]
    fn dropped_receiver_falls_through_to_next_waiter() {
        let mut mgr = BlockingManager::new();
        let rx1 = mgr.park(0, Bytes::from_static(b"mylist"), 1);
        drop(rx1);
        let mut rx2 = mgr.park(0, Bytes::from_static(b"mylist"), 2);
        assert!(mgr.deliver(0, &Bytes::from_static(b"mylist"), Bytes::from_static(b"v")));
        assert_eq!(rx2.try_recv().unwrap(), (Bytes::from_static(b"mylist"), Bytes::from_static(b"v")));
    }
}
