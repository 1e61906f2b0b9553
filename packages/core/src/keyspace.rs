//! The keyspace and its expiration policy (spec §4.B, §3 "Keyspace").
//!
//! `Keyspace` owns `main` (key → value) and `expiry` (key → absolute-second
//! deadline) for each numbered database. The blocked-on-key and
//! pending-swap waiter maps the spec also assigns to "the keyspace" hold
//! live client references and so live in `ember-server` (`blocking.rs`,
//! `paging/mod.rs`) instead, keyed by the same database index — `ember-core`
//! has no notion of a connection.
//!
//! Time is an explicit `now: i64` (absolute Unix seconds) parameter on every
//! expiry-sensitive call rather than a wall-clock read, so the engine and
//! its tests can drive expiry deterministically.

use rand::seq::IteratorRandom;

use crate::error::{CoreError, CoreResult};
use crate::sort::PatternResolver;
use crate::value::{BytesMap, DataValue};
use bytes::Bytes;

/// Fraction of a sampled batch that must have expired to justify another
/// sampling round in the active-expiry cycle (spec §4.B).
const ACTIVE_EXPIRE_THRESHOLD: f64 = 0.25;
/// Sample size per active-expiry round (spec §4.B: "up to 100").
const ACTIVE_EXPIRE_SAMPLE: usize = 100;

/// One numbered database (spec §3 "Database").
#[derive(Debug, Clone, Default)]
pub struct Database {
    main: BytesMap<DataValue>,
    expiry: BytesMap<i64>,
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.main.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    /// Evicts `key` if its expiry is at or before `now`. Returns whether it
    /// was evicted — the shared primitive behind `lookup_read`,
    /// `lookup_write`, and the active-expiry cycle (spec §3 "Expiry
    /// invariant": "any read or write-through-read lookup must materialize
    /// that absence before proceeding").
    fn evict_if_expired(&mut self, key: &[u8], now: i64) -> bool {
        match self.expiry.get(key) {
            Some(&at) if at <= now => {
                self.main.remove(key);
                self.expiry.remove(key);
                true
            }
            _ => false,
        }
    }

    /// §4.B `lookup_read`: the value, after first evicting it if expired.
    pub fn lookup_read(&mut self, key: &[u8], now: i64) -> Option<&DataValue> {
        self.evict_if_expired(key, now);
        self.main.get(key)
    }

    /// §4.B `lookup_write`: like `lookup_read`, but the eviction always
    /// happens unconditionally before the mutation proceeds (the distinct
    /// name matters only for callers' intent; the eviction itself is the
    /// same check).
    pub fn lookup_write(&mut self, key: &[u8], now: i64) -> Option<&mut DataValue> {
        self.evict_if_expired(key, now);
        self.main.get_mut(key)
    }

    /// Read-only existence/type probe without materializing a reference,
    /// still honoring expiry.
    pub fn contains(&mut self, key: &[u8], now: i64) -> bool {
        self.evict_if_expired(key, now);
        self.main.contains_key(key)
    }

    /// Inserts or replaces `key`'s value, clearing any prior expiry (the
    /// way `SET` without `KEEPTTL` behaves).
    pub fn set(&mut self, key: Bytes, value: DataValue) {
        self.expiry.remove(&key);
        self.main.insert(key, value);
    }

    /// Inserts `key` only if the slot was empty/expired, without touching
    /// expiry bookkeeping on an existing live entry.
    pub fn entry_or_insert_with(&mut self, key: Bytes, now: i64, default: impl FnOnce() -> DataValue) -> &mut DataValue {
        self.evict_if_expired(&key, now);
        self.main.entry(key).or_insert_with(default)
    }

    /// §4.B `delete`: removes the key and its expiry entry, returning
    /// whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.expiry.remove(key);
        self.main.remove(key).is_some()
    }

    /// Replaces `key`'s value in place without touching its expiry entry —
    /// unlike [`Database::set`], which clears TTL the way a fresh `SET`
    /// does. This is the paging subsystem's swap-out/load primitive (spec
    /// §4.J): a key being paged out or in keeps whatever TTL it already
    /// had. Returns the previous value, if any.
    pub fn replace_value_keep_ttl(&mut self, key: &[u8], value: DataValue) -> Option<DataValue> {
        if !self.main.contains_key(key) {
            return None;
        }
        self.main.insert(Bytes::copy_from_slice(key), value)
    }

    pub fn rename_key(&mut self, from: &[u8], to: Bytes) -> CoreResult<()> {
        let value = self.main.remove(from).ok_or(CoreError::NoSuchKey)?;
        let expiry = self.expiry.remove(from);
        self.main.insert(to.clone(), value);
        match expiry {
            Some(at) => {
                self.expiry.insert(to, at);
            }
            None => {
                self.expiry.remove(&to);
            }
        }
        Ok(())
    }

    /// §4.B `set_expire`.
    pub fn set_expire(&mut self, key: &[u8], when: i64) -> bool {
        if self.main.contains_key(key) {
            self.expiry.insert(Bytes::copy_from_slice(key), when);
            true
        } else {
            false
        }
    }

    /// `PERSIST` (SPEC_FULL.md §3 supplement): clears a key's expiry
    /// without deleting it, returning whether an expiry was actually set.
    pub fn persist(&mut self, key: &[u8]) -> bool {
        self.expiry.remove(key).is_some()
    }

    /// §4.B `get_expire`: `None` if the key is absent, `Some(None)` if it
    /// exists without an expiry, `Some(Some(seconds))` otherwise.
    pub fn get_expire(&mut self, key: &[u8], now: i64) -> Option<Option<i64>> {
        self.evict_if_expired(key, now);
        if !self.main.contains_key(key) {
            return None;
        }
        Some(self.expiry.get(key).map(|&at| at - now))
    }

    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.main.keys()
    }

    /// Reads `key`'s value without evicting it even if its expiry is past —
    /// used only by the snapshot writer (`durability::snapshot`), which
    /// checks liveness itself via [`Database::raw_expire_at`] before
    /// deciding whether to dump a key at all.
    #[must_use]
    pub fn peek(&self, key: &[u8]) -> Option<&DataValue> {
        self.main.get(key)
    }

    /// The raw expiry deadline for `key`, with no liveness check or
    /// eviction side effect (spec §4.B's `get_expire` evicts; this
    /// doesn't). Paired with [`Database::peek`] for read-only snapshotting.
    #[must_use]
    pub fn raw_expire_at(&self, key: &[u8]) -> Option<i64> {
        self.expiry.get(key).copied()
    }

    #[must_use]
    pub fn random_key(&self) -> Option<&Bytes> {
        let mut rng = rand::rng();
        self.main.keys().choose(&mut rng)
    }

    /// The active-expiry sweep (spec §4.B): samples up to 100 random
    /// entries from `expiry`, evicts the expired ones, and repeats while
    /// more than 25% of the sampled batch expired. Returns the total
    /// evicted this call.
    pub fn active_expire_cycle(&mut self, now: i64) -> usize {
        let mut total = 0;
        loop {
            if self.expiry.is_empty() {
                break;
            }
            let mut rng = rand::rng();
            let sample: Vec<Bytes> = self
                .expiry
                .keys()
                .cloned()
                .choose_multiple(&mut rng, ACTIVE_EXPIRE_SAMPLE);
            let sample_len = sample.len();
            let mut expired_this_round = 0;
            for key in &sample {
                if self.evict_if_expired(key, now) {
                    expired_this_round += 1;
                }
            }
            total += expired_this_round;
            if (expired_this_round as f64) <= ACTIVE_EXPIRE_THRESHOLD * sample_len as f64 {
                break;
            }
        }
        total
    }

    /// §5 "eligible expiring keys are sampled (3 per database)" for
    /// `maxmemory` eviction: the soonest-to-expire of a small random sample.
    #[must_use]
    pub fn sample_soonest_to_expire(&self, sample: usize) -> Option<Bytes> {
        let mut rng = rand::rng();
        self.expiry
            .iter()
            .choose_multiple(&mut rng, sample)
            .into_iter()
            .min_by_key(|(_, &at)| at)
            .map(|(k, _)| k.clone())
    }
}

/// The full keyspace: a fixed-size array of numbered databases.
///
/// `Clone` backs the background-save/rewrite path (spec §9 Design Notes:
/// a point-in-time copy standing in for the source's forked child) —
/// `ember-server`'s engine thread clones the keyspace once and hands the
/// copy to a plain `std::thread`, rather than forking the process.
#[derive(Debug, Clone)]
pub struct Keyspace {
    databases: Vec<Database>,
}

impl Keyspace {
    #[must_use]
    pub fn new(num_databases: usize) -> Self {
        Self { databases: (0..num_databases.max(1)).map(|_| Database::new()).collect() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn db(&self, index: usize) -> CoreResult<&Database> {
        self.databases.get(index).ok_or(CoreError::NoSuchDb)
    }

    pub fn db_mut(&mut self, index: usize) -> CoreResult<&mut Database> {
        self.databases.get_mut(index).ok_or(CoreError::NoSuchDb)
    }

    pub fn flush_db(&mut self, index: usize) -> CoreResult<()> {
        *self.db_mut(index)? = Database::new();
        Ok(())
    }

    pub fn flush_all(&mut self) {
        for db in &mut self.databases {
            *db = Database::new();
        }
    }

    /// Moves `key` from `from` to `to` (spec's `MOVE` command), failing if
    /// the key is absent from `from` or already present in `to`.
    pub fn move_key(&mut self, from: usize, to: usize, key: &[u8], now: i64) -> CoreResult<bool> {
        if from == to {
            return Err(CoreError::SameObject);
        }
        {
            let src = self.db_mut(from)?;
            if src.lookup_read(key, now).is_none() {
                return Ok(false);
            }
        }
        let already_there = self.db_mut(to)?.contains(key, now);
        if already_there {
            return Ok(false);
        }
        let src = self.db_mut(from)?;
        let value = src.main.remove(key).expect("presence checked above");
        let expiry = src.expiry.remove(key);
        let dest = self.db_mut(to)?;
        dest.main.insert(Bytes::copy_from_slice(key), value);
        if let Some(at) = expiry {
            dest.expiry.insert(Bytes::copy_from_slice(key), at);
        }
        Ok(true)
    }

    /// Runs the active-expiry sweep over every database (driven by the
    /// server's ~1 Hz timer).
    pub fn active_expire_all(&mut self, now: i64) -> usize {
        self.databases.iter_mut().map(|db| db.active_expire_cycle(now)).sum()
    }
}

/// A `SORT` `BY`/`GET` pattern resolver scoped to one database at one
/// instant, honoring expiry the same way `lookup_read` would.
pub struct DbPatternView<'a> {
    db: &'a Database,
    now: i64,
}

impl<'a> DbPatternView<'a> {
    #[must_use]
    pub fn new(db: &'a Database, now: i64) -> Self {
        Self { db, now }
    }

    fn live(&self, key: &[u8]) -> Option<&DataValue> {
        match self.db.expiry.get(key) {
            Some(&at) if at <= self.now => None,
            _ => self.db.main.get(key),
        }
    }
}

impl<'a> PatternResolver for DbPatternView<'a> {
    fn resolve_string(&self, key: &[u8]) -> Option<Bytes> {
        match self.live(key)? {
            DataValue::String(s) => Some(s.decode()),
            _ => None,
        }
    }

    fn resolve_hash_field(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
        match self.live(key)? {
            DataValue::Hash(h) => h.get(field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StringValue;

    fn s(v: &str) -> DataValue {
        DataValue::String(StringValue::new(Bytes::copy_from_slice(v.as_bytes())))
    }

    #[test]
    fn expiry_invariant_holds_after_set() {
        let mut db = Database::new();
        db.set(Bytes::from_static(b"k"), s("v"));
        assert!(db.set_expire(b"k", 1_000));
        assert!(db.delete(b"k"));
        assert_eq!(db.get_expire(b"k", 0), None);
    }

    #[test]
    fn expired_key_is_absent_on_read() {
        let mut db = Database::new();
        db.set(Bytes::from_static(b"k"), s("v"));
        db.set_expire(b"k", 100);
        assert!(db.lookup_read(b"k", 50).is_some());
        assert!(db.lookup_read(b"k", 150).is_none());
        assert!(!db.contains(b"k", 200));
    }

    #[test]
    fn persist_clears_expiry_without_deleting() {
        let mut db = Database::new();
        db.set(Bytes::from_static(b"k"), s("v"));
        db.set_expire(b"k", 100);
        assert!(db.persist(b"k"));
        assert_eq!(db.get_expire(b"k", 50), Some(None));
    }

    #[test]
    fn active_expire_cycle_removes_past_deadlines() {
        let mut db = Database::new();
        for i in 0..10 {
            let k = Bytes::from(format!("k{i}"));
            db.set(k.clone(), s("v"));
            db.set_expire(&k, if i < 5 { 10 } else { 1000 });
        }
        let removed = db.active_expire_cycle(100);
        assert_eq!(removed, 5);
        assert_eq!(db.len(), 5);
    }

    #[test]
    fn move_key_fails_on_same_db() {
        let mut ks = Keyspace::new(4);
        ks.db_mut(0).unwrap().set(Bytes::from_static(b"k"), s("v"));
        assert!(matches!(ks.move_key(0, 0, b"k", 0), Err(CoreError::SameObject)));
    }

    #[test]
    fn move_key_transfers_value_and_expiry() {
        let mut ks = Keyspace::new(4);
        ks.db_mut(0).unwrap().set(Bytes::from_static(b"k"), s("v"));
        ks.db_mut(0).unwrap().set_expire(b"k", 500);
        assert!(ks.move_key(0, 1, b"k", 0).unwrap());
        assert!(!ks.db_mut(0).unwrap().contains(b"k", 0));
        assert_eq!(ks.db_mut(1).unwrap().get_expire(b"k", 0), Some(Some(500)));
    }

    #[test]
    fn pattern_view_resolves_string_and_hash() {
        use crate::value::HashLimits;
        let mut db = Database::new();
        db.set(Bytes::from_static(b"weight_a"), s("3"));
        let mut h = crate::types::HashValue::new();
        h.set(Bytes::from_static(b"name"), Bytes::from_static(b"Alice"), HashLimits::default());
        db.set(Bytes::from_static(b"user_1"), DataValue::Hash(h));
        let view = DbPatternView::new(&db, 0);
        assert_eq!(view.resolve_string(b"weight_a"), Some(Bytes::from_static(b"3")));
        assert_eq!(view.resolve_hash_field(b"user_1", b"name"), Some(Bytes::from_static(b"Alice")));
    }
}
