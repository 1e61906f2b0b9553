//! The hash engine (spec §3 "Hash encodings", §4.C): a compact zipmap
//! representation for small hashes, converting one-way to a hashtable once
//! either watermark is exceeded.

use std::collections::HashMap;

use bytes::Bytes;

use crate::value::HashLimits;

/// A hash value, in one of two encodings. Conversion from `Zipmap` to
/// `Table` is one-way (spec §3): once a hash has crossed either watermark
/// it never converts back, even if entries are later removed.
#[derive(Debug, Clone)]
pub enum HashValue {
    /// Small hashes: an insertion-ordered sequence of key/value pairs,
    /// conceptually a single length-prefixed byte buffer. Lookups are O(N);
    /// kept as a `Vec` of pairs rather than a literal packed buffer since
    /// nothing in this crate serializes it except the snapshot writer,
    /// which walks pairs in order.
    Zipmap(Vec<(Bytes, Bytes)>),
    Table(HashMap<Bytes, Bytes>),
}

impl Default for HashValue {
    fn default() -> Self {
        HashValue::Zipmap(Vec::new())
    }
}

impl HashValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            HashValue::Zipmap(v) => v.len(),
            HashValue::Table(m) => m.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_zipmap(&self) -> bool {
        matches!(self, HashValue::Zipmap(_))
    }

    #[must_use]
    pub fn get(&self, field: &[u8]) -> Option<Bytes> {
        match self {
            HashValue::Zipmap(v) => v.iter().find(|(k, _)| k.as_ref() == field).map(|(_, v)| v.clone()),
            HashValue::Table(m) => m.get(field).cloned(),
        }
    }

    #[must_use]
    pub fn contains(&self, field: &[u8]) -> bool {
        match self {
            HashValue::Zipmap(v) => v.iter().any(|(k, _)| k.as_ref() == field),
            HashValue::Table(m) => m.contains_key(field),
        }
    }

    /// `HSET`: inserts or overwrites `field`, auto-converting to the
    /// hashtable encoding when `limits` are exceeded by the result. Returns
    /// whether `field` was newly added (not previously present).
    pub fn set(&mut self, field: Bytes, value: Bytes, limits: HashLimits) -> bool {
        let is_new = match self {
            HashValue::Zipmap(v) => match v.iter_mut().find(|(k, _)| *k == field) {
                Some(entry) => {
                    entry.1 = value.clone();
                    false
                }
                None => {
                    v.push((field.clone(), value.clone()));
                    true
                }
            },
            HashValue::Table(m) => m.insert(field.clone(), value.clone()).is_none(),
        };
        self.maybe_convert(&field, &value, limits);
        is_new
    }

    fn maybe_convert(&mut self, field: &Bytes, value: &Bytes, limits: HashLimits) {
        if let HashValue::Zipmap(v) = self {
            let over_entries = v.len() > limits.max_zipmap_entries;
            let over_value = field.len() > limits.max_zipmap_value || value.len() > limits.max_zipmap_value;
            if over_entries || over_value {
                let table: HashMap<Bytes, Bytes> = v.drain(..).collect();
                *self = HashValue::Table(table);
            }
        }
    }

    /// `HDEL`: removes `field`, returning whether it was present. Never
    /// converts a `Table` back to `Zipmap`.
    pub fn remove(&mut self, field: &[u8]) -> bool {
        match self {
            HashValue::Zipmap(v) => {
                let before = v.len();
                v.retain(|(k, _)| k.as_ref() != field);
                v.len() != before
            }
            HashValue::Table(m) => m.remove(field).is_some(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Bytes> {
        match self {
            HashValue::Zipmap(v) => v.iter().map(|(k, _)| k.clone()).collect(),
            HashValue::Table(m) => m.keys().cloned().collect(),
        }
    }

    #[must_use]
    pub fn values(&self) -> Vec<Bytes> {
        match self {
            HashValue::Zipmap(v) => v.iter().map(|(_, v)| v.clone()).collect(),
            HashValue::Table(m) => m.values().cloned().collect(),
        }
    }

    #[must_use]
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&Bytes, &Bytes)> + '_> {
        match self {
            HashValue::Zipmap(v) => Box::new(v.iter().map(|(k, v)| (k, v))),
            HashValue::Table(m) => Box::new(m.iter()),
        }
    }

    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Constructs a hash from pairs, applying the zipmap/table watermark
    /// decision the same way repeated `HSET`s would — used when loading a
    /// snapshot's hash entries.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Bytes, Bytes)>, limits: HashLimits) -> Self {
        let mut h = HashValue::new();
        for (k, v) in pairs {
            h.set(k, v, limits);
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn limits(entries: usize, value: usize) -> HashLimits {
        HashLimits { max_zipmap_entries: entries, max_zipmap_value: value }
    }

    #[test]
    fn stays_zipmap_under_watermark() {
        let lim = limits(3, 64);
        let mut h = HashValue::new();
        h.set(b("k1"), b("v1"), lim);
        h.set(b("k2"), b("v2"), lim);
        h.set(b("k3"), b("v3"), lim);
        assert!(h.is_zipmap());
        assert_eq!(h.get(b"k1"), Some(b("v1")));
    }

    #[test]
    fn converts_on_entry_count_and_stays_converted() {
        let lim = limits(3, 64);
        let mut h = HashValue::new();
        for i in 0..4 {
            h.set(Bytes::from(format!("k{i}")), Bytes::from(format!("v{i}")), lim);
        }
        assert!(!h.is_zipmap());
        h.remove(b"k0");
        h.remove(b"k1");
        assert!(!h.is_zipmap(), "conversion must never reverse");
    }

    #[test]
    fn converts_on_oversized_value() {
        let lim = limits(64, 4);
        let mut h = HashValue::new();
        h.set(b("k"), Bytes::from("this value exceeds four bytes"), lim);
        assert!(!h.is_zipmap());
    }

    #[test]
    fn hset_overwrite_reports_not_new() {
        let lim = limits(64, 64);
        let mut h = HashValue::new();
        assert!(h.set(b("k"), b("v1"), lim));
        assert!(!h.set(b("k"), b("v2"), lim));
        assert_eq!(h.get(b"k"), Some(b("v2")));
    }
}
