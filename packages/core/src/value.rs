//! The polymorphic value container (spec §3, §4.A) and its string encodings.
//!
//! Real single-threaded KV daemons model a value as a tagged union with a
//! manually-managed refcount; `ember` instead models it as an ordinary Rust
//! enum owned by its keyspace entry (spec §9 Design Notes: "model this as a
//! tagged variant with each arm owning its payload"). Sharing across the
//! dispatcher (e.g. for the replication feed) uses `Bytes`'s own cheap clone
//! rather than a hand-rolled retain/release pair.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{CoreError, CoreResult};
use crate::types::hash::HashValue;
use crate::types::list::ListValue;
use crate::types::set::SetValue;
use crate::types::zset::SortedSet;

/// The kind tag of a [`DataValue`] (spec §3: "a kind tag").
///
/// Kept distinct from `DataValue`'s own discriminant so the paging layer
/// (`ember-server::paging`) can record the kind of a value that has been
/// swapped out and no longer has a resident payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    List,
    Set,
    SortedSet,
    Hash,
}

impl ValueKind {
    /// The name used by the `TYPE` command and `DEBUG OBJECT`.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::SortedSet => "zset",
            ValueKind::Hash => "hash",
        }
    }
}

/// A string value, opportunistically encoded (spec §3 "String encodings").
///
/// `Int` is only used when the raw bytes are the canonical (no leading zero,
/// no leading `+`, fits in `i64`) decimal form of an integer; this mirrors
/// the spec's invariant that encoding is chosen opportunistically and is
/// purely a serialization/memory optimization, never observable except
/// through `OBJECT ENCODING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringValue {
    Raw(Bytes),
    Int(i64),
}

impl StringValue {
    /// Creates a string value from raw bytes, opportunistically encoding it
    /// as an integer when the bytes are its canonical decimal form.
    #[must_use]
    pub fn new(bytes: Bytes) -> Self {
        match canonical_integer(&bytes) {
            Some(i) => StringValue::Int(i),
            None => StringValue::Raw(bytes),
        }
    }

    /// Attempts to convert a `Raw` value to `Int` encoding in place.
    ///
    /// Returns `false` (a no-op) if the value is already `Int`-encoded or is
    /// not the canonical decimal form of an `i64` — matching §4.A's
    /// "on a shared or already-encoded object, fails" (sharing is irrelevant
    /// here since `Bytes` clones are cheap and this type is never aliased).
    pub fn try_encode(&mut self) -> bool {
        if let StringValue::Raw(bytes) = self {
            if let Some(i) = canonical_integer(bytes) {
                *self = StringValue::Int(i);
                return true;
            }
        }
        false
    }

    /// Decodes to a byte view, allocating only when `Int`-encoded.
    #[must_use]
    pub fn decode(&self) -> Bytes {
        match self {
            StringValue::Raw(b) => b.clone(),
            StringValue::Int(i) => Bytes::from(i.to_string()),
        }
    }

    /// The printable decimal width for an `Int`, else the byte length.
    #[must_use]
    pub fn string_len(&self) -> usize {
        match self {
            StringValue::Raw(b) => b.len(),
            StringValue::Int(i) => int_digit_len(*i),
        }
    }

    /// Byte-equality after conceptual decoding, comparing integer-encoded
    /// operands via textual normalization rather than allocating for both.
    #[must_use]
    pub fn bytes_eq(&self, other: &StringValue) -> bool {
        match (self, other) {
            (StringValue::Raw(a), StringValue::Raw(b)) => a == b,
            (StringValue::Int(a), StringValue::Int(b)) => a == b,
            (StringValue::Int(i), StringValue::Raw(b)) | (StringValue::Raw(b), StringValue::Int(i)) => {
                canonical_integer(b) == Some(*i)
            }
        }
    }

    /// Interprets the value as an `i64`, for `INCR`/`DECRBY` and friends.
    pub fn as_i64(&self) -> CoreResult<i64> {
        match self {
            StringValue::Int(i) => Ok(*i),
            StringValue::Raw(b) => canonical_integer(b).ok_or(CoreError::NotAnInteger),
        }
    }

    /// Interprets the value as an `f64`, for commands that accept a float.
    pub fn as_f64(&self) -> CoreResult<f64> {
        match self {
            StringValue::Int(i) => Ok(*i as f64),
            StringValue::Raw(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|f| !f.is_nan())
                .ok_or(CoreError::NotAFloat),
        }
    }

    /// Whether this value is currently `Int`-encoded (for `OBJECT ENCODING`).
    #[must_use]
    pub fn is_int_encoded(&self) -> bool {
        matches!(self, StringValue::Int(_))
    }
}

fn int_digit_len(i: i64) -> usize {
    if i == 0 {
        return 1;
    }
    let mut n = i.unsigned_abs();
    let mut len = if i < 0 { 1 } else { 0 };
    while n > 0 {
        len += 1;
        n /= 10;
    }
    len
}

/// Returns `Some(i)` iff `bytes` is the canonical decimal form of `i` — no
/// leading zeros (other than the literal `"0"`), no leading `+`, and no
/// surrounding whitespace, so that re-encoding `i` back to decimal yields
/// exactly `bytes`. This is what makes `Int` encoding transparent: decoding
/// an `Int` always reconstructs the original bytes.
fn canonical_integer(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let s = std::str::from_utf8(bytes).ok()?;
    let i: i64 = s.parse().ok()?;
    if i.to_string().as_bytes() == bytes {
        Some(i)
    } else {
        None
    }
}

/// The polymorphic value container (spec §3). One arm per data-type engine,
/// plus `Swapped` — the placeholder an entry is replaced with while its
/// payload lives in `ember-server`'s paging swap file (spec §3: "a Swapped
/// object has no in-memory payload"). `ember-core` does no paging I/O
/// itself; this variant only carries the tag the spec says the object
/// keeps even while off-heap (the out-of-memory kind), so `TYPE`,
/// `OBJECT ENCODING`, and friends still have a kind to report for a
/// swapped-out key without ember-server reaching into private keyspace
/// internals to track it out-of-band.
#[derive(Debug, Clone)]
pub enum DataValue {
    String(StringValue),
    List(ListValue),
    Set(SetValue),
    SortedSet(SortedSet),
    Hash(HashValue),
    Swapped(ValueKind),
}

impl DataValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            DataValue::String(_) => ValueKind::String,
            DataValue::List(_) => ValueKind::List,
            DataValue::Set(_) => ValueKind::Set,
            DataValue::SortedSet(_) => ValueKind::SortedSet,
            DataValue::Hash(_) => ValueKind::Hash,
            DataValue::Swapped(k) => *k,
        }
    }

    /// Whether this entry is currently paged out (spec §4.J).
    #[must_use]
    pub fn is_swapped(&self) -> bool {
        matches!(self, DataValue::Swapped(_))
    }

    /// Rough in-memory byte cost, used by the paging subsystem's swap-out
    /// scoring (spec §4.J) and `maxmemory` accounting (spec §5). A swapped
    /// entry costs nothing resident by definition.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        match self {
            DataValue::String(s) => s.string_len(),
            DataValue::List(l) => l.iter().map(Bytes::len).sum(),
            DataValue::Set(s) => s.iter().map(Bytes::len).sum(),
            DataValue::SortedSet(z) => z.estimated_bytes(),
            DataValue::Hash(h) => h.estimated_bytes(),
            DataValue::Swapped(_) => 0,
        }
    }

    /// Constructs a fresh empty value of a given kind, for the
    /// create-on-first-write pattern every data-type command uses (spec
    /// §4.C "creation from empty").
    #[must_use]
    pub fn empty(kind: ValueKind) -> Self {
        match kind {
            ValueKind::String => DataValue::String(StringValue::Raw(Bytes::new())),
            ValueKind::List => DataValue::List(ListValue::new()),
            ValueKind::Set => DataValue::Set(SetValue::new()),
            ValueKind::SortedSet => DataValue::SortedSet(SortedSet::new()),
            ValueKind::Hash => DataValue::Hash(HashValue::new()),
        }
    }

    pub fn as_string(&self) -> CoreResult<&StringValue> {
        match self {
            DataValue::String(s) => Ok(s),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_string_mut(&mut self) -> CoreResult<&mut StringValue> {
        match self {
            DataValue::String(s) => Ok(s),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_list_mut(&mut self) -> CoreResult<&mut ListValue> {
        match self {
            DataValue::List(l) => Ok(l),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_list(&self) -> CoreResult<&ListValue> {
        match self {
            DataValue::List(l) => Ok(l),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_set_mut(&mut self) -> CoreResult<&mut SetValue> {
        match self {
            DataValue::Set(s) => Ok(s),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_set(&self) -> CoreResult<&SetValue> {
        match self {
            DataValue::Set(s) => Ok(s),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_zset_mut(&mut self) -> CoreResult<&mut SortedSet> {
        match self {
            DataValue::SortedSet(z) => Ok(z),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_zset(&self) -> CoreResult<&SortedSet> {
        match self {
            DataValue::SortedSet(z) => Ok(z),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_hash_mut(&mut self) -> CoreResult<&mut HashValue> {
        match self {
            DataValue::Hash(h) => Ok(h),
            _ => Err(CoreError::WrongType),
        }
    }

    pub fn as_hash(&self) -> CoreResult<&HashValue> {
        match self {
            DataValue::Hash(h) => Ok(h),
            _ => Err(CoreError::WrongType),
        }
    }
}

/// Map of per-key hash-zipmap watermarks, threaded through from server
/// config into the hash engine (spec §3 "Hash encodings").
#[derive(Debug, Clone, Copy)]
pub struct HashLimits {
    pub max_zipmap_entries: usize,
    pub max_zipmap_value: usize,
}

impl Default for HashLimits {
    fn default() -> Self {
        Self {
            max_zipmap_entries: 64,
            max_zipmap_value: 512,
        }
    }
}

/// Shared map of key → back-reference state kept alongside a hash map; used
/// nowhere in `ember-core` itself but re-exported for `HashMap<Bytes, _>`
/// call sites in the server crate that want the same hasher as everything
/// else here (the default `RandomState`, matching spec §3's plain
/// byte-equality semantics — no custom hashing is required).
pub type BytesMap<V> = HashMap<Bytes, V>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_value_opportunistic_int_encoding() {
        let v = StringValue::new(Bytes::from_static(b"12345"));
        assert!(v.is_int_encoded());
        assert_eq!(v.decode(), Bytes::from_static(b"12345"));
    }

    #[test]
    fn leading_zero_is_not_int_encoded() {
        let v = StringValue::new(Bytes::from_static(b"0123"));
        assert!(!v.is_int_encoded());
    }

    #[test]
    fn negative_zero_is_not_canonical() {
        assert_eq!(canonical_integer(b"-0"), None);
        assert_eq!(canonical_integer(b"0"), Some(0));
    }

    #[test]
    fn string_len_matches_decoded_width() {
        let v = StringValue::new(Bytes::from_static(b"-42"));
        assert_eq!(v.string_len(), 3);
        let v = StringValue::new(Bytes::from_static(b"hello"));
        assert_eq!(v.string_len(), 5);
    }

    #[test]
    fn bytes_eq_normalizes_int_and_raw() {
        let a = StringValue::Int(7);
        let b = StringValue::Raw(Bytes::from_static(b"7"));
        assert!(a.bytes_eq(&b));
        let c = StringValue::Raw(Bytes::from_static(b"07"));
        assert!(!a.bytes_eq(&c));
    }

    #[test]
    fn try_encode_converts_canonical_raw() {
        let mut v = StringValue::Raw(Bytes::from_static(b"99"));
        assert!(v.try_encode());
        assert!(v.is_int_encoded());

        let mut v = StringValue::Raw(Bytes::from_static(b"abc"));
        assert!(!v.try_encode());
    }
}
