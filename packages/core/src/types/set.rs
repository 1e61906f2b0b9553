//! The set engine (spec §4.C): O(1) membership, O(N) intersection scaled by
//! the smallest operand.

use std::collections::HashSet;

use bytes::Bytes;
use rand::seq::IteratorRandom;

/// An unordered set of distinct byte strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetValue(HashSet<Bytes>);

impl SetValue {
    #[must_use]
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Inserts members, returning the count of newly-added ones.
    pub fn add(&mut self, members: impl IntoIterator<Item = Bytes>) -> usize {
        let mut added = 0;
        for m in members {
            if self.0.insert(m) {
                added += 1;
            }
        }
        added
    }

    /// Removes members, returning the count actually removed.
    pub fn remove<'a>(&mut self, members: impl IntoIterator<Item = &'a [u8]>) -> usize {
        let mut removed = 0;
        for m in members {
            if self.0.remove(m) {
                removed += 1;
            }
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, member: &[u8]) -> bool {
        self.0.contains(member)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter()
    }

    pub fn from_members(members: impl IntoIterator<Item = Bytes>) -> Self {
        Self(members.into_iter().collect())
    }

    /// `SPOP`/`SRANDMEMBER` without replacement: samples up to `count`
    /// distinct members uniformly at random.
    #[must_use]
    pub fn sample(&self, count: usize) -> Vec<Bytes> {
        let mut rng = rand::rng();
        self.0.iter().cloned().choose_multiple(&mut rng, count)
    }

    /// `SRANDMEMBER` with a negative count: samples `count` members with
    /// replacement (duplicates allowed).
    #[must_use]
    pub fn sample_with_replacement(&self, count: usize) -> Vec<Bytes> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let pool: Vec<&Bytes> = self.0.iter().collect();
        let mut rng = rand::rng();
        (0..count)
            .map(|_| (*pool.iter().choose(&mut rng).expect("pool is non-empty")).clone())
            .collect()
    }

    /// Removes and returns up to `count` random members.
    pub fn pop(&mut self, count: usize) -> Vec<Bytes> {
        let chosen = self.sample(count);
        for m in &chosen {
            self.0.remove(m.as_ref());
        }
        chosen
    }

    /// `SINTER`: intersects `sets`, scaling work by the smallest operand by
    /// iterating it and probing membership in the rest.
    #[must_use]
    pub fn intersect(sets: &[&SetValue]) -> SetValue {
        let Some((smallest_idx, _)) = sets
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.len())
        else {
            return SetValue::new();
        };
        let smallest = sets[smallest_idx];
        let rest: Vec<&&SetValue> = sets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != smallest_idx)
            .map(|(_, s)| s)
            .collect();
        let result: HashSet<Bytes> = smallest
            .0
            .iter()
            .filter(|m| rest.iter().all(|s| s.contains(m)))
            .cloned()
            .collect();
        SetValue(result)
    }

    #[must_use]
    pub fn union(sets: &[&SetValue]) -> SetValue {
        let mut result = HashSet::new();
        for s in sets {
            result.extend(s.0.iter().cloned());
        }
        SetValue(result)
    }

    /// `SDIFF`: members of `sets[0]` absent from every other operand.
    #[must_use]
    pub fn difference(sets: &[&SetValue]) -> SetValue {
        let Some((first, rest)) = sets.split_first() else {
            return SetValue::new();
        };
        let result: HashSet<Bytes> = first
            .0
            .iter()
            .filter(|m| !rest.iter().any(|s| s.contains(m)))
            .cloned()
            .collect();
        SetValue(result)
    }

    /// `SMOVE`: transfers `member` from `self` to `dest`, returning whether
    /// the member was present in `self`.
    pub fn move_member(&mut self, dest: &mut SetValue, member: &[u8]) -> bool {
        if let Some(m) = self.0.take(member) {
            dest.0.insert(m);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn set(items: &[&str]) -> SetValue {
        SetValue::from_members(items.iter().map(|s| b(s)))
    }

    #[test]
    fn add_reports_new_count() {
        let mut s = SetValue::new();
        assert_eq!(s.add([b("a"), b("b")]), 2);
        assert_eq!(s.add([b("a"), b("c")]), 1);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn intersect_scales_by_smallest() {
        let a = set(&["a", "b", "c", "d"]);
        let small = set(&["b", "d"]);
        let result = SetValue::intersect(&[&a, &small]);
        assert_eq!(result.len(), 2);
        assert!(result.contains(b"b"));
        assert!(result.contains(b"d"));
    }

    #[test]
    fn union_deduplicates() {
        let a = set(&["a", "b"]);
        let b_ = set(&["b", "c"]);
        let result = SetValue::union(&[&a, &b_]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn difference_is_left_minus_rest() {
        let a = set(&["a", "b", "c"]);
        let b_ = set(&["b"]);
        let c = set(&["c"]);
        let result = SetValue::difference(&[&a, &b_, &c]);
        assert_eq!(result.len(), 1);
        assert!(result.contains(b"a"));
    }

    #[test]
    fn move_member_transfers_presence() {
        let mut a = set(&["a", "b"]);
        let mut b_ = SetValue::new();
        assert!(a.move_member(&mut b_, b"a"));
        assert!(!a.contains(b"a"));
        assert!(b_.contains(b"a"));
        assert!(!a.move_member(&mut b_, b"missing"));
    }

    #[test]
    fn pop_removes_sampled_members() {
        let mut s = set(&["a", "b", "c"]);
        let popped = s.pop(2);
        assert_eq!(popped.len(), 2);
        assert_eq!(s.len(), 1);
    }
}
