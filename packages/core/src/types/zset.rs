//! The sorted-set engine (spec §4.C, §9 Design Notes "single sorted-set data
//! structure driving two views"): a map from member to score for O(1) score
//! lookup, and a skip list ordered by `(score, member)` for O(log N) ordered
//! traversal and rank queries. Both are kept consistent within every mutation
//! that takes `&mut self`.

use std::collections::HashMap;

use bytes::Bytes;
use rand::Rng;
use smallvec::SmallVec;

const SKIPLIST_MAX_LEVEL: usize = 32;
const SKIPLIST_P: f64 = 0.25;
/// Most nodes land at level 1-2 (`P = 0.25`); inlining a handful of levels
/// avoids a heap allocation per node in the common case.
const NODE_LEVEL_INLINE: usize = 4;

#[derive(Debug, Clone)]
struct Level {
    forward: Option<usize>,
    span: u64,
}

#[derive(Debug, Clone)]
struct Node {
    member: Bytes,
    score: f64,
    backward: Option<usize>,
    levels: SmallVec<[Level; NODE_LEVEL_INLINE]>,
}

fn less_than(score_a: f64, member_a: &[u8], score_b: f64, member_b: &[u8]) -> bool {
    score_a < score_b || (score_a == score_b && member_a < member_b)
}

fn random_level() -> usize {
    let mut level = 1;
    let mut rng = rand::rng();
    while rng.random::<f64>() < SKIPLIST_P && level < SKIPLIST_MAX_LEVEL {
        level += 1;
    }
    level
}

/// A safe-Rust arena-backed skip list: node slots are addressed by index
/// rather than pointer, with freed slots recycled via `free`.
#[derive(Debug, Clone)]
struct SkipList {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Vec<Level>,
    tail: Option<usize>,
    length: usize,
    level: usize,
}

impl SkipList {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: (0..SKIPLIST_MAX_LEVEL)
                .map(|_| Level { forward: None, span: 0 })
                .collect(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    fn node(&self, idx: usize) -> &Node {
        self.slots[idx].as_ref().expect("node slot is live while referenced")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].as_mut().expect("node slot is live while referenced")
    }

    fn forward_of(&self, x: Option<usize>, level: usize) -> Option<usize> {
        match x {
            None => self.head[level].forward,
            Some(i) => self.node(i).levels[level].forward,
        }
    }

    fn span_of(&self, x: Option<usize>, level: usize) -> u64 {
        match x {
            None => self.head[level].span,
            Some(i) => self.node(i).levels[level].span,
        }
    }

    fn set_forward(&mut self, x: Option<usize>, level: usize, val: Option<usize>) {
        match x {
            None => self.head[level].forward = val,
            Some(i) => self.node_mut(i).levels[level].forward = val,
        }
    }

    fn set_span(&mut self, x: Option<usize>, level: usize, val: u64) {
        match x {
            None => self.head[level].span = val,
            Some(i) => self.node_mut(i).levels[level].span = val,
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(i) = self.free.pop() {
            self.slots[i] = Some(node);
            i
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn free_slot(&mut self, idx: usize) {
        self.slots[idx] = None;
        self.free.push(idx);
    }

    fn insert(&mut self, score: f64, member: Bytes) -> usize {
        let mut update: Vec<Option<usize>> = vec![None; SKIPLIST_MAX_LEVEL];
        let mut rank: Vec<u64> = vec![0; SKIPLIST_MAX_LEVEL];
        let mut x: Option<usize> = None;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let Some(fi) = self.forward_of(x, i) else { break };
                let node = self.node(fi);
                if less_than(node.score, &node.member, score, &member) {
                    rank[i] += self.span_of(x, i);
                    x = Some(fi);
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let level = random_level();
        if level > self.level {
            for lvl in update.iter_mut().take(level).skip(self.level) {
                *lvl = None;
                // rank[i] left at 0; head spans the whole list at new levels.
            }
            for i in self.level..level {
                self.head[i].span = self.length as u64;
            }
            self.level = level;
        }

        let idx = self.alloc(Node {
            member: member.clone(),
            score,
            backward: None,
            levels: (0..level).map(|_| Level { forward: None, span: 0 }).collect(),
        });

        for i in 0..level {
            // Capture the pre-insertion span before rewiring update[i]'s
            // forward pointer, so the split below is computed from the old
            // value (zslInsert's `update[i]->level[i].span`).
            let old_span = self.span_of(update[i], i);
            let fwd = self.forward_of(update[i], i);
            self.set_forward(Some(idx), i, fwd);
            self.set_forward(update[i], i, Some(idx));
            self.node_mut(idx).levels[i].span = old_span - (rank[0] - rank[i]) + 1;
            self.set_span(update[i], i, rank[0] - rank[i] + 1);
        }
        // Levels above the new node's height just gained one more node in
        // their span, since `idx` now lies within them without being one of
        // their own forward targets.
        for i in level..self.level {
            let s = self.span_of(update[i], i);
            self.set_span(update[i], i, s + 1);
        }

        let back = update[0];
        self.node_mut(idx).backward = back;
        if let Some(fi) = self.forward_of(Some(idx), 0) {
            self.node_mut(fi).backward = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.length += 1;
        idx
    }

    fn delete(&mut self, score: f64, member: &[u8]) -> bool {
        let mut update: Vec<Option<usize>> = vec![None; SKIPLIST_MAX_LEVEL];
        let mut x: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let Some(fi) = self.forward_of(x, i) else { break };
                let node = self.node(fi);
                if less_than(node.score, &node.member, score, member) {
                    x = Some(fi);
                } else {
                    break;
                }
            }
            update[i] = x;
        }
        let candidate = self.forward_of(update[0], 0);
        if let Some(ci) = candidate {
            let node = self.node(ci);
            if node.score == score && node.member.as_ref() == member {
                self.unlink(ci, &update);
                return true;
            }
        }
        false
    }

    fn unlink(&mut self, idx: usize, update: &[Option<usize>]) {
        let node_level = self.node(idx).levels.len();
        for i in 0..self.level {
            if i < node_level && self.forward_of(update[i], i) == Some(idx) {
                let node_span = self.node(idx).levels[i].span;
                let node_fwd = self.node(idx).levels[i].forward;
                let combined = self.span_of(update[i], i) + node_span - 1;
                self.set_span(update[i], i, combined);
                self.set_forward(update[i], i, node_fwd);
            } else {
                let s = self.span_of(update[i], i);
                self.set_span(update[i], i, s.saturating_sub(1));
            }
        }
        let fwd0 = self.node(idx).levels[0].forward;
        let back = self.node(idx).backward;
        if let Some(fi) = fwd0 {
            self.node_mut(fi).backward = back;
        } else {
            self.tail = back;
        }
        while self.level > 1 && self.head[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.free_slot(idx);
    }

    fn rank_of(&self, score: f64, member: &[u8]) -> Option<usize> {
        let mut rank: u64 = 0;
        let mut x: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let Some(fi) = self.forward_of(x, i) else { break };
                let node = self.node(fi);
                let advance = node.score < score || (node.score == score && node.member.as_ref() <= member);
                if !advance {
                    break;
                }
                rank += self.span_of(x, i);
                x = Some(fi);
            }
        }
        match x {
            Some(xi) if self.node(xi).member.as_ref() == member => Some(rank as usize),
            _ => None,
        }
    }

    fn node_at_rank(&self, rank: usize) -> Option<usize> {
        let target = rank as u64 + 1;
        let mut traversed: u64 = 0;
        let mut x: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let Some(fi) = self.forward_of(x, i) else { break };
                let span = self.span_of(x, i);
                if traversed + span <= target {
                    traversed += span;
                    x = Some(fi);
                } else {
                    break;
                }
            }
            if traversed == target {
                break;
            }
        }
        if traversed == target {
            x
        } else {
            None
        }
    }

    fn first_at_or_above(&self, min: f64, min_exclusive: bool) -> Option<usize> {
        let mut x: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let Some(fi) = self.forward_of(x, i) else { break };
                let node = self.node(fi);
                let below = if min_exclusive { node.score <= min } else { node.score < min };
                if below {
                    x = Some(fi);
                } else {
                    break;
                }
            }
        }
        self.forward_of(x, 0)
    }

    fn score_in_range(score: f64, max: f64, max_exclusive: bool) -> bool {
        if max_exclusive {
            score < max
        } else {
            score <= max
        }
    }

    fn iter_from(&self, start: Option<usize>) -> SkipIter<'_> {
        SkipIter { list: self, cursor: start }
    }

    fn first(&self) -> Option<usize> {
        self.head[0].forward
    }
}

struct SkipIter<'a> {
    list: &'a SkipList,
    cursor: Option<usize>,
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.node(idx);
        self.cursor = node.levels[0].forward;
        Some(node)
    }
}

/// A sorted-set value (spec §3 "Sorted-set value").
#[derive(Debug, Clone)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    list: SkipList,
}

impl Default for SortedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedSet {
    #[must_use]
    pub fn new() -> Self {
        Self { scores: HashMap::new(), list: SkipList::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    #[must_use]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// The shared `ZADD`/`ZINCRBY` primitive (spec §4.C): either replaces a
    /// member's score or adds `score` to its current score (`incr = true`,
    /// starting from `0.0` if absent). Returns the member's score after the
    /// update, and whether this was a newly-added member.
    pub fn upsert(&mut self, member: Bytes, score: f64, incr: bool) -> (f64, bool) {
        let existing = self.scores.get(&member).copied();
        let new_score = if incr { existing.unwrap_or(0.0) + score } else { score };
        if let Some(old_score) = existing {
            if old_score != new_score {
                self.list.delete(old_score, &member);
                self.list.insert(new_score, member.clone());
            }
            self.scores.insert(member, new_score);
            (new_score, false)
        } else {
            self.list.insert(new_score, member.clone());
            self.scores.insert(member, new_score);
            (new_score, true)
        }
    }

    /// `ZREM`: removes `member`, returning whether it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.list.delete(score, member);
                true
            }
            None => false,
        }
    }

    /// `ZRANK`: 0-based ascending rank, or `None` if the member is absent.
    #[must_use]
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        self.list.rank_of(score, member)
    }

    /// `ZREVRANK`: 0-based descending rank.
    #[must_use]
    pub fn rev_rank(&self, member: &[u8]) -> Option<usize> {
        let r = self.rank(member)?;
        Some(self.len() - 1 - r)
    }

    fn clamp_rank_range(&self, start: i64, stop: i64) -> Option<(usize, usize)> {
        let len = self.len() as i64;
        if len == 0 {
            return None;
        }
        let mut start = if start < 0 { (len + start).max(0) } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop >= len {
            stop = len - 1;
        }
        if start > stop || start >= len || stop < 0 {
            return None;
        }
        Some((start as usize, stop as usize))
    }

    /// `ZRANGE`: ascending `(member, score)` pairs over the inclusive,
    /// possibly-negative rank range `[start, stop]`.
    #[must_use]
    pub fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let Some((s, e)) = self.clamp_rank_range(start, stop) else {
            return Vec::new();
        };
        let Some(first) = self.list.node_at_rank(s) else {
            return Vec::new();
        };
        self.list
            .iter_from(Some(first))
            .take(e - s + 1)
            .map(|n| (n.member.clone(), n.score))
            .collect()
    }

    /// `ZREVRANGE`: the same rank window, in descending order.
    #[must_use]
    pub fn rev_range_by_rank(&self, start: i64, stop: i64) -> Vec<(Bytes, f64)> {
        let len = self.len() as i64;
        if len == 0 {
            return Vec::new();
        }
        // Map descending ranks onto the ascending skiplist's ranks and
        // reverse the collected slice.
        let fwd_stop = -(start) - 1;
        let fwd_start = -(stop) - 1;
        let mut v = self.range_by_rank(fwd_start, fwd_stop);
        v.reverse();
        v
    }

    /// `ZRANGEBYSCORE`/`ZCOUNT` support: ascending `(member, score)` pairs
    /// with `score ∈ (min, max)` per the exclusivity flags, optionally
    /// sliced by `(offset, count)` the way `LIMIT` does for `SORT`.
    #[must_use]
    pub fn range_by_score(
        &self,
        min: f64,
        min_exclusive: bool,
        max: f64,
        max_exclusive: bool,
        offset: usize,
        count: Option<usize>,
    ) -> Vec<(Bytes, f64)> {
        let Some(first) = self.list.first_at_or_above(min, min_exclusive) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for node in self.list.iter_from(Some(first)) {
            if !SkipList::score_in_range(node.score, max, max_exclusive) {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push((node.member.clone(), node.score));
            if let Some(c) = count {
                if out.len() >= c {
                    break;
                }
            }
        }
        out
    }

    /// `ZCOUNT`: number of members with `score ∈ (min, max)`.
    #[must_use]
    pub fn count_by_score(&self, min: f64, min_exclusive: bool, max: f64, max_exclusive: bool) -> usize {
        self.range_by_score(min, min_exclusive, max, max_exclusive, 0, None).len()
    }

    /// `ZREMRANGEBYSCORE`: removes all members with `score ∈ (min, max)`,
    /// returning the count removed.
    pub fn remove_range_by_score(&mut self, min: f64, min_exclusive: bool, max: f64, max_exclusive: bool) -> usize {
        let victims: Vec<Bytes> = self
            .range_by_score(min, min_exclusive, max, max_exclusive, 0, None)
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        for m in &victims {
            self.remove(m);
        }
        victims.len()
    }

    /// `ZREMRANGEBYRANK`: removes the inclusive rank window, returning the
    /// count removed.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> usize {
        let victims: Vec<Bytes> = self.range_by_rank(start, stop).into_iter().map(|(m, _)| m).collect();
        for m in &victims {
            self.remove(m);
        }
        victims.len()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &f64)> {
        self.scores.iter()
    }

    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.scores.keys().map(|m| m.len() + 16).sum()
    }

    /// `ZUNION`/`ZINTER` aggregation kinds.
    #[must_use]
    pub fn aggregate(sets: &[&SortedSet], op: AggregateOp, combine: Combine) -> SortedSet {
        let mut acc: HashMap<Bytes, f64> = HashMap::new();
        match op {
            AggregateOp::Union => {
                for s in sets {
                    for (m, sc) in s.iter() {
                        acc.entry(m.clone())
                            .and_modify(|cur| *cur = combine.apply(*cur, *sc))
                            .or_insert(*sc);
                    }
                }
            }
            AggregateOp::Inter => {
                if let Some((first, rest)) = sets.split_first() {
                    'members: for (m, sc) in first.iter() {
                        let mut acc_score = *sc;
                        for other in rest {
                            match other.score(m) {
                                Some(other_score) => acc_score = combine.apply(acc_score, other_score),
                                None => continue 'members,
                            }
                        }
                        acc.insert(m.clone(), acc_score);
                    }
                }
            }
        }
        let mut out = SortedSet::new();
        for (m, sc) in acc {
            out.upsert(m, sc, false);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Union,
    Inter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Sum,
    Min,
    Max,
}

impl Combine {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Combine::Sum => a + b,
            Combine::Min => a.min(b),
            Combine::Max => a.max(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn ordering_is_score_then_member() {
        let mut z = SortedSet::new();
        z.upsert(b("a"), 1.0, false);
        z.upsert(b("b"), 2.0, false);
        z.upsert(b("c"), 1.0, false);
        let r = z.range_by_rank(0, -1);
        assert_eq!(r, vec![(b("a"), 1.0), (b("c"), 1.0), (b("b"), 2.0)]);
    }

    #[test]
    fn rank_and_revrank_are_inverses() {
        let mut z = SortedSet::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            z.upsert(b(m), s, false);
        }
        let len = z.len();
        for m in ["a", "b", "c"] {
            let r = z.rank(b(m).as_ref()).unwrap();
            let rr = z.rev_rank(b(m).as_ref()).unwrap();
            assert_eq!(r + rr, len - 1);
        }
    }

    #[test]
    fn incr_primitive_shared_with_zadd() {
        let mut z = SortedSet::new();
        z.upsert(b("a"), 5.0, false);
        let (score, is_new) = z.upsert(b("a"), 3.0, true);
        assert_eq!(score, 8.0);
        assert!(!is_new);
    }

    #[test]
    fn remove_then_rank_is_none() {
        let mut z = SortedSet::new();
        z.upsert(b("a"), 1.0, false);
        assert!(z.remove(b"a"));
        assert_eq!(z.rank(b"a"), None);
        assert!(!z.remove(b"a"));
    }

    #[test]
    fn range_by_score_respects_exclusivity() {
        let mut z = SortedSet::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            z.upsert(b(m), s, false);
        }
        let inclusive = z.range_by_score(1.0, false, 3.0, false, 0, None);
        assert_eq!(inclusive.len(), 3);
        let exclusive = z.range_by_score(1.0, true, 3.0, true, 0, None);
        assert_eq!(exclusive, vec![(b("b"), 2.0)]);
    }

    #[test]
    fn remove_range_by_rank_shrinks_set() {
        let mut z = SortedSet::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            z.upsert(b(m), s, false);
        }
        let n = z.remove_range_by_rank(1, 2);
        assert_eq!(n, 2);
        assert_eq!(z.range_by_rank(0, -1), vec![(b("a"), 1.0), (b("d"), 4.0)]);
    }

    #[test]
    fn union_sums_scores_by_default() {
        let mut a = SortedSet::new();
        a.upsert(b("x"), 1.0, false);
        let mut c = SortedSet::new();
        c.upsert(b("x"), 2.0, false);
        c.upsert(b("y"), 5.0, false);
        let u = SortedSet::aggregate(&[&a, &c], AggregateOp::Union, Combine::Sum);
        assert_eq!(u.score(b"x"), Some(3.0));
        assert_eq!(u.score(b"y"), Some(5.0));
    }

    #[test]
    fn inter_keeps_only_common_members() {
        let mut a = SortedSet::new();
        a.upsert(b("x"), 1.0, false);
        a.upsert(b("y"), 1.0, false);
        let mut c = SortedSet::new();
        c.upsert(b("x"), 2.0, false);
        let i = SortedSet::aggregate(&[&a, &c], AggregateOp::Inter, Combine::Sum);
        assert_eq!(i.len(), 1);
        assert_eq!(i.score(b"x"), Some(3.0));
    }

    #[test]
    fn many_inserts_and_deletes_keep_skiplist_consistent() {
        let mut z = SortedSet::new();
        for i in 0..200i64 {
            z.upsert(Bytes::from(format!("m{i}")), i as f64, false);
        }
        for i in (0..200i64).step_by(2) {
            assert!(z.remove(format!("m{i}").as_bytes()));
        }
        assert_eq!(z.len(), 100);
        let all = z.range_by_rank(0, -1);
        for w in all.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
    }
}
