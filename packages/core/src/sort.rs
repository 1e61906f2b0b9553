//! `SORT` (spec §4.C): the one complex command in the data-type layer. A
//! pipeline of borrow → compare → slice, the same shape as a multi-stage key
//! derivation: resolve the input elements' sort keys (identity or via a `BY`
//! pattern lookup), sort (or skip sorting when `BY` has no `*`), clamp to
//! `LIMIT`, then project each surviving element through any `GET` patterns.

use bytes::Bytes;

/// Looks up values for `BY`/`GET` pattern substitution. Implemented by
/// `Keyspace` so `ember-core`'s `sort` module stays storage-agnostic; the
/// server crate never needs its own copy of pattern-substitution logic.
pub trait PatternResolver {
    /// Resolves a plain string key (no `->field` suffix).
    fn resolve_string(&self, key: &[u8]) -> Option<Bytes>;
    /// Resolves a `key->field` hash-field pattern.
    fn resolve_hash_field(&self, key: &[u8], field: &[u8]) -> Option<Bytes>;
}

#[derive(Debug, Clone, Default)]
pub struct SortOptions {
    pub by: Option<Vec<u8>>,
    pub limit: Option<(i64, i64)>,
    pub get: Vec<Vec<u8>>,
    pub alpha: bool,
    pub desc: bool,
}

/// Substitutes the first `*` in `pattern` with `element`. A pattern without
/// `*` is returned unchanged (used as-is, matching the "no `*` ⇒ skip
/// substitution" treatment callers give both `BY` and `GET`).
fn substitute(pattern: &[u8], element: &[u8]) -> Vec<u8> {
    match pattern.iter().position(|&b| b == b'*') {
        Some(pos) => {
            let mut out = Vec::with_capacity(pattern.len() - 1 + element.len());
            out.extend_from_slice(&pattern[..pos]);
            out.extend_from_slice(element);
            out.extend_from_slice(&pattern[pos + 1..]);
            out
        }
        None => pattern.to_vec(),
    }
}

/// Splits a pattern of the form `key_part->field_part` into its two halves.
fn split_hash_pattern(pattern: &[u8]) -> Option<(&[u8], &[u8])> {
    let needle = b"->";
    pattern
        .windows(2)
        .position(|w| w == needle)
        .map(|i| (&pattern[..i], &pattern[i + 2..]))
}

/// Resolves one `GET`/`BY` pattern against `element` via `resolver`. `#`
/// means "the element itself"; resolution of a missing lookup (the spec's
/// open question on "alpha + by-pattern with missing by-values") uses the
/// element itself as the fallback sort/projection key, applied consistently
/// regardless of `ALPHA` (see DESIGN.md).
fn resolve_pattern(pattern: &[u8], element: &Bytes, resolver: &dyn PatternResolver) -> Option<Bytes> {
    if pattern == b"#" {
        return Some(element.clone());
    }
    let substituted = substitute(pattern, element);
    if let Some((key, field)) = split_hash_pattern(&substituted) {
        resolver.resolve_hash_field(key, field)
    } else {
        resolver.resolve_string(&substituted)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Identity(Bytes),
    Numeric(f64),
}

/// Runs `SORT` over `elements`, returning one output row per surviving
/// element per `GET` pattern (or the bare sorted element if `get` is
/// empty). A `None` entry is a missing `GET` lookup, rendered as a nil bulk
/// reply by the caller (or an empty string when `STORE`d, per real
/// single-threaded KV daemon behavior).
pub fn sort(elements: Vec<Bytes>, opts: &SortOptions, resolver: &dyn PatternResolver) -> Vec<Option<Bytes>> {
    let mut items: Vec<Bytes> = elements;

    let should_sort = opts.by.as_deref().map(|p| p.contains(&b'*')).unwrap_or(true);
    if should_sort {
        let keyed: Vec<(SortKey, Bytes)> = items
            .into_iter()
            .map(|el| {
                let sort_source = match &opts.by {
                    Some(pattern) => resolve_pattern(pattern, &el, resolver).unwrap_or_else(|| el.clone()),
                    None => el.clone(),
                };
                let key = if opts.alpha {
                    SortKey::Identity(sort_source)
                } else {
                    let parsed = std::str::from_utf8(&sort_source)
                        .ok()
                        .and_then(|s| s.trim().parse::<f64>().ok())
                        .unwrap_or(0.0);
                    SortKey::Numeric(parsed)
                };
                (key, el)
            })
            .collect();
        let mut keyed = keyed;
        keyed.sort_by(|(ak, ae), (bk, be)| match (ak, bk) {
            (SortKey::Identity(a), SortKey::Identity(b)) => a.cmp(b),
            (SortKey::Numeric(a), SortKey::Numeric(b)) => {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            }
            _ => ae.cmp(be),
        });
        if opts.desc {
            keyed.reverse();
        }
        items = keyed.into_iter().map(|(_, el)| el).collect();
    } else if opts.desc {
        items.reverse();
    }

    if let Some((offset, count)) = opts.limit {
        let offset = offset.max(0) as usize;
        let len = items.len();
        let start = offset.min(len);
        let end = if count < 0 { len } else { (start + count as usize).min(len) };
        items = items[start..end].to_vec();
    }

    if opts.get.is_empty() {
        items.into_iter().map(Some).collect()
    } else {
        let mut out = Vec::with_capacity(items.len() * opts.get.len());
        for el in &items {
            for pattern in &opts.get {
                out.push(resolve_pattern(pattern, el, resolver));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver {
        strings: HashMap<Vec<u8>, Bytes>,
        hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Bytes>>,
    }

    impl PatternResolver for MapResolver {
        fn resolve_string(&self, key: &[u8]) -> Option<Bytes> {
            self.strings.get(key).cloned()
        }
        fn resolve_hash_field(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
            self.hashes.get(key)?.get(field).cloned()
        }
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn numeric_sort_ascending_default() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("3"), b("1"), b("2")];
        let out = sort(elements, &SortOptions::default(), &resolver);
        assert_eq!(out, vec![Some(b("1")), Some(b("2")), Some(b("3"))]);
    }

    #[test]
    fn alpha_desc_sorts_lexicographically_reversed() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("banana"), b("apple"), b("cherry")];
        let opts = SortOptions { alpha: true, desc: true, ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("cherry")), Some(b("banana")), Some(b("apple"))]);
    }

    #[test]
    fn by_pattern_without_star_skips_sorting() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("z"), b("a"), b("m")];
        let opts = SortOptions { by: Some(b"nosort".to_vec()), ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("z")), Some(b("a")), Some(b("m"))]);
    }

    #[test]
    fn by_pattern_substitutes_and_sorts_by_weight() {
        let mut strings = HashMap::new();
        strings.insert(b"weight_a".to_vec(), b("3"));
        strings.insert(b"weight_b".to_vec(), b("1"));
        strings.insert(b"weight_c".to_vec(), b("2"));
        let resolver = MapResolver { strings, hashes: HashMap::new() };
        let elements = vec![b("a"), b("b"), b("c")];
        let opts = SortOptions { by: Some(b"weight_*".to_vec()), ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("b")), Some(b("c")), Some(b("a"))]);
    }

    #[test]
    fn get_hash_pattern_projects_field() {
        let mut hashes = HashMap::new();
        let mut fields = HashMap::new();
        fields.insert(b"name".to_vec(), b("Alice"));
        hashes.insert(b"user_1".to_vec(), fields);
        let resolver = MapResolver { strings: HashMap::new(), hashes };
        let elements = vec![b("1")];
        let opts = SortOptions { get: vec![b"user_*->name".to_vec()], ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("Alice"))]);
    }

    #[test]
    fn get_hash_pound_returns_element_itself() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("1"), b("2")];
        let opts = SortOptions { get: vec![b"#".to_vec()], ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("1")), Some(b("2"))]);
    }

    #[test]
    fn limit_clamps_after_sort() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("5"), b("4"), b("3"), b("2"), b("1")];
        let opts = SortOptions { limit: Some((1, 2)), ..Default::default() };
        let out = sort(elements, &opts, &resolver);
        assert_eq!(out, vec![Some(b("2")), Some(b("3"))]);
    }

    #[test]
    fn missing_by_value_falls_back_to_element_for_alpha_and_numeric() {
        let resolver = MapResolver { strings: HashMap::new(), hashes: HashMap::new() };
        let elements = vec![b("b"), b("a")];
        let alpha_opts = SortOptions { by: Some(b"weight_*".to_vec()), alpha: true, ..Default::default() };
        let out = sort(elements.clone(), &alpha_opts, &resolver);
        assert_eq!(out, vec![Some(b("a")), Some(b("b"))]);
    }
}
