//! Sorted-set commands (spec §4.C "Sorted-set commands"). `ZUNION`/`ZINTER`
//! are implemented as destination-store commands
//! (`ZUNION dstkey numkeys key [key ...] [WEIGHTS w...] [AGGREGATE SUM|MIN|MAX]`),
//! the shape the spec's naming (without a `STORE` suffix) otherwise leaves
//! ambiguous — see DESIGN.md.

use bytes::Bytes;
use ember_core::{AggregateOp, Combine, DataValue, SortedSet, ValueKind};

use super::args::{parse_f64, parse_i64, parse_score_bound, parse_usize, require_arity, require_min_arity};
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::protocol::Reply;

fn pairs_to_reply(pairs: Vec<(Bytes, f64)>, withscores: bool) -> Reply {
    let mut out = Vec::with_capacity(pairs.len() * if withscores { 2 } else { 1 });
    for (member, score) in pairs {
        out.push(Reply::bulk(member));
        if withscores {
            out.push(Reply::bulk(format_score(score)));
        }
    }
    Reply::array(out)
}

fn format_score(score: f64) -> Bytes {
    if score == score.trunc() && score.is_finite() && score.abs() < 1e17 {
        Bytes::from((score as i64).to_string())
    } else {
        Bytes::from(score.to_string())
    }
}

pub fn zadd(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "zadd", 3)?;
    let rest = &args[1..];
    if rest.len() % 2 != 0 {
        return Err(CommandError::SyntaxError);
    }
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::SortedSet));
    let zset = entry.as_zset_mut()?;
    let mut added = 0;
    for pair in rest.chunks_exact(2) {
        let score = parse_f64(&pair[0])?;
        let (_, is_new) = zset.upsert(pair[1].clone(), score, false);
        if is_new {
            added += 1;
        }
    }
    ctx.mark_dirty();
    Ok(Reply::Integer(added))
}

pub fn zincrby(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zincrby", 3)?;
    let delta = parse_f64(&args[1])?;
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::SortedSet));
    let zset = entry.as_zset_mut()?;
    let (score, _) = zset.upsert(args[2].clone(), delta, true);
    ctx.mark_dirty();
    Ok(Reply::bulk(format_score(score)))
}

pub fn zrem(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "zrem", 2)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let zset = value.as_zset_mut()?;
    let mut removed = 0;
    for member in &args[1..] {
        if zset.remove(member) {
            removed += 1;
        }
    }
    let empty = zset.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(removed))
}

fn has_withscores(tail: &[Bytes]) -> bool {
    tail.iter().any(|a| a.eq_ignore_ascii_case(b"withscores"))
}

pub fn zrange(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "zrange", 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let withscores = has_withscores(&args[3..]);
    let now = ctx.now;
    let pairs = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_zset()?.range_by_rank(start, stop),
        None => Vec::new(),
    };
    Ok(pairs_to_reply(pairs, withscores))
}

pub fn zrevrange(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "zrevrange", 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let withscores = has_withscores(&args[3..]);
    let now = ctx.now;
    let pairs = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_zset()?.rev_range_by_rank(start, stop),
        None => Vec::new(),
    };
    Ok(pairs_to_reply(pairs, withscores))
}

fn parse_limit(tail: &[Bytes]) -> CommandResult<Option<(usize, Option<usize>)>> {
    let mut i = 0;
    while i < tail.len() {
        if tail[i].eq_ignore_ascii_case(b"limit") {
            if i + 2 >= tail.len() {
                return Err(CommandError::SyntaxError);
            }
            let offset = parse_usize(&tail[i + 1])?;
            let count = parse_i64(&tail[i + 2])?;
            let count = if count < 0 { None } else { Some(count as usize) };
            return Ok(Some((offset, count)));
        }
        i += 1;
    }
    Ok(None)
}

pub fn zrangebyscore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "zrangebyscore", 3)?;
    let (min, min_excl) = parse_score_bound(&args[1])?;
    let (max, max_excl) = parse_score_bound(&args[2])?;
    let withscores = has_withscores(&args[3..]);
    let (offset, count) = parse_limit(&args[3..])?.unwrap_or((0, None));
    let now = ctx.now;
    let pairs = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_zset()?.range_by_score(min, min_excl, max, max_excl, offset, count),
        None => Vec::new(),
    };
    Ok(pairs_to_reply(pairs, withscores))
}

pub fn zcount(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zcount", 3)?;
    let (min, min_excl) = parse_score_bound(&args[1])?;
    let (max, max_excl) = parse_score_bound(&args[2])?;
    let now = ctx.now;
    let n = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_zset()?.count_by_score(min, min_excl, max, max_excl),
        None => 0,
    };
    Ok(Reply::Integer(n as i64))
}

pub fn zcard(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zcard", 1)?;
    let now = ctx.now;
    let n = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_zset()?.len(),
        None => 0,
    };
    Ok(Reply::Integer(n as i64))
}

pub fn zscore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zscore", 2)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => match v.as_zset()?.score(&args[1]) {
            Some(s) => Ok(Reply::bulk(format_score(s))),
            None => Ok(Reply::nil()),
        },
        None => Ok(Reply::nil()),
    }
}

fn rank(ctx: &mut ExecCtx, args: &[Bytes], name: &str, reverse: bool) -> CommandResult<Reply> {
    require_arity(args, name, 2)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => {
            let zset = v.as_zset()?;
            let r = if reverse { zset.rev_rank(&args[1]) } else { zset.rank(&args[1]) };
            Ok(match r {
                Some(r) => Reply::Integer(r as i64),
                None => Reply::nil(),
            })
        }
        None => Ok(Reply::nil()),
    }
}

pub fn zrank(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    rank(ctx, args, "zrank", false)
}

pub fn zrevrank(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    rank(ctx, args, "zrevrank", true)
}

pub fn zremrangebyscore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zremrangebyscore", 3)?;
    let (min, min_excl) = parse_score_bound(&args[1])?;
    let (max, max_excl) = parse_score_bound(&args[2])?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let zset = value.as_zset_mut()?;
    let removed = zset.remove_range_by_score(min, min_excl, max, max_excl);
    let empty = zset.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(removed as i64))
}

pub fn zremrangebyrank(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "zremrangebyrank", 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let zset = value.as_zset_mut()?;
    let removed = zset.remove_range_by_rank(start, stop);
    let empty = zset.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(removed as i64))
}

fn aggregate_store(ctx: &mut ExecCtx, args: &[Bytes], op: AggregateOp) -> CommandResult<Reply> {
    require_min_arity(args, "zunion/zinter", 3)?;
    let dest = args[0].clone();
    let numkeys = parse_usize(&args[1])?;
    if numkeys == 0 || args.len() < 2 + numkeys {
        return Err(CommandError::SyntaxError);
    }
    let keys = &args[2..2 + numkeys];
    let tail = &args[2 + numkeys..];

    let mut weights = vec![1.0_f64; numkeys];
    let mut combine = Combine::Sum;
    let mut i = 0;
    while i < tail.len() {
        if tail[i].eq_ignore_ascii_case(b"weights") {
            if i + numkeys >= tail.len() {
                return Err(CommandError::SyntaxError);
            }
            for (w, arg) in weights.iter_mut().zip(&tail[i + 1..i + 1 + numkeys]) {
                *w = parse_f64(arg)?;
            }
            i += 1 + numkeys;
        } else if tail[i].eq_ignore_ascii_case(b"aggregate") {
            if i + 1 >= tail.len() {
                return Err(CommandError::SyntaxError);
            }
            combine = if tail[i + 1].eq_ignore_ascii_case(b"sum") {
                Combine::Sum
            } else if tail[i + 1].eq_ignore_ascii_case(b"min") {
                Combine::Min
            } else if tail[i + 1].eq_ignore_ascii_case(b"max") {
                Combine::Max
            } else {
                return Err(CommandError::SyntaxError);
            };
            i += 2;
        } else {
            return Err(CommandError::SyntaxError);
        }
    }

    let now = ctx.now;
    let mut weighted_sets = Vec::with_capacity(numkeys);
    for (key, &w) in keys.iter().zip(&weights) {
        let base = match ctx.db_mut().lookup_read(key, now) {
            Some(v) => v.as_zset()?.clone(),
            None => SortedSet::new(),
        };
        if w == 1.0 {
            weighted_sets.push(base);
        } else {
            let mut scaled = SortedSet::new();
            for (m, s) in base.iter() {
                scaled.upsert(m.clone(), s * w, false);
            }
            weighted_sets.push(scaled);
        }
    }
    let refs: Vec<&SortedSet> = weighted_sets.iter().collect();
    let result = SortedSet::aggregate(&refs, op, combine);
    let len = result.len();
    if result.is_empty() {
        ctx.db_mut().delete(&dest);
    } else {
        ctx.db_mut().set(dest, DataValue::SortedSet(result));
    }
    ctx.mark_dirty();
    Ok(Reply::Integer(len as i64))
}

pub fn zunion(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    aggregate_store(ctx, args, AggregateOp::Union)
}

pub fn zinter(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    aggregate_store(ctx, args, AggregateOp::Inter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn zadd_counts_only_new_members() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        zadd(&mut c, &[Bytes::from_static(b"z"), Bytes::from_static(b"1"), Bytes::from_static(b"a")]).unwrap();
        let r = zadd(
            &mut c,
            &[Bytes::from_static(b"z"), Bytes::from_static(b"2"), Bytes::from_static(b"a"), Bytes::from_static(b"5"), Bytes::from_static(b"b")],
        )
        .unwrap();
        assert_eq!(r, Reply::Integer(1));
    }

    #[test]
    fn zrange_withscores_formats_integer_scores_without_decimal() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        zadd(&mut c, &[Bytes::from_static(b"z"), Bytes::from_static(b"3"), Bytes::from_static(b"a")]).unwrap();
        let r = zrange(
            &mut c,
            &[Bytes::from_static(b"z"), Bytes::from_static(b"0"), Bytes::from_static(b"-1"), Bytes::from_static(b"withscores")],
        )
        .unwrap();
        assert_eq!(r, Reply::array(vec![Reply::bulk(Bytes::from_static(b"a")), Reply::bulk(Bytes::from_static(b"3"))]));
    }

    #[test]
    fn zunion_store_sums_by_default() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        zadd(&mut c, &[Bytes::from_static(b"a"), Bytes::from_static(b"1"), Bytes::from_static(b"x")]).unwrap();
        zadd(&mut c, &[Bytes::from_static(b"b"), Bytes::from_static(b"2"), Bytes::from_static(b"x")]).unwrap();
        let r = zunion(
            &mut c,
            &[Bytes::from_static(b"dst"), Bytes::from_static(b"2"), Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        )
        .unwrap();
        assert_eq!(r, Reply::Integer(1));
        let score = zscore(&mut c, &[Bytes::from_static(b"dst"), Bytes::from_static(b"x")]).unwrap();
        assert_eq!(score, Reply::bulk(Bytes::from_static(b"3")));
    }

    #[test]
    fn zrangebyscore_limit_clamps_window() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        for (m, s) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            zadd(&mut c, &[Bytes::from_static(b"z"), Bytes::from(s), Bytes::from(m)]).unwrap();
        }
        let r = zrangebyscore(
            &mut c,
            &[
                Bytes::from_static(b"z"),
                Bytes::from_static(b"-inf"),
                Bytes::from_static(b"+inf"),
                Bytes::from_static(b"limit"),
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
            ],
        )
        .unwrap();
        assert_eq!(r, Reply::array(vec![Reply::bulk(Bytes::from_static(b"b")), Reply::bulk(Bytes::from_static(b"c"))]));
    }
}
