//! Keyspace-wide commands (spec §4.C "Keyspace commands"): existence,
//! expiry, renaming, introspection, and `SORT`.

use bytes::Bytes;
use ember_core::{sort as core_sort, DbPatternView, SortOptions};

use super::args::{parse_i64, parse_usize, require_arity, require_min_arity};
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::glob::glob_match;
use crate::protocol::Reply;

pub fn keys(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "keys", 1)?;
    let pattern = &args[0];
    let matched: Vec<Bytes> = ctx
        .db()
        .keys()
        .filter(|k| glob_match(pattern, k))
        .cloned()
        .collect();
    Ok(Reply::array(matched.into_iter().map(Reply::bulk).collect()))
}

pub fn randomkey(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "randomkey", 0)?;
    Ok(match ctx.db().random_key() {
        Some(k) => Reply::bulk(k.clone()),
        None => Reply::nil(),
    })
}

pub fn type_cmd(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "type", 1)?;
    let now = ctx.now;
    Ok(match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => Reply::Status(v.kind().type_name().to_string()),
        None => Reply::Status("none".to_string()),
    })
}

pub fn rename(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "rename", 2)?;
    ctx.db_mut().rename_key(&args[0], args[1].clone())?;
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn renamenx(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "renamenx", 2)?;
    let now = ctx.now;
    if ctx.db_mut().contains(&args[1], now) {
        return Ok(Reply::Integer(0));
    }
    ctx.db_mut().rename_key(&args[0], args[1].clone())?;
    ctx.mark_dirty();
    Ok(Reply::Integer(1))
}

pub fn move_cmd(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "move", 2)?;
    let dest = parse_usize(&args[1])?;
    let now = ctx.now;
    let moved = ctx.keyspace.move_key(ctx.db_index, dest, &args[0], now)?;
    if moved {
        ctx.mark_dirty();
    }
    Ok(Reply::from(moved))
}

/// Validates a `SELECT` target without mutating `ExecCtx` — the dispatcher
/// applies the actual database switch to the connection's own state since
/// `ExecCtx::db_index` only lives for one call (SPEC_FULL.md §1).
pub fn validate_select(ctx: &ExecCtx, args: &[Bytes]) -> CommandResult<usize> {
    require_arity(args, "select", 1)?;
    let index = parse_usize(&args[0])?;
    ctx.keyspace.db(index).map_err(CommandError::from)?;
    Ok(index)
}

pub fn flushdb(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "flushdb", 0)?;
    ctx.keyspace.flush_db(ctx.db_index)?;
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn flushall(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "flushall", 0)?;
    ctx.keyspace.flush_all();
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn dbsize(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "dbsize", 0)?;
    Ok(Reply::Integer(ctx.db().len() as i64))
}

fn expire_at(ctx: &mut ExecCtx, key: &Bytes, when: i64) -> CommandResult<Reply> {
    let now = ctx.now;
    if !ctx.db_mut().contains(key, now) {
        return Ok(Reply::Integer(0));
    }
    let set = ctx.db_mut().set_expire(key, when);
    if set {
        ctx.mark_dirty();
    }
    Ok(Reply::from(set))
}

pub fn expire(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "expire", 2)?;
    let seconds = parse_i64(&args[1])?;
    let when = ctx.now.checked_add(seconds).ok_or(CommandError::OutOfRange("invalid expire time".into()))?;
    expire_at(ctx, &args[0].clone(), when)
}

pub fn expireat(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "expireat", 2)?;
    let when = parse_i64(&args[1])?;
    expire_at(ctx, &args[0].clone(), when)
}

pub fn ttl(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "ttl", 1)?;
    let now = ctx.now;
    Ok(match ctx.db_mut().get_expire(&args[0], now) {
        None => Reply::Integer(-2),
        Some(None) => Reply::Integer(-1),
        Some(Some(secs)) => Reply::Integer(secs.max(0)),
    })
}

pub fn persist(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "persist", 1)?;
    let cleared = ctx.db_mut().persist(&args[0]);
    if cleared {
        ctx.mark_dirty();
    }
    Ok(Reply::from(cleared))
}

/// Parses the trailing `BY pattern`, `LIMIT offset count`, `GET pattern`,
/// `ASC|DESC`, `ALPHA` clauses shared by `SORT`.
fn parse_sort_options(tail: &[Bytes]) -> CommandResult<SortOptions> {
    let mut opts = SortOptions::default();
    let mut i = 0;
    while i < tail.len() {
        let tok = &tail[i];
        if tok.eq_ignore_ascii_case(b"asc") {
            opts.desc = false;
            i += 1;
        } else if tok.eq_ignore_ascii_case(b"desc") {
            opts.desc = true;
            i += 1;
        } else if tok.eq_ignore_ascii_case(b"alpha") {
            opts.alpha = true;
            i += 1;
        } else if tok.eq_ignore_ascii_case(b"by") {
            let pattern = tail.get(i + 1).ok_or(CommandError::SyntaxError)?;
            opts.by = Some(pattern.to_vec());
            i += 2;
        } else if tok.eq_ignore_ascii_case(b"get") {
            let pattern = tail.get(i + 1).ok_or(CommandError::SyntaxError)?;
            opts.get.push(pattern.to_vec());
            i += 2;
        } else if tok.eq_ignore_ascii_case(b"limit") {
            let offset = tail.get(i + 1).ok_or(CommandError::SyntaxError)?;
            let count = tail.get(i + 2).ok_or(CommandError::SyntaxError)?;
            opts.limit = Some((parse_i64(offset)?, parse_i64(count)?));
            i += 3;
        } else {
            return Err(CommandError::SyntaxError);
        }
    }
    Ok(opts)
}

pub fn sort(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sort", 1)?;
    let opts = parse_sort_options(&args[1..])?;
    let now = ctx.now;
    let elements: Vec<Bytes> = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_list().map(|l| l.iter().cloned().collect()).or_else(|_| {
            v.as_set().map(|s| s.iter().cloned().collect())
        }).or_else(|_| {
            v.as_zset().map(|z| z.range_by_rank(0, -1).into_iter().map(|(m, _)| m).collect())
        })?,
        None => Vec::new(),
    };
    let resolver = DbPatternView::new(ctx.db(), now);
    let sorted = core_sort::sort(elements, &opts, &resolver);
    Ok(Reply::array(
        sorted
            .into_iter()
            .map(|opt| match opt {
                Some(b) => Reply::bulk(b),
                None => Reply::nil(),
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn ttl_reports_minus_two_for_missing_key() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        let r = ttl(&mut c, &[Bytes::from_static(b"missing")]).unwrap();
        assert_eq!(r, Reply::Integer(-2));
    }

    #[test]
    fn expire_then_ttl_reports_remaining_seconds() {
        use super::super::strings::set;
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]).unwrap();
        expire(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"100")]).unwrap();
        let r = ttl(&mut c, &[Bytes::from_static(b"k")]).unwrap();
        assert_eq!(r, Reply::Integer(100));
    }

    #[test]
    fn keys_matches_glob_pattern() {
        use super::super::strings::set;
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"foo"), Bytes::from_static(b"1")]).unwrap();
        set(&mut c, &[Bytes::from_static(b"bar"), Bytes::from_static(b"2")]).unwrap();
        let r = keys(&mut c, &[Bytes::from_static(b"fo*")]).unwrap();
        assert_eq!(r, Reply::array(vec![Reply::bulk(Bytes::from_static(b"foo"))]));
    }

    #[test]
    fn move_requires_key_absent_from_destination() {
        use super::super::strings::set;
        let mut ks = Keyspace::new(2);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]).unwrap();
        let r = move_cmd(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"1")]).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }
}
