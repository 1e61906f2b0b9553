//! String commands (spec §4.C "String commands").

use bytes::Bytes;
use ember_core::{DataValue, StringValue, ValueKind};

use super::args::{parse_i64, require_arity, require_min_arity};
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::protocol::Reply;

pub fn get(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "get", 1)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => Ok(Reply::bulk(v.as_string()?.decode())),
        None => Ok(Reply::nil()),
    }
}

pub fn set(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "set", 2)?;
    ctx.db_mut().set(args[0].clone(), DataValue::String(StringValue::new(args[1].clone())));
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn setnx(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "setnx", 2)?;
    let now = ctx.now;
    if ctx.db_mut().contains(&args[0], now) {
        return Ok(Reply::Integer(0));
    }
    ctx.db_mut().set(args[0].clone(), DataValue::String(StringValue::new(args[1].clone())));
    ctx.mark_dirty();
    Ok(Reply::Integer(1))
}

pub fn getset(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "getset", 2)?;
    let now = ctx.now;
    let old = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => Some(v.as_string()?.decode()),
        None => None,
    };
    ctx.db_mut().set(args[0].clone(), DataValue::String(StringValue::new(args[1].clone())));
    ctx.mark_dirty();
    Ok(match old {
        Some(b) => Reply::bulk(b),
        None => Reply::nil(),
    })
}

pub fn append(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "append", 2)?;
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::String));
    let s = entry.as_string_mut()?;
    let mut buf = s.decode().to_vec();
    buf.extend_from_slice(&args[1]);
    let new_len = buf.len();
    *s = StringValue::new(Bytes::from(buf));
    ctx.mark_dirty();
    Ok(Reply::Integer(new_len as i64))
}

pub fn substr(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "substr", 3)?;
    let start = parse_i64(&args[1])?;
    let end = parse_i64(&args[2])?;
    let now = ctx.now;
    let Some(v) = ctx.db_mut().lookup_read(&args[0], now) else {
        return Ok(Reply::bulk(Bytes::new()));
    };
    let s = v.as_string()?.decode();
    let len = s.len() as i64;
    if len == 0 {
        return Ok(Reply::bulk(Bytes::new()));
    }
    let norm = |i: i64| -> i64 { if i < 0 { (len + i).max(0) } else { i } };
    let start = norm(start).min(len - 1).max(0);
    let end = norm(end).min(len - 1);
    if start > end {
        return Ok(Reply::bulk(Bytes::new()));
    }
    Ok(Reply::bulk(s.slice(start as usize..=end as usize)))
}

pub fn mget(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "mget", 1)?;
    let now = ctx.now;
    let mut out = Vec::with_capacity(args.len());
    for key in args {
        let reply = match ctx.db_mut().lookup_read(key, now) {
            Some(DataValue::String(s)) => Reply::bulk(s.decode()),
            _ => Reply::nil(),
        };
        out.push(reply);
    }
    Ok(Reply::array(out))
}

pub fn mset(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(CommandError::WrongArity("mset".into()));
    }
    for pair in args.chunks_exact(2) {
        ctx.db_mut().set(pair[0].clone(), DataValue::String(StringValue::new(pair[1].clone())));
    }
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn msetnx(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(CommandError::WrongArity("msetnx".into()));
    }
    let now = ctx.now;
    let any_exists = args.chunks_exact(2).any(|pair| ctx.db_mut().contains(&pair[0], now));
    if any_exists {
        return Ok(Reply::Integer(0));
    }
    for pair in args.chunks_exact(2) {
        ctx.db_mut().set(pair[0].clone(), DataValue::String(StringValue::new(pair[1].clone())));
    }
    ctx.mark_dirty();
    Ok(Reply::Integer(1))
}

fn incr_by(ctx: &mut ExecCtx, key: &Bytes, delta: i64) -> CommandResult<Reply> {
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(key.clone(), now, || DataValue::empty(ValueKind::String));
    let s = entry.as_string_mut()?;
    let current = s.as_i64()?;
    let next = current.checked_add(delta).ok_or(CommandError::OutOfRange(
        "increment or decrement would overflow".into(),
    ))?;
    *s = StringValue::Int(next);
    ctx.mark_dirty();
    Ok(Reply::Integer(next))
}

pub fn incr(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "incr", 1)?;
    incr_by(ctx, &args[0], 1)
}

pub fn decr(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "decr", 1)?;
    incr_by(ctx, &args[0], -1)
}

pub fn incrby(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "incrby", 2)?;
    let delta = parse_i64(&args[1])?;
    incr_by(ctx, &args[0], delta)
}

pub fn decrby(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "decrby", 2)?;
    let delta = parse_i64(&args[1])?;
    let delta = delta.checked_neg().ok_or(CommandError::OutOfRange(
        "increment or decrement would overflow".into(),
    ))?;
    incr_by(ctx, &args[0], delta)
}

pub fn exists(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "exists", 1)?;
    let now = ctx.now;
    Ok(Reply::from(ctx.db_mut().contains(&args[0], now)))
}

pub fn del(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "del", 1)?;
    let mut count = 0;
    for key in args {
        if ctx.db_mut().delete(key) {
            count += 1;
        }
    }
    if count > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]).unwrap();
        let r = get(&mut c, &[Bytes::from_static(b"k")]).unwrap();
        assert_eq!(r, Reply::bulk(Bytes::from_static(b"v")));
    }

    #[test]
    fn incr_on_missing_key_starts_at_zero() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        let r = incr(&mut c, &[Bytes::from_static(b"counter")]).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }

    #[test]
    fn incr_on_non_integer_string_errors() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"abc")]).unwrap();
        assert!(incr(&mut c, &[Bytes::from_static(b"k")]).is_err());
    }

    #[test]
    fn append_extends_and_reports_new_length() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"Hello ")]).unwrap();
        let r = append(&mut c, &[Bytes::from_static(b"k"), Bytes::from_static(b"World")]).unwrap();
        assert_eq!(r, Reply::Integer(11));
    }

    #[test]
    fn msetnx_fails_entirely_if_any_key_exists() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"a"), Bytes::from_static(b"1")]).unwrap();
        let r = msetnx(
            &mut c,
            &[Bytes::from_static(b"a"), Bytes::from_static(b"x"), Bytes::from_static(b"b"), Bytes::from_static(b"y")],
        )
        .unwrap();
        assert_eq!(r, Reply::Integer(0));
        let now = c.now;
        assert!(!c.db_mut().contains(b"b", now));
    }

    #[test]
    fn del_counts_only_existing_keys() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        set(&mut c, &[Bytes::from_static(b"a"), Bytes::from_static(b"1")]).unwrap();
        let r = del(&mut c, &[Bytes::from_static(b"a"), Bytes::from_static(b"missing")]).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }
}
