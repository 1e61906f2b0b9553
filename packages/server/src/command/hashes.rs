//! Hash commands (spec §4.C "Hash commands").

use bytes::Bytes;
use ember_core::{DataValue, ValueKind};

use super::args::require_arity;
use super::ctx::ExecCtx;
use super::error::CommandResult;
use crate::protocol::Reply;

pub fn hset(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hset", 3)?;
    let now = ctx.now;
    let limits = ctx.hash_limits;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::Hash));
    let hash = entry.as_hash_mut()?;
    let is_new = hash.set(args[1].clone(), args[2].clone(), limits);
    ctx.mark_dirty();
    Ok(Reply::Integer(i64::from(is_new)))
}

pub fn hget(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hget", 2)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => match v.as_hash()?.get(&args[1]) {
            Some(b) => Ok(Reply::bulk(b)),
            None => Ok(Reply::nil()),
        },
        None => Ok(Reply::nil()),
    }
}

pub fn hdel(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hdel", 2)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let hash = value.as_hash_mut()?;
    let removed = hash.remove(&args[1]);
    let empty = hash.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(i64::from(removed)))
}

pub fn hlen(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hlen", 1)?;
    let now = ctx.now;
    let len = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_hash()?.len(),
        None => 0,
    };
    Ok(Reply::Integer(len as i64))
}

pub fn hexists(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hexists", 2)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => Ok(Reply::from(v.as_hash()?.contains(&args[1]))),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn hkeys(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hkeys", 1)?;
    let now = ctx.now;
    let keys = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_hash()?.keys(),
        None => Vec::new(),
    };
    Ok(Reply::array(keys.into_iter().map(Reply::bulk).collect()))
}

pub fn hvals(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hvals", 1)?;
    let now = ctx.now;
    let vals = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_hash()?.values(),
        None => Vec::new(),
    };
    Ok(Reply::array(vals.into_iter().map(Reply::bulk).collect()))
}

pub fn hgetall(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "hgetall", 1)?;
    let now = ctx.now;
    let mut out = Vec::new();
    if let Some(v) = ctx.db_mut().lookup_read(&args[0], now) {
        for (k, val) in v.as_hash()?.iter() {
            out.push(Reply::bulk(k.clone()));
            out.push(Reply::bulk(val.clone()));
        }
    }
    Ok(Reply::array(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn hset_then_hget_round_trips() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        hset(&mut c, &[Bytes::from_static(b"h"), Bytes::from_static(b"f"), Bytes::from_static(b"v")]).unwrap();
        let r = hget(&mut c, &[Bytes::from_static(b"h"), Bytes::from_static(b"f")]).unwrap();
        assert_eq!(r, Reply::bulk(Bytes::from_static(b"v")));
    }

    #[test]
    fn hdel_removes_key_when_last_field_goes() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        hset(&mut c, &[Bytes::from_static(b"h"), Bytes::from_static(b"f"), Bytes::from_static(b"v")]).unwrap();
        hdel(&mut c, &[Bytes::from_static(b"h"), Bytes::from_static(b"f")]).unwrap();
        let now = c.now;
        assert!(!c.db_mut().contains(b"h", now));
    }

    #[test]
    fn hgetall_interleaves_field_and_value() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        hset(&mut c, &[Bytes::from_static(b"h"), Bytes::from_static(b"f"), Bytes::from_static(b"v")]).unwrap();
        let r = hgetall(&mut c, &[Bytes::from_static(b"h")]).unwrap();
        assert_eq!(r, Reply::array(vec![Reply::bulk(Bytes::from_static(b"f")), Reply::bulk(Bytes::from_static(b"v"))]));
    }
}
