//! List commands (spec §4.C "List commands"). `BLPOP`/`BRPOP` themselves
//! live at the connection/engine layer (`blocking.rs`) since only that layer
//! knows about parked clients; this module implements the non-blocking pop
//! primitive they fall back to once a value is available.

use bytes::Bytes;
use ember_core::{DataValue, ValueKind};

use super::args::{parse_i64, require_arity, require_min_arity};
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::protocol::Reply;

fn push(ctx: &mut ExecCtx, args: &[Bytes], front: bool) -> CommandResult<Reply> {
    require_min_arity(args, if front { "lpush" } else { "rpush" }, 2)?;
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::List));
    let list = entry.as_list_mut()?;
    let values = args[1..].iter().cloned();
    if front {
        list.push_front(values);
    } else {
        list.push_back(values);
    }
    let len = list.len();
    ctx.mark_dirty();
    Ok(Reply::Integer(len as i64))
}

pub fn lpush(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    push(ctx, args, true)
}

pub fn rpush(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    push(ctx, args, false)
}

/// The non-blocking half of `LPOP`/`RPOP`/`BLPOP`/`BRPOP`: pops one element,
/// deleting the key if it becomes empty.
pub fn pop_one(ctx: &mut ExecCtx, key: &Bytes, front: bool) -> CommandResult<Option<Bytes>> {
    let now = ctx.now;
    let db = ctx.db_mut();
    let Some(value) = db.lookup_write(key, now) else { return Ok(None) };
    let list = value.as_list_mut()?;
    let popped = if front { list.pop_front() } else { list.pop_back() };
    if list.is_empty() {
        db.delete(key);
    }
    if popped.is_some() {
        ctx.mark_dirty();
    }
    Ok(popped)
}

pub fn lpop(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "lpop", 1)?;
    Ok(match pop_one(ctx, &args[0], true)? {
        Some(b) => Reply::bulk(b),
        None => Reply::nil(),
    })
}

pub fn rpop(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "rpop", 1)?;
    Ok(match pop_one(ctx, &args[0], false)? {
        Some(b) => Reply::bulk(b),
        None => Reply::nil(),
    })
}

pub fn llen(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "llen", 1)?;
    let now = ctx.now;
    let len = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_list()?.len(),
        None => 0,
    };
    Ok(Reply::Integer(len as i64))
}

pub fn lindex(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "lindex", 2)?;
    let index = parse_i64(&args[1])?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => match v.as_list()?.index(index) {
            Some(b) => Ok(Reply::bulk(b.clone())),
            None => Ok(Reply::nil()),
        },
        None => Ok(Reply::nil()),
    }
}

pub fn lset(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "lset", 3)?;
    let index = parse_i64(&args[1])?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Err(CommandError::NoSuchKey);
    };
    value.as_list_mut()?.set(index, args[2].clone())?;
    ctx.mark_dirty();
    Ok(Reply::ok())
}

pub fn lrange(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "lrange", 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let now = ctx.now;
    let items = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_list()?.range(start, stop),
        None => Vec::new(),
    };
    Ok(Reply::array(items.into_iter().map(Reply::bulk).collect()))
}

pub fn ltrim(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "ltrim", 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let now = ctx.now;
    if let Some(value) = ctx.db_mut().lookup_write(&args[0], now) {
        let list = value.as_list_mut()?;
        list.trim(start, stop);
        let empty = list.is_empty();
        if empty {
            ctx.db_mut().delete(&args[0]);
        }
        ctx.mark_dirty();
    }
    Ok(Reply::ok())
}

pub fn lrem(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "lrem", 3)?;
    let count = parse_i64(&args[1])?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let list = value.as_list_mut()?;
    let removed = list.remove(count, &args[2]);
    let empty = list.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(removed as i64))
}

pub fn rpoplpush(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "rpoplpush", 2)?;
    let Some(popped) = pop_one(ctx, &args[0], false)? else {
        return Ok(Reply::nil());
    };
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[1].clone(), now, || DataValue::empty(ValueKind::List));
    entry.as_list_mut()?.push_front([popped.clone()]);
    ctx.mark_dirty();
    Ok(Reply::bulk(popped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn rpush_then_lrange_preserves_order() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        rpush(&mut c, &[Bytes::from_static(b"l"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        let r = lrange(&mut c, &[Bytes::from_static(b"l"), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]).unwrap();
        assert_eq!(r, Reply::array(vec![Reply::bulk(Bytes::from_static(b"a")), Reply::bulk(Bytes::from_static(b"b"))]));
    }

    #[test]
    fn popping_last_element_deletes_key() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        rpush(&mut c, &[Bytes::from_static(b"l"), Bytes::from_static(b"only")]).unwrap();
        lpop(&mut c, &[Bytes::from_static(b"l")]).unwrap();
        let now = c.now;
        assert!(!c.db_mut().contains(b"l", now));
    }

    #[test]
    fn rpoplpush_moves_between_keys() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        rpush(&mut c, &[Bytes::from_static(b"src"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        let r = rpoplpush(&mut c, &[Bytes::from_static(b"src"), Bytes::from_static(b"dst")]).unwrap();
        assert_eq!(r, Reply::bulk(Bytes::from_static(b"b")));
        let dst = lrange(&mut c, &[Bytes::from_static(b"dst"), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]).unwrap();
        assert_eq!(dst, Reply::array(vec![Reply::bulk(Bytes::from_static(b"b"))]));
    }

    #[test]
    fn lset_out_of_range_errors() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        rpush(&mut c, &[Bytes::from_static(b"l"), Bytes::from_static(b"a")]).unwrap();
        let err = lset(&mut c, &[Bytes::from_static(b"l"), Bytes::from_static(b"5"), Bytes::from_static(b"x")]).unwrap_err();
        assert!(matches!(err, CommandError::OutOfRange(_)));
    }
}
