//! Set commands (spec §4.C "Set commands").

use bytes::Bytes;
use ember_core::{DataValue, SetValue, ValueKind};

use super::args::{parse_i64, require_arity, require_min_arity};
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::protocol::Reply;

pub fn sadd(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sadd", 2)?;
    let now = ctx.now;
    let db = ctx.db_mut();
    let entry = db.entry_or_insert_with(args[0].clone(), now, || DataValue::empty(ValueKind::Set));
    let set = entry.as_set_mut()?;
    let added = set.add(args[1..].iter().cloned());
    if added > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(added as i64))
}

pub fn srem(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "srem", 2)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::Integer(0));
    };
    let set = value.as_set_mut()?;
    let removed = set.remove(args[1..].iter().map(Bytes::as_ref));
    let empty = set.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    if removed > 0 {
        ctx.mark_dirty();
    }
    Ok(Reply::Integer(removed as i64))
}

pub fn smove(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "smove", 3)?;
    if args[0] == args[1] {
        return Err(CommandError::SameObject);
    }
    let now = ctx.now;
    let moved = {
        let db = ctx.db_mut();
        let Some(src_value) = db.lookup_write(&args[0], now) else { return Ok(Reply::Integer(0)) };
        let src_set = src_value.as_set_mut()?;
        if !src_set.contains(&args[2]) {
            return Ok(Reply::Integer(0));
        }
        let mut taken = SetValue::new();
        src_set.move_member(&mut taken, &args[2]);
        let empty = src_set.is_empty();
        if empty {
            db.delete(&args[0]);
        }
        taken
    };
    let db = ctx.db_mut();
    let dest_entry = db.entry_or_insert_with(args[1].clone(), now, || DataValue::empty(ValueKind::Set));
    let dest_set = dest_entry.as_set_mut()?;
    for m in moved.iter() {
        dest_set.add([m.clone()]);
    }
    ctx.mark_dirty();
    Ok(Reply::Integer(1))
}

pub fn sismember(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "sismember", 2)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => Ok(Reply::from(v.as_set()?.contains(&args[1]))),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn scard(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "scard", 1)?;
    let now = ctx.now;
    let len = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_set()?.len(),
        None => 0,
    };
    Ok(Reply::Integer(len as i64))
}

pub fn smembers(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "smembers", 1)?;
    let now = ctx.now;
    let items: Vec<Bytes> = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => v.as_set()?.iter().cloned().collect(),
        None => Vec::new(),
    };
    Ok(Reply::array(items.into_iter().map(Reply::bulk).collect()))
}

pub fn spop(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "spop", 1)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_write(&args[0], now) else {
        return Ok(Reply::nil());
    };
    let set = value.as_set_mut()?;
    let popped = set.pop(1);
    let empty = set.is_empty();
    if empty {
        ctx.db_mut().delete(&args[0]);
    }
    match popped.into_iter().next() {
        Some(m) => {
            ctx.mark_dirty();
            Ok(Reply::bulk(m))
        }
        None => Ok(Reply::nil()),
    }
}

pub fn srandmember(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "srandmember", 1)?;
    let now = ctx.now;
    match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => {
            let set = v.as_set()?;
            Ok(match set.sample(1).into_iter().next() {
                Some(m) => Reply::bulk(m),
                None => Reply::nil(),
            })
        }
        None => Ok(Reply::nil()),
    }
}

/// `SRANDMEMBER key count` (SPEC_FULL.md supplement path): negative `count`
/// samples with replacement.
pub fn srandmember_count(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "srandmember", 2)?;
    let count = parse_i64(&args[1])?;
    let now = ctx.now;
    let items = match ctx.db_mut().lookup_read(&args[0], now) {
        Some(v) => {
            let set = v.as_set()?;
            if count < 0 {
                set.sample_with_replacement((-count) as usize)
            } else {
                set.sample(count as usize)
            }
        }
        None => Vec::new(),
    };
    Ok(Reply::array(items.into_iter().map(Reply::bulk).collect()))
}

fn gather_sets<'a>(ctx: &'a mut ExecCtx, keys: &[Bytes]) -> CommandResult<Vec<SetValue>> {
    let now = ctx.now;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let set = match ctx.db_mut().lookup_read(key, now) {
            Some(v) => v.as_set()?.clone(),
            None => SetValue::new(),
        };
        out.push(set);
    }
    Ok(out)
}

fn combine_reply(sets: Vec<SetValue>, op: fn(&[&SetValue]) -> SetValue) -> Reply {
    let refs: Vec<&SetValue> = sets.iter().collect();
    let result = op(&refs);
    Reply::array(result.iter().cloned().map(Reply::bulk).collect())
}

pub fn sinter(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sinter", 1)?;
    let sets = gather_sets(ctx, args)?;
    Ok(combine_reply(sets, SetValue::intersect))
}

pub fn sunion(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sunion", 1)?;
    let sets = gather_sets(ctx, args)?;
    Ok(combine_reply(sets, SetValue::union))
}

pub fn sdiff(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sdiff", 1)?;
    let sets = gather_sets(ctx, args)?;
    Ok(combine_reply(sets, SetValue::difference))
}

fn store_combined(ctx: &mut ExecCtx, dest: &Bytes, keys: &[Bytes], op: fn(&[&SetValue]) -> SetValue) -> CommandResult<Reply> {
    let sets = gather_sets(ctx, keys)?;
    let refs: Vec<&SetValue> = sets.iter().collect();
    let result = op(&refs);
    let len = result.len();
    if result.is_empty() {
        ctx.db_mut().delete(dest);
    } else {
        ctx.db_mut().set(dest.clone(), DataValue::Set(result));
    }
    ctx.mark_dirty();
    Ok(Reply::Integer(len as i64))
}

pub fn sinterstore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sinterstore", 2)?;
    store_combined(ctx, &args[0].clone(), &args[1..], SetValue::intersect)
}

pub fn sunionstore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sunionstore", 2)?;
    store_combined(ctx, &args[0].clone(), &args[1..], SetValue::union)
}

pub fn sdiffstore(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_min_arity(args, "sdiffstore", 2)?;
    store_combined(ctx, &args[0].clone(), &args[1..], SetValue::difference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    fn ctx(ks: &mut Keyspace) -> ExecCtx<'_> {
        ExecCtx { keyspace: ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 }
    }

    #[test]
    fn sadd_reports_newly_added_count() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        let r = sadd(&mut c, &[Bytes::from_static(b"s"), Bytes::from_static(b"a"), Bytes::from_static(b"a")]).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }

    #[test]
    fn smove_requires_distinct_keys() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        let err = smove(&mut c, &[Bytes::from_static(b"s"), Bytes::from_static(b"s"), Bytes::from_static(b"a")]).unwrap_err();
        assert_eq!(err, CommandError::SameObject);
    }

    #[test]
    fn sinterstore_deletes_dest_when_empty() {
        let mut ks = Keyspace::new(1);
        let mut c = ctx(&mut ks);
        sadd(&mut c, &[Bytes::from_static(b"a"), Bytes::from_static(b"x")]).unwrap();
        sadd(&mut c, &[Bytes::from_static(b"b"), Bytes::from_static(b"y")]).unwrap();
        let r = sinterstore(&mut c, &[Bytes::from_static(b"dst"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        assert_eq!(r, Reply::Integer(0));
        let now = c.now;
        assert!(!c.db_mut().contains(b"dst", now));
    }
}
