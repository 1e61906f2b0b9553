//! The command table and dispatcher (spec §4.E "Command table").
//!
//! Each data-type group lives in its own module (`strings`, `lists`, `sets`,
//! `zsets`, `hashes`, `keyspace`); this module ties them to a static
//! descriptor table (arity, write/bulk flags) and a name-based `dispatch`
//! entry point. Commands that need engine-wide resources beyond one
//! `Keyspace` call — `SAVE`, `SLAVEOF`, `SYNC`, `MONITOR`, `INFO`, `SHUTDOWN`,
//! and the blocking pops — are intercepted by `engine.rs` before it falls
//! back to `dispatch` for everything else.

pub mod args;
pub mod ctx;
pub mod error;
pub mod hashes;
pub mod keyspace;
pub mod lists;
pub mod server;
pub mod sets;
pub mod strings;
pub mod transactions;
pub mod zsets;

use bytes::Bytes;

pub use ctx::ExecCtx;
pub use error::{CommandError, CommandResult};
pub use transactions::TransactionState;

use crate::config::Config;
use crate::protocol::Reply;

/// Flags the engine and protocol layer need per command (spec §4.E, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags {
    /// Whether a successful call can mutate the keyspace — gates whether the
    /// journal/replication feed sees this call (spec §4.H, §4.I).
    pub write: bool,
    /// Whether this command uses the old inline "bulk tail" extension (spec
    /// §4.D), e.g. `SET key <newline>value<newline>`.
    pub bulk: bool,
}

const RO: CommandFlags = CommandFlags { write: false, bulk: false };
const WR: CommandFlags = CommandFlags { write: true, bulk: false };
const WR_BULK: CommandFlags = CommandFlags { write: true, bulk: true };

/// One command's static descriptor. `name` is always upper-case.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub flags: CommandFlags,
}

/// The full command table (spec §4.E). Order doesn't matter; `lookup`
/// linear-scans it once per call, which is fine at this table's size.
pub static COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { name: "PING", flags: RO },
    CommandSpec { name: "ECHO", flags: RO },
    CommandSpec { name: "AUTH", flags: RO },
    CommandSpec { name: "SELECT", flags: RO },
    CommandSpec { name: "GET", flags: RO },
    CommandSpec { name: "SET", flags: WR_BULK },
    CommandSpec { name: "SETNX", flags: WR_BULK },
    CommandSpec { name: "GETSET", flags: WR_BULK },
    CommandSpec { name: "APPEND", flags: WR_BULK },
    CommandSpec { name: "SUBSTR", flags: RO },
    CommandSpec { name: "MGET", flags: RO },
    CommandSpec { name: "MSET", flags: WR },
    CommandSpec { name: "MSETNX", flags: WR },
    CommandSpec { name: "INCR", flags: WR },
    CommandSpec { name: "DECR", flags: WR },
    CommandSpec { name: "INCRBY", flags: WR },
    CommandSpec { name: "DECRBY", flags: WR },
    CommandSpec { name: "EXISTS", flags: RO },
    CommandSpec { name: "DEL", flags: WR },
    CommandSpec { name: "LPUSH", flags: WR_BULK },
    CommandSpec { name: "RPUSH", flags: WR_BULK },
    CommandSpec { name: "LPOP", flags: WR },
    CommandSpec { name: "RPOP", flags: WR },
    CommandSpec { name: "LLEN", flags: RO },
    CommandSpec { name: "LINDEX", flags: RO },
    CommandSpec { name: "LSET", flags: WR_BULK },
    CommandSpec { name: "LRANGE", flags: RO },
    CommandSpec { name: "LTRIM", flags: WR },
    CommandSpec { name: "LREM", flags: WR_BULK },
    CommandSpec { name: "RPOPLPUSH", flags: WR },
    CommandSpec { name: "SADD", flags: WR_BULK },
    CommandSpec { name: "SREM", flags: WR_BULK },
    CommandSpec { name: "SMOVE", flags: WR_BULK },
    CommandSpec { name: "SISMEMBER", flags: RO },
    CommandSpec { name: "SCARD", flags: RO },
    CommandSpec { name: "SMEMBERS", flags: RO },
    CommandSpec { name: "SPOP", flags: WR },
    CommandSpec { name: "SRANDMEMBER", flags: RO },
    CommandSpec { name: "SINTER", flags: RO },
    CommandSpec { name: "SINTERSTORE", flags: WR },
    CommandSpec { name: "SUNION", flags: RO },
    CommandSpec { name: "SUNIONSTORE", flags: WR },
    CommandSpec { name: "SDIFF", flags: RO },
    CommandSpec { name: "SDIFFSTORE", flags: WR },
    CommandSpec { name: "ZADD", flags: WR_BULK },
    CommandSpec { name: "ZINCRBY", flags: WR_BULK },
    CommandSpec { name: "ZREM", flags: WR_BULK },
    CommandSpec { name: "ZRANGE", flags: RO },
    CommandSpec { name: "ZREVRANGE", flags: RO },
    CommandSpec { name: "ZRANGEBYSCORE", flags: RO },
    CommandSpec { name: "ZCOUNT", flags: RO },
    CommandSpec { name: "ZCARD", flags: RO },
    CommandSpec { name: "ZSCORE", flags: RO },
    CommandSpec { name: "ZRANK", flags: RO },
    CommandSpec { name: "ZREVRANK", flags: RO },
    CommandSpec { name: "ZREMRANGEBYSCORE", flags: WR },
    CommandSpec { name: "ZREMRANGEBYRANK", flags: WR },
    CommandSpec { name: "ZUNION", flags: WR },
    CommandSpec { name: "ZINTER", flags: WR },
    CommandSpec { name: "HSET", flags: WR_BULK },
    CommandSpec { name: "HGET", flags: RO },
    CommandSpec { name: "HDEL", flags: WR },
    CommandSpec { name: "HLEN", flags: RO },
    CommandSpec { name: "HKEYS", flags: RO },
    CommandSpec { name: "HVALS", flags: RO },
    CommandSpec { name: "HGETALL", flags: RO },
    CommandSpec { name: "HEXISTS", flags: RO },
    CommandSpec { name: "KEYS", flags: RO },
    CommandSpec { name: "RANDOMKEY", flags: RO },
    CommandSpec { name: "TYPE", flags: RO },
    CommandSpec { name: "RENAME", flags: WR },
    CommandSpec { name: "RENAMENX", flags: WR },
    CommandSpec { name: "MOVE", flags: WR },
    CommandSpec { name: "FLUSHDB", flags: WR },
    CommandSpec { name: "FLUSHALL", flags: WR },
    CommandSpec { name: "DBSIZE", flags: RO },
    CommandSpec { name: "EXPIRE", flags: WR },
    CommandSpec { name: "EXPIREAT", flags: WR },
    CommandSpec { name: "TTL", flags: RO },
    CommandSpec { name: "PERSIST", flags: WR },
    CommandSpec { name: "SORT", flags: RO },
    CommandSpec { name: "CONFIG", flags: RO },
    CommandSpec { name: "OBJECT", flags: RO },
    CommandSpec { name: "DEBUG", flags: RO },
];

#[must_use]
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    let upper = name.to_ascii_uppercase();
    COMMAND_TABLE.iter().find(|c| c.name == upper)
}

/// Whether the parser should treat `name` as the legacy inline "bulk tail"
/// kind (spec §4.D Open Question #2).
#[must_use]
pub fn is_bulk_command(name: &[u8]) -> bool {
    std::str::from_utf8(name)
        .ok()
        .and_then(lookup)
        .is_some_and(|c| c.flags.bulk)
}

/// The outcome of one `dispatch` call: the reply to send, and — for
/// `SELECT` only — the database index the connection should switch to.
pub struct Dispatched {
    pub reply: Reply,
    pub select: Option<usize>,
}

impl Dispatched {
    fn reply(reply: Reply) -> Self {
        Self { reply, select: None }
    }
}

/// Executes one already-parsed command. `ctx.db_index` must already be the
/// connection's currently selected database (the caller applies the
/// `select` field from a prior `SELECT` reply before the next call).
pub fn dispatch(ctx: &mut ExecCtx, config: &mut Config, name: &[u8], args: &[Bytes]) -> CommandResult<Dispatched> {
    let upper = String::from_utf8_lossy(name).to_ascii_uppercase();

    if lookup(&upper).is_none() && !matches!(upper.as_str(), "MULTI" | "EXEC" | "DISCARD") {
        return Err(CommandError::UnknownCommand(upper.to_ascii_lowercase()));
    }

    let reply = match upper.as_str() {
        "PING" => server::ping(args)?,
        "ECHO" => server::echo(args)?,
        "AUTH" => server::auth(config, args)?,
        "SELECT" => {
            let index = keyspace::validate_select(ctx, args)?;
            return Ok(Dispatched { reply: Reply::ok(), select: Some(index) });
        }
        "GET" => strings::get(ctx, args)?,
        "SET" => strings::set(ctx, args)?,
        "SETNX" => strings::setnx(ctx, args)?,
        "GETSET" => strings::getset(ctx, args)?,
        "APPEND" => strings::append(ctx, args)?,
        "SUBSTR" => strings::substr(ctx, args)?,
        "MGET" => strings::mget(ctx, args)?,
        "MSET" => strings::mset(ctx, args)?,
        "MSETNX" => strings::msetnx(ctx, args)?,
        "INCR" => strings::incr(ctx, args)?,
        "DECR" => strings::decr(ctx, args)?,
        "INCRBY" => strings::incrby(ctx, args)?,
        "DECRBY" => strings::decrby(ctx, args)?,
        "EXISTS" => strings::exists(ctx, args)?,
        "DEL" => strings::del(ctx, args)?,
        "LPUSH" => lists::lpush(ctx, args)?,
        "RPUSH" => lists::rpush(ctx, args)?,
        "LPOP" => lists::lpop(ctx, args)?,
        "RPOP" => lists::rpop(ctx, args)?,
        "LLEN" => lists::llen(ctx, args)?,
        "LINDEX" => lists::lindex(ctx, args)?,
        "LSET" => lists::lset(ctx, args)?,
        "LRANGE" => lists::lrange(ctx, args)?,
        "LTRIM" => lists::ltrim(ctx, args)?,
        "LREM" => lists::lrem(ctx, args)?,
        "RPOPLPUSH" => lists::rpoplpush(ctx, args)?,
        "SADD" => sets::sadd(ctx, args)?,
        "SREM" => sets::srem(ctx, args)?,
        "SMOVE" => sets::smove(ctx, args)?,
        "SISMEMBER" => sets::sismember(ctx, args)?,
        "SCARD" => sets::scard(ctx, args)?,
        "SMEMBERS" => sets::smembers(ctx, args)?,
        "SPOP" => sets::spop(ctx, args)?,
        "SRANDMEMBER" if args.len() == 1 => sets::srandmember(ctx, args)?,
        "SRANDMEMBER" => sets::srandmember_count(ctx, args)?,
        "SINTER" => sets::sinter(ctx, args)?,
        "SINTERSTORE" => sets::sinterstore(ctx, args)?,
        "SUNION" => sets::sunion(ctx, args)?,
        "SUNIONSTORE" => sets::sunionstore(ctx, args)?,
        "SDIFF" => sets::sdiff(ctx, args)?,
        "SDIFFSTORE" => sets::sdiffstore(ctx, args)?,
        "ZADD" => zsets::zadd(ctx, args)?,
        "ZINCRBY" => zsets::zincrby(ctx, args)?,
        "ZREM" => zsets::zrem(ctx, args)?,
        "ZRANGE" => zsets::zrange(ctx, args)?,
        "ZREVRANGE" => zsets::zrevrange(ctx, args)?,
        "ZRANGEBYSCORE" => zsets::zrangebyscore(ctx, args)?,
        "ZCOUNT" => zsets::zcount(ctx, args)?,
        "ZCARD" => zsets::zcard(ctx, args)?,
        "ZSCORE" => zsets::zscore(ctx, args)?,
        "ZRANK" => zsets::zrank(ctx, args)?,
        "ZREVRANK" => zsets::zrevrank(ctx, args)?,
        "ZREMRANGEBYSCORE" => zsets::zremrangebyscore(ctx, args)?,
        "ZREMRANGEBYRANK" => zsets::zremrangebyrank(ctx, args)?,
        "ZUNION" => zsets::zunion(ctx, args)?,
        "ZINTER" => zsets::zinter(ctx, args)?,
        "HSET" => hashes::hset(ctx, args)?,
        "HGET" => hashes::hget(ctx, args)?,
        "HDEL" => hashes::hdel(ctx, args)?,
        "HLEN" => hashes::hlen(ctx, args)?,
        "HKEYS" => hashes::hkeys(ctx, args)?,
        "HVALS" => hashes::hvals(ctx, args)?,
        "HGETALL" => hashes::hgetall(ctx, args)?,
        "HEXISTS" => hashes::hexists(ctx, args)?,
        "KEYS" => keyspace::keys(ctx, args)?,
        "RANDOMKEY" => keyspace::randomkey(ctx, args)?,
        "TYPE" => keyspace::type_cmd(ctx, args)?,
        "RENAME" => keyspace::rename(ctx, args)?,
        "RENAMENX" => keyspace::renamenx(ctx, args)?,
        "MOVE" => keyspace::move_cmd(ctx, args)?,
        "FLUSHDB" => keyspace::flushdb(ctx, args)?,
        "FLUSHALL" => keyspace::flushall(ctx, args)?,
        "DBSIZE" => keyspace::dbsize(ctx, args)?,
        "EXPIRE" => keyspace::expire(ctx, args)?,
        "EXPIREAT" => keyspace::expireat(ctx, args)?,
        "TTL" => keyspace::ttl(ctx, args)?,
        "PERSIST" => keyspace::persist(ctx, args)?,
        "SORT" => keyspace::sort(ctx, args)?,
        "CONFIG" => dispatch_config(config, args)?,
        "OBJECT" => dispatch_object(ctx, args)?,
        "DEBUG" => dispatch_debug(ctx, args)?,
        "MULTI" | "EXEC" | "DISCARD" => {
            return Err(CommandError::OutOfRange(
                "MULTI/EXEC/DISCARD are handled by the connection layer, not dispatch".into(),
            ));
        }
        _ => unreachable!("checked by lookup above"),
    };
    Ok(Dispatched::reply(reply))
}

fn dispatch_config(config: &mut Config, args: &[Bytes]) -> CommandResult<Reply> {
    let Some(sub) = args.first() else { return Err(CommandError::WrongArity("config".into())) };
    if sub.eq_ignore_ascii_case(b"get") {
        server::config_get(config, &args[1..])
    } else if sub.eq_ignore_ascii_case(b"set") {
        server::config_set(config, &args[1..])
    } else {
        Err(CommandError::SyntaxError)
    }
}

fn dispatch_object(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    let Some(sub) = args.first() else { return Err(CommandError::WrongArity("object".into())) };
    if sub.eq_ignore_ascii_case(b"encoding") {
        server::object_encoding(ctx, &args[1..])
    } else {
        Err(CommandError::SyntaxError)
    }
}

fn dispatch_debug(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    let Some(sub) = args.first() else { return Err(CommandError::WrongArity("debug".into())) };
    if sub.eq_ignore_ascii_case(b"object") {
        server::debug_object(ctx, &args[1..])
    } else if sub.eq_ignore_ascii_case(b"jmap") {
        Ok(Reply::ok())
    } else {
        Err(CommandError::SyntaxError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{HashLimits, Keyspace};

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup("get").is_some());
        assert!(lookup("GET").is_some());
        assert!(lookup("bogus").is_none());
    }

    #[test]
    fn set_is_flagged_as_a_bulk_write_command() {
        let spec = lookup("SET").unwrap();
        assert!(spec.flags.write);
        assert!(spec.flags.bulk);
    }

    #[test]
    fn dispatch_unknown_command_errors() {
        let mut ks = Keyspace::new(1);
        let mut config = Config::default();
        let mut ctx = ExecCtx { keyspace: &mut ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 };
        let err = dispatch(&mut ctx, &mut config, b"NOPE", &[]).unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(_)));
    }

    #[test]
    fn select_reports_target_index_without_reply_side_effects() {
        let mut ks = Keyspace::new(4);
        let mut config = Config::default();
        let mut ctx = ExecCtx { keyspace: &mut ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 };
        let out = dispatch(&mut ctx, &mut config, b"SELECT", &[Bytes::from_static(b"2")]).unwrap();
        assert_eq!(out.select, Some(2));
    }

    #[test]
    fn set_then_get_round_trip_through_dispatch() {
        let mut ks = Keyspace::new(1);
        let mut config = Config::default();
        let mut ctx = ExecCtx { keyspace: &mut ks, db_index: 0, now: 0, hash_limits: HashLimits::default(), dirty: 0 };
        dispatch(&mut ctx, &mut config, b"SET", &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]).unwrap();
        let out = dispatch(&mut ctx, &mut config, b"GET", &[Bytes::from_static(b"k")]).unwrap();
        assert_eq!(out.reply, Reply::bulk(Bytes::from_static(b"v")));
    }
}
