//! Administrative commands that don't need the wider engine: connection
//! greeting (`PING`/`ECHO`/`AUTH`), `CONFIG GET`/`SET`, and introspection
//! (`OBJECT ENCODING`, `DEBUG OBJECT`). Commands that touch durability or
//! replication state (`SAVE`, `SLAVEOF`, `SYNC`, ...) are orchestrated
//! directly by `engine.rs`, which owns those subsystems.

use bytes::Bytes;

use super::args::require_arity;
use super::ctx::ExecCtx;
use super::error::{CommandError, CommandResult};
use crate::config::Config;
use crate::glob::glob_match;
use crate::protocol::Reply;

pub fn ping(args: &[Bytes]) -> CommandResult<Reply> {
    if args.is_empty() {
        Ok(Reply::Status("PONG".to_string()))
    } else if args.len() == 1 {
        Ok(Reply::bulk(args[0].clone()))
    } else {
        Err(CommandError::WrongArity("ping".into()))
    }
}

pub fn echo(args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "echo", 1)?;
    Ok(Reply::bulk(args[0].clone()))
}

pub fn auth(config: &Config, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "auth", 1)?;
    match &config.requirepass {
        Some(pass) if pass.as_bytes() == args[0].as_ref() => Ok(Reply::ok()),
        Some(_) => Err(CommandError::OutOfRange("invalid password".into())),
        None => Err(CommandError::OutOfRange(
            "Client sent AUTH, but no password is set".into(),
        )),
    }
}

/// One `directive -> value` pair as `CONFIG GET`/rendering would produce it.
fn config_entries(config: &Config) -> Vec<(&'static str, String)> {
    let yn = |b: bool| if b { "yes".to_string() } else { "no".to_string() };
    vec![
        ("port", config.port.to_string()),
        ("bind", config.bind.clone()),
        ("timeout", config.timeout.as_secs().to_string()),
        ("dir", config.dir.display().to_string()),
        ("loglevel", config.loglevel.clone()),
        ("databases", config.databases.to_string()),
        ("maxclients", config.maxclients.to_string()),
        ("maxmemory", config.maxmemory.to_string()),
        ("appendonly", yn(config.appendonly)),
        ("dbfilename", config.dbfilename.clone()),
        ("appendfilename", config.appendfilename.clone()),
        ("rdbcompression", yn(config.rdbcompression)),
        ("hash-max-zipmap-entries", config.hash_max_zipmap_entries.to_string()),
        ("hash-max-zipmap-value", config.hash_max_zipmap_value.to_string()),
        ("vm-enabled", yn(config.vm_enabled)),
        ("vm-max-memory", config.vm_max_memory.to_string()),
        ("vm-page-size", config.vm_page_size.to_string()),
        ("vm-pages", config.vm_pages.to_string()),
        ("vm-max-threads", config.vm_max_threads.to_string()),
    ]
}

pub fn config_get(config: &Config, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "config|get", 1)?;
    let pattern = &args[0];
    let mut out = Vec::new();
    for (name, value) in config_entries(config) {
        if glob_match(pattern, name.as_bytes()) {
            out.push(Reply::bulk(Bytes::from(name)));
            out.push(Reply::bulk(Bytes::from(value)));
        }
    }
    Ok(Reply::array(out))
}

pub fn config_set(config: &mut Config, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "config|set", 2)?;
    let directive = std::str::from_utf8(&args[0]).map_err(|_| CommandError::SyntaxError)?;
    let value = std::str::from_utf8(&args[1]).map_err(|_| CommandError::SyntaxError)?;
    let line = format!("{directive} {value}");
    config
        .apply_directive(&line)
        .map_err(|e| CommandError::OutOfRange(e.to_string()))?;
    Ok(Reply::ok())
}

pub fn object_encoding(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "object|encoding", 1)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_read(&args[0], now) else {
        return Err(CommandError::NoSuchKey);
    };
    let encoding = match value {
        ember_core::DataValue::String(s) => {
            if s.is_int_encoded() {
                "int"
            } else {
                "raw"
            }
        }
        ember_core::DataValue::Hash(h) => {
            if h.is_zipmap() {
                "zipmap"
            } else {
                "hashtable"
            }
        }
        ember_core::DataValue::List(_) => "linkedlist",
        ember_core::DataValue::Set(_) => "hashtable",
        ember_core::DataValue::SortedSet(_) => "skiplist",
        // Reachable only if a caller bypasses the paging preload gate
        // (engine.rs) that is supposed to block on this key first.
        ember_core::DataValue::Swapped(_) => "swapped",
    };
    Ok(Reply::Status(encoding.to_string()))
}

pub fn debug_object(ctx: &mut ExecCtx, args: &[Bytes]) -> CommandResult<Reply> {
    require_arity(args, "debug|object", 1)?;
    let now = ctx.now;
    let Some(value) = ctx.db_mut().lookup_read(&args[0], now) else {
        return Err(CommandError::NoSuchKey);
    };
    Ok(Reply::Status(format!(
        "Value at:0x0 refcount:1 encoding:{} serializedlength:{} type:{}",
        value.kind().type_name(),
        value.estimated_bytes(),
        value.kind().type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_without_argument_replies_pong() {
        assert_eq!(ping(&[]).unwrap(), Reply::Status("PONG".to_string()));
    }

    #[test]
    fn ping_with_argument_echoes_it() {
        let r = ping(&[Bytes::from_static(b"hello")]).unwrap();
        assert_eq!(r, Reply::bulk(Bytes::from_static(b"hello")));
    }

    #[test]
    fn auth_without_requirepass_errors() {
        let config = Config::default();
        let err = auth(&config, &[Bytes::from_static(b"x")]).unwrap_err();
        assert!(matches!(err, CommandError::OutOfRange(_)));
    }

    #[test]
    fn config_get_matches_glob() {
        let config = Config::default();
        let r = config_get(&config, &[Bytes::from_static(b"maxmem*")]).unwrap();
        assert_eq!(
            r,
            Reply::array(vec![Reply::bulk(Bytes::from_static(b"maxmemory")), Reply::bulk(Bytes::from_static(b"0"))])
        );
    }

    #[test]
    fn config_set_applies_directive() {
        let mut config = Config::default();
        config_set(&mut config, &[Bytes::from_static(b"maxclients"), Bytes::from_static(b"500")]).unwrap();
        assert_eq!(config.maxclients, 500);
    }
}
