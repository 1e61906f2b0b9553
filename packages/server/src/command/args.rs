//! Small argument-parsing helpers shared across the command modules.

use bytes::Bytes;

use super::error::{CommandError, CommandResult};

pub fn parse_i64(arg: &Bytes) -> CommandResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CommandError::OutOfRange("value is not an integer or out of range".into()))
}

pub fn parse_usize(arg: &Bytes) -> CommandResult<usize> {
    let n = parse_i64(arg)?;
    usize::try_from(n).map_err(|_| CommandError::OutOfRange("value is not an integer or out of range".into()))
}

pub fn parse_f64(arg: &Bytes) -> CommandResult<f64> {
    let s = std::str::from_utf8(arg)
        .map_err(|_| CommandError::OutOfRange("value is not a valid float".into()))?
        .trim();
    match s {
        "+inf" | "inf" | "+infinity" | "infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        _ => s.parse::<f64>().map_err(|_| CommandError::OutOfRange("value is not a valid float".into())),
    }
}

/// Parses a `ZRANGEBYSCORE`-style score bound: an optional leading `(` marks
/// it exclusive, `-inf`/`+inf` are literal infinities.
pub fn parse_score_bound(arg: &Bytes) -> CommandResult<(f64, bool)> {
    if let Some(rest) = arg.strip_prefix(b"(") {
        let v = std::str::from_utf8(rest)
            .ok()
            .and_then(|s| parse_bound_str(s))
            .ok_or_else(|| CommandError::OutOfRange("min or max is not a float".into()))?;
        Ok((v, true))
    } else {
        let v = std::str::from_utf8(arg)
            .ok()
            .and_then(parse_bound_str)
            .ok_or_else(|| CommandError::OutOfRange("min or max is not a float".into()))?;
        Ok((v, false))
    }
}

fn parse_bound_str(s: &str) -> Option<f64> {
    match s {
        "+inf" | "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok(),
    }
}

pub fn require_arity(args: &[Bytes], name: &str, exact: usize) -> CommandResult<()> {
    if args.len() != exact {
        return Err(CommandError::WrongArity(name.into()));
    }
    Ok(())
}

pub fn require_min_arity(args: &[Bytes], name: &str, min: usize) -> CommandResult<()> {
    if args.len() < min {
        return Err(CommandError::WrongArity(name.into()));
    }
    Ok(())
}
