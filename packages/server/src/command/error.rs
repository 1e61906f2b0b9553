//! Command errors (spec §7): the `-ERR ...` reply kinds, structured so the
//! reply text never has to be string-matched to recover the kind.

use ember_core::CoreError;
use thiserror::Error;

use crate::protocol::Reply;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("no such key")]
    NoSuchKey,
    #[error("source and destination objects are the same")]
    SameObject,
    #[error("syntax error")]
    SyntaxError,
    #[error("{0}")]
    OutOfRange(String),
    #[error("operation not permitted when a client is in authentication mode")]
    NotAuthenticated,
    #[error("command not allowed when used memory > 'maxmemory'")]
    MemoryPressure,
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::WrongType => CommandError::WrongType,
            CoreError::NotAnInteger => CommandError::OutOfRange("value is not an integer or out of range".into()),
            CoreError::NotAFloat => CommandError::OutOfRange("value is not a valid float".into()),
            CoreError::IndexOutOfRange => CommandError::OutOfRange("index out of range".into()),
            CoreError::Overflow => {
                CommandError::OutOfRange("increment or decrement would overflow".into())
            }
            CoreError::NoSuchDb => CommandError::OutOfRange("DB index is out of range".into()),
            CoreError::SameObject => CommandError::SameObject,
            CoreError::NoSuchKey => CommandError::NoSuchKey,
        }
    }
}

impl CommandError {
    /// Renders this error the way the dispatcher writes it back to the
    /// client: an `-ERR ...` (or, for `WrongType`, `-WRONGTYPE ...`) reply.
    #[must_use]
    pub fn to_reply(&self) -> Reply {
        match self {
            CommandError::WrongType => Reply::error(self.to_string()),
            other => Reply::error(format!("ERR {other}")),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
