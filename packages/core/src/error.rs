//! Error types for the keyspace and data-type engines.

use thiserror::Error;

/// Errors raised by [`crate::keyspace::Keyspace`] and the data-type engines.
///
/// These are intentionally coarse — the server crate maps each variant onto
/// the `-ERR` reply kinds from the wire protocol (`WrongType`, `OutOfRange`,
/// `SyntaxError`, ...); `ember-core` itself has no notion of a wire reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The key exists but holds a value of a different kind than the
    /// operation expects (e.g. `LPUSH` against a string).
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A numeric argument fell outside the domain the command accepts, or a
    /// value was not parseable as the expected numeric type.
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// A floating point argument was not a valid double.
    #[error("value is not a valid float")]
    NotAFloat,

    /// An index, offset, or count argument was out of the structure's range.
    #[error("index out of range")]
    IndexOutOfRange,

    /// `INCR`/`INCRBY`/`DECRBY` would overflow a signed 64-bit integer.
    #[error("increment or decrement would overflow")]
    Overflow,

    /// The requested database number does not exist.
    #[error("DB index is out of range")]
    NoSuchDb,

    /// A rename or move where source and destination are identical.
    #[error("source and destination objects are the same")]
    SameObject,

    /// A rename where the source key does not exist.
    #[error("no such key")]
    NoSuchKey,
}

/// Convenience alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;
