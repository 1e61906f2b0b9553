//! `ember-core`: the value objects, keyspace, and data-type engines behind
//! `ember`'s command set. No I/O, no async, no networking — a library any
//! runtime can embed (spec SPEC_FULL.md §0).

pub mod error;
pub mod keyspace;
pub mod sort;
pub mod types;
pub mod value;

pub use error::{CoreError, CoreResult};
pub use keyspace::{Database, DbPatternView, Keyspace};
pub use sort::{sort, PatternResolver, SortOptions};
pub use types::{AggregateOp, Combine, HashValue, ListValue, SetValue, SortedSet};
pub use value::{BytesMap, DataValue, HashLimits, StringValue, ValueKind};
