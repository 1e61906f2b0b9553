//! Durability (spec §4.G "Snapshot (RDB-like)" and §4.H "Append-only Log").
//!
//! Two independent, composable persistence strategies, matching
//! `Config::appendonly`: a point-in-time binary dump (`snapshot`) and a
//! continuously-appended command journal (`aof`). The engine decides which
//! (or both) to load at startup and which to write on `SAVE`/`BGSAVE` and
//! `BGREWRITEAOF` (SPEC_FULL.md §1).

pub mod aof;
pub mod snapshot;
