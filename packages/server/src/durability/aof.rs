//! The append-only log (spec §4.H): a journal of every mutating command,
//! framed identically to the client wire protocol, replayable at startup.
//!
//! Grounded on the teacher's `storage/factory.rs` temp-file-then-rename
//! discipline for the rewrite path; framing reuses `protocol::reply`'s
//! multi-bulk encoder (the journal's wire shape *is* the client protocol,
//! spec §6) and replay reuses `protocol::parser::Parser` rather than a
//! second parser.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use ember_core::{DataValue, Keyspace};

use crate::config::FsyncPolicy;
use crate::protocol::{encode_multibulk_request, Parser};

/// An open append-only log file plus the bookkeeping needed to synthesize
/// `SELECT` frames and apply the fsync policy (spec §4.H).
pub struct AofWriter {
    file: File,
    path: PathBuf,
    policy: FsyncPolicy,
    last_db: Option<usize>,
    last_fsync: Instant,
    /// Bytes written since the log was opened/rewritten — not fsynced
    /// metadata, just what `INFO`/tests want to observe.
    pub bytes_written: u64,
}

impl AofWriter {
    /// Opens (creating if absent) the log file at `path` in append mode.
    pub fn open(path: &Path, policy: FsyncPolicy) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_path_buf(), policy, last_db: None, last_fsync: Instant::now(), bytes_written: 0 })
    }

    /// Appends one command frame, preceding it with a synthetic `SELECT db`
    /// frame if `db_index` differs from the last-appended command's db
    /// (spec §4.H). Callers are expected to have already rewritten
    /// `EXPIRE` into `EXPIREAT` with an absolute deadline — this module
    /// only handles framing and fsync policy, not command rewriting.
    pub fn append(&mut self, db_index: usize, args: &[Bytes]) -> io::Result<()> {
        if self.last_db != Some(db_index) {
            let select = encode_multibulk_request(&[Bytes::from_static(b"SELECT"), Bytes::from(db_index.to_string())]);
            self.file.write_all(&select)?;
            self.bytes_written += select.len() as u64;
            self.last_db = Some(db_index);
        }
        let frame = encode_multibulk_request(args);
        self.file.write_all(&frame)?;
        self.bytes_written += frame.len() as u64;
        self.maybe_fsync()?;
        Ok(())
    }

    fn maybe_fsync(&mut self) -> io::Result<()> {
        match self.policy {
            FsyncPolicy::Never => Ok(()),
            FsyncPolicy::Always => {
                self.file.sync_data()?;
                self.last_fsync = Instant::now();
                Ok(())
            }
            FsyncPolicy::EverySecond => {
                if self.last_fsync.elapsed().as_secs() >= 1 {
                    self.file.sync_data()?;
                    self.last_fsync = Instant::now();
                }
                Ok(())
            }
        }
    }

    /// Forces an fsync regardless of policy — used before a rewrite swaps
    /// the live file out from under this writer.
    pub fn force_fsync(&mut self) -> io::Result<()> {
        self.file.sync_data()?;
        self.last_fsync = Instant::now();
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Rewrites `keyspace` as a minimal, equivalent journal: one command chain
/// per key (spec §4.H "Rewrite") — `SET` for strings, `RPUSH` chains for
/// lists, `SADD` chains for sets, `ZADD` chains for sorted sets, `HSET`
/// chains for hashes, with a trailing `EXPIREAT` when the key has a TTL.
/// Runs on a blocking thread standing in for the source's forked rewrite
/// child (spec §9 Design Notes).
pub fn rewrite(keyspace: &Keyspace, now: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_db = None;
    for db_index in 0..keyspace.len() {
        let db = keyspace.db(db_index).expect("db_index in range");
        if db.is_empty() {
            continue;
        }
        for key in db.keys() {
            let expire_at = db.raw_expire_at(key);
            if expire_at.is_some_and(|at| at <= now) {
                continue;
            }
            let value = db.peek(key).expect("key came from db.keys()");
            if last_db != Some(db_index) {
                push_frame(&mut out, &[Bytes::from_static(b"SELECT"), Bytes::from(db_index.to_string())]);
                last_db = Some(db_index);
            }
            write_key_chain(&mut out, key, value);
            if let Some(at) = expire_at {
                push_frame(&mut out, &[Bytes::from_static(b"EXPIREAT"), key.clone(), Bytes::from(at.to_string())]);
            }
        }
    }
    out
}

fn push_frame(out: &mut Vec<u8>, args: &[Bytes]) {
    out.extend_from_slice(&encode_multibulk_request(args));
}

fn write_key_chain(out: &mut Vec<u8>, key: &Bytes, value: &DataValue) {
    match value {
        DataValue::String(s) => {
            push_frame(out, &[Bytes::from_static(b"SET"), key.clone(), s.decode()]);
        }
        DataValue::List(l) => {
            if l.is_empty() {
                return;
            }
            let mut args = vec![Bytes::from_static(b"RPUSH"), key.clone()];
            args.extend(l.iter().cloned());
            push_frame(out, &args);
        }
        DataValue::Set(s) => {
            if s.is_empty() {
                return;
            }
            let mut args = vec![Bytes::from_static(b"SADD"), key.clone()];
            args.extend(s.iter().cloned());
            push_frame(out, &args);
        }
        DataValue::SortedSet(z) => {
            if z.is_empty() {
                return;
            }
            let mut args = vec![Bytes::from_static(b"ZADD"), key.clone()];
            for (member, score) in z.iter() {
                args.push(Bytes::from(format!("{score}")));
                args.push(member.clone());
            }
            push_frame(out, &args);
        }
        DataValue::Hash(h) => {
            if h.is_empty() {
                return;
            }
            let mut args = vec![Bytes::from_static(b"HSET"), key.clone()];
            for (field, val) in h.iter() {
                args.push(field.clone());
                args.push(val.clone());
            }
            push_frame(out, &args);
        }
        DataValue::Swapped(_) => {}
    }
}

/// Writes `data` to a temp file, fsyncs, then atomically renames over
/// `path` — same discipline as the snapshot writer (spec §4.H "On child
/// success the parent ... fsyncs, and atomically renames over the live
/// journal").
pub fn write_rewritten_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_file_name(format!("temp-rewriteaof-{}.aof", std::process::id()));
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads every complete request frame out of the journal at `path`, in
/// order, for startup replay (spec §4.H "On startup ... replayed through
/// the same command path using an in-process synthetic client"). Returns
/// an empty vec if the file doesn't exist.
pub fn read_all_frames(path: &Path) -> io::Result<Vec<Vec<Bytes>>> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut parser = Parser::new();
    parser.feed(&data);
    let mut frames = Vec::new();
    loop {
        match parser.next_request(|_| false) {
            Ok(Some(frame)) if !frame.is_empty() => frames.push(frame),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }
    Ok(frames)
}

/// Rewrites `EXPIRE key seconds` into `EXPIREAT key <absolute>` so replay
/// is time-invariant (spec §4.H). No-op for every other command.
#[must_use]
pub fn rewrite_expire_to_absolute(now: i64, args: &[Bytes]) -> Option<Vec<Bytes>> {
    if args.len() != 3 || !args[0].eq_ignore_ascii_case(b"EXPIRE") {
        return None;
    }
    let seconds: i64 = std::str::from_utf8(&args[2]).ok()?.parse().ok()?;
    let at = now.checked_add(seconds)?;
    Some(vec![Bytes::from_static(b"EXPIREAT"), args[1].clone(), Bytes::from(at.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as B;
    use ember_core::StringValue;

    #[test]
    fn append_prefixes_select_on_db_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.aof");
        let mut w = AofWriter::open(&path, FsyncPolicy::Always).unwrap();
        w.append(0, &[B::from_static(b"SET"), B::from_static(b"k"), B::from_static(b"v")]).unwrap();
        w.append(1, &[B::from_static(b"SET"), B::from_static(b"k2"), B::from_static(b"v2")]).unwrap();
        let frames = read_all_frames(&path).unwrap();
        assert_eq!(frames.len(), 4); // SELECT 0, SET, SELECT 1, SET
        assert_eq!(frames[0], vec![B::from_static(b"SELECT"), B::from_static(b"0")]);
        assert_eq!(frames[2], vec![B::from_static(b"SELECT"), B::from_static(b"1")]);
    }

    #[test]
    fn append_does_not_reselect_same_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.aof");
        let mut w = AofWriter::open(&path, FsyncPolicy::Always).unwrap();
        w.append(0, &[B::from_static(b"SET"), B::from_static(b"a"), B::from_static(b"1")]).unwrap();
        w.append(0, &[B::from_static(b"SET"), B::from_static(b"b"), B::from_static(b"2")]).unwrap();
        let frames = read_all_frames(&path).unwrap();
        assert_eq!(frames.len(), 3); // SELECT 0, SET a, SET b
    }

    #[test]
    fn expire_rewrites_to_absolute_expireat() {
        let args = vec![B::from_static(b"EXPIRE"), B::from_static(b"k"), B::from_static(b"60")];
        let rewritten = rewrite_expire_to_absolute(1000, &args).unwrap();
        assert_eq!(rewritten, vec![B::from_static(b"EXPIREAT"), B::from_static(b"k"), B::from_static(b"1060")]);
    }

    #[test]
    fn non_expire_commands_are_not_rewritten() {
        let args = vec![B::from_static(b"SET"), B::from_static(b"k"), B::from_static(b"v")];
        assert!(rewrite_expire_to_absolute(1000, &args).is_none());
    }

    #[test]
    fn rewrite_emits_one_chain_per_key_with_trailing_expireat() {
        let mut ks = Keyspace::new(1);
        ks.db_mut(0).unwrap().set(B::from_static(b"k"), DataValue::String(StringValue::new(B::from_static(b"v"))));
        ks.db_mut(0).unwrap().set_expire(b"k", 5000);
        let bytes = rewrite(&ks, 1000);
        let mut parser = Parser::new();
        parser.feed(&bytes);
        let select = parser.next_request(|_| false).unwrap().unwrap();
        assert_eq!(select, vec![B::from_static(b"SELECT"), B::from_static(b"0")]);
        let set = parser.next_request(|_| false).unwrap().unwrap();
        assert_eq!(set, vec![B::from_static(b"SET"), B::from_static(b"k"), B::from_static(b"v")]);
        let expireat = parser.next_request(|_| false).unwrap().unwrap();
        assert_eq!(expireat[0], B::from_static(b"EXPIREAT"));
    }

    #[test]
    fn reading_a_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let frames = read_all_frames(&dir.path().join("nope.aof")).unwrap();
        assert!(frames.is_empty());
    }
}
