//! Server configuration: the line-oriented config-file directives (spec
//! §6 "Config directives") plus the CLI surface. Grounded on the teacher's
//! `service/config.rs`/`network/config.rs` `Default`-impl-plus-directive
//! style.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser as ClapParser;
use thiserror::Error;

/// `appendfsync` policy (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    Never,
    #[default]
    EverySecond,
    Always,
}

/// One `save <seconds> <changes>` directive tuple (spec §6): a background
/// save fires once `changes` mutations have accumulated within `seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    pub seconds: u64,
    pub changes: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("directive {directive:?} expects {expected} argument(s), got {got}")]
    WrongArgCount { directive: String, expected: &'static str, got: usize },
    #[error("invalid value {value:?} for directive {directive:?}")]
    InvalidValue { directive: String, value: String },
}

/// The running configuration (spec §6 "Config directives").
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub timeout: Duration,
    pub save_points: Vec<SavePoint>,
    pub dir: PathBuf,
    pub loglevel: String,
    pub logfile: Option<PathBuf>,
    pub databases: usize,
    pub maxclients: usize,
    pub maxmemory: u64,
    pub slaveof: Option<(String, u16)>,
    pub masterauth: Option<String>,
    pub requirepass: Option<String>,
    pub appendonly: bool,
    pub appendfsync: FsyncPolicy,
    pub dbfilename: String,
    pub appendfilename: String,
    pub daemonize: bool,
    pub pidfile: Option<PathBuf>,
    pub rdbcompression: bool,
    pub hash_max_zipmap_entries: usize,
    pub hash_max_zipmap_value: usize,
    pub vm_enabled: bool,
    pub vm_swap_file: String,
    pub vm_max_memory: u64,
    pub vm_page_size: usize,
    pub vm_pages: u64,
    pub vm_max_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            bind: "127.0.0.1".into(),
            timeout: Duration::from_secs(0),
            save_points: vec![
                SavePoint { seconds: 900, changes: 1 },
                SavePoint { seconds: 300, changes: 10 },
                SavePoint { seconds: 60, changes: 10_000 },
            ],
            dir: PathBuf::from("."),
            loglevel: "notice".into(),
            logfile: None,
            databases: 16,
            maxclients: 10_000,
            maxmemory: 0,
            slaveof: None,
            masterauth: None,
            requirepass: None,
            appendonly: false,
            appendfsync: FsyncPolicy::EverySecond,
            dbfilename: "dump.rdb".into(),
            appendfilename: "appendonly.aof".into(),
            daemonize: false,
            pidfile: None,
            rdbcompression: true,
            hash_max_zipmap_entries: 64,
            hash_max_zipmap_value: 512,
            vm_enabled: false,
            vm_swap_file: "/tmp/ember-%p.vm".into(),
            vm_max_memory: 0,
            vm_page_size: 256,
            vm_pages: 1 << 20,
            vm_max_threads: 4,
        }
    }
}

impl Config {
    /// Parses a config file's contents (spec §6: one directive per line,
    /// `#` line comments, blank lines ignored).
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            cfg.apply_directive(line)?;
        }
        Ok(cfg)
    }

    /// Applies one `directive arg1 arg2 ...` line, used both by file
    /// parsing and by `CONFIG SET` for the mutable subset (SPEC_FULL.md §3).
    pub fn apply_directive(&mut self, line: &str) -> Result<(), ConfigError> {
        let mut parts = line.split_whitespace();
        let Some(directive) = parts.next() else { return Ok(()) };
        let args: Vec<&str> = parts.collect();
        let name = directive.to_ascii_lowercase();

        let yes_no = |v: &str, directive: &str| -> Result<bool, ConfigError> {
            match v {
                "yes" => Ok(true),
                "no" => Ok(false),
                other => Err(ConfigError::InvalidValue { directive: directive.into(), value: other.into() }),
            }
        };
        let parse_num = |v: &str, directive: &str| -> Result<u64, ConfigError> {
            v.parse().map_err(|_| ConfigError::InvalidValue { directive: directive.into(), value: v.into() })
        };
        // Every directive below except `save`/`slaveof` (checked separately)
        // takes exactly one argument; reject a missing one with a proper
        // `ConfigError` instead of panicking on `args[0]`.
        if !matches!(name.as_str(), "save" | "slaveof") && args.is_empty() {
            return Err(ConfigError::WrongArgCount { directive: name, expected: "1", got: 0 });
        }

        match name.as_str() {
            "port" => self.port = parse_num(args[0], &name)? as u16,
            "bind" => self.bind = args[0].to_string(),
            "timeout" => self.timeout = Duration::from_secs(parse_num(args[0], &name)?),
            "save" => {
                if args.len() != 2 {
                    return Err(ConfigError::WrongArgCount { directive: name, expected: "2", got: args.len() });
                }
                self.save_points.push(SavePoint {
                    seconds: parse_num(args[0], &name)?,
                    changes: parse_num(args[1], &name)?,
                });
            }
            "dir" => self.dir = PathBuf::from(args[0]),
            "loglevel" => self.loglevel = args[0].to_string(),
            "logfile" => self.logfile = Some(PathBuf::from(args[0])),
            "databases" => self.databases = parse_num(args[0], &name)? as usize,
            "maxclients" => self.maxclients = parse_num(args[0], &name)? as usize,
            "maxmemory" => self.maxmemory = parse_memory(args[0]).ok_or_else(|| ConfigError::InvalidValue {
                directive: name.clone(),
                value: args[0].into(),
            })?,
            "slaveof" => {
                if args.len() != 2 {
                    return Err(ConfigError::WrongArgCount { directive: name, expected: "2", got: args.len() });
                }
                self.slaveof = Some((args[0].to_string(), parse_num(args[1], &name)? as u16));
            }
            "masterauth" => self.masterauth = Some(args[0].to_string()),
            "requirepass" => self.requirepass = Some(args[0].to_string()),
            "appendonly" => self.appendonly = yes_no(args[0], &name)?,
            "appendfsync" => {
                self.appendfsync = match args[0] {
                    "no" => FsyncPolicy::Never,
                    "always" => FsyncPolicy::Always,
                    "everysec" => FsyncPolicy::EverySecond,
                    other => {
                        return Err(ConfigError::InvalidValue { directive: name, value: other.into() });
                    }
                };
            }
            "dbfilename" => self.dbfilename = args[0].to_string(),
            "appendfilename" => self.appendfilename = args[0].to_string(),
            "daemonize" => self.daemonize = yes_no(args[0], &name)?,
            "pidfile" => self.pidfile = Some(PathBuf::from(args[0])),
            "rdbcompression" => self.rdbcompression = yes_no(args[0], &name)?,
            "hash-max-zipmap-entries" => self.hash_max_zipmap_entries = parse_num(args[0], &name)? as usize,
            "hash-max-zipmap-value" => self.hash_max_zipmap_value = parse_num(args[0], &name)? as usize,
            "vm-enabled" => self.vm_enabled = yes_no(args[0], &name)?,
            "vm-swap-file" => self.vm_swap_file = args[0].to_string(),
            "vm-max-memory" => self.vm_max_memory = parse_memory(args[0]).ok_or_else(|| ConfigError::InvalidValue {
                directive: name.clone(),
                value: args[0].into(),
            })?,
            "vm-page-size" => self.vm_page_size = parse_num(args[0], &name)? as usize,
            "vm-pages" => self.vm_pages = parse_num(args[0], &name)?,
            "vm-max-threads" => self.vm_max_threads = parse_num(args[0], &name)? as usize,
            other => return Err(ConfigError::UnknownDirective(other.to_string())),
        }
        Ok(())
    }

    /// Substitutes `%p` in `vm_swap_file` with the running process id (spec
    /// §6).
    #[must_use]
    pub fn resolved_swap_file_path(&self) -> String {
        self.vm_swap_file.replace("%p", &std::process::id().to_string())
    }
}

fn parse_memory(v: &str) -> Option<u64> {
    let v = v.trim();
    let (num, mult) = if let Some(n) = v.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = v.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = v.strip_suffix("kb") {
        (n, 1024)
    } else {
        (v, 1)
    };
    num.parse::<u64>().ok().map(|n| n * mult)
}

/// CLI surface (SPEC_FULL.md §2 "ambient stack"): `clap` is already in the
/// teacher's dependency set and is the idiomatic choice over hand-rolled
/// `std::env::args` parsing.
#[derive(Debug, ClapParser)]
#[command(name = "ember-server", about = "ember: an in-memory multi-model key-value store")]
pub struct Cli {
    /// Path to a config file (spec §6 directive format).
    pub config_file: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub daemonize: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_directives_and_ignores_comments() {
        let text = "# comment\nport 7000\ndatabases 4\n\nappendonly yes\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.databases, 4);
        assert!(cfg.appendonly);
    }

    #[test]
    fn save_directive_accumulates_tuples() {
        let text = "save 900 1\nsave 60 10000\n";
        let cfg = Config::parse(text).unwrap();
        // Defaults contribute three, plus these two.
        assert_eq!(cfg.save_points.len(), 5);
    }

    #[test]
    fn appendfsync_rejects_unknown_value() {
        let err = Config::parse("appendfsync sometimes\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let err = Config::parse("bogus-directive 1\n").unwrap_err();
        assert_eq!(err, ConfigError::UnknownDirective("bogus-directive".into()));
    }

    #[test]
    fn maxmemory_accepts_unit_suffix() {
        let cfg = Config::parse("maxmemory 100mb\n").unwrap();
        assert_eq!(cfg.maxmemory, 100 * 1024 * 1024);
    }

    #[test]
    fn swap_file_substitutes_pid_token() {
        let cfg = Config::default();
        let resolved = cfg.resolved_swap_file_path();
        assert!(!resolved.contains("%p"));
        assert!(resolved.contains(&std::process::id().to_string()));
    }
}
