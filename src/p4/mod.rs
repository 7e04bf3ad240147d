//! Subprocess transport to the Perforce command-line client.
//!
//! Every request spawns the configured binary, collects its stdout, and
//! (for the marshaled commands) decodes the tagged stream into typed
//! [`Record`]s. `print` is the one raw-output command: its first line is a
//! banner the client prepends to the file bytes.

use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub mod marshal;

use marshal::{DecodeError, Decoder, Value};

/// Connection parameters for the client binary.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Executable name or path. A bare name is resolved on `PATH`.
    pub binary: String,
    /// Server address passed as `-p`; omitted when empty.
    pub address: String,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            binary: "p4".to_owned(),
            address: String::new(),
        }
    }
}

/// Handle to the command-line client. Cheap to share behind an `Arc`; each
/// request is an independent subprocess.
#[derive(Debug)]
pub struct Conn {
    opts: ConnOptions,
}

#[derive(Debug, Error)]
pub enum P4Error {
    #[error("failed to run {binary:?}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client exited with {status}: {stderr}")]
    ClientExit { status: ExitStatus, stderr: String },

    #[error("undecodable client output: {0}")]
    Decode(#[from] DecodeError),

    #[error("malformed client output: {0}")]
    Protocol(&'static str),
}

/// Data for a single file revision, as reported by `fstat -Ol`.
///
/// Integer fields arrive as decimal strings on the wire; unparseable values
/// read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub depot_file: String,
    pub head_action: String,
    pub head_type: String,
    pub head_time: i64,
    pub head_rev: i64,
    pub head_change: i64,
    pub head_mod_time: i64,
    pub file_size: i64,
    pub digest: String,
}

impl Stat {
    /// The globally unique, immutable name of this revision. Doubles as the
    /// cache key and the argument to `print`.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.depot_file, self.head_rev)
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} - change {} ({})",
            self.depot_file, self.head_rev, self.head_change, self.head_type
        )
    }
}

/// A child directory reported by `dirs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    pub dir: String,
}

/// Submitted changelist metadata reported by `changes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    pub change: i64,
    pub desc: String,
    pub user: String,
    pub status: String,
    pub time: i64,
    pub path: String,
    pub code: String,
    pub change_type: String,
    pub client: String,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc: String = self.desc.trim().chars().take(250).collect();
        write!(f, "change {} by {} - {}", self.change, self.user, desc)
    }
}

/// An error record interleaved with data records in a command's output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("error {generic}({severity}): {data}")]
pub struct ClientError {
    pub severity: i32,
    pub generic: i32,
    pub data: String,
}

/// One decoded record from a marshaled command's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Stat(Stat),
    Dir(Dir),
    Change(Change),
    Error(ClientError),
}

/// The commands whose output is decoded from the tagged stream. Dispatch in
/// [`interpret`] is total over this enum, so an unknown command cannot
/// reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarshaledCommand {
    Dirs,
    Fstat,
    Changes,
}

impl MarshaledCommand {
    fn as_str(self) -> &'static str {
        match self {
            Self::Dirs => "dirs",
            Self::Fstat => "fstat",
            Self::Changes => "changes",
        }
    }
}

impl Conn {
    pub fn new(opts: ConnOptions) -> Self {
        Self { opts }
    }

    /// Spawn the client and collect its output. The process is killed if
    /// the request future is dropped.
    async fn output(&self, args: &[&str]) -> Result<std::process::Output, P4Error> {
        let mut cmd = Command::new(&self.opts.binary);
        if !self.opts.address.is_empty() {
            cmd.arg("-p").arg(&self.opts.address);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.opts.binary, ?args, "running client");
        cmd.output().await.map_err(|source| P4Error::Spawn {
            binary: self.opts.binary.clone(),
            source,
        })
    }

    async fn run_marshaled(
        &self,
        command: MarshaledCommand,
        args: &[&str],
    ) -> Result<Vec<Record>, P4Error> {
        let mut argv = vec!["-G", command.as_str()];
        argv.extend_from_slice(args);
        let out = self.output(&argv).await?;

        let mut records = Vec::new();
        let mut decoder = Decoder::new(&out.stdout);
        loop {
            match decoder.next_value() {
                Ok(None) => break,
                Ok(Some(value)) => records.push(interpret(value, command)?),
                Err(DecodeError::UnexpectedEof) if !records.is_empty() => {
                    // The client sometimes leaves a truncated trailer after
                    // intact records. Keep what decoded.
                    warn!(
                        command = command.as_str(),
                        "discarding truncated trailing record"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if records.is_empty() && !out.status.success() {
            return Err(P4Error::ClientExit {
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(records)
    }

    /// `dirs <paths>`: the immediate child directories of each path.
    pub async fn dirs(&self, paths: &[&str]) -> Result<Vec<Record>, P4Error> {
        self.run_marshaled(MarshaledCommand::Dirs, paths).await
    }

    /// `fstat -Ol <paths>`: per-revision stats, including `fileSize` and
    /// `digest`.
    pub async fn fstat(&self, paths: &[&str]) -> Result<Vec<Record>, P4Error> {
        let mut args = vec!["-Ol"];
        args.extend_from_slice(paths);
        self.run_marshaled(MarshaledCommand::Fstat, &args).await
    }

    /// `changes <args>`: submitted changelist metadata.
    pub async fn changes(&self, args: &[&str]) -> Result<Vec<Record>, P4Error> {
        self.run_marshaled(MarshaledCommand::Changes, args).await
    }

    /// `print <identity>`: the raw bytes of one file revision.
    ///
    /// The client prepends a one-line banner which is stripped here; the
    /// payload is everything after the first newline.
    pub async fn print(&self, identity: &str) -> Result<Vec<u8>, P4Error> {
        let out = self.output(&["print", identity]).await?;
        if !out.status.success() {
            return Err(P4Error::ClientExit {
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        let banner_end = out
            .stdout
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(P4Error::Protocol("print output has no banner line"))?;
        Ok(out.stdout[banner_end + 1..].to_vec())
    }
}

fn interpret(value: Value, command: MarshaledCommand) -> Result<Record, P4Error> {
    let Value::Dict(map) = value else {
        return Err(P4Error::Protocol("top-level value is not a mapping"));
    };

    if map.get("code").and_then(Value::as_str) == Some("error") {
        return Ok(Record::Error(ClientError {
            severity: map.get("severity").and_then(Value::as_int).unwrap_or(0),
            generic: map.get("generic").and_then(Value::as_int).unwrap_or(0),
            data: str_field(&map, "data"),
        }));
    }

    Ok(match command {
        MarshaledCommand::Dirs => Record::Dir(Dir {
            dir: str_field(&map, "dir"),
        }),
        MarshaledCommand::Fstat => Record::Stat(Stat {
            depot_file: str_field(&map, "depotFile"),
            head_action: str_field(&map, "headAction"),
            head_type: str_field(&map, "headType"),
            head_time: int_field(&map, "headTime"),
            head_rev: int_field(&map, "headRev"),
            head_change: int_field(&map, "headChange"),
            head_mod_time: int_field(&map, "headModTime"),
            file_size: int_field(&map, "fileSize"),
            digest: str_field(&map, "digest"),
        }),
        MarshaledCommand::Changes => Record::Change(Change {
            change: int_field(&map, "change"),
            desc: str_field(&map, "desc"),
            user: str_field(&map, "user"),
            status: str_field(&map, "status"),
            time: int_field(&map, "time"),
            path: str_field(&map, "path"),
            code: str_field(&map, "code"),
            change_type: str_field(&map, "changeType"),
            client: str_field(&map, "client"),
        }),
    })
}

/// Missing keys read as empty; the client omits fields freely.
fn str_field(map: &HashMap<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Integers arrive as decimal strings; unparseable values read as zero.
fn int_field(map: &HashMap<String, Value>, key: &str) -> i64 {
    map.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, Value)]) -> Value {
        Value::Dict(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn interpret_error_record() {
        let value = dict(&[
            ("code", Value::Str("error".to_owned())),
            ("severity", Value::Int(3)),
            ("generic", Value::Int(17)),
            ("data", Value::Str("no such file(s).".to_owned())),
        ]);
        let record = interpret(value, MarshaledCommand::Fstat).unwrap();
        assert_eq!(
            record,
            Record::Error(ClientError {
                severity: 3,
                generic: 17,
                data: "no such file(s).".to_owned(),
            })
        );
    }

    #[test]
    fn interpret_stat_parses_decimal_integers() {
        let value = dict(&[
            ("code", Value::Str("stat".to_owned())),
            ("depotFile", Value::Str("//depot/README".to_owned())),
            ("headAction", Value::Str("edit".to_owned())),
            ("headType", Value::Str("text".to_owned())),
            ("headRev", Value::Str("3".to_owned())),
            ("headChange", Value::Str("700".to_owned())),
            ("headTime", Value::Str("1700000000".to_owned())),
            ("fileSize", Value::Str("12".to_owned())),
            ("digest", Value::Str("d41d8cd98f00b204e9800998ecf8427e".to_owned())),
        ]);
        let Record::Stat(stat) = interpret(value, MarshaledCommand::Fstat).unwrap() else {
            panic!("expected stat record");
        };
        assert_eq!(stat.head_rev, 3);
        assert_eq!(stat.head_change, 700);
        assert_eq!(stat.head_time, 1_700_000_000);
        assert_eq!(stat.file_size, 12);
        assert_eq!(stat.identity(), "//depot/README#3");
    }

    #[test]
    fn interpret_coerces_unparseable_integers_to_zero() {
        let value = dict(&[
            ("code", Value::Str("stat".to_owned())),
            ("depotFile", Value::Str("//depot/x".to_owned())),
            ("headRev", Value::Str("not-a-number".to_owned())),
            ("fileSize", Value::None),
        ]);
        let Record::Stat(stat) = interpret(value, MarshaledCommand::Fstat).unwrap() else {
            panic!("expected stat record");
        };
        assert_eq!(stat.head_rev, 0);
        assert_eq!(stat.file_size, 0);
        assert_eq!(stat.head_action, "");
    }

    #[test]
    fn interpret_dir_record() {
        let value = dict(&[
            ("code", Value::Str("stat".to_owned())),
            ("dir", Value::Str("//depot/src".to_owned())),
        ]);
        assert_eq!(
            interpret(value, MarshaledCommand::Dirs).unwrap(),
            Record::Dir(Dir {
                dir: "//depot/src".to_owned()
            })
        );
    }

    #[test]
    fn interpret_change_record() {
        let value = dict(&[
            ("code", Value::Str("stat".to_owned())),
            ("change", Value::Str("700".to_owned())),
            ("user", Value::Str("alice".to_owned())),
            ("desc", Value::Str("fix the frobnicator".to_owned())),
            ("time", Value::Str("1700000000".to_owned())),
            ("status", Value::Str("submitted".to_owned())),
        ]);
        let Record::Change(change) = interpret(value, MarshaledCommand::Changes).unwrap() else {
            panic!("expected change record");
        };
        assert_eq!(change.change, 700);
        assert_eq!(change.user, "alice");
        assert_eq!(change.time, 1_700_000_000);
        assert_eq!(
            change.to_string(),
            "change 700 by alice - fix the frobnicator"
        );
    }

    #[test]
    fn interpret_rejects_non_mapping() {
        let err = interpret(Value::Int(1), MarshaledCommand::Dirs).unwrap_err();
        assert!(matches!(err, P4Error::Protocol(_)));
    }
}
